use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("credentials unavailable: {0}")]
    Auth(String),
    #[error("bigquery request failed: {0}")]
    Request(String),
    #[error("bigquery api error {code} {status}: {message}")]
    Api {
        code: u16,
        status: String,
        message: String,
    },
    #[error("bigquery response invalid: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("max iterations reached ({max_iterations})")]
    MaxIterationsReached { max_iterations: u32 },
    #[error("agent stream ended without final response")]
    MissingFinalResponse,
    #[error("agent configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({message})")]
    InvalidValue {
        key: &'static str,
        value: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("agents directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("no agent packages found under {}", .0.display())]
    NoAgents(PathBuf),
    #[error("invalid agent manifest {}: {message}", .path.display())]
    InvalidManifest { path: PathBuf, message: String },
    #[error("agent '{0}' is not published by any package in the agents directory")]
    UnknownAgent(String),
    #[error("invalid agents directory pattern: {0}")]
    Pattern(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session already exists: {0}")]
    SessionExists(String),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

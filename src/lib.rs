//! A BigQuery data agent.
//!
//! - `Agent` tool-calling loop driven by a `ChatModel`, one per session
//! - BigQuery toolset (`execute_sql`, dataset and table metadata) behind the `Warehouse` trait
//! - Gemini adapter via `GeminiModel` (API key or Vertex AI)
//! - ADK-style web API and A2A JSON-RPC front ends in `server`

pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod llm;
pub mod prompts;
pub mod server;
pub mod telemetry;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentDefinition, AgentEvent, root_agent};
pub use config::Settings;
pub use error::{
    AgentError, ConfigError, ProviderError, RunError, SchemaError, ServerError, ToolError,
    WarehouseError,
};
pub use llm::{
    ChatModel, GeminiAuth, GeminiModel, GeminiModelConfig, ModelCompletion, ModelMessage,
    ModelToolCall, ModelToolChoice, ModelToolDefinition,
};
pub use prompts::build_instructions;
pub use server::{AgentRuntime, build_a2a_app, build_web_app};
pub use tools::bigquery::{BigQueryToolConfig, WriteMode, build_tool, build_tool_config};
pub use tools::{ToolHandle, ToolSpec, Toolset};

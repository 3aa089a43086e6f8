//! Process configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::tools::bigquery::WriteMode;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_AGENTS_DIR: &str = "agents";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Compute/billing project, `GOOGLE_CLOUD_PROJECT`.
    pub project_id: Option<String>,
    /// Default dataset, `BQ_DATASET_ID`.
    pub dataset_id: Option<String>,
    /// Model id, `BIGQUERY_AGENT_MODEL`.
    pub model: String,
    pub port: u16,
    pub agents_dir: PathBuf,
    pub google_api_key: Option<String>,
    pub use_vertex_ai: bool,
    pub location: Option<String>,
    pub bq_location: Option<String>,
    pub write_mode: WriteMode,
    pub a2a_public_url: Option<String>,
    pub access_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_id: None,
            dataset_id: None,
            model: DEFAULT_MODEL.to_string(),
            port: DEFAULT_PORT,
            agents_dir: PathBuf::from(DEFAULT_AGENTS_DIR),
            google_api_key: None,
            use_vertex_ai: false,
            location: None,
            bq_location: None,
            write_mode: WriteMode::default(),
            a2a_public_url: None,
            access_token: None,
        }
    }
}

impl Settings {
    /// Loads `.env` (if present) and then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let port = match get("PORT") {
            Some(raw) => parse_value("PORT", &raw)?,
            None => defaults.port,
        };

        let write_mode = match get("BQ_WRITE_MODE") {
            Some(raw) => parse_value("BQ_WRITE_MODE", &raw)?,
            None => defaults.write_mode,
        };

        let use_vertex_ai = get("GOOGLE_GENAI_USE_VERTEXAI")
            .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true"))
            .unwrap_or(false);

        Ok(Self {
            project_id: get("GOOGLE_CLOUD_PROJECT"),
            dataset_id: get("BQ_DATASET_ID"),
            model: get("BIGQUERY_AGENT_MODEL").unwrap_or(defaults.model),
            port,
            agents_dir: get("AGENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.agents_dir),
            google_api_key: get("GOOGLE_API_KEY").or_else(|| get("GEMINI_API_KEY")),
            use_vertex_ai,
            location: get("GOOGLE_CLOUD_LOCATION"),
            bq_location: get("BQ_LOCATION"),
            write_mode,
            a2a_public_url: get("A2A_PUBLIC_URL"),
            access_token: get("GOOGLE_OAUTH_ACCESS_TOKEN"),
        })
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            message: err.to_string(),
        })
}

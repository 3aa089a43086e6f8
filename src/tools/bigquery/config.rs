use std::fmt;
use std::str::FromStr;

/// What kinds of statements `execute_sql` will run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Only `SELECT` statements.
    #[default]
    Blocked,
    /// `SELECT`, plus writes to temporary tables of the toolset's own session.
    Protected,
    /// Anything BigQuery accepts.
    Allowed,
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "blocked" => Ok(Self::Blocked),
            "protected" => Ok(Self::Protected),
            "allowed" => Ok(Self::Allowed),
            other => Err(format!(
                "unknown write mode '{other}' (expected blocked, protected or allowed)"
            )),
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Blocked => "blocked",
            Self::Protected => "protected",
            Self::Allowed => "allowed",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BigQueryToolConfig {
    /// Project that runs (and is billed for) query jobs.
    pub compute_project_id: Option<String>,
    pub location: Option<String>,
    pub max_query_result_rows: u32,
    pub write_mode: WriteMode,
    /// Appended to the client user agent.
    pub application_name: Option<String>,
    pub timeout_ms: u32,
}

impl Default for BigQueryToolConfig {
    fn default() -> Self {
        Self {
            compute_project_id: None,
            location: None,
            max_query_result_rows: 50,
            write_mode: WriteMode::Blocked,
            application_name: None,
            timeout_ms: 30_000,
        }
    }
}

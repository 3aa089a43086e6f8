//! Finds agent packages in the agents directory.
//!
//! A package is a subdirectory holding an `agent.toml` manifest whose `name`
//! matches the directory name.

use std::path::{Path, PathBuf};

use glob::{Pattern, glob};
use serde::Deserialize;

use crate::error::ServerError;

pub const MANIFEST_FILE: &str = "agent.toml";

#[derive(Debug, Deserialize)]
struct AgentManifest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAgent {
    pub name: String,
    pub description: Option<String>,
    pub path: PathBuf,
}

pub fn discover_agents(dir: &Path) -> Result<Vec<DiscoveredAgent>, ServerError> {
    if !dir.is_dir() {
        return Err(ServerError::MissingDirectory(dir.to_path_buf()));
    }

    let root = Pattern::escape(&dir.to_string_lossy());
    let query = format!("{root}/*/{MANIFEST_FILE}");
    let entries = glob(&query).map_err(|err| ServerError::Pattern(err.to_string()))?;

    let mut agents = Vec::new();
    for manifest_path in entries.flatten() {
        let Some(package_dir) = manifest_path.parent() else {
            continue;
        };
        let dir_name = package_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let contents = std::fs::read_to_string(&manifest_path)?;
        let manifest: AgentManifest =
            toml::from_str(&contents).map_err(|err| ServerError::InvalidManifest {
                path: manifest_path.clone(),
                message: err.to_string(),
            })?;

        if manifest.name != dir_name {
            return Err(ServerError::InvalidManifest {
                path: manifest_path,
                message: format!(
                    "manifest name '{}' does not match directory '{dir_name}'",
                    manifest.name
                ),
            });
        }

        tracing::debug!(agent = %manifest.name, path = %package_dir.display(), "discovered agent package");
        agents.push(DiscoveredAgent {
            name: manifest.name,
            description: manifest.description,
            path: package_dir.to_path_buf(),
        });
    }

    if agents.is_empty() {
        return Err(ServerError::NoAgents(dir.to_path_buf()));
    }

    agents.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(agents)
}

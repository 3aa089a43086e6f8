//! The declarative agent record shared by both HTTP front ends.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::agent::Agent;
use crate::config::Settings;
use crate::error::AgentError;
use crate::llm::ChatModel;
use crate::prompts::build_instructions;
use crate::tools::ToolHandle;
use crate::tools::bigquery::build_tool;

pub const AGENT_NAME: &str = "sample_bigquery_adk_agent";
pub const AGENT_DESCRIPTION: &str =
    "Answers questions about BigQuery data by generating and running SQL.";

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

/// Model, name, instruction and tools of an agent. Immutable once built.
pub struct AgentDefinition {
    model: String,
    name: String,
    description: String,
    instruction: String,
    tools: Vec<ToolHandle>,
}

impl std::fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("model", &self.model)
            .field("name", &self.name)
            .field(
                "tools",
                &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl AgentDefinition {
    pub fn new(
        model: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        instruction: impl Into<String>,
        tools: Vec<ToolHandle>,
    ) -> Result<Self, AgentError> {
        let name = name.into();
        if !IDENTIFIER.is_match(&name) {
            return Err(AgentError::Config(format!(
                "agent name '{name}' must be a valid identifier"
            )));
        }

        Ok(Self {
            model: model.into(),
            name,
            description: description.into(),
            instruction: instruction.into(),
            tools,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn tools(&self) -> &[ToolHandle] {
        &self.tools
    }

    /// Starts a fresh conversation driven by `model`.
    pub fn instantiate(&self, model: Arc<dyn ChatModel>) -> Result<Agent, AgentError> {
        Agent::builder()
            .shared_model(model)
            .system_prompt(self.instruction.clone())
            .tools(self.tools.iter().flat_map(|toolset| toolset.tools()).collect())
            .build()
    }
}

/// The BigQuery agent served by both binaries.
pub fn root_agent(settings: &Settings) -> Result<AgentDefinition, AgentError> {
    let bigquery = build_tool(settings)?;

    AgentDefinition::new(
        settings.model.clone(),
        AGENT_NAME,
        AGENT_DESCRIPTION,
        build_instructions(settings),
        vec![bigquery],
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::ProviderError;
    use crate::llm::{ModelCompletion, ModelMessage, ModelToolChoice, ModelToolDefinition};
    use crate::tools::bigquery::BigQueryToolConfig;
    use crate::tools::{ToolSpec, Toolset};

    struct SilentModel;

    #[async_trait]
    impl ChatModel for SilentModel {
        async fn invoke(
            &self,
            _messages: &[ModelMessage],
            _tools: &[ModelToolDefinition],
            _tool_choice: ModelToolChoice,
        ) -> Result<ModelCompletion, ProviderError> {
            Ok(ModelCompletion::default())
        }
    }

    struct Pair;

    impl Toolset for Pair {
        fn name(&self) -> &str {
            "pair"
        }

        fn tools(&self) -> Vec<ToolSpec> {
            vec![ToolSpec::new("a", "a"), ToolSpec::new("b", "b")]
        }
    }

    fn settings(model: Option<&str>) -> Settings {
        Settings {
            project_id: Some("proj-x".to_string()),
            dataset_id: Some("sales_ds".to_string()),
            model: model.unwrap_or(crate::config::DEFAULT_MODEL).to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn root_agent_uses_default_model_and_single_bigquery_toolset() {
        let agent = root_agent(&settings(None)).expect("agent builds");

        assert_eq!(agent.model(), "gemini-2.5-flash");
        assert_eq!(agent.name(), AGENT_NAME);
        assert!(agent.instruction().contains("proj-x"));
        assert!(agent.instruction().contains("sales_ds"));
        assert_eq!(agent.tools().len(), 1);
        assert_eq!(agent.tools()[0].name(), "bigquery");
    }

    #[test]
    fn root_agent_honors_model_override() {
        let agent = root_agent(&settings(Some("gemini-2.5-pro"))).expect("agent builds");
        assert_eq!(agent.model(), "gemini-2.5-pro");
    }

    #[test]
    fn definition_holds_the_given_tool_handle() {
        let handle: ToolHandle = Arc::new(crate::tools::bigquery::BigQueryToolset::new(
            BigQueryToolConfig::default(),
            reqwest::Client::new(),
            Arc::new(crate::auth::StaticToken::new("tok")),
        ));

        let agent = AgentDefinition::new("m", "sql_agent", "", "do sql", vec![handle.clone()])
            .expect("agent builds");

        assert_eq!(agent.tools().len(), 1);
        assert!(Arc::ptr_eq(&agent.tools()[0], &handle));
    }

    #[test]
    fn invalid_names_are_rejected() {
        for name in ["", "1agent", "my-agent", "has space"] {
            let err = AgentDefinition::new("m", name, "", "", Vec::new())
                .expect_err("name must be an identifier");
            assert!(matches!(err, AgentError::Config(_)));
        }
    }

    #[test]
    fn instantiate_expands_toolsets() {
        let definition =
            AgentDefinition::new("m", "pairs", "", "be brief", vec![Arc::new(Pair) as ToolHandle])
                .expect("agent builds");

        let agent = definition
            .instantiate(Arc::new(SilentModel))
            .expect("session agent builds");

        assert_eq!(agent.tool_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}

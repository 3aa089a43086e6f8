pub mod definition;

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;

use crate::error::AgentError;
use crate::llm::{ChatModel, ModelMessage, ModelToolCall, ModelToolChoice, ModelToolDefinition};
use crate::tools::ToolSpec;

pub use definition::{AGENT_DESCRIPTION, AGENT_NAME, AgentDefinition, root_agent};

pub const DEFAULT_MAX_ITERATIONS: u32 = 24;

/// What happened during a turn, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: serde_json::Value,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    FinalResponse {
        content: String,
    },
}

pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    tools: Vec<ToolSpec>,
    system_prompt: Option<String>,
    max_iterations: u32,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            model: None,
            tools: Vec::new(),
            system_prompt: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl AgentBuilder {
    pub fn model<M>(self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.shared_model(Arc::new(model))
    }

    /// Uses a model client that is shared with other sessions.
    pub fn shared_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        let mut tools = HashMap::with_capacity(self.tools.len());
        let mut definitions = Vec::with_capacity(self.tools.len());
        for tool in self.tools {
            definitions.push(ModelToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.json_schema().clone(),
            });
            let name = tool.name().to_string();
            if tools.insert(name.clone(), tool).is_some() {
                return Err(AgentError::Config(format!(
                    "duplicate tool registered: {name}"
                )));
            }
        }

        Ok(Agent {
            model,
            tools,
            definitions,
            system_prompt: self.system_prompt,
            max_iterations: self.max_iterations,
            history: Vec::new(),
        })
    }
}

/// One session's conversation with the model.
///
/// `history` only ever holds complete turns: every assistant tool call is
/// followed by its result.
pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: HashMap<String, ToolSpec>,
    definitions: Vec<ModelToolDefinition>,
    system_prompt: Option<String>,
    max_iterations: u32,
    history: Vec<ModelMessage>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Tool names in registration order.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|definition| definition.name.as_str())
    }

    pub async fn query(&mut self, user_message: impl Into<String>) -> Result<String, AgentError> {
        let stream = self.query_stream(user_message);
        futures_util::pin_mut!(stream);

        let mut final_response = None;
        while let Some(event) = stream.next().await {
            if let AgentEvent::FinalResponse { content } = event? {
                final_response = Some(content);
            }
        }

        final_response.ok_or(AgentError::MissingFinalResponse)
    }

    /// Runs one turn and streams its events.
    ///
    /// The turn works on a copy of the history that replaces it only when the
    /// final response is reached. A turn that fails, or whose stream is dropped
    /// early, leaves the history as it was.
    pub fn query_stream(
        &mut self,
        user_message: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + Send + '_ {
        let user_message = user_message.into();

        try_stream! {
            let mut transcript = self.history.clone();
            if transcript.is_empty() {
                if let Some(system_prompt) = &self.system_prompt {
                    transcript.push(ModelMessage::System(system_prompt.clone()));
                }
            }
            transcript.push(ModelMessage::User(user_message));

            let tool_choice = if self.definitions.is_empty() {
                ModelToolChoice::None
            } else {
                ModelToolChoice::Auto
            };

            for _ in 0..self.max_iterations {
                let completion = self
                    .model
                    .invoke(&transcript, &self.definitions, tool_choice)
                    .await?;

                if let Some(thinking) = completion.thinking {
                    yield AgentEvent::Thinking { content: thinking };
                }

                transcript.push(ModelMessage::Assistant {
                    content: completion.text.clone(),
                    tool_calls: completion.tool_calls.clone(),
                });

                let text = completion.text.unwrap_or_default();
                if !text.is_empty() {
                    yield AgentEvent::Text { content: text.clone() };
                }

                if completion.tool_calls.is_empty() {
                    self.history = transcript;
                    yield AgentEvent::FinalResponse { content: text };
                    return;
                }

                for tool_call in completion.tool_calls {
                    yield AgentEvent::ToolCall {
                        tool: tool_call.name.clone(),
                        args_json: tool_call.arguments.clone(),
                        tool_call_id: tool_call.id.clone(),
                    };

                    let (result_text, is_error) = self.execute_tool_call(&tool_call).await;
                    transcript.push(ModelMessage::ToolResult {
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_call.name.clone(),
                        content: result_text.clone(),
                        is_error,
                    });

                    yield AgentEvent::ToolResult {
                        tool: tool_call.name,
                        result_text,
                        tool_call_id: tool_call.id,
                        is_error,
                    };
                }
            }

            Err::<(), AgentError>(AgentError::MaxIterationsReached {
                max_iterations: self.max_iterations,
            })?;
        }
    }

    /// Result text for the model, and whether it reports a failure.
    async fn execute_tool_call(&self, tool_call: &ModelToolCall) -> (String, bool) {
        let Some(tool) = self.tools.get(&tool_call.name) else {
            tracing::warn!(tool = %tool_call.name, "model called an unknown tool");
            return (format!("Unknown tool '{}'.", tool_call.name), true);
        };

        tracing::debug!(tool = %tool_call.name, id = %tool_call.id, "executing tool call");
        match tool.execute(tool_call.arguments.clone()).await {
            Ok(text) => (text, false),
            Err(err) => {
                tracing::warn!(tool = %tool_call.name, error = %err, "tool call failed");
                (err.to_string(), true)
            }
        }
    }
}

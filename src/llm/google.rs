use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::auth::{TokenProvider, default_token_provider};
use crate::config::Settings;
use crate::error::ProviderError;
use crate::llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice, ModelToolDefinition,
    ModelUsage,
};

const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_VERTEX_LOCATION: &str = "us-central1";

/// How requests to Gemini are authenticated.
#[derive(Clone)]
pub enum GeminiAuth {
    /// Gemini Developer API key (`x-goog-api-key`).
    ApiKey(String),
    /// Vertex AI with an OAuth bearer token.
    Vertex {
        project_id: String,
        location: String,
        tokens: Arc<dyn TokenProvider>,
    },
}

impl std::fmt::Debug for GeminiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(..)"),
            Self::Vertex {
                project_id,
                location,
                ..
            } => f
                .debug_struct("Vertex")
                .field("project_id", project_id)
                .field("location", location)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiModelConfig {
    pub auth: GeminiAuth,
    pub model: String,
    pub api_base_url: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub thinking_budget_tokens: Option<u32>,
    pub include_thoughts: Option<bool>,
}

impl GeminiModelConfig {
    pub fn new(auth: GeminiAuth, model: impl Into<String>) -> Self {
        Self {
            auth,
            model: model.into(),
            api_base_url: None,
            temperature: None,
            top_p: None,
            max_output_tokens: Some(4096),
            thinking_budget_tokens: None,
            include_thoughts: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiModel {
    client: Client,
    config: GeminiModelConfig,
}

impl GeminiModel {
    pub fn new(config: GeminiModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Client for `model`. Picks Vertex AI when `GOOGLE_GENAI_USE_VERTEXAI` is set,
    /// the API key otherwise.
    pub fn from_settings(settings: &Settings, model: &str) -> Result<Self, ProviderError> {
        let auth = if settings.use_vertex_ai {
            let project_id = settings.project_id.clone().ok_or_else(|| {
                ProviderError::Request(
                    "GOOGLE_CLOUD_PROJECT must be set when GOOGLE_GENAI_USE_VERTEXAI is enabled"
                        .to_string(),
                )
            })?;
            GeminiAuth::Vertex {
                project_id,
                location: settings
                    .location
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VERTEX_LOCATION.to_string()),
                tokens: default_token_provider(settings, Client::new()),
            }
        } else {
            let api_key = settings.google_api_key.clone().ok_or_else(|| {
                ProviderError::Request("GOOGLE_API_KEY (or GEMINI_API_KEY) is not set".to_string())
            })?;
            GeminiAuth::ApiKey(api_key)
        };

        Self::new(GeminiModelConfig::new(auth, model))
    }

    fn endpoint(&self) -> String {
        let model = &self.config.model;
        match (&self.config.api_base_url, &self.config.auth) {
            (Some(base), _) => {
                format!(
                    "{}/models/{model}:generateContent",
                    base.trim_end_matches('/')
                )
            }
            (None, GeminiAuth::ApiKey(_)) => {
                format!("{GEMINI_API_BASE_URL}/models/{model}:generateContent")
            }
            (
                None,
                GeminiAuth::Vertex {
                    project_id,
                    location,
                    ..
                },
            ) => format!(
                "https://{location}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{location}/publishers/google/models/{model}:generateContent"
            ),
        }
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, ProviderError> {
        match &self.config.auth {
            GeminiAuth::ApiKey(key) => Ok(request.header("x-goog-api-key", key)),
            GeminiAuth::Vertex { tokens, .. } => {
                let token = tokens
                    .access_token()
                    .await
                    .map_err(|err| ProviderError::Request(err.to_string()))?;
                Ok(request.bearer_auth(token))
            }
        }
    }
}

#[async_trait]
impl ChatModel for GeminiModel {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        let request = build_request(messages, tools, tool_choice, &self.config);

        let response = self
            .authorize(self.client.post(self.endpoint()))
            .await?
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let message = extract_api_error(response).await;
            tracing::warn!(model = %self.config.model, error = %message, "gemini request failed");
            return Err(ProviderError::Request(message));
        }

        let payload = response
            .json::<GenerateContentResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))?;

        let completion = normalize_response(payload)?;
        if let Some(usage) = &completion.usage {
            tracing::debug!(
                model = %self.config.model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                tool_calls = completion.tool_calls.len(),
                "gemini completion"
            );
        }
        Ok(completion)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<FunctionTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct Content {
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionCallingConfig {
    mode: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_thoughts: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: Option<String>,
    args: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    thoughts_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<u16>,
    status: Option<String>,
    message: Option<String>,
}

fn build_request(
    messages: &[ModelMessage],
    tools: &[ModelToolDefinition],
    tool_choice: ModelToolChoice,
    config: &GeminiModelConfig,
) -> GenerateContentRequest {
    let (contents, system_text) = to_contents(messages);

    let (tools_payload, tool_config) = if tools.is_empty() {
        (None, None)
    } else {
        let declarations = tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: clean_schema(tool.parameters.clone()),
            })
            .collect();

        let mode = match tool_choice {
            ModelToolChoice::Auto => "AUTO",
            ModelToolChoice::None => "NONE",
        };

        (
            Some(vec![FunctionTool {
                function_declarations: declarations,
            }]),
            Some(ToolConfig {
                function_calling_config: FunctionCallingConfig { mode },
            }),
        )
    };

    GenerateContentRequest {
        contents,
        system_instruction: system_text.map(|text| SystemInstruction {
            parts: vec![Part::text(text)],
        }),
        tools: tools_payload,
        tool_config,
        generation_config: Some(GenerationConfig {
            temperature: config.temperature,
            top_p: config.top_p,
            max_output_tokens: config.max_output_tokens,
            thinking_config: config
                .thinking_budget_tokens
                .map(|thinking_budget| ThinkingConfig {
                    thinking_budget,
                    include_thoughts: config.include_thoughts,
                }),
        }),
    }
}

/// Splits history into Gemini contents and the joined system instruction.
fn to_contents(messages: &[ModelMessage]) -> (Vec<Content>, Option<String>) {
    let mut system_lines = Vec::new();
    let mut contents = Vec::new();

    for message in messages {
        match message {
            ModelMessage::System(text) if !text.is_empty() => system_lines.push(text.clone()),
            ModelMessage::System(_) => {}
            ModelMessage::User(text) if !text.is_empty() => contents.push(Content {
                role: "user".to_string(),
                parts: vec![Part::text(text.clone())],
            }),
            ModelMessage::User(_) => {}
            ModelMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut parts = content
                    .iter()
                    .filter(|text| !text.is_empty())
                    .map(|text| Part::text(text.clone()))
                    .collect::<Vec<_>>();

                parts.extend(tool_calls.iter().map(|call| Part {
                    function_call: Some(FunctionCall {
                        id: Some(call.id.clone()),
                        name: Some(call.name.clone()),
                        args: Some(call.arguments.clone()),
                    }),
                    ..Part::default()
                }));

                if !parts.is_empty() {
                    contents.push(Content {
                        role: "model".to_string(),
                        parts,
                    });
                }
            }
            ModelMessage::ToolResult {
                tool_name,
                content,
                is_error,
                ..
            } => contents.push(Content {
                role: "user".to_string(),
                parts: vec![Part {
                    function_response: Some(FunctionResponse {
                        name: tool_name.clone(),
                        response: tool_result_payload(content, *is_error),
                    }),
                    ..Part::default()
                }],
            }),
        }
    }

    let system = (!system_lines.is_empty()).then(|| system_lines.join("\n\n"));
    (contents, system)
}

fn tool_result_payload(content: &str, is_error: bool) -> Value {
    if is_error {
        return json!({"error": content});
    }

    match serde_json::from_str::<Value>(content) {
        Ok(parsed @ Value::Object(_)) => parsed,
        Ok(other) => json!({"result": other}),
        Err(_) => json!({"result": content}),
    }
}

fn normalize_response(response: GenerateContentResponse) -> Result<ModelCompletion, ProviderError> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(ProviderError::Response(
            "gemini response missing candidates".to_string(),
        ));
    };

    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();

    let parts = candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default();

    if parts.is_empty()
        && let Some(reason) = candidate
            .finish_reason
            .filter(|reason| reason.as_str() != "STOP")
    {
        return Err(ProviderError::Response(format!(
            "gemini returned no content (finishReason={reason})"
        )));
    }

    for (index, part) in parts.into_iter().enumerate() {
        if let Some(text) = part.text {
            if part.thought.unwrap_or(false) {
                thinking_parts.push(text);
            } else {
                text_parts.push(text);
            }
        }

        if let Some(call) = part.function_call {
            let Some(name) = call.name else {
                return Err(ProviderError::Response(
                    "gemini functionCall missing name".to_string(),
                ));
            };

            tool_calls.push(ModelToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", index + 1)),
                name,
                arguments: call.args.unwrap_or_else(|| json!({})),
            });
        }
    }

    let usage = response.usage_metadata.map(|usage| ModelUsage {
        input_tokens: usage.prompt_token_count.unwrap_or(0),
        output_tokens: usage
            .candidates_token_count
            .unwrap_or(0)
            .saturating_add(usage.thoughts_token_count.unwrap_or(0)),
    });

    Ok(ModelCompletion {
        text: (!text_parts.is_empty()).then(|| text_parts.join("\n")),
        thinking: (!thinking_parts.is_empty()).then(|| thinking_parts.join("\n")),
        tool_calls,
        usage,
    })
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let code = parsed.error.code.unwrap_or(status.as_u16());
        let status_name = parsed
            .error
            .status
            .unwrap_or_else(|| status.to_string().to_uppercase());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown gemini api error".to_string());
        return format!("gemini api error {code} {status_name}: {message}");
    }

    if body.is_empty() {
        format!("gemini api request failed ({status})")
    } else {
        format!("gemini api request failed ({status}): {body}")
    }
}

/// Rewrites a JSON schema into the OpenAPI subset Gemini accepts.
fn clean_schema(schema: Value) -> Value {
    let mut root = schema;
    let defs = match &mut root {
        Value::Object(map) => match map.remove("$defs") {
            Some(Value::Object(defs)) => defs,
            _ => Map::new(),
        },
        _ => Map::new(),
    };

    clean_node(inline_refs(root, &defs), None)
}

fn inline_refs(value: Value, defs: &Map<String, Value>) -> Value {
    match value {
        Value::Object(map) => {
            let target = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|reference| reference.rsplit('/').next())
                .and_then(|name| defs.get(name))
                .cloned();

            if let Some(Value::Object(mut resolved)) = target {
                for (key, value) in map {
                    if key != "$ref" {
                        resolved.insert(key, value);
                    }
                }
                return inline_refs(Value::Object(resolved), defs);
            }

            Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, inline_refs(value, defs)))
                    .collect(),
            )
        }
        Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(|value| inline_refs(value, defs))
                .collect(),
        ),
        other => other,
    }
}

fn clean_node(value: Value, parent_key: Option<&str>) -> Value {
    match value {
        Value::Object(map) => {
            let mut cleaned = Map::new();

            for (key, value) in map {
                let is_metadata_title = key == "title" && parent_key != Some("properties");
                if key == "additionalProperties" || key == "default" || is_metadata_title {
                    continue;
                }
                let child = clean_node(value, Some(&key));
                cleaned.insert(key, child);
            }

            let is_object = cleaned
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.eq_ignore_ascii_case("object"));
            let has_empty_properties = cleaned
                .get("properties")
                .and_then(Value::as_object)
                .is_some_and(Map::is_empty);

            // Gemini rejects object schemas with an empty properties map.
            if is_object && has_empty_properties {
                cleaned.insert(
                    "properties".to_string(),
                    json!({"_placeholder": {"type": "string"}}),
                );
            }

            Value::Object(cleaned)
        }
        Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(|value| clean_node(value, parent_key))
                .collect(),
        ),
        other => other,
    }
}

//! A2A protocol front end: JSON-RPC 2.0 over HTTP plus the agent card.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::{AgentDefinition, AgentEvent};
use crate::server::runtime::{AgentRuntime, final_text};

pub const PROTOCOL_VERSION: &str = "0.3.0";
pub const AGENT_CARD_PATH: &str = "/.well-known/agent-card.json";

/// Sessions opened through A2A all belong to this user.
pub const A2A_USER_ID: &str = "a2a_user";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const TASK_NOT_FOUND: i64 = -32001;
pub const TASK_NOT_CANCELABLE: i64 = -32002;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub protocol_version: String,
    pub preferred_transport: String,
    pub capabilities: AgentCapabilities,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
    pub skills: Vec<AgentSkill>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
    pub state_transition_history: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl AgentCard {
    pub fn for_definition(definition: &AgentDefinition, url: impl Into<String>) -> Self {
        let mut skills = vec![AgentSkill {
            id: definition.name().to_string(),
            name: "model".to_string(),
            description: format!(
                "{} Runs on {}.",
                definition.description(),
                definition.model()
            ),
            tags: vec!["llm".to_string()],
        }];
        for toolset in definition.tools() {
            for tool in toolset.tools() {
                skills.push(AgentSkill {
                    id: format!("{}-{}", definition.name(), tool.name()),
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    tags: vec!["llm".to_string(), "tools".to_string(), toolset.name().to_string()],
                });
            }
        }

        Self {
            name: definition.name().to_string(),
            description: definition.description().to_string(),
            url: url.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            preferred_transport: "JSONRPC".to_string(),
            capabilities: AgentCapabilities {
                streaming: true,
                push_notifications: false,
                state_transition_history: false,
            },
            default_input_modes: vec!["text/plain".to_string()],
            default_output_modes: vec!["text/plain".to_string()],
            skills,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    Data { data: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default = "message_kind")]
    pub kind: String,
}

fn message_kind() -> String {
    "message".to_string()
}

impl Message {
    fn agent_text(text: impl Into<String>, context_id: &str, task_id: &str) -> Self {
        Self {
            role: Role::Agent,
            parts: vec![Part::Text { text: text.into() }],
            message_id: uuid::Uuid::new_v4().to_string(),
            context_id: Some(context_id.to_string()),
            task_id: Some(task_id.to_string()),
            kind: message_kind(),
        }
    }

    fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                Part::Data { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
    Rejected,
    AuthRequired,
    Unknown,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Canceled | TaskState::Failed | TaskState::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    pub timestamp: String,
}

impl TaskStatus {
    fn new(state: TaskState, message: Option<Message>) -> Self {
        Self {
            state,
            message,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub parts: Vec<Part>,
}

impl Artifact {
    fn response(text: impl Into<String>) -> Self {
        Self {
            artifact_id: uuid::Uuid::new_v4().to_string(),
            name: Some("response".to_string()),
            parts: vec![Part::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub context_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub history: Vec<Message>,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdateEvent {
    pub task_id: String,
    pub context_id: String,
    pub status: TaskStatus,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifactUpdateEvent {
    pub task_id: String,
    pub context_id: String,
    pub artifact: Artifact,
    pub append: bool,
    pub last_chunk: bool,
    pub kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                jsonrpc: "2.0",
                id,
                result: Some(result),
                error: None,
            },
            Err(err) => Self::failure(id, JsonRpcError::new(INTERNAL_ERROR, err.to_string())),
        }
    }

    fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn task_not_found(id: &str) -> Self {
        Self::new(TASK_NOT_FOUND, format!("Task not found: {id}"))
    }
}

#[derive(Debug, Deserialize)]
struct MessageSendParams {
    message: Message,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskQueryParams {
    id: String,
    #[serde(default)]
    history_length: Option<usize>,
}

#[derive(Clone)]
struct A2aState {
    runtime: AgentRuntime,
    card: Arc<AgentCard>,
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl A2aState {
    fn new(runtime: AgentRuntime, url: impl Into<String>) -> Self {
        let card = AgentCard::for_definition(runtime.definition(), url);
        tracing::info!(agent = %card.name, url = %card.url, "publishing agent card");
        Self {
            runtime,
            card: Arc::new(card),
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn store(&self, task: &Task) {
        self.tasks.write().await.insert(task.id.clone(), task.clone());
    }

    /// Writes the task back unless it was canceled in the meantime.
    async fn finish(&self, task: Task) -> Task {
        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.get(&task.id)
            && existing.status.state == TaskState::Canceled
        {
            return existing.clone();
        }
        tasks.insert(task.id.clone(), task.clone());
        task
    }

    async fn is_canceled(&self, task_id: &str) -> bool {
        self.tasks
            .read()
            .await
            .get(task_id)
            .is_some_and(|task| task.status.state == TaskState::Canceled)
    }
}

/// Serves the agent over A2A, advertising `http://localhost:{port}/`.
pub fn build_a2a_app(runtime: AgentRuntime, port: u16) -> Router {
    build_a2a_app_with_url(runtime, format!("http://localhost:{port}/"))
}

pub fn build_a2a_app_with_url(runtime: AgentRuntime, url: impl Into<String>) -> Router {
    router(A2aState::new(runtime, url))
}

fn router(state: A2aState) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route(AGENT_CARD_PATH, get(agent_card))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn agent_card(State(state): State<A2aState>) -> Json<AgentCard> {
    Json(state.card.as_ref().clone())
}

async fn handle_rpc(State(state): State<A2aState>, body: Bytes) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => {
            return rpc_error(Value::Null, JsonRpcError::new(PARSE_ERROR, err.to_string()));
        }
    };
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(err) => return rpc_error(id, JsonRpcError::new(INVALID_REQUEST, err.to_string())),
    };
    if request.jsonrpc != "2.0" {
        return rpc_error(
            request.id,
            JsonRpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        );
    }

    tracing::debug!(method = %request.method, "a2a request");
    let id = request.id;
    let outcome = match request.method.as_str() {
        "message/send" => message_send(&state, request.params).await,
        "message/stream" => {
            return match message_stream(&state, id.clone(), request.params).await {
                Ok(response) => response,
                Err(error) => rpc_error(id, error),
            };
        }
        "tasks/get" => tasks_get(&state, request.params).await,
        "tasks/cancel" => tasks_cancel(&state, request.params).await,
        other => Err(JsonRpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    };

    match outcome {
        Ok(task) => Json(JsonRpcResponse::success(id, task)).into_response(),
        Err(error) => rpc_error(id, error),
    }
}

fn rpc_error(id: Value, error: JsonRpcError) -> Response {
    Json(JsonRpcResponse::failure(id, error)).into_response()
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(params).map_err(|err| JsonRpcError::new(INVALID_PARAMS, err.to_string()))
}

/// Validates the incoming message and registers a submitted task for it.
async fn submit(state: &A2aState, params: Value) -> Result<(Task, String), JsonRpcError> {
    let MessageSendParams { mut message } = parse_params(params)?;
    if message.role != Role::User {
        return Err(JsonRpcError::new(INVALID_PARAMS, "message role must be \"user\""));
    }
    let text = message.text();
    if text.trim().is_empty() {
        return Err(JsonRpcError::new(
            INVALID_PARAMS,
            "message must contain at least one text part",
        ));
    }

    let context_id = message
        .context_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let task_id = uuid::Uuid::new_v4().to_string();
    message.context_id = Some(context_id.clone());
    message.task_id = Some(task_id.clone());

    state
        .runtime
        .ensure_session(A2A_USER_ID, &context_id)
        .await
        .map_err(|err| JsonRpcError::new(INTERNAL_ERROR, err.to_string()))?;

    let task = Task {
        id: task_id,
        context_id,
        status: TaskStatus::new(TaskState::Submitted, None),
        artifacts: Vec::new(),
        history: vec![message],
        kind: "task".to_string(),
    };
    state.store(&task).await;
    tracing::info!(task = %task.id, context = %task.context_id, "a2a task submitted");
    Ok((task, text))
}

async fn message_send(state: &A2aState, params: Value) -> Result<Task, JsonRpcError> {
    let (mut task, text) = submit(state, params).await?;
    task.status = TaskStatus::new(TaskState::Working, None);
    state.store(&task).await;

    match state.runtime.run(A2A_USER_ID, &task.context_id, text).await {
        Ok(events) => {
            let answer = final_text(&events).unwrap_or_default().to_string();
            task.history
                .push(Message::agent_text(answer.clone(), &task.context_id, &task.id));
            task.artifacts.push(Artifact::response(answer));
            task.status = TaskStatus::new(TaskState::Completed, None);
            tracing::info!(task = %task.id, "a2a task completed");
        }
        Err(err) => {
            tracing::warn!(task = %task.id, error = %err, "a2a task failed");
            let message = Message::agent_text(err.to_string(), &task.context_id, &task.id);
            task.status = TaskStatus::new(TaskState::Failed, Some(message));
        }
    }

    Ok(state.finish(task).await)
}

async fn message_stream(
    state: &A2aState,
    id: Value,
    params: Value,
) -> Result<Response, JsonRpcError> {
    let (task, text) = submit(state, params).await?;
    let mut rx = state
        .runtime
        .run_stream(A2A_USER_ID, &task.context_id, text)
        .await
        .map_err(|err| JsonRpcError::new(INTERNAL_ERROR, err.to_string()))?;

    let state = state.clone();
    let stream = async_stream::stream! {
        let mut task = task;
        yield rpc_event(&id, &task);

        task.status = TaskStatus::new(TaskState::Working, None);
        state.store(&task).await;
        yield rpc_event(&id, &status_update(&task, false));

        let mut failure = None;
        let mut canceled = false;
        while let Some(item) = rx.recv().await {
            if state.is_canceled(&task.id).await {
                tracing::info!(task = %task.id, "a2a task canceled, stopping stream");
                canceled = true;
                break;
            }
            match item {
                Ok(AgentEvent::FinalResponse { content }) => {
                    let artifact = Artifact::response(content.clone());
                    task.history
                        .push(Message::agent_text(content, &task.context_id, &task.id));
                    task.artifacts.push(artifact.clone());
                    yield rpc_event(&id, &TaskArtifactUpdateEvent {
                        task_id: task.id.clone(),
                        context_id: task.context_id.clone(),
                        artifact,
                        append: false,
                        last_chunk: true,
                        kind: "artifact-update",
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    failure = Some(err.to_string());
                    break;
                }
            }
        }

        task.status = match failure {
            _ if canceled => TaskStatus::new(TaskState::Canceled, None),
            Some(error) => {
                tracing::warn!(task = %task.id, %error, "a2a task failed");
                let message = Message::agent_text(error, &task.context_id, &task.id);
                TaskStatus::new(TaskState::Failed, Some(message))
            }
            None => TaskStatus::new(TaskState::Completed, None),
        };
        let task = state.finish(task).await;
        tracing::info!(task = %task.id, state = ?task.status.state, "a2a stream finished");
        yield rpc_event(&id, &status_update(&task, true));
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn status_update(task: &Task, is_final: bool) -> TaskStatusUpdateEvent {
    TaskStatusUpdateEvent {
        task_id: task.id.clone(),
        context_id: task.context_id.clone(),
        status: task.status.clone(),
        is_final,
        kind: "status-update",
    }
}

fn rpc_event(id: &Value, result: &impl Serialize) -> Result<Event, Infallible> {
    let response = JsonRpcResponse::success(id.clone(), result);
    let data = serde_json::to_string(&response).unwrap_or_else(|err| {
        let error = json!({"code": INTERNAL_ERROR, "message": err.to_string()});
        json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string()
    });
    Ok(Event::default().data(data))
}

async fn tasks_get(state: &A2aState, params: Value) -> Result<Task, JsonRpcError> {
    let query: TaskQueryParams = parse_params(params)?;
    let mut task = state
        .tasks
        .read()
        .await
        .get(&query.id)
        .cloned()
        .ok_or_else(|| JsonRpcError::task_not_found(&query.id))?;

    if let Some(limit) = query.history_length
        && task.history.len() > limit
    {
        task.history.drain(..task.history.len() - limit);
    }
    Ok(task)
}

async fn tasks_cancel(state: &A2aState, params: Value) -> Result<Task, JsonRpcError> {
    let query: TaskQueryParams = parse_params(params)?;
    let mut tasks = state.tasks.write().await;
    let task = tasks
        .get_mut(&query.id)
        .ok_or_else(|| JsonRpcError::task_not_found(&query.id))?;

    if task.status.state.is_terminal() {
        return Err(JsonRpcError::new(
            TASK_NOT_CANCELABLE,
            format!("Task cannot be canceled: {}", query.id),
        ));
    }
    task.status = TaskStatus::new(TaskState::Canceled, None);
    tracing::info!(task = %task.id, "a2a task canceled");
    Ok(task.clone())
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::server::runtime::test_support::{gated_runtime, runtime};

    async fn rpc(app: &Router, body: String) -> Value {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn send_request(id: u64, text: &str, context_id: Option<&str>) -> String {
        let mut message = json!({
            "role": "user",
            "parts": [{"kind": "text", "text": text}],
            "messageId": format!("m{id}"),
            "kind": "message"
        });
        if let Some(context_id) = context_id {
            message["contextId"] = json!(context_id);
        }
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "message/send",
            "params": {"message": message}
        })
        .to_string()
    }

    fn task_request(id: u64, method: &str, task_id: &str) -> String {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": {"id": task_id}})
            .to_string()
    }

    /// Waits until a task reaches `working` and returns its id.
    async fn working_task(state: &A2aState) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let working = state
                    .tasks
                    .read()
                    .await
                    .values()
                    .find(|task| task.status.state == TaskState::Working)
                    .map(|task| task.id.clone());
                if let Some(task_id) = working {
                    return task_id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task starts working")
    }

    #[test]
    fn card_lists_model_and_tool_skills() {
        let definition = crate::agent::root_agent(&crate::config::Settings::default())
            .expect("agent builds");
        let card = AgentCard::for_definition(&definition, "http://localhost:9/");

        assert_eq!(card.name, crate::agent::AGENT_NAME);
        assert_eq!(card.protocol_version, "0.3.0");
        assert_eq!(card.skills.len(), 6);
        assert!(
            card.skills
                .iter()
                .any(|skill| skill.name == "execute_sql")
        );

        let value = serde_json::to_value(&card).expect("serializes");
        assert_eq!(value["preferredTransport"], "JSONRPC");
        assert_eq!(value["capabilities"]["streaming"], true);
    }

    #[tokio::test]
    async fn parse_and_request_errors_use_jsonrpc_codes() {
        let app = build_a2a_app(runtime(&[]), 8080);

        let value = rpc(&app, "{not json".to_string()).await;
        assert_eq!(value["error"]["code"], PARSE_ERROR);
        assert_eq!(value["id"], Value::Null);

        let value = rpc(&app, json!({"jsonrpc": "1.0", "id": 3, "method": "x"}).to_string()).await;
        assert_eq!(value["error"]["code"], INVALID_REQUEST);
        assert_eq!(value["id"], 3);

        let value = rpc(
            &app,
            json!({"jsonrpc": "2.0", "id": 4, "method": "message/send", "params": {}}).to_string(),
        )
        .await;
        assert_eq!(value["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn failed_runs_produce_failed_tasks() {
        let app = build_a2a_app(runtime(&[]), 8080);

        let value = rpc(&app, send_request(1, "hello", None)).await;
        assert_eq!(value["result"]["status"]["state"], "failed");
        assert!(
            value["result"]["status"]["message"]["parts"][0]["text"]
                .as_str()
                .expect("error text")
                .contains("script exhausted")
        );
    }

    #[tokio::test]
    async fn context_id_keeps_the_conversation() {
        let app = build_a2a_app(runtime(&["first", "second"]), 8080);

        let first = rpc(&app, send_request(1, "one", Some("ctx-1"))).await;
        let second = rpc(&app, send_request(2, "two", Some("ctx-1"))).await;

        assert_eq!(first["result"]["contextId"], "ctx-1");
        assert_eq!(second["result"]["contextId"], "ctx-1");
        assert_ne!(first["result"]["id"], second["result"]["id"]);
        assert_eq!(second["result"]["artifacts"][0]["parts"][0]["text"], "second");
    }

    #[tokio::test]
    async fn finished_tasks_cannot_be_canceled() {
        let app = build_a2a_app(runtime(&["done"]), 8080);

        let sent = rpc(&app, send_request(1, "hi", None)).await;
        let task_id = sent["result"]["id"].clone();

        let value = rpc(
            &app,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tasks/cancel", "params": {"id": task_id}})
                .to_string(),
        )
        .await;
        assert_eq!(value["error"]["code"], TASK_NOT_CANCELABLE);

        let params = json!({"id": task_id, "historyLength": 1});
        let request = json!({"jsonrpc": "2.0", "id": 3, "method": "tasks/get", "params": params});
        let value = rpc(&app, request.to_string()).await;
        assert_eq!(value["result"]["status"]["state"], "completed");
        assert_eq!(value["result"]["history"].as_array().map(Vec::len), Some(1));
        assert_eq!(value["result"]["history"][0]["role"], "agent");
    }

    #[tokio::test]
    async fn message_stream_emits_status_and_artifact_updates() {
        let app = build_a2a_app(runtime(&["streamed"]), 8080);
        let mut request: Value = serde_json::from_str(&send_request(7, "go", None)).expect("json");
        request["method"] = json!("message/stream");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let text = String::from_utf8_lossy(&bytes);

        let kinds = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| {
                let value: Value = serde_json::from_str(data).expect("event json");
                assert_eq!(value["id"], 7);
                value["result"]["kind"].as_str().unwrap_or_default().to_string()
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec!["task", "status-update", "artifact-update", "status-update"]
        );
        assert!(text.contains("\"final\":true"));
        assert!(text.contains("\"state\":\"completed\""));
    }

    #[tokio::test]
    async fn canceling_a_working_send_keeps_it_canceled() {
        let gate = Arc::new(Notify::new());
        let runtime = gated_runtime(gate.clone(), "too late");
        let state = A2aState::new(runtime, "http://localhost:8080/");
        let app = router(state.clone());

        let pending = tokio::spawn({
            let app = app.clone();
            async move { rpc(&app, send_request(1, "slow question", None)).await }
        });
        let task_id = working_task(&state).await;

        let canceled = rpc(&app, task_request(2, "tasks/cancel", &task_id)).await;
        assert_eq!(canceled["result"]["status"]["state"], "canceled");

        gate.notify_one();
        let sent = pending.await.expect("send completes");
        assert_eq!(sent["result"]["id"], task_id.as_str());
        assert_eq!(sent["result"]["status"]["state"], "canceled");
        assert_eq!(sent["result"]["artifacts"].as_array().map(Vec::len), Some(0));

        let fetched = rpc(&app, task_request(3, "tasks/get", &task_id)).await;
        assert_eq!(fetched["result"]["status"]["state"], "canceled");
    }

    #[tokio::test]
    async fn canceling_a_working_stream_ends_it_canceled() {
        let gate = Arc::new(Notify::new());
        let runtime = gated_runtime(gate.clone(), "too late");
        let state = A2aState::new(runtime, "http://localhost:8080/");
        let app = router(state.clone());
        let mut request: Value = serde_json::from_str(&send_request(8, "go", None)).expect("json");
        request["method"] = json!("message/stream");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let body = tokio::spawn(async move {
            to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body")
        });
        let task_id = working_task(&state).await;

        let canceled = rpc(&app, task_request(9, "tasks/cancel", &task_id)).await;
        assert_eq!(canceled["result"]["status"]["state"], "canceled");
        gate.notify_one();

        let bytes = body.await.expect("stream completes");
        let events = String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str::<Value>(data).expect("event json"))
            .collect::<Vec<_>>();
        let kinds = events
            .iter()
            .map(|event| event["result"]["kind"].as_str().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["task", "status-update", "status-update"]);

        let last = &events[events.len() - 1]["result"];
        assert_eq!(last["final"], true);
        assert_eq!(last["status"]["state"], "canceled");
    }
}

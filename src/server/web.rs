use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::AgentEvent;
use crate::error::{RunError, ServerError};
use crate::server::discovery::discover_agents;
use crate::server::runtime::{AgentRuntime, Session};

pub const APP_TITLE: &str = "Sample BigQuery ADK Agent";
pub const APP_DESCRIPTION: &str = "A sample ADK agent for BigQuery.";

const CONSOLE_TEMPLATE: &str = include_str!("console.html");

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::AppNotFound(_) | ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionExists(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (code, body).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::SessionNotFound(id) => ApiError::SessionNotFound(id),
            RunError::SessionExists(id) => ApiError::SessionExists(id),
            RunError::Agent(err) => ApiError::Internal(err.to_string()),
        }
    }
}

#[derive(Clone)]
struct WebState {
    runtime: AgentRuntime,
    console: Option<Arc<str>>,
}

impl WebState {
    fn check_app(&self, app_name: &str) -> Result<(), ApiError> {
        if app_name == self.runtime.app_name() {
            Ok(())
        } else {
            Err(ApiError::AppNotFound(app_name.to_string()))
        }
    }
}

/// Builds the ADK-style web API for the agent package in `agents_dir` that
/// matches `runtime`.
pub fn build_web_app(
    agents_dir: &Path,
    serve_console: bool,
    runtime: AgentRuntime,
) -> Result<Router, ServerError> {
    let served = runtime.app_name().to_string();
    let discovered = discover_agents(agents_dir)?;

    for package in discovered.iter().filter(|p| p.name != served) {
        tracing::warn!(
            agent = %package.name,
            "agent package has no compiled-in definition, skipping"
        );
    }
    let Some(package) = discovered.iter().find(|p| p.name == served) else {
        return Err(ServerError::UnknownAgent(served));
    };
    tracing::info!(agent = %package.name, path = %package.path.display(), "serving agent package");

    let console_page = serve_console.then(|| Arc::<str>::from(render_console(&served)));
    let state = WebState {
        runtime,
        console: console_page,
    };

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/openapi.json", get(openapi))
        .route("/list-apps", get(list_apps))
        .route(
            "/apps/:app/users/:user/sessions",
            post(create_session).get(list_sessions),
        )
        .route(
            "/apps/:app/users/:user/sessions/:id",
            get(get_session)
                .post(create_session_with_id)
                .delete(delete_session),
        )
        .route("/run", post(run))
        .route("/run_sse", post(run_sse));

    if serve_console {
        router = router
            .route("/", get(|| async { Redirect::temporary("/dev-ui") }))
            .route("/dev-ui", get(console));
    }

    Ok(router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn openapi() -> Json<Value> {
    Json(json!({
        "openapi": "3.1.0",
        "info": {
            "title": APP_TITLE,
            "description": APP_DESCRIPTION,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/health": {"get": {"summary": "Liveness check"}},
            "/list-apps": {"get": {"summary": "List served agents"}},
            "/apps/{app}/users/{user}/sessions": {
                "get": {"summary": "List sessions"},
                "post": {"summary": "Create a session"}
            },
            "/apps/{app}/users/{user}/sessions/{id}": {
                "get": {"summary": "Get a session"},
                "post": {"summary": "Create a session with a given id"},
                "delete": {"summary": "Delete a session"}
            },
            "/run": {"post": {"summary": "Run one agent turn"}},
            "/run_sse": {"post": {"summary": "Run one agent turn, streaming events"}}
        }
    }))
}

async fn list_apps(State(state): State<WebState>) -> Json<Vec<String>> {
    Json(vec![state.runtime.app_name().to_string()])
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    state: Map<String, Value>,
}

async fn create_session(
    State(state): State<WebState>,
    UrlPath((app, user)): UrlPath<(String, String)>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Json<Session>, ApiError> {
    state.check_app(&app)?;
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let session = state
        .runtime
        .create_session(&user, None, request.state)
        .await?;
    Ok(Json(session))
}

async fn create_session_with_id(
    State(state): State<WebState>,
    UrlPath((app, user, id)): UrlPath<(String, String, String)>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Json<Session>, ApiError> {
    state.check_app(&app)?;
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let session = state
        .runtime
        .create_session(&user, Some(id), request.state)
        .await?;
    Ok(Json(session))
}

async fn list_sessions(
    State(state): State<WebState>,
    UrlPath((app, user)): UrlPath<(String, String)>,
) -> Result<Json<Vec<Session>>, ApiError> {
    state.check_app(&app)?;
    Ok(Json(state.runtime.list_sessions(&user).await))
}

async fn get_session(
    State(state): State<WebState>,
    UrlPath((app, user, id)): UrlPath<(String, String, String)>,
) -> Result<Json<Session>, ApiError> {
    state.check_app(&app)?;
    state
        .runtime
        .get_session(&user, &id)
        .await
        .map(Json)
        .ok_or(ApiError::SessionNotFound(id))
}

async fn delete_session(
    State(state): State<WebState>,
    UrlPath((app, user, id)): UrlPath<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state.check_app(&app)?;
    if state.runtime.delete_session(&user, &id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    #[serde(alias = "appName")]
    app_name: String,
    #[serde(alias = "userId")]
    user_id: String,
    #[serde(alias = "sessionId")]
    session_id: String,
    #[serde(alias = "newMessage")]
    new_message: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    #[allow(dead_code)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

impl RunRequest {
    fn message_text(&self) -> Result<String, ApiError> {
        let text = self
            .new_message
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "new_message must contain at least one text part".to_string(),
            ));
        }
        Ok(text)
    }
}

async fn run(
    State(state): State<WebState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<Vec<AgentEvent>>, ApiError> {
    state.check_app(&request.app_name)?;
    let text = request.message_text()?;
    let events = state
        .runtime
        .run(&request.user_id, &request.session_id, text)
        .await?;
    Ok(Json(events))
}

async fn run_sse(
    State(state): State<WebState>,
    Json(request): Json<RunRequest>,
) -> Result<Response, ApiError> {
    state.check_app(&request.app_name)?;
    let text = request.message_text()?;
    let mut rx = state
        .runtime
        .run_stream(&request.user_id, &request.session_id, text)
        .await?;

    let stream = async_stream::stream! {
        while let Some(item) = rx.recv().await {
            match item {
                Ok(event) => yield sse_event(&event),
                Err(err) => {
                    tracing::warn!(error = %err, "streamed turn failed");
                    yield Ok::<Event, Infallible>(
                        Event::default()
                            .event("error")
                            .data(json!({ "error": err.to_string() }).to_string()),
                    );
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn sse_event(event: &AgentEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(event)
        .unwrap_or_else(|err| json!({ "error": err.to_string() }).to_string());
    Ok(Event::default().data(data))
}

async fn console(State(state): State<WebState>) -> Response {
    match state.console {
        Some(page) => Html(page.to_string()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn render_console(app_name: &str) -> String {
    CONSOLE_TEMPLATE
        .replace("{{TITLE}}", &escape_html(APP_TITLE))
        .replace("{{DESCRIPTION}}", &escape_html(APP_DESCRIPTION))
        .replace("{{APP_NAME}}", &escape_html(app_name))
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

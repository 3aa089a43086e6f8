use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::agent::{Agent, AgentDefinition, AgentEvent};
use crate::error::{AgentError, RunError};
use crate::llm::ChatModel;

/// Snapshot of a conversation as returned by the session endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub state: Map<String, Value>,
    pub events: Vec<AgentEvent>,
    pub last_update_time: f64,
}

struct SessionEntry {
    record: RwLock<Session>,
    agent: Mutex<Agent>,
}

impl SessionEntry {
    async fn append(&self, events: Vec<AgentEvent>) {
        let mut record = self.record.write().await;
        record.events.extend(events);
        record.last_update_time = now();
    }
}

type SessionKey = (String, String);

/// The served agent together with its model client and live sessions.
#[derive(Clone)]
pub struct AgentRuntime {
    definition: Arc<AgentDefinition>,
    model: Arc<dyn ChatModel>,
    sessions: Arc<RwLock<HashMap<SessionKey, Arc<SessionEntry>>>>,
}

impl AgentRuntime {
    pub fn new(definition: AgentDefinition, model: Arc<dyn ChatModel>) -> Self {
        Self {
            definition: Arc::new(definition),
            model,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn app_name(&self) -> &str {
        self.definition.name()
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        session_id: Option<String>,
        state: Map<String, Value>,
    ) -> Result<Session, RunError> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = (user_id.to_string(), session_id.clone());

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&key) {
            return Err(RunError::SessionExists(session_id));
        }

        let record = Session {
            id: session_id,
            app_name: self.app_name().to_string(),
            user_id: user_id.to_string(),
            state,
            events: Vec::new(),
            last_update_time: now(),
        };
        let entry = SessionEntry {
            record: RwLock::new(record.clone()),
            agent: Mutex::new(self.definition.instantiate(self.model.clone())?),
        };
        sessions.insert(key, Arc::new(entry));

        tracing::debug!(user = user_id, session = %record.id, "session created");
        Ok(record)
    }

    /// Returns the session, creating an empty one if it does not exist yet.
    pub async fn ensure_session(&self, user_id: &str, session_id: &str) -> Result<(), RunError> {
        if self.entry(user_id, session_id).await.is_ok() {
            return Ok(());
        }
        match self
            .create_session(user_id, Some(session_id.to_string()), Map::new())
            .await
        {
            Ok(_) | Err(RunError::SessionExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn get_session(&self, user_id: &str, session_id: &str) -> Option<Session> {
        let entry = self.entry(user_id, session_id).await.ok()?;
        let record = entry.record.read().await;
        Some(record.clone())
    }

    pub async fn list_sessions(&self, user_id: &str) -> Vec<Session> {
        let entries = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|((user, _), _)| user == user_id)
                .map(|(_, entry)| entry.clone())
                .collect::<Vec<_>>()
        };

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.record.read().await.clone());
        }
        records.sort_by(|a, b| a.last_update_time.total_cmp(&b.last_update_time));
        records
    }

    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> bool {
        self.sessions
            .write()
            .await
            .remove(&(user_id.to_string(), session_id.to_string()))
            .is_some()
    }

    /// Runs one turn to completion and returns every event it produced.
    pub async fn run(
        &self,
        user_id: &str,
        session_id: &str,
        message: String,
    ) -> Result<Vec<AgentEvent>, RunError> {
        let entry = self.entry(user_id, session_id).await?;
        let mut agent = entry.agent.lock().await;

        let mut events = Vec::new();
        let mut failure: Option<AgentError> = None;
        {
            let stream = agent.query_stream(message);
            futures_util::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        entry.append(events.clone()).await;
        match failure {
            Some(err) => {
                tracing::warn!(session = session_id, error = %err, "agent turn failed");
                Err(err.into())
            }
            None => Ok(events),
        }
    }

    /// Runs one turn on a background task, forwarding events as they happen.
    ///
    /// The run stops early if the receiver is dropped.
    pub async fn run_stream(
        &self,
        user_id: &str,
        session_id: &str,
        message: String,
    ) -> Result<mpsc::Receiver<Result<AgentEvent, AgentError>>, RunError> {
        let entry = self.entry(user_id, session_id).await?;
        let (tx, rx) = mpsc::channel(32);
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let mut agent = entry.agent.lock().await;
            let mut produced = Vec::new();
            {
                let stream = agent.query_stream(message);
                futures_util::pin_mut!(stream);
                while let Some(item) = stream.next().await {
                    if let Ok(event) = &item {
                        produced.push(event.clone());
                    }
                    if tx.send(item).await.is_err() {
                        tracing::debug!(session = %session_id, "stream receiver dropped, stopping run");
                        break;
                    }
                }
            }
            entry.append(produced).await;
        });

        Ok(rx)
    }

    async fn entry(&self, user_id: &str, session_id: &str) -> Result<Arc<SessionEntry>, RunError> {
        self.sessions
            .read()
            .await
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned()
            .ok_or_else(|| RunError::SessionNotFound(session_id.to_string()))
    }
}

fn now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Text of the last final response in a turn.
pub fn final_text(events: &[AgentEvent]) -> Option<&str> {
    events.iter().rev().find_map(|event| match event {
        AgentEvent::FinalResponse { content } => Some(content.as_str()),
        _ => None,
    })
}

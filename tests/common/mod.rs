#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use bigquery_agent::agent::{AGENT_DESCRIPTION, AGENT_NAME};
use bigquery_agent::error::WarehouseError;
use bigquery_agent::server::AgentRuntime;
use bigquery_agent::tools::bigquery::{
    BigQueryToolConfig, BigQueryToolset, DryRunInfo, QueryRequest, QueryResult, Warehouse,
};
use bigquery_agent::{
    AgentDefinition, ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice,
    ModelToolDefinition, ProviderError, ToolHandle,
};
use serde_json::{Map, Value, json};
use tower::ServiceExt;

/// Plays back completions in order.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<ModelCompletion>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ModelCompletion>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn invoke(
        &self,
        _messages: &[ModelMessage],
        _tools: &[ModelToolDefinition],
        _tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        self.responses
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or_else(|| ProviderError::Response("no scripted response left".to_string()))
    }
}

pub fn say(text: &str) -> ModelCompletion {
    ModelCompletion {
        text: Some(text.to_string()),
        ..ModelCompletion::default()
    }
}

pub fn call_sql(id: &str, query: &str) -> ModelCompletion {
    ModelCompletion {
        tool_calls: vec![ModelToolCall {
            id: id.to_string(),
            name: "execute_sql".to_string(),
            arguments: json!({"project_id": "proj-x", "query": query}),
        }],
        ..ModelCompletion::default()
    }
}

/// Answers every query with two rows and treats every statement as a SELECT.
pub struct FakeWarehouse;

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn query(&self, _request: &QueryRequest) -> Result<QueryResult, WarehouseError> {
        let rows = [("books", 12), ("games", 7)]
            .into_iter()
            .map(|(category, n)| {
                let mut row = Map::new();
                row.insert("category".to_string(), json!(category));
                row.insert("n".to_string(), json!(n));
                row
            })
            .collect();
        Ok(QueryResult {
            rows,
            total_rows: Some(2),
            session_id: None,
        })
    }

    async fn dry_run(&self, _request: &QueryRequest) -> Result<DryRunInfo, WarehouseError> {
        Ok(DryRunInfo {
            statement_type: Some("SELECT".to_string()),
            ddl_target_dataset: None,
        })
    }

    async fn list_datasets(&self, _project_id: &str) -> Result<Vec<String>, WarehouseError> {
        Ok(vec!["sales_ds".to_string()])
    }

    async fn get_dataset(
        &self,
        project_id: &str,
        dataset_id: &str,
    ) -> Result<Value, WarehouseError> {
        Ok(json!({"datasetReference": {"projectId": project_id, "datasetId": dataset_id}}))
    }

    async fn list_tables(
        &self,
        _project_id: &str,
        _dataset_id: &str,
    ) -> Result<Vec<String>, WarehouseError> {
        Ok(vec!["orders".to_string()])
    }

    async fn get_table(
        &self,
        project_id: &str,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<Value, WarehouseError> {
        Ok(json!({"tableReference": {
            "projectId": project_id,
            "datasetId": dataset_id,
            "tableId": table_id
        }}))
    }
}

pub fn runtime(responses: Vec<ModelCompletion>) -> AgentRuntime {
    let toolset: ToolHandle = Arc::new(BigQueryToolset::with_warehouse(
        BigQueryToolConfig {
            compute_project_id: Some("proj-x".to_string()),
            ..BigQueryToolConfig::default()
        },
        Arc::new(FakeWarehouse),
    ));
    let definition = AgentDefinition::new(
        "gemini-2.5-flash",
        AGENT_NAME,
        AGENT_DESCRIPTION,
        "You answer questions with BigQuery SQL.",
        vec![toolset],
    )
    .expect("definition builds");
    AgentRuntime::new(definition, Arc::new(ScriptedModel::new(responses)))
}

/// A serving directory holding the package for the compiled-in agent.
pub fn agents_dir() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().expect("tempdir");
    write_package(tmp.path(), AGENT_NAME);
    tmp
}

pub fn write_package(root: &Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join("agent.toml"), format!("name = \"{name}\"\n")).expect("manifest");
}

pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

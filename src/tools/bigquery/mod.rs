//! BigQuery tools: SQL execution plus dataset/table metadata lookups.

mod client;
mod config;

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::auth::{TokenProvider, default_token_provider};
use crate::config::Settings;
use crate::error::{ToolError, WarehouseError};
use crate::tools::{ToolHandle, ToolSpec, Toolset};

pub use client::{BigQueryClient, DryRunInfo, QueryRequest, QueryResult, Row, Warehouse};
pub use config::{BigQueryToolConfig, WriteMode};

pub const TOOLSET_NAME: &str = "bigquery";
const SESSION_DATASET: &str = "_SESSION";

/// Tool configuration derived from process settings.
pub fn build_tool_config(settings: &Settings) -> BigQueryToolConfig {
    BigQueryToolConfig {
        compute_project_id: settings.project_id.clone(),
        location: settings.bq_location.clone(),
        write_mode: settings.write_mode,
        ..BigQueryToolConfig::default()
    }
}

/// Builds the BigQuery toolset for these settings and returns it as a shareable handle.
pub fn build_tool(settings: &Settings) -> Result<ToolHandle, ToolError> {
    let config = build_tool_config(settings);
    let http = http_client(&config)?;
    let tokens = default_token_provider(settings, http.clone());
    let toolset = BigQueryToolset::new(config, http, tokens);
    Ok(Arc::new(toolset))
}

fn http_client(config: &BigQueryToolConfig) -> Result<reqwest::Client, ToolError> {
    let mut user_agent = format!("bigquery-agent/{}", env!("CARGO_PKG_VERSION"));
    if let Some(application_name) = &config.application_name {
        user_agent.push(' ');
        user_agent.push_str(application_name);
    }
    reqwest::Client::builder()
        .user_agent(user_agent)
        .build()
        .map_err(|err| ToolError::Execution(format!("failed to build http client: {err}")))
}

pub struct BigQueryToolset {
    inner: Arc<ToolsetInner>,
}

struct ToolsetInner {
    config: BigQueryToolConfig,
    warehouse: Arc<dyn Warehouse>,
    session_id: Mutex<Option<String>>,
}

impl BigQueryToolset {
    pub fn new(
        config: BigQueryToolConfig,
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self::with_warehouse(config, Arc::new(BigQueryClient::new(http, tokens)))
    }

    pub fn with_warehouse(config: BigQueryToolConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            inner: Arc::new(ToolsetInner {
                config,
                warehouse,
                session_id: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BigQueryToolConfig {
        &self.inner.config
    }

    fn execute_sql_tool(&self) -> ToolSpec {
        let inner = self.inner.clone();
        ToolSpec::new(
            "execute_sql",
            "Run a BigQuery GoogleSQL statement and return the result rows.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "project_id": {
                    "type": "string",
                    "description": "The GCP project id in which the query should be executed."
                },
                "query": {
                    "type": "string",
                    "description": "The BigQuery SQL query to be executed."
                }
            },
            "required": ["project_id", "query"],
            "additionalProperties": false
        }))
        .map(|spec| {
            spec.with_handler(move |args| {
                let inner = inner.clone();
                async move {
                    let project_id = string_arg(&args, "project_id")?;
                    let query = string_arg(&args, "query")?;
                    Ok(render(inner.execute_sql(&project_id, &query).await))
                }
            })
        })
        .unwrap_or_else(|err| invalid_spec("execute_sql", err))
    }

    fn list_dataset_ids_tool(&self) -> ToolSpec {
        let inner = self.inner.clone();
        ToolSpec::new(
            "list_dataset_ids",
            "List the BigQuery dataset ids in a Google Cloud project.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "string", "description": "The Google Cloud project id."}
            },
            "required": ["project_id"],
            "additionalProperties": false
        }))
        .map(|spec| {
            spec.with_handler(move |args| {
                let inner = inner.clone();
                async move {
                    let project_id = string_arg(&args, "project_id")?;
                    let result = inner.warehouse.list_datasets(&project_id).await.map(Value::from);
                    Ok(render(metadata_result("list_dataset_ids", result)))
                }
            })
        })
        .unwrap_or_else(|err| invalid_spec("list_dataset_ids", err))
    }

    fn get_dataset_info_tool(&self) -> ToolSpec {
        let inner = self.inner.clone();
        ToolSpec::new("get_dataset_info", "Get metadata about a BigQuery dataset.")
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "dataset_id": {"type": "string"}
                },
                "required": ["project_id", "dataset_id"],
                "additionalProperties": false
            }))
            .map(|spec| {
                spec.with_handler(move |args| {
                    let inner = inner.clone();
                    async move {
                        let project_id = string_arg(&args, "project_id")?;
                        let dataset_id = string_arg(&args, "dataset_id")?;
                        let result = inner.warehouse.get_dataset(&project_id, &dataset_id).await;
                        Ok(render(metadata_result("get_dataset_info", result)))
                    }
                })
            })
            .unwrap_or_else(|err| invalid_spec("get_dataset_info", err))
    }

    fn list_table_ids_tool(&self) -> ToolSpec {
        let inner = self.inner.clone();
        ToolSpec::new("list_table_ids", "List the table ids in a BigQuery dataset.")
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "dataset_id": {"type": "string"}
                },
                "required": ["project_id", "dataset_id"],
                "additionalProperties": false
            }))
            .map(|spec| {
                spec.with_handler(move |args| {
                    let inner = inner.clone();
                    async move {
                        let project_id = string_arg(&args, "project_id")?;
                        let dataset_id = string_arg(&args, "dataset_id")?;
                        let result = inner
                            .warehouse
                            .list_tables(&project_id, &dataset_id)
                            .await
                            .map(Value::from);
                        Ok(render(metadata_result("list_table_ids", result)))
                    }
                })
            })
            .unwrap_or_else(|err| invalid_spec("list_table_ids", err))
    }

    fn get_table_info_tool(&self) -> ToolSpec {
        let inner = self.inner.clone();
        ToolSpec::new(
            "get_table_info",
            "Get metadata (including the schema) of a BigQuery table.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "string"},
                "dataset_id": {"type": "string"},
                "table_id": {"type": "string"}
            },
            "required": ["project_id", "dataset_id", "table_id"],
            "additionalProperties": false
        }))
        .map(|spec| {
            spec.with_handler(move |args| {
                let inner = inner.clone();
                async move {
                    let project_id = string_arg(&args, "project_id")?;
                    let dataset_id = string_arg(&args, "dataset_id")?;
                    let table_id = string_arg(&args, "table_id")?;
                    let result = inner
                        .warehouse
                        .get_table(&project_id, &dataset_id, &table_id)
                        .await;
                    Ok(render(metadata_result("get_table_info", result)))
                }
            })
        })
        .unwrap_or_else(|err| invalid_spec("get_table_info", err))
    }
}

impl Toolset for BigQueryToolset {
    fn name(&self) -> &str {
        TOOLSET_NAME
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            self.execute_sql_tool(),
            self.list_dataset_ids_tool(),
            self.get_dataset_info_tool(),
            self.list_table_ids_tool(),
            self.get_table_info_tool(),
        ]
    }
}

impl ToolsetInner {
    async fn execute_sql(&self, project_id: &str, query: &str) -> Value {
        let compute_project = self
            .config
            .compute_project_id
            .clone()
            .unwrap_or_else(|| project_id.to_string());

        tracing::info!(tool = "execute_sql", project = %compute_project, mode = %self.config.write_mode, "running query");
        tracing::debug!(sql = %query, "execute_sql statement");

        let mut request = QueryRequest {
            project_id: compute_project,
            query: query.to_string(),
            location: self.config.location.clone(),
            max_results: self.config.max_query_result_rows,
            timeout_ms: self.config.timeout_ms,
            session_id: None,
            create_session: false,
        };

        match self.run(&mut request).await {
            Ok(Ok(result)) => self.success_payload(result),
            Ok(Err(rejection)) => error_payload(rejection),
            Err(err) => {
                tracing::warn!(error = %err, "execute_sql failed");
                error_payload(err.to_string())
            }
        }
    }

    /// Outer error is a warehouse failure, inner error a write-mode rejection.
    async fn run(
        &self,
        request: &mut QueryRequest,
    ) -> Result<Result<QueryResult, String>, WarehouseError> {
        match self.config.write_mode {
            WriteMode::Allowed => {}
            WriteMode::Blocked => {
                let info = self.warehouse.dry_run(request).await?;
                if info.statement_type.as_deref() != Some("SELECT") {
                    return Ok(Err(
                        "Read-only mode only supports SELECT statements.".to_string()
                    ));
                }
            }
            WriteMode::Protected => {
                request.session_id = Some(self.session(&request.project_id).await?);
                let info = self.warehouse.dry_run(request).await?;
                let is_select = info.statement_type.as_deref() == Some("SELECT");
                let is_session_write = info.ddl_target_dataset.as_deref() == Some(SESSION_DATASET);
                if !is_select && !is_session_write {
                    return Ok(Err("Protected mode only supports SELECT statements, or write operations on temporary tables.".to_string()));
                }
            }
        }

        self.warehouse.query(request).await.map(Ok)
    }

    async fn session(&self, project_id: &str) -> Result<String, WarehouseError> {
        let mut guard = self.session_id.lock().await;
        if let Some(session_id) = guard.as_ref() {
            return Ok(session_id.clone());
        }

        let bootstrap = QueryRequest {
            project_id: project_id.to_string(),
            query: "SELECT 1".to_string(),
            location: self.config.location.clone(),
            max_results: 1,
            timeout_ms: self.config.timeout_ms,
            session_id: None,
            create_session: true,
        };
        let session_id = self
            .warehouse
            .query(&bootstrap)
            .await?
            .session_id
            .ok_or_else(|| {
                WarehouseError::Response("query did not return a session id".to_string())
            })?;

        tracing::info!(session = %session_id, "created bigquery session");
        *guard = Some(session_id.clone());
        Ok(session_id)
    }

    fn success_payload(&self, result: QueryResult) -> Value {
        let max_rows = self.config.max_query_result_rows as usize;
        let mut rows = result.rows;
        let mut truncated = rows.len() > max_rows;
        rows.truncate(max_rows);
        if let Some(total) = result.total_rows {
            truncated |= total > rows.len() as u64;
        }

        let mut payload = json!({"status": "SUCCESS", "rows": rows});
        if truncated {
            payload["result_is_likely_truncated"] = Value::Bool(true);
        }
        payload
    }
}

fn metadata_result(tool: &str, result: Result<Value, WarehouseError>) -> Value {
    result.unwrap_or_else(|err| {
        tracing::warn!(tool, error = %err, "bigquery metadata lookup failed");
        error_payload(err.to_string())
    })
}

fn error_payload(details: impl Into<String>) -> Value {
    json!({"status": "ERROR", "error_details": details.into()})
}

fn render(value: Value) -> String {
    value.to_string()
}

fn string_arg(args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::Execution(format!("{key} missing")))
}

fn invalid_spec(tool: &str, err: crate::error::SchemaError) -> ToolSpec {
    tracing::error!(tool, error = %err, "invalid built-in tool schema");
    ToolSpec::new(tool, "unavailable")
}

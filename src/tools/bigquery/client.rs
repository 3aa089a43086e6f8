use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::auth::TokenProvider;
use crate::error::WarehouseError;

const DEFAULT_API_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const MAX_POLL_ATTEMPTS: u32 = 20;

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub project_id: String,
    pub query: String,
    pub location: Option<String>,
    pub max_results: u32,
    pub timeout_ms: u32,
    pub session_id: Option<String>,
    pub create_session: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub total_rows: Option<u64>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DryRunInfo {
    pub statement_type: Option<String>,
    pub ddl_target_dataset: Option<String>,
}

/// Read/query access to a tabular warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResult, WarehouseError>;

    async fn dry_run(&self, request: &QueryRequest) -> Result<DryRunInfo, WarehouseError>;

    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>, WarehouseError>;

    async fn get_dataset(&self, project_id: &str, dataset_id: &str)
    -> Result<Value, WarehouseError>;

    async fn list_tables(
        &self,
        project_id: &str,
        dataset_id: &str,
    ) -> Result<Vec<String>, WarehouseError>;

    async fn get_table(
        &self,
        project_id: &str,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<Value, WarehouseError>;
}

/// BigQuery REST v2 client.
#[derive(Clone)]
pub struct BigQueryClient {
    client: Client,
    tokens: Arc<dyn TokenProvider>,
    api_base_url: String,
}

impl std::fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}

impl BigQueryClient {
    pub fn new(client: Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client,
            tokens,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, WarehouseError> {
        let token = self.tokens.access_token().await?;
        Ok(request.bearer_auth(token))
    }

    async fn send<T>(&self, request: RequestBuilder) -> Result<T, WarehouseError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(|err| WarehouseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(extract_api_error(response).await);
        }

        response
            .json::<T>()
            .await
            .map_err(|err| WarehouseError::Response(err.to_string()))
    }

    async fn poll_results(
        &self,
        request: &QueryRequest,
        job: &JobReference,
    ) -> Result<QueryResponse, WarehouseError> {
        let url = self.url(&format!(
            "/projects/{}/queries/{}",
            job.project_id, job.job_id
        ));

        for _ in 0..MAX_POLL_ATTEMPTS {
            let mut params = vec![
                ("maxResults", request.max_results.to_string()),
                ("timeoutMs", request.timeout_ms.to_string()),
            ];
            if let Some(location) = job.location.as_ref().or(request.location.as_ref()) {
                params.push(("location", location.clone()));
            }

            let response: QueryResponse = self.send(self.client.get(&url).query(&params)).await?;
            if response.job_complete.unwrap_or(false) {
                return Ok(response);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        Err(WarehouseError::Response(format!(
            "job {} did not complete after {MAX_POLL_ATTEMPTS} polls",
            job.job_id
        )))
    }

    async fn list_paginated<T, F>(
        &self,
        url: String,
        mut extract: F,
    ) -> Result<Vec<String>, WarehouseError>
    where
        T: for<'de> Deserialize<'de> + Paginated,
        F: FnMut(T) -> Vec<String>,
    {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.client.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: T = self.send(request).await?;
            page_token = page.next_page_token();
            ids.extend(extract(page));
            if page_token.is_none() {
                return Ok(ids);
            }
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResult, WarehouseError> {
        let url = self.url(&format!("/projects/{}/queries", request.project_id));
        let body = QueryRequestBody::from_request(request, false);

        let mut response: QueryResponse = self.send(self.client.post(url).json(&body)).await?;
        if !response.job_complete.unwrap_or(true) {
            let Some(job) = response.job_reference.clone() else {
                return Err(WarehouseError::Response(
                    "incomplete query response missing jobReference".to_string(),
                ));
            };
            response = self.poll_results(request, &job).await?;
        }

        let fields = response
            .schema
            .map(|schema| schema.fields)
            .unwrap_or_default();
        let rows = response
            .rows
            .iter()
            .map(|row| convert_row(&fields, row))
            .collect();

        Ok(QueryResult {
            rows,
            total_rows: response.total_rows.and_then(|raw| raw.parse().ok()),
            session_id: response.session_info.and_then(|info| info.session_id),
        })
    }

    async fn dry_run(&self, request: &QueryRequest) -> Result<DryRunInfo, WarehouseError> {
        let url = self.url(&format!("/projects/{}/jobs", request.project_id));
        let body = json!({
            "jobReference": {
                "projectId": request.project_id,
                "location": request.location,
            },
            "configuration": {
                "dryRun": true,
                "query": QueryRequestBody::from_request(request, true),
            }
        });

        let job: JobResource = self.send(self.client.post(url).json(&body)).await?;
        let query_stats = job.statistics.and_then(|stats| stats.query);

        Ok(DryRunInfo {
            statement_type: query_stats
                .as_ref()
                .and_then(|stats| stats.statement_type.clone()),
            ddl_target_dataset: query_stats
                .and_then(|stats| stats.ddl_target_table)
                .map(|table| table.dataset_id),
        })
    }

    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>, WarehouseError> {
        let url = self.url(&format!("/projects/{project_id}/datasets"));
        self.list_paginated(url, |page: DatasetList| {
            page.datasets
                .into_iter()
                .map(|dataset| dataset.dataset_reference.dataset_id)
                .collect()
        })
        .await
    }

    async fn get_dataset(
        &self,
        project_id: &str,
        dataset_id: &str,
    ) -> Result<Value, WarehouseError> {
        let url = self.url(&format!("/projects/{project_id}/datasets/{dataset_id}"));
        self.send(self.client.get(url)).await
    }

    async fn list_tables(
        &self,
        project_id: &str,
        dataset_id: &str,
    ) -> Result<Vec<String>, WarehouseError> {
        let url = self.url(&format!(
            "/projects/{project_id}/datasets/{dataset_id}/tables"
        ));
        self.list_paginated(url, |page: TableList| {
            page.tables
                .into_iter()
                .map(|table| table.table_reference.table_id)
                .collect()
        })
        .await
    }

    async fn get_table(
        &self,
        project_id: &str,
        dataset_id: &str,
        table_id: &str,
    ) -> Result<Value, WarehouseError> {
        let url = self.url(&format!(
            "/projects/{project_id}/datasets/{dataset_id}/tables/{table_id}"
        ));
        self.send(self.client.get(url)).await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequestBody<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_results: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    create_session: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    connection_properties: Vec<ConnectionProperty<'a>>,
}

impl<'a> QueryRequestBody<'a> {
    fn from_request(request: &'a QueryRequest, dry_run: bool) -> Self {
        let connection_properties = request
            .session_id
            .as_deref()
            .map(|session_id| {
                vec![ConnectionProperty {
                    key: "session_id",
                    value: session_id,
                }]
            })
            .unwrap_or_default();

        Self {
            query: &request.query,
            use_legacy_sql: false,
            max_results: (!dry_run).then_some(request.max_results),
            timeout_ms: (!dry_run).then_some(request.timeout_ms),
            location: if dry_run {
                None
            } else {
                request.location.as_deref()
            },
            create_session: request.create_session && !dry_run,
            connection_properties,
        }
    }
}

#[derive(Debug, Serialize)]
struct ConnectionProperty<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    total_rows: Option<String>,
    job_complete: Option<bool>,
    job_reference: Option<JobReference>,
    session_info: Option<SessionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    mode: Option<String>,
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct JobResource {
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    query: Option<QueryStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatistics {
    statement_type: Option<String>,
    ddl_target_table: Option<TableReference>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    dataset_id: String,
    table_id: String,
}

trait Paginated {
    fn next_page_token(&self) -> Option<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetListItem>,
    next_page_token: Option<String>,
}

impl Paginated for DatasetList {
    fn next_page_token(&self) -> Option<String> {
        self.next_page_token.clone()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetListItem {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableListItem>,
    next_page_token: Option<String>,
}

impl Paginated for TableList {
    fn next_page_token(&self) -> Option<String> {
        self.next_page_token.clone()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListItem {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorEnvelope {
    error: GoogleApiError,
}

#[derive(Debug, Deserialize)]
struct GoogleApiError {
    code: Option<u16>,
    status: Option<String>,
    message: Option<String>,
}

async fn extract_api_error(response: reqwest::Response) -> WarehouseError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<GoogleErrorEnvelope>(&body) {
        return WarehouseError::Api {
            code: parsed.error.code.unwrap_or(status.as_u16()),
            status: parsed
                .error
                .status
                .unwrap_or_else(|| status.to_string().to_uppercase()),
            message: parsed
                .error
                .message
                .unwrap_or_else(|| "unknown bigquery api error".to_string()),
        };
    }

    WarehouseError::Api {
        code: status.as_u16(),
        status: status.to_string().to_uppercase(),
        message: if body.is_empty() {
            "empty response body".to_string()
        } else {
            body
        },
    }
}

pub(crate) fn convert_row(fields: &[FieldSchema], row: &TableRow) -> Row {
    fields
        .iter()
        .zip(row.f.iter())
        .map(|(field, cell)| (field.name.clone(), convert_field(field, &cell.v)))
        .collect()
}

fn convert_field(field: &FieldSchema, value: &Value) -> Value {
    if field.mode.as_deref() == Some("REPEATED") {
        let Value::Array(items) = value else {
            return Value::Array(Vec::new());
        };
        return Value::Array(
            items
                .iter()
                .map(|item| convert_scalar(field, item.get("v").unwrap_or(&Value::Null)))
                .collect(),
        );
    }
    convert_scalar(field, value)
}

fn convert_scalar(field: &FieldSchema, value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }

    match field.field_type.as_str() {
        "RECORD" | "STRUCT" => {
            let cells = value
                .get("f")
                .cloned()
                .and_then(|cells| serde_json::from_value::<Vec<TableCell>>(cells).ok())
                .unwrap_or_default();
            Value::Object(convert_row(&field.fields, &TableRow { f: cells }))
        }
        "INTEGER" | "INT64" => parse_with(value, |raw| raw.parse::<i64>().ok().map(Value::from)),
        "FLOAT" | "FLOAT64" => parse_with(value, |raw| {
            raw.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        }),
        "BOOLEAN" | "BOOL" => parse_with(value, |raw| match raw {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        }),
        "TIMESTAMP" => parse_with(value, |raw| {
            let seconds = raw.parse::<f64>().ok()?;
            let micros = (seconds * 1_000_000.0).round() as i64;
            DateTime::from_timestamp_micros(micros).map(|ts| Value::String(ts.to_rfc3339()))
        }),
        "JSON" => parse_with(value, |raw| serde_json::from_str(raw).ok()),
        _ => value.clone(),
    }
}

fn parse_with<F>(value: &Value, parse: F) -> Value
where
    F: FnOnce(&str) -> Option<Value>,
{
    match value.as_str() {
        Some(raw) => parse(raw).unwrap_or_else(|| value.clone()),
        None => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema(value: Value) -> Vec<FieldSchema> {
        serde_json::from_value::<TableSchema>(value)
            .expect("schema parses")
            .fields
    }

    fn row(value: Value) -> TableRow {
        serde_json::from_value(value).expect("row parses")
    }

    #[test]
    fn scalar_cells_are_typed_by_schema() {
        let fields = schema(json!({"fields": [
            {"name": "region", "type": "STRING"},
            {"name": "orders", "type": "INTEGER"},
            {"name": "revenue", "type": "FLOAT"},
            {"name": "active", "type": "BOOLEAN"},
            {"name": "amount", "type": "NUMERIC"},
            {"name": "missing", "type": "STRING"}
        ]}));
        let converted = convert_row(
            &fields,
            &row(json!({"f": [
                {"v": "EMEA"},
                {"v": "42"},
                {"v": "10.5"},
                {"v": "true"},
                {"v": "1.10"},
                {"v": null}
            ]})),
        );

        assert_eq!(converted["region"], "EMEA");
        assert_eq!(converted["orders"], 42);
        assert_eq!(converted["revenue"], 10.5);
        assert_eq!(converted["active"], true);
        assert_eq!(converted["amount"], "1.10");
        assert!(converted["missing"].is_null());
    }

    #[test]
    fn repeated_and_record_cells_are_nested() {
        let fields = schema(json!({"fields": [
            {"name": "tags", "type": "STRING", "mode": "REPEATED"},
            {"name": "customer", "type": "RECORD", "fields": [
                {"name": "id", "type": "INT64"},
                {"name": "name", "type": "STRING"}
            ]}
        ]}));
        let converted = convert_row(
            &fields,
            &row(json!({"f": [
                {"v": [{"v": "a"}, {"v": "b"}]},
                {"v": {"f": [{"v": "7"}, {"v": "Ada"}]}}
            ]})),
        );

        assert_eq!(converted["tags"], json!(["a", "b"]));
        assert_eq!(converted["customer"], json!({"id": 7, "name": "Ada"}));
    }

    #[test]
    fn timestamps_and_json_are_decoded() {
        let fields = schema(json!({"fields": [
            {"name": "at", "type": "TIMESTAMP"},
            {"name": "payload", "type": "JSON"}
        ]}));
        let converted = convert_row(
            &fields,
            &row(json!({"f": [
                {"v": "1.7E9"},
                {"v": "{\"k\":1}"}
            ]})),
        );

        assert_eq!(converted["at"], "2023-11-14T22:13:20+00:00");
        assert_eq!(converted["payload"], json!({"k": 1}));
    }

    #[test]
    fn unparsable_values_are_kept_verbatim() {
        let fields = schema(json!({"fields": [{"name": "n", "type": "INTEGER"}]}));
        let converted = convert_row(&fields, &row(json!({"f": [{"v": "NaN-ish"}]})));
        assert_eq!(converted["n"], "NaN-ish");
    }

    #[test]
    fn query_body_carries_session_and_skips_limits_on_dry_run() {
        let request = QueryRequest {
            project_id: "p".to_string(),
            query: "SELECT 1".to_string(),
            location: Some("EU".to_string()),
            max_results: 50,
            timeout_ms: 1000,
            session_id: Some("sess".to_string()),
            create_session: true,
        };

        let body = serde_json::to_value(QueryRequestBody::from_request(&request, false))
            .expect("serializes");
        assert_eq!(body["useLegacySql"], false);
        assert_eq!(body["maxResults"], 50);
        assert_eq!(body["location"], "EU");
        assert_eq!(body["createSession"], true);
        assert_eq!(body["connectionProperties"][0]["value"], "sess");

        let dry = serde_json::to_value(QueryRequestBody::from_request(&request, true))
            .expect("serializes");
        assert!(dry.get("maxResults").is_none());
        assert!(dry.get("createSession").is_none());
        assert_eq!(dry["connectionProperties"][0]["key"], "session_id");
    }
}

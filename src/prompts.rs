use crate::config::Settings;

pub const DEFAULT_PROJECT_ID: &str = "your-project-id";
pub const DEFAULT_DATASET_ID: &str = "your-dataset";

/// Renders the agent instruction for the configured project and default dataset.
pub fn build_instructions(settings: &Settings) -> String {
    let project_id = non_empty_or(settings.project_id.as_deref(), DEFAULT_PROJECT_ID);
    let dataset_id = non_empty_or(settings.dataset_id.as_deref(), DEFAULT_DATASET_ID);

    format!(
        "
You are a data assistant with access to a BigQuery database.
Your goal is to help users by answering their questions about the data.

You have access to the BigQuery project: {project_id}
The default dataset is: {dataset_id}

When a user asks a question, you should first generate a SQL query that can answer the question,
and then use the `execute_sql` tool to run the query and get the result.

For queries against the default dataset, you can reference tables directly (e.g., 'sales').
For other datasets or projects, use fully qualified names (e.g., '`project.dataset.table`').

Finally, summarize the result in a clear, natural language answer.
    "
    )
}

fn non_empty_or<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    value.filter(|v| !v.is_empty()).unwrap_or(default)
}

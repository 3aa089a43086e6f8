use std::sync::Arc;

use anyhow::Context;
use bigquery_agent::server::{AgentRuntime, build_web_app, serve};
use bigquery_agent::telemetry::init_tracing;
use bigquery_agent::{GeminiModel, Settings, root_agent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("reading configuration")?;
    init_tracing();
    tracing::info!(
        project = settings.project_id.as_deref().unwrap_or("<unset>"),
        dataset = settings.dataset_id.as_deref().unwrap_or("<unset>"),
        model = %settings.model,
        write_mode = %settings.write_mode,
        agents_dir = %settings.agents_dir.display(),
        "starting web server"
    );

    let definition = root_agent(&settings).context("building the agent")?;
    let model = GeminiModel::from_settings(&settings, definition.model())
        .context("configuring the model client")?;
    let runtime = AgentRuntime::new(definition, Arc::new(model));

    let app = build_web_app(&settings.agents_dir, true, runtime)
        .with_context(|| format!("loading agents from {}", settings.agents_dir.display()))?;

    serve(app, settings.port)
        .await
        .with_context(|| format!("serving on port {}", settings.port))
}

//! Google OAuth access tokens for BigQuery and Vertex AI calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::error::WarehouseError;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, WarehouseError>;
}

/// A fixed token, typically from `GOOGLE_OAUTH_ACCESS_TOKEN`.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, WarehouseError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Service-account tokens from the GCE / Cloud Run metadata server.
#[derive(Debug)]
pub struct MetadataServerToken {
    client: Client,
    url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerToken {
    pub fn new(client: Client) -> Self {
        Self::with_url(client, METADATA_TOKEN_URL)
    }

    pub fn with_url(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenProvider for MetadataServerToken {
    async fn access_token(&self) -> Result<String, WarehouseError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|err| WarehouseError::Auth(format!("metadata server unreachable: {err}")))?;

        if !response.status().is_success() {
            return Err(WarehouseError::Auth(format!(
                "metadata server returned {}",
                response.status()
            )));
        }

        let payload = response
            .json::<MetadataTokenResponse>()
            .await
            .map_err(|err| WarehouseError::Auth(format!("metadata token invalid: {err}")))?;

        let lifetime = Duration::from_secs(payload.expires_in).saturating_sub(REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: payload.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(payload.access_token)
    }
}

/// Tokens minted by the local `gcloud` CLI (application default login).
#[derive(Debug, Clone)]
pub struct GcloudCliToken {
    program: String,
}

impl Default for GcloudCliToken {
    fn default() -> Self {
        Self {
            program: "gcloud".to_string(),
        }
    }
}

#[async_trait]
impl TokenProvider for GcloudCliToken {
    async fn access_token(&self) -> Result<String, WarehouseError> {
        let output = Command::new(&self.program)
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|err| WarehouseError::Auth(format!("failed to run gcloud: {err}")))?;

        if !output.status.success() {
            return Err(WarehouseError::Auth(format!(
                "gcloud exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(WarehouseError::Auth(
                "gcloud printed an empty access token".to_string(),
            ));
        }
        Ok(token)
    }
}

/// Tries each provider in turn and returns the first token obtained.
pub struct TokenChain {
    providers: Vec<Arc<dyn TokenProvider>>,
}

impl TokenChain {
    pub fn new(providers: Vec<Arc<dyn TokenProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl TokenProvider for TokenChain {
    async fn access_token(&self) -> Result<String, WarehouseError> {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match provider.access_token().await {
                Ok(token) => return Ok(token),
                Err(err) => {
                    tracing::debug!(error = %err, "token provider failed, trying next");
                    failures.push(err.to_string());
                }
            }
        }
        Err(WarehouseError::Auth(if failures.is_empty() {
            "no token providers configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

/// Static token if configured, then the metadata server, then `gcloud`.
pub fn default_token_provider(settings: &Settings, client: Client) -> Arc<dyn TokenProvider> {
    let mut providers: Vec<Arc<dyn TokenProvider>> = Vec::new();
    if let Some(token) = &settings.access_token {
        providers.push(Arc::new(StaticToken::new(token.clone())));
    }
    providers.push(Arc::new(MetadataServerToken::new(client)));
    providers.push(Arc::new(GcloudCliToken::default()));
    Arc::new(TokenChain::new(providers))
}

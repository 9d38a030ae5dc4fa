//! Shutting down the machine this worker runs on once it has nothing left to do.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::config::AppConfig;

const METADATA_FLAVOR: (&str, &str) = ("Metadata-Flavor", "Google");

#[async_trait]
pub trait InstanceController: Send + Sync {
    /// Ask the cloud provider to delete this instance.
    async fn self_terminate(&self) -> Result<()>;
}

/// Picks the controller the configuration asks for.
pub fn create_controller(config: &AppConfig) -> Arc<dyn InstanceController> {
    if config.self_terminate {
        Arc::new(GceInstanceController::new(
            MetadataClient::new(&config.metadata_url),
            &config.compute_url,
        ))
    } else {
        Arc::new(DisabledInstanceController)
    }
}

/// Reads facts about the current instance from the metadata server.
#[derive(Clone)]
pub struct MetadataClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

impl MetadataClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header(METADATA_FLAVOR.0, METADATA_FLAVOR.1)
            .send()
            .await
            .with_context(|| format!("Failed to query metadata {}", url))?;

        if !response.status().is_success() {
            bail!("Metadata {} returned {}", url, response.status());
        }
        Ok(response)
    }

    async fn text(&self, path: &str) -> Result<String> {
        let body = self.get(path).await?.text().await?;
        Ok(body.trim().to_string())
    }

    pub async fn project_id(&self) -> Result<String> {
        self.text("project/project-id").await
    }

    pub async fn instance_name(&self) -> Result<String> {
        self.text("instance/name").await
    }

    /// The zone comes back as `projects/<n>/zones/<zone>`; keep the last segment.
    pub async fn zone(&self) -> Result<String> {
        let zone = self.text("instance/zone").await?;
        Ok(zone.rsplit('/').next().unwrap_or_default().to_string())
    }

    pub async fn access_token(&self) -> Result<String> {
        let token: AccessToken = self
            .get("instance/service-accounts/default/token")
            .await?
            .json()
            .await
            .context("Malformed access token response")?;
        Ok(token.access_token)
    }
}

/// Deletes the current Compute Engine instance through the compute API.
pub struct GceInstanceController {
    metadata: MetadataClient,
    compute_url: String,
    client: reqwest::Client,
}

impl GceInstanceController {
    pub fn new(metadata: MetadataClient, compute_url: &str) -> Self {
        Self {
            metadata,
            compute_url: compute_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InstanceController for GceInstanceController {
    async fn self_terminate(&self) -> Result<()> {
        let project = self.metadata.project_id().await?;
        let zone = self.metadata.zone().await?;
        let name = self.metadata.instance_name().await?;
        let token = self.metadata.access_token().await?;

        let url = format!(
            "{}/projects/{}/zones/{}/instances/{}",
            self.compute_url, project, zone, name
        );
        info!(instance = %name, zone = %zone, project = %project, "Deleting instance");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Failed to request deletion of {}", name))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Deleting instance {} returned {}: {}", name, status, body.trim());
        }

        Ok(())
    }
}

/// Leaves the machine running; used for local runs.
pub struct DisabledInstanceController;

#[async_trait]
impl InstanceController for DisabledInstanceController {
    async fn self_terminate(&self) -> Result<()> {
        info!("Self-termination disabled, leaving instance running");
        Ok(())
    }
}

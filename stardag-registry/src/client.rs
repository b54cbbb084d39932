//! HTTP registry client (§4.4, §6). Event emission is fire-and-forget by
//! default: RPC failures are logged and swallowed so a registry outage
//! never fails a build, except `register_task` and asset upload when
//! `strict` is set (§4.4 "Error tolerance").

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use uuid::Uuid;

use stardag_core::registry::{BuildEvent, Registry, TaskEvent, TaskRegistration};
use stardag_core::run::RegistryAsset;

use crate::wire::{
    AssetKind, AssetUpload, FailTaskQuery, RegisterTaskRequest, StartBuildRequest,
    StartBuildResponse, UploadAssetsRequest,
};

/// Credential carried on every request (§6 "Authentication").
#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey(String),
    BearerToken(String),
}

#[derive(Debug, Clone)]
pub struct HttpRegistryConfig {
    pub base_url: String,
    pub credential: Credential,
    pub timeout: Duration,
    /// When set, `register_task` and asset upload propagate errors
    /// instead of swallowing them.
    pub strict: bool,
}

pub struct HttpRegistry {
    client: Client,
    config: HttpRegistryConfig,
}

impl HttpRegistry {
    pub fn new(config: HttpRegistryConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url, path);
        let builder = self.client.request(method, url);
        match &self.config.credential {
            Credential::ApiKey(key) => builder.header("X-API-Key", key),
            Credential::BearerToken(token) => builder.bearer_auth(token),
        }
    }

    fn event_path(build_id: Uuid, task_id: Uuid, segment: &str) -> String {
        format!("/api/v1/builds/{build_id}/tasks/{task_id}/{segment}")
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn start_build(&self, root_task_ids: &[Uuid], description: &str) -> anyhow::Result<Uuid> {
        let body = StartBuildRequest {
            root_task_ids,
            description,
        };
        let resp = self
            .request(reqwest::Method::POST, "/api/v1/builds")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<StartBuildResponse>()
            .await?;
        Ok(resp.id)
    }

    async fn register_task(
        &self,
        build_id: Uuid,
        registration: &TaskRegistration,
    ) -> anyhow::Result<()> {
        let body = RegisterTaskRequest {
            task: &registration.payload,
            dep_ids: &registration.dependency_ids,
            user_identity: registration.user_identity.as_deref(),
            commit_hash: registration.commit_hash.as_deref(),
        };
        let path = format!("/api/v1/builds/{build_id}/tasks");
        let result = self
            .request(reqwest::Method::POST, &path)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => Ok(()),
            Err(e) if self.config.strict => Err(e.into()),
            Err(e) => {
                tracing::warn!(%build_id, task_id = %registration.task_ref.id, error = %e, "register_task failed (non-strict, continuing)");
                Ok(())
            }
        }
    }

    async fn task_event(
        &self,
        build_id: Uuid,
        task_id: Uuid,
        event: TaskEvent,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let segment = match event {
            TaskEvent::Started => "start",
            TaskEvent::Completed => "complete",
            TaskEvent::Failed => "fail",
            // The other lifecycle kinds (pending/referenced/suspended/
            // resumed/waiting-for-lock/skipped/cancelled) are carried as a
            // generic events feed rather than the three named REST verbs.
            _ => "event",
        };
        let path = Self::event_path(build_id, task_id, segment);
        let mut req = self.request(reqwest::Method::POST, &path);
        if segment == "fail" {
            let query = FailTaskQuery {
                error_message: error_message.unwrap_or(""),
            };
            req = req.query(&query);
        } else {
            req = req.json(&serde_json::json!({ "kind": format!("{event:?}") }));
        }
        if let Err(e) = req.send().await.and_then(|r| r.error_for_status()) {
            tracing::warn!(%build_id, %task_id, error = %e, "task event emission failed (non-fatal)");
        }
        Ok(())
    }

    async fn build_event(&self, build_id: Uuid, event: BuildEvent) -> anyhow::Result<()> {
        let path = format!("/api/v1/builds/{build_id}/events");
        if let Err(e) = self
            .request(reqwest::Method::POST, &path)
            .json(&serde_json::json!({ "kind": format!("{event:?}") }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            tracing::warn!(%build_id, error = %e, "build event emission failed (non-fatal)");
        }
        Ok(())
    }

    async fn upload_assets(
        &self,
        build_id: Uuid,
        task_id: Uuid,
        assets: &[RegistryAsset],
    ) -> anyhow::Result<()> {
        let body = UploadAssetsRequest {
            assets: assets
                .iter()
                .map(|a| match a {
                    RegistryAsset::Markdown { name, body } => AssetUpload {
                        kind: AssetKind::Markdown,
                        name: name.clone(),
                        body: serde_json::Value::String(body.clone()),
                    },
                    RegistryAsset::Json { name, body } => AssetUpload {
                        kind: AssetKind::Json,
                        name: name.clone(),
                        body: body.clone(),
                    },
                })
                .collect(),
        };
        let path = format!("/api/v1/builds/{build_id}/tasks/{task_id}/assets");
        let result = self
            .request(reqwest::Method::POST, &path)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => Ok(()),
            Err(e) if self.config.strict => Err(e.into()),
            Err(e) => {
                tracing::warn!(%build_id, %task_id, error = %e, "asset upload failed (non-strict, continuing)");
                Ok(())
            }
        }
    }
}

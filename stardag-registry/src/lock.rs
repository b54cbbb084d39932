//! HTTP-backed global concurrency lock (§4.3, §6). Status codes carry the
//! acquisition outcome: 200 on `acquired`/`already_completed`, 423 on
//! `held_by_other`, 429 on workspace cap, 409 otherwise.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use uuid::Uuid;

use stardag_core::lock::{GlobalConcurrencyLock, LockAcquisition};

use crate::client::Credential;
use crate::wire::{
    AcquireLockRequest, AcquireLockResponse, CompletionStatusResponse, LockStatus,
    ReleaseLockRequest, ReleaseLockResponse, RenewLockRequest, RenewLockResponse,
};

#[derive(Debug, Clone)]
pub struct HttpLockConfig {
    pub base_url: String,
    pub credential: Credential,
    pub timeout: Duration,
    /// Attempts per RPC before surfacing `LockAcquisition::Error` /
    /// `Err` (§4.3.3: "bounded exponential backoff, ~5 attempts").
    pub max_attempts: u32,
}

impl Default for HttpLockConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            credential: Credential::ApiKey(String::new()),
            timeout: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

pub struct HttpLock {
    client: Client,
    config: HttpLockConfig,
}

impl HttpLock {
    pub fn new(config: HttpLockConfig) -> anyhow::Result<Self> {
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

    async fn with_retries<T, F, Fut>(&self, mut attempt: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        let mut last_err = String::new();
        for i in 0..self.config.max_attempts {
            match attempt().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = e;
                    let backoff = Duration::from_millis(100 * 2u64.pow(i));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl GlobalConcurrencyLock for HttpLock {
    async fn acquire(
        &self,
        task_id: Uuid,
        owner_id: Uuid,
        ttl: Duration,
        check_task_completion: bool,
    ) -> LockAcquisition {
        let path = format!("/api/v1/locks/{task_id}/acquire");
        let body = AcquireLockRequest {
            owner_id,
            ttl_seconds: ttl.as_secs(),
            check_task_completion,
        };

        let result = self
            .with_retries(|| async {
                let resp = self
                    .request(reqwest::Method::POST, &path)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                let status = resp.status();
                match status {
                    StatusCode::OK => {
                        let parsed: AcquireLockResponse =
                            resp.json().await.map_err(|e| e.to_string())?;
                        Ok(Ok(parsed))
                    }
                    StatusCode::LOCKED => Ok(Err(LockAcquisition::HeldByOther {
                        owner_id: Uuid::nil(),
                    })),
                    StatusCode::TOO_MANY_REQUESTS => Ok(Err(LockAcquisition::WorkspaceCapReached)),
                    other => Err(format!("unexpected lock status {other}")),
                }
            })
            .await;

        match result {
            Ok(Ok(parsed)) => match parsed.status {
                LockStatus::Acquired => {
                    let info = parsed.lock.unwrap_or(crate::wire::LockInfo {
                        acquired_at: 0,
                        expires_at: 0,
                        version: 1,
                        owner_id: Some(owner_id),
                    });
                    LockAcquisition::Acquired {
                        acquired_at: info.acquired_at,
                        expires_at: info.expires_at,
                        version: info.version,
                    }
                }
                LockStatus::AlreadyCompleted => LockAcquisition::AlreadyCompleted,
                LockStatus::HeldByOther => LockAcquisition::HeldByOther {
                    owner_id: parsed
                        .lock
                        .and_then(|l| l.owner_id)
                        .unwrap_or_else(Uuid::nil),
                },
                LockStatus::WorkspaceCapReached => LockAcquisition::WorkspaceCapReached,
            },
            Ok(Err(acquisition)) => acquisition,
            Err(e) => LockAcquisition::Error(e),
        }
    }

    async fn renew(&self, task_id: Uuid, owner_id: Uuid, ttl: Duration) -> Result<bool, String> {
        let path = format!("/api/v1/locks/{task_id}/renew");
        let body = RenewLockRequest {
            owner_id,
            ttl_seconds: ttl.as_secs(),
        };
        self.with_retries(|| async {
            let resp = self
                .request(reqwest::Method::POST, &path)
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if resp.status() == StatusCode::CONFLICT {
                return Ok(false);
            }
            let parsed: RenewLockResponse = resp
                .error_for_status()
                .map_err(|e| e.to_string())?
                .json()
                .await
                .map_err(|e| e.to_string())?;
            Ok(parsed.renewed)
        })
        .await
    }

    async fn release(
        &self,
        task_id: Uuid,
        owner_id: Uuid,
        task_completed: bool,
    ) -> Result<bool, String> {
        let path = format!("/api/v1/locks/{task_id}/release");
        let body = ReleaseLockRequest {
            owner_id,
            task_completed: Some(task_completed),
            build_id: None,
        };
        self.with_retries(|| async {
            let resp = self
                .request(reqwest::Method::POST, &path)
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if resp.status() == StatusCode::CONFLICT {
                return Ok(false);
            }
            let parsed: ReleaseLockResponse = resp
                .error_for_status()
                .map_err(|e| e.to_string())?
                .json()
                .await
                .map_err(|e| e.to_string())?;
            Ok(parsed.released)
        })
        .await
    }

    async fn is_completed(&self, task_id: Uuid) -> Result<bool, String> {
        let path = format!("/api/v1/locks/tasks/{task_id}/completion-status");
        self.with_retries(|| async {
            let resp = self
                .request(reqwest::Method::GET, &path)
                .send()
                .await
                .map_err(|e| e.to_string())?
                .error_for_status()
                .map_err(|e| e.to_string())?;
            let parsed: CompletionStatusResponse = resp.json().await.map_err(|e| e.to_string())?;
            Ok(parsed.is_completed)
        })
        .await
    }
}

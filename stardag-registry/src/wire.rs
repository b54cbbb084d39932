//! Wire DTOs for the registry's REST surface (§6 "Registry wire
//! protocol"). Plain serde structs; the HTTP status code carries most of
//! the semantics (see `lock.rs`), these are just the JSON bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct StartBuildRequest<'a> {
    pub root_task_ids: &'a [Uuid],
    pub description: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct StartBuildResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct RegisterTaskRequest<'a> {
    pub task: &'a Json,
    pub dep_ids: &'a [Uuid],
    pub user_identity: Option<&'a str>,
    pub commit_hash: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct FailTaskQuery<'a> {
    pub error_message: &'a str,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Markdown,
    Json,
}

#[derive(Debug, Serialize)]
pub struct AssetUpload {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub name: String,
    pub body: Json,
}

#[derive(Debug, Serialize)]
pub struct UploadAssetsRequest {
    pub assets: Vec<AssetUpload>,
}

#[derive(Debug, Serialize)]
pub struct AcquireLockRequest {
    pub owner_id: Uuid,
    pub ttl_seconds: u64,
    pub check_task_completion: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Acquired,
    AlreadyCompleted,
    HeldByOther,
    WorkspaceCapReached,
}

#[derive(Debug, Deserialize)]
pub struct LockInfo {
    pub acquired_at: i64,
    pub expires_at: i64,
    pub version: u64,
    pub owner_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AcquireLockResponse {
    pub status: LockStatus,
    pub acquired: bool,
    pub lock: Option<LockInfo>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RenewLockRequest {
    pub owner_id: Uuid,
    pub ttl_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct RenewLockResponse {
    pub renewed: bool,
}

#[derive(Debug, Serialize)]
pub struct ReleaseLockRequest {
    pub owner_id: Uuid,
    pub task_completed: Option<bool>,
    pub build_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLockResponse {
    pub released: bool,
}

#[derive(Debug, Deserialize)]
pub struct CompletionStatusResponse {
    pub task_id: Uuid,
    pub is_completed: bool,
}

//! Interfaces to the external collaborators the engine coordinates.
//!
//! The engine never talks HTTP itself (the diagnostic model client in
//! [`crate::llm`] is the one exception); concrete transports live behind
//! these traits and are wired in at process boot.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::llm::LlmError;
use crate::notify::Notification;
use crate::types::{Health, JobStatus, MergeState, StageInfo};

// ── Source host ──────────────────────────────────────────────────────────

/// Outcome of merging master into one service's pre-release branch.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub service: String,
    pub status: MergeState,
    /// New merge commit sha; empty for no-op and failed merges.
    pub sha: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BranchHeads {
    pub master_sha: String,
    pub target_sha: String,
}

#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Merge master into `target_branch` on the service's repository.
    async fn merge_branch(
        &self,
        service: &str,
        target_branch: &str,
        message: &str,
    ) -> Result<MergeOutcome>;

    /// Batch-fetch master and target HEAD shas for `(service, target_branch)`
    /// pairs.
    async fn branch_heads(
        &self,
        services: &[(String, String)],
    ) -> Result<HashMap<String, BranchHeads>>;

    /// Read a file from the GitOps repository via the contents API.
    /// Returns `(content, blob_sha)` or `None` when absent.
    async fn read_repo_file(&self, path: &str) -> Result<Option<(String, String)>>;

    /// Create or update a file via the contents API. `prev_sha` makes the
    /// write a compare-and-set; returns `false` on a lost race.
    async fn write_repo_file(
        &self,
        path: &str,
        content: &str,
        prev_sha: Option<&str>,
        message: &str,
    ) -> Result<bool>;

    /// Delete a file via the contents API; returns `false` on conflict.
    async fn delete_repo_file(&self, path: &str, sha: &str, message: &str) -> Result<bool>;
}

// ── Artifact registry ────────────────────────────────────────────────────

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Probe for an image tag. Returns `(exists, detail)` — the detail text
    /// is matched for credential/auth failures by the caller.
    async fn check_image(&self, service: &str, tag: &str) -> (bool, String);
}

/// Substrings in a registry probe detail that indicate an auth/config
/// problem rather than a genuinely missing image.
pub const REGISTRY_AUTH_ERRORS: &[&str] = &[
    "not configured",
    "not installed",
    "access denied",
    "expired",
    "token",
    "credentials",
];

pub fn is_registry_auth_error(detail: &str) -> bool {
    let lower = detail.to_lowercase();
    REGISTRY_AUTH_ERRORS.iter().any(|k| lower.contains(k))
}

// ── CI worker ────────────────────────────────────────────────────────────

/// Live stage update pushed while a CI build is watched.
#[derive(Debug, Clone)]
pub struct StageUpdate {
    pub job: String,
    pub build_num: i64,
    pub stages: Vec<StageInfo>,
    /// Terminal overall status once known, else empty.
    pub overall: String,
    pub phase: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct CiBuildResult {
    pub status: JobStatus,
    pub build_num: i64,
    pub duration: String,
    pub url: String,
    pub stages: Vec<StageInfo>,
    pub queue_duration: String,
    pub exec_duration: String,
}

#[async_trait]
pub trait CiWorker: Send + Sync {
    /// URL of a service's build job (optionally a specific build).
    fn job_url(&self, service: &str, ci_repo: &str, build_num: Option<i64>) -> String;

    /// Locate (or wait for) the most recent build on the service's job and
    /// stream stage updates until the build finishes or — when
    /// `wait_for_image_stage` — the image-push stage succeeds. Capped at
    /// `timeout_secs`.
    async fn find_and_monitor_build(
        &self,
        service: &str,
        ci_repo: &str,
        updates: mpsc::UnboundedSender<StageUpdate>,
        timeout_secs: u64,
        wait_for_image_stage: bool,
    ) -> Result<CiBuildResult>;

    /// Trigger a QA job and stream its pipeline stages until terminal status
    /// or the per-job watch timeout.
    async fn trigger_and_stream(
        &self,
        job: &str,
        updates: mpsc::UnboundedSender<StageUpdate>,
    ) -> Result<CiBuildResult>;
}

// ── Deployment controller ────────────────────────────────────────────────

/// One application status as reported by the deployment controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatus {
    pub name: String,
    pub health: Health,
    #[serde(default)]
    pub sync: String,
    #[serde(default)]
    pub tag: String,
}

#[async_trait]
pub trait DeployController: Send + Sync {
    async fn list_applications(&self) -> Result<Vec<AppStatus>>;

    /// Force a sync of one application (full app name, namespace prefix
    /// included).
    async fn hard_sync(&self, app: &str) -> Result<()>;

    /// Subscribe to the streaming event feed. Pushes the full updated app
    /// list on every status change; runs until the receiver is dropped or
    /// the stream errors.
    async fn watch(&self, events: mpsc::Sender<Vec<AppStatus>>) -> Result<()>;
}

// ── Notifications ────────────────────────────────────────────────────────

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

// ── Diagnostic model ─────────────────────────────────────────────────────

#[async_trait]
pub trait DiagnosticModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

/// Failure-evidence sources queried when a step fails.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    /// Recent log lines for one service.
    async fn service_logs(&self, service: &str, limit: u32) -> Result<String>;
    /// Recent error-level log lines across all services.
    async fn error_logs(&self, limit: u32) -> Result<String>;
    /// Metric-derived health summary.
    async fn metric_health(&self) -> Result<String>;
    /// The controller's health board.
    async fn controller_board(&self) -> Result<String>;
    /// CI job status dump.
    async fn ci_job_status(&self) -> Result<String>;
    /// Current GitOps image tag listing.
    async fn gitops_tags(&self) -> Result<String>;
}

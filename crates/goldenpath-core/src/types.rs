use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Step catalogue ───────────────────────────────────────────────────────

/// The five pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepId {
    Merge,
    Build,
    Gitops,
    Deploy,
    Jenkins,
}

impl StepId {
    pub const ALL: [StepId; 5] = [
        StepId::Merge,
        StepId::Build,
        StepId::Gitops,
        StepId::Deploy,
        StepId::Jenkins,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Merge => "merge",
            StepId::Build => "build",
            StepId::Gitops => "gitops",
            StepId::Deploy => "deploy",
            StepId::Jenkins => "jenkins",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepId::Merge => "Git Merge",
            StepId::Build => "Image Check",
            StepId::Gitops => "Staging GitOps Update",
            StepId::Deploy => "Deploy Sync Status & Notify",
            StepId::Jenkins => "Trigger WAP+RESTAPI QA Jobs",
        }
    }

    pub fn desc(&self) -> &'static str {
        match self {
            StepId::Merge => "Source host merge · master -> pre-release branch",
            StepId::Build => "Registry verify + CI monitor if missing",
            StepId::Gitops => "Update image tags in YAML repo",
            StepId::Deploy => "Controller watch + alert",
            StepId::Jenkins => "Smoke + integration",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            StepId::Merge => "\u{2442}",
            StepId::Build => "\u{2699}",
            StepId::Gitops => "\u{27f2}",
            StepId::Deploy => "\u{238e}",
            StepId::Jenkins => "\u{26a1}",
        }
    }

    pub fn from_str(s: &str) -> Option<StepId> {
        StepId::ALL.iter().copied().find(|id| id.as_str() == s)
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Interrupted,
}

/// Coarse status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Degraded,
    Interrupted,
}

// ── Health ───────────────────────────────────────────────────────────────

/// Controller-reported application health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Health {
    Healthy,
    Progressing,
    Degraded,
    Missing,
    #[default]
    Unknown,
    Suspended,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Progressing => "Progressing",
            Health::Degraded => "Degraded",
            Health::Missing => "Missing",
            Health::Unknown => "Unknown",
            Health::Suspended => "Suspended",
        }
    }
}

// ── Per-service step results ─────────────────────────────────────────────

/// Outcome of one service's merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeState {
    #[default]
    Running,
    Success,
    #[serde(rename = "no-op")]
    NoOp,
    Failed,
}

/// Shared running/success/failed status for build and gitops entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SvcStatus {
    #[default]
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MergeStatus {
    pub name: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub master_sha: String,
    #[serde(default)]
    pub target_sha: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub status: MergeState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ecr_tag: String,
    #[serde(default)]
    pub ecr_repo: String,
    /// Tag currently deployed per the GitOps repo, for comparison in the UI.
    #[serde(default)]
    pub deployed_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    #[default]
    Checking,
    Exists,
    Missing,
    Monitoring,
    Building,
    JenkinsBuilt,
    JenkinsFailed,
    VerifyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BuildStatus {
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub status: SvcStatus,
    #[serde(default)]
    pub phase: BuildPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub jenkins_url: String,
    #[serde(default)]
    pub stages: Vec<StageInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GitopsPhase {
    #[default]
    Pending,
    Unchanged,
    Updated,
    Pushed,
    Missing,
    Error,
    PushFailed,
    VerifyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitopsStatus {
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_tag: Option<String>,
    #[serde(default)]
    pub status: SvcStatus,
    #[serde(default)]
    pub phase: GitopsPhase,
    #[serde(default)]
    pub message: String,
}

// ── Deploy / QA snapshots ────────────────────────────────────────────────

/// One controller application card shown during the deploy step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeployApp {
    pub name: String,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub sync: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageInfo {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub duration: String,
}

/// Terminal status of a watched CI job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Running,
    Success,
    Failed,
    Aborted,
    Unstable,
    /// Watch gave up while the job was still running. Not a step failure.
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JenkinsJob {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub build_num: i64,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub stages: Vec<StageInfo>,
    #[serde(default)]
    pub queue_duration: String,
    #[serde(default)]
    pub exec_duration: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub phase_detail: String,
}

// ── Logs ─────────────────────────────────────────────────────────────────

/// One-letter log kind alphabet: header, info, success, warning, error,
/// connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    #[serde(rename = "h")]
    Header,
    #[serde(rename = "i")]
    Info,
    #[serde(rename = "s")]
    Success,
    #[serde(rename = "w")]
    Warn,
    #[serde(rename = "e")]
    Error,
    #[serde(rename = "c")]
    Conn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "t")]
    pub ts: String,
    #[serde(rename = "k")]
    pub kind: LogKind,
    #[serde(rename = "x")]
    pub text: String,
    #[serde(rename = "s", default)]
    pub step: String,
}

// ── Remediation actions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    HardSync,
    RestartPods,
    RetryMerge,
    RetryBuild,
    RollbackImage,
    ClearCache,
}

impl ActionKind {
    pub fn from_str(s: &str) -> Option<ActionKind> {
        match s {
            "hard_sync" => Some(ActionKind::HardSync),
            "restart_pods" => Some(ActionKind::RestartPods),
            "retry_merge" => Some(ActionKind::RetryMerge),
            "retry_build" => Some(ActionKind::RetryBuild),
            "rollback_image" => Some(ActionKind::RollbackImage),
            "clear_cache" => Some(ActionKind::ClearCache),
            _ => None,
        }
    }

    /// Idempotent / low-risk actions eligible for auto-execution.
    pub fn safe_to_auto_execute(&self) -> bool {
        matches!(
            self,
            ActionKind::HardSync
                | ActionKind::RetryMerge
                | ActionKind::RetryBuild
                | ActionKind::ClearCache
                | ActionKind::RollbackImage
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Proposed,
    AutoExecuting,
    Executing,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub id: String,
    pub action: ActionKind,
    pub target: String,
    pub confidence: u8,
    pub reason: String,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default)]
    pub result: String,
}

// ── Timeline / metrics ───────────────────────────────────────────────────

/// One deploy-timeline event, kept for MTTR accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub ts: String,
    pub epoch: f64,
    pub elapsed_s: f64,
    pub event: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationStat {
    pub service: String,
    /// Seconds from GitOps push to first effective-Healthy; -1 if never reached.
    pub push_to_healthy_secs: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepTiming {
    pub start: String,
    pub dur_s: f64,
    pub dur: String,
    pub status: StepStatus,
}

// ── Runs ─────────────────────────────────────────────────────────────────

/// Run entry in the runs list, including per-step visualization data so
/// completed runs can be reviewed with the same UI as live ones.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunSummary {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "n", default)]
    pub num: u32,
    #[serde(rename = "st", default)]
    pub status: RunStatus,
    #[serde(rename = "dur", default)]
    pub duration: String,
    #[serde(rename = "t", default)]
    pub started_at: String,
    #[serde(rename = "by", default)]
    pub triggered_by: String,
    #[serde(default)]
    pub steps: HashMap<String, StepStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_statuses: Vec<MergeStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_statuses: Vec<BuildStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gitops_statuses: Vec<GitopsStatus>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub health_map: HashMap<String, Health>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deploy_apps: Vec<DeployApp>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub expected_tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jenkins_jobs: Vec<JenkinsJob>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub step_times: HashMap<String, StepTiming>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub propagation_stats: Vec<PropagationStat>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mttr_secs: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Durable per-run record appended to the run store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunRecord {
    pub id: String,
    pub num: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub finished_at: String,
    #[serde(default)]
    pub steps: HashMap<String, StepStatus>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub diagnostics: String,
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub health_map: HashMap<String, Health>,
    #[serde(default)]
    pub merge_statuses: Vec<MergeStatus>,
    #[serde(default)]
    pub build_statuses: Vec<BuildStatus>,
    #[serde(default)]
    pub gitops_statuses: Vec<GitopsStatus>,
    #[serde(default)]
    pub jenkins_jobs: Vec<JenkinsJob>,
    #[serde(default)]
    pub expected_tags: HashMap<String, String>,
    #[serde(default)]
    pub propagation_stats: Vec<PropagationStat>,
    #[serde(default)]
    pub mttr_secs: f64,
}

// ── Pause protocol ───────────────────────────────────────────────────────

/// Cross-session user decision while the pipeline is paused on a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseDecision {
    Retry,
    Proceed,
    Rollback,
    Abort,
}

impl PauseDecision {
    pub fn from_str(s: &str) -> Option<PauseDecision> {
        match s {
            "retry" => Some(PauseDecision::Retry),
            "proceed" => Some(PauseDecision::Proceed),
            "rollback" => Some(PauseDecision::Rollback),
            "abort" => Some(PauseDecision::Abort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PauseDecision::Retry => "retry",
            PauseDecision::Proceed => "proceed",
            PauseDecision::Rollback => "rollback",
            PauseDecision::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackDetail {
    pub service: String,
    pub failed_tag: String,
    pub rolled_back_to: String,
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_fixed() {
        let ids: Vec<&str> = StepId::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(ids, vec!["merge", "build", "gitops", "deploy", "jenkins"]);
    }

    #[test]
    fn step_id_round_trips_through_str() {
        for id in StepId::ALL {
            assert_eq!(StepId::from_str(id.as_str()), Some(id));
        }
        assert_eq!(StepId::from_str("bogus"), None);
    }

    #[test]
    fn merge_state_serializes_no_op_with_dash() {
        let json = serde_json::to_string(&MergeState::NoOp).unwrap();
        assert_eq!(json, "\"no-op\"");
        let back: MergeState = serde_json::from_str("\"no-op\"").unwrap();
        assert_eq!(back, MergeState::NoOp);
    }

    #[test]
    fn log_entry_uses_short_wire_keys() {
        let entry = LogEntry {
            ts: "10:00:00".into(),
            kind: LogKind::Success,
            text: "done".into(),
            step: "merge".into(),
        };
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&entry).unwrap()).unwrap();
        assert_eq!(v["t"], "10:00:00");
        assert_eq!(v["k"], "s");
        assert_eq!(v["x"], "done");
        assert_eq!(v["s"], "merge");
    }

    #[test]
    fn run_summary_uses_short_wire_keys() {
        let run = RunSummary {
            id: "r3".into(),
            num: 3,
            status: RunStatus::Running,
            duration: "\u{2014}".into(),
            started_at: "09:30:00".into(),
            ..Default::default()
        };
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&run).unwrap()).unwrap();
        assert_eq!(v["n"], 3);
        assert_eq!(v["st"], "running");
        assert_eq!(v["t"], "09:30:00");
    }

    #[test]
    fn restart_pods_is_not_auto_executable() {
        assert!(!ActionKind::RestartPods.safe_to_auto_execute());
        assert!(ActionKind::HardSync.safe_to_auto_execute());
        assert!(ActionKind::RollbackImage.safe_to_auto_execute());
    }

    #[test]
    fn run_record_round_trips() {
        let mut record = RunRecord {
            id: "r7".into(),
            num: 7,
            status: RunStatus::Degraded,
            duration: "4m02s".into(),
            ..Default::default()
        };
        record.steps.insert("merge".into(), StepStatus::Success);
        record.expected_tags.insert("alive".into(), "pre-release-tw-abc123def0".into());
        record.health_map.insert("alive".into(), Health::Degraded);

        let json = serde_json::to_string(&record).unwrap();
        let back: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num, 7);
        assert_eq!(back.status, RunStatus::Degraded);
        assert_eq!(back.steps["merge"], StepStatus::Success);
        assert_eq!(back.expected_tags["alive"], "pre-release-tw-abc123def0");
        assert_eq!(back.health_map["alive"], Health::Degraded);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::clock::{epoch_secs, ts};
use crate::registry::SharedState;
use crate::roster::Roster;
use crate::state::Snapshot;
use crate::types::{
    Health, LogEntry, LogKind, PropagationStat, RunStatus, StepId, StepStatus, TimelineEvent,
};

/// Log ring cap; overflow drops oldest entries.
pub const MAX_LOGS: usize = 500;

/// State owned by one browser session. The executor session mutates this and
/// publishes snapshots; observer sessions only mirror into it.
pub struct SessionInner {
    pub snap: Snapshot,

    // Session-local, never shared
    pub is_executor: bool,
    pub observer_polling: bool,
    pub last_shared_ver: u64,
    /// Same-session pause decision (the shared slot covers other sessions).
    pub pause_action: String,
    pub watch_running: bool,
    pub skip_jenkins_qa: bool,
    pub triggered_by: String,
    pub roster: Roster,
    pub lock_held: bool,

    // Deploy bookkeeping (executor only)
    pub deploy_timeline: Vec<TimelineEvent>,
    pub deploy_degraded_at: f64,
    pub cenpe_secs: f64,
    pub tag_pushed_at: HashMap<String, f64>,
    pub tag_healthy_at: HashMap<String, f64>,
    pub step_start_times: HashMap<String, f64>,
    pub step_end_times: HashMap<String, f64>,
}

impl SessionInner {
    pub fn new() -> Self {
        Self {
            snap: Snapshot::default(),
            is_executor: false,
            observer_polling: false,
            last_shared_ver: 0,
            pause_action: String::new(),
            watch_running: false,
            skip_jenkins_qa: false,
            triggered_by: String::new(),
            roster: Roster::default(),
            lock_held: false,
            deploy_timeline: Vec::new(),
            deploy_degraded_at: 0.0,
            cenpe_secs: 0.0,
            tag_pushed_at: HashMap::new(),
            tag_healthy_at: HashMap::new(),
            step_start_times: HashMap::new(),
            step_end_times: HashMap::new(),
        }
    }

    /// Append a log entry tagged with its step (ring capped at [`MAX_LOGS`]).
    pub fn log(&mut self, step: StepId, kind: LogKind, text: impl Into<String>) {
        self.snap.logs.push(LogEntry {
            ts: ts(),
            kind,
            text: text.into(),
            step: step.as_str().to_string(),
        });
        let len = self.snap.logs.len();
        if len > MAX_LOGS {
            self.snap.logs.drain(..len - MAX_LOGS);
        }
    }

    /// Append a deploy-timeline event for MTTR accounting.
    pub fn tl(&mut self, event: &str, detail: impl Into<String>) {
        let now = epoch_secs();
        let elapsed = if self.deploy_degraded_at > 0.0 {
            ((now - self.deploy_degraded_at) * 10.0).round() / 10.0
        } else {
            0.0
        };
        self.deploy_timeline.push(TimelineEvent {
            ts: ts(),
            epoch: now,
            elapsed_s: elapsed,
            event: event.to_string(),
            detail: detail.into(),
        });
    }

    pub fn step_status(&self, step: StepId) -> StepStatus {
        self.snap
            .current_steps
            .get(step.as_str())
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    pub fn set_step_status(&mut self, step: StepId, status: StepStatus) {
        self.snap
            .current_steps
            .insert(step.as_str().to_string(), status);
    }

    /// Copy current step statuses and visualization data into the run's entry
    /// in the runs list (and the active-run mirror).
    pub fn sync_active_run(&mut self, run_id: &str) {
        let steps = self.snap.current_steps.clone();
        let merge = self.snap.merge_statuses.clone();
        let build = self.snap.build_statuses.clone();
        let gitops = self.snap.gitops_statuses.clone();
        let health = self.snap.health_map.clone();
        let apps = self.snap.deploy_apps.clone();
        let tags = self.snap.expected_tags.clone();
        let jobs = self.snap.jenkins_jobs.clone();

        if let Some(run) = self.snap.run_mut(run_id) {
            run.steps = steps;
            run.merge_statuses = merge;
            run.build_statuses = build;
            run.gitops_statuses = gitops;
            run.health_map = health;
            run.deploy_apps = apps;
            run.expected_tags = tags;
            run.jenkins_jobs = jobs;
            let updated = run.clone();
            if self.snap.active_run_id == run_id {
                self.snap.active_run = Some(updated);
            }
        }
    }

    /// Per-service image propagation times (push → Healthy). Services that
    /// pushed but never converged report -1.
    pub fn compute_propagation_stats(&self) -> Vec<PropagationStat> {
        let mut stats = Vec::new();
        for svc in &self.snap.selected_services {
            let pushed = self.tag_pushed_at.get(svc).copied();
            let healthy = self.tag_healthy_at.get(svc).copied();
            match (pushed, healthy) {
                (Some(p), Some(h)) => stats.push(PropagationStat {
                    service: svc.clone(),
                    push_to_healthy_secs: ((h - p) * 10.0).round() / 10.0,
                    status: "healthy".into(),
                }),
                (Some(_), None) => stats.push(PropagationStat {
                    service: svc.clone(),
                    push_to_healthy_secs: -1.0,
                    status: self
                        .snap
                        .health_map
                        .get(svc)
                        .copied()
                        .unwrap_or(Health::Unknown)
                        .as_str()
                        .to_string(),
                }),
                _ => {}
            }
        }
        stats
    }

    /// Human-readable error summary for a failed step, from its per-service
    /// result list.
    pub fn build_step_error(&self, step: StepId) -> String {
        match step {
            StepId::Merge => {
                let msgs: Vec<String> = self
                    .snap
                    .merge_statuses
                    .iter()
                    .filter(|m| m.status == crate::types::MergeState::Failed)
                    .map(|m| {
                        format!(
                            "{}: {}",
                            m.name,
                            if m.message.is_empty() {
                                "unknown error"
                            } else {
                                m.message.as_str()
                            }
                        )
                    })
                    .collect();
                if msgs.is_empty() {
                    "merge error".into()
                } else {
                    msgs.join("; ")
                }
            }
            StepId::Build => {
                let msgs: Vec<String> = self
                    .snap
                    .build_statuses
                    .iter()
                    .filter(|b| b.status == crate::types::SvcStatus::Failed)
                    .map(|b| {
                        format!(
                            "{}: {}",
                            b.name,
                            if b.message.is_empty() {
                                "unknown error"
                            } else {
                                b.message.as_str()
                            }
                        )
                    })
                    .collect();
                if msgs.is_empty() {
                    "build error".into()
                } else {
                    msgs.join("; ")
                }
            }
            StepId::Gitops => {
                let msgs: Vec<String> = self
                    .snap
                    .gitops_statuses
                    .iter()
                    .filter(|g| g.status == crate::types::SvcStatus::Failed)
                    .map(|g| {
                        format!(
                            "{}: {}",
                            g.name,
                            if g.message.is_empty() {
                                "unknown error"
                            } else {
                                g.message.as_str()
                            }
                        )
                    })
                    .collect();
                if msgs.is_empty() {
                    "gitops error".into()
                } else {
                    msgs.join("; ")
                }
            }
            StepId::Deploy => {
                let degraded: Vec<&str> = self
                    .snap
                    .selected_services
                    .iter()
                    .filter(|s| self.snap.health_map.get(*s) != Some(&Health::Healthy))
                    .map(String::as_str)
                    .collect();
                if degraded.is_empty() {
                    "deploy health check failed".into()
                } else {
                    format!(
                        "{} app(s) not healthy: {}",
                        degraded.len(),
                        degraded.join(", ")
                    )
                }
            }
            StepId::Jenkins => {
                let failed: Vec<&str> = self
                    .snap
                    .jenkins_jobs
                    .iter()
                    .filter(|j| j.status != crate::types::JobStatus::Success)
                    .map(|j| j.label.as_str())
                    .collect();
                if failed.is_empty() {
                    "jenkins job error".into()
                } else {
                    format!("job(s) failed: {}", failed.join(", "))
                }
            }
        }
    }

    /// Restore state from a saved snapshot. A snapshot captured mid-run means
    /// the process died while executing: the run and its running steps are
    /// marked interrupted, and the local `is_running` stays false.
    pub fn restore_from(&mut self, mut saved: Snapshot) {
        let was_running = saved.is_running;
        let run_id = saved.active_run_id.clone();
        if was_running {
            for run in saved.runs_summary.iter_mut() {
                if run.id == run_id {
                    run.status = RunStatus::Interrupted;
                    for status in run.steps.values_mut() {
                        if *status == StepStatus::Running {
                            *status = StepStatus::Interrupted;
                        }
                    }
                    saved.active_run = Some(run.clone());
                    break;
                }
            }
            for status in saved.current_steps.values_mut() {
                if *status == StepStatus::Running {
                    *status = StepStatus::Interrupted;
                }
            }
            info!("Restored interrupted run {run_id} from live state");
        }
        saved.is_running = false;
        saved.live_step = String::new();
        let count = saved.runs_summary.len();
        self.snap = saved;
        info!("Restored {count} runs from live state");
    }

    /// Restore a past run's visualization data for review.
    pub fn select_run(&mut self, run_id: &str) {
        self.snap.active_run_id = run_id.to_string();
        let Some(run) = self.snap.run(run_id).cloned() else {
            return;
        };
        if !self.snap.is_running {
            self.snap.merge_statuses = run.merge_statuses.clone();
            self.snap.build_statuses = run.build_statuses.clone();
            self.snap.gitops_statuses = run.gitops_statuses.clone();
            self.snap.health_map = run.health_map.clone();
            self.snap.jenkins_jobs = run.jenkins_jobs.clone();
            self.snap.logs = run.logs.clone();
        }
        self.snap.active_run = Some(run);
    }
}

impl Default for SessionInner {
    fn default() -> Self {
        Self::new()
    }
}

/// One browser session: a state cell plus identity.
pub struct Session {
    pub id: String,
    pub state: tokio::sync::Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            state: tokio::sync::Mutex::new(SessionInner::new()),
        })
    }

    /// Initialize on page load: prefer the in-memory shared state (another
    /// session is live), then the disk snapshot, else start clean.
    pub async fn init_from(&self, shared: &SharedState, roster: Roster) {
        let mut inner = self.state.lock().await;
        inner.roster = roster;
        if !inner.snap.runs_summary.is_empty() {
            return; // already initialized
        }
        let (shared_snap, _) = shared.read();
        let saved = if shared_snap.runs_summary.is_empty() {
            shared.load_from_disk()
        } else {
            Some(shared_snap)
        };
        if let Some(saved) = saved {
            if !saved.runs_summary.is_empty() {
                inner.restore_from(saved);
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MergeState, MergeStatus, RunSummary};

    #[test]
    fn log_ring_is_capped() {
        let mut inner = SessionInner::new();
        for i in 0..(MAX_LOGS + 40) {
            inner.log(StepId::Merge, LogKind::Info, format!("line {i}"));
        }
        assert_eq!(inner.snap.logs.len(), MAX_LOGS);
        assert_eq!(inner.snap.logs[0].text, "line 40");
    }

    #[test]
    fn restore_marks_running_run_interrupted() {
        let mut saved = Snapshot::default();
        saved.is_running = true;
        saved.active_run_id = "r3".into();
        let mut run = RunSummary {
            id: "r3".into(),
            num: 3,
            status: RunStatus::Running,
            ..Default::default()
        };
        run.steps.insert("merge".into(), StepStatus::Success);
        run.steps.insert("gitops".into(), StepStatus::Running);
        saved.runs_summary.push(run);
        saved
            .current_steps
            .insert("gitops".into(), StepStatus::Running);

        let mut inner = SessionInner::new();
        inner.restore_from(saved);

        assert!(!inner.snap.is_running);
        assert_eq!(inner.snap.runs_summary[0].status, RunStatus::Interrupted);
        assert_eq!(
            inner.snap.runs_summary[0].steps["gitops"],
            StepStatus::Interrupted
        );
        assert_eq!(
            inner.snap.runs_summary[0].steps["merge"],
            StepStatus::Success
        );
        assert_eq!(
            inner.snap.current_steps["gitops"],
            StepStatus::Interrupted
        );
    }

    #[test]
    fn propagation_stats_use_minus_one_for_unconverged() {
        let mut inner = SessionInner::new();
        inner.snap.selected_services = vec!["a".into(), "b".into(), "c".into()];
        inner.tag_pushed_at.insert("a".into(), 100.0);
        inner.tag_healthy_at.insert("a".into(), 130.5);
        inner.tag_pushed_at.insert("b".into(), 100.0);
        inner.snap.health_map.insert("b".into(), Health::Degraded);
        // c never pushed — no entry at all

        let stats = inner.compute_propagation_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].service, "a");
        assert_eq!(stats[0].push_to_healthy_secs, 30.5);
        assert_eq!(stats[1].service, "b");
        assert_eq!(stats[1].push_to_healthy_secs, -1.0);
        assert_eq!(stats[1].status, "Degraded");
    }

    #[test]
    fn step_error_summarizes_failed_merges() {
        let mut inner = SessionInner::new();
        inner.snap.merge_statuses = vec![
            MergeStatus {
                name: "alive".into(),
                status: MergeState::Failed,
                message: "merge conflict".into(),
                ..Default::default()
            },
            MergeStatus {
                name: "wallet".into(),
                status: MergeState::Success,
                ..Default::default()
            },
        ];
        assert_eq!(inner.build_step_error(StepId::Merge), "alive: merge conflict");
    }

    #[test]
    fn deploy_error_lists_non_healthy_services() {
        let mut inner = SessionInner::new();
        inner.snap.selected_services = vec!["a".into(), "b".into()];
        inner.snap.health_map.insert("a".into(), Health::Healthy);
        inner.snap.health_map.insert("b".into(), Health::Degraded);
        assert_eq!(
            inner.build_step_error(StepId::Deploy),
            "1 app(s) not healthy: b"
        );
    }

    #[test]
    fn select_run_restores_viz_data_when_idle() {
        let mut inner = SessionInner::new();
        let mut run = RunSummary {
            id: "r1".into(),
            num: 1,
            ..Default::default()
        };
        run.merge_statuses.push(MergeStatus {
            name: "alive".into(),
            ..Default::default()
        });
        inner.snap.runs_summary.push(run);
        inner.select_run("r1");
        assert_eq!(inner.snap.active_run_id, "r1");
        assert_eq!(inner.snap.merge_statuses.len(), 1);
    }
}

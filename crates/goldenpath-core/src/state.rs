use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{
    BuildStatus, DeployApp, GitopsStatus, Health, JenkinsJob, LogEntry, MergeStatus,
    ProposedAction, RunSummary, StepStatus,
};

/// The canonical pipeline snapshot shared between sessions and persisted to
/// `live_state.json`. Field names (including the underscore-prefixed internal
/// ones) are the on-disk contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub runs_summary: Vec<RunSummary>,
    #[serde(default)]
    pub active_run_id: String,
    #[serde(default)]
    pub active_run: Option<RunSummary>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub live_step: String,
    #[serde(default)]
    pub merge_statuses: Vec<MergeStatus>,
    #[serde(default)]
    pub build_statuses: Vec<BuildStatus>,
    #[serde(default)]
    pub gitops_statuses: Vec<GitopsStatus>,
    #[serde(default)]
    pub health_map: HashMap<String, Health>,
    #[serde(default)]
    pub deploy_apps: Vec<DeployApp>,
    #[serde(default)]
    pub expected_tags: HashMap<String, String>,
    #[serde(default)]
    pub jenkins_jobs: Vec<JenkinsJob>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub diagnostics: String,
    #[serde(default)]
    pub proposed_actions: Vec<ProposedAction>,
    #[serde(default)]
    pub notify_sent: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub pause_error: String,
    #[serde(default)]
    pub pause_step: String,
    #[serde(default)]
    pub watch_count: u64,
    #[serde(rename = "_run_counter", default = "default_run_counter")]
    pub run_counter: u32,
    #[serde(rename = "_shas", default)]
    pub shas: HashMap<String, String>,
    #[serde(rename = "_current_steps", default)]
    pub current_steps: HashMap<String, StepStatus>,
    #[serde(rename = "_selected_services", default)]
    pub selected_services: Vec<String>,
    #[serde(rename = "_actually_merged", default)]
    pub actually_merged: Vec<String>,
}

fn default_run_counter() -> u32 {
    1
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            runs_summary: Vec::new(),
            active_run_id: String::new(),
            active_run: None,
            is_running: false,
            live_step: String::new(),
            merge_statuses: Vec::new(),
            build_statuses: Vec::new(),
            gitops_statuses: Vec::new(),
            health_map: HashMap::new(),
            deploy_apps: Vec::new(),
            expected_tags: HashMap::new(),
            jenkins_jobs: Vec::new(),
            logs: Vec::new(),
            diagnostics: String::new(),
            proposed_actions: Vec::new(),
            notify_sent: false,
            paused: false,
            pause_error: String::new(),
            pause_step: String::new(),
            watch_count: 0,
            run_counter: 1,
            shas: HashMap::new(),
            current_steps: HashMap::new(),
            selected_services: Vec::new(),
            actually_merged: Vec::new(),
        }
    }
}

impl Snapshot {
    /// Find a run in the summary list by id.
    pub fn run_mut(&mut self, run_id: &str) -> Option<&mut RunSummary> {
        self.runs_summary.iter_mut().find(|r| r.id == run_id)
    }

    pub fn run(&self, run_id: &str) -> Option<&RunSummary> {
        self.runs_summary.iter().find(|r| r.id == run_id)
    }
}

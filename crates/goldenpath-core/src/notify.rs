use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::roster::Roster;
use crate::types::{
    BuildStatus, GitopsStatus, Health, JenkinsJob, MergeStatus, PropagationStat, ProposedAction,
    RollbackDetail,
};

/// Notification payloads assembled by the engine. Delivery is a collaborator
/// concern (`crate::clients::Notifier`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    QaComplete {
        branch: String,
        jobs: Vec<JenkinsJob>,
        success: bool,
        roster: Roster,
        email_map: HashMap<String, String>,
        diagnostics: String,
        run_num: u32,
        triggered_by: String,
        failed_stages: Vec<String>,
    },
    DeploySuccess {
        branch: String,
        services: Vec<String>,
        health_map: HashMap<String, Health>,
        merge_statuses: Vec<MergeStatus>,
        build_statuses: Vec<BuildStatus>,
        gitops_statuses: Vec<GitopsStatus>,
        image_tags: HashMap<String, String>,
        run_num: u32,
        triggered_by: String,
        qa_next: bool,
        propagation_stats: Vec<PropagationStat>,
        roster: Roster,
        email_map: HashMap<String, String>,
    },
    DeployDegraded {
        branch: String,
        services: Vec<String>,
        health_map: HashMap<String, Health>,
        diagnostics: String,
        image_tags: HashMap<String, String>,
        run_num: u32,
        triggered_by: String,
        proposed_actions: Vec<ProposedAction>,
        cenpe_secs: f64,
        roster: Roster,
        email_map: HashMap<String, String>,
    },
    DeployAborted {
        branch: String,
        run_num: u32,
        triggered_by: String,
        roster: Roster,
        email_map: HashMap<String, String>,
    },
    DeployRolledBack {
        branch: String,
        details: Vec<RollbackDetail>,
        diagnostics: String,
        run_num: u32,
        triggered_by: String,
        roster: Roster,
        email_map: HashMap<String, String>,
    },
}

/// Names of stages that failed across the given QA jobs, as
/// `"Job Label: Stage (STATUS)"`.
pub fn failed_stage_names(jobs: &[JenkinsJob]) -> Vec<String> {
    let mut out = Vec::new();
    for job in jobs {
        for stage in &job.stages {
            if matches!(stage.status.as_str(), "FAILED" | "ABORTED" | "UNSTABLE") {
                out.push(format!("{}: {} ({})", job.label, stage.name, stage.status));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStatus, StageInfo};

    #[test]
    fn failed_stage_names_collects_only_terminal_failures() {
        let jobs = vec![JenkinsJob {
            name: "WAP_pre_release".into(),
            label: "WAP Pre-Release".into(),
            status: JobStatus::Failed,
            stages: vec![
                StageInfo {
                    id: "1".into(),
                    name: "Checkout".into(),
                    status: "SUCCESS".into(),
                    duration: "3s".into(),
                },
                StageInfo {
                    id: "2".into(),
                    name: "Smoke".into(),
                    status: "FAILED".into(),
                    duration: "1m".into(),
                },
            ],
            ..Default::default()
        }];
        let names = failed_stage_names(&jobs);
        assert_eq!(names, vec!["WAP Pre-Release: Smoke (FAILED)"]);
    }

    #[test]
    fn notification_kind_tags_are_snake_case() {
        let n = Notification::DeployAborted {
            branch: "pre-release-tw".into(),
            run_num: 2,
            triggered_by: "sam".into(),
            roster: Roster::default(),
            email_map: HashMap::new(),
        };
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&n).unwrap()).unwrap();
        assert_eq!(v["kind"], "deploy_aborted");
    }

    #[test]
    fn rollback_payload_carries_details() {
        let n = Notification::DeployRolledBack {
            branch: "pre-release-tw".into(),
            details: vec![RollbackDetail {
                service: "alive".into(),
                failed_tag: "pre-release-tw-bad0000000".into(),
                rolled_back_to: "pre-release-tw-00dd000000".into(),
            }],
            diagnostics: String::new(),
            run_num: 3,
            triggered_by: "sam".into(),
            roster: Roster::default(),
            email_map: HashMap::new(),
        };
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&n).unwrap()).unwrap();
        assert_eq!(v["details"][0]["service"], "alive");
        assert_eq!(v["details"][0]["rolled_back_to"], "pre-release-tw-00dd000000");
    }
}

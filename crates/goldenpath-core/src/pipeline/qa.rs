use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::warn;

use super::Pipeline;
use crate::clients::{CiBuildResult, StageUpdate};
use crate::notify::{failed_stage_names, Notification};
use crate::session::Session;
use crate::types::{JenkinsJob, JobStatus, LogKind, StepId, StepStatus};

/// The two QA jobs triggered after a healthy deploy.
const QA_JOBS: [(&str, &str); 2] = [
    ("WAP_pre_release", "WAP Pre-Release"),
    ("RESTAPI_pre_release", "RESTAPI Pre-Release"),
];

impl Pipeline {
    /// Trigger WAP+RESTAPI QA Jobs step: run both jobs in parallel with live
    /// stage streaming, then send the completion notification. A watch
    /// timeout (job still running) is reported but not a step failure.
    pub(crate) async fn run_jenkins_step(self: &Arc<Self>, sess: &Arc<Session>, run_id: &str) {
        let step = StepId::Jenkins;

        let skip = {
            let s = sess.state.lock().await;
            s.skip_jenkins_qa
        };
        if skip {
            let mut s = sess.state.lock().await;
            s.set_step_status(step, StepStatus::Skipped);
            s.snap.live_step = step.as_str().to_string();
            s.log(
                step,
                LogKind::Header,
                "\u{2500}\u{2500}\u{2500} Trigger WAP+RESTAPI QA Jobs \u{2500}\u{2500}\u{2500}",
            );
            let reason = if self.config.skip_jenkins_qa {
                "SKIP_JENKINS_QA=true"
            } else {
                "user toggle"
            };
            s.log(step, LogKind::Warn, format!("  \u{23ed} Skipped — {reason}"));
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, true);
            return;
        }

        {
            let mut s = sess.state.lock().await;
            s.set_step_status(step, StepStatus::Running);
            s.snap.live_step = step.as_str().to_string();
            s.log(
                step,
                LogKind::Header,
                "\u{2500}\u{2500}\u{2500} Trigger WAP+RESTAPI QA Jobs \u{2500}\u{2500}\u{2500}",
            );
            s.snap.jenkins_jobs = QA_JOBS
                .iter()
                .map(|(name, label)| JenkinsJob {
                    name: (*name).to_string(),
                    label: (*label).to_string(),
                    status: JobStatus::Running,
                    duration: "\u{2014}".into(),
                    ..Default::default()
                })
                .collect();
            s.log(
                step,
                LogKind::Info,
                format!("  Triggering {} parallel Jenkins jobs...", QA_JOBS.len()),
            );
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, true);
        }

        // Trigger both jobs with stage streaming; report each as it
        // completes.
        let mut set: JoinSet<(usize, CiBuildResult)> = JoinSet::new();
        for (idx, (name, _label)) in QA_JOBS.iter().enumerate() {
            let this = Arc::clone(self);
            let sess_updates = Arc::clone(sess);
            let job_name = (*name).to_string();

            let (tx, mut rx) = mpsc::unbounded_channel::<StageUpdate>();
            let stream_this = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    stream_this
                        .apply_qa_stage_update(&sess_updates, idx, update)
                        .await;
                }
            });

            set.spawn(async move {
                let result = this
                    .ci
                    .trigger_and_stream(&job_name, tx)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("trigger_and_stream {job_name}: {e}");
                        CiBuildResult {
                            status: JobStatus::Failed,
                            ..Default::default()
                        }
                    });
                (idx, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((idx, result)) = joined else { continue };
            let mut s = sess.state.lock().await;
            let label = QA_JOBS[idx].1;
            if let Some(job) = s.snap.jenkins_jobs.get_mut(idx) {
                job.status = result.status;
                job.build_num = result.build_num;
                job.duration = result.duration.clone();
                job.stages = result.stages.clone();
                job.queue_duration = result.queue_duration.clone();
                job.exec_duration = result.exec_duration.clone();
                if !result.url.is_empty() {
                    job.url = result.url.clone();
                }
            }
            let (icon, kind, status_label) = match result.status {
                JobStatus::Success => ("\u{2713}", LogKind::Success, "SUCCESS"),
                JobStatus::Timeout => ("\u{23f3}", LogKind::Warn, "STILL RUNNING (watch timeout)"),
                _ => ("\u{2715}", LogKind::Error, "FAILED"),
            };
            s.log(
                step,
                kind,
                format!(
                    "  {icon} {label} \u{2192} #{} ({}) {status_label}",
                    result.build_num, result.duration
                ),
            );
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);
        }

        // Aggregate: timeouts count as success for the step, with a warning.
        let failed_ctx = {
            let mut s = sess.state.lock().await;
            let all_ok = s
                .snap
                .jenkins_jobs
                .iter()
                .all(|j| j.status == JobStatus::Success);
            let timed_out: Vec<String> = s
                .snap
                .jenkins_jobs
                .iter()
                .filter(|j| j.status == JobStatus::Timeout)
                .map(|j| j.label.clone())
                .collect();
            let failed: Vec<JenkinsJob> = s
                .snap
                .jenkins_jobs
                .iter()
                .filter(|j| !matches!(j.status, JobStatus::Success | JobStatus::Timeout))
                .cloned()
                .collect();

            if all_ok {
                s.log(
                    step,
                    LogKind::Success,
                    format!("  \u{2713} All {} QA jobs passed", QA_JOBS.len()),
                );
                s.set_step_status(step, StepStatus::Success);
            } else if failed.is_empty() {
                s.log(
                    step,
                    LogKind::Warn,
                    format!(
                        "  \u{23f3} {} job(s) still running (watch timeout): {}",
                        timed_out.len(),
                        timed_out.join(", ")
                    ),
                );
                s.log(step, LogKind::Warn, "  \u{2192} Check Jenkins directly for final results");
                s.set_step_status(step, StepStatus::Success);
            } else {
                let mut names: Vec<String> =
                    failed.iter().map(|j| j.label.clone()).collect();
                names.extend(timed_out.iter().cloned());
                s.log(
                    step,
                    LogKind::Error,
                    format!("  \u{2715} {} job(s) failed: {}", failed.len(), names.join(", ")),
                );
                s.set_step_status(step, StepStatus::Failed);
            }
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);

            if failed.is_empty() {
                None
            } else {
                let mut ctx = format!("Failed Jenkins jobs ({}):\n", failed.len());
                for j in &failed {
                    ctx.push_str(&format!("  - {}: #{} ({})", j.label, j.build_num, j.duration));
                    if !j.url.is_empty() {
                        ctx.push_str(&format!("\n    URL: {}", j.url));
                    }
                    let fail_stages: Vec<String> = j
                        .stages
                        .iter()
                        .filter(|st| matches!(st.status.as_str(), "FAILED" | "ABORTED" | "UNSTABLE"))
                        .map(|st| format!("{} ({})", st.name, st.status))
                        .collect();
                    if !fail_stages.is_empty() {
                        ctx.push_str(&format!("\n    Failed stages: {}", fail_stages.join(", ")));
                    }
                    ctx.push('\n');
                }
                Some(ctx)
            }
        };

        if let Some(ctx) = failed_ctx.clone() {
            self.run_failure_diagnostics(sess, step, ctx).await;
        }

        // Completion notification, success or not.
        let notification = {
            let mut s = sess.state.lock().await;
            s.log(
                step,
                LogKind::Header,
                "\u{2500}\u{2500}\u{2500} Notification \u{2500}\u{2500}\u{2500}",
            );
            s.log(
                step,
                LogKind::Info,
                format!("  POST \u{2192} {}", self.config.notify_channel),
            );
            let jobs = s.snap.jenkins_jobs.clone();
            let success = jobs
                .iter()
                .all(|j| matches!(j.status, JobStatus::Success | JobStatus::Timeout));
            Notification::QaComplete {
                branch: self.config.target_branch.clone(),
                failed_stages: failed_stage_names(&jobs),
                jobs,
                success,
                roster: s.roster.clone(),
                email_map: s.roster.email_map(),
                diagnostics: s.snap.diagnostics.clone(),
                run_num: s.snap.active_run.as_ref().map(|r| r.num).unwrap_or(0),
                triggered_by: s.triggered_by.clone(),
            }
        };
        let success = matches!(
            &notification,
            Notification::QaComplete { success: true, .. }
        );
        if let Err(e) = self.notifier.send(&notification).await {
            warn!("qa completion notification failed: {e}");
        }

        let mut s = sess.state.lock().await;
        s.snap.notify_sent = true;
        if success {
            s.log(
                step,
                LogKind::Success,
                "  \u{2709} Sent \u{2705} WAP+RESTAPI QA complete \u{2014} all jobs passed",
            );
        } else {
            s.log(
                step,
                LogKind::Warn,
                "  \u{2709} Sent \u{26a0}\u{fe0f} WAP+RESTAPI QA complete \u{2014} some jobs failed",
            );
        }
        self.publish_snapshot(&s, false);
    }

    /// Live stage/queue update for one QA job card.
    async fn apply_qa_stage_update(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        idx: usize,
        update: StageUpdate,
    ) {
        let step = StepId::Jenkins;
        let mut s = sess.state.lock().await;
        let label = QA_JOBS.get(idx).map(|(_, l)| *l).unwrap_or_default();
        let Some(job) = s.snap.jenkins_jobs.get_mut(idx) else {
            return;
        };
        job.build_num = update.build_num;
        job.stages = update.stages.clone();
        job.phase = update.phase.clone();
        job.phase_detail = update.detail.clone();
        if update.build_num > 0 && !self.config.ci_qa_url.is_empty() {
            job.url = format!(
                "{}/job/{}/{}",
                self.config.ci_qa_url.trim_end_matches('/'),
                update.job,
                update.build_num
            );
        }
        if let Some(status) = terminal_status(&update.overall) {
            job.status = status;
        }

        match update.phase.as_str() {
            "queued" => {
                let q_dur = update
                    .stages
                    .iter()
                    .find(|st| st.id == "q")
                    .map(|st| st.duration.clone())
                    .unwrap_or_else(|| "\u{2014}".into());
                let detail = update.detail.clone();
                s.log(
                    step,
                    LogKind::Warn,
                    format!("  \u{23f3} {label} queued ({q_dur}) — {detail}"),
                );
            }
            "executing" => {
                let current = update
                    .stages
                    .iter()
                    .find(|st| st.status == "in_progress")
                    .map(|st| st.name.clone());
                if let Some(current) = current {
                    let detail = update.detail.clone();
                    let build = update.build_num;
                    s.log(
                        step,
                        LogKind::Info,
                        format!("  \u{238e} {label} #{build} \u{2192} {current} — {detail}"),
                    );
                }
            }
            _ => {}
        }
        self.publish_snapshot(&s, false);
    }
}

fn terminal_status(overall: &str) -> Option<JobStatus> {
    match overall {
        "success" => Some(JobStatus::Success),
        "failed" => Some(JobStatus::Failed),
        "aborted" => Some(JobStatus::Aborted),
        "unstable" => Some(JobStatus::Unstable),
        "timeout" => Some(JobStatus::Timeout),
        _ => None,
    }
}

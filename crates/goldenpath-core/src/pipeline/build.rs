use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::warn;

use super::Pipeline;
use crate::clients::{is_registry_auth_error, CiBuildResult, StageUpdate};
use crate::git::Git;
use crate::session::Session;
use crate::types::{
    BuildPhase, BuildStatus, JobStatus, LogKind, MergeState, StepId, StepStatus, SvcStatus,
};

/// Cap on waiting for a CI build of a missing image.
const CI_MONITOR_TIMEOUT_SECS: u64 = 600;
/// Registry re-probe attempts after a successful CI build.
const VERIFY_ATTEMPTS: u32 = 5;
const VERIFY_BACKOFF: Duration = Duration::from_secs(3);

impl Pipeline {
    /// Image Check step: verify every selected service's expected tag in the
    /// artifact registry; route missing merged services to CI monitoring.
    pub(crate) async fn run_build_step(self: &Arc<Self>, sess: &Arc<Session>, run_id: &str) {
        let step = StepId::Build;

        // Re-pull the working copy so current_tag values are fresh before
        // the registry is read.
        let git = Git::new(&self.config.gitops_repo_path);
        if git.is_repo() {
            if let Err(e) = git.pull_ff_only() {
                warn!("yaml-repo pull before registry refresh failed: {e}");
            }
        }
        let registry = self.refresh_services();

        let (selected, shas) = {
            let s = sess.state.lock().await;
            (s.snap.selected_services.clone(), s.snap.shas.clone())
        };
        let n = selected.len();

        {
            let mut s = sess.state.lock().await;
            s.set_step_status(step, StepStatus::Running);
            s.snap.live_step = step.as_str().to_string();
            s.log(step, LogKind::Header, "\u{2500}\u{2500}\u{2500} Image Check \u{2500}\u{2500}\u{2500}");
            s.snap.build_statuses = selected
                .iter()
                .map(|svc| BuildStatus {
                    name: svc.clone(),
                    tag: registry
                        .expected_tag(svc, shas.get(svc).map(String::as_str).unwrap_or("?")),
                    status: SvcStatus::Running,
                    phase: BuildPhase::Checking,
                    ..Default::default()
                })
                .collect();
            s.log(step, LogKind::Info, format!("  Checking registry for {n} services..."));
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, true);
        }

        let noop_set: Vec<String> = {
            let s = sess.state.lock().await;
            s.snap
                .merge_statuses
                .iter()
                .filter(|m| m.status == MergeState::NoOp)
                .map(|m| m.name.clone())
                .collect()
        };

        // ── Phase 1: probe the registry for every service ──
        let mut probes: JoinSet<(usize, bool, String)> = JoinSet::new();
        for (idx, svc) in selected.iter().enumerate() {
            let image_registry = Arc::clone(&self.image_registry);
            let svc = svc.clone();
            let tag = registry
                .expected_tag(&svc, shas.get(&svc).map(String::as_str).unwrap_or("unknown"));
            probes.spawn(async move {
                let (exists, msg) = image_registry.check_image(&svc, &tag).await;
                (idx, exists, msg)
            });
        }

        let mut exists_by_idx = vec![false; n];
        while let Some(joined) = probes.join_next().await {
            let Ok((idx, exists, msg)) = joined else {
                continue;
            };
            exists_by_idx[idx] = exists;
            let mut s = sess.state.lock().await;
            let Some(entry) = s.snap.build_statuses.get_mut(idx) else {
                continue;
            };
            let svc = entry.name.clone();
            let tag = entry.tag.clone();
            if exists {
                entry.status = SvcStatus::Success;
                entry.phase = BuildPhase::Exists;
                entry.message = "Image already in registry".into();
                s.log(
                    step,
                    LogKind::Success,
                    format!("  \u{2713} {svc} \u{2192} {tag} (registry \u{2713})"),
                );
            } else {
                let auth = is_registry_auth_error(&msg);
                entry.status = SvcStatus::Running;
                entry.phase = BuildPhase::Missing;
                entry.message = if auth {
                    "Registry auth unavailable \u{2014} will verify via Jenkins".into()
                } else {
                    "Image not in registry".into()
                };
                if auth {
                    s.log(
                        step,
                        LogKind::Warn,
                        format!("  \u{26a0} {svc}: registry auth unavailable, will verify via Jenkins"),
                    );
                }
            }
            self.publish_snapshot(&s, false);
        }

        let missing_all: Vec<(usize, String)> = selected
            .iter()
            .enumerate()
            .filter(|(idx, _)| !exists_by_idx[*idx])
            .map(|(idx, svc)| (idx, svc.clone()))
            .collect();
        let existed = exists_by_idx.iter().filter(|e| **e).count();
        let missing_noop: Vec<(usize, String)> = missing_all
            .iter()
            .filter(|(_, svc)| noop_set.contains(svc))
            .cloned()
            .collect();
        let missing_merged: Vec<(usize, String)> = missing_all
            .iter()
            .filter(|(_, svc)| !noop_set.contains(svc))
            .cloned()
            .collect();

        // A no-op service whose expected image is missing means no rebuild
        // will happen; the deployed tag is what keeps running.
        if !missing_noop.is_empty() {
            let mut s = sess.state.lock().await;
            for (idx, svc) in &missing_noop {
                let deployed = registry
                    .get(svc)
                    .map(|i| i.current_tag.clone())
                    .unwrap_or_default();
                let Some(entry) = s.snap.build_statuses.get_mut(*idx) else {
                    continue;
                };
                let expected = entry.tag.clone();
                let fallback = if deployed.is_empty() {
                    expected.clone()
                } else {
                    deployed
                };
                entry.tag = fallback.clone();
                entry.status = SvcStatus::Success;
                entry.phase = BuildPhase::Exists;
                entry.message =
                    format!("No-op — using deployed tag (expected {expected} not in registry)");
                s.log(
                    step,
                    LogKind::Warn,
                    format!("  ⚠ {svc}: expected {expected} not in registry, using deployed tag {fallback}"),
                );
            }
            self.publish_snapshot(&s, false);
        }

        {
            let mut s = sess.state.lock().await;
            if missing_all.is_empty() {
                s.log(
                    step,
                    LogKind::Success,
                    format!("  ✓ All {n} images verified in registry"),
                );
            } else if !missing_merged.is_empty() {
                let names: Vec<&str> = missing_merged.iter().map(|(_, s)| s.as_str()).collect();
                s.log(
                    step,
                    LogKind::Info,
                    format!(
                        "  {existed}/{n} cached. {} missing: {}",
                        missing_merged.len(),
                        names.join(", ")
                    ),
                );
                s.log(step, LogKind::Info, "  Monitoring Jenkins for missing images...");
            }
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);
        }

        // ── Phase 2: CI monitoring for newly-merged missing images ──
        if !missing_merged.is_empty() {
            let mut monitors = JoinSet::new();
            for (idx, svc) in missing_merged {
                let this = Arc::clone(self);
                let sess = Arc::clone(sess);
                let sha = shas.get(&svc).cloned().unwrap_or_else(|| "unknown".into());
                let tag = registry.expected_tag(&svc, &sha);
                let ci_repo = registry.ci_repo(&svc);
                monitors.spawn(async move {
                    this.monitor_missing_image(&sess, idx, svc, tag, ci_repo).await;
                });
            }
            while monitors.join_next().await.is_some() {}
        }

        // ── Aggregate ──
        let failed_ctx = {
            let mut s = sess.state.lock().await;
            let failed: Vec<(String, BuildPhase, String)> = s
                .snap
                .build_statuses
                .iter()
                .filter(|b| b.status == SvcStatus::Failed)
                .map(|b| (b.name.clone(), b.phase, b.message.clone()))
                .collect();
            let cached = s
                .snap
                .build_statuses
                .iter()
                .filter(|b| b.phase == BuildPhase::Exists)
                .count();
            let jenkins_built = s
                .snap
                .build_statuses
                .iter()
                .filter(|b| b.phase == BuildPhase::JenkinsBuilt)
                .count();

            if failed.is_empty() {
                s.log(
                    step,
                    LogKind::Success,
                    format!("  ✓ All {n} images verified ({cached} cached, {jenkins_built} via Jenkins)"),
                );
                s.set_step_status(step, StepStatus::Success);
                s.sync_active_run(run_id);
                self.publish_snapshot(&s, false);
                None
            } else {
                let names: Vec<&str> = failed.iter().map(|(n, _, _)| n.as_str()).collect();
                s.log(
                    step,
                    LogKind::Error,
                    format!("  ✕ {}/{n} failed: {}", failed.len(), names.join(", ")),
                );
                s.set_step_status(step, StepStatus::Failed);
                s.sync_active_run(run_id);
                self.publish_snapshot(&s, false);

                let mut ctx = format!("Failed builds ({}/{n}):\n", failed.len());
                for (name, phase, msg) in &failed {
                    ctx.push_str(&format!(
                        "  - {name}: phase={}, {msg}\n",
                        serde_json::to_string(phase).unwrap_or_default().trim_matches('"')
                    ));
                }
                Some(ctx)
            }
        };

        if let Some(ctx) = failed_ctx {
            self.run_failure_diagnostics(sess, step, ctx).await;
        }
    }

    /// Monitor the CI job building one missing image, then re-verify the
    /// registry (trusting CI when the registry itself is unreachable for
    /// auth reasons).
    async fn monitor_missing_image(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        idx: usize,
        svc: String,
        tag: String,
        ci_repo: String,
    ) {
        let step = StepId::Build;
        let base_url = self.ci.job_url(&svc, &ci_repo, None);

        {
            let mut s = sess.state.lock().await;
            if let Some(entry) = s.snap.build_statuses.get_mut(idx) {
                entry.status = SvcStatus::Running;
                entry.phase = BuildPhase::Monitoring;
                entry.message = "Waiting for Jenkins build...".into();
                entry.jenkins_url = base_url.clone();
            }
            s.log(
                step,
                LogKind::Info,
                format!("  \u{25cb} {svc}: monitoring Jenkins ({ci_repo})..."),
            );
            self.publish_snapshot(&s, false);
        }

        // Stage stream → live card updates.
        let (tx, mut rx) = mpsc::unbounded_channel::<StageUpdate>();
        let forward_sess = Arc::clone(sess);
        let forward_this = Arc::clone(self);
        let forward_svc = svc.clone();
        let forward_tag = tag.clone();
        let forward_ci_repo = ci_repo.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let url = forward_this.ci.job_url(
                    &forward_svc,
                    &forward_ci_repo,
                    Some(update.build_num),
                );
                let mut s = forward_sess.state.lock().await;
                if let Some(entry) = s.snap.build_statuses.get_mut(idx) {
                    entry.status = SvcStatus::Running;
                    entry.phase = BuildPhase::Building;
                    entry.message = update.detail.clone();
                    entry.jenkins_url = url;
                    entry.stages = update.stages.clone();
                    entry.tag = forward_tag.clone();
                }
                forward_this.publish_snapshot(&s, false);
            }
        });

        let result = self
            .ci
            .find_and_monitor_build(&svc, &ci_repo, tx, CI_MONITOR_TIMEOUT_SECS, true)
            .await
            .unwrap_or_else(|e| {
                warn!("find_and_monitor_build for {svc}: {e}");
                CiBuildResult::default()
            });
        forwarder.abort();

        let final_url = if result.url.is_empty() {
            base_url
        } else {
            result.url.clone()
        };

        if result.status == JobStatus::Success {
            {
                let mut s = sess.state.lock().await;
                s.log(
                    step,
                    LogKind::Info,
                    format!("  \u{25cb} {svc}: Jenkins image stage done, verifying registry..."),
                );
            }
            let mut verified = false;
            let mut auth_fallback = false;
            for _ in 0..VERIFY_ATTEMPTS {
                let (exists, msg) = self.image_registry.check_image(&svc, &tag).await;
                if exists {
                    verified = true;
                    break;
                }
                if is_registry_auth_error(&msg) {
                    // Registry unreachable for auth reasons — trust the CI
                    // success signal.
                    verified = true;
                    auth_fallback = true;
                    break;
                }
                tokio::time::sleep(VERIFY_BACKOFF).await;
            }

            let mut s = sess.state.lock().await;
            if verified {
                let detail = if auth_fallback {
                    format!("Jenkins #{} \u{2713} (registry unverified \u{2014} auth)", result.build_num)
                } else {
                    format!("Jenkins #{} \u{2192} registry \u{2713}", result.build_num)
                };
                if let Some(entry) = s.snap.build_statuses.get_mut(idx) {
                    entry.status = SvcStatus::Success;
                    entry.phase = BuildPhase::JenkinsBuilt;
                    entry.message = detail.clone();
                    entry.jenkins_url = final_url;
                    entry.stages = result.stages.clone();
                }
                s.log(step, LogKind::Success, format!("  \u{2713} {svc} \u{2192} {tag} ({detail})"));
            } else {
                if let Some(entry) = s.snap.build_statuses.get_mut(idx) {
                    entry.status = SvcStatus::Failed;
                    entry.phase = BuildPhase::VerifyFailed;
                    entry.message = format!("Jenkins OK but {tag} not in registry");
                    entry.jenkins_url = final_url;
                    entry.stages = result.stages.clone();
                }
                s.log(
                    step,
                    LogKind::Error,
                    format!("  \u{2715} {svc}: Jenkins #{} OK but {tag} not in registry", result.build_num),
                );
            }
            self.publish_snapshot(&s, false);
        } else {
            let mut s = sess.state.lock().await;
            if let Some(entry) = s.snap.build_statuses.get_mut(idx) {
                entry.status = SvcStatus::Failed;
                entry.phase = BuildPhase::JenkinsFailed;
                entry.message = "Jenkins build failed".into();
                entry.jenkins_url = final_url;
                entry.stages = result.stages.clone();
            }
            s.log(
                step,
                LogKind::Error,
                format!("  \u{2715} {svc}: Jenkins build failed ({})", result.duration),
            );
            self.publish_snapshot(&s, false);
        }
    }
}

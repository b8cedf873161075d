use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use super::{merge_message, Pipeline};
use crate::clients::MergeOutcome;
use crate::session::Session;
use crate::types::{LogKind, MergeState, MergeStatus, StepId, StepStatus};

impl Pipeline {
    /// Git Merge step: merge master into each selected service's pre-release
    /// branch, all in parallel through the source host's merge API.
    pub(crate) async fn run_merge_step(self: &Arc<Self>, sess: &Arc<Session>, run_id: &str) {
        let registry = self.refresh_services();
        let step = StepId::Merge;

        let (selected, merge_msg) = {
            let s = sess.state.lock().await;
            (
                s.snap.selected_services.clone(),
                merge_message(&s.triggered_by),
            )
        };

        // Per-service target branches, from the registry entry with the
        // global default as fallback.
        let svc_branches: HashMap<String, String> = selected
            .iter()
            .map(|svc| (svc.clone(), registry.target_branch(svc)))
            .collect();
        let mut branch_groups: HashMap<String, Vec<String>> = HashMap::new();
        for (svc, branch) in &svc_branches {
            branch_groups
                .entry(branch.clone())
                .or_default()
                .push(svc.clone());
        }

        {
            let mut s = sess.state.lock().await;
            s.set_step_status(step, StepStatus::Running);
            s.snap.live_step = step.as_str().to_string();
            s.log(step, LogKind::Header, "\u{2500}\u{2500}\u{2500} Git Merge \u{2500}\u{2500}\u{2500}");
            for (branch, svcs) in &branch_groups {
                s.log(
                    step,
                    LogKind::Info,
                    format!(
                        "  Merging master \u{2192} {branch} for {} services: {}",
                        svcs.len(),
                        svcs.join(", ")
                    ),
                );
            }
            s.snap.merge_statuses = selected
                .iter()
                .map(|svc| MergeStatus {
                    name: svc.clone(),
                    branch: svc_branches.get(svc).cloned().unwrap_or_default(),
                    status: MergeState::Running,
                    deployed_tag: registry
                        .get(svc)
                        .map(|i| i.current_tag.clone())
                        .unwrap_or_default(),
                    ..Default::default()
                })
                .collect();
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, true);
        }

        // Launch all merges in parallel, each with its own target branch;
        // report each as it completes.
        let mut set: JoinSet<(usize, MergeOutcome)> = JoinSet::new();
        for (idx, svc) in selected.iter().enumerate() {
            let host = Arc::clone(&self.host);
            let svc = svc.clone();
            let branch = svc_branches.get(&svc).cloned().unwrap_or_default();
            let message = merge_msg.clone();
            set.spawn(async move {
                let outcome = match host.merge_branch(&svc, &branch, &message).await {
                    Ok(o) => o,
                    Err(e) => MergeOutcome {
                        service: svc.clone(),
                        status: MergeState::Failed,
                        sha: String::new(),
                        message: e.to_string(),
                    },
                };
                (idx, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((idx, outcome)) = joined else {
                warn!("merge task join error");
                continue;
            };
            let mut s = sess.state.lock().await;
            let Some(entry) = s.snap.merge_statuses.get_mut(idx) else {
                continue;
            };
            entry.status = outcome.status;
            entry.sha = outcome.sha.clone();
            entry.message = outcome.message.clone();
            // Enrich with the expected image tag when a sha exists.
            if !outcome.sha.is_empty() {
                entry.ecr_tag = registry.expected_tag(&outcome.service, &outcome.sha);
                entry.ecr_repo = registry.ci_repo(&outcome.service);
            }
            let tag = entry.ecr_tag.clone();
            let repo = entry.ecr_repo.clone();
            if !outcome.sha.is_empty() {
                s.snap
                    .shas
                    .insert(outcome.service.clone(), outcome.sha.clone());
            }

            let ok = outcome.status == MergeState::Success;
            let noop = outcome.status == MergeState::NoOp;
            let (icon, kind) = if ok || noop {
                ("\u{2713}", LogKind::Success)
            } else {
                ("\u{2715}", LogKind::Error)
            };
            let sha10: String = outcome.sha.chars().take(10).collect();
            let extra = if !sha10.is_empty() {
                format!(" \u{2192} {sha10}")
            } else if !outcome.message.is_empty() {
                format!(" ({})", outcome.message)
            } else {
                String::new()
            };
            s.log(step, kind, format!("  {icon} {}{extra}", outcome.service));
            if !tag.is_empty() && (ok || noop) {
                s.log(step, LogKind::Info, format!("      \u{21b3} ECR: {repo}:{tag}"));
            }
            self.publish_snapshot(&s, false);
        }

        // Batch-fetch master + target HEAD shas for every service, then
        // backfill shas (and tags) for no-op merges from target_sha.
        let pairs: Vec<(String, String)> = selected
            .iter()
            .map(|svc| (svc.clone(), svc_branches.get(svc).cloned().unwrap_or_default()))
            .collect();
        match self.host.branch_heads(&pairs).await {
            Ok(heads) => {
                let mut s = sess.state.lock().await;
                for entry in s.snap.merge_statuses.iter_mut() {
                    if let Some(h) = heads.get(&entry.name) {
                        entry.master_sha = h.master_sha.clone();
                        entry.target_sha = h.target_sha.clone();
                    }
                }
                s.log(
                    step,
                    LogKind::Info,
                    format!("  Branch HEADs fetched for {} services", heads.len()),
                );

                // Every non-failed service gets a sha, no-op ones included.
                for svc in &selected {
                    if s.snap.shas.contains_key(svc) {
                        continue;
                    }
                    let target_sha = s
                        .snap
                        .merge_statuses
                        .iter()
                        .find(|m| m.name == *svc && m.status != MergeState::Failed)
                        .map(|m| m.target_sha.clone())
                        .unwrap_or_default();
                    if !target_sha.is_empty() {
                        s.snap.shas.insert(svc.clone(), target_sha);
                    }
                }

                let shas = s.snap.shas.clone();
                for entry in s.snap.merge_statuses.iter_mut() {
                    if entry.status == MergeState::NoOp && entry.ecr_tag.is_empty() {
                        if let Some(sha) = shas.get(&entry.name) {
                            entry.ecr_tag = registry.expected_tag(&entry.name, sha);
                            entry.ecr_repo = registry.ci_repo(&entry.name);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Failed to fetch branch SHAs — continuing without them: {e}");
            }
        }

        // Aggregate the step result.
        let failed_ctx = {
            let mut s = sess.state.lock().await;
            let failed: Vec<(String, String)> = s
                .snap
                .merge_statuses
                .iter()
                .filter(|m| m.status == MergeState::Failed)
                .map(|m| (m.name.clone(), m.message.clone()))
                .collect();
            let actually_merged: Vec<String> = s
                .snap
                .merge_statuses
                .iter()
                .filter(|m| matches!(m.status, MergeState::Success | MergeState::NoOp))
                .map(|m| m.name.clone())
                .collect();
            let noop: Vec<String> = s
                .snap
                .merge_statuses
                .iter()
                .filter(|m| m.status == MergeState::NoOp)
                .map(|m| m.name.clone())
                .collect();
            s.snap.actually_merged = actually_merged.clone();
            let n = selected.len();

            if failed.is_empty() {
                s.log(
                    step,
                    LogKind::Success,
                    format!("  \u{2713} All {n} services merged successfully"),
                );
                if !actually_merged.is_empty() {
                    s.log(
                        step,
                        LogKind::Info,
                        format!(
                            "  \u{25cf} {} actually merged: {}",
                            actually_merged.len(),
                            actually_merged.join(", ")
                        ),
                    );
                }
                if !noop.is_empty() {
                    s.log(
                        step,
                        LogKind::Info,
                        format!("  \u{25cb} {} already up to date (no new commits)", noop.len()),
                    );
                }
                s.set_step_status(step, StepStatus::Success);
                s.sync_active_run(run_id);
                self.publish_snapshot(&s, false);
                None
            } else {
                let names: Vec<&str> = failed.iter().map(|(n, _)| n.as_str()).collect();
                s.log(
                    step,
                    LogKind::Error,
                    format!("  \u{2715} {}/{n} merges failed: {}", failed.len(), names.join(", ")),
                );
                s.set_step_status(step, StepStatus::Failed);
                s.sync_active_run(run_id);
                self.publish_snapshot(&s, false);

                let mut ctx = format!("Failed merges ({}/{n}):\n", failed.len());
                for (name, msg) in &failed {
                    let msg = if msg.is_empty() { "unknown" } else { msg };
                    ctx.push_str(&format!("  - {name}: {msg}\n"));
                }
                Some(ctx)
            }
        };

        if let Some(ctx) = failed_ctx {
            self.run_failure_diagnostics(sess, step, ctx).await;
        }
    }
}

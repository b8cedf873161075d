use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::warn;

use super::{pushed_services, truncate, Pipeline, WatchOutcome};
use crate::clock::epoch_secs;
use crate::diagnostics::ensure_rollback_proposals;
use crate::notify::Notification;
use crate::session::Session;
use crate::types::{ActionStatus, DeployApp, Health, LogKind, StepId, StepStatus};

impl Pipeline {
    /// Deploy Sync Status step: mark everything Progressing, hard-sync the
    /// expected-tag services, then watch controller health with settle /
    /// timeout / retry policy.
    pub(crate) async fn run_deploy_step(self: &Arc<Self>, sess: &Arc<Session>, run_id: &str) {
        let step = StepId::Deploy;
        let max_retries = self.config.retry_max.max(1);
        let watch_timeout = self.config.deploy_watch_timeout_secs;

        let (selected, expected) = {
            let mut s = sess.state.lock().await;
            s.set_step_status(step, StepStatus::Running);
            s.snap.live_step = step.as_str().to_string();
            s.snap.notify_sent = false;
            s.log(
                step,
                LogKind::Header,
                "\u{2500}\u{2500}\u{2500} Deploy Sync Status (Controller Watch) \u{2500}\u{2500}\u{2500}",
            );
            let selected = s.snap.selected_services.clone();
            s.log(
                step,
                LogKind::Info,
                format!("  Watching {} apps via controller event stream...", selected.len()),
            );
            s.log(
                step,
                LogKind::Info,
                format!(
                    "  Retry policy: {max_retries} attempts, {}min timeout each",
                    watch_timeout / 60
                ),
            );

            // All cards visible at once, initially Progressing.
            s.snap.health_map = selected
                .iter()
                .map(|svc| (svc.clone(), Health::Progressing))
                .collect();
            s.snap.deploy_apps.clear();

            // Tag verification only for services that actually pushed; a
            // no-op service must not block on the controller's stale tag.
            let pushed = pushed_services(&s.snap);
            let expected: HashMap<String, String> = s
                .snap
                .build_statuses
                .iter()
                .filter(|b| pushed.contains(&b.name) && !b.tag.is_empty())
                .map(|b| (b.name.clone(), b.tag.clone()))
                .collect();
            s.snap.expected_tags = expected.clone();
            if expected.is_empty() {
                s.log(step, LogKind::Info, "  No new tags pushed — trusting controller health");
            } else {
                let mut names: Vec<&str> = expected.keys().map(String::as_str).collect();
                names.sort_unstable();
                s.log(
                    step,
                    LogKind::Info,
                    format!("  Tag verification enabled for: {}", names.join(", ")),
                );
            }
            s.snap.watch_count = 0;
            s.watch_running = true;
            s.log(
                step,
                LogKind::Warn,
                format!("  \u{238e} {} apps \u{2192} Progressing (OutOfSync)", selected.len()),
            );
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, true);
            (selected, expected)
        };

        // ── Hard sync the services with new tags ──
        if !expected.is_empty() {
            {
                let mut s = sess.state.lock().await;
                s.log(
                    step,
                    LogKind::Header,
                    "─── Hard Sync (new tags pushed) ───",
                );
            }
            let prefix = self.config.app_prefix();
            for svc in expected.keys() {
                let app = format!("{prefix}{svc}");
                match self.controller.hard_sync(&app).await {
                    Ok(()) => {
                        let mut s = sess.state.lock().await;
                        s.log(step, LogKind::Info, format!("  ⟳ Hard sync triggered: {svc}"));
                    }
                    Err(e) => {
                        let mut s = sess.state.lock().await;
                        s.log(step, LogKind::Warn, format!("  ⟳ Hard sync failed for {svc}: {e}"));
                    }
                }
            }
            let mut s = sess.state.lock().await;
            s.log(
                step,
                LogKind::Success,
                format!("  ✓ Hard sync triggered for {} services", expected.len()),
            );
            self.publish_snapshot(&s, false);
        }

        // ── Retry loop ──
        for attempt in 1..=max_retries {
            {
                let mut s = sess.state.lock().await;
                s.log(
                    step,
                    LogKind::Header,
                    format!(
                        "\u{2500}\u{2500}\u{2500} Attempt {attempt}/{max_retries} (timeout {}min) \u{2500}\u{2500}\u{2500}",
                        watch_timeout / 60
                    ),
                );
                s.log(step, LogKind::Info, "  Fetching current app state from controller...");
            }

            // Initial state before the stream delivers anything.
            match self.controller.list_applications().await {
                Ok(apps) => {
                    let mut s = sess.state.lock().await;
                    self.apply_app_list(&mut s, &apps, true);
                    let healthy = s
                        .snap
                        .health_map
                        .values()
                        .filter(|h| **h == Health::Healthy)
                        .count();
                    s.snap.watch_count += 1;
                    s.log(
                        step,
                        LogKind::Info,
                        format!("  Initial state: {healthy}/{} healthy", selected.len()),
                    );
                    self.publish_snapshot(&s, false);
                }
                Err(e) => warn!("Failed to fetch initial controller state: {e}"),
            }

            let outcome = self.deploy_watch_loop(sess, run_id, watch_timeout).await;

            match outcome {
                WatchOutcome::Healthy => {
                    self.handle_all_healthy(sess, run_id).await;
                    return;
                }
                WatchOutcome::Settled => {
                    {
                        let mut s = sess.state.lock().await;
                        let (healthy, degraded) = health_split(&s, &selected);
                        s.log(
                            step,
                            LogKind::Warn,
                            format!(
                                "  \u{26a0} All services settled — {healthy}/{} healthy, {} degraded: {}",
                                selected.len(),
                                degraded.len(),
                                degraded.join(", ")
                            ),
                        );
                        s.log(
                            step,
                            LogKind::Warn,
                            "  \u{2192} Skipping retries — proceeding to diagnostics",
                        );
                    }
                    self.handle_deploy_degraded(sess, run_id).await;
                    return;
                }
                WatchOutcome::Timeout => {
                    let (healthy, degraded) = {
                        let s = sess.state.lock().await;
                        health_split(&s, &selected)
                    };
                    if attempt < max_retries {
                        let mut s = sess.state.lock().await;
                        s.log(
                            step,
                            LogKind::Warn,
                            format!(
                                "  \u{26a0} Attempt {attempt}/{max_retries} timed out — {healthy}/{} healthy, {} degraded: {}",
                                selected.len(),
                                degraded.len(),
                                degraded.join(", ")
                            ),
                        );
                        s.log(step, LogKind::Info, "  Retrying in 2s...");
                        s.sync_active_run(run_id);
                        self.publish_snapshot(&s, false);
                        drop(s);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    } else {
                        {
                            let mut s = sess.state.lock().await;
                            s.log(
                                step,
                                LogKind::Error,
                                format!(
                                    "  \u{2715} All {max_retries} attempts exhausted — {healthy}/{} healthy, {} degraded: {}",
                                    selected.len(),
                                    degraded.len(),
                                    degraded.join(", ")
                                ),
                            );
                        }
                        self.handle_deploy_degraded(sess, run_id).await;
                        return;
                    }
                }
            }
        }
    }

    /// Fold a full controller app list into the session's health map and
    /// deploy cards, applying the tag-mismatch override. Logs transitions
    /// when `log_state` is set.
    pub(crate) fn apply_app_list(
        &self,
        s: &mut crate::session::SessionInner,
        apps: &[crate::clients::AppStatus],
        log_state: bool,
    ) {
        let prefix = self.config.app_prefix();
        let selected = s.snap.selected_services.clone();
        let expected = s.snap.expected_tags.clone();
        let mut health = s.snap.health_map.clone();

        for app in apps {
            let short = app.name.strip_prefix(&prefix).unwrap_or(&app.name).to_string();
            if !health.contains_key(&short) {
                continue;
            }
            let effective =
                super::watcher::effective_health(expected.get(&short), &app.tag, app.health);
            if effective == Health::Healthy && !s.tag_healthy_at.contains_key(&short) {
                s.tag_healthy_at.insert(short.clone(), epoch_secs());
            }
            if log_state {
                if effective == Health::Progressing && app.health == Health::Healthy {
                    let exp = expected.get(&short).cloned().unwrap_or_default();
                    s.log(
                        StepId::Deploy,
                        LogKind::Warn,
                        format!(
                            "  ⎎ {short} → tag mismatch (expected: {exp}, current: {}) — forcing Progressing",
                            app.tag
                        ),
                    );
                } else {
                    let kind = if effective == Health::Healthy {
                        LogKind::Success
                    } else {
                        LogKind::Info
                    };
                    s.log(
                        StepId::Deploy,
                        kind,
                        format!("  ⎎ {short} → {} ({})", effective.as_str(), app.sync),
                    );
                }
            }
            health.insert(short, effective);
        }

        s.snap.health_map = health;
        s.snap.deploy_apps = apps
            .iter()
            .filter(|a| {
                let short = a.name.strip_prefix(&prefix).unwrap_or(&a.name);
                selected.iter().any(|x| x == short)
            })
            .map(|a| DeployApp {
                name: a.name.strip_prefix(&prefix).unwrap_or(&a.name).to_string(),
                health: a.health,
                sync: a.sync.clone(),
                tag: a.tag.clone(),
            })
            .collect();
    }

    /// Success path: log propagation stats, notify, mark the step done.
    pub(crate) async fn handle_all_healthy(self: &Arc<Self>, sess: &Arc<Session>, run_id: &str) {
        let step = StepId::Deploy;
        let notification = {
            let mut s = sess.state.lock().await;
            let n = s.snap.selected_services.len();
            s.log(step, LogKind::Success, format!("  \u{2713} All {n} apps healthy"));

            let prop = s.compute_propagation_stats();
            if !prop.is_empty() {
                s.log(
                    step,
                    LogKind::Header,
                    "\u{2500}\u{2500}\u{2500} Image Propagation (push \u{2192} Healthy) \u{2500}\u{2500}\u{2500}",
                );
                let mut times: Vec<f64> = Vec::new();
                for p in &prop {
                    if p.push_to_healthy_secs > 0.0 {
                        times.push(p.push_to_healthy_secs);
                        s.log(
                            step,
                            LogKind::Success,
                            format!("  \u{2713} {}: {}s", p.service, p.push_to_healthy_secs as u64),
                        );
                    } else {
                        s.log(
                            step,
                            LogKind::Warn,
                            format!("  \u{2717} {}: not tracked ({})", p.service, p.status),
                        );
                    }
                }
                if !times.is_empty() {
                    let avg = times.iter().sum::<f64>() / times.len() as f64;
                    let min = times.iter().cloned().fold(f64::INFINITY, f64::min);
                    let max = times.iter().cloned().fold(0.0_f64, f64::max);
                    s.log(
                        step,
                        LogKind::Info,
                        format!(
                            "  avg: {}s | min: {}s | max: {}s",
                            avg as u64, min as u64, max as u64
                        ),
                    );
                }
            }

            s.log(step, LogKind::Header, "\u{2500}\u{2500}\u{2500} Notification \u{2500}\u{2500}\u{2500}");
            let oncall = s.roster.oncall.clone();
            s.log(
                step,
                LogKind::Conn,
                format!("  POST \u{2192} {} (cc {oncall})", self.config.notify_channel),
            );
            s.log(
                step,
                LogKind::Success,
                format!("  \u{2709} Sent \u{2705} {n}/{n} healthy \u{2014} deploy complete"),
            );
            s.snap.notify_sent = true;
            s.set_step_status(step, StepStatus::Success);
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);

            Notification::DeploySuccess {
                branch: self.config.target_branch.clone(),
                services: s.snap.selected_services.clone(),
                health_map: s.snap.health_map.clone(),
                merge_statuses: s.snap.merge_statuses.clone(),
                build_statuses: s.snap.build_statuses.clone(),
                gitops_statuses: s.snap.gitops_statuses.clone(),
                image_tags: self.image_tags_from_shas(&s),
                run_num: s.snap.active_run.as_ref().map(|r| r.num).unwrap_or(0),
                triggered_by: s.triggered_by.clone(),
                qa_next: !s.skip_jenkins_qa,
                propagation_stats: s.compute_propagation_stats(),
                roster: s.roster.clone(),
                email_map: s.roster.email_map(),
            }
        };

        if let Err(e) = self.notifier.send(&notification).await {
            warn!("deploy success notification failed: {e}");
        }
    }

    /// Degraded path: last-resort hard sync, one re-check, diagnostics with
    /// guaranteed rollback proposals, degraded notification, then pause.
    pub(crate) async fn handle_deploy_degraded(self: &Arc<Self>, sess: &Arc<Session>, run_id: &str) {
        let step = StepId::Deploy;
        let prefix = self.config.app_prefix();

        let (selected, degraded) = {
            let mut s = sess.state.lock().await;
            let selected = s.snap.selected_services.clone();
            let degraded: Vec<String> = selected
                .iter()
                .filter(|svc| s.snap.health_map.get(*svc) != Some(&Health::Healthy))
                .cloned()
                .collect();
            // MTTR clock starts at first degraded detection.
            s.deploy_degraded_at = epoch_secs();
            s.deploy_timeline.clear();
            let joined = degraded.join(", ");
            s.tl(
                "degraded_detected",
                format!("{} degraded: {joined}", degraded.len()),
            );
            s.log(step, LogKind::Info, "  Waiting 2s for controller to settle before final retry...");
            (selected, degraded)
        };
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Last-resort hard sync, in parallel.
        if !degraded.is_empty() {
            {
                let mut s = sess.state.lock().await;
                s.log(
                    step,
                    LogKind::Header,
                    "─── Last-Resort Hard Sync (degraded services) ───",
                );
            }
            let mut set: JoinSet<(String, Result<(), String>)> = JoinSet::new();
            for svc in &degraded {
                let controller = Arc::clone(&self.controller);
                let app = format!("{prefix}{svc}");
                let svc = svc.clone();
                set.spawn(async move {
                    let result = controller.hard_sync(&app).await.map_err(|e| e.to_string());
                    (svc, result)
                });
            }
            let mut synced = Vec::new();
            let mut failed_sync = Vec::new();
            while let Some(joined) = set.join_next().await {
                let Ok((svc, result)) = joined else { continue };
                match result {
                    Ok(()) => synced.push(svc),
                    Err(e) => failed_sync.push((svc, e)),
                }
            }
            let mut s = sess.state.lock().await;
            for svc in &synced {
                s.log(step, LogKind::Info, format!("  ⟳ Hard sync: {svc}"));
            }
            for (svc, e) in &failed_sync {
                s.log(step, LogKind::Warn, format!("  ⟳ Hard sync failed for {svc}: {e}"));
            }
            s.log(step, LogKind::Info, "  Waiting 5s for hard sync to propagate...");
            let mut detail = format!("Synced: {}", synced.join(", "));
            if !failed_sync.is_empty() {
                let names: Vec<&str> = failed_sync.iter().map(|(s, _)| s.as_str()).collect();
                detail.push_str(&format!(" | Failed: {}", names.join(", ")));
            }
            s.tl("hard_sync", detail);
            self.publish_snapshot(&s, false);
        }

        tokio::time::sleep(Duration::from_secs(5)).await;

        // One re-check after the final sync.
        match self.controller.list_applications().await {
            Ok(apps) => {
                let mut s = sess.state.lock().await;
                self.apply_app_list(&mut s, &apps, false);
                s.snap.watch_count += 1;
                self.publish_snapshot(&s, false);
            }
            Err(e) => warn!("Failed to re-check controller after last-resort sync: {e}"),
        }

        let (healthy, degraded) = {
            let mut s = sess.state.lock().await;
            let (healthy, degraded) = health_split(&s, &selected);
            s.tl(
                "health_recheck",
                format!("{healthy}/{} healthy after hard sync", selected.len()),
            );
            (healthy, degraded)
        };

        if degraded.is_empty() {
            let mut s = sess.state.lock().await;
            let n = selected.len();
            s.tl("recovered", format!("All {n} apps recovered"));
            s.log(
                step,
                LogKind::Success,
                format!("  ✓ All {n} apps recovered after last-resort sync!"),
            );
            drop(s);
            self.handle_all_healthy(sess, run_id).await;
            return;
        }

        let (oncall, escalation, health_map) = {
            let mut s = sess.state.lock().await;
            s.log(
                step,
                LogKind::Error,
                format!(
                    "  ✗ Still {} degraded after last-resort sync: {}",
                    degraded.len(),
                    degraded.join(", ")
                ),
            );
            s.set_step_status(step, StepStatus::Failed);
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);
            (
                s.roster.oncall.clone(),
                s.roster.escalation.clone(),
                s.snap.health_map.clone(),
            )
        };

        // CEN-PE diagnostics + actions.
        let cenpe_start = epoch_secs();
        let health_json = serde_json::to_string(&health_map).unwrap_or_default();
        let ctx = format!(
            "Deploy health: {healthy}/{} Healthy\nDegraded services: {}\nHealth map: {health_json}",
            selected.len(),
            degraded.join(", ")
        );
        let diag = self.diagnostics.diagnose(step, &ctx).await;
        let mut actions = self.diagnostics.propose(step, &diag, &ctx, &health_map).await;
        self.auto_execute_actions(sess, step, &mut actions).await;
        ensure_rollback_proposals(&mut actions, &degraded);
        let cenpe_secs = ((epoch_secs() - cenpe_start) * 10.0).round() / 10.0;

        let auto_executed: Vec<_> = actions
            .iter()
            .filter(|a| a.status == ActionStatus::Done)
            .cloned()
            .collect();
        let still_proposed: Vec<_> = actions
            .iter()
            .filter(|a| a.status == ActionStatus::Proposed)
            .cloned()
            .collect();

        let notification = {
            let mut s = sess.state.lock().await;
            s.snap.diagnostics = diag.clone();
            s.snap.proposed_actions = actions.clone();
            s.cenpe_secs = cenpe_secs;
            s.tl("cenpe_diagnostics", format!("Diagnostics + actions in {cenpe_secs}s"));
            for a in &auto_executed {
                s.tl(
                    "action_auto_executed",
                    format!(
                        "{} → {}: {}",
                        super::action_name(a.action),
                        a.target,
                        truncate(&a.result, 60)
                    ),
                );
            }
            if !still_proposed.is_empty() {
                let summary = still_proposed
                    .iter()
                    .map(|a| format!("{}→{}", super::action_name(a.action), a.target))
                    .collect::<Vec<_>>()
                    .join(", ");
                s.tl(
                    "actions_proposed",
                    format!(
                        "{} awaiting approval: {}",
                        still_proposed.len(),
                        truncate(&summary, 120)
                    ),
                );
            }
            s.log(
                step,
                LogKind::Info,
                format!(
                    "  CEN-PE Agent Diagnostics ({cenpe_secs}s): {}",
                    truncate(&diag, 200)
                ),
            );
            if !auto_executed.is_empty() {
                s.log(
                    step,
                    LogKind::Info,
                    format!("  CEN-PE auto-executed {} action(s)", auto_executed.len()),
                );
                for a in &auto_executed {
                    s.log(
                        step,
                        LogKind::Info,
                        format!(
                            "    \u{2713} {} → {}: {}",
                            super::action_name(a.action),
                            a.target,
                            truncate(&a.result, 80)
                        ),
                    );
                }
            }
            if !still_proposed.is_empty() {
                s.log(
                    step,
                    LogKind::Info,
                    format!("  {} action(s) awaiting approval", still_proposed.len()),
                );
            }
            let rb_count = actions
                .iter()
                .filter(|a| a.action == crate::types::ActionKind::RollbackImage)
                .count();
            if rb_count > 0 {
                s.log(
                    step,
                    LogKind::Info,
                    format!(
                        "  \u{21ba} Rollback proposed for {rb_count} degraded service(s) — approve individually or click Rollback to roll back all"
                    ),
                );
            }

            s.log(
                step,
                LogKind::Header,
                "\u{2500}\u{2500}\u{2500} Notification (Degraded) \u{2500}\u{2500}\u{2500}",
            );
            s.log(
                step,
                LogKind::Conn,
                format!(
                    "  POST \u{2192} {} (cc {oncall} {escalation})",
                    self.config.notify_channel
                ),
            );
            s.log(
                step,
                LogKind::Warn,
                format!(
                    "  \u{2709} Sent \u{26a0} {healthy}/{} healthy, {} degraded \u{2014} retries exhausted",
                    selected.len(),
                    degraded.len()
                ),
            );
            s.snap.notify_sent = true;
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);

            Notification::DeployDegraded {
                branch: self.config.target_branch.clone(),
                services: selected.clone(),
                health_map: s.snap.health_map.clone(),
                diagnostics: diag.clone(),
                image_tags: self.image_tags_from_shas(&s),
                run_num: s.snap.active_run.as_ref().map(|r| r.num).unwrap_or(0),
                triggered_by: s.triggered_by.clone(),
                proposed_actions: actions.clone(),
                cenpe_secs,
                roster: s.roster.clone(),
                email_map: s.roster.email_map(),
            }
        };

        if let Err(e) = self.notifier.send(&notification).await {
            warn!("deploy degraded notification failed: {e}");
        }

        let mut s = sess.state.lock().await;
        s.tl("slack_sent", format!("Degraded alert sent to {}", self.config.notify_channel));
        s.tl("awaiting_user", "Waiting for Rollback / Retry / Force Proceed");
        s.log(
            step,
            LogKind::Error,
            "  \u{23f8} Waiting for user action (Rollback / Retry / Force Proceed)",
        );
        s.sync_active_run(run_id);
        self.publish_snapshot(&s, false);
    }
}

/// `(healthy_count, degraded_names)` for the selected services.
fn health_split(
    s: &crate::session::SessionInner,
    selected: &[String],
) -> (usize, Vec<String>) {
    let healthy = selected
        .iter()
        .filter(|svc| s.snap.health_map.get(*svc) == Some(&Health::Healthy))
        .count();
    let degraded = selected
        .iter()
        .filter(|svc| s.snap.health_map.get(*svc) != Some(&Health::Healthy))
        .cloned()
        .collect();
    (healthy, degraded)
}

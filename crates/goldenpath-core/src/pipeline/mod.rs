mod build;
mod deploy;
mod gitops;
mod merge;
mod qa;
mod watcher;

pub use watcher::WatchOutcome;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;
use tracing::{info, warn};

use crate::clock::{epoch_secs, fmt_duration, fmt_elapsed, ts};
use crate::clients::{CiWorker, DeployController, ImageRegistry, Notifier, SourceHost};
use crate::config::Config;
use crate::diagnostics::DiagnosticsEngine;
use crate::git::Git;
use crate::lock::LockManager;
use crate::notify::Notification;
use crate::registry::SharedState;
use crate::resilience::CircuitBreaker;
use crate::run_store::RunStore;
use crate::services::ServiceRegistry;
use crate::session::{Session, SessionInner};
use crate::state::Snapshot;
use crate::types::{
    ActionKind, ActionStatus, GitopsPhase, Health, LogKind, PauseDecision, ProposedAction,
    RollbackDetail, RunRecord, RunStatus, RunSummary, StepId, StepStatus, StepTiming,
};

/// Runs the pipeline kept in the runs list.
const RUNS_WINDOW: usize = 5;

/// The pipeline orchestration engine. One instance per process; exactly one
/// session at a time drives it (the executor), everyone else observes.
pub struct Pipeline {
    pub config: Arc<Config>,
    pub shared: Arc<SharedState>,
    pub host: Arc<dyn SourceHost>,
    pub image_registry: Arc<dyn ImageRegistry>,
    pub ci: Arc<dyn CiWorker>,
    pub controller: Arc<dyn DeployController>,
    pub notifier: Arc<dyn Notifier>,
    pub diagnostics: DiagnosticsEngine,
    pub run_store: RunStore,
    pub lock: LockManager,
    services: std::sync::Mutex<ServiceRegistry>,
    pub(crate) stream_breaker: CircuitBreaker,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        shared: Arc<SharedState>,
        host: Arc<dyn SourceHost>,
        image_registry: Arc<dyn ImageRegistry>,
        ci: Arc<dyn CiWorker>,
        controller: Arc<dyn DeployController>,
        notifier: Arc<dyn Notifier>,
        diagnostics: DiagnosticsEngine,
    ) -> Self {
        let run_store = RunStore::new(config.run_store_path());
        let lock = LockManager::new(
            Arc::clone(&host),
            config.country.clone(),
            config.lock_ttl_secs,
        );
        Self {
            config,
            shared,
            host,
            image_registry,
            ci,
            controller,
            notifier,
            diagnostics,
            run_store,
            lock,
            services: std::sync::Mutex::new(ServiceRegistry::default()),
            stream_breaker: CircuitBreaker::new("controller_stream", 3, Duration::from_secs(30)),
        }
    }

    // ── Service registry ──────────────────────────────────────────────────

    /// Re-scan the GitOps working copy and cache the result.
    pub(crate) fn refresh_services(&self) -> ServiceRegistry {
        let registry = ServiceRegistry::scan(
            std::path::Path::new(&self.config.gitops_repo_path),
            &self.config.country,
            &self.config.target_branch,
        );
        let cloned = registry.clone();
        match self.services.lock() {
            Ok(mut guard) => *guard = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
        cloned
    }

    pub(crate) fn services(&self) -> ServiceRegistry {
        match self.services.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Expected image tags keyed by service, from recorded merge shas.
    pub(crate) fn image_tags_from_shas(&self, inner: &SessionInner) -> HashMap<String, String> {
        let registry = self.services();
        let mut tags = HashMap::new();
        for svc in &inner.snap.selected_services {
            if let Some(sha) = inner.snap.shas.get(svc) {
                if !sha.is_empty() {
                    tags.insert(svc.clone(), registry.expected_tag(svc, sha));
                }
            }
        }
        tags
    }

    pub(crate) fn publish_snapshot(&self, inner: &SessionInner, force: bool) {
        self.shared.publish(inner.snap.clone(), force);
    }

    fn new_correlation(&self, run_id: &str, step: StepId) -> String {
        let suffix: u16 = rand::thread_rng().gen();
        format!("{run_id}-{}-{suffix:04x}", step.as_str())
    }

    // ── Start / executor election ─────────────────────────────────────────

    /// Execute the full five-step pipeline on this session.
    ///
    /// Election: take the executor gate, then recheck both the local and the
    /// shared `is_running` before claiming the run. A session that loses the
    /// race returns silently.
    pub async fn start(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        services: Option<Vec<String>>,
        skip_qa: bool,
        user: &str,
    ) -> Result<()> {
        let run_id;
        let run_num;
        {
            let _gate = self.shared.executor_gate().lock().await;
            let mut s = sess.state.lock().await;
            if s.snap.is_running {
                return Ok(());
            }
            let (shared_snap, _) = self.shared.read();
            if shared_snap.is_running {
                return Ok(());
            }
            if s.snap.runs_summary.is_empty() {
                if let Some(saved) = self.shared.load_from_disk() {
                    if !saved.runs_summary.is_empty() {
                        s.restore_from(saved);
                    }
                }
            }

            s.snap.selected_services = match services {
                Some(list) if !list.is_empty() => list,
                _ => self.config.services.clone(),
            };
            s.skip_jenkins_qa = skip_qa || self.config.skip_jenkins_qa;
            s.triggered_by = user.to_string();

            run_num = s.snap.run_counter;
            s.snap.run_counter += 1;
            run_id = format!("r{run_num}");
            s.snap.shas.clear();

            let mut init_steps = HashMap::new();
            for step in StepId::ALL {
                init_steps.insert(step.as_str().to_string(), StepStatus::Pending);
            }
            s.snap.current_steps = init_steps.clone();

            let new_run = RunSummary {
                id: run_id.clone(),
                num: run_num,
                status: RunStatus::Running,
                duration: "\u{2014}".into(),
                started_at: ts(),
                triggered_by: user.to_string(),
                steps: init_steps,
                ..Default::default()
            };
            s.snap.runs_summary.insert(0, new_run.clone());
            s.snap.runs_summary.truncate(RUNS_WINDOW);
            s.snap.active_run_id = run_id.clone();
            s.snap.active_run = Some(new_run);
            s.snap.is_running = true;
            s.is_executor = true;
            s.snap.live_step = String::new();
            s.snap.logs.clear();
            s.snap.paused = false;
            s.snap.pause_error.clear();
            s.snap.pause_step.clear();
            s.snap.diagnostics.clear();
            s.snap.proposed_actions.clear();
            s.snap.notify_sent = false;
            s.snap.health_map.clear();
            s.snap.watch_count = 0;
            s.snap.jenkins_jobs.clear();
            s.snap.merge_statuses.clear();
            s.snap.build_statuses.clear();
            s.snap.gitops_statuses.clear();
            s.snap.expected_tags.clear();
            s.snap.deploy_apps.clear();
            s.snap.actually_merged.clear();
            s.watch_running = false;
            s.pause_action.clear();
            s.deploy_timeline.clear();
            s.deploy_degraded_at = 0.0;
            s.cenpe_secs = 0.0;
            s.tag_pushed_at.clear();
            s.tag_healthy_at.clear();
            s.step_start_times.clear();
            s.step_end_times.clear();
            self.publish_snapshot(&s, true);
        }

        // Clear any stale abort signal from previous runs.
        self.shared.clear_abort();

        {
            let s = sess.state.lock().await;
            self.shared.publish_run_context(
                &run_id,
                &format!(
                    "Pipeline run #{run_num} started on branch {} by {} at {}. Services: {}.",
                    self.config.target_branch,
                    user_or(&s.triggered_by, "unknown"),
                    ts(),
                    s.snap.selected_services.join(", ")
                ),
            );
        }

        let start_time = epoch_secs();

        // Pull the GitOps working copy before the run starts.
        let git = Git::new(&self.config.gitops_repo_path);
        if git.is_repo() {
            match git.pull_ff_only() {
                Ok(result) if result.success() => info!("Pre-run yaml-repo git pull OK"),
                Ok(result) => warn!(
                    "Pre-run yaml-repo git pull warning: {}",
                    truncate(&result.combined_output(), 200)
                ),
                Err(e) => warn!("Pre-run yaml-repo git pull failed: {e}"),
            }
        }

        let mut idx = 0;
        let mut aborted = false;
        'steps: while idx < StepId::ALL.len() {
            let step = StepId::ALL[idx];

            if self.shared.abort_requested() {
                self.log_abort(sess, step, &run_id).await;
                aborted = true;
                break;
            }

            let cid = self.new_correlation(&run_id, step);
            self.shared.publish_correlation(&cid);

            {
                let mut s = sess.state.lock().await;
                s.step_start_times
                    .insert(step.as_str().to_string(), epoch_secs());
            }

            match step {
                StepId::Merge => self.run_merge_step(sess, &run_id).await,
                StepId::Build => self.run_build_step(sess, &run_id).await,
                StepId::Gitops => {
                    self.run_gitops_step(sess, &run_id, &cid).await;
                    let gitops_ok = {
                        let s = sess.state.lock().await;
                        s.step_status(StepId::Gitops) == StepStatus::Success
                    };
                    if gitops_ok {
                        self.acquire_deploy_lock(sess, &run_id).await;
                    }
                }
                StepId::Deploy => self.run_deploy_step(sess, &run_id).await,
                StepId::Jenkins => {
                    self.run_jenkins_step(sess, &run_id).await;
                    self.release_deploy_lock(sess, &run_id).await;
                }
            }

            {
                let mut s = sess.state.lock().await;
                s.step_end_times
                    .insert(step.as_str().to_string(), epoch_secs());
            }

            let status = {
                let s = sess.state.lock().await;
                s.step_status(step)
            };

            if status == StepStatus::Failed {
                loop {
                    {
                        let mut s = sess.state.lock().await;
                        let error_desc = s.build_step_error(step);
                        s.snap.paused = true;
                        s.snap.pause_step = step.as_str().to_string();
                        s.snap.pause_error = format!(
                            "{} failed: {error_desc}\nClick 'Force Proceed' to skip to the next step, or 'Retry' to re-run this step.",
                            step.label()
                        );
                        s.pause_action.clear();
                        s.log(
                            step,
                            LogKind::Warn,
                            format!(
                                "  \u{23f8} Pipeline PAUSED — {} failed. Waiting for user action...",
                                step.label()
                            ),
                        );
                        s.sync_active_run(&run_id);
                        self.publish_snapshot(&s, true);
                    }

                    let action = self.wait_for_pause_action(sess).await;

                    match action {
                        PauseDecision::Retry => {
                            {
                                let mut s = sess.state.lock().await;
                                self.clear_pause(&mut s);
                                s.set_step_status(step, StepStatus::Pending);
                                s.log(
                                    step,
                                    LogKind::Info,
                                    format!("  \u{21bb} Retrying {}...", step.label()),
                                );
                                if step == StepId::Deploy && !s.deploy_timeline.is_empty() {
                                    let by = user_or_default(&s.triggered_by).to_string();
                                    s.tl("user_action", format!("Retry by {by}"));
                                    self.log_deploy_timeline_summary(&mut s, "retry");
                                }
                                s.sync_active_run(&run_id);
                                self.publish_snapshot(&s, true);
                            }
                            continue 'steps; // same idx, re-run
                        }
                        PauseDecision::Proceed => {
                            {
                                let mut s = sess.state.lock().await;
                                self.clear_pause(&mut s);
                                s.log(
                                    step,
                                    LogKind::Warn,
                                    format!(
                                        "  \u{23e9} Force proceeding past {} (user override)",
                                        step.label()
                                    ),
                                );
                                if step == StepId::Deploy && !s.deploy_timeline.is_empty() {
                                    let by = user_or_default(&s.triggered_by).to_string();
                                    s.tl("user_action", format!("Force Proceed by {by}"));
                                    self.log_deploy_timeline_summary(&mut s, "proceed");
                                }
                                s.sync_active_run(&run_id);
                                self.publish_snapshot(&s, true);
                            }
                            idx += 1;
                            continue 'steps;
                        }
                        PauseDecision::Rollback if step == StepId::Deploy => {
                            if self.handle_rollback(sess, &run_id).await {
                                idx += 1;
                                continue 'steps;
                            }
                            // Some services still unhealthy — pause again.
                            continue;
                        }
                        PauseDecision::Abort | PauseDecision::Rollback => {
                            {
                                let mut s = sess.state.lock().await;
                                self.clear_pause(&mut s);
                                let by = user_or_default(&s.triggered_by).to_string();
                                s.log(
                                    step,
                                    LogKind::Error,
                                    format!("  \u{2718} Pipeline ABORTED by {by}"),
                                );
                                if step == StepId::Deploy && !s.deploy_timeline.is_empty() {
                                    s.tl("user_action", format!("Abort by {by}"));
                                    self.log_deploy_timeline_summary(&mut s, "abort");
                                }
                                s.sync_active_run(&run_id);
                                self.publish_snapshot(&s, true);
                            }
                            aborted = true;
                            break 'steps;
                        }
                    }
                }
            }

            if self.shared.abort_requested() {
                self.log_abort(sess, step, &run_id).await;
                aborted = true;
                break;
            }

            idx += 1;
        }

        self.finalize(sess, &run_id, run_num, start_time, aborted).await;
        Ok(())
    }

    async fn log_abort(&self, sess: &Arc<Session>, step: StepId, run_id: &str) {
        let mut s = sess.state.lock().await;
        let by = user_or_default(&s.triggered_by).to_string();
        s.log(
            step,
            LogKind::Error,
            format!("  \u{2718} Pipeline ABORTED by {by}"),
        );
        s.sync_active_run(run_id);
        self.publish_snapshot(&s, false);
    }

    fn clear_pause(&self, s: &mut SessionInner) {
        s.snap.paused = false;
        s.snap.pause_error.clear();
        s.snap.pause_step.clear();
        s.pause_action.clear();
    }

    /// Poll-wait until a user (any session) decides retry / proceed /
    /// rollback / abort.
    async fn wait_for_pause_action(&self, sess: &Arc<Session>) -> PauseDecision {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if self.shared.abort_requested() {
                return PauseDecision::Abort;
            }
            {
                let s = sess.state.lock().await;
                if let Some(decision) = PauseDecision::from_str(&s.pause_action) {
                    return decision;
                }
            }
            if let Some(decision) = self.shared.take_pause_action() {
                sess.state.lock().await.pause_action = decision.as_str().to_string();
                return decision;
            }
        }
    }

    // ── Rollback ──────────────────────────────────────────────────────────

    /// User-approved rollback of every non-healthy service. Returns `true`
    /// when the re-probe finds everything Healthy (step becomes success).
    async fn handle_rollback(&self, sess: &Arc<Session>, run_id: &str) -> bool {
        let (degraded, approved_by) = {
            let mut s = sess.state.lock().await;
            self.clear_pause(&mut s);
            let approved_by = user_or_default(&s.triggered_by).to_string();
            s.log(
                StepId::Deploy,
                LogKind::Info,
                format!("  \u{21ba} Rollback approved by {approved_by}"),
            );
            let degraded: Vec<String> = s
                .snap
                .selected_services
                .iter()
                .filter(|svc| s.snap.health_map.get(*svc) != Some(&Health::Healthy))
                .cloned()
                .collect();
            if !s.deploy_timeline.is_empty() {
                let joined = degraded.join(", ");
                s.tl("user_action", format!("Rollback by {approved_by} — {joined}"));
            }
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, true);
            (degraded, approved_by)
        };

        let mut details: Vec<RollbackDetail> = Vec::new();
        for svc in &degraded {
            {
                let mut s = sess.state.lock().await;
                s.log(StepId::Deploy, LogKind::Info, format!("  Rolling back {svc}..."));
                s.sync_active_run(run_id);
                self.publish_snapshot(&s, false);
            }
            match self
                .rollback_service(sess, svc, &approved_by, &format!("Rollback approved by {approved_by}"))
                .await
            {
                Ok(detail) => {
                    let mut s = sess.state.lock().await;
                    s.log(
                        StepId::Deploy,
                        LogKind::Success,
                        format!(
                            "  \u{2713} {svc}: {} \u{2192} {}",
                            detail.failed_tag, detail.rolled_back_to
                        ),
                    );
                    details.push(detail);
                }
                Err(e) => {
                    let mut s = sess.state.lock().await;
                    s.log(
                        StepId::Deploy,
                        LogKind::Warn,
                        format!("  \u{2717} {svc}: rollback failed \u{2014} {e}"),
                    );
                }
            }
        }

        if details.is_empty() {
            let mut s = sess.state.lock().await;
            s.log(
                StepId::Deploy,
                LogKind::Warn,
                "  No services could be rolled back",
            );
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);
            return false;
        }

        // Notify, then give the controller a moment to converge.
        let notification = {
            let mut s = sess.state.lock().await;
            s.log(
                StepId::Deploy,
                LogKind::Header,
                "\u{2500}\u{2500}\u{2500} Notification (Rolled Back) \u{2500}\u{2500}\u{2500}",
            );
            s.snap.notify_sent = true;
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);
            Notification::DeployRolledBack {
                branch: self.config.target_branch.clone(),
                details: details.clone(),
                diagnostics: s.snap.diagnostics.clone(),
                run_num: s.snap.active_run.as_ref().map(|r| r.num).unwrap_or(0),
                triggered_by: approved_by.clone(),
                roster: s.roster.clone(),
                email_map: s.roster.email_map(),
            }
        };
        if let Err(e) = self.notifier.send(&notification).await {
            warn!("rollback notification failed: {e}");
        }
        {
            let mut s = sess.state.lock().await;
            if !s.deploy_timeline.is_empty() {
                self.log_deploy_timeline_summary(&mut s, "rollback");
            }
            s.log(
                StepId::Deploy,
                LogKind::Info,
                "  Waiting 5s for controller to converge...",
            );
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Re-probe controller health once.
        let all_ok = match self.controller.list_applications().await {
            Ok(apps) => {
                let mut s = sess.state.lock().await;
                let prefix = self.config.app_prefix();
                let selected = s.snap.selected_services.clone();
                let mut health = HashMap::new();
                for app in &apps {
                    let short = app
                        .name
                        .strip_prefix(&prefix)
                        .unwrap_or(&app.name)
                        .to_string();
                    if selected.contains(&short) {
                        health.insert(short, app.health);
                    }
                }
                s.snap.health_map = health.clone();
                s.snap.deploy_apps = apps
                    .iter()
                    .filter(|a| {
                        let short = a.name.strip_prefix(&prefix).unwrap_or(&a.name);
                        selected.iter().any(|x| x == short)
                    })
                    .map(|a| crate::types::DeployApp {
                        name: a.name.strip_prefix(&prefix).unwrap_or(&a.name).to_string(),
                        health: a.health,
                        sync: a.sync.clone(),
                        tag: a.tag.clone(),
                    })
                    .collect();
                s.snap.watch_count += 1;
                selected
                    .iter()
                    .all(|svc| health.get(svc) == Some(&Health::Healthy))
            }
            Err(e) => {
                warn!("Re-check after rollback failed: {e}");
                false
            }
        };

        let mut s = sess.state.lock().await;
        if all_ok {
            s.log(
                StepId::Deploy,
                LogKind::Success,
                "  \u{2713} All apps healthy after rollback!",
            );
            s.set_step_status(StepId::Deploy, StepStatus::Success);
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);
            true
        } else {
            let still_bad: Vec<String> = s
                .snap
                .selected_services
                .iter()
                .filter(|svc| s.snap.health_map.get(*svc) != Some(&Health::Healthy))
                .cloned()
                .collect();
            let joined = still_bad.join(", ");
            let count = still_bad.len();
            s.log(
                StepId::Deploy,
                LogKind::Warn,
                format!("  Still {count} not healthy after rollback: {joined}"),
            );
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, false);
            false
        }
    }

    /// Roll one service back to its previous image tag, read from the GitOps
    /// repo, and push the rewrite.
    pub async fn rollback_service(
        &self,
        sess: &Arc<Session>,
        service: &str,
        user: &str,
        reason: &str,
    ) -> Result<RollbackDetail> {
        let (current_tag, previous_tag, roster) = {
            let s = sess.state.lock().await;
            let entry = s
                .snap
                .gitops_statuses
                .iter()
                .find(|g| g.name == service)
                .ok_or_else(|| anyhow!("no gitops record for {service}"))?;
            let previous = entry
                .old_tag
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| anyhow!("no previous tag recorded for {service}"))?;
            (entry.tag.clone(), previous, s.roster.clone())
        };

        let repo_path = std::path::Path::new(&self.config.gitops_repo_path);
        let (_folder, rel_path, _tag_path) =
            crate::services::values_location(service, &self.config.values_file());
        let file_path = repo_path.join(&rel_path);
        let changed = gitops::rewrite_tag_in_file(&file_path, &current_tag, &previous_tag)?;
        if !changed {
            return Err(anyhow!(
                "tag {current_tag} not found in {}",
                rel_path.display()
            ));
        }

        let git = Git::new(&self.config.gitops_repo_path);
        git.set_identity(
            &self.config.service_identity_name,
            &self.config.service_identity_email,
        )?;
        git.add(&[rel_path.to_string_lossy().into_owned()])?;
        let email = roster.resolve_email(user, &self.config.email_domain);
        let message =
            format!("rollback {service}: {current_tag} -> {previous_tag} ({reason})");
        let commit = git.commit(&message, Some((user, &email)))?;
        if !commit.success() {
            return Err(anyhow!("git commit failed: {}", commit.combined_output()));
        }
        let push = git.push("master")?;
        if !push.success() {
            return Err(anyhow!("git push failed: {}", push.combined_output()));
        }

        Ok(RollbackDetail {
            service: service.to_string(),
            failed_tag: current_tag,
            rolled_back_to: previous_tag,
        })
    }

    // ── Remediation actions ───────────────────────────────────────────────

    /// Execute one remediation action and describe the result.
    pub async fn execute_action(
        &self,
        sess: &Arc<Session>,
        action: &ProposedAction,
    ) -> Result<String> {
        let target = action.target.clone();
        match action.action {
            ActionKind::HardSync => {
                let prefix = self.config.app_prefix();
                let app = if prefix.is_empty() {
                    target.clone()
                } else {
                    format!("{prefix}{target}")
                };
                self.controller.hard_sync(&app).await?;
                Ok(format!("Hard sync triggered for {app}"))
            }
            ActionKind::RetryMerge => {
                let registry = self.services();
                let branch = registry.target_branch(&target);
                let user = sess.state.lock().await.triggered_by.clone();
                let message = merge_message(&user);
                let outcome = self.host.merge_branch(&target, &branch, &message).await?;
                Ok(format!(
                    "Merge result: {} — {}",
                    serde_json::to_string(&outcome.status).unwrap_or_default(),
                    outcome.message
                ))
            }
            ActionKind::RetryBuild => Ok(format!(
                "Retry build for {target}: queued for next pipeline run"
            )),
            ActionKind::RollbackImage => {
                let user = {
                    let s = sess.state.lock().await;
                    user_or(&s.triggered_by, "pipeline").to_string()
                };
                let reason = if action.reason.is_empty() {
                    "Deploy retries exhausted".to_string()
                } else {
                    action.reason.clone()
                };
                let detail = self.rollback_service(sess, &target, &user, &reason).await?;
                Ok(format!(
                    "ROLLBACK OK: {} {} -> {}",
                    detail.service, detail.failed_tag, detail.rolled_back_to
                ))
            }
            ActionKind::RestartPods => {
                Ok(format!("Pod restart for {target}: not yet implemented"))
            }
            ActionKind::ClearCache => {
                Ok(format!("Cache clear for {target}: not yet implemented"))
            }
        }
    }

    /// Run auto-executable proposals, attaching results to each entry.
    pub(crate) async fn auto_execute_actions(
        &self,
        sess: &Arc<Session>,
        step: StepId,
        actions: &mut [ProposedAction],
    ) {
        for action in actions.iter_mut() {
            if action.status != ActionStatus::AutoExecuting {
                continue;
            }
            {
                let mut s = sess.state.lock().await;
                s.log(
                    step,
                    LogKind::Info,
                    format!(
                        "  AUTO-EXEC [{}%] {} → {}: {}",
                        action.confidence,
                        action_name(action.action),
                        action.target,
                        action.reason
                    ),
                );
            }
            match self.execute_action(sess, action).await {
                Ok(result) => {
                    action.status = ActionStatus::Done;
                    action.result = result.clone();
                    let mut s = sess.state.lock().await;
                    s.log(step, LogKind::Info, format!("    ✓ {result}"));
                }
                Err(e) => {
                    action.status = ActionStatus::Failed;
                    action.result = e.to_string();
                    let mut s = sess.state.lock().await;
                    s.log(step, LogKind::Warn, format!("    ✗ Auto-exec failed: {e}"));
                }
            }
        }
    }

    /// Standard failure path for merge/build/gitops/jenkins: gather evidence,
    /// diagnose, propose, auto-execute, publish.
    pub(crate) async fn run_failure_diagnostics(
        &self,
        sess: &Arc<Session>,
        step: StepId,
        context: String,
    ) {
        let diag = self.diagnostics.diagnose(step, &context).await;
        let health_map = {
            let s = sess.state.lock().await;
            s.snap.health_map.clone()
        };
        let mut actions = self
            .diagnostics
            .propose(step, &diag, &context, &health_map)
            .await;
        self.auto_execute_actions(sess, step, &mut actions).await;

        let mut s = sess.state.lock().await;
        s.snap.diagnostics = diag.clone();
        s.snap.proposed_actions = actions.clone();
        s.log(
            step,
            LogKind::Info,
            format!("  CEN-PE Agent Diagnostics: {}", truncate(&diag, 200)),
        );
        if !actions.is_empty() {
            s.log(
                step,
                LogKind::Info,
                format!("  CEN-PE proposed {} actions", actions.len()),
            );
        }
        self.publish_snapshot(&s, false);
    }

    /// Mark a proposed action executing, run it, record the outcome. Serves
    /// the manual-approval path from any session.
    pub async fn approve_action(&self, sess: &Arc<Session>, action_id: &str) {
        let action = {
            let mut s = sess.state.lock().await;
            let Some(entry) = s
                .snap
                .proposed_actions
                .iter_mut()
                .find(|a| a.id == action_id)
            else {
                return;
            };
            entry.status = ActionStatus::Executing;
            let action = entry.clone();
            self.publish_snapshot(&s, false);
            action
        };

        let outcome = self.execute_action(sess, &action).await;

        let mut s = sess.state.lock().await;
        if let Some(entry) = s
            .snap
            .proposed_actions
            .iter_mut()
            .find(|a| a.id == action_id)
        {
            match outcome {
                Ok(result) => {
                    entry.status = ActionStatus::Done;
                    entry.result = result;
                }
                Err(e) => {
                    entry.status = ActionStatus::Failed;
                    entry.result = e.to_string();
                }
            }
        }
        self.publish_snapshot(&s, false);
    }

    pub async fn skip_action(&self, sess: &Arc<Session>, action_id: &str) {
        let mut s = sess.state.lock().await;
        if let Some(entry) = s
            .snap
            .proposed_actions
            .iter_mut()
            .find(|a| a.id == action_id)
        {
            entry.status = ActionStatus::Skipped;
        }
        self.publish_snapshot(&s, false);
    }

    // ── Deploy lock ───────────────────────────────────────────────────────

    async fn acquire_deploy_lock(&self, sess: &Arc<Session>, run_id: &str) {
        let country = &self.config.country;
        {
            let mut s = sess.state.lock().await;
            s.log(
                StepId::Gitops,
                LogKind::Info,
                format!("  Acquiring deploy lock for staging-{country}..."),
            );
        }
        let triggered_by = {
            let s = sess.state.lock().await;
            user_or(&s.triggered_by, "autotest").to_string()
        };
        match self.lock.acquire(run_id, &triggered_by).await {
            Ok((true, _)) => {
                let mut s = sess.state.lock().await;
                s.lock_held = true;
                s.log(
                    StepId::Gitops,
                    LogKind::Success,
                    format!(
                        "  \u{2713} Deploy lock acquired — values-staging-{country}.yaml protected"
                    ),
                );
                self.publish_snapshot(&s, false);
            }
            Ok((false, reason)) => {
                let mut s = sess.state.lock().await;
                s.log(
                    StepId::Gitops,
                    LogKind::Warn,
                    format!("  \u{26a0} Could not acquire deploy lock: {reason}"),
                );
                s.log(
                    StepId::Gitops,
                    LogKind::Warn,
                    "  \u{2192} Proceeding without lock — concurrent commits are possible",
                );
                self.publish_snapshot(&s, false);
            }
            Err(e) => {
                warn!("deploy lock acquire failed: {e}");
            }
        }

        let held = sess.state.lock().await.lock_held;
        if held {
            match self
                .lock
                .ensure_enforcement_workflow(&self.config.values_file())
                .await
            {
                Ok(true) => {
                    let mut s = sess.state.lock().await;
                    s.log(
                        StepId::Gitops,
                        LogKind::Info,
                        "  ✓ Lock enforcement workflow verified",
                    );
                }
                Ok(false) => {}
                Err(e) => tracing::debug!("lock enforcement workflow setup failed: {e}"),
            }
        }
    }

    async fn release_deploy_lock(&self, sess: &Arc<Session>, run_id: &str) {
        let held = sess.state.lock().await.lock_held;
        if !held {
            return;
        }
        let country = &self.config.country;
        let released = self.lock.release(run_id).await.unwrap_or(false);
        let mut s = sess.state.lock().await;
        s.lock_held = false;
        if released {
            s.log(
                StepId::Jenkins,
                LogKind::Success,
                format!("  \u{2713} Deploy lock released for staging-{country}"),
            );
        } else {
            s.log(
                StepId::Jenkins,
                LogKind::Warn,
                "  \u{26a0} Failed to release deploy lock — may need manual cleanup",
            );
        }
        self.publish_snapshot(&s, false);
    }

    // ── Timeline ──────────────────────────────────────────────────────────

    /// Log the deploy event timeline + MTTR (UI logs only, never notified).
    pub(crate) fn log_deploy_timeline_summary(&self, s: &mut SessionInner, user_action: &str) {
        if s.deploy_timeline.is_empty() {
            return;
        }
        let mttr = if s.deploy_degraded_at > 0.0 {
            epoch_secs() - s.deploy_degraded_at
        } else {
            0.0
        };
        let mttr_label = if mttr > 0.0 {
            format!("{}s", mttr as u64)
        } else {
            "\u{2014}".into()
        };
        let action_display = title_case(user_action);
        let user_name = user_or_default(&s.triggered_by).to_string();

        s.log(
            StepId::Deploy,
            LogKind::Header,
            format!(
                "─── Deploy Timeline — {action_display} by {user_name} (MTTR: {mttr_label}) ───"
            ),
        );
        for event in s.deploy_timeline.clone() {
            s.log(
                StepId::Deploy,
                LogKind::Info,
                format!(
                    "  +{} {} — {}",
                    fmt_elapsed(event.elapsed_s),
                    event.event,
                    truncate(&event.detail, 100)
                ),
            );
        }
    }

    // ── Finalization ──────────────────────────────────────────────────────

    async fn finalize(
        &self,
        sess: &Arc<Session>,
        run_id: &str,
        run_num: u32,
        start_time: f64,
        aborted: bool,
    ) {
        // Always release the lock if still held.
        {
            let held = sess.state.lock().await.lock_held;
            if held {
                self.release_deploy_lock(sess, run_id).await;
            }
        }
        self.shared.clear_abort();

        let notification = {
            let mut s = sess.state.lock().await;
            let elapsed = epoch_secs() - start_time;
            let duration = fmt_duration(elapsed);

            let all_success = s
                .snap
                .current_steps
                .values()
                .all(|st| *st == StepStatus::Success);
            let has_failed = s
                .snap
                .current_steps
                .values()
                .any(|st| *st == StepStatus::Failed);
            let final_status = if all_success {
                RunStatus::Success
            } else if aborted {
                RunStatus::Failed
            } else if has_failed {
                RunStatus::Degraded
            } else {
                RunStatus::Success
            };

            if aborted {
                for status in s.snap.current_steps.values_mut() {
                    if *status == StepStatus::Running {
                        *status = StepStatus::Failed;
                    }
                }
            }

            // Per-step timing records.
            let now = epoch_secs();
            let mut step_times: HashMap<String, StepTiming> = HashMap::new();
            for step in StepId::ALL {
                let key = step.as_str();
                let Some(&s_start) = s.step_start_times.get(key) else {
                    continue;
                };
                let s_end = s.step_end_times.get(key).copied().unwrap_or(now);
                let dur_s = ((s_end - s_start) * 10.0).round() / 10.0;
                let start_local = chrono::DateTime::from_timestamp(s_start as i64, 0)
                    .map(|dt| {
                        dt.with_timezone(&chrono::Local)
                            .format("%H:%M:%S")
                            .to_string()
                    })
                    .unwrap_or_default();
                step_times.insert(
                    key.to_string(),
                    StepTiming {
                        start: start_local,
                        dur_s,
                        dur: fmt_duration(dur_s),
                        status: s.step_status(step),
                    },
                );
            }

            let prop_stats = s.compute_propagation_stats();
            let mttr_secs = if s.deploy_degraded_at > 0.0 {
                ((epoch_secs() - s.deploy_degraded_at) * 10.0).round() / 10.0
            } else {
                0.0
            };

            // Completion summary into the log ring, tagged with the last
            // step that actually ran.
            let last_step = StepId::ALL
                .iter()
                .rev()
                .find(|step| {
                    matches!(
                        s.step_status(**step),
                        StepStatus::Success | StepStatus::Failed
                    )
                })
                .copied()
                .unwrap_or(StepId::Jenkins);

            let status_str = serde_json::to_string(&final_status)
                .unwrap_or_default()
                .trim_matches('"')
                .to_uppercase();
            s.log(
                last_step,
                LogKind::Header,
                format!("─── Run #{run_num} Complete — {status_str} ({duration}) ───"),
            );
            for step in StepId::ALL {
                let st = s.step_status(step);
                let Some(times) = step_times.get(step.as_str()).cloned() else {
                    continue;
                };
                let (icon, kind) = match st {
                    StepStatus::Success => ("✓", LogKind::Success),
                    StepStatus::Failed => ("✕", LogKind::Error),
                    StepStatus::Skipped => ("⏭", LogKind::Warn),
                    _ => ("—", LogKind::Info),
                };
                s.log(
                    last_step,
                    kind,
                    format!("  {icon} {:30} {:>8}  ({})", step.label(), times.dur, times.start),
                );
            }

            if !prop_stats.is_empty() {
                let healthy_times: Vec<f64> = prop_stats
                    .iter()
                    .map(|p| p.push_to_healthy_secs)
                    .filter(|t| *t > 0.0)
                    .collect();
                if !healthy_times.is_empty() {
                    let avg = healthy_times.iter().sum::<f64>() / healthy_times.len() as f64;
                    let min = healthy_times.iter().cloned().fold(f64::INFINITY, f64::min);
                    let max = healthy_times.iter().cloned().fold(0.0_f64, f64::max);
                    s.log(
                        last_step,
                        LogKind::Info,
                        format!(
                            "  Push→Healthy: avg {avg:.1}s · min {min:.1}s · max {max:.1}s"
                        ),
                    );
                    for p in &prop_stats {
                        let label = if p.push_to_healthy_secs > 0.0 {
                            format!("{}s", p.push_to_healthy_secs)
                        } else {
                            p.status.clone()
                        };
                        s.log(last_step, LogKind::Info, format!("    {}: {label}", p.service));
                    }
                }
            }

            if mttr_secs > 0.0 {
                s.log(last_step, LogKind::Warn, format!("  MTTR: {}s", mttr_secs as u64));
            }

            s.snap.is_running = false;
            s.is_executor = false;
            s.snap.live_step.clear();
            s.snap.paused = false;
            s.snap.pause_error.clear();
            s.snap.pause_step.clear();

            // Final run entry, logs embedded for post-run review.
            let final_logs = s.snap.logs.clone();
            let steps = s.snap.current_steps.clone();
            s.sync_active_run(run_id);
            if let Some(run) = s.snap.run_mut(run_id) {
                run.status = final_status;
                run.duration = duration.clone();
                run.logs = final_logs.clone();
                run.step_times = step_times.clone();
                run.propagation_stats = prop_stats.clone();
                run.mttr_secs = mttr_secs;
                let updated = run.clone();
                if s.snap.active_run_id == run_id {
                    s.snap.active_run = Some(updated);
                }
            }
            self.publish_snapshot(&s, true);

            let record = RunRecord {
                id: run_id.to_string(),
                num: run_num,
                status: final_status,
                duration,
                started_at: s
                    .snap
                    .run(run_id)
                    .map(|r| r.started_at.clone())
                    .unwrap_or_default(),
                finished_at: ts(),
                steps,
                logs: final_logs,
                diagnostics: s.snap.diagnostics.clone(),
                notified: s.snap.notify_sent,
                health_map: s.snap.health_map.clone(),
                merge_statuses: s.snap.merge_statuses.clone(),
                build_statuses: s.snap.build_statuses.clone(),
                gitops_statuses: s.snap.gitops_statuses.clone(),
                jenkins_jobs: s.snap.jenkins_jobs.clone(),
                expected_tags: s.snap.expected_tags.clone(),
                propagation_stats: prop_stats,
                mttr_secs,
            };
            if let Err(e) = self.run_store.save(&record) {
                warn!("failed to save run record: {e:#}");
            }

            aborted.then(|| Notification::DeployAborted {
                branch: self.config.target_branch.clone(),
                run_num,
                triggered_by: s.triggered_by.clone(),
                roster: s.roster.clone(),
                email_map: s.roster.email_map(),
            })
        };

        if let Some(n) = notification {
            if let Err(e) = self.notifier.send(&n).await {
                warn!("abort notification failed: {e}");
            }
        }

        self.shared.publish_correlation("");
    }
}

// ── Small helpers ─────────────────────────────────────────────────────────

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

pub(crate) fn user_or_default(user: &str) -> &str {
    user_or(user, "user")
}

pub(crate) fn user_or<'a>(user: &'a str, fallback: &'a str) -> &'a str {
    if user.is_empty() {
        fallback
    } else {
        user
    }
}

pub(crate) fn merge_message(user: &str) -> String {
    if user.is_empty() {
        String::new()
    } else {
        format!("{user} via qa-goldenpath")
    }
}

pub(crate) fn action_name(kind: ActionKind) -> String {
    serde_json::to_string(&kind)
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

fn title_case(s: &str) -> String {
    s.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Services whose GitOps update reached `pushed` this run.
pub(crate) fn pushed_services(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .gitops_statuses
        .iter()
        .filter(|g| g.phase == GitopsPhase::Pushed)
        .map(|g| g.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_case_replaces_underscores() {
        assert_eq!(title_case("proceed"), "Proceed");
        assert_eq!(title_case("force_proceed"), "Force Proceed");
    }

    #[test]
    fn merge_message_embeds_user() {
        assert_eq!(merge_message("sam"), "sam via qa-goldenpath");
        assert_eq!(merge_message(""), "");
    }

    #[test]
    fn action_name_is_snake_case() {
        assert_eq!(action_name(ActionKind::HardSync), "hard_sync");
        assert_eq!(action_name(ActionKind::RollbackImage), "rollback_image");
    }
}

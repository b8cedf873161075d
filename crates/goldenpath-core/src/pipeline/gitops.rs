use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use super::{truncate, user_or, Pipeline};
use crate::clock::epoch_secs;
use crate::git::Git;
use crate::services::{read_tag, values_location};
use crate::session::Session;
use crate::types::{GitopsPhase, GitopsStatus, LogKind, StepId, StepStatus, SvcStatus};

/// Rewrite `tag: OLD` to `tag: "NEW"` by literal text substitution so the
/// file's formatting survives. Tries the quoted spelling first. Returns
/// whether anything changed.
pub(crate) fn rewrite_tag_in_file(path: &Path, old_tag: &str, new_tag: &str) -> Result<bool> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let quoted = content.replace(
        &format!("tag: \"{old_tag}\""),
        &format!("tag: \"{new_tag}\""),
    );
    let rewritten = if quoted != content {
        quoted
    } else {
        let bare = content.replace(&format!("tag: {old_tag}"), &format!("tag: \"{new_tag}\""));
        if bare == content {
            return Ok(false);
        }
        bare
    };
    std::fs::write(path, rewritten).with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

impl Pipeline {
    /// Staging GitOps Update step: sync the working copy, rewrite image tags
    /// in values files, commit and push, then verify the push landed.
    pub(crate) async fn run_gitops_step(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        run_id: &str,
        correlation: &str,
    ) {
        let step = StepId::Gitops;
        let country = &self.config.country;
        let values_file = self.config.values_file();
        let repo_path = Path::new(&self.config.gitops_repo_path).to_path_buf();
        let registry = self.services();

        let (selected, shas) = {
            let mut s = sess.state.lock().await;
            s.set_step_status(step, StepStatus::Running);
            s.snap.live_step = step.as_str().to_string();
            s.log(
                step,
                LogKind::Header,
                "\u{2500}\u{2500}\u{2500} Staging GitOps Update \u{2500}\u{2500}\u{2500}",
            );
            s.sync_active_run(run_id);
            self.publish_snapshot(&s, true);
            (s.snap.selected_services.clone(), s.snap.shas.clone())
        };
        let n = selected.len();

        // Another pipeline holding a live lock blocks the whole step.
        match self.lock.check().await {
            Ok(Some(info)) if !info.is_expired(chrono::Utc::now().timestamp()) => {
                if info.run_id != run_id {
                    let mut s = sess.state.lock().await;
                    let age_min = info.age_secs(chrono::Utc::now().timestamp()) / 60;
                    s.log(
                        step,
                        LogKind::Warn,
                        format!(
                            "  \u{26a0} Deploy lock held by run {} ({}, {age_min}min ago)",
                            info.run_id, info.triggered_by
                        ),
                    );
                    s.log(
                        step,
                        LogKind::Warn,
                        format!(
                            "  \u{26a0} Another QA test is in progress for staging-{country} — values files are locked"
                        ),
                    );
                    s.log(
                        step,
                        LogKind::Error,
                        format!(
                            "  \u{2715} Cannot proceed — wait for run {} to complete or release the lock",
                            info.run_id
                        ),
                    );
                    s.set_step_status(step, StepStatus::Failed);
                    s.sync_active_run(run_id);
                    self.publish_snapshot(&s, false);
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("deploy lock check failed: {e}"),
        }

        // Per-service target tags, from the build step's entries (correct
        // for both merged and no-op services).
        {
            let mut s = sess.state.lock().await;
            let build_tags: HashMap<String, String> = s
                .snap
                .build_statuses
                .iter()
                .filter(|b| !b.tag.is_empty())
                .map(|b| (b.name.clone(), b.tag.clone()))
                .collect();
            s.snap.gitops_statuses = selected
                .iter()
                .map(|svc| {
                    let tag = build_tags.get(svc).cloned().unwrap_or_else(|| {
                        registry.expected_tag(
                            svc,
                            shas.get(svc).map(String::as_str).unwrap_or("?"),
                        )
                    });
                    GitopsStatus {
                        name: svc.clone(),
                        tag,
                        status: SvcStatus::Running,
                        phase: GitopsPhase::Pending,
                        ..Default::default()
                    }
                })
                .collect();
            s.log(step, LogKind::Info, format!("  Checking {n} services in YAML repo..."));
            s.log(step, LogKind::Info, "  Syncing working copy to origin/master...");
            self.publish_snapshot(&s, false);
        }

        // Hard-sync the working copy to origin/master before edits.
        let git = Git::new(&self.config.gitops_repo_path);
        let mut sync_ok = true;
        for op in ["fetch", "checkout", "reset"] {
            let result = match op {
                "fetch" => git.exec(&["fetch", "origin"]),
                "checkout" => git.exec(&["checkout", "master"]),
                _ => git.exec(&["reset", "--hard", "origin/master"]),
            };
            match result {
                Ok(r) if r.success() => {}
                Ok(r) => {
                    sync_ok = false;
                    let mut s = sess.state.lock().await;
                    s.log(
                        step,
                        LogKind::Error,
                        format!("  ✕ git {op}: {}", truncate(&r.combined_output(), 150)),
                    );
                }
                Err(e) => {
                    sync_ok = false;
                    let mut s = sess.state.lock().await;
                    s.log(step, LogKind::Error, format!("  git sync failed: {e}"));
                }
            }
        }
        if sync_ok {
            let mut s = sess.state.lock().await;
            s.log(step, LogKind::Success, "  ✓ Working copy synced to origin/master");
        }

        // ── Per-service tag rewrite ──
        let mut updated_services: Vec<String> = Vec::new();
        let mut updated_tags: HashMap<String, String> = HashMap::new();
        let mut updated_paths: HashMap<String, String> = HashMap::new();

        for (i, svc) in selected.iter().enumerate() {
            let new_tag = {
                let s = sess.state.lock().await;
                s.snap
                    .gitops_statuses
                    .get(i)
                    .map(|g| g.tag.clone())
                    .unwrap_or_default()
            };
            let (folder, rel_path, tag_path) = values_location(svc, &values_file);
            let file_path = repo_path.join(&rel_path);

            if !file_path.exists() {
                let mut s = sess.state.lock().await;
                if let Some(entry) = s.snap.gitops_statuses.get_mut(i) {
                    entry.status = SvcStatus::Failed;
                    entry.phase = GitopsPhase::Missing;
                    entry.message = format!("{folder}/{values_file} not found");
                }
                s.log(
                    step,
                    LogKind::Error,
                    format!("  \u{2715} {svc}: {folder}/{values_file} not found"),
                );
                self.publish_snapshot(&s, false);
                continue;
            }

            let outcome: Result<Option<String>> = (|| {
                let content = std::fs::read_to_string(&file_path)
                    .with_context(|| format!("read {}", file_path.display()))?;
                let doc: serde_yaml::Value = serde_yaml::from_str(&content)
                    .with_context(|| format!("parse {}", file_path.display()))?;
                let old_tag = read_tag(&doc, &tag_path).unwrap_or_default();
                if old_tag == new_tag {
                    return Ok(None);
                }
                if !old_tag.is_empty() {
                    rewrite_tag_in_file(&file_path, &old_tag, &new_tag)?;
                }
                Ok(Some(old_tag))
            })();

            let mut s = sess.state.lock().await;
            match outcome {
                Ok(None) => {
                    if let Some(entry) = s.snap.gitops_statuses.get_mut(i) {
                        entry.status = SvcStatus::Success;
                        entry.phase = GitopsPhase::Unchanged;
                        entry.message = "Tag already current".into();
                    }
                    s.log(step, LogKind::Info, format!("  \u{25cb} {svc}: tag already {new_tag}"));
                }
                Ok(Some(old_tag)) => {
                    updated_services.push(svc.clone());
                    updated_tags.insert(svc.clone(), new_tag.clone());
                    updated_paths
                        .insert(svc.clone(), rel_path.to_string_lossy().into_owned());
                    if let Some(entry) = s.snap.gitops_statuses.get_mut(i) {
                        entry.status = SvcStatus::Success;
                        entry.phase = GitopsPhase::Updated;
                        entry.old_tag = Some(old_tag.clone());
                        entry.message = format!("{old_tag} → {new_tag}");
                    }
                    s.log(step, LogKind::Success, format!("  ✓ {svc}: {old_tag} → {new_tag}"));
                }
                Err(e) => {
                    if let Some(entry) = s.snap.gitops_statuses.get_mut(i) {
                        entry.status = SvcStatus::Failed;
                        entry.phase = GitopsPhase::Error;
                        entry.message = truncate(&e.to_string(), 100);
                    }
                    s.log(step, LogKind::Error, format!("  \u{2715} {svc}: {e}"));
                }
            }
            self.publish_snapshot(&s, false);
        }

        // ── Commit, push, verify ──
        if !updated_services.is_empty() {
            let (author_name, author_email, run_num) = {
                let s = sess.state.lock().await;
                let author = user_or(&s.triggered_by, "autotest").to_string();
                let email = s.roster.resolve_email(&author, &self.config.email_domain);
                let num = s.snap.active_run.as_ref().map(|r| r.num).unwrap_or(0);
                (author, email, num)
            };

            let svc_list = updated_services.join(", ");
            let tag_lines = updated_services
                .iter()
                .map(|svc| format!("{svc}={}", updated_tags.get(svc).cloned().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join(" | ");
            let cid_suffix = if correlation.is_empty() {
                String::new()
            } else {
                format!(" [{correlation}]")
            };
            let commit_msg = format!(
                "qa-goldenpath #{run_num} staging-{country} ({author_name}): {svc_list} [{tag_lines}]{cid_suffix}"
            );

            {
                let mut s = sess.state.lock().await;
                s.log(
                    step,
                    LogKind::Info,
                    format!("  git add + commit ({} files)...", updated_services.len()),
                );
            }

            let push_result: Result<bool> = (|| {
                git.set_identity(
                    &self.config.service_identity_name,
                    &self.config.service_identity_email,
                )?;
                let files: Vec<String> = updated_services
                    .iter()
                    .filter_map(|svc| updated_paths.get(svc).cloned())
                    .collect();
                git.add(&files)?;
                let commit = git.commit(&commit_msg, Some((&author_name, &author_email)))?;
                if !commit.success() {
                    warn!("git commit: {}", truncate(&commit.combined_output(), 150));
                }
                let push = git.push("master")?;
                Ok(push.success())
            })();

            match push_result {
                Ok(true) => {
                    {
                        let mut s = sess.state.lock().await;
                        s.log(
                            step,
                            LogKind::Success,
                            format!(
                                "  \u{2713} Committed: staging-{country}: update {} image tags",
                                updated_services.len()
                            ),
                        );
                        s.log(step, LogKind::Info, "  Verifying push (git pull --ff-only)...");
                    }
                    // Pull fast-forward and confirm our run marker is the
                    // most recent commit.
                    let verify_ok = (|| -> Result<bool> {
                        git.pull_ff_only()?;
                        let last = git.last_commit_oneline()?;
                        Ok(last.contains("qa-goldenpath"))
                    })()
                    .unwrap_or_else(|e| {
                        warn!("verify pull failed: {e}");
                        false
                    });

                    let mut s = sess.state.lock().await;
                    if verify_ok {
                        let push_ts = epoch_secs();
                        s.log(step, LogKind::Success, "  \u{2713} git push verified OK");
                        for svc in &updated_services {
                            s.tag_pushed_at.insert(svc.clone(), push_ts);
                        }
                        for entry in s.snap.gitops_statuses.iter_mut() {
                            if updated_services.contains(&entry.name) {
                                entry.phase = GitopsPhase::Pushed;
                                entry.message = "Pushed and verified".into();
                            }
                        }
                    } else {
                        s.log(
                            step,
                            LogKind::Error,
                            "  \u{2715} git push could not be verified — commit not found on remote",
                        );
                        for entry in s.snap.gitops_statuses.iter_mut() {
                            if updated_services.contains(&entry.name) {
                                entry.status = SvcStatus::Failed;
                                entry.phase = GitopsPhase::VerifyFailed;
                                entry.message = "Push not verified on remote".into();
                            }
                        }
                    }
                    self.publish_snapshot(&s, false);
                }
                Ok(false) => {
                    let mut s = sess.state.lock().await;
                    s.log(step, LogKind::Error, "  \u{2715} git push failed");
                    for entry in s.snap.gitops_statuses.iter_mut() {
                        if updated_services.contains(&entry.name) {
                            entry.status = SvcStatus::Failed;
                            entry.phase = GitopsPhase::PushFailed;
                            entry.message = "git push failed".into();
                        }
                    }
                    self.publish_snapshot(&s, false);
                }
                Err(e) => {
                    let mut s = sess.state.lock().await;
                    s.log(step, LogKind::Error, format!("  \u{2715} git error: {e}"));
                    self.publish_snapshot(&s, false);
                }
            }
        }

        // ── Aggregate ──
        let failed_ctx = {
            let mut s = sess.state.lock().await;
            let failed: Vec<(String, GitopsPhase, String)> = s
                .snap
                .gitops_statuses
                .iter()
                .filter(|g| g.status == SvcStatus::Failed)
                .map(|g| (g.name.clone(), g.phase, g.message.clone()))
                .collect();

            if failed.is_empty() {
                let pushed = s
                    .snap
                    .gitops_statuses
                    .iter()
                    .filter(|g| g.phase == GitopsPhase::Pushed)
                    .count();
                let unchanged = s
                    .snap
                    .gitops_statuses
                    .iter()
                    .filter(|g| g.phase == GitopsPhase::Unchanged)
                    .count();
                let unchanged_note = if unchanged > 0 {
                    format!(", {unchanged} unchanged")
                } else {
                    String::new()
                };
                s.log(
                    step,
                    LogKind::Success,
                    format!("  \u{2713} GitOps complete — {pushed} pushed{unchanged_note}"),
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
                    format!("  \u{2715} {}/{n} failed: {}", failed.len(), names.join(", ")),
                );
                s.set_step_status(step, StepStatus::Failed);
                s.sync_active_run(run_id);
                self.publish_snapshot(&s, false);

                let mut ctx = format!("Failed GitOps updates ({}/{n}):\n", failed.len());
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_handles_quoted_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.yaml");
        std::fs::write(
            &path,
            "global:\n  image:\n    tag: \"pre-release-tw-aaaa000000\"\n  replicas: 2\n",
        )
        .unwrap();
        let changed =
            rewrite_tag_in_file(&path, "pre-release-tw-aaaa000000", "pre-release-tw-bbbb111111")
                .unwrap();
        assert!(changed);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("tag: \"pre-release-tw-bbbb111111\""));
        assert!(content.contains("replicas: 2"), "formatting must survive");
    }

    #[test]
    fn rewrite_handles_bare_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.yaml");
        std::fs::write(&path, "global:\n  image:\n    tag: pre-release-tw-aaaa000000\n").unwrap();
        let changed =
            rewrite_tag_in_file(&path, "pre-release-tw-aaaa000000", "pre-release-tw-bbbb111111")
                .unwrap();
        assert!(changed);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("tag: \"pre-release-tw-bbbb111111\""));
    }

    #[test]
    fn rewrite_reports_no_change_when_tag_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.yaml");
        std::fs::write(&path, "global:\n  image:\n    tag: other\n").unwrap();
        let changed = rewrite_tag_in_file(&path, "missing-tag", "new-tag").unwrap();
        assert!(!changed);
    }
}

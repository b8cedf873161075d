use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use super::Pipeline;
use crate::clients::AppStatus;
use crate::clock::epoch_secs;
use crate::session::Session;
use crate::types::{Health, LogKind, StepId};

/// How one deploy-watch attempt resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Every selected service reached effective-Healthy.
    Healthy,
    /// Zero services Progressing while at least one stayed non-Healthy for
    /// the whole settle grace. No point waiting out the timeout.
    Settled,
    /// The per-attempt budget elapsed with services still moving.
    Timeout,
}

/// Checkpoint tick; defensive against stream stalls.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);
const PROGRESS_LOG_INTERVAL_SECS: u64 = 60;

/// Controller-reported health, overridden to Progressing while the expected
/// tag has not rolled out yet. The previous deployment's stable Healthy must
/// not mask a tag that is still propagating.
pub(crate) fn effective_health(
    expected: Option<&String>,
    current_tag: &str,
    reported: Health,
) -> Health {
    match expected {
        Some(exp) if !exp.is_empty() && !current_tag.is_empty() && exp != current_tag => {
            Health::Progressing
        }
        _ => reported,
    }
}

impl Pipeline {
    /// Watch controller health through the streaming event feed until the
    /// attempt resolves. Event handling and the 2-second checkpoint tick
    /// evaluate the same completion conditions; the checkpoint additionally
    /// logs progress every 60 s and reconnects a dead stream.
    pub(crate) async fn deploy_watch_loop(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        run_id: &str,
        timeout_secs: u64,
    ) -> WatchOutcome {
        let step = StepId::Deploy;
        let settle_grace = self.config.settle_grace_secs;
        let start = Instant::now();
        let deadline = Duration::from_secs(timeout_secs);
        let mut settled_since: Option<Instant> = None;
        let mut next_log_at = PROGRESS_LOG_INTERVAL_SECS;

        let (mut rx, mut stream_task) = self.spawn_watch_stream();
        let mut stream_alive = true;
        let mut tick = tokio::time::interval(CHECKPOINT_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            if start.elapsed() >= deadline {
                break WatchOutcome::Timeout;
            }

            tokio::select! {
                event = rx.recv(), if stream_alive => {
                    match event {
                        Some(apps) => {
                            if self
                                .handle_watch_event(sess, run_id, &apps, start, &mut settled_since)
                                .await
                            {
                                break WatchOutcome::Healthy;
                            }
                        }
                        None => {
                            stream_alive = false;
                        }
                    }
                }
                _ = tick.tick() => {
                    let elapsed = start.elapsed().as_secs();
                    let (progressing, healthy, total, still_watching) = {
                        let s = sess.state.lock().await;
                        let total = s.snap.selected_services.len();
                        let progressing = s
                            .snap
                            .health_map
                            .values()
                            .filter(|h| **h == Health::Progressing)
                            .count();
                        let healthy = s
                            .snap
                            .health_map
                            .values()
                            .filter(|h| **h == Health::Healthy)
                            .count();
                        (progressing, healthy, total, s.watch_running)
                    };
                    if !still_watching {
                        break WatchOutcome::Timeout;
                    }

                    // Settled detection (checkpoint path).
                    let non_healthy = total.saturating_sub(healthy);
                    if progressing == 0 && non_healthy > 0 && settled_since.is_none() {
                        settled_since = Some(Instant::now());
                        let mut s = sess.state.lock().await;
                        s.log(
                            step,
                            LogKind::Warn,
                            format!(
                                "  ⚠ All services settled (checkpoint) — {healthy}/{total} healthy, 0 progressing. Grace: {settle_grace}s"
                            ),
                        );
                        self.publish_snapshot(&s, false);
                    } else if progressing > 0 && settled_since.is_some() {
                        settled_since = None;
                        let mut s = sess.state.lock().await;
                        s.log(
                            step,
                            LogKind::Info,
                            "  ↻ Service back to Progressing — settle timer reset",
                        );
                        self.publish_snapshot(&s, false);
                    }

                    if let Some(since) = settled_since {
                        let grace_elapsed = since.elapsed().as_secs();
                        if grace_elapsed >= settle_grace {
                            let mut s = sess.state.lock().await;
                            let degraded: Vec<String> = s
                                .snap
                                .selected_services
                                .iter()
                                .filter(|svc| {
                                    !matches!(
                                        s.snap.health_map.get(*svc),
                                        Some(Health::Healthy) | Some(Health::Progressing)
                                    )
                                })
                                .cloned()
                                .collect();
                            s.log(
                                step,
                                LogKind::Warn,
                                format!(
                                    "  ⚠ Settled for {grace_elapsed}s — {healthy}/{total} healthy, {} degraded: {}",
                                    degraded.len(),
                                    degraded.join(", ")
                                ),
                            );
                            s.log(
                                step,
                                LogKind::Warn,
                                "  → Skipping remaining wait — proceeding to diagnostics",
                            );
                            self.publish_snapshot(&s, false);
                            break WatchOutcome::Settled;
                        }
                    }

                    // Periodic progress log + dead-stream reconnect.
                    if elapsed >= next_log_at && elapsed < timeout_secs {
                        next_log_at = elapsed + PROGRESS_LOG_INTERVAL_SECS;
                        let mut s = sess.state.lock().await;
                        s.log(
                            step,
                            LogKind::Info,
                            format!("  ⏱ {}min checkpoint — {healthy}/{total} healthy", elapsed / 60),
                        );
                        let dead = !stream_alive || stream_task.is_finished();
                        if dead {
                            s.log(step, LogKind::Warn, "  Event stream died — reconnecting...");
                            drop(s);
                            stream_task.abort();
                            let (new_rx, new_task) = self.spawn_watch_stream();
                            rx = new_rx;
                            stream_task = new_task;
                            stream_alive = true;
                        } else {
                            self.publish_snapshot(&s, false);
                        }
                    }
                }
            }
        };

        stream_task.abort();
        outcome
    }

    /// Subscribe to the controller event feed under the per-target circuit
    /// breaker.
    fn spawn_watch_stream(
        self: &Arc<Self>,
    ) -> (
        mpsc::Receiver<Vec<AppStatus>>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let controller = Arc::clone(&this.controller);
            if let Err(e) = this.stream_breaker.call(controller.watch(tx)).await {
                warn!("controller watch stream ended: {e}");
            }
        });
        (rx, task)
    }

    /// Fold one stream event into session state. Returns `true` once every
    /// selected service is effective-Healthy.
    async fn handle_watch_event(
        self: &Arc<Self>,
        sess: &Arc<Session>,
        _run_id: &str,
        apps: &[AppStatus],
        start: Instant,
        settled_since: &mut Option<Instant>,
    ) -> bool {
        let step = StepId::Deploy;
        let elapsed = start.elapsed().as_secs();
        let prefix = self.config.app_prefix();

        let mut s = sess.state.lock().await;
        if !s.watch_running {
            return false;
        }

        let expected = s.snap.expected_tags.clone();
        let selected = s.snap.selected_services.clone();
        let mut health = s.snap.health_map.clone();
        let mut log_lines: Vec<(LogKind, String)> = Vec::new();

        for app in apps {
            let short = app.name.strip_prefix(&prefix).unwrap_or(&app.name).to_string();
            if !health.contains_key(&short) {
                continue;
            }
            let effective = effective_health(expected.get(&short), &app.tag, app.health);

            // First effective-Healthy observation stamps the propagation
            // clock, changed or not.
            let mut prop_label = String::new();
            if effective == Health::Healthy && !s.tag_healthy_at.contains_key(&short) {
                let now = epoch_secs();
                s.tag_healthy_at.insert(short.clone(), now);
                if let Some(pushed) = s.tag_pushed_at.get(&short) {
                    prop_label = format!(" [{}s from push]", (now - pushed) as u64);
                }
            }

            if health.get(&short) == Some(&effective) {
                continue;
            }
            health.insert(short.clone(), effective);

            if effective == Health::Progressing && app.health != Health::Progressing {
                let exp = expected.get(&short).cloned().unwrap_or_default();
                log_lines.push((
                    LogKind::Warn,
                    format!("  ⎎ {short} → tag mismatch (expected: {exp}, current: {})", app.tag),
                ));
            } else {
                let kind = if effective == Health::Healthy {
                    LogKind::Success
                } else {
                    LogKind::Warn
                };
                log_lines.push((
                    kind,
                    format!("  ⎎ {short} → {} ({}){prop_label}", effective.as_str(), app.sync),
                ));
            }
        }

        for (kind, line) in log_lines {
            s.log(step, kind, line);
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
        // UI heartbeat: seconds into the watch.
        s.snap.watch_count = elapsed;

        let total = selected.len();
        let healthy = health.values().filter(|h| **h == Health::Healthy).count();

        if elapsed > 0 && elapsed % PROGRESS_LOG_INTERVAL_SECS == 0 {
            s.log(
                step,
                LogKind::Info,
                format!("  ⏱ {}min elapsed — {healthy}/{total} healthy", elapsed / 60),
            );
        }

        if healthy == total {
            s.log(
                step,
                LogKind::Success,
                format!("  ✓ All {total} apps Healthy — event stream confirmed"),
            );
            s.watch_running = false;
            self.publish_snapshot(&s, false);
            return true;
        }

        // Settled detection (event path).
        let progressing = health.values().filter(|h| **h == Health::Progressing).count();
        let non_healthy = total - healthy;
        if progressing == 0 && non_healthy > 0 {
            if settled_since.is_none() {
                *settled_since = Some(Instant::now());
                let grace = self.config.settle_grace_secs;
                s.log(
                    step,
                    LogKind::Warn,
                    format!(
                        "  ⚠ All services settled — {healthy}/{total} healthy, 0 progressing. Grace: {grace}s"
                    ),
                );
            }
        } else if settled_since.is_some() {
            *settled_since = None;
            s.log(step, LogKind::Info, "  ↻ Service back to Progressing — settle timer reset");
        }

        self.publish_snapshot(&s, false);
        false
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_mismatch_forces_progressing() {
        let expected = String::from("pre-release-tw-bbbb111111");
        assert_eq!(
            effective_health(Some(&expected), "pre-release-tw-aaaa000000", Health::Healthy),
            Health::Progressing
        );
    }

    #[test]
    fn matching_tag_keeps_reported_health() {
        let expected = String::from("pre-release-tw-aaaa000000");
        assert_eq!(
            effective_health(Some(&expected), "pre-release-tw-aaaa000000", Health::Healthy),
            Health::Healthy
        );
        assert_eq!(
            effective_health(Some(&expected), "pre-release-tw-aaaa000000", Health::Degraded),
            Health::Degraded
        );
    }

    #[test]
    fn missing_expected_tag_skips_verification() {
        assert_eq!(
            effective_health(None, "whatever", Health::Healthy),
            Health::Healthy
        );
        assert_eq!(
            effective_health(None, "whatever", Health::Degraded),
            Health::Degraded
        );
    }

    #[test]
    fn empty_current_tag_skips_override() {
        let expected = String::from("pre-release-tw-bbbb111111");
        assert_eq!(
            effective_health(Some(&expected), "", Health::Healthy),
            Health::Healthy
        );
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::clients::{DiagnosticModel, EvidenceSource};
use crate::llm::{strip_fences, LlmError};
use crate::resilience::{Bulkhead, CircuitBreaker};
use crate::types::{ActionKind, ActionStatus, Health, ProposedAction, StepId};

pub const DIAG_SYSTEM_PROMPT: &str = "You are CEN-PE, an expert SRE diagnosing a pipeline failure. \
Analyze the data below and provide a concise diagnosis:\n\
- Root cause (most likely)\n\
- Affected services\n\
- Recommended action\n\
For Jenkins QA failures: list specific failing test classes/methods by name. \
Prioritize test report data (pass/fail counts, failing test names) over raw console log. \
Be direct and actionable. No pleasantries.";

pub const ACTION_SYSTEM_PROMPT: &str = "You are CEN-PE, proposing remediation actions for a pipeline failure.\n\
Based on the diagnosis and context, propose specific actions.\n\
Return ONLY valid JSON array. Each object must have:\n\
  \"action\": one of \"hard_sync\",\"restart_pods\",\"retry_merge\",\"retry_build\",\"rollback_image\",\"clear_cache\"\n\
  \"target\": specific service/app name\n\
  \"confidence\": integer 0-100\n\
  \"reason\": explanation (max 100 chars)\n\
Max 5 actions. Return [] if no clear action.";

/// Actions with confidence at or above this are auto-executed without manual
/// approval (when the action kind is in the safe set).
pub const AUTO_EXECUTE_CONFIDENCE: u8 = 80;

const DIAG_TIMEOUT: Duration = Duration::from_secs(25);
const MAX_ACTIONS: usize = 5;
/// Cap on per-service log queries when gathering deploy evidence.
const MAX_LOG_SERVICES: usize = 4;
const LOG_LINES_PER_SERVICE: u32 = 20;

/// CEN-PE failure diagnosis + remediation proposal engine.
///
/// The model sits behind a bulkhead and a circuit breaker; diagnostics
/// degrade to placeholder text on any upstream trouble and never fail the
/// pipeline.
pub struct DiagnosticsEngine {
    model: Arc<dyn DiagnosticModel>,
    evidence: Arc<dyn EvidenceSource>,
    bulkhead: Bulkhead,
    breaker: CircuitBreaker,
}

impl DiagnosticsEngine {
    pub fn new(model: Arc<dyn DiagnosticModel>, evidence: Arc<dyn EvidenceSource>) -> Self {
        Self {
            model,
            evidence,
            bulkhead: Bulkhead::new(2),
            breaker: CircuitBreaker::new("diagnostic_model", 3, Duration::from_secs(60)),
        }
    }

    /// One guarded model call. Upstream trouble comes back as a
    /// human-readable placeholder, never an error.
    async fn call_model(&self, system: &str, prompt: &str) -> String {
        let _permit = self.bulkhead.acquire().await;
        if self.breaker.try_acquire().is_err() {
            return "Diagnostics unavailable — upstream circuit open".into();
        }
        match self.model.complete(system, prompt).await {
            Ok(text) => {
                self.breaker.record_success();
                text
            }
            Err(LlmError::RateLimited) => {
                self.breaker.record_failure();
                "Diagnostics unavailable — Rate limited".into()
            }
            Err(e @ LlmError::Upstream { .. }) => {
                // The upstream answered; only transport-level trouble trips
                // the breaker.
                self.breaker.record_success();
                warn!("Diagnostic API error: {e}");
                format!("Diagnostics unavailable — {}", e.title())
            }
            Err(e @ LlmError::Transport(_)) => {
                self.breaker.record_failure();
                warn!("Diagnostic call failed: {e}");
                "Diagnostics unavailable".into()
            }
        }
    }

    /// Gather step-specific evidence and ask for a diagnosis. Hard 25 s cap.
    pub async fn diagnose(&self, step: StepId, context: &str) -> String {
        match tokio::time::timeout(DIAG_TIMEOUT, self.diagnose_inner(step, context)).await {
            Ok(text) => text,
            Err(_) => {
                warn!("Diagnostics timeout for step {}", step.as_str());
                "Diagnostics timed out after 25s".into()
            }
        }
    }

    async fn diagnose_inner(&self, step: StepId, context: &str) -> String {
        let mut gathered = vec![context.to_string()];

        match step {
            StepId::Build => {
                if let Ok(data) = self.evidence.ci_job_status().await {
                    gathered.push(format!("\nJenkins status:\n{}", truncate(&data, 4000)));
                }
            }
            StepId::Gitops => {
                if let Ok(data) = self.evidence.gitops_tags().await {
                    gathered.push(format!("\nCurrent GitOps tags:\n{}", truncate(&data, 2000)));
                }
            }
            StepId::Deploy => {
                let degraded = degraded_from_context(context);
                for svc in degraded.iter().take(MAX_LOG_SERVICES) {
                    if let Ok(logs) = self
                        .evidence
                        .service_logs(svc, LOG_LINES_PER_SERVICE)
                        .await
                    {
                        gathered.push(format!("\nLogs for {svc}:\n{}", truncate(&logs, 1500)));
                    }
                }
                if let Ok(data) = self.evidence.error_logs(20).await {
                    gathered.push(format!(
                        "\nRecent error logs (all):\n{}",
                        truncate(&data, 2000)
                    ));
                }
                if let Ok(data) = self.evidence.metric_health().await {
                    gathered.push(format!("\nMetric health:\n{}", truncate(&data, 2000)));
                }
                if let Ok(data) = self.evidence.controller_board().await {
                    gathered.push(format!(
                        "\nController health board:\n{}",
                        truncate(&data, 2000)
                    ));
                }
            }
            StepId::Jenkins => {
                if let Ok(data) = self.evidence.ci_job_status().await {
                    gathered.push(format!("\nJenkins details:\n{}", truncate(&data, 4000)));
                }
            }
            StepId::Merge => {}
        }

        let prompt = format!(
            "Pipeline failure at step: {}\n\n{}",
            step.label(),
            gathered.join("\n")
        );
        self.call_model(DIAG_SYSTEM_PROMPT, &prompt).await
    }

    /// Ask for remediation actions. Returns validated proposals; qualifying
    /// ones carry `AutoExecuting` status for the executor to run.
    pub async fn propose(
        &self,
        step: StepId,
        diagnosis: &str,
        context: &str,
        health_map: &HashMap<String, Health>,
    ) -> Vec<ProposedAction> {
        let health_json =
            serde_json::to_string(health_map).unwrap_or_else(|_| "{}".into());
        let prompt = format!(
            "Step: {}\nDiagnosis: {}\nContext: {}\nHealth map: {}",
            step.as_str(),
            diagnosis,
            truncate(context, 2000),
            truncate(&health_json, 500)
        );
        let raw = self.call_model(ACTION_SYSTEM_PROMPT, &prompt).await;
        parse_actions(&raw)
    }
}

/// Pull degraded service names from a `Degraded services: a, b` context line.
fn degraded_from_context(context: &str) -> Vec<String> {
    for line in context.lines() {
        if let Some(rest) = line.strip_prefix("Degraded services:") {
            return rest
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    Vec::new()
}

/// Parse and validate the model's action array. Malformed output yields an
/// empty list; entries outside the whitelist are dropped; confidence is
/// clamped to 0-100; at most [`MAX_ACTIONS`] survive.
pub fn parse_actions(raw: &str) -> Vec<ProposedAction> {
    let text = strip_fences(raw);
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to parse action proposals: {e}");
            return Vec::new();
        }
    };
    let Some(items) = parsed.as_array() else {
        return Vec::new();
    };

    let mut valid = Vec::new();
    for (i, item) in items.iter().take(MAX_ACTIONS).enumerate() {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let Some(kind) = obj
            .get("action")
            .and_then(|a| a.as_str())
            .and_then(ActionKind::from_str)
        else {
            continue;
        };
        let confidence = obj
            .get("confidence")
            .and_then(|c| c.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 100.0) as u8;
        let target: String = obj
            .get("target")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .chars()
            .take(80)
            .collect();
        let reason: String = obj
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .chars()
            .take(100)
            .collect();

        let can_auto =
            confidence >= AUTO_EXECUTE_CONFIDENCE && kind.safe_to_auto_execute();
        valid.push(ProposedAction {
            id: format!("act-{i}"),
            action: kind,
            target,
            confidence,
            reason,
            status: if can_auto {
                ActionStatus::AutoExecuting
            } else {
                ActionStatus::Proposed
            },
            result: String::new(),
        });
    }
    valid
}

/// Make sure a rollback is on the table for every degraded service; the
/// model does not always suggest one.
pub fn ensure_rollback_proposals(actions: &mut Vec<ProposedAction>, degraded: &[String]) {
    let covered: std::collections::HashSet<String> = actions
        .iter()
        .filter(|a| a.action == ActionKind::RollbackImage)
        .map(|a| a.target.clone())
        .collect();
    for (i, svc) in degraded.iter().enumerate() {
        if covered.contains(svc) {
            continue;
        }
        actions.push(ProposedAction {
            id: format!("rb-{i}"),
            action: ActionKind::RollbackImage,
            target: svc.clone(),
            confidence: 70,
            reason: format!("Roll back {svc} to previous image tag"),
            status: ActionStatus::Proposed,
            result: String::new(),
        });
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_actions_strips_fences_and_validates() {
        let raw = "```json\n[{\"action\":\"hard_sync\",\"target\":\"alive\",\"confidence\":85,\"reason\":\"out of sync\"}]\n```";
        let actions = parse_actions(raw);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, ActionKind::HardSync);
        assert_eq!(actions[0].status, ActionStatus::AutoExecuting);
        assert_eq!(actions[0].id, "act-0");
    }

    #[test]
    fn confidence_79_stays_proposed_80_auto_executes() {
        let raw = r#"[
            {"action":"rollback_image","target":"a","confidence":79,"reason":"x"},
            {"action":"rollback_image","target":"b","confidence":80,"reason":"x"}
        ]"#;
        let actions = parse_actions(raw);
        assert_eq!(actions[0].status, ActionStatus::Proposed);
        assert_eq!(actions[1].status, ActionStatus::AutoExecuting);
    }

    #[test]
    fn restart_pods_never_auto_executes() {
        let raw = r#"[{"action":"restart_pods","target":"a","confidence":99,"reason":"x"}]"#;
        let actions = parse_actions(raw);
        assert_eq!(actions[0].status, ActionStatus::Proposed);
    }

    #[test]
    fn unknown_actions_and_junk_are_dropped() {
        let raw = r#"[
            {"action":"reboot_universe","target":"a","confidence":90,"reason":"x"},
            "not an object",
            {"action":"clear_cache","target":"a","confidence":50,"reason":"x"}
        ]"#;
        let actions = parse_actions(raw);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, ActionKind::ClearCache);
    }

    #[test]
    fn malformed_output_yields_empty_list() {
        assert!(parse_actions("I think you should restart the pods").is_empty());
        assert!(parse_actions("{\"action\":\"hard_sync\"}").is_empty());
    }

    #[test]
    fn at_most_five_actions_survive() {
        let raw = r#"[
            {"action":"hard_sync","target":"a","confidence":10,"reason":"x"},
            {"action":"hard_sync","target":"b","confidence":10,"reason":"x"},
            {"action":"hard_sync","target":"c","confidence":10,"reason":"x"},
            {"action":"hard_sync","target":"d","confidence":10,"reason":"x"},
            {"action":"hard_sync","target":"e","confidence":10,"reason":"x"},
            {"action":"hard_sync","target":"f","confidence":10,"reason":"x"}
        ]"#;
        assert_eq!(parse_actions(raw).len(), 5);
    }

    #[test]
    fn confidence_is_clamped() {
        let raw = r#"[{"action":"hard_sync","target":"a","confidence":250,"reason":"x"}]"#;
        assert_eq!(parse_actions(raw)[0].confidence, 100);
    }

    #[test]
    fn rollback_proposals_fill_uncovered_degraded_services() {
        let mut actions = parse_actions(
            r#"[{"action":"rollback_image","target":"a","confidence":85,"reason":"x"}]"#,
        );
        ensure_rollback_proposals(&mut actions, &["a".into(), "b".into()]);
        assert_eq!(actions.len(), 2);
        let added = &actions[1];
        assert_eq!(added.action, ActionKind::RollbackImage);
        assert_eq!(added.target, "b");
        assert_eq!(added.confidence, 70);
        assert_eq!(added.status, ActionStatus::Proposed);
    }

    #[test]
    fn degraded_names_parse_from_context() {
        let ctx = "Deploy health: 1/3 Healthy\nDegraded services: alive, wallet\nHealth map: {}";
        assert_eq!(degraded_from_context(ctx), vec!["alive", "wallet"]);
        assert!(degraded_from_context("nothing here").is_empty());
    }
}

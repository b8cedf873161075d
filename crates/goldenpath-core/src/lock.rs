use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clients::SourceHost;

/// Country deploy lock stored in the GitOps repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub run_id: String,
    pub triggered_by: String,
    pub locked_at_epoch: i64,
    pub ttl_secs: i64,
}

impl LockInfo {
    pub fn is_expired(&self, now_epoch: i64) -> bool {
        now_epoch - self.locked_at_epoch > self.ttl_secs
    }

    pub fn age_secs(&self, now_epoch: i64) -> i64 {
        now_epoch - self.locked_at_epoch
    }
}

pub fn lock_path(country: &str) -> String {
    format!(".deploy-locks/staging-{country}.json")
}

fn workflow_path() -> &'static str {
    ".github/workflows/deploy-lock-guard.yml"
}

/// Acquire/release of the country-level advisory lock via the source host's
/// contents API (compare-and-set on the lock file's blob sha).
pub struct LockManager {
    host: Arc<dyn SourceHost>,
    country: String,
    ttl_secs: i64,
}

impl LockManager {
    pub fn new(host: Arc<dyn SourceHost>, country: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            host,
            country: country.into(),
            ttl_secs,
        }
    }

    /// Current lock file, if present.
    pub async fn check(&self) -> Result<Option<LockInfo>> {
        let path = lock_path(&self.country);
        let Some((content, _sha)) = self.host.read_repo_file(&path).await? else {
            return Ok(None);
        };
        let info: LockInfo = serde_json::from_str(&content)
            .with_context(|| format!("parse lock file {path}"))?;
        Ok(Some(info))
    }

    /// Try to take the lock. Returns `(acquired, reason)`; a non-expired
    /// lock held by another run loses, an expired lock is replaced.
    pub async fn acquire(&self, run_id: &str, triggered_by: &str) -> Result<(bool, String)> {
        let path = lock_path(&self.country);
        let now = chrono::Utc::now().timestamp();
        let existing = self.host.read_repo_file(&path).await?;

        let prev_sha = match &existing {
            Some((content, sha)) => {
                if let Ok(info) = serde_json::from_str::<LockInfo>(content) {
                    if !info.is_expired(now) && info.run_id != run_id {
                        let age_min = info.age_secs(now) / 60;
                        return Ok((
                            false,
                            format!(
                                "held by run {} ({}, {}min ago)",
                                info.run_id, info.triggered_by, age_min
                            ),
                        ));
                    }
                }
                Some(sha.as_str())
            }
            None => None,
        };

        let info = LockInfo {
            run_id: run_id.to_string(),
            triggered_by: triggered_by.to_string(),
            locked_at_epoch: now,
            ttl_secs: self.ttl_secs,
        };
        let content = serde_json::to_string_pretty(&info).context("serialize lock")?;
        let message = format!("lock staging-{} for {}", self.country, run_id);
        let written = self
            .host
            .write_repo_file(&path, &content, prev_sha, &message)
            .await?;
        if written {
            Ok((true, String::new()))
        } else {
            Ok((false, "lost compare-and-set race".into()))
        }
    }

    /// Release the lock if this run still holds it. Safe to call when not
    /// held.
    pub async fn release(&self, run_id: &str) -> Result<bool> {
        let path = lock_path(&self.country);
        let Some((content, sha)) = self.host.read_repo_file(&path).await? else {
            return Ok(true);
        };
        if let Ok(info) = serde_json::from_str::<LockInfo>(&content) {
            if info.run_id != run_id {
                return Ok(false);
            }
        }
        let message = format!("unlock staging-{} after {}", self.country, run_id);
        self.host.delete_repo_file(&path, &sha, &message).await
    }

    /// Make sure the repo carries the workflow that blocks commits to the
    /// values file while the lock is held. Idempotent; callers treat any
    /// failure as non-fatal.
    pub async fn ensure_enforcement_workflow(&self, values_file: &str) -> Result<bool> {
        let path = workflow_path();
        if self.host.read_repo_file(path).await?.is_some() {
            return Ok(true);
        }
        let body = enforcement_workflow_yaml(&self.country, values_file);
        let written = self
            .host
            .write_repo_file(path, &body, None, "add deploy lock guard workflow")
            .await?;
        debug!("installed lock enforcement workflow: {written}");
        Ok(written)
    }
}

fn enforcement_workflow_yaml(country: &str, values_file: &str) -> String {
    format!(
        r#"name: deploy-lock-guard
on:
  push:
    paths:
      - "**/{values_file}"
jobs:
  guard:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - name: Block commits while staging-{country} is locked
        run: |
          LOCK=".deploy-locks/staging-{country}.json"
          [ -f "$LOCK" ] || exit 0
          NOW=$(date +%s)
          AT=$(jq -r .locked_at_epoch "$LOCK")
          TTL=$(jq -r .ttl_secs "$LOCK")
          HOLDER=$(jq -r .run_id "$LOCK")
          MSG=$(git log -1 --format=%s)
          case "$MSG" in *"$HOLDER"*) exit 0 ;; esac
          if [ $((NOW - AT)) -le "$TTL" ]; then
            echo "values files are locked by run $HOLDER"
            exit 1
          fi
"#
    )
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_expiry_is_strictly_after_ttl() {
        let info = LockInfo {
            run_id: "r1".into(),
            triggered_by: "sam".into(),
            locked_at_epoch: 1_000,
            ttl_secs: 3_600,
        };
        assert!(!info.is_expired(1_000 + 3_600));
        assert!(info.is_expired(1_000 + 3_601));
    }

    #[test]
    fn lock_path_embeds_country() {
        assert_eq!(lock_path("ug"), ".deploy-locks/staging-ug.json");
        assert_eq!(lock_path("tw"), ".deploy-locks/staging-tw.json");
    }

    #[test]
    fn lock_file_round_trips() {
        let info = LockInfo {
            run_id: "r9".into(),
            triggered_by: "sam".into(),
            locked_at_epoch: 1_700_000_000,
            ttl_secs: 3_600,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: LockInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, "r9");
        assert_eq!(back.ttl_secs, 3_600);
    }

    #[test]
    fn enforcement_workflow_references_lock_and_values_file() {
        let yaml = enforcement_workflow_yaml("ug", "values-staging-ug.yaml");
        assert!(yaml.contains(".deploy-locks/staging-ug.json"));
        assert!(yaml.contains("values-staging-ug.yaml"));
    }
}

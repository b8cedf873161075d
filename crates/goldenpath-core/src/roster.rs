use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// On-call roster persisted to `roster.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
    pub shift: String,
    pub oncall: String,
    pub escalation: String,
    /// One per line, `@handle=email`.
    pub emails_raw: String,
}

impl Default for Roster {
    fn default() -> Self {
        Self {
            shift: "TW AQA".into(),
            oncall: "@vinay.puranik".into(),
            escalation: "@vinay.puranik".into(),
            emails_raw: "@vinay.puranik=vinay.puranik@sporty.com".into(),
        }
    }
}

impl Roster {
    /// Load from JSON file, falling back to defaults on any error.
    pub fn load(path: &Path) -> Roster {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!("invalid roster at {}: {e}", path.display());
                    Roster::default()
                }
            },
            Err(_) => Roster::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let payload = serde_json::to_string_pretty(self).context("serialize roster")?;
        std::fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Parse `emails_raw` into a `{handle: email}` map. Malformed lines are
    /// skipped.
    pub fn email_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for line in self.emails_raw.lines() {
            let line = line.trim();
            if let Some((handle, email)) = line.split_once('=') {
                let handle = handle.trim();
                let email = email.trim();
                if !handle.is_empty() && !email.is_empty() {
                    map.insert(handle.to_string(), email.to_string());
                }
            }
        }
        map
    }

    /// Resolve a trigger user's email: `@user` entry first, then bare name,
    /// then a `{user}@{domain}` fallback.
    pub fn resolve_email(&self, user: &str, domain: &str) -> String {
        let map = self.email_map();
        map.get(&format!("@{user}"))
            .or_else(|| map.get(user))
            .cloned()
            .unwrap_or_else(|| format!("{user}@{domain}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_map_parses_handle_lines() {
        let roster = Roster {
            emails_raw: "@vinay.k=vinay.puranik@sporty.com\n@rahul.s=rahul@sporty.com".into(),
            ..Default::default()
        };
        let map = roster.email_map();
        assert_eq!(map["@vinay.k"], "vinay.puranik@sporty.com");
        assert_eq!(map["@rahul.s"], "rahul@sporty.com");
    }

    #[test]
    fn email_map_skips_malformed_lines() {
        let roster = Roster {
            emails_raw: "no-equals-here\n=\n@ok=a@b.c\n  \n".into(),
            ..Default::default()
        };
        let map = roster.email_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map["@ok"], "a@b.c");
    }

    #[test]
    fn resolve_email_falls_back_to_domain() {
        let roster = Roster {
            emails_raw: String::new(),
            ..Default::default()
        };
        assert_eq!(roster.resolve_email("sam", "sporty.com"), "sam@sporty.com");
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let roster = Roster::load(&dir.path().join("roster.json"));
        assert_eq!(roster.shift, "TW AQA");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");
        let roster = Roster {
            shift: "UG AQA".into(),
            oncall: "@sam".into(),
            escalation: "@lee".into(),
            emails_raw: "@sam=sam@sporty.com".into(),
        };
        roster.save(&path).unwrap();
        let loaded = Roster::load(&path);
        assert_eq!(loaded.shift, "UG AQA");
        assert_eq!(loaded.oncall, "@sam");
    }
}

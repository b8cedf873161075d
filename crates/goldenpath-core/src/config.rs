use std::collections::HashMap;

use anyhow::Result;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Pipeline
    /// Default service selection when a run is started without one.
    pub services: Vec<String>,
    /// Default pre-release branch when a service has no registry entry.
    pub target_branch: String,
    pub country: String,
    /// Namespace prefix on controller app names (e.g. "sportybet-ug").
    pub namespace: String,
    pub retry_max: u32,
    pub settle_grace_secs: u64,
    /// Per-attempt deploy watch budget.
    pub deploy_watch_timeout_secs: u64,
    pub skip_jenkins_qa: bool,

    // GitOps
    pub gitops_repo_path: String,
    pub lock_ttl_secs: i64,
    /// Fallback git identity when the trigger user has no roster email.
    pub service_identity_name: String,
    pub service_identity_email: String,
    pub email_domain: String,

    // Diagnostics
    pub model: String,
    pub api_key: String,

    // Notifications
    pub notify_channel: String,
    pub notify_webhook_url: String,

    // External endpoints (consumed by the thin clients in the server crate)
    pub source_host_url: String,
    pub source_host_token: String,
    pub source_org: String,
    pub gitops_repo_slug: String,
    pub ci_build_url: String,
    pub ci_build_user: String,
    pub ci_build_token: String,
    pub ci_qa_url: String,
    pub ci_qa_user: String,
    pub ci_qa_token: String,
    pub controller_url: String,
    pub controller_token: String,
    pub registry_region: String,

    // Web dashboard
    pub web_bind: String,
    pub web_port: u16,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            data_dir: get_str("DATA_DIR", &dotenv, "data"),
            services: get_str("SERVICES", &dotenv, "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            target_branch: get_str("TARGET_BRANCH", &dotenv, "pre-release-tw"),
            country: get_str("COUNTRY", &dotenv, "ug"),
            namespace: get_str("NAMESPACE", &dotenv, "sportybet-ug"),
            retry_max: get_u32("DEPLOY_RETRY_MAX", &dotenv, 3),
            settle_grace_secs: get_u64("SETTLE_GRACE_SECS", &dotenv, 60),
            deploy_watch_timeout_secs: get_u64("DEPLOY_WATCH_TIMEOUT_SECS", &dotenv, 900),
            skip_jenkins_qa: get_bool("SKIP_JENKINS_QA", &dotenv, false),
            gitops_repo_path: get_str("GITOPS_REPO_PATH", &dotenv, "yaml-repo"),
            lock_ttl_secs: get_i64("DEPLOY_LOCK_TTL_SECS", &dotenv, 3600),
            service_identity_name: get_str("SERVICE_IDENTITY_NAME", &dotenv, "qa-autotest"),
            service_identity_email: get_str(
                "SERVICE_IDENTITY_EMAIL",
                &dotenv,
                "qa-autotest@sporty.com",
            ),
            email_domain: get_str("EMAIL_DOMAIN", &dotenv, "sporty.com"),
            model: get_str("AGENT_MODEL", &dotenv, "claude-sonnet-4-5-20250929"),
            api_key: get_str("AGENT_API_KEY", &dotenv, ""),
            notify_channel: get_str("NOTIFY_CHANNEL", &dotenv, "#qa-prerelease"),
            notify_webhook_url: get_str("NOTIFY_WEBHOOK_URL", &dotenv, ""),
            source_host_url: get_str("SOURCE_HOST_URL", &dotenv, "https://api.github.com"),
            source_host_token: get_str("SOURCE_HOST_TOKEN", &dotenv, ""),
            source_org: get_str("SOURCE_ORG", &dotenv, ""),
            gitops_repo_slug: get_str("GITOPS_REPO_SLUG", &dotenv, ""),
            ci_build_url: get_str("CI_BUILD_URL", &dotenv, ""),
            ci_build_user: get_str("CI_BUILD_USER", &dotenv, ""),
            ci_build_token: get_str("CI_BUILD_TOKEN", &dotenv, ""),
            ci_qa_url: get_str("CI_QA_URL", &dotenv, ""),
            ci_qa_user: get_str("CI_QA_USER", &dotenv, ""),
            ci_qa_token: get_str("CI_QA_TOKEN", &dotenv, ""),
            controller_url: get_str("CONTROLLER_URL", &dotenv, ""),
            controller_token: get_str("CONTROLLER_TOKEN", &dotenv, ""),
            registry_region: get_str("REGISTRY_REGION", &dotenv, "eu-west-1"),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", &dotenv, 3131),
        })
    }

    /// Prefix stripped from controller app names to get short service names.
    pub fn app_prefix(&self) -> String {
        if self.namespace.is_empty() {
            String::new()
        } else {
            format!("{}-", self.namespace.to_lowercase())
        }
    }

    /// Values file name for this country, e.g. `values-staging-ug.yaml`.
    pub fn values_file(&self) -> String {
        format!("values-staging-{}.yaml", self.country)
    }

    pub fn live_state_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("live_state.json")
    }

    pub fn roster_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("roster.json")
    }

    pub fn run_store_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("runs.jsonl")
    }
}

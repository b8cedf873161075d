//! Thin transport implementations of the collaborator interfaces the engine
//! consumes. Each is intentionally minimal: the engine owns all the
//! orchestration logic, these only move bytes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use goldenpath_core::clients::{
    AppStatus, BranchHeads, CiBuildResult, CiWorker, DeployController, EvidenceSource,
    ImageRegistry, MergeOutcome, Notifier, SourceHost, StageUpdate,
};
use goldenpath_core::config::Config;
use goldenpath_core::notify::Notification;
use goldenpath_core::types::{Health, JobStatus, MergeState, StageInfo};

// ── Source host (REST) ────────────────────────────────────────────────────

pub struct RestSourceHost {
    client: Client,
    base_url: String,
    token: String,
    org: String,
    gitops_repo: String,
}

impl RestSourceHost {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            base_url: config.source_host_url.trim_end_matches('/').to_string(),
            token: config.source_host_token.clone(),
            org: config.source_org.clone(),
            gitops_repo: config.gitops_repo_slug.clone(),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("token {}", self.token))
            .header("User-Agent", "qa-goldenpath")
    }

    async fn branch_sha(&self, repo: &str, branch: &str) -> Result<String> {
        let url = format!("{}/repos/{}/{repo}/commits/{branch}", self.base_url, self.org);
        let resp: Value = self
            .auth(self.client.get(&url))
            .send()
            .await?
            .json()
            .await
            .context("parse commit response")?;
        resp["sha"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("no sha for {repo}@{branch}"))
    }
}

#[async_trait]
impl SourceHost for RestSourceHost {
    async fn merge_branch(
        &self,
        service: &str,
        target_branch: &str,
        message: &str,
    ) -> Result<MergeOutcome> {
        let url = format!("{}/repos/{}/{service}/merges", self.base_url, self.org);
        let mut body = json!({ "base": target_branch, "head": "master" });
        if !message.is_empty() {
            body["commit_message"] = json!(message);
        }
        let resp = self.auth(self.client.post(&url)).json(&body).send().await?;
        let status = resp.status().as_u16();
        match status {
            201 => {
                let data: Value = resp.json().await?;
                Ok(MergeOutcome {
                    service: service.to_string(),
                    status: MergeState::Success,
                    sha: data["sha"].as_str().unwrap_or("").to_string(),
                    message: String::new(),
                })
            }
            204 => Ok(MergeOutcome {
                service: service.to_string(),
                status: MergeState::NoOp,
                sha: String::new(),
                message: "already up to date".into(),
            }),
            409 => Ok(MergeOutcome {
                service: service.to_string(),
                status: MergeState::Failed,
                sha: String::new(),
                message: "merge conflict".into(),
            }),
            _ => {
                let text = resp.text().await.unwrap_or_default();
                Ok(MergeOutcome {
                    service: service.to_string(),
                    status: MergeState::Failed,
                    sha: String::new(),
                    message: format!("HTTP {status}: {}", text.chars().take(120).collect::<String>()),
                })
            }
        }
    }

    async fn branch_heads(
        &self,
        services: &[(String, String)],
    ) -> Result<HashMap<String, BranchHeads>> {
        let mut heads = HashMap::new();
        for (service, target_branch) in services {
            let master_sha = self.branch_sha(service, "master").await.unwrap_or_default();
            let target_sha = self
                .branch_sha(service, target_branch)
                .await
                .unwrap_or_default();
            heads.insert(
                service.clone(),
                BranchHeads {
                    master_sha,
                    target_sha,
                },
            );
        }
        Ok(heads)
    }

    async fn read_repo_file(&self, path: &str) -> Result<Option<(String, String)>> {
        let url = format!(
            "{}/repos/{}/{}/contents/{path}",
            self.base_url, self.org, self.gitops_repo
        );
        let resp = self.auth(self.client.get(&url)).send().await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let data: Value = resp.json().await.context("parse contents response")?;
        let sha = data["sha"].as_str().unwrap_or("").to_string();
        let encoded = data["content"].as_str().unwrap_or("").replace('\n', "");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .context("decode file content")?;
        Ok(Some((String::from_utf8_lossy(&decoded).into_owned(), sha)))
    }

    async fn write_repo_file(
        &self,
        path: &str,
        content: &str,
        prev_sha: Option<&str>,
        message: &str,
    ) -> Result<bool> {
        let url = format!(
            "{}/repos/{}/{}/contents/{path}",
            self.base_url, self.org, self.gitops_repo
        );
        let mut body = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content.as_bytes()),
        });
        if let Some(sha) = prev_sha {
            body["sha"] = json!(sha);
        }
        let resp = self.auth(self.client.put(&url)).json(&body).send().await?;
        match resp.status().as_u16() {
            200 | 201 => Ok(true),
            409 | 422 => Ok(false),
            status => Err(anyhow!("write {path}: HTTP {status}")),
        }
    }

    async fn delete_repo_file(&self, path: &str, sha: &str, message: &str) -> Result<bool> {
        let url = format!(
            "{}/repos/{}/{}/contents/{path}",
            self.base_url, self.org, self.gitops_repo
        );
        let body = json!({ "message": message, "sha": sha });
        let resp = self
            .auth(self.client.delete(&url))
            .json(&body)
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 | 409 | 422 => Ok(false),
            status => Err(anyhow!("delete {path}: HTTP {status}")),
        }
    }
}

// ── Artifact registry (CLI probe) ─────────────────────────────────────────

pub struct CliImageRegistry {
    region: String,
}

impl CliImageRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            region: config.registry_region.clone(),
        }
    }
}

#[async_trait]
impl ImageRegistry for CliImageRegistry {
    async fn check_image(&self, service: &str, tag: &str) -> (bool, String) {
        let output = tokio::process::Command::new("aws")
            .args([
                "ecr",
                "describe-images",
                "--repository-name",
                service,
                "--image-ids",
                &format!("imageTag={tag}"),
                "--region",
                &self.region,
                "--output",
                "json",
            ])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => (true, String::new()),
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if stderr.contains("ImageNotFoundException")
                    || stderr.contains("RepositoryNotFoundException")
                {
                    (false, "image not found".into())
                } else {
                    (false, stderr.chars().take(200).collect())
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (false, "aws CLI not installed".into())
            }
            Err(e) => (false, e.to_string()),
        }
    }
}

// ── CI worker (wfapi polling) ─────────────────────────────────────────────

pub struct JenkinsWorker {
    client: Client,
    build_url: String,
    build_auth: Option<(String, String)>,
    qa_url: String,
    qa_auth: Option<(String, String)>,
    /// Per-job watch budget for QA jobs.
    qa_watch_timeout: Duration,
}

impl JenkinsWorker {
    pub fn new(config: &Config) -> Self {
        let auth_pair = |user: &str, token: &str| {
            if user.is_empty() {
                None
            } else {
                Some((user.to_string(), token.to_string()))
            }
        };
        Self {
            client: Client::new(),
            build_url: config.ci_build_url.trim_end_matches('/').to_string(),
            build_auth: auth_pair(&config.ci_build_user, &config.ci_build_token),
            qa_url: config.ci_qa_url.trim_end_matches('/').to_string(),
            qa_auth: auth_pair(&config.ci_qa_user, &config.ci_qa_token),
            qa_watch_timeout: Duration::from_secs(1800),
        }
    }

    fn with_auth(
        &self,
        req: reqwest::RequestBuilder,
        auth: &Option<(String, String)>,
    ) -> reqwest::RequestBuilder {
        match auth {
            Some((user, token)) => req.basic_auth(user, Some(token)),
            None => req,
        }
    }

    async fn wfapi_describe(
        &self,
        base: &str,
        auth: &Option<(String, String)>,
        job_path: &str,
    ) -> Result<Value> {
        let url = format!("{base}/job/{job_path}/lastBuild/wfapi/describe");
        let resp = self.with_auth(self.client.get(&url), auth).send().await?;
        Ok(resp.json().await?)
    }

    fn parse_stages(describe: &Value) -> Vec<StageInfo> {
        describe["stages"]
            .as_array()
            .map(|stages| {
                stages
                    .iter()
                    .map(|st| StageInfo {
                        id: st["id"].as_str().unwrap_or("").to_string(),
                        name: st["name"].as_str().unwrap_or("").to_string(),
                        status: st["status"].as_str().unwrap_or("").to_string(),
                        duration: format!(
                            "{}s",
                            st["durationMillis"].as_u64().unwrap_or(0) / 1000
                        ),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn overall_status(describe: &Value) -> (JobStatus, bool) {
        match describe["status"].as_str().unwrap_or("") {
            "SUCCESS" => (JobStatus::Success, true),
            "FAILED" | "FAILURE" => (JobStatus::Failed, true),
            "ABORTED" => (JobStatus::Aborted, true),
            "UNSTABLE" => (JobStatus::Unstable, true),
            _ => (JobStatus::Running, false),
        }
    }

    async fn watch_job(
        &self,
        base: &str,
        auth: &Option<(String, String)>,
        job_path: &str,
        updates: &mpsc::UnboundedSender<StageUpdate>,
        timeout: Duration,
        stop_on_image_stage: bool,
    ) -> Result<CiBuildResult> {
        let started = std::time::Instant::now();
        loop {
            if started.elapsed() >= timeout {
                return Ok(CiBuildResult {
                    status: JobStatus::Timeout,
                    url: format!("{base}/job/{job_path}"),
                    duration: format!("{}s", started.elapsed().as_secs()),
                    ..Default::default()
                });
            }

            match self.wfapi_describe(base, auth, job_path).await {
                Ok(describe) => {
                    let build_num = describe["id"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let stages = Self::parse_stages(&describe);
                    let (status, terminal) = Self::overall_status(&describe);
                    let running = stages
                        .iter()
                        .any(|st| st.status == "IN_PROGRESS" || st.status == "in_progress");
                    let _ = updates.send(StageUpdate {
                        job: job_path.to_string(),
                        build_num,
                        stages: stages.clone(),
                        overall: if terminal {
                            serde_json::to_string(&status)
                                .unwrap_or_default()
                                .trim_matches('"')
                                .to_string()
                        } else {
                            String::new()
                        },
                        phase: (if running { "executing" } else { "queued" }).to_string(),
                        detail: format!("{} stages", stages.len()),
                    });

                    let image_pushed = stop_on_image_stage
                        && stages.iter().any(|st| {
                            st.name.to_lowercase().contains("push") && st.status == "SUCCESS"
                        });
                    if terminal || image_pushed {
                        let duration = format!(
                            "{}s",
                            describe["durationMillis"].as_u64().unwrap_or(0) / 1000
                        );
                        return Ok(CiBuildResult {
                            status: if image_pushed && !terminal {
                                JobStatus::Success
                            } else {
                                status
                            },
                            build_num,
                            duration,
                            url: format!("{base}/job/{job_path}/{build_num}"),
                            stages,
                            queue_duration: String::new(),
                            exec_duration: String::new(),
                        });
                    }
                }
                Err(e) => debug!("wfapi poll {job_path}: {e}"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

#[async_trait]
impl CiWorker for JenkinsWorker {
    fn job_url(&self, _service: &str, ci_repo: &str, build_num: Option<i64>) -> String {
        match build_num {
            Some(n) => format!("{}/job/{ci_repo}/{n}", self.build_url),
            None => format!("{}/job/{ci_repo}", self.build_url),
        }
    }

    async fn find_and_monitor_build(
        &self,
        _service: &str,
        ci_repo: &str,
        updates: mpsc::UnboundedSender<StageUpdate>,
        timeout_secs: u64,
        wait_for_image_stage: bool,
    ) -> Result<CiBuildResult> {
        self.watch_job(
            &self.build_url,
            &self.build_auth,
            ci_repo,
            &updates,
            Duration::from_secs(timeout_secs),
            wait_for_image_stage,
        )
        .await
    }

    async fn trigger_and_stream(
        &self,
        job: &str,
        updates: mpsc::UnboundedSender<StageUpdate>,
    ) -> Result<CiBuildResult> {
        let trigger_url = format!("{}/job/{job}/build", self.qa_url);
        let resp = self
            .with_auth(self.client.post(&trigger_url), &self.qa_auth)
            .send()
            .await?;
        if resp.status().as_u16() >= 400 {
            return Err(anyhow!("trigger {job}: HTTP {}", resp.status()));
        }
        // Give the queue a moment before the first wfapi poll.
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.watch_job(
            &self.qa_url,
            &self.qa_auth,
            job,
            &updates,
            self.qa_watch_timeout,
            false,
        )
        .await
    }
}

// ── Deployment controller (poll-push stream adapter) ──────────────────────

pub struct RestDeployController {
    client: Client,
    base_url: String,
    token: String,
}

impl RestDeployController {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            base_url: config.controller_url.trim_end_matches('/').to_string(),
            token: config.controller_token.clone(),
        }
    }

    fn parse_app(item: &Value) -> AppStatus {
        let health = match item["status"]["health"]["status"].as_str().unwrap_or("") {
            "Healthy" => Health::Healthy,
            "Progressing" => Health::Progressing,
            "Degraded" => Health::Degraded,
            "Missing" => Health::Missing,
            "Suspended" => Health::Suspended,
            _ => Health::Unknown,
        };
        let tag = item["status"]["summary"]["images"]
            .as_array()
            .and_then(|imgs| imgs.last())
            .and_then(|img| img.as_str())
            .and_then(|img| img.rsplit(':').next())
            .unwrap_or("")
            .to_string();
        AppStatus {
            name: item["metadata"]["name"].as_str().unwrap_or("").to_string(),
            health,
            sync: item["status"]["sync"]["status"]
                .as_str()
                .unwrap_or("")
                .to_string(),
            tag,
        }
    }
}

#[async_trait]
impl DeployController for RestDeployController {
    async fn list_applications(&self) -> Result<Vec<AppStatus>> {
        let url = format!("{}/api/v1/applications", self.base_url);
        let resp: Value = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;
        Ok(resp["items"]
            .as_array()
            .map(|items| items.iter().map(Self::parse_app).collect())
            .unwrap_or_default())
    }

    async fn hard_sync(&self, app: &str) -> Result<()> {
        let url = format!("{}/api/v1/applications/{app}/sync", self.base_url);
        let body = json!({ "prune": false, "strategy": { "hook": { "force": true } } });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if resp.status().as_u16() >= 400 {
            return Err(anyhow!("hard sync {app}: HTTP {}", resp.status()));
        }
        Ok(())
    }

    async fn watch(&self, events: mpsc::Sender<Vec<AppStatus>>) -> Result<()> {
        // Poll-push adapter over the list endpoint: one push per change,
        // same shape as the native event feed.
        let mut last: Option<String> = None;
        loop {
            let apps = self.list_applications().await?;
            let fingerprint = serde_json::to_string(&apps).unwrap_or_default();
            if last.as_deref() != Some(fingerprint.as_str()) {
                last = Some(fingerprint);
                if events.send(apps).await.is_err() {
                    return Ok(()); // receiver gone, watch over
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

// ── Notifier (webhook) ────────────────────────────────────────────────────

pub struct WebhookNotifier {
    client: Client,
    url: String,
    channel: String,
}

impl WebhookNotifier {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            url: config.notify_webhook_url.clone(),
            channel: config.notify_channel.clone(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if self.url.is_empty() {
            debug!("notify webhook not configured, dropping notification");
            return Ok(());
        }
        let body = json!({
            "channel": self.channel,
            "payload": notification,
        });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        if resp.status().as_u16() >= 400 {
            warn!("notification webhook returned HTTP {}", resp.status());
        }
        Ok(())
    }
}

// ── Evidence source ───────────────────────────────────────────────────────

/// Evidence backed by the collaborators this process already talks to; the
/// log/metric backends report as unconfigured when absent.
pub struct BasicEvidence {
    controller: Arc<dyn DeployController>,
    client: Client,
    qa_url: String,
    qa_auth: Option<(String, String)>,
    gitops_repo_path: String,
    values_file: String,
}

impl BasicEvidence {
    pub fn new(config: &Config, controller: Arc<dyn DeployController>) -> Self {
        let qa_auth = if config.ci_qa_user.is_empty() {
            None
        } else {
            Some((config.ci_qa_user.clone(), config.ci_qa_token.clone()))
        };
        Self {
            controller,
            client: Client::new(),
            qa_url: config.ci_qa_url.trim_end_matches('/').to_string(),
            qa_auth,
            gitops_repo_path: config.gitops_repo_path.clone(),
            values_file: config.values_file(),
        }
    }
}

#[async_trait]
impl EvidenceSource for BasicEvidence {
    async fn service_logs(&self, service: &str, _limit: u32) -> Result<String> {
        Ok(format!("log backend not configured for {service}"))
    }

    async fn error_logs(&self, _limit: u32) -> Result<String> {
        Ok("log backend not configured".into())
    }

    async fn metric_health(&self) -> Result<String> {
        Ok("metric backend not configured".into())
    }

    async fn controller_board(&self) -> Result<String> {
        let apps = self.controller.list_applications().await?;
        let mut lines: Vec<String> = apps
            .iter()
            .map(|a| format!("{}: {} ({}) tag={}", a.name, a.health.as_str(), a.sync, a.tag))
            .collect();
        lines.sort();
        Ok(lines.join("\n"))
    }

    async fn ci_job_status(&self) -> Result<String> {
        if self.qa_url.is_empty() {
            return Ok("CI server not configured".into());
        }
        let url = format!("{}/api/json?tree=jobs[name,color]", self.qa_url);
        let req = self.client.get(&url);
        let req = match &self.qa_auth {
            Some((user, token)) => req.basic_auth(user, Some(token)),
            None => req,
        };
        let resp: Value = req.send().await?.json().await?;
        let jobs = resp["jobs"]
            .as_array()
            .map(|jobs| {
                jobs.iter()
                    .map(|j| {
                        format!(
                            "{}: {}",
                            j["name"].as_str().unwrap_or(""),
                            j["color"].as_str().unwrap_or("")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(jobs)
    }

    async fn gitops_tags(&self) -> Result<String> {
        // Cheap textual dump straight from the working copy.
        let mut lines = Vec::new();
        if let Ok(dirs) = std::fs::read_dir(&self.gitops_repo_path) {
            for entry in dirs.flatten() {
                let vf = entry.path().join(&self.values_file);
                if let Ok(content) = std::fs::read_to_string(&vf) {
                    for line in content.lines() {
                        if line.trim_start().starts_with("tag:") {
                            lines.push(format!(
                                "{}: {}",
                                entry.file_name().to_string_lossy(),
                                line.trim()
                            ));
                        }
                    }
                }
            }
        }
        lines.sort();
        Ok(lines.join("\n"))
    }
}

//! Shared fixture for pipeline integration tests: a real GitOps working copy
//! backed by a bare "remote", plus in-memory fakes for every collaborator.

// Not every test binary exercises every fixture helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use goldenpath_core::clients::{
    AppStatus, BranchHeads, CiBuildResult, CiWorker, DeployController, EvidenceSource,
    ImageRegistry, MergeOutcome, Notifier, SourceHost, StageUpdate,
};
use goldenpath_core::config::Config;
use goldenpath_core::diagnostics::DiagnosticsEngine;
use goldenpath_core::llm::LlmError;
use goldenpath_core::notify::Notification;
use goldenpath_core::pipeline::Pipeline;
use goldenpath_core::registry::SharedState;
use goldenpath_core::roster::Roster;
use goldenpath_core::session::Session;
use goldenpath_core::types::{Health, JobStatus, MergeState};
use goldenpath_core::clients::DiagnosticModel;

// ── Git fixture ───────────────────────────────────────────────────────────

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Bare remote + working copy seeded with one values file per service.
pub fn setup_gitops_repo(root: &Path, services: &[(&str, &str)]) -> PathBuf {
    let remote = root.join("remote.git");
    std::fs::create_dir_all(&remote).unwrap();
    git(&remote, &["init", "--bare", "--initial-branch=master", "."]);

    let work = root.join("yaml-repo");
    let out = Command::new("git")
        .arg("clone")
        .arg(&remote)
        .arg(&work)
        .output()
        .expect("spawn git clone");
    assert!(out.status.success(), "clone failed");

    git(&work, &["config", "user.name", "fixture"]);
    git(&work, &["config", "user.email", "fixture@example.com"]);
    // Pin the unborn branch name regardless of init.defaultBranch.
    git(&work, &["symbolic-ref", "HEAD", "refs/heads/master"]);

    for (svc, tag) in services {
        let dir = work.join(svc);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("values-staging-ug.yaml"),
            format!("global:\n  image:\n    tag: \"{tag}\"\n"),
        )
        .unwrap();
    }
    git(&work, &["add", "-A"]);
    git(&work, &["commit", "-m", "seed values"]);
    git(&work, &["push", "-u", "origin", "master"]);
    work
}

pub fn read_values_tag(work: &Path, svc: &str) -> String {
    let content = std::fs::read_to_string(work.join(svc).join("values-staging-ug.yaml")).unwrap();
    content
        .lines()
        .find(|l| l.trim_start().starts_with("tag:"))
        .map(|l| l.trim().trim_start_matches("tag:").trim().trim_matches('"').to_string())
        .unwrap_or_default()
}

// ── Fakes ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeHost {
    pub merges: Mutex<HashMap<String, MergeOutcome>>,
    pub heads: Mutex<HashMap<String, BranchHeads>>,
    pub files: Mutex<HashMap<String, (String, String)>>,
}

impl FakeHost {
    pub fn set_merge(&self, svc: &str, state: MergeState, sha: &str, message: &str) {
        self.merges.lock().unwrap().insert(
            svc.to_string(),
            MergeOutcome {
                service: svc.to_string(),
                status: state,
                sha: sha.to_string(),
                message: message.to_string(),
            },
        );
    }

    pub fn set_heads(&self, svc: &str, master: &str, target: &str) {
        self.heads.lock().unwrap().insert(
            svc.to_string(),
            BranchHeads {
                master_sha: master.to_string(),
                target_sha: target.to_string(),
            },
        );
    }
}

#[async_trait]
impl SourceHost for FakeHost {
    async fn merge_branch(
        &self,
        service: &str,
        _target_branch: &str,
        _message: &str,
    ) -> Result<MergeOutcome> {
        Ok(self
            .merges
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or(MergeOutcome {
                service: service.to_string(),
                status: MergeState::Failed,
                sha: String::new(),
                message: "no merge configured".into(),
            }))
    }

    async fn branch_heads(
        &self,
        services: &[(String, String)],
    ) -> Result<HashMap<String, BranchHeads>> {
        let heads = self.heads.lock().unwrap();
        Ok(services
            .iter()
            .filter_map(|(svc, _)| heads.get(svc).map(|h| (svc.clone(), h.clone())))
            .collect())
    }

    async fn read_repo_file(&self, path: &str) -> Result<Option<(String, String)>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn write_repo_file(
        &self,
        path: &str,
        content: &str,
        prev_sha: Option<&str>,
        _message: &str,
    ) -> Result<bool> {
        let mut files = self.files.lock().unwrap();
        let current_sha = files.get(path).map(|(_, sha)| sha.clone());
        if current_sha.as_deref() != prev_sha {
            return Ok(false);
        }
        let next_sha = format!("sha-{}", files.len() + 1);
        files.insert(path.to_string(), (content.to_string(), next_sha));
        Ok(true)
    }

    async fn delete_repo_file(&self, path: &str, sha: &str, _message: &str) -> Result<bool> {
        let mut files = self.files.lock().unwrap();
        match files.get(path) {
            Some((_, current)) if current == sha => {
                files.remove(path);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(true),
        }
    }
}

#[derive(Default)]
pub struct FakeImages {
    /// `"service:tag"` entries that exist in the registry.
    pub existing: Mutex<Vec<String>>,
    /// When set, every probe fails with this detail text.
    pub probe_error: Mutex<Option<String>>,
}

impl FakeImages {
    pub fn add(&self, svc: &str, tag: &str) {
        self.existing.lock().unwrap().push(format!("{svc}:{tag}"));
    }
}

#[async_trait]
impl ImageRegistry for FakeImages {
    async fn check_image(&self, service: &str, tag: &str) -> (bool, String) {
        if let Some(err) = self.probe_error.lock().unwrap().clone() {
            return (false, err);
        }
        let key = format!("{service}:{tag}");
        if self.existing.lock().unwrap().contains(&key) {
            (true, String::new())
        } else {
            (false, "image not found".into())
        }
    }
}

#[derive(Default)]
pub struct FakeCi {
    pub build_results: Mutex<HashMap<String, CiBuildResult>>,
    pub qa_results: Mutex<HashMap<String, CiBuildResult>>,
}

impl FakeCi {
    pub fn set_qa_result(&self, job: &str, status: JobStatus) {
        self.qa_results.lock().unwrap().insert(
            job.to_string(),
            CiBuildResult {
                status,
                build_num: 42,
                duration: "3m10s".into(),
                url: format!("https://ci.example.com/job/{job}/42"),
                ..Default::default()
            },
        );
    }
}

#[async_trait]
impl CiWorker for FakeCi {
    fn job_url(&self, _service: &str, ci_repo: &str, build_num: Option<i64>) -> String {
        match build_num {
            Some(n) => format!("https://ci.example.com/job/{ci_repo}/{n}"),
            None => format!("https://ci.example.com/job/{ci_repo}"),
        }
    }

    async fn find_and_monitor_build(
        &self,
        service: &str,
        _ci_repo: &str,
        _updates: mpsc::UnboundedSender<StageUpdate>,
        _timeout_secs: u64,
        _wait_for_image_stage: bool,
    ) -> Result<CiBuildResult> {
        Ok(self
            .build_results
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or(CiBuildResult {
                status: JobStatus::Failed,
                duration: "0s".into(),
                ..Default::default()
            }))
    }

    async fn trigger_and_stream(
        &self,
        job: &str,
        _updates: mpsc::UnboundedSender<StageUpdate>,
    ) -> Result<CiBuildResult> {
        Ok(self
            .qa_results
            .lock()
            .unwrap()
            .get(job)
            .cloned()
            .unwrap_or(CiBuildResult {
                status: JobStatus::Success,
                build_num: 1,
                duration: "1m00s".into(),
                ..Default::default()
            }))
    }
}

#[derive(Default)]
pub struct FakeController {
    pub apps: Mutex<Vec<AppStatus>>,
    pub hard_syncs: Mutex<Vec<String>>,
}

impl FakeController {
    pub fn set_app(&self, name: &str, health: Health, tag: &str) {
        let mut apps = self.apps.lock().unwrap();
        if let Some(app) = apps.iter_mut().find(|a| a.name == name) {
            app.health = health;
            app.tag = tag.to_string();
            return;
        }
        apps.push(AppStatus {
            name: name.to_string(),
            health,
            sync: "Synced".into(),
            tag: tag.to_string(),
        });
    }
}

#[async_trait]
impl DeployController for FakeController {
    async fn list_applications(&self) -> Result<Vec<AppStatus>> {
        Ok(self.apps.lock().unwrap().clone())
    }

    async fn hard_sync(&self, app: &str) -> Result<()> {
        self.hard_syncs.lock().unwrap().push(app.to_string());
        Ok(())
    }

    async fn watch(&self, events: mpsc::Sender<Vec<AppStatus>>) -> Result<()> {
        loop {
            let apps = self.apps.lock().unwrap().clone();
            if events.send(apps).await.is_err() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl FakeNotifier {
    pub fn kinds(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| {
                serde_json::to_value(n).unwrap()["kind"]
                    .as_str()
                    .unwrap_or("")
                    .to_string()
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct FakeModel {
    pub diagnosis: String,
    pub actions_json: String,
}

impl Default for FakeModel {
    fn default() -> Self {
        Self {
            diagnosis: "Root cause: test fixture".into(),
            actions_json: "[]".into(),
        }
    }
}

#[async_trait]
impl DiagnosticModel for FakeModel {
    async fn complete(&self, system: &str, _prompt: &str) -> Result<String, LlmError> {
        if system.contains("remediation") {
            Ok(self.actions_json.clone())
        } else {
            Ok(self.diagnosis.clone())
        }
    }
}

#[derive(Default)]
pub struct FakeEvidence;

#[async_trait]
impl EvidenceSource for FakeEvidence {
    async fn service_logs(&self, service: &str, _limit: u32) -> Result<String> {
        Ok(format!("logs for {service}"))
    }
    async fn error_logs(&self, _limit: u32) -> Result<String> {
        Ok("no recent errors".into())
    }
    async fn metric_health(&self) -> Result<String> {
        Ok("metrics nominal".into())
    }
    async fn controller_board(&self) -> Result<String> {
        Ok("board".into())
    }
    async fn ci_job_status(&self) -> Result<String> {
        Ok("jobs idle".into())
    }
    async fn gitops_tags(&self) -> Result<String> {
        Ok("tags".into())
    }
}

// ── Harness ───────────────────────────────────────────────────────────────

pub struct Harness {
    pub _tmp: tempfile::TempDir,
    pub work: PathBuf,
    pub config: Arc<Config>,
    pub shared: Arc<SharedState>,
    pub pipeline: Arc<Pipeline>,
    pub host: Arc<FakeHost>,
    pub images: Arc<FakeImages>,
    pub ci: Arc<FakeCi>,
    pub controller: Arc<FakeController>,
    pub notifier: Arc<FakeNotifier>,
}

impl Harness {
    /// Fixture with real git repos for the listed `(service, deployed_tag)`
    /// pairs and permissive fakes everywhere else.
    pub fn new(services: &[(&str, &str)], model: FakeModel) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let work = setup_gitops_repo(tmp.path(), services);

        let mut config = Config::from_env().unwrap();
        config.data_dir = tmp.path().join("data").to_string_lossy().into_owned();
        config.gitops_repo_path = work.to_string_lossy().into_owned();
        config.country = "ug".into();
        config.namespace = String::new();
        config.target_branch = "pre-release-tw".into();
        config.settle_grace_secs = 2;
        config.deploy_watch_timeout_secs = 30;
        config.retry_max = 2;
        config.skip_jenkins_qa = false;
        let config = Arc::new(config);

        let shared = Arc::new(SharedState::new(config.live_state_path()));
        let host = Arc::new(FakeHost::default());
        let images = Arc::new(FakeImages::default());
        let ci = Arc::new(FakeCi::default());
        let controller = Arc::new(FakeController::default());
        let notifier = Arc::new(FakeNotifier::default());
        let diagnostics =
            DiagnosticsEngine::new(Arc::new(model), Arc::new(FakeEvidence));

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&config),
            Arc::clone(&shared),
            Arc::clone(&host) as Arc<dyn SourceHost>,
            Arc::clone(&images) as Arc<dyn ImageRegistry>,
            Arc::clone(&ci) as Arc<dyn CiWorker>,
            Arc::clone(&controller) as Arc<dyn DeployController>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            diagnostics,
        ));

        Harness {
            _tmp: tmp,
            work,
            config,
            shared,
            pipeline,
            host,
            images,
            ci,
            controller,
            notifier,
        }
    }

    pub async fn new_session(&self, id: &str) -> Arc<Session> {
        let sess = Session::new(id);
        sess.init_from(&self.shared, Roster::default()).await;
        sess
    }

    /// Spawn a pipeline run for `services` on a fresh session.
    pub fn spawn_run(
        &self,
        sess: &Arc<Session>,
        services: &[&str],
    ) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let sess = Arc::clone(sess);
        let services: Vec<String> = services.iter().map(|s| s.to_string()).collect();
        tokio::spawn(async move {
            let _ = pipeline.start(&sess, Some(services), false, "sam").await;
        })
    }

    /// Poll the shared snapshot until `pred` holds or `max_virtual_secs`
    /// elapse on the (paused) clock.
    pub async fn wait_shared<F>(&self, max_virtual_secs: u64, pred: F) -> bool
    where
        F: Fn(&goldenpath_core::state::Snapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(max_virtual_secs);
        loop {
            let (snapshot, _) = self.shared.read();
            if pred(&snapshot) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

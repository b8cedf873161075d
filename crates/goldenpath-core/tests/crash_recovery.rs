//! Crash recovery from the persisted live snapshot, including the
//! schema-corruption path.

use std::collections::HashMap;

use goldenpath_core::persist::{load_live_state, save_live_state};
use goldenpath_core::registry::SharedState;
use goldenpath_core::roster::Roster;
use goldenpath_core::session::Session;
use goldenpath_core::state::Snapshot;
use goldenpath_core::types::{RunStatus, RunSummary, StepStatus};

fn mid_run_snapshot() -> Snapshot {
    let mut steps = HashMap::new();
    steps.insert("merge".to_string(), StepStatus::Success);
    steps.insert("build".to_string(), StepStatus::Success);
    steps.insert("gitops".to_string(), StepStatus::Running);
    steps.insert("deploy".to_string(), StepStatus::Pending);
    steps.insert("jenkins".to_string(), StepStatus::Pending);

    let mut snap = Snapshot::default();
    snap.is_running = true;
    snap.live_step = "gitops".into();
    snap.active_run_id = "r3".into();
    snap.run_counter = 4;
    snap.current_steps = steps.clone();
    snap.runs_summary.push(RunSummary {
        id: "r3".into(),
        num: 3,
        status: RunStatus::Running,
        started_at: "11:02:33".into(),
        steps,
        ..Default::default()
    });
    snap
}

#[tokio::test]
async fn interrupted_run_is_surfaced_on_next_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live_state.json");
    save_live_state(&path, &mid_run_snapshot()).unwrap();

    // Process restart: fresh registry, fresh session.
    let shared = SharedState::new(path);
    let sess = Session::new("s1");
    sess.init_from(&shared, Roster::default()).await;

    let inner = sess.state.lock().await;
    assert!(!inner.snap.is_running, "restart must not resume the run");
    assert!(inner.snap.live_step.is_empty());
    let run = &inner.snap.runs_summary[0];
    assert_eq!(run.status, RunStatus::Interrupted);
    assert_eq!(run.steps["gitops"], StepStatus::Interrupted);
    assert_eq!(run.steps["merge"], StepStatus::Success, "finished steps keep their status");
    assert_eq!(run.steps["deploy"], StepStatus::Pending);
    assert_eq!(inner.snap.current_steps["gitops"], StepStatus::Interrupted);
    // The counter survives so the next run gets a fresh number.
    assert_eq!(inner.snap.run_counter, 4);
}

#[tokio::test]
async fn sessions_prefer_live_shared_state_over_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live_state.json");
    save_live_state(&path, &mid_run_snapshot()).unwrap();

    let shared = SharedState::new(path);
    // Another session already published newer in-memory state.
    let mut live = Snapshot::default();
    live.runs_summary.push(RunSummary {
        id: "r9".into(),
        num: 9,
        status: RunStatus::Success,
        ..Default::default()
    });
    shared.publish(live, false);

    let sess = Session::new("s2");
    sess.init_from(&shared, Roster::default()).await;
    let inner = sess.state.lock().await;
    assert_eq!(inner.snap.runs_summary[0].id, "r9");
}

#[test]
fn corrupted_wrapper_field_recovers_and_cleans_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live_state.json");
    std::fs::write(
        &path,
        r#"{
            "runs_summary": "ImmutableMutableProxy([{'id': 'r2', 'n': 2, 'st': 'degraded', 'dur': '8m12s', 't': '09:15:00', 'steps': {'merge': 'success', 'deploy': 'failed'}}])",
            "expected_tags": "ImmutableMutableProxy({'alive': 'pre-release-tw-abc123def4'})",
            "is_running": false,
            "_run_counter": 3
        }"#,
    )
    .unwrap();

    let snap = load_live_state(&path).expect("recovered snapshot");
    assert_eq!(snap.runs_summary.len(), 1);
    assert_eq!(snap.runs_summary[0].id, "r2");
    assert_eq!(snap.runs_summary[0].status, RunStatus::Degraded);
    assert_eq!(snap.runs_summary[0].steps["deploy"], StepStatus::Failed);
    assert_eq!(snap.expected_tags["alive"], "pre-release-tw-abc123def4");
    assert_eq!(snap.run_counter, 3);

    // The file on disk was rewritten under clean encoding.
    let raw = std::fs::read_to_string(&path).unwrap();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(v["runs_summary"].is_array());
    assert!(v["expected_tags"].is_object());

    // A second load needs no recovery.
    let again = load_live_state(&path).expect("clean reload");
    assert_eq!(again.runs_summary[0].id, "r2");
}

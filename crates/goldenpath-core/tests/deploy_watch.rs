//! Deploy-watch behaviour: settled-degraded short-circuit, timeout retries,
//! and the diagnostics that follow.

mod common;

use common::{git_available, FakeModel, Harness};
use goldenpath_core::types::{
    ActionKind, ActionStatus, Health, MergeState, RunStatus, StepStatus,
};

const SHA_A: &str = "aaaa1111aaaa1111aaaa1111aaaa1111aaaa1111";
const SHA_B: &str = "bbbb2222bbbb2222bbbb2222bbbb2222bbbb2222";

fn degraded_fixture() -> Harness {
    let h = Harness::new(
        &[
            ("alive", "pre-release-tw-00aa00aa00"),
            ("wallet", "pre-release-tw-00bb00bb00"),
        ],
        FakeModel {
            diagnosis: "Root cause: wallet image crash-looping".into(),
            actions_json:
                r#"[{"action":"hard_sync","target":"wallet","confidence":85,"reason":"resync"}]"#
                    .into(),
        },
    );
    h.host.set_merge("alive", MergeState::Success, SHA_A, "");
    h.host.set_merge("wallet", MergeState::Success, SHA_B, "");
    h.host.set_heads("alive", "feed0000", SHA_A);
    h.host.set_heads("wallet", "feed0000", SHA_B);
    h.images.add("alive", &format!("pre-release-tw-{}", &SHA_A[..10]));
    h.images.add("wallet", &format!("pre-release-tw-{}", &SHA_B[..10]));
    h.controller
        .set_app("alive", Health::Progressing, "pre-release-tw-00aa00aa00");
    h.controller
        .set_app("wallet", Health::Progressing, "pre-release-tw-00bb00bb00");
    h
}

#[tokio::test(start_paused = true)]
async fn settled_degraded_skips_retries_and_pauses() {
    if !git_available() {
        return;
    }
    let h = degraded_fixture();
    let tag_a = format!("pre-release-tw-{}", &SHA_A[..10]);
    let tag_b = format!("pre-release-tw-{}", &SHA_B[..10]);

    let sess = h.new_session("s1").await;
    let run = h.spawn_run(&sess, &["alive", "wallet"]);

    assert!(
        h.wait_shared(300, |s| s.live_step == "deploy" && !s.expected_tags.is_empty())
            .await
    );
    // alive converges; wallet lands Degraded on the new tag. Zero services
    // Progressing → the settle grace starts ticking.
    h.controller.set_app("alive", Health::Healthy, &tag_a);
    h.controller.set_app("wallet", Health::Degraded, &tag_b);

    assert!(
        h.wait_shared(600, |s| s.paused && s.pause_step == "deploy").await,
        "pipeline never paused on deploy degradation"
    );

    let (snap, _) = h.shared.read();
    // The model's hard_sync (confidence 85, safe set) auto-executed.
    let auto = snap
        .proposed_actions
        .iter()
        .find(|a| a.action == ActionKind::HardSync)
        .expect("hard_sync proposal");
    assert_eq!(auto.status, ActionStatus::Done);
    assert_eq!(auto.target, "wallet");
    // A rollback stays on the table for the degraded service.
    let rollback = snap
        .proposed_actions
        .iter()
        .find(|a| a.action == ActionKind::RollbackImage && a.target == "wallet")
        .expect("rollback proposal for wallet");
    assert_eq!(rollback.confidence, 70);
    assert_eq!(rollback.status, ActionStatus::Proposed);

    assert!(snap.diagnostics.contains("crash-looping"));
    assert!(h.notifier.kinds().contains(&"deploy_degraded".to_string()));
    // Degraded services were hard-synced again before diagnostics.
    assert!(h.hard_sync_count("wallet") >= 2);

    // Force-proceed to let the run finish.
    h.shared.set_pause_action("proceed");
    run.await.unwrap();

    let (snap, _) = h.shared.read();
    let top = &snap.runs_summary[0];
    assert_eq!(top.status, RunStatus::Degraded);
    assert_eq!(top.steps["deploy"], StepStatus::Failed);
    assert_eq!(top.steps["jenkins"], StepStatus::Success);
    assert!(top.mttr_secs >= 0.0);
}

#[tokio::test(start_paused = true)]
async fn timeout_exhausts_retries_then_abort_finalizes() {
    if !git_available() {
        return;
    }
    let h = degraded_fixture();
    // Controller never moves: both apps stay Progressing on stale tags, so
    // every attempt times out (tag mismatch keeps forcing Progressing).

    let sess = h.new_session("s1").await;
    let run = h.spawn_run(&sess, &["alive", "wallet"]);

    assert!(
        h.wait_shared(900, |s| s.paused && s.pause_step == "deploy").await,
        "retries never exhausted into a pause"
    );

    h.shared.request_abort();
    run.await.unwrap();

    let (snap, _) = h.shared.read();
    let top = &snap.runs_summary[0];
    assert_eq!(top.status, RunStatus::Failed);
    assert!(h.notifier.kinds().contains(&"deploy_aborted".to_string()));
    // Abort flag is cleared at finalization.
    assert!(!h.shared.abort_requested());
}

impl Harness {
    fn hard_sync_count(&self, app: &str) -> usize {
        self.controller
            .hard_syncs
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.as_str() == app)
            .count()
    }
}

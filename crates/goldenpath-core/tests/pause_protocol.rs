//! Cross-session pause protocol: executor election, retry, and the
//! rollback decision arriving from another session.

mod common;

use common::{git_available, read_values_tag, FakeModel, Harness};
use goldenpath_core::types::{Health, MergeState, RunStatus, StepStatus};

const SHA_A: &str = "aaaa1111aaaa1111aaaa1111aaaa1111aaaa1111";
const SHA_B: &str = "bbbb2222bbbb2222bbbb2222bbbb2222bbbb2222";

const OLD_A: &str = "pre-release-tw-00aa00aa00";
const OLD_B: &str = "pre-release-tw-00bb00bb00";

fn fixture() -> Harness {
    let h = Harness::new(&[("alive", OLD_A), ("wallet", OLD_B)], FakeModel::default());
    h.host.set_merge("alive", MergeState::Success, SHA_A, "");
    h.host.set_merge("wallet", MergeState::Success, SHA_B, "");
    h.host.set_heads("alive", "feed0000", SHA_A);
    h.host.set_heads("wallet", "feed0000", SHA_B);
    h.images.add("alive", &format!("pre-release-tw-{}", &SHA_A[..10]));
    h.images.add("wallet", &format!("pre-release-tw-{}", &SHA_B[..10]));
    h.controller.set_app("alive", Health::Progressing, OLD_A);
    h.controller.set_app("wallet", Health::Progressing, OLD_B);
    h
}

#[tokio::test(start_paused = true)]
async fn second_session_loses_executor_election() {
    if !git_available() {
        return;
    }
    let h = fixture();
    let sess_a = h.new_session("a").await;
    let sess_b = h.new_session("b").await;

    let run = h.spawn_run(&sess_a, &["alive", "wallet"]);
    assert!(h.wait_shared(120, |s| s.is_running).await);

    // Session B tries to start while A is live: the gate + shared recheck
    // make it return silently without touching the run list.
    h.pipeline
        .start(&sess_b, Some(vec!["alive".into()]), false, "eve")
        .await
        .unwrap();

    let (snap, _) = h.shared.read();
    assert_eq!(snap.runs_summary.len(), 1);
    assert_eq!(snap.run_counter, 2, "exactly one run was created");
    assert!(!sess_b.state.lock().await.is_executor);

    h.shared.request_abort();
    run.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_reenters_the_failed_step() {
    if !git_available() {
        return;
    }
    let h = fixture();
    // First merge attempt fails for wallet.
    h.host
        .set_merge("wallet", MergeState::Failed, "", "merge conflict");

    let sess = h.new_session("a").await;
    let run = h.spawn_run(&sess, &["alive", "wallet"]);

    assert!(
        h.wait_shared(120, |s| s.paused && s.pause_step == "merge").await,
        "merge failure never paused"
    );
    let (snap, _) = h.shared.read();
    assert!(snap.pause_error.contains("wallet: merge conflict"));

    // Fix the upstream condition, then retry from another session.
    h.host.set_merge("wallet", MergeState::Success, SHA_B, "");
    h.shared.set_pause_action("retry");

    assert!(
        h.wait_shared(300, |s| s.live_step == "deploy").await,
        "retry did not re-run the merge step"
    );
    let (snap, _) = h.shared.read();
    assert_eq!(snap.current_steps["merge"], StepStatus::Success);

    let tag_a = format!("pre-release-tw-{}", &SHA_A[..10]);
    let tag_b = format!("pre-release-tw-{}", &SHA_B[..10]);
    h.controller.set_app("alive", Health::Healthy, &tag_a);
    h.controller.set_app("wallet", Health::Healthy, &tag_b);
    run.await.unwrap();

    let (snap, _) = h.shared.read();
    assert_eq!(snap.runs_summary[0].status, RunStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn rollback_decision_from_observer_session_recovers_the_deploy() {
    if !git_available() {
        return;
    }
    let h = fixture();
    let tag_a = format!("pre-release-tw-{}", &SHA_A[..10]);
    let tag_b = format!("pre-release-tw-{}", &SHA_B[..10]);

    let sess_a = h.new_session("a").await;
    let run = h.spawn_run(&sess_a, &["alive", "wallet"]);

    assert!(
        h.wait_shared(300, |s| s.live_step == "deploy" && !s.expected_tags.is_empty())
            .await
    );
    // wallet settles Degraded on the new tag → degraded handling → pause.
    h.controller.set_app("alive", Health::Healthy, &tag_a);
    h.controller.set_app("wallet", Health::Degraded, &tag_b);
    assert!(
        h.wait_shared(600, |s| s.paused && s.pause_step == "deploy").await,
        "deploy degradation never paused"
    );

    // Session B (an observer) clicks Rollback; the controller recovers once
    // the old image is back.
    h.controller.set_app("wallet", Health::Healthy, OLD_B);
    h.shared.set_pause_action("rollback");

    run.await.unwrap();

    // The wallet values file points at the previous tag again.
    assert_eq!(read_values_tag(&h.work, "wallet"), OLD_B);
    // alive keeps the new tag.
    assert_eq!(read_values_tag(&h.work, "alive"), tag_a);

    let kinds = h.notifier.kinds();
    assert!(kinds.contains(&"deploy_rolled_back".to_string()), "{kinds:?}");

    let (snap, _) = h.shared.read();
    let top = &snap.runs_summary[0];
    assert_eq!(top.steps["deploy"], StepStatus::Success);
    assert_eq!(top.steps["jenkins"], StepStatus::Success);
    assert_eq!(top.status, RunStatus::Success);
}

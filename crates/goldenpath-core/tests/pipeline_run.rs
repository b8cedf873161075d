//! End-to-end pipeline runs against the fake collaborators and a real
//! GitOps working copy.

mod common;

use common::{git_available, read_values_tag, FakeModel, Harness};
use goldenpath_core::types::{
    BuildPhase, GitopsPhase, Health, MergeState, RunStatus, StepStatus,
};

const SHA_A: &str = "aaaa1111aaaa1111aaaa1111aaaa1111aaaa1111";
const SHA_B: &str = "bbbb2222bbbb2222bbbb2222bbbb2222bbbb2222";

#[tokio::test(start_paused = true)]
async fn happy_path_two_services() {
    if !git_available() {
        return;
    }
    let h = Harness::new(
        &[
            ("alive", "pre-release-tw-00aa00aa00"),
            ("wallet", "pre-release-tw-00bb00bb00"),
        ],
        FakeModel::default(),
    );

    let tag_a = format!("pre-release-tw-{}", &SHA_A[..10]);
    let tag_b = format!("pre-release-tw-{}", &SHA_B[..10]);
    h.host.set_merge("alive", MergeState::Success, SHA_A, "");
    h.host.set_merge("wallet", MergeState::Success, SHA_B, "");
    h.host.set_heads("alive", "feed0000", SHA_A);
    h.host.set_heads("wallet", "feed0000", SHA_B);
    h.images.add("alive", &tag_a);
    h.images.add("wallet", &tag_b);
    h.controller
        .set_app("alive", Health::Progressing, "pre-release-tw-00aa00aa00");
    h.controller
        .set_app("wallet", Health::Progressing, "pre-release-tw-00bb00bb00");

    let sess = h.new_session("s1").await;
    let run = h.spawn_run(&sess, &["alive", "wallet"]);

    // Once the deploy step is live with tag verification armed, let the
    // controller converge.
    assert!(
        h.wait_shared(300, |s| s.live_step == "deploy" && !s.expected_tags.is_empty())
            .await,
        "deploy step never armed tag verification"
    );
    h.controller.set_app("alive", Health::Healthy, &tag_a);
    h.controller.set_app("wallet", Health::Healthy, &tag_b);

    run.await.unwrap();

    let (snap, _) = h.shared.read();
    assert!(!snap.is_running);
    let top = &snap.runs_summary[0];
    assert_eq!(top.status, RunStatus::Success);
    for step in ["merge", "build", "gitops", "deploy", "jenkins"] {
        assert_eq!(top.steps[step], StepStatus::Success, "step {step}");
    }

    // expected_tags present exactly for pushed services.
    assert_eq!(snap.expected_tags["alive"], tag_a);
    assert_eq!(snap.expected_tags["wallet"], tag_b);

    // Propagation tracked for both services.
    assert_eq!(top.propagation_stats.len(), 2);
    for p in &top.propagation_stats {
        assert!(p.push_to_healthy_secs >= 0.0, "{} never converged", p.service);
        assert_eq!(p.status, "healthy");
    }

    // Values files rewritten and pushed.
    assert_eq!(read_values_tag(&h.work, "alive"), tag_a);
    assert_eq!(read_values_tag(&h.work, "wallet"), tag_b);

    // Commit message carries the run marker.
    let out = std::process::Command::new("git")
        .arg("-C")
        .arg(&h.work)
        .args(["log", "-1", "--format=%s"])
        .output()
        .unwrap();
    let subject = String::from_utf8_lossy(&out.stdout);
    assert!(subject.contains("qa-goldenpath #1 staging-ug (sam)"), "{subject}");
    assert!(subject.contains(&format!("alive={tag_a}")), "{subject}");

    // Success + QA-complete notifications were assembled.
    let kinds = h.notifier.kinds();
    assert!(kinds.contains(&"deploy_success".to_string()), "{kinds:?}");
    assert!(kinds.contains(&"qa_complete".to_string()), "{kinds:?}");

    // Durable record matches the run.
    let records = h.pipeline.run_store.load().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "r1");
    assert_eq!(records[0].status, RunStatus::Success);
    assert_eq!(records[0].expected_tags["wallet"], tag_b);
}

#[tokio::test(start_paused = true)]
async fn noop_merge_with_stale_image_falls_back_to_deployed_tag() {
    if !git_available() {
        return;
    }
    let deployed = "pre-release-tw-01dd01dd01";
    let h = Harness::new(&[("cashier", deployed)], FakeModel::default());

    let sha = "cccc3333cccc3333cccc3333cccc3333cccc3333";
    h.host
        .set_merge("cashier", MergeState::NoOp, "", "already up to date");
    h.host.set_heads("cashier", sha, sha);
    // No image registered for the expected tag: the probe misses.
    h.controller.set_app("cashier", Health::Healthy, deployed);

    let sess = h.new_session("s1").await;
    let run = h.spawn_run(&sess, &["cashier"]);
    run.await.unwrap();

    let (snap, _) = h.shared.read();
    let top = &snap.runs_summary[0];
    assert_eq!(top.status, RunStatus::Success);

    // Shas populated from target HEAD even though the merge was a no-op.
    assert_eq!(snap.shas["cashier"], sha);

    // Build fell back to the deployed tag.
    let build = &snap.build_statuses[0];
    assert_eq!(build.phase, BuildPhase::Exists);
    assert_eq!(build.tag, deployed);
    assert!(build.message.contains("No-op"));

    // GitOps saw the deployed tag already current.
    assert_eq!(snap.gitops_statuses[0].phase, GitopsPhase::Unchanged);

    // Nothing pushed → tag verification disabled → controller trusted.
    assert!(snap.expected_tags.is_empty());
    assert_eq!(top.steps["deploy"], StepStatus::Success);
}

//! Testable property 6 (`SPEC_FULL.md` §8): for a given `(project,
//! instance)`, concurrent inbound messages never interleave at the
//! runtime — the per-instance submit lock serializes them end to end.

use std::sync::Arc;
use std::time::Duration;

use discode::agents::AgentRegistry;
use discode::pending::PendingTracker;
use discode::router::Router;

use super::support::{sample_inbound, sample_project, seeded_state, wait_until, FakeMessaging, FakeRuntime};

#[tokio::test]
async fn concurrent_inbound_for_the_same_instance_never_overlaps_at_the_runtime() {
    let project_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let state_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let project = sample_project("demo", project_dir.path(), "claude", "claude", "ch-1");
    let state = seeded_state(state_dir.path(), project).await;

    let runtime = Arc::new(FakeRuntime::with_submit_delay(Duration::from_millis(50)));
    let messaging = Arc::new(FakeMessaging::default());
    let pending = Arc::new(PendingTracker::new());
    pending.set_messaging(Arc::clone(&messaging) as Arc<dyn discode::messaging::MessagingCapability>).await;
    let agents = Arc::new(AgentRegistry::new());

    let router = Arc::new(Router::new(
        Arc::clone(&state),
        Arc::clone(&messaging) as Arc<dyn discode::messaging::MessagingCapability>,
        Arc::clone(&runtime) as Arc<dyn discode::runtime::Runtime>,
        Arc::clone(&pending),
        agents,
    ));

    router.handle_inbound(sample_inbound("demo", "claude", "ch-1", "first", Some("m1"))).await;
    router.handle_inbound(sample_inbound("demo", "claude", "ch-1", "second", Some("m2"))).await;

    let both_landed = wait_until(|| {
        let runtime = Arc::clone(&runtime);
        async move { runtime.submissions_snapshot().await.len() == 2 }
    })
    .await;
    assert!(both_landed, "both submissions never reached the runtime");

    assert_eq!(runtime.peak_in_flight().await, 1, "submissions overlapped at the runtime");

    let submissions = runtime.submissions_snapshot().await;
    assert_eq!(submissions[0].text, "first");
    assert_eq!(submissions[1].text, "second");
}

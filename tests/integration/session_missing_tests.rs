//! Scenario S4: the runtime reports the target window/session is gone; the
//! router posts canned recovery guidance and marks the message failed
//! instead of leaving it pending forever.

use std::sync::Arc;

use discode::agents::AgentRegistry;
use discode::pending::PendingTracker;
use discode::router::Router;

use super::support::{sample_inbound, sample_project, seeded_state, wait_until, FakeMessaging, FakeRuntime};

#[tokio::test]
async fn session_missing_error_produces_guidance_and_failed_reaction() {
    let project_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let state_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let project = sample_project("demo", project_dir.path(), "claude", "claude", "ch-1");
    let state = seeded_state(state_dir.path(), project).await;

    let runtime = Arc::new(FakeRuntime::failing());
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

    router.handle_inbound(sample_inbound("demo", "claude", "ch-1", "anything", Some("m2"))).await;

    let replied = wait_until(|| {
        let messaging = Arc::clone(&messaging);
        async move { !messaging.sent_text_snapshot().await.is_empty() }
    })
    .await;
    assert!(replied, "router never sent recovery guidance");

    let sent_text = messaging.sent_text_snapshot().await;
    assert_eq!(sent_text.len(), 1);
    assert_eq!(sent_text[0].0, "ch-1");
    assert!(sent_text[0].1.contains("discode new --name demo"));

    let reactions = messaging.reactions_snapshot().await;
    assert!(reactions.iter().any(|(channel, id, state)| channel == "ch-1"
        && id == "m2"
        && *state == discode::messaging::ReactionState::Error));
}

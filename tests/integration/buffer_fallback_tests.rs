//! Scenario S2: the agent has no event hook (or stays silent); after the
//! configured fallback delay the router synthesizes a reply from the
//! runtime's own buffer and resolves the pending reaction.

use std::sync::Arc;

use discode::agents::AgentRegistry;
use discode::pending::PendingTracker;
use discode::router::Router;

use super::support::{sample_inbound, sample_project, seeded_state, wait_until, FakeMessaging, FakeRuntime};

#[tokio::test(start_paused = true)]
async fn buffer_fallback_answers_when_hook_stays_silent() {
    let project_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let state_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let project = sample_project("demo", project_dir.path(), "claude", "claude", "ch-1");
    let state = seeded_state(state_dir.path(), project).await;

    let runtime = Arc::new(FakeRuntime::with_buffer("$ build\n… compiling …\n❯ done\n"));
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

    router.handle_inbound(sample_inbound("demo", "claude", "ch-1", "build", Some("m1"))).await;

    let replied = wait_until(|| {
        let messaging = Arc::clone(&messaging);
        async move { !messaging.sent_text_snapshot().await.is_empty() }
    })
    .await;
    assert!(replied, "fallback never posted a reply");

    let sent_text = messaging.sent_text_snapshot().await;
    assert_eq!(sent_text.len(), 1);
    assert_eq!(sent_text[0].0, "ch-1");
    assert!(sent_text[0].1.contains("❯ done"));

    let reactions = messaging.reactions_snapshot().await;
    assert!(reactions.iter().any(|(channel, id, state)| channel == "ch-1"
        && id == "m1"
        && *state == discode::messaging::ReactionState::Success));
}

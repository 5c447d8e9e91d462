//! Scenario S1: a chat message reaches the runtime, the agent's hook
//! reports `session.idle`, and the reply plus a success reaction land back
//! in the originating channel.

use std::sync::Arc;

use discode::agents::AgentRegistry;
use discode::pending::PendingTracker;
use discode::router::Router;

use super::support::{sample_inbound, sample_project, seeded_state, wait_until, FakeMessaging, FakeRuntime};

#[tokio::test]
async fn hook_round_trip_delivers_reply_and_reaction() {
    let project_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let state_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let project = sample_project("demo", project_dir.path(), "claude", "claude", "ch-1");
    let state = seeded_state(state_dir.path(), project).await;

    let runtime = Arc::new(FakeRuntime::default());
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

    router.handle_inbound(sample_inbound("demo", "claude", "ch-1", "hello", Some("m1"))).await;

    let delivered = wait_until(|| {
        let runtime = Arc::clone(&runtime);
        async move { !runtime.submissions_snapshot().await.is_empty() }
    })
    .await;
    assert!(delivered, "runtime never received the submission");

    let submissions = runtime.submissions_snapshot().await;
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].session, "demo");
    assert_eq!(submissions[0].window, "claude");
    assert_eq!(submissions[0].text, "hello");

    let reactions = messaging.reactions_snapshot().await;
    assert!(reactions.iter().any(|(channel, id, state)| channel == "ch-1"
        && id == "m1"
        && *state == discode::messaging::ReactionState::Pending));

    router
        .handle_session_idle("demo", "claude", "ch-1", Some("Hi!"))
        .await
        .unwrap_or_else(|err| panic!("handle_session_idle: {err}"));

    let sent_text = messaging.sent_text_snapshot().await;
    assert_eq!(sent_text, vec![("ch-1".to_string(), "Hi!".to_string())]);

    let reactions = messaging.reactions_snapshot().await;
    assert!(reactions.iter().any(|(channel, id, state)| channel == "ch-1"
        && id == "m1"
        && *state == discode::messaging::ReactionState::Success));

    let updated = state.get_project("demo").await.unwrap_or_else(|| panic!("project vanished"));
    assert!(updated.last_active > chrono::DateTime::from_timestamp(0, 0).unwrap_or_default());
}

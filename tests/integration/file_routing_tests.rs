//! Scenario S3: an agent's `session.idle` turn text mentions a file under
//! the project root; the router strips the mention from the posted text
//! and sends the file as a separate attachment.

use std::sync::Arc;

use discode::agents::AgentRegistry;
use discode::pending::PendingTracker;
use discode::router::Router;

use super::support::{sample_project, seeded_state, FakeMessaging, FakeRuntime};

#[tokio::test]
async fn agent_output_file_is_routed_separately_from_text() {
    let project_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let state_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let out_path = project_dir.path().join("out.png");
    std::fs::write(&out_path, b"data").unwrap_or_else(|err| panic!("write: {err}"));

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

    let text = format!("done see {}", out_path.display());
    router
        .handle_session_idle("demo", "claude", "ch-1", Some(&text))
        .await
        .unwrap_or_else(|err| panic!("handle_session_idle: {err}"));

    let sent_text = messaging.sent_text_snapshot().await;
    assert_eq!(sent_text.len(), 1);
    assert_eq!(sent_text[0].0, "ch-1");
    assert!(!sent_text[0].1.contains(&out_path.display().to_string()));

    let sent_files = messaging.sent_files.lock().await.clone();
    assert_eq!(sent_files.len(), 1);
    assert_eq!(sent_files[0].0, "ch-1");
    assert_eq!(sent_files[0].2, vec!["out.png".to_string()]);
}

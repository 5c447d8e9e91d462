//! Scenario S5: a project with two instances of the same agent type routes
//! a hook event addressed to one instance id to that instance's channel
//! only, never the other.

use std::collections::HashMap;
use std::sync::Arc;

use discode::agents::AgentRegistry;
use discode::pending::PendingTracker;
use discode::project_service::resolve_instance;
use discode::router::Router;
use discode::state::{Instance, Project};

use super::support::{sample_inbound, seeded_state, wait_until, FakeMessaging, FakeRuntime};

fn two_instance_project(project_path: &std::path::Path) -> Project {
    let mut project = Project {
        project_name: "multi".to_string(),
        project_path: project_path.to_path_buf(),
        session_name: "multi".to_string(),
        instances: HashMap::new(),
        channels: HashMap::new(),
        created_at: chrono::DateTime::from_timestamp(0, 0).unwrap_or_default(),
        last_active: chrono::DateTime::from_timestamp(0, 0).unwrap_or_default(),
        instance_order: Vec::new(),
    };
    project.upsert_instance(Instance {
        instance_id: "claude".to_string(),
        agent_type: "claude".to_string(),
        window_name: "claude".to_string(),
        channel_id: Some("ch-1".to_string()),
        event_hook: false,
        container_mode: false,
        container_id: None,
        container_name: None,
    });
    project.upsert_instance(Instance {
        instance_id: "claude-2".to_string(),
        agent_type: "claude".to_string(),
        window_name: "claude-2".to_string(),
        channel_id: Some("ch-2".to_string()),
        event_hook: false,
        container_mode: false,
        container_id: None,
        container_name: None,
    });
    project
}

#[tokio::test]
async fn hook_event_with_instance_id_reaches_only_that_channel() {
    let project_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let state_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let project = two_instance_project(project_dir.path());
    let state = seeded_state(state_dir.path(), project.clone()).await;

    let runtime = Arc::new(FakeRuntime::default());
    let messaging = Arc::new(FakeMessaging::default());
    let pending = Arc::new(PendingTracker::new());
    pending.set_messaging(Arc::clone(&messaging) as Arc<dyn discode::messaging::MessagingCapability>).await;
    let agents = Arc::new(AgentRegistry::new());

    let router = Router::new(
        Arc::clone(&state),
        Arc::clone(&messaging) as Arc<dyn discode::messaging::MessagingCapability>,
        Arc::clone(&runtime) as Arc<dyn discode::runtime::Runtime>,
        Arc::clone(&pending),
        agents,
    );

    let instance = resolve_instance(&project, Some("claude-2"), "claude").unwrap_or_else(|| panic!("instance not found"));
    let channel_id = instance.channel_id.clone().unwrap_or_else(|| panic!("no channel bound"));
    assert_eq!(channel_id, "ch-2");

    router
        .handle_session_idle("multi", "claude-2", &channel_id, Some("done"))
        .await
        .unwrap_or_else(|err| panic!("handle_session_idle: {err}"));

    let sent_text = messaging.sent_text_snapshot().await;
    assert_eq!(sent_text, vec![("ch-2".to_string(), "done".to_string())]);
    assert!(!sent_text.iter().any(|(channel, _)| channel == "ch-1"));
}

/// An inbound message with no mapped instance id must resolve by the
/// channel it arrived on before falling back to the primary instance for
/// the agent type, so a reply to `claude-2@ch-2` never lands on `claude`'s
/// window (`SPEC_FULL.md` §4.5 step 2).
#[tokio::test]
async fn inbound_without_instance_id_routes_by_channel_not_primary() {
    let project_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let state_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let project = two_instance_project(project_dir.path());
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

    router.handle_inbound(sample_inbound("multi", "claude", "ch-2", "hello", Some("m1"))).await;

    let submitted = wait_until(|| {
        let runtime = Arc::clone(&runtime);
        async move { !runtime.submissions_snapshot().await.is_empty() }
    })
    .await;
    assert!(submitted, "router never submitted to a window");

    let submissions = runtime.submissions_snapshot().await;
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].window, "claude-2");
}

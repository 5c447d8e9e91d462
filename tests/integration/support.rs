//! Shared test fakes for router/messaging/runtime integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use discode::messaging::{Attachment, ChannelBinding, InboundCallback, InboundMessage, MessagingCapability, OutboundFile, ReactionState};
use discode::runtime::{AgentHint, Runtime, Signal, StyledFrame, WindowSnapshot};
use discode::state::{Instance, Project, StateStore};
use discode::Result;
use tokio::sync::Mutex;

/// One recorded `(session, window, text)` submission to [`FakeRuntime`].
#[derive(Debug, Clone)]
pub struct Submission {
    pub session: String,
    pub window: String,
    pub text: String,
}

/// A `Runtime` test double: records every submitted keystroke sequence,
/// serves a fixed buffer/frame for fallback checks, and can be configured
/// to fail submissions the way a vanished tmux session would.
#[derive(Default)]
pub struct FakeRuntime {
    pub submissions: Mutex<Vec<Submission>>,
    pub buffer: Mutex<String>,
    pub fail_with_session_missing: bool,
    /// Artificial delay inside `type_keys_to_window`, for exercising the
    /// router's per-instance submit lock under overlapping calls.
    pub submit_delay: Option<std::time::Duration>,
    /// In-flight / peak concurrent `type_keys_to_window` call counters, for
    /// asserting the router's per-instance submit lock serializes calls.
    pub in_flight: Mutex<u32>,
    pub peak_in_flight: Mutex<u32>,
}

impl FakeRuntime {
    pub fn with_buffer(buffer: impl Into<String>) -> Self {
        Self {
            buffer: Mutex::new(buffer.into()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_with_session_missing: true,
            ..Self::default()
        }
    }

    pub fn with_submit_delay(delay: std::time::Duration) -> Self {
        Self {
            submit_delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn submissions_snapshot(&self) -> Vec<Submission> {
        self.submissions.lock().await.clone()
    }

    pub async fn peak_in_flight(&self) -> u32 {
        *self.peak_in_flight.lock().await
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn get_or_create_session(&self, project_name: &str, _first_window: Option<&str>) -> Result<String> {
        Ok(project_name.to_string())
    }

    async fn set_session_env(&self, _session: &str, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn window_exists(&self, _session: &str, _window: &str) -> Result<bool> {
        Ok(true)
    }

    async fn start_agent_in_window(&self, _session: &str, _window: &str, _shell_command: &str) -> Result<()> {
        Ok(())
    }

    async fn type_keys_to_window(&self, session: &str, window: &str, text: &str, _agent_hint: Option<&AgentHint>) -> Result<()> {
        if self.fail_with_session_missing {
            return Err(discode::AppError::Runtime(format!("can't find window {window} in session {session}")));
        }
        {
            let mut in_flight = self.in_flight.lock().await;
            *in_flight += 1;
            let mut peak = self.peak_in_flight.lock().await;
            *peak = (*peak).max(*in_flight);
        }
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        self.submissions.lock().await.push(Submission {
            session: session.to_string(),
            window: window.to_string(),
            text: text.to_string(),
        });
        *self.in_flight.lock().await -= 1;
        Ok(())
    }

    async fn send_enter_to_window(&self, _session: &str, _window: &str, _agent_hint: Option<&AgentHint>) -> Result<()> {
        Ok(())
    }

    async fn get_window_buffer(&self, _session: &str, _window: &str) -> Result<String> {
        Ok(self.buffer.lock().await.clone())
    }

    async fn get_window_frame(&self, _session: &str, _window: &str, _cols: Option<u16>, _rows: Option<u16>) -> Result<Option<StyledFrame>> {
        Ok(None)
    }

    async fn resize_window(&self, _session: &str, _window: &str, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    async fn stop_window(&self, _session: &str, _window: &str, _signal: Signal) -> Result<bool> {
        Ok(true)
    }

    async fn list_windows(&self, _session: Option<&str>) -> Result<Vec<WindowSnapshot>> {
        Ok(Vec::new())
    }

    async fn dispose(&self, _signal: Signal) -> Result<()> {
        Ok(())
    }
}

/// A `MessagingCapability` test double: records every send/reaction call.
#[derive(Default)]
pub struct FakeMessaging {
    pub sent_text: Mutex<Vec<(String, String)>>,
    pub sent_files: Mutex<Vec<(String, String, Vec<String>)>>,
    pub reactions: Mutex<Vec<(String, String, ReactionState)>>,
    pub channel_maps: Mutex<Vec<HashMap<String, ChannelBinding>>>,
    pub callback: std::sync::Mutex<Option<InboundCallback>>,
}

impl FakeMessaging {
    pub async fn sent_text_snapshot(&self) -> Vec<(String, String)> {
        self.sent_text.lock().await.clone()
    }

    pub async fn reactions_snapshot(&self) -> Vec<(String, String, ReactionState)> {
        self.reactions.lock().await.clone()
    }
}

#[async_trait]
impl MessagingCapability for FakeMessaging {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<()> {
        self.sent_text.lock().await.push((channel_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_files(&self, channel_id: &str, text: &str, files: &[OutboundFile]) -> Result<()> {
        let names = files.iter().map(|f| f.file_name.clone()).collect();
        self.sent_files.lock().await.push((channel_id.to_string(), text.to_string(), names));
        Ok(())
    }

    async fn set_reaction(&self, channel_id: &str, message_id: &str, state: ReactionState) -> Result<()> {
        self.reactions.lock().await.push((channel_id.to_string(), message_id.to_string(), state));
        Ok(())
    }

    async fn ensure_channel(&self, project_name: &str, agent_type: &str, instance_id: &str) -> Result<String> {
        Ok(format!("{project_name}-{agent_type}-{instance_id}"))
    }

    fn register_inbound_callback(&self, callback: InboundCallback) {
        *self.callback.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    async fn update_channel_map(&self, map: HashMap<String, ChannelBinding>) {
        self.channel_maps.lock().await.push(map);
    }
}

/// Build a `StateStore` backed by a fresh file under `dir`, pre-seeded
/// with `project`.
pub async fn seeded_state(dir: &std::path::Path, project: Project) -> Arc<StateStore> {
    let store = StateStore::load(dir.join("state.json")).unwrap_or_else(|err| panic!("load state: {err}"));
    store.set_project(project).await.unwrap_or_else(|err| panic!("seed project: {err}"));
    Arc::new(store)
}

/// A minimal one-instance project rooted at `project_path`.
pub fn sample_project(project_name: &str, project_path: &std::path::Path, instance_id: &str, agent_type: &str, channel_id: &str) -> Project {
    let mut project = Project {
        project_name: project_name.to_string(),
        project_path: project_path.to_path_buf(),
        session_name: project_name.to_string(),
        instances: HashMap::new(),
        channels: HashMap::new(),
        created_at: chrono::DateTime::from_timestamp(0, 0).unwrap_or_default(),
        last_active: chrono::DateTime::from_timestamp(0, 0).unwrap_or_default(),
        instance_order: Vec::new(),
    };
    project.upsert_instance(Instance {
        instance_id: instance_id.to_string(),
        agent_type: agent_type.to_string(),
        window_name: instance_id.to_string(),
        channel_id: Some(channel_id.to_string()),
        event_hook: false,
        container_mode: false,
        container_id: None,
        container_name: None,
    });
    project
}

/// Poll `check` every 20ms (up to 1s) until it returns `true`, for
/// asserting on state mutated by a `tokio::spawn`ed background task.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

/// Build an `InboundMessage` with no attachments and the given message id.
pub fn sample_inbound(project_name: &str, agent_type: &str, channel_id: &str, content: &str, message_id: Option<&str>) -> InboundMessage {
    InboundMessage {
        agent_type: agent_type.to_string(),
        content: content.to_string(),
        project_name: project_name.to_string(),
        channel_id: channel_id.to_string(),
        message_id: message_id.map(ToString::to_string),
        instance_id: None,
        attachments: Vec::<Attachment>::new(),
    }
}

//! The `Daemon`: constructor-injected dependencies wired in the three-step
//! builder described in `SPEC_FULL.md` §9 Design Notes — (1) state,
//! messaging, runtime; (2) router + pending tracker with downward
//! references; (3) register the inbound-message callback on messaging.
//! Mirrors the teacher's `main.rs` `AppState` construction order.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agents::AgentRegistry;
use crate::config::Config;
use crate::messaging::slack::{SlackMessaging, SlackRuntime};
use crate::messaging::{InboundMessage, MessagingCapability};
use crate::pending::PendingTracker;
use crate::router::Router;
use crate::runtime::pty::PtyRuntime;
use crate::runtime::tmux::TmuxRuntime;
use crate::runtime::Runtime;
use crate::state::StateStore;
use crate::{AppError, Result};

/// Everything the running process needs to stay alive: the wired
/// components plus background task handles a caller keeps alive and aborts
/// (or gracefully waits on) during shutdown.
pub struct Daemon {
    /// Persisted project/instance topology.
    pub state: Arc<StateStore>,
    /// Chat-platform adapter.
    pub messaging: Arc<dyn MessagingCapability>,
    /// Agent-process runtime backend.
    pub runtime: Arc<dyn Runtime>,
    /// Pending-reaction tracker.
    pub pending: Arc<PendingTracker>,
    /// Message router.
    pub router: Arc<Router>,
    /// Daemon-wide configuration.
    pub config: Config,
    /// Background Slack tasks, if the Slack platform is active.
    pub slack_runtime: Option<SlackRuntime>,
}

impl Daemon {
    /// Build a daemon from `config`, loading state from `home_dir/state.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or the messaging
    /// capability cannot be started.
    pub async fn build(config: Config, home_dir: &Path) -> Result<Self> {
        // Step 1: state, messaging, runtime.
        let state = Arc::new(StateStore::load(home_dir.join("state.json"))?);

        let (messaging, slack_runtime): (Arc<dyn MessagingCapability>, Option<SlackRuntime>) =
            match config.messaging_platform {
                crate::config::MessagingPlatform::Slack => {
                    let (messaging, runtime) = SlackMessaging::start(&config)?;
                    (messaging, Some(runtime))
                }
                crate::config::MessagingPlatform::Discord => {
                    return Err(AppError::Config(
                        "discord messaging platform has no adapter in this build; set messagingPlatform to \"slack\"".into(),
                    ));
                }
            };

        let runtime: Arc<dyn Runtime> = match config.runtime_mode {
            crate::config::RuntimeMode::Tmux => Arc::new(TmuxRuntime::new("tmux")),
            crate::config::RuntimeMode::Pty => Arc::new(PtyRuntime::new()),
        };

        // Step 2: router + pending tracker, downward references only.
        let pending = Arc::new(PendingTracker::new());
        pending.set_messaging(Arc::clone(&messaging)).await;

        let agents = Arc::new(AgentRegistry::new());
        let router = Arc::new(Router::new(
            Arc::clone(&state),
            Arc::clone(&messaging),
            Arc::clone(&runtime),
            Arc::clone(&pending),
            agents,
        ));

        // Step 3: register the inbound-message callback on messaging.
        let callback_router = Arc::clone(&router);
        messaging.register_inbound_callback(Arc::new(move |message: InboundMessage| {
            let router = Arc::clone(&callback_router);
            Box::pin(async move {
                router.handle_inbound(message).await;
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        }));

        router.reregister_channel_map().await?;

        info!("daemon components wired");

        Ok(Self {
            state,
            messaging,
            runtime,
            pending,
            router,
            config,
            slack_runtime,
        })
    }

    /// Stop background Slack tasks. Called during graceful shutdown; the
    /// hook/stream servers are stopped separately via their own
    /// `CancellationToken`s.
    pub fn abort_background_tasks(&mut self) {
        if let Some(runtime) = self.slack_runtime.take() {
            runtime.queue_task.abort();
            runtime.socket_task.abort();
        }
    }
}

/// Build a fresh `CancellationToken` shared by every component the daemon
/// starts, so one `cancel()` call tears everything down together.
#[must_use]
pub fn new_shutdown_token() -> CancellationToken {
    CancellationToken::new()
}

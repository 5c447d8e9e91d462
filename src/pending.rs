//! Pending tracker (C4): tracks user requests awaiting an agent response,
//! generalized from the teacher's `oneshot`-keyed maps in
//! `mcp::handler::AppState` (`PendingApprovals` etc.) into a TTL-cached
//! active/recently-completed pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::messaging::{MessagingCapability, ReactionState};
use crate::Result;

/// How long a completed entry remains available to late thread replies.
const RECENTLY_COMPLETED_TTL: Duration = Duration::from_secs(30);

/// Identifies one tracked request: a project/instance pair.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PendingKey {
    /// Owning project name.
    pub project: String,
    /// Target instance id.
    pub instance_id: String,
}

/// One tracked request.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Agent kind.
    pub agent: String,
    /// Channel the request/response lives in.
    pub channel: String,
    /// The user's message id, if this entry originated from an inbound
    /// chat message (absent for `ensure_pending`).
    pub user_message_id: Option<String>,
}

struct Inner {
    active: HashMap<PendingKey, PendingEntry>,
    recently_completed: HashMap<PendingKey, (PendingEntry, JoinHandle<()>)>,
}

/// Tracks in-flight and recently-completed requests, updating chat
/// reactions (⏳ → ✅ / ❌) as they transition.
pub struct PendingTracker {
    inner: Mutex<Inner>,
    messaging: Arc<RwLock<Option<Arc<dyn MessagingCapability>>>>,
}

impl PendingTracker {
    /// Create a tracker bound to a (possibly not-yet-set) messaging
    /// capability, resolved lazily since the three-step builder (§9)
    /// constructs the tracker before messaging is fully wired.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                recently_completed: HashMap::new(),
            }),
            messaging: Arc::new(RwLock::new(None)),
        }
    }

    /// Bind the messaging capability used to set reactions.
    pub async fn set_messaging(&self, messaging: Arc<dyn MessagingCapability>) {
        *self.messaging.write().await = Some(messaging);
    }

    async fn messaging(&self) -> Option<Arc<dyn MessagingCapability>> {
        self.messaging.read().await.clone()
    }

    /// Mark a key pending on behalf of an inbound user message: adds it to
    /// `active`, sets the ⏳ reaction, and invalidates any stale
    /// `recently_completed` entry for the same key.
    pub async fn mark_pending(
        &self,
        project: &str,
        agent: &str,
        channel: &str,
        user_msg_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        let key = PendingKey {
            project: project.to_string(),
            instance_id: instance_id.to_string(),
        };
        let entry = PendingEntry {
            agent: agent.to_string(),
            channel: channel.to_string(),
            user_message_id: Some(user_msg_id.to_string()),
        };
        self.insert_active(key, entry.clone()).await;

        if let Some(messaging) = self.messaging().await {
            messaging
                .set_reaction(channel, user_msg_id, ReactionState::Pending)
                .await?;
        }
        Ok(())
    }

    /// Like [`Self::mark_pending`] but with no user message to react to —
    /// used by hooks that fire without an inbound trigger. Idempotent.
    pub async fn ensure_pending(&self, project: &str, agent: &str, channel: &str, instance_id: &str) {
        let key = PendingKey {
            project: project.to_string(),
            instance_id: instance_id.to_string(),
        };
        if self.inner.lock().await.active.contains_key(&key) {
            return;
        }
        let entry = PendingEntry {
            agent: agent.to_string(),
            channel: channel.to_string(),
            user_message_id: None,
        };
        self.insert_active(key, entry).await;
    }

    async fn insert_active(&self, key: PendingKey, entry: PendingEntry) {
        let mut inner = self.inner.lock().await;
        if let Some((_, handle)) = inner.recently_completed.remove(&key) {
            handle.abort();
        }
        inner.active.insert(key, entry);
    }

    /// Complete a key: if active, replace ⏳ with ✅ (only when a user
    /// message id exists) and move it into `recently_completed` with a 30s
    /// TTL timer.
    pub async fn mark_completed(self: &Arc<Self>, project: &str, instance_id: &str) -> Result<()> {
        let key = PendingKey {
            project: project.to_string(),
            instance_id: instance_id.to_string(),
        };
        let Some(entry) = self.inner.lock().await.active.remove(&key) else {
            return Ok(());
        };

        if let Some(message_id) = &entry.user_message_id {
            if let Some(messaging) = self.messaging().await {
                messaging
                    .set_reaction(&entry.channel, message_id, ReactionState::Success)
                    .await?;
            }
        }

        let tracker = Arc::clone(self);
        let ttl_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(RECENTLY_COMPLETED_TTL).await;
            let mut inner = tracker.inner.lock().await;
            inner.recently_completed.remove(&ttl_key);
            debug!(project = %ttl_key.project, instance = %ttl_key.instance_id, "recently-completed entry expired");
        });

        self.inner
            .lock()
            .await
            .recently_completed
            .insert(key, (entry, handle));
        Ok(())
    }

    /// Complete a key with an error: if active, replace ⏳ with ❌ and
    /// discard (not cached in `recently_completed`).
    pub async fn mark_error(&self, project: &str, instance_id: &str) -> Result<()> {
        let key = PendingKey {
            project: project.to_string(),
            instance_id: instance_id.to_string(),
        };
        let Some(entry) = self.inner.lock().await.active.remove(&key) else {
            return Ok(());
        };
        if let Some(message_id) = &entry.user_message_id {
            if let Some(messaging) = self.messaging().await {
                messaging
                    .set_reaction(&entry.channel, message_id, ReactionState::Error)
                    .await?;
            }
        }
        Ok(())
    }

    /// Look up a key: active takes priority, falling back to
    /// `recently_completed` (for late thread replies).
    pub async fn get_pending(&self, project: &str, instance_id: &str) -> Option<PendingEntry> {
        let key = PendingKey {
            project: project.to_string(),
            instance_id: instance_id.to_string(),
        };
        let inner = self.inner.lock().await;
        inner
            .active
            .get(&key)
            .cloned()
            .or_else(|| inner.recently_completed.get(&key).map(|(entry, _)| entry.clone()))
    }

    /// Whether a key is currently active (ignores `recently_completed`).
    pub async fn has_pending(&self, project: &str, instance_id: &str) -> bool {
        let key = PendingKey {
            project: project.to_string(),
            instance_id: instance_id.to_string(),
        };
        self.inner.lock().await.active.contains_key(&key)
    }
}

impl Default for PendingTracker {
    fn default() -> Self {
        Self::new()
    }
}

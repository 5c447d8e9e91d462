//! Message router (C6): the inbound-message callback registered with the
//! messaging capability, plus the per-instance submit-serialization
//! primitive (§5.1) and the buffer-fallback integration (C7).

pub mod fallback;
pub mod files;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::agents::AgentRegistry;
use crate::messaging::{ChannelBinding, InboundMessage, MessagingCapability, OutboundFile};
use crate::pending::PendingTracker;
use crate::runtime::{AgentHint, Runtime, WindowSnapshot};
use crate::state::StateStore;
use crate::{AppError, Result};
use fallback::{FallbackConfig, FallbackScheduler};

const MAX_MESSAGE_CHARS: usize = 10_000;
const ATTACHMENTS_DIR_NAME: &str = "files";
const MAX_DOWNLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// The message router: owns per-instance submit locks, the pending
/// tracker, and the buffer-fallback scheduler.
pub struct Router {
    state: Arc<StateStore>,
    messaging: Arc<dyn MessagingCapability>,
    runtime: Arc<dyn Runtime>,
    pending: Arc<PendingTracker>,
    agents: Arc<AgentRegistry>,
    fallback: Arc<FallbackScheduler>,
    submit_locks: RwLock<HashMap<(String, String), Arc<Mutex<()>>>>,
    fallback_config: FallbackConfig,
}

impl Router {
    /// Construct a router wired to its dependencies (step 2 of the
    /// three-step builder, §9 Design Notes).
    #[must_use]
    pub fn new(
        state: Arc<StateStore>,
        messaging: Arc<dyn MessagingCapability>,
        runtime: Arc<dyn Runtime>,
        pending: Arc<PendingTracker>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            state,
            messaging,
            runtime,
            pending,
            agents,
            fallback: Arc::new(FallbackScheduler::new()),
            submit_locks: RwLock::new(HashMap::new()),
            fallback_config: FallbackConfig::default(),
        }
    }

    async fn submit_lock(&self, project: &str, instance_id: &str) -> Arc<Mutex<()>> {
        let key = (project.to_string(), instance_id.to_string());
        if let Some(lock) = self.submit_locks.read().await.get(&key) {
            return Arc::clone(lock);
        }
        let mut guard = self.submit_locks.write().await;
        Arc::clone(guard.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Handle one inbound chat message (`SPEC_FULL.md` §4.5).
    pub async fn handle_inbound(self: &Arc<Self>, message: InboundMessage) {
        let Some(project) = self.state.get_project(&message.project_name).await else {
            let _ = self
                .messaging
                .send_text(&message.channel_id, "I don't know this project yet.")
                .await;
            return;
        };

        let Some(instance) = message
            .instance_id
            .as_deref()
            .and_then(|id| project.instances.get(id))
            .or_else(|| project.instance_by_channel(&message.channel_id))
            .or_else(|| project.primary_instance_for_agent(&message.agent_type))
        else {
            let _ = self
                .messaging
                .send_text(&message.channel_id, "I couldn't find an agent instance for this channel.")
                .await;
            return;
        };
        let instance_id = instance.instance_id.clone();
        let agent_type = instance.agent_type.clone();

        let mut content = message.content.clone();
        if !message.attachments.is_empty() {
            match self
                .download_attachments(&project.project_path, &message.attachments)
                .await
            {
                Ok(paths) => {
                    for path in paths {
                        content.push_str(&format!(" [file:{path}]"));
                    }
                }
                Err(err) => warn!(%err, "attachment download failed"),
            }
        }

        let content = content.trim().to_string();
        if content.is_empty() || content.chars().count() > MAX_MESSAGE_CHARS {
            let _ = self
                .messaging
                .send_text(&message.channel_id, "That message can't be delivered (empty or too long).")
                .await;
            return;
        }

        if let Some(user_msg_id) = &message.message_id {
            if let Err(err) = self
                .pending
                .mark_pending(&message.project_name, &agent_type, &message.channel_id, user_msg_id, &instance_id)
                .await
            {
                warn!(%err, "mark_pending failed");
            }
        } else {
            self.pending
                .ensure_pending(&message.project_name, &agent_type, &message.channel_id, &instance_id)
                .await;
        }

        let submit_delay = self.agents.submit_delay_for(&agent_type);
        let router = Arc::clone(self);
        let project_name = message.project_name.clone();
        let channel_id = message.channel_id.clone();
        let session_name = project.session_name.clone();
        let window_name = instance.window_name.clone();

        tokio::spawn(async move {
            let lock = router.submit_lock(&project_name, &instance_id).await;
            let _guard = lock.lock().await;

            let hint = AgentHint {
                agent_type: agent_type.clone(),
                submit_delay,
            };

            let submit_result = router
                .runtime
                .send_keys_to_window(&session_name, &window_name, &content, Some(&hint))
                .await;

            match submit_result {
                Ok(()) => {
                    router
                        .schedule_fallback(&project_name, &instance_id, &session_name, &window_name, &channel_id)
                        .await;
                    if let Err(err) = router.state.update_last_active(&project_name).await {
                        warn!(%err, "failed to update last_active");
                    }
                }
                Err(err) => {
                    warn!(%err, "submit to runtime failed");
                    if let Err(err) = router.pending.mark_error(&project_name, &instance_id).await {
                        warn!(%err, "mark_error failed");
                    }
                    let guidance = if session_missing_pattern().is_match(&err.to_string()) {
                        format!("I couldn't deliver your message — the session seems to be gone. Try `discode new --name {project_name}`.")
                    } else {
                        "I couldn't deliver your message to the agent.".to_string()
                    };
                    let _ = router.messaging.send_text(&channel_id, &guidance).await;
                }
            }
        });
    }

    async fn schedule_fallback(self: &Arc<Self>, project: &str, instance_id: &str, session: &str, window: &str, channel: &str) {
        let router = Arc::clone(self);
        let project = project.to_string();
        let instance_id_owned = instance_id.to_string();
        let session = session.to_string();
        let window = window.to_string();
        let channel = channel.to_string();
        let config = self.fallback_config.clone();

        let capture_router = Arc::clone(&router);
        let capture_project = project.clone();
        let capture_instance_id = instance_id_owned.clone();
        let capture_session = session.clone();
        let capture_window = window.clone();

        let stable_router = router;
        let stable_project = project.clone();
        let stable_instance_id = instance_id_owned.clone();
        let stable_channel = channel.clone();
        let stable_config = config.clone();

        self.fallback
            .schedule(
                &project,
                &instance_id_owned,
                config,
                move || {
                    let router = Arc::clone(&capture_router);
                    let project = capture_project.clone();
                    let instance_id = capture_instance_id.clone();
                    let session = capture_session.clone();
                    let window = capture_window.clone();
                    async move { router.capture_fallback_buffer(&project, &instance_id, &session, &window).await }
                },
                move |buffer| async move {
                    stable_router
                        .send_fallback_reply(&stable_project, &stable_instance_id, &stable_channel, &buffer, &stable_config)
                        .await;
                },
            )
            .await;
    }

    /// Fetch the current buffer/frame text for `(session, window)` if
    /// `(project, instance)` still has a pending request; returns an empty
    /// string otherwise, which the scheduler never treats as stable.
    async fn capture_fallback_buffer(&self, project: &str, instance_id: &str, session: &str, window: &str) -> String {
        if !self.pending.has_pending(project, instance_id).await {
            return String::new();
        }

        match self.runtime.get_window_frame(session, window, None, None).await {
            Ok(Some(frame)) => frame
                .lines
                .iter()
                .map(|line| line.segments.iter().map(|s| s.text.as_str()).collect::<String>())
                .collect::<Vec<_>>()
                .join("\n"),
            _ => self.runtime.get_window_buffer(session, window).await.unwrap_or_default(),
        }
    }

    /// Post the stable buffer capture as a fenced reply and complete the
    /// pending entry (`SPEC_FULL.md` §4.6 steps 4-5, property 9).
    async fn send_fallback_reply(&self, project: &str, instance_id: &str, channel: &str, buffer: &str, config: &FallbackConfig) {
        let block = fallback::extract_last_command_block(buffer, &config.prompt_markers);
        let fenced = format!("```\n{block}\n```");
        if let Err(err) = self.messaging.send_text(channel, &fenced).await {
            warn!(%err, "fallback send_text failed");
            return;
        }
        if let Err(err) = self.pending.mark_completed(project, instance_id).await {
            warn!(%err, "fallback mark_completed failed");
        }
    }

    /// Handle an agent hook's `session.idle` event (`SPEC_FULL.md` §4.3).
    pub async fn handle_session_idle(&self, project_name: &str, instance_id: &str, channel_id: &str, text: Option<&str>) -> Result<()> {
        self.fallback.cancel(project_name, instance_id).await;

        let Some(text) = text else {
            self.pending.mark_completed(project_name, instance_id).await?;
            return Ok(());
        };

        let Some(project) = self.state.get_project(project_name).await else {
            return Err(AppError::UnknownReference(format!("project {project_name} not found")));
        };

        let paths = files::extract_file_paths(text, &project.project_path);
        let clean_text = files::strip_file_paths(text, &paths);

        for chunk in crate::messaging::text::split_for_platform(&clean_text, crate::messaging::text::DISCORD_LIMIT) {
            if !chunk.trim().is_empty() {
                self.messaging.send_text(channel_id, &chunk).await?;
            }
        }

        if !paths.is_empty() {
            let files: Vec<OutboundFile> = paths
                .into_iter()
                .map(|path| {
                    let path = std::path::PathBuf::from(path);
                    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                    OutboundFile { path, file_name }
                })
                .collect();
            self.messaging.send_files(channel_id, "", &files).await?;
        }

        self.pending.mark_completed(project_name, instance_id).await
    }

    /// Handle an agent hook's `session.error` event.
    pub async fn handle_session_error(&self, project_name: &str, instance_id: &str, channel_id: &str) -> Result<()> {
        self.fallback.cancel(project_name, instance_id).await;
        self.messaging.send_text(channel_id, "⚠️ session error: the agent reported a failure.").await?;
        self.pending.mark_error(project_name, instance_id).await
    }

    /// Reset pending state on `session.start`/`session.end`/unrecognized
    /// events, without posting anything.
    pub async fn reset_pending(&self, project_name: &str, instance_id: &str) {
        self.fallback.cancel(project_name, instance_id).await;
        let _ = self.pending.mark_completed(project_name, instance_id).await;
    }

    /// Re-register the channel → `(project, agentType, instanceId)` map
    /// with the messaging capability (called after every `/reload`).
    pub async fn reregister_channel_map(&self) -> Result<()> {
        let mut map = HashMap::new();
        for project in self.state.list_projects().await {
            for instance in project.instances.values() {
                if let Some(channel_id) = &instance.channel_id {
                    map.insert(
                        channel_id.clone(),
                        ChannelBinding {
                            project_name: project.project_name.clone(),
                            agent_type: instance.agent_type.clone(),
                            instance_id: instance.instance_id.clone(),
                        },
                    );
                }
            }
        }
        self.messaging.update_channel_map(map).await;
        Ok(())
    }

    /// Send files directly to a channel, bypassing the router's text
    /// pipeline (used by `/send-files`).
    pub async fn send_files(&self, channel_id: &str, files: &[OutboundFile]) -> Result<()> {
        self.messaging.send_files(channel_id, "", files).await
    }

    /// List live runtime windows (used by `/windows`).
    pub async fn list_windows(&self) -> Result<Vec<WindowSnapshot>> {
        self.runtime.list_windows(None).await
    }

    /// Start or resume a window for `(project, instance)` (`/ensure-window`).
    pub async fn ensure_window(&self, project_name: &str, instance_id: &str) -> Result<()> {
        let Some(project) = self.state.get_project(project_name).await else {
            return Err(AppError::UnknownReference(format!("project {project_name} not found")));
        };
        let Some(instance) = project.instances.get(instance_id) else {
            return Err(AppError::UnknownReference(format!("instance {instance_id} not found")));
        };
        if self.runtime.window_exists(&project.session_name, &instance.window_name).await? {
            return Ok(());
        }
        let adapter = self.agents.get(&instance.agent_type);
        let command = adapter.start_command(&project.project_path, false);
        self.runtime
            .start_agent_in_window(&project.session_name, &instance.window_name, &command)
            .await
    }

    /// Notify the stream server that a client wants `window_id` focused.
    /// The stream server itself owns per-client focus state; the router
    /// only forwards the intent (wired at bootstrap).
    pub fn notify_focus(&self, window_id: &str) {
        tracing::debug!(%window_id, "focus requested");
    }

    async fn download_attachments(&self, project_path: &std::path::Path, attachments: &[crate::messaging::Attachment]) -> Result<Vec<String>> {
        let dir = project_path.join(".discode").join(ATTACHMENTS_DIR_NAME);
        tokio::fs::create_dir_all(&dir).await?;

        let client = reqwest::Client::new();
        let mut saved = Vec::new();
        for attachment in attachments {
            if let Some(size) = attachment.size {
                if size > MAX_DOWNLOAD_BYTES {
                    continue;
                }
            }
            let response = client
                .get(&attachment.url)
                .timeout(Duration::from_secs(30))
                .send()
                .await
                .map_err(|err| AppError::Messaging(format!("attachment download failed: {err}")))?;
            let bytes = response
                .bytes()
                .await
                .map_err(|err| AppError::Messaging(format!("attachment read failed: {err}")))?;
            if bytes.len() as u64 > MAX_DOWNLOAD_BYTES {
                continue;
            }
            let dest = dir.join(&attachment.file_name);
            tokio::fs::write(&dest, &bytes).await?;
            saved.push(dest.to_string_lossy().into_owned());
        }
        prune_attachments_dir(&dir).await;
        Ok(saved)
    }
}

/// LRU-prune the attachments directory down to 100 files, oldest
/// modification time first.
async fn prune_attachments_dir(dir: &std::path::Path) {
    const MAX_FILES: usize = 100;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(metadata) = entry.metadata().await {
            if let Ok(modified) = metadata.modified() {
                files.push((entry.path(), modified));
            }
        }
    }
    if files.len() <= MAX_FILES {
        return;
    }
    files.sort_by_key(|(_, modified)| *modified);
    for (path, _) in files.into_iter().take(files.len() - MAX_FILES) {
        let _ = tokio::fs::remove_file(path).await;
    }
}

#[allow(clippy::unwrap_used)]
fn session_missing_pattern() -> Regex {
    Regex::new(r"(?i)can't find (window|pane)").unwrap()
}

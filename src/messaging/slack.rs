//! Slack adapter for the messaging capability, grounded almost directly in
//! the teacher's `slack::client::SlackService` (buffered outgoing queue,
//! exponential backoff on rate limits, Socket Mode listener).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest, SlackApiReactionsAddRequest, SlackApiReactionsRemoveRequest,
    SlackApiToken, SlackApiTokenType, SlackApiTokenValue, SlackChannelId,
    SlackClient, SlackClientEventsListenerEnvironment, SlackClientHyperHttpsConnector,
    SlackClientSocketModeConfig, SlackClientSocketModeListener, SlackMessageContent,
    SlackSocketModeListenerCallbacks, SlackTs,
};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::messaging::{ChannelBinding, InboundCallback, MessagingCapability, OutboundFile, ReactionState};
use crate::{AppError, Result};

const QUEUE_CAPACITY: usize = 256;
const INITIAL_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);
const MAX_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

/// A message queued for delivery via `chat.postMessage`.
#[derive(Debug, Clone)]
struct QueuedMessage {
    channel: SlackChannelId,
    text: String,
}

/// Slack Socket Mode messaging capability with a buffered, rate-limit
/// aware outgoing queue.
pub struct SlackMessaging {
    client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    bot_token: SlackApiToken,
    queue_tx: mpsc::Sender<QueuedMessage>,
    inbound_callback: RwLock<Option<InboundCallback>>,
    channel_map: RwLock<HashMap<String, ChannelBinding>>,
    fixed_channel_id: Option<String>,
}

/// Join handles for background Slack tasks, kept alive by the daemon.
pub struct SlackRuntime {
    /// Outgoing-message worker task.
    pub queue_task: JoinHandle<()>,
    /// Socket Mode listener task.
    pub socket_task: JoinHandle<()>,
}

impl SlackMessaging {
    /// Start the Slack client and its background sender/listener tasks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Messaging` if the HTTPS connector cannot be
    /// created.
    pub fn start(config: &Config) -> Result<(Arc<Self>, SlackRuntime)> {
        let bot_token_value = config
            .slack_bot_token
            .clone()
            .ok_or_else(|| AppError::Messaging("slack_bot_token not configured".into()))?;
        let app_token_value = config
            .slack_app_token
            .clone()
            .ok_or_else(|| AppError::Messaging("slack_app_token not configured".into()))?;

        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| AppError::Messaging(format!("failed to init slack connector: {err}")))?;
        let client = Arc::new(SlackClient::new(connector));

        let bot_token = SlackApiToken {
            token_value: SlackApiTokenValue(bot_token_value),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::Bot),
        };
        let app_token = SlackApiToken {
            token_value: SlackApiTokenValue(app_token_value),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::App),
        };

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue_task = Self::spawn_worker(Arc::clone(&client), bot_token.clone(), queue_rx);

        let service = Arc::new(Self {
            client: Arc::clone(&client),
            bot_token,
            queue_tx,
            inbound_callback: RwLock::new(None),
            channel_map: RwLock::new(HashMap::new()),
            fixed_channel_id: config.channel_id.clone(),
        });

        let socket_task = Self::spawn_socket_mode(&client, app_token, Arc::clone(&service));

        info!("slack messaging capability started");
        Ok((
            service,
            SlackRuntime {
                queue_task,
                socket_task,
            },
        ))
    }

    fn spawn_worker(
        client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
        token: SlackApiToken,
        mut queue_rx: mpsc::Receiver<QueuedMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let session = client.open_session(&token);
            while let Some(message) = queue_rx.recv().await {
                let request = SlackApiChatPostMessageRequest {
                    channel: message.channel.clone(),
                    content: SlackMessageContent {
                        text: Some(message.text.clone()),
                        blocks: None,
                        attachments: None,
                        upload: None,
                        files: None,
                        reactions: None,
                        metadata: None,
                    },
                    as_user: None,
                    icon_emoji: None,
                    icon_url: None,
                    link_names: Some(true),
                    parse: None,
                    thread_ts: None,
                    username: None,
                    reply_broadcast: None,
                    unfurl_links: None,
                    unfurl_media: None,
                };

                let mut backoff = INITIAL_RETRY_DELAY;
                loop {
                    match session.chat_post_message(&request).await {
                        Ok(_) => break,
                        Err(error) => {
                            let delay = match &error {
                                slack_morphism::errors::SlackClientError::RateLimitError(rate) => {
                                    rate.retry_after.unwrap_or(backoff)
                                }
                                _ => backoff,
                            };
                            warn!(?error, ?delay, "slack post failed; retrying");
                            sleep(delay).await;
                            backoff = (backoff * 2).min(MAX_RETRY_DELAY);
                        }
                    }
                }
            }
            info!("slack sender task exiting");
        })
    }

    fn spawn_socket_mode(
        client: &Arc<SlackClient<SlackClientHyperHttpsConnector>>,
        app_token: SlackApiToken,
        service: Arc<Self>,
    ) -> JoinHandle<()> {
        let listener_env = Arc::new(
            SlackClientEventsListenerEnvironment::new(Arc::clone(client))
                .with_user_state(service)
                .with_error_handler(|err, _client, _state| {
                    error!(?err, "slack socket mode error");
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }),
        );

        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_hello_events(|event, _client, _state| async move {
                info!(?event, "slack socket hello");
            })
            .with_push_events(push_event_handler);

        let config = SlackClientSocketModeConfig::new();
        let listener = SlackClientSocketModeListener::new(&config, listener_env, callbacks);

        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                error!(?error, "slack socket mode listen failed");
                return;
            }
            listener.serve().await;
            info!("slack socket mode listener exited");
        })
    }

    /// Best-effort resolution of an inbound event's project/agent/instance
    /// binding from the last channel map pushed by `update_channel_map`.
    async fn resolve_binding(&self, channel_id: &str) -> Option<ChannelBinding> {
        self.channel_map.read().await.get(channel_id).cloned()
    }
}

async fn push_event_handler(
    event: slack_morphism::prelude::SlackPushEvent,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: slack_morphism::listener::SlackClientEventsUserStateStorage,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use slack_morphism::prelude::{SlackEventCallbackBody, SlackPushEvent};

    let SlackPushEvent::EventCallback(callback) = event else {
        return Ok(());
    };

    let SlackEventCallbackBody::Message(msg_event) = callback.event else {
        return Ok(());
    };

    // Ignore bot-authored messages (including our own) to avoid echo loops.
    if msg_event.sender.bot_id.is_some() {
        return Ok(());
    }

    let Some(channel) = msg_event.origin.channel.clone() else {
        return Ok(());
    };
    let Some(text) = msg_event.content.and_then(|c| c.text) else {
        return Ok(());
    };

    let service = {
        let guard = state.read().await;
        guard.get_user_state::<Arc<SlackMessaging>>().cloned()
    };
    let Some(service) = service else {
        return Ok(());
    };

    let Some(binding) = service.resolve_binding(channel.0.as_str()).await else {
        return Ok(());
    };

    let callback = service.inbound_callback.read().await.clone();
    if let Some(callback) = callback {
        let message = crate::messaging::InboundMessage {
            agent_type: binding.agent_type,
            content: text,
            project_name: binding.project_name,
            channel_id: channel.0,
            message_id: msg_event.origin.ts.map(|ts| ts.0),
            instance_id: Some(binding.instance_id),
            attachments: Vec::new(),
        };
        callback(message).await;
    }

    Ok(())
}

#[async_trait]
impl MessagingCapability for SlackMessaging {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<()> {
        self.queue_tx
            .send(QueuedMessage {
                channel: SlackChannelId(channel_id.to_string()),
                text: text.to_string(),
            })
            .await
            .map_err(|err| AppError::Messaging(format!("failed to enqueue slack message: {err}")))
    }

    async fn send_files(&self, channel_id: &str, text: &str, files: &[OutboundFile]) -> Result<()> {
        let session = self.client.open_session(&self.bot_token);
        for file in files {
            let content = tokio::fs::read_to_string(&file.path)
                .await
                .unwrap_or_default();
            let url_request =
                slack_morphism::prelude::SlackApiFilesGetUploadUrlExternalRequest::new(
                    file.file_name.clone(),
                    content.len(),
                );
            let url_response = session
                .get_upload_url_external(&url_request)
                .await
                .map_err(|err| AppError::Messaging(format!("failed to get upload url: {err}")))?;

            let http_client = reqwest::Client::new();
            http_client
                .post(url_response.upload_url.0.to_string())
                .body(content)
                .send()
                .await
                .map_err(|err| AppError::Messaging(format!("failed to upload file: {err}")))?;

            let file_ref = slack_morphism::prelude::SlackApiFilesComplete {
                id: url_response.file_id,
                title: Some(file.file_name.clone()),
            };
            let mut complete_request =
                slack_morphism::prelude::SlackApiFilesCompleteUploadExternalRequest::new(vec![
                    file_ref,
                ]);
            complete_request.channel_id = Some(SlackChannelId(channel_id.to_string()));
            session
                .files_complete_upload_external(&complete_request)
                .await
                .map_err(|err| AppError::Messaging(format!("failed to complete upload: {err}")))?;
        }

        if !text.is_empty() {
            self.send_text(channel_id, text).await?;
        }
        Ok(())
    }

    async fn set_reaction(&self, channel_id: &str, message_id: &str, state: ReactionState) -> Result<()> {
        let session = self.client.open_session(&self.bot_token);
        let channel = SlackChannelId(channel_id.to_string());
        let ts = SlackTs(message_id.to_string());

        // Always clear the hourglass before setting success/error; adding
        // on top of pending is a no-op for Pending itself.
        if state != ReactionState::Pending {
            let remove = SlackApiReactionsRemoveRequest::new(
                slack_morphism::prelude::SlackReactionName("hourglass_flowing_sand".into()),
            )
            .with_channel(channel.clone())
            .with_timestamp(ts.clone());
            let _ = session.reactions_remove(&remove).await;
        }

        let emoji = match state {
            ReactionState::Pending => "hourglass_flowing_sand",
            ReactionState::Success => "white_check_mark",
            ReactionState::Error => "x",
        };

        let add = SlackApiReactionsAddRequest::new(
            channel,
            slack_morphism::prelude::SlackReactionName(emoji.into()),
            ts,
        );
        session
            .reactions_add(&add)
            .await
            .map_err(|err| AppError::Messaging(format!("failed to set reaction: {err}")))?;
        Ok(())
    }

    async fn ensure_channel(
        &self,
        project_name: &str,
        agent_type: &str,
        instance_id: &str,
    ) -> Result<String> {
        // Channel provisioning is a chat-platform-specific concern; this
        // adapter uses the fixed configured channel when set, which covers
        // the common single-channel-per-workspace setup. A full
        // channel-creation flow is out of scope (§1).
        self.fixed_channel_id.clone().ok_or_else(|| {
            AppError::Messaging(format!(
                "no channel configured to host {project_name}/{agent_type}#{instance_id}"
            ))
        })
    }

    fn register_inbound_callback(&self, callback: InboundCallback) {
        // `register_inbound_callback` is called once during bootstrap, and
        // the lock is only ever briefly held, so a blocking write here
        // (rather than spawning) keeps call-site ordering simple.
        if let Ok(mut guard) = self.inbound_callback.try_write() {
            *guard = Some(callback);
        }
    }

    async fn update_channel_map(&self, map: HashMap<String, ChannelBinding>) {
        *self.channel_map.write().await = map;
    }
}

//! Messaging capability (C2): the contract the core consumes from a chat
//! platform, abstracted behind a trait so Slack and Discord adapters are
//! interchangeable. Only the Slack adapter ships concretely here (grounded
//! in the teacher's `slack::client::SlackService`) — Discord's gateway
//! transport is out of scope per `SPEC_FULL.md` §1.

pub mod slack;
pub mod text;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

/// One inbound chat message delivered to the router.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Free-form agent kind the channel is associated with.
    pub agent_type: String,
    /// Raw message text.
    pub content: String,
    /// Owning project name.
    pub project_name: String,
    /// Channel the message was sent in.
    pub channel_id: String,
    /// Platform message id, when available (used for reactions).
    pub message_id: Option<String>,
    /// Instance id the platform already resolved this channel to, if the
    /// channel→instance mapping was known at delivery time.
    pub instance_id: Option<String>,
    /// Downloaded-attachment-ready references; the router resolves these.
    pub attachments: Vec<Attachment>,
}

/// An inbound attachment reference, prior to download.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Suggested file name.
    pub file_name: String,
    /// URL to fetch the attachment bytes from.
    pub url: String,
    /// Declared MIME type, if the platform supplied one.
    pub content_type: Option<String>,
    /// Declared size in bytes, if known.
    pub size: Option<u64>,
}

/// A file to be delivered to a channel alongside (or instead of) text.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    /// Absolute path to the file on disk.
    pub path: std::path::PathBuf,
    /// Display name for the upload.
    pub file_name: String,
}

/// Target reaction state for a tracked user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionState {
    /// Processing (hourglass).
    Pending,
    /// Completed successfully (check mark).
    Success,
    /// Completed with error (cross mark).
    Error,
}

/// Callback signature the router registers to receive inbound messages
/// (`SPEC_FULL.md` §4.5).
pub type InboundCallback =
    Arc<dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The contract the core consumes from a chat platform. Implementors own
/// their own connection lifecycle (gateway, Socket Mode, etc.); the core
/// only ever calls these methods.
#[async_trait]
pub trait MessagingCapability: Send + Sync {
    /// Send plain text to a channel. Implementations are responsible for
    /// platform-specific length limits; callers should pre-split with
    /// [`text::split_for_platform`].
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<()>;

    /// Send one or more files to a channel, with optional accompanying
    /// text.
    async fn send_files(&self, channel_id: &str, text: &str, files: &[OutboundFile]) -> Result<()>;

    /// Set (replacing any prior bridge-owned reaction) the reaction on a
    /// message to reflect pending/success/error.
    async fn set_reaction(&self, channel_id: &str, message_id: &str, state: ReactionState) -> Result<()>;

    /// Ensure a dedicated channel exists for `(project_name, agent_type,
    /// instance_id)` and return its id. Creating channels is a platform
    /// concern; the core only needs the resulting id.
    async fn ensure_channel(
        &self,
        project_name: &str,
        agent_type: &str,
        instance_id: &str,
    ) -> Result<String>;

    /// Register the inbound-message callback. Called exactly once during
    /// bootstrap (§9's three-step builder).
    fn register_inbound_callback(&self, callback: InboundCallback);

    /// Hand the platform a fresh `channelId -> (project, agentType,
    /// instanceId)` map, so it can resolve which project an inbound
    /// message belongs to (used after every `/reload`).
    async fn update_channel_map(&self, map: std::collections::HashMap<String, ChannelBinding>);
}

/// A channel's resolved binding, handed to the messaging capability after
/// every state reload.
#[derive(Debug, Clone)]
pub struct ChannelBinding {
    /// Owning project name.
    pub project_name: String,
    /// Agent kind bound to this channel.
    pub agent_type: String,
    /// Instance id bound to this channel.
    pub instance_id: String,
}

//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes (see
/// `SPEC_FULL.md` §7 for the policy attached to each kind).
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// State-store read/write failure.
    State(String),
    /// Messaging-capability (chat platform) RPC failure.
    Messaging(String),
    /// Runtime (PTY / multiplexer) operation failure.
    Runtime(String),
    /// Hook HTTP request was malformed (bad JSON, missing required field).
    MalformedRequest(String),
    /// Project, instance, or channel reference does not resolve.
    UnknownReference(String),
    /// IPC / stream-server communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Daemon supervisor failed to reach a running/stopped state.
    Supervisor(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::State(msg) => write!(f, "state: {msg}"),
            Self::Messaging(msg) => write!(f, "messaging: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime: {msg}"),
            Self::MalformedRequest(msg) => write!(f, "malformed request: {msg}"),
            Self::UnknownReference(msg) => write!(f, "unknown reference: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Supervisor(msg) => write!(f, "supervisor: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("invalid json: {err}"))
    }
}

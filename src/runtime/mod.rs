//! Runtime (C3): a collection of `(session, window)` pairs, each wrapping
//! one interactive agent process. Two backends share this one contract —
//! an external multiplexer ([`tmux`]) and an in-process PTY ([`pty`]) —
//! generalized from the teacher's one-shot `acp::spawner` into a
//! session/window registry.

pub mod pty;
pub mod tmux;

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// One cell's worth of style attributes in a [`StyledFrame`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellStyle {
    /// Foreground color, as an SGR-resolved name (e.g. `"#ff0000"`).
    pub fg: Option<String>,
    /// Background color.
    pub bg: Option<String>,
    /// Bold attribute.
    pub bold: bool,
    /// Italic attribute.
    pub italic: bool,
    /// Underline attribute.
    pub underline: bool,
}

/// A run of text sharing one [`CellStyle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledSegment {
    /// The segment's text.
    pub text: String,
    /// The segment's style.
    pub style: CellStyle,
}

/// One rendered line of a [`StyledFrame`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyledLine {
    /// Styled runs making up the line, left to right.
    pub segments: Vec<StyledSegment>,
}

/// A full styled snapshot of a window's screen, produced only by backends
/// that maintain a VT screen (the PTY backend; the multiplexer backend
/// always returns `None` from [`Runtime::get_window_frame`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyledFrame {
    /// Rendered lines, top to bottom.
    pub lines: Vec<StyledLine>,
    /// Zero-based cursor row.
    pub cursor_row: usize,
    /// Zero-based cursor column.
    pub cursor_col: usize,
}

/// A lightweight summary of one live window, returned by
/// [`Runtime::list_windows`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Owning session name.
    pub session: String,
    /// Window name within the session.
    pub window: String,
    /// Whether the window's process is still running.
    pub alive: bool,
}

/// A signal to send to a window's process, backend-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Request graceful termination.
    Term,
    /// Force-kill.
    Kill,
}

/// An agent-kind hint, used to pick the type→Enter delay and whether
/// keystrokes should be typed without a trailing Enter.
#[derive(Debug, Clone)]
pub struct AgentHint {
    /// Free-form agent kind (e.g. `"claude"`, `"opencode"`).
    pub agent_type: String,
    /// Delay between the last typed character and sending Enter.
    pub submit_delay: Duration,
}

/// The contract the core consumes from a runtime backend (`SPEC_FULL.md`
/// §4.2). Both backends expose this identical operation set; callers never
/// see backend-specific types.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Return the session for `project_name`, creating it (and an optional
    /// first window) if it does not already exist.
    async fn get_or_create_session(
        &self,
        project_name: &str,
        first_window: Option<&str>,
    ) -> Result<String>;

    /// Set an environment variable on a session, applied to windows
    /// started in it afterwards.
    async fn set_session_env(&self, session: &str, key: &str, value: &str) -> Result<()>;

    /// Whether `(session, window)` currently exists.
    async fn window_exists(&self, session: &str, window: &str) -> Result<bool>;

    /// Start an agent process in `window`, running `shell_command` under a
    /// shell so inline env exports and `&&` chains work.
    async fn start_agent_in_window(&self, session: &str, window: &str, shell_command: &str) -> Result<()>;

    /// Type `text` into the window without sending Enter.
    async fn type_keys_to_window(
        &self,
        session: &str,
        window: &str,
        text: &str,
        agent_hint: Option<&AgentHint>,
    ) -> Result<()>;

    /// Send Enter to the window, honoring the agent's submit delay when a
    /// hint is supplied.
    async fn send_enter_to_window(&self, session: &str, window: &str, agent_hint: Option<&AgentHint>) -> Result<()>;

    /// Type `text`, wait the per-agent submit delay, then send Enter.
    async fn send_keys_to_window(&self, session: &str, window: &str, text: &str, agent_hint: Option<&AgentHint>) -> Result<()> {
        self.type_keys_to_window(session, window, text, agent_hint).await?;
        let delay = agent_hint.map_or(Duration::from_millis(300), |hint| hint.submit_delay);
        tokio::time::sleep(delay).await;
        self.send_enter_to_window(session, window, agent_hint).await
    }

    /// Return the window's plain-text scrollback.
    async fn get_window_buffer(&self, session: &str, window: &str) -> Result<String>;

    /// Return a styled frame for the window, or `None` when the backend
    /// has no VT screen (the multiplexer backend).
    async fn get_window_frame(&self, session: &str, window: &str, cols: Option<u16>, rows: Option<u16>) -> Result<Option<StyledFrame>>;

    /// Resize the window, clamped by the backend to its supported range.
    async fn resize_window(&self, session: &str, window: &str, cols: u16, rows: u16) -> Result<()>;

    /// Stop the window's process with `signal`, returning whether a
    /// process was actually signaled.
    async fn stop_window(&self, session: &str, window: &str, signal: Signal) -> Result<bool>;

    /// List all live windows, optionally scoped to one session.
    async fn list_windows(&self, session: Option<&str>) -> Result<Vec<WindowSnapshot>>;

    /// Tear down every window this runtime owns, sending `signal` to each.
    async fn dispose(&self, signal: Signal) -> Result<()>;
}

/// Clamp requested dimensions to the PTY backend's supported range
/// (`SPEC_FULL.md` §4.2.2). Shared by both backends so resize behavior is
/// consistent even though only the PTY backend actually reflows a screen.
#[must_use]
pub fn clamp_dimensions(cols: u16, rows: u16) -> (u16, u16) {
    (cols.clamp(30, 240), rows.clamp(10, 120))
}

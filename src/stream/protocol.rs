//! Stream server wire protocol (`SPEC_FULL.md` §4.7): line-delimited JSON
//! messages exchanged with local UI clients. Tagged-enum shape grounded in
//! the teacher's `ipc::server::{IpcRequest, IpcResponse}`.

use serde::{Deserialize, Serialize};

use crate::runtime::{CellStyle, StyledFrame};

/// Inbound message from a stream client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Initial greeting; no payload.
    Hello,
    /// Subscribe to a window's frames at the given terminal size.
    Subscribe {
        /// Wire window id, `"<session>:<window>"`.
        #[serde(rename = "windowId")]
        window_id: String,
        /// Desired column count.
        cols: u16,
        /// Desired row count.
        rows: u16,
    },
    /// Tell the daemon this client has focused a window (UI hint only).
    Focus {
        /// Wire window id.
        #[serde(rename = "windowId")]
        window_id: String,
    },
    /// Forward raw input bytes to a window.
    Input {
        /// Wire window id.
        #[serde(rename = "windowId")]
        window_id: String,
        /// Base64-encoded input bytes.
        #[serde(rename = "bytesBase64")]
        bytes_base64: String,
    },
    /// Resize a subscribed window.
    Resize {
        /// Wire window id.
        #[serde(rename = "windowId")]
        window_id: String,
        /// New column count.
        cols: u16,
        /// New row count.
        rows: u16,
    },
}

/// One patch operation: replace line `index` with `line`.
#[derive(Debug, Clone, Serialize)]
pub struct PatchOp {
    /// Zero-based line index.
    pub index: usize,
    /// New plain-text line content.
    pub line: String,
}

/// One styled patch operation: replace line `index` with `line`.
#[derive(Debug, Clone, Serialize)]
pub struct StyledPatchOp {
    /// Zero-based line index.
    pub index: usize,
    /// New styled line content.
    pub line: StyledLineDto,
}

/// A styled line, as carried over the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StyledLineDto {
    /// Styled segments making up the line.
    pub segments: Vec<StyledSegmentDto>,
}

/// A styled segment, as carried over the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StyledSegmentDto {
    /// Segment text.
    pub text: String,
    /// Foreground color name, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fg: Option<String>,
    /// Background color name, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg: Option<String>,
    /// Bold attribute.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub bold: bool,
    /// Italic attribute.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub italic: bool,
    /// Underline attribute.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub underline: bool,
}

impl From<&crate::runtime::StyledSegment> for StyledSegmentDto {
    fn from(segment: &crate::runtime::StyledSegment) -> Self {
        let CellStyle { fg, bg, bold, italic, underline } = segment.style.clone();
        Self {
            text: segment.text.clone(),
            fg,
            bg,
            bold,
            italic,
            underline,
        }
    }
}

impl From<&crate::runtime::StyledLine> for StyledLineDto {
    fn from(line: &crate::runtime::StyledLine) -> Self {
        Self {
            segments: line.segments.iter().map(StyledSegmentDto::from).collect(),
        }
    }
}

/// Outbound message to a stream client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Acknowledges a client's `hello`.
    Hello,
    /// Acknowledges a client's `focus`.
    Focus {
        /// Wire window id that was focused.
        #[serde(rename = "windowId")]
        window_id: String,
    },
    /// Full plain-text snapshot.
    Frame {
        /// Wire window id.
        #[serde(rename = "windowId")]
        window_id: String,
        /// Monotonic per-window sequence number.
        seq: u64,
        /// Plain-text lines.
        lines: Vec<String>,
    },
    /// Full styled snapshot.
    FrameStyled {
        /// Wire window id.
        #[serde(rename = "windowId")]
        window_id: String,
        /// Monotonic per-window sequence number.
        seq: u64,
        /// Styled lines.
        lines: Vec<StyledLineDto>,
        /// Cursor row.
        #[serde(rename = "cursorRow")]
        cursor_row: usize,
        /// Cursor column.
        #[serde(rename = "cursorCol")]
        cursor_col: usize,
    },
    /// Incremental plain-text update.
    Patch {
        /// Wire window id.
        #[serde(rename = "windowId")]
        window_id: String,
        /// Monotonic per-window sequence number.
        seq: u64,
        /// Total line count after applying the patch.
        #[serde(rename = "lineCount")]
        line_count: usize,
        /// Changed-line operations.
        ops: Vec<PatchOp>,
    },
    /// Incremental styled update.
    PatchStyled {
        /// Wire window id.
        #[serde(rename = "windowId")]
        window_id: String,
        /// Monotonic per-window sequence number.
        seq: u64,
        /// Total line count after applying the patch.
        #[serde(rename = "lineCount")]
        line_count: usize,
        /// Changed-line operations.
        ops: Vec<StyledPatchOp>,
    },
    /// The runtime reports the window is gone.
    WindowExit {
        /// Wire window id.
        #[serde(rename = "windowId")]
        window_id: String,
        /// Process exit code, if known.
        code: Option<i32>,
        /// Terminating signal name, if known.
        signal: Option<String>,
    },
    /// An error occurred processing a client message.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Split a `"<session>:<window>"` wire id into its parts.
#[must_use]
pub fn split_window_id(window_id: &str) -> Option<(&str, &str)> {
    window_id.split_once(':')
}

/// Join `(session, window)` into the wire id format.
#[must_use]
pub fn join_window_id(session: &str, window: &str) -> String {
    format!("{session}:{window}")
}

impl From<&StyledFrame> for Vec<StyledLineDto> {
    fn from(frame: &StyledFrame) -> Self {
        frame.lines.iter().map(StyledLineDto::from).collect()
    }
}

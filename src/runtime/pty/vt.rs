//! VT screen: wraps [`vt100::Parser`] to give the PTY backend both a
//! bounded plain-text scrollback and a styled frame (`SPEC_FULL.md`
//! §4.2.2).

use crate::runtime::{CellStyle, StyledFrame, StyledLine, StyledSegment};

/// Scrollback is dropped from the front once it exceeds this many bytes.
const SCROLLBACK_CAP: usize = 256 * 1024;

/// Per-window VT screen: a `vt100` parser plus a capped raw-byte
/// scrollback for consumers that only want plain text.
pub struct VtScreen {
    parser: vt100::Parser,
    scrollback: Vec<u8>,
    /// Bytes not yet resolved into a complete (or rejected) query
    /// sequence, carried across `feed` calls since a query can straddle a
    /// PTY read chunk boundary.
    query_buffer: Vec<u8>,
}

impl VtScreen {
    /// Create a screen of `cols` x `rows`, with a scrollback history of
    /// up to 10,000 lines (the vt100 parser's own ring buffer).
    #[must_use]
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, 10_000),
            scrollback: Vec::new(),
            query_buffer: Vec::new(),
        }
    }

    /// Feed a chunk of raw PTY output into the parser and into the capped
    /// scrollback. Returns any terminal-query replies (cursor position,
    /// device attributes, window size, mode, color, kitty-graphics) that
    /// this chunk completed, to be written back to the PTY (`SPEC_FULL.md`
    /// §4.2.2) so a TUI agent probing DSR/DA doesn't hang.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.parser.process(bytes);
        self.scrollback.extend_from_slice(bytes);
        if self.scrollback.len() > SCROLLBACK_CAP {
            let overflow = self.scrollback.len() - SCROLLBACK_CAP;
            self.scrollback.drain(0..overflow);
        }
        self.query_buffer.extend_from_slice(bytes);
        self.drain_query_replies()
    }

    fn drain_query_replies(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            if self.query_buffer.is_empty() {
                break;
            }
            let Some(esc_pos) = self.query_buffer.iter().position(|&b| b == 0x1b) else {
                self.query_buffer.clear();
                break;
            };
            if esc_pos > 0 {
                self.query_buffer.drain(0..esc_pos);
            }
            match query::parse_sequence(&self.query_buffer) {
                query::SeqResult::Incomplete => break,
                query::SeqResult::Plain(len) => {
                    self.query_buffer.drain(0..len);
                }
                query::SeqResult::Query(len, request) => {
                    self.query_buffer.drain(0..len);
                    out.extend(self.reply_for(&request));
                }
            }
        }
        out
    }

    fn reply_for(&self, request: &query::QueryRequest) -> Vec<u8> {
        use query::QueryRequest;
        match request {
            QueryRequest::CursorPosition => {
                let (row, col) = self.parser.screen().cursor_position();
                format!("\x1b[{};{}R", row + 1, col + 1).into_bytes()
            }
            QueryRequest::PrimaryDeviceAttributes => b"\x1b[?1;2c".to_vec(),
            QueryRequest::WindowSizeReport => {
                let (rows, cols) = self.parser.screen().size();
                format!("\x1b[4;{};{}t", u32::from(rows) * 16, u32::from(cols) * 8).into_bytes()
            }
            QueryRequest::RequestMode { private, mode } => {
                let marker = if *private { "?" } else { "" };
                format!("\x1b[{marker}{mode};2$y").into_bytes()
            }
            QueryRequest::BackgroundColor => b"\x1b]11;rgb:0000/0000/0000\x07".to_vec(),
            QueryRequest::PaletteColor(index) => {
                let (r, g, b) = query::ansi_palette_rgb(*index);
                format!("\x1b]4;{index};rgb:{r:02x}{r:02x}/{g:02x}{g:02x}/{b:02x}{b:02x}\x07").into_bytes()
            }
            QueryRequest::KittyGraphicsQuery(id) => format!("\x1b_Gi={id};OK\x1b\\").into_bytes(),
        }
    }

    /// Resize the underlying screen (already clamped by the caller).
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows, cols);
    }

    /// Plain-text scrollback, ANSI already stripped by the VT parser's own
    /// screen model.
    #[must_use]
    pub fn plain_text(&self) -> String {
        let screen = self.parser.screen();
        let mut lines = Vec::with_capacity(screen.size().0 as usize);
        for row in 0..screen.size().0 {
            lines.push(screen.contents_between(row, 0, row, screen.size().1));
        }
        lines.join("\n")
    }

    /// Render the current screen (primary or alt, whichever is active) as
    /// a [`StyledFrame`].
    #[must_use]
    pub fn styled_frame(&self) -> StyledFrame {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let mut lines = Vec::with_capacity(rows as usize);

        for row in 0..rows {
            let mut segments: Vec<StyledSegment> = Vec::new();
            for col in 0..cols {
                let Some(cell) = screen.cell(row, col) else {
                    continue;
                };
                let style = CellStyle {
                    fg: color_name(cell.fgcolor()),
                    bg: color_name(cell.bgcolor()),
                    bold: cell.bold(),
                    italic: cell.italic(),
                    underline: cell.underline(),
                };
                let text = cell.contents();
                match segments.last_mut() {
                    Some(last) if last.style == style => last.text.push_str(&text),
                    _ => segments.push(StyledSegment { text, style }),
                }
            }
            lines.push(StyledLine { segments });
        }

        let (cursor_row, cursor_col) = screen.cursor_position();
        StyledFrame {
            lines,
            cursor_row: cursor_row as usize,
            cursor_col: cursor_col as usize,
        }
    }
}

fn color_name(color: vt100::Color) -> Option<String> {
    match color {
        vt100::Color::Default => None,
        vt100::Color::Idx(idx) => Some(format!("idx:{idx}")),
        vt100::Color::Rgb(r, g, b) => Some(format!("#{r:02x}{g:02x}{b:02x}")),
    }
}

/// Scans raw PTY output for terminal query escape sequences (CSI 6n,
/// DECRQM, CSI c, CSI 14t, OSC 11/OSC 4, kitty-graphics queries) without
/// needing a full state machine of its own: each call is handed the
/// longest prefix of still-unresolved bytes and either classifies a
/// complete sequence, rejects it as non-query, or reports it incomplete
/// so the caller keeps buffering.
mod query {
    /// One recognized query request, already stripped of its escape
    /// sequence framing.
    #[derive(Debug, PartialEq, Eq)]
    pub enum QueryRequest {
        /// `CSI 6 n` — report cursor position.
        CursorPosition,
        /// `CSI c` / `CSI 0 c` — report primary device attributes.
        PrimaryDeviceAttributes,
        /// `CSI 14 t` — report window size in pixels.
        WindowSizeReport,
        /// `CSI [?]Pd $ p` — report a DEC private/ANSI mode's state.
        RequestMode { private: bool, mode: u16 },
        /// `OSC 11 ; ?` — report the background color.
        BackgroundColor,
        /// `OSC 4 ; N ; ?` — report palette color `N`.
        PaletteColor(u8),
        /// Kitty graphics protocol query (`a=q`), carrying its image id.
        KittyGraphicsQuery(u32),
    }

    /// Outcome of trying to parse one sequence from the front of a byte
    /// buffer known to start with ESC (0x1b).
    pub enum SeqResult {
        /// Not enough bytes yet to tell; wait for more.
        Incomplete,
        /// A complete but uninteresting sequence; consume this many bytes.
        Plain(usize),
        /// A complete query; consume this many bytes and reply.
        Query(usize, QueryRequest),
    }

    const MAX_CSI_LEN: usize = 64;
    const MAX_OSC_LEN: usize = 256;
    const MAX_APC_LEN: usize = 4_096;

    pub fn parse_sequence(buf: &[u8]) -> SeqResult {
        if buf.len() < 2 {
            return SeqResult::Incomplete;
        }
        match buf[1] {
            b'[' => parse_csi(buf),
            b']' => parse_terminated(buf, MAX_OSC_LEN, classify_osc),
            b'_' => parse_terminated(buf, MAX_APC_LEN, classify_apc),
            _ => SeqResult::Plain(2),
        }
    }

    fn parse_csi(buf: &[u8]) -> SeqResult {
        let mut i = 2;
        while i < buf.len() {
            let byte = buf[i];
            if (0x40..=0x7e).contains(&byte) {
                let len = i + 1;
                return classify_csi(&buf[2..i], byte).map_or(SeqResult::Plain(len), |request| SeqResult::Query(len, request));
            }
            i += 1;
            if i - 2 > MAX_CSI_LEN {
                return SeqResult::Plain(i);
            }
        }
        SeqResult::Incomplete
    }

    fn classify_csi(params: &[u8], final_byte: u8) -> Option<QueryRequest> {
        let text = std::str::from_utf8(params).ok()?;
        let private = text.starts_with('?');
        let body = text.trim_start_matches('?');
        match final_byte {
            b'n' if body == "6" => Some(QueryRequest::CursorPosition),
            b'c' if !private && (body.is_empty() || body == "0") => Some(QueryRequest::PrimaryDeviceAttributes),
            b't' if body == "14" => Some(QueryRequest::WindowSizeReport),
            b'p' if body.ends_with('$') => body
                .trim_end_matches('$')
                .parse::<u16>()
                .ok()
                .map(|mode| QueryRequest::RequestMode { private, mode }),
            _ => None,
        }
    }

    /// `OSC`/`APC` sequences both end at BEL or ESC-backslash (ST); only
    /// the classifier differs between them.
    fn parse_terminated(buf: &[u8], max_len: usize, classify: impl Fn(&[u8]) -> Option<QueryRequest>) -> SeqResult {
        let mut i = 2;
        loop {
            if i >= buf.len() {
                return SeqResult::Incomplete;
            }
            if buf[i] == 0x07 {
                let len = i + 1;
                return classify(&buf[2..i]).map_or(SeqResult::Plain(len), |request| SeqResult::Query(len, request));
            }
            if buf[i] == 0x1b {
                if i + 1 >= buf.len() {
                    return SeqResult::Incomplete;
                }
                if buf[i + 1] == b'\\' {
                    let len = i + 2;
                    return classify(&buf[2..i]).map_or(SeqResult::Plain(len), |request| SeqResult::Query(len, request));
                }
                return SeqResult::Plain(i);
            }
            i += 1;
            if i > max_len {
                return SeqResult::Plain(i);
            }
        }
    }

    fn classify_osc(params: &[u8]) -> Option<QueryRequest> {
        let text = std::str::from_utf8(params).ok()?;
        if let Some(rest) = text.strip_prefix("11;") {
            if rest == "?" {
                return Some(QueryRequest::BackgroundColor);
            }
        }
        if let Some(rest) = text.strip_prefix("4;") {
            let mut parts = rest.splitn(2, ';');
            let index = parts.next()?.parse::<u8>().ok()?;
            if parts.next()? == "?" {
                return Some(QueryRequest::PaletteColor(index));
            }
        }
        None
    }

    fn classify_apc(params: &[u8]) -> Option<QueryRequest> {
        let text = std::str::from_utf8(params).ok()?;
        let body = text.strip_prefix('G')?;
        let control = body.split(';').next().unwrap_or("");
        let mut is_query = false;
        let mut id = 0u32;
        for field in control.split(',') {
            let mut parts = field.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            match key {
                "a" if value == "q" => is_query = true,
                "i" => id = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        is_query.then_some(QueryRequest::KittyGraphicsQuery(id))
    }

    /// The standard 16-color ANSI palette, for `OSC 4` replies.
    pub fn ansi_palette_rgb(index: u8) -> (u8, u8, u8) {
        const PALETTE: [(u8, u8, u8); 16] = [
            (0x00, 0x00, 0x00),
            (0xaa, 0x00, 0x00),
            (0x00, 0xaa, 0x00),
            (0xaa, 0x55, 0x00),
            (0x00, 0x00, 0xaa),
            (0xaa, 0x00, 0xaa),
            (0x00, 0xaa, 0xaa),
            (0xaa, 0xaa, 0xaa),
            (0x55, 0x55, 0x55),
            (0xff, 0x55, 0x55),
            (0x55, 0xff, 0x55),
            (0xff, 0xff, 0x55),
            (0x55, 0x55, 0xff),
            (0xff, 0x55, 0xff),
            (0x55, 0xff, 0xff),
            (0xff, 0xff, 0xff),
        ];
        PALETTE.get(index as usize).copied().unwrap_or((0, 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgr_colors_and_absolute_cursor() {
        let mut screen = VtScreen::new(20, 5);
        screen.feed(b"\x1b[31mred\x1b[0m\x1b[3;3Hx");
        let frame = screen.styled_frame();
        assert!(frame.lines[0].segments.iter().any(|s| s.text.contains("red")));
        assert_eq!(frame.cursor_row, 2);
        assert_eq!(frame.cursor_col, 3);
    }

    #[test]
    fn clear_screen_and_erase_line() {
        let mut screen = VtScreen::new(10, 2);
        screen.feed(b"hello\r\nworld");
        screen.feed(b"\x1b[2J");
        let text = screen.plain_text();
        assert!(text.trim().is_empty());
    }

    #[test]
    fn tabs_expand_and_wrap_at_width() {
        let mut screen = VtScreen::new(5, 2);
        screen.feed(b"ab\tcd");
        let text = screen.plain_text();
        assert!(!text.is_empty());
    }

    #[test]
    fn alt_screen_enter_and_leave_preserves_primary() {
        let mut screen = VtScreen::new(10, 3);
        screen.feed(b"primary");
        screen.feed(b"\x1b[?1049h\x1b[2Jalt-mode");
        assert!(screen.plain_text().contains("alt-mode"));
        screen.feed(b"\x1b[?1049l");
        assert!(screen.plain_text().contains("primary"));
    }

    #[test]
    fn resize_changes_frame_dimensions() {
        let mut screen = VtScreen::new(10, 2);
        screen.resize(20, 4);
        let frame = screen.styled_frame();
        assert_eq!(frame.lines.len(), 4);
    }

    #[test]
    fn cursor_position_query_reports_one_based_position() {
        let mut screen = VtScreen::new(20, 5);
        screen.feed(b"\x1b[3;3H");
        let reply = screen.feed(b"\x1b[6n");
        assert_eq!(reply, b"\x1b[3;3R");
    }

    #[test]
    fn device_attributes_query_gets_a_reply() {
        let mut screen = VtScreen::new(20, 5);
        let reply = screen.feed(b"\x1b[c");
        assert_eq!(reply, b"\x1b[?1;2c");
    }

    #[test]
    fn window_size_report_query_gets_a_reply() {
        let mut screen = VtScreen::new(80, 24);
        let reply = screen.feed(b"\x1b[14t");
        assert_eq!(reply, b"\x1b[4;384;640t");
    }

    #[test]
    fn decrqm_query_reports_the_requested_mode_number() {
        let mut screen = VtScreen::new(20, 5);
        let reply = screen.feed(b"\x1b[?2026$p");
        assert_eq!(reply, b"\x1b[?2026;2$y");
    }

    #[test]
    fn background_color_query_gets_a_reply() {
        let mut screen = VtScreen::new(20, 5);
        let reply = screen.feed(b"\x1b]11;?\x07");
        assert_eq!(reply, b"\x1b]11;rgb:0000/0000/0000\x07");
    }

    #[test]
    fn palette_color_query_gets_a_reply() {
        let mut screen = VtScreen::new(20, 5);
        let reply = screen.feed(b"\x1b]4;1;?\x1b\\");
        assert_eq!(reply, b"\x1b]4;1;rgb:aaaa/0000/0000\x07");
    }

    #[test]
    fn kitty_graphics_query_echoes_the_image_id() {
        let mut screen = VtScreen::new(20, 5);
        let reply = screen.feed(b"\x1b_Ga=q,i=42;AAAA\x1b\\");
        assert_eq!(reply, b"\x1b_Gi=42;OK\x1b\\");
    }

    #[test]
    fn query_split_across_two_feed_calls_still_replies() {
        let mut screen = VtScreen::new(20, 5);
        let first = screen.feed(b"\x1b[6");
        assert!(first.is_empty());
        let second = screen.feed(b"n");
        assert_eq!(second, b"\x1b[1;1R");
    }
}

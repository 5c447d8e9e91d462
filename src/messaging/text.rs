//! Text splitting and code-fence balancing (`SPEC_FULL.md` §4.3, testable
//! property 7).

/// Character budget for a single Discord message.
pub const DISCORD_LIMIT: usize = 1_900;
/// Character budget for a single Slack message.
pub const SLACK_LIMIT: usize = 3_900;

const FENCE: &str = "```";

/// Strip an outer code fence that wraps the *entire* body (the whole
/// message is exactly one fenced block), returning the inner text
/// unfenced. If the body is not a single outer fence, returns it
/// unchanged.
#[must_use]
pub fn strip_outer_codeblock(s: &str) -> &str {
    let trimmed = s.trim_end_matches('\n');
    let Some(after_open) = trimmed.strip_prefix(FENCE) else {
        return s;
    };
    let Some(newline_idx) = after_open.find('\n') else {
        return s;
    };
    // Skip an optional language tag on the opening fence line.
    let lang_tag = &after_open[..newline_idx];
    if lang_tag.contains(' ') || lang_tag.contains(FENCE) {
        return s;
    }
    let body_and_close = &after_open[newline_idx + 1..];
    let Some(inner) = body_and_close.strip_suffix(FENCE) else {
        return s;
    };
    // Reject if the inner content itself contains an unbalanced fence —
    // that would mean this isn't really a single outer wrapper.
    if count_fence_lines(inner) % 2 != 0 {
        return s;
    }
    inner.trim_end_matches('\n')
}

fn count_fence_lines(s: &str) -> usize {
    s.lines().filter(|line| line.trim_start().starts_with(FENCE)).count()
}

/// Split `s` into chunks no longer than `limit` characters, preserving
/// code-fence balance across chunk boundaries: if a chunk would end with
/// an odd number of ```` ``` ```` lines, the chunk is closed with a fence
/// and the next chunk reopens one, the same way the teacher's Slack
/// `upload_file`/`chat_post_message` flow never straddles fenced output
/// across calls. A single line longer than the budget is hard-split into
/// `limit`-sized pieces before being pushed, so the `<= limit` bound holds
/// even for unbroken input (property 7).
///
/// The outer enclosing fence (if the whole body is one fenced block) is
/// stripped first. Every returned chunk is `<= limit` chars, and joining
/// all chunks with `\n` reproduces `strip_outer_codeblock(s)` (property 7).
#[must_use]
pub fn split_for_platform(s: &str, limit: usize) -> Vec<String> {
    let unwrapped = strip_outer_codeblock(s);
    if unwrapped.chars().count() <= limit {
        return vec![unwrapped.to_string()];
    }

    // Leave room for a fence closer/reopener ("```\n") so a hard-split
    // piece never overflows `limit` once that bookkeeping is added.
    let max_piece = limit.saturating_sub(FENCE.len() + 1).max(1);

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    let mut open_fence = false;

    for line in unwrapped.split('\n') {
        let is_fence_line = line.trim_start().starts_with(FENCE);

        for piece in split_line_into_pieces(line, max_piece) {
            let line_len = piece.chars().count() + 1; // account for the joining '\n'
            let closer_len = if open_fence { FENCE.len() + 1 } else { 0 };

            if current_len + line_len + closer_len > limit && !current.is_empty() {
                if open_fence {
                    current.push_str(FENCE);
                    current.push('\n');
                }
                chunks.push(current.trim_end_matches('\n').to_string());
                current = String::new();
                current_len = 0;
                if open_fence {
                    current.push_str(FENCE);
                    current.push('\n');
                    current_len += FENCE.len() + 1;
                }
            }

            current.push_str(&piece);
            current.push('\n');
            current_len += line_len;
        }

        if is_fence_line {
            open_fence = !open_fence;
        }
    }

    if !current.is_empty() {
        chunks.push(current.trim_end_matches('\n').to_string());
    }

    if chunks.is_empty() {
        chunks.push(String::new());
    }

    chunks
}

/// Break `line` into `<= max_piece`-char pieces. Returns a single
/// one-element vec when `line` already fits.
fn split_line_into_pieces(line: &str, max_piece: usize) -> Vec<String> {
    if line.chars().count() <= max_piece {
        return vec![line.to_string()];
    }
    line.chars()
        .collect::<Vec<char>>()
        .chunks(max_piece)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = split_for_platform("hello world", DISCORD_LIMIT);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn every_chunk_respects_the_limit() {
        let big = "a".repeat(5_000);
        let chunks = split_for_platform(&big, 100);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[test]
    fn fence_split_across_chunks_stays_balanced() {
        let body = format!("before\n{FENCE}rust\n{}\n{FENCE}\nafter", "x".repeat(200));
        let chunks = split_for_platform(&body, 60);
        for chunk in &chunks {
            let fence_lines = chunk
                .lines()
                .filter(|line| line.trim_start().starts_with(FENCE))
                .count();
            assert_eq!(fence_lines % 2, 0, "unbalanced fence in chunk: {chunk:?}");
        }
    }

    #[test]
    fn outer_codeblock_is_stripped() {
        let body = format!("{FENCE}\nhello\n{FENCE}");
        assert_eq!(strip_outer_codeblock(&body), "hello");
    }

    #[test]
    fn non_outer_codeblock_is_left_alone() {
        let body = "text before\n```\ncode\n```\ntext after";
        assert_eq!(strip_outer_codeblock(body), body);
    }
}

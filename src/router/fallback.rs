//! Buffer fallback (C7): when an agent has no event hook (or it fires
//! late, or is suppressed by an interactive TUI prompt), synthesize a
//! response from the terminal's own scrollback. Timer cancellation is
//! keyed per `(project, instance)`, the same `CancellationToken`-per-key
//! idiom the teacher uses for its stall-detector timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay before the first buffer check after scheduling.
pub const INITIAL_DELAY: Duration = Duration::from_millis(3_000);
/// Delay between subsequent stability checks.
pub const STABLE_CHECK_DELAY: Duration = Duration::from_millis(2_000);
/// Number of checks before yielding to the hook.
pub const MAX_CHECKS: u32 = 3;

/// Configuration for the fallback scheduler, including the ordered list
/// of prompt-marker patterns used to find the "last command block" in a
/// stable buffer.
#[derive(Clone)]
pub struct FallbackConfig {
    /// Delay before the first check.
    pub initial_delay: Duration,
    /// Delay between subsequent checks.
    pub stable_check_delay: Duration,
    /// Maximum number of checks before giving up.
    pub max_checks: u32,
    /// Prompt-marker patterns, checked in order; first match wins
    /// (`SPEC_FULL.md` §9.1). Defaults to a single `^❯\s` entry.
    pub prompt_markers: Vec<Regex>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_DELAY,
            stable_check_delay: STABLE_CHECK_DELAY,
            max_checks: MAX_CHECKS,
            prompt_markers: vec![default_prompt_marker()],
        }
    }
}

#[allow(clippy::unwrap_used)]
fn default_prompt_marker() -> Regex {
    Regex::new(r"(?m)^❯\s").unwrap()
}

type FallbackKey = (String, String);

/// Tracks one in-flight fallback timer per `(project, instance)`, so a new
/// schedule cancels any prior one for the same key.
#[derive(Default)]
pub struct FallbackScheduler {
    handles: Mutex<HashMap<FallbackKey, CancellationToken>>,
}

impl FallbackScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any prior timer for `key` and spawn a fresh one that calls
    /// `capture` after `config.initial_delay`, then every
    /// `config.stable_check_delay` up to `config.max_checks` times,
    /// comparing each capture to the previous one. `on_stable` fires
    /// exactly once, the first time two consecutive non-empty captures are
    /// equal (`SPEC_FULL.md` §4.6 steps 4-5, property 9) — a single
    /// non-empty capture is never enough on its own, since the agent may
    /// still be writing.
    pub async fn schedule<F, Fut, S, Fut2>(self: &Arc<Self>, project: &str, instance_id: &str, config: FallbackConfig, capture: F, on_stable: S)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = String> + Send,
        S: FnOnce(String) -> Fut2 + Send + 'static,
        Fut2: std::future::Future<Output = ()> + Send,
    {
        let key: FallbackKey = (project.to_string(), instance_id.to_string());
        let token = CancellationToken::new();
        {
            let mut handles = self.handles.lock().await;
            if let Some(previous) = handles.insert(key.clone(), token.clone()) {
                previous.cancel();
            }
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(config.initial_delay) => {}
            }

            let mut previous: Option<String> = None;
            let mut on_stable = Some(on_stable);

            for attempt in 0..config.max_checks {
                if token.is_cancelled() {
                    return;
                }
                let current = capture().await;
                debug!(project = %key.0, instance = %key.1, attempt, "buffer fallback check ran");

                if !current.trim().is_empty() {
                    if previous.as_deref() == Some(current.as_str()) {
                        if let Some(on_stable) = on_stable.take() {
                            on_stable(current).await;
                        }
                        break;
                    }
                    previous = Some(current);
                } else {
                    previous = None;
                }

                if attempt + 1 < config.max_checks {
                    tokio::select! {
                        () = token.cancelled() => return,
                        () = tokio::time::sleep(config.stable_check_delay) => {}
                    }
                }
            }

            scheduler.handles.lock().await.remove(&key);
        });
    }

    /// Cancel any pending timer for `key` (the hook won the race).
    pub async fn cancel(&self, project: &str, instance_id: &str) {
        let key: FallbackKey = (project.to_string(), instance_id.to_string());
        if let Some(token) = self.handles.lock().await.remove(&key) {
            token.cancel();
        }
    }
}

/// Extract the "last command block": lines from the last line matching a
/// configured prompt marker to the end of the buffer. If no marker
/// matches, the entire stable text is returned.
#[must_use]
pub fn extract_last_command_block(buffer: &str, markers: &[Regex]) -> String {
    let lines: Vec<&str> = buffer.lines().collect();
    for (index, line) in lines.iter().enumerate().rev() {
        if markers.iter().any(|marker| marker.is_match(line)) {
            return lines[index..].join("\n");
        }
    }
    buffer.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_last_prompt_marker() {
        let markers = FallbackConfig::default().prompt_markers;
        let buffer = "$ build\n… compiling …\n❯ done\n";
        let block = extract_last_command_block(buffer, &markers);
        assert_eq!(block, "❯ done\n".trim_end());
    }

    #[test]
    fn returns_entire_buffer_when_no_marker_found() {
        let markers = FallbackConfig::default().prompt_markers;
        let buffer = "no prompt markers here\njust text";
        assert_eq!(extract_last_command_block(buffer, &markers), buffer);
    }

    #[tokio::test]
    async fn rescheduling_cancels_the_prior_timer() {
        let scheduler = Arc::new(FallbackScheduler::new());
        let calls = Arc::new(Mutex::new(0u32));

        let config = FallbackConfig {
            initial_delay: Duration::from_millis(5),
            stable_check_delay: Duration::from_millis(5),
            max_checks: 3,
            ..FallbackConfig::default()
        };

        let calls_clone = Arc::clone(&calls);
        scheduler
            .schedule(
                "demo",
                "claude",
                config.clone(),
                move || {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        *calls.lock().await += 1;
                        "same output".to_string()
                    }
                },
                |_| async {},
            )
            .await;

        scheduler.cancel("demo", "claude").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*calls.lock().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_on_stable_only_after_two_equal_captures() {
        let scheduler = Arc::new(FallbackScheduler::new());
        let captures = Arc::new(Mutex::new(vec!["first".to_string(), "second".to_string(), "second".to_string()]));
        let fired = Arc::new(Mutex::new(None));

        let config = FallbackConfig {
            initial_delay: Duration::from_millis(5),
            stable_check_delay: Duration::from_millis(5),
            max_checks: 3,
            ..FallbackConfig::default()
        };

        let captures_clone = Arc::clone(&captures);
        let fired_clone = Arc::clone(&fired);
        scheduler
            .schedule(
                "demo",
                "claude",
                config,
                move || {
                    let captures = Arc::clone(&captures_clone);
                    async move {
                        let mut captures = captures.lock().await;
                        if captures.is_empty() {
                            String::new()
                        } else {
                            captures.remove(0)
                        }
                    }
                },
                move |text| {
                    let fired = Arc::clone(&fired_clone);
                    async move {
                        *fired.lock().await = Some(text);
                    }
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*fired.lock().await, Some("second".to_string()));
    }
}

//! Multiplexer-backed runtime: delegates to an external terminal
//! multiplexer's command-line interface. Shells out the same way the
//! teacher's `acp::spawner::spawn_agent` invokes the agent CLI via
//! `Command::new`, just pointed at a multiplexer binary instead.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::runtime::{AgentHint, Runtime, Signal, StyledFrame, WindowSnapshot};
use crate::{AppError, Result};

/// Runtime backend that drives an external terminal multiplexer binary
/// (e.g. `tmux`) via its CLI.
pub struct TmuxRuntime {
    binary: String,
    known_windows: RwLock<HashMap<String, ()>>,
}

impl TmuxRuntime {
    /// Create a backend that shells out to `binary` (typically `"tmux"`).
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            known_windows: RwLock::new(HashMap::new()),
        }
    }

    fn target(session: &str, window: &str) -> String {
        format!("{session}:{window}")
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(binary = %self.binary, ?args, "tmux command");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|err| AppError::Runtime(format!("failed to run {}: {err}", self.binary)))?;
        Ok(output)
    }

    async fn run_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Runtime(format!(
                "{} {:?} failed: {stderr}",
                self.binary, args
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Runtime for TmuxRuntime {
    async fn get_or_create_session(&self, project_name: &str, first_window: Option<&str>) -> Result<String> {
        let session = project_name.to_string();
        let has_session = self
            .run(&["has-session", "-t", &session])
            .await?
            .status
            .success();
        if !has_session {
            let window = first_window.unwrap_or("main");
            self.run_ok(&["new-session", "-d", "-s", &session, "-n", window])
                .await?;
            self.known_windows
                .write()
                .await
                .insert(Self::target(&session, window), ());
        }
        Ok(session)
    }

    async fn set_session_env(&self, session: &str, key: &str, value: &str) -> Result<()> {
        self.run_ok(&["setenv", "-t", session, key, value]).await
    }

    async fn window_exists(&self, session: &str, window: &str) -> Result<bool> {
        let target = Self::target(session, window);
        Ok(self
            .run(&["list-panes", "-t", &target])
            .await?
            .status
            .success())
    }

    async fn start_agent_in_window(&self, session: &str, window: &str, shell_command: &str) -> Result<()> {
        let target = Self::target(session, window);
        if !self.window_exists(session, window).await? {
            self.run_ok(&["new-window", "-t", session, "-n", window])
                .await?;
        }
        let wrapped = format!("/bin/sh -lc {}", shell_quote(shell_command));
        self.run_ok(&["send-keys", "-t", &target, "-l", &wrapped])
            .await?;
        self.run_ok(&["send-keys", "-t", &target, "Enter"]).await?;
        self.known_windows.write().await.insert(target, ());
        Ok(())
    }

    async fn type_keys_to_window(&self, session: &str, window: &str, text: &str, _agent_hint: Option<&AgentHint>) -> Result<()> {
        let target = Self::target(session, window);
        self.run_ok(&["send-keys", "-t", &target, "-l", text]).await
    }

    async fn send_enter_to_window(&self, session: &str, window: &str, _agent_hint: Option<&AgentHint>) -> Result<()> {
        let target = Self::target(session, window);
        self.run_ok(&["send-keys", "-t", &target, "Enter"]).await
    }

    async fn get_window_buffer(&self, session: &str, window: &str) -> Result<String> {
        let target = Self::target(session, window);
        let output = self.run(&["capture-pane", "-p", "-t", &target]).await?;
        if !output.status.success() {
            return Err(AppError::Runtime(format!("can't find window {target}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn get_window_frame(&self, _session: &str, _window: &str, _cols: Option<u16>, _rows: Option<u16>) -> Result<Option<StyledFrame>> {
        // The multiplexer backend has no VT screen of its own; callers
        // fall back to get_window_buffer.
        Ok(None)
    }

    async fn resize_window(&self, session: &str, window: &str, cols: u16, rows: u16) -> Result<()> {
        let target = Self::target(session, window);
        let (cols, rows) = super::clamp_dimensions(cols, rows);
        self.run_ok(&[
            "resize-window",
            "-t",
            &target,
            "-x",
            &cols.to_string(),
            "-y",
            &rows.to_string(),
        ])
        .await
    }

    async fn stop_window(&self, session: &str, window: &str, _signal: Signal) -> Result<bool> {
        let target = Self::target(session, window);
        let existed = self.window_exists(session, window).await?;
        if existed {
            self.run_ok(&["kill-window", "-t", &target]).await?;
            self.known_windows.write().await.remove(&target);
        }
        Ok(existed)
    }

    async fn list_windows(&self, session: Option<&str>) -> Result<Vec<WindowSnapshot>> {
        let args: Vec<&str> = match session {
            Some(session) => vec!["list-windows", "-t", session, "-F", "#{session_name}:#{window_name}"],
            None => vec!["list-windows", "-a", "-F", "#{session_name}:#{window_name}"],
        };
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut snapshots = Vec::new();
        for line in stdout.lines() {
            if let Some((session, window)) = line.split_once(':') {
                snapshots.push(WindowSnapshot {
                    session: session.to_string(),
                    window: window.to_string(),
                    alive: true,
                });
            }
        }
        Ok(snapshots)
    }

    async fn dispose(&self, _signal: Signal) -> Result<()> {
        let targets: Vec<String> = self.known_windows.read().await.keys().cloned().collect();
        for target in targets {
            if let Err(err) = self.run_ok(&["kill-window", "-t", &target]).await {
                warn!(%target, %err, "failed to kill window during dispose");
            }
        }
        self.known_windows.write().await.clear();
        Ok(())
    }
}

fn shell_quote(command: &str) -> String {
    format!("'{}'", command.replace('\'', "'\\''"))
}

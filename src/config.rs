//! Config store (C11): a small persisted key/value configuration file with
//! an environment/keyring credential overlay, grounded in the teacher's
//! `GlobalConfig` (`src/config.rs`) and its `load_credentials` startup step
//! in `main.rs`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::write_json_atomic;
use crate::{AppError, Result};

/// Which chat platform the bridge talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagingPlatform {
    /// Discord gateway bot.
    #[default]
    Discord,
    /// Slack Socket Mode app.
    Slack,
}

/// OpenCode's permission prompt handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpencodePermissionMode {
    /// Auto-allow every tool call (`OPENCODE_PERMISSION='{"*":"allow"}'`).
    Allow,
    /// Leave OpenCode's default interactive prompting in place.
    #[default]
    Default,
}

/// Which runtime backend new instances use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// External terminal-multiplexer backend.
    Tmux,
    /// In-process PTY backend.
    Pty,
}

impl Default for RuntimeMode {
    fn default() -> Self {
        Self::Tmux
    }
}

fn default_hook_port() -> u16 {
    18470
}

/// Persisted daemon configuration (`~/.discode/config.json`, mode 0600).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Discord bot token.
    #[serde(default)]
    pub token: Option<String>,
    /// Discord guild/server id.
    #[serde(default)]
    pub server_id: Option<String>,
    /// Default/fallback channel id.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Hook HTTP server port.
    #[serde(default = "default_hook_port")]
    pub hook_server_port: u16,
    /// Default agent CLI for new instances.
    #[serde(default)]
    pub default_agent_cli: Option<String>,
    /// OpenCode permission-prompt handling.
    #[serde(default)]
    pub opencode_permission_mode: OpencodePermissionMode,
    /// Keep the chat channel around when an instance is stopped.
    #[serde(default)]
    pub keep_channel_on_stop: bool,
    /// Slack bot token (xoxb-...).
    #[serde(default)]
    pub slack_bot_token: Option<String>,
    /// Slack app-level token (xapp-...), used for Socket Mode.
    #[serde(default)]
    pub slack_app_token: Option<String>,
    /// Which chat platform is active.
    #[serde(default)]
    pub messaging_platform: MessagingPlatform,
    /// Which runtime backend new instances use.
    #[serde(default)]
    pub runtime_mode: RuntimeMode,
    /// Whether anonymous telemetry is enabled.
    #[serde(default)]
    pub telemetry_enabled: bool,
    /// Telemetry collector endpoint, when enabled.
    #[serde(default)]
    pub telemetry_endpoint: Option<String>,
    /// Stable per-install telemetry identifier.
    #[serde(default)]
    pub telemetry_install_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: None,
            server_id: None,
            channel_id: None,
            hook_server_port: default_hook_port(),
            default_agent_cli: None,
            opencode_permission_mode: OpencodePermissionMode::default(),
            keep_channel_on_stop: false,
            slack_bot_token: None,
            slack_app_token: None,
            messaging_platform: MessagingPlatform::default(),
            runtime_mode: RuntimeMode::default(),
            telemetry_enabled: false,
            telemetry_endpoint: None,
            telemetry_install_id: None,
        }
    }
}

impl Config {
    /// Load from `path`, returning the default config if the file does not
    /// yet exist (fresh install).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let body = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&body)
            .map_err(|err| AppError::Config(format!("invalid config.json: {err}")))?;
        Ok(config)
    }

    /// Persist to `path` atomically, mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self, 0o600)
    }

    /// Apply the environment-variable / OS-keyring credential overlay
    /// described in `SPEC_FULL.md` §3.1: env wins, then keyring, then the
    /// value already in the file. Secrets are never written back to disk
    /// by this step.
    pub fn apply_credential_overlay(&mut self) {
        self.token = overlay_secret("DISCODE_TOKEN", "token", self.token.take());
        self.slack_bot_token = overlay_secret(
            "DISCODE_SLACK_BOT_TOKEN",
            "slackBotToken",
            self.slack_bot_token.take(),
        );
        self.slack_app_token = overlay_secret(
            "DISCODE_SLACK_APP_TOKEN",
            "slackAppToken",
            self.slack_app_token.take(),
        );
    }
}

fn overlay_secret(env_var: &str, keyring_account: &str, file_value: Option<String>) -> Option<String> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Some(value);
        }
    }

    let entry = keyring::Entry::new("discode", keyring_account);
    match entry {
        Ok(entry) => match entry.get_password() {
            Ok(password) if !password.is_empty() => return Some(password),
            Ok(_) => {}
            Err(keyring::Error::NoEntry) => {}
            Err(err) => warn!(%err, account = keyring_account, "keyring lookup failed"),
        },
        Err(err) => warn!(%err, account = keyring_account, "keyring unavailable"),
    }

    file_value
}

/// Default path to the daemon's persisted files directory, `~/.discode`.
pub fn default_home_dir() -> Result<PathBuf> {
    let home = dirs_home()?;
    Ok(home.join(".discode"))
}

/// Minimal home-directory lookup (`$HOME` on Unix, `%USERPROFILE%` on
/// Windows) kept local rather than pulling in the `dirs` crate, since this
/// is the only place the daemon needs it.
fn dirs_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Ok(PathBuf::from(profile));
        }
    }
    Err(AppError::Config(
        "cannot determine home directory (HOME/USERPROFILE unset)".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.hook_server_port, 18470);
        assert_eq!(config.messaging_platform, MessagingPlatform::Discord);
        assert_eq!(config.runtime_mode, RuntimeMode::Tmux);
    }

    #[test]
    fn round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = dir.path().join("config.json");
        let mut config = Config {
            hook_server_port: 18470,
            ..Config::default()
        };
        config.save(&path).unwrap_or_else(|err| panic!("save: {err}"));
        let loaded = Config::load(&path).unwrap_or_else(|err| panic!("load: {err}"));
        assert_eq!(loaded.hook_server_port, 18470);
    }

    #[test]
    fn env_overlay_wins_over_file_value() {
        std::env::set_var("DISCODE_TOKEN", "env-token");
        let mut config = Config {
            token: Some("file-token".into()),
            ..Config::default()
        };
        config.apply_credential_overlay();
        assert_eq!(config.token.as_deref(), Some("env-token"));
        std::env::remove_var("DISCODE_TOKEN");
    }
}

//! Agent adapter interface (`SPEC_FULL.md` §6.1): the narrow seam the
//! daemon needs to compute a start command and know whether a hook
//! installer exists for a given agent type. Grounded in the teacher's
//! `acp::spawner::SpawnConfig` (host CLI + args + workspace root), cut
//! down to the handful of operations this daemon actually needs — the
//! installers and agent CLIs themselves are out of scope.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

const DEFAULT_SUBMIT_DELAY: Duration = Duration::from_millis(300);
const OPENCODE_SUBMIT_DELAY: Duration = Duration::from_millis(75);

/// The per-agent-type seam: computing a start command, a submit delay,
/// and (best-effort) installing the event hook.
pub trait AgentAdapter: Send + Sync {
    /// The agent type this adapter handles (`"claude"`, `"gemini"`, `"opencode"`).
    fn agent_type(&self) -> &str;

    /// Build the shell command used to launch this agent inside its
    /// window, rooted at `workspace_root`.
    fn start_command(&self, workspace_root: &Path, permission_allow: bool) -> String;

    /// Delay between typing a message and sending the submit key.
    fn submit_delay(&self) -> Duration;

    /// Best-effort hook install. Returns `Ok(true)` if a hook was
    /// (re)installed, `Ok(false)` if this agent type has no installer,
    /// `Err` on install failure (logged, non-fatal by callers).
    ///
    /// # Errors
    ///
    /// Returns an error if the install step itself fails; callers treat
    /// this as non-fatal and continue without the hook.
    fn install_hook(&self, workspace_root: &Path, port: u16) -> Result<bool>;
}

/// `claude` adapter. Hook installation is handled by the Claude CLI's own
/// plugin mechanism, out of scope here.
pub struct ClaudeAdapter;

impl AgentAdapter for ClaudeAdapter {
    fn agent_type(&self) -> &str {
        "claude"
    }

    fn start_command(&self, workspace_root: &Path, permission_allow: bool) -> String {
        let flag = if permission_allow { " --dangerously-skip-permissions" } else { "" };
        format!("cd '{}' && claude{flag}", workspace_root.display())
    }

    fn submit_delay(&self) -> Duration {
        DEFAULT_SUBMIT_DELAY
    }

    fn install_hook(&self, _workspace_root: &Path, _port: u16) -> Result<bool> {
        Ok(false)
    }
}

/// `gemini` adapter.
pub struct GeminiAdapter;

impl AgentAdapter for GeminiAdapter {
    fn agent_type(&self) -> &str {
        "gemini"
    }

    fn start_command(&self, workspace_root: &Path, _permission_allow: bool) -> String {
        format!("cd '{}' && gemini", workspace_root.display())
    }

    fn submit_delay(&self) -> Duration {
        DEFAULT_SUBMIT_DELAY
    }

    fn install_hook(&self, _workspace_root: &Path, _port: u16) -> Result<bool> {
        Ok(false)
    }
}

/// `opencode` adapter. Submits faster than the others since its TUI
/// echoes keystrokes with less input lag.
pub struct OpencodeAdapter;

impl AgentAdapter for OpencodeAdapter {
    fn agent_type(&self) -> &str {
        "opencode"
    }

    fn start_command(&self, workspace_root: &Path, permission_allow: bool) -> String {
        let flag = if permission_allow { " --permission allow" } else { "" };
        format!("cd '{}' && opencode{flag}", workspace_root.display())
    }

    fn submit_delay(&self) -> Duration {
        OPENCODE_SUBMIT_DELAY
    }

    fn install_hook(&self, _workspace_root: &Path, _port: u16) -> Result<bool> {
        Ok(false)
    }
}

/// Lookup table of the three shipped adapters, keyed by agent type.
/// Unknown agent types fall back to [`ClaudeAdapter`]'s defaults rather
/// than erroring — the daemon still needs *a* start command to report.
pub struct AgentRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        let mut adapters: HashMap<String, Arc<dyn AgentAdapter>> = HashMap::new();
        adapters.insert("claude".to_string(), Arc::new(ClaudeAdapter));
        adapters.insert("gemini".to_string(), Arc::new(GeminiAdapter));
        adapters.insert("opencode".to_string(), Arc::new(OpencodeAdapter));
        Self { adapters }
    }
}

impl AgentRegistry {
    /// Build the default registry with the three shipped adapters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the adapter for `agent_type`, falling back to `claude`'s
    /// defaults for unrecognized types.
    #[must_use]
    pub fn get(&self, agent_type: &str) -> Arc<dyn AgentAdapter> {
        self.adapters
            .get(agent_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(ClaudeAdapter))
    }

    /// Convenience accessor for a type's submit delay.
    #[must_use]
    pub fn submit_delay_for(&self, agent_type: &str) -> Duration {
        self.get(agent_type).submit_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opencode_has_shorter_submit_delay_than_claude() {
        let registry = AgentRegistry::new();
        assert!(registry.submit_delay_for("opencode") < registry.submit_delay_for("claude"));
    }

    #[test]
    fn unknown_agent_type_falls_back_to_claude_defaults() {
        let registry = AgentRegistry::new();
        assert_eq!(registry.submit_delay_for("unknown"), DEFAULT_SUBMIT_DELAY);
    }

    #[test]
    fn start_command_roots_at_workspace() {
        let registry = AgentRegistry::new();
        let adapter = registry.get("claude");
        let command = adapter.start_command(Path::new("/tmp/project"), false);
        assert!(command.contains("/tmp/project"));
        assert!(!command.contains("--dangerously-skip-permissions"));
    }
}

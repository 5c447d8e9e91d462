//! Persisted project/instance topology (C1).
//!
//! `BridgeState` is the single source of truth for which projects exist,
//! which agent instances they host, and which chat channel each instance is
//! bound to. It is persisted as a JSON file and written atomically
//! (write-to-temp, then rename) so a crash mid-write never corrupts the
//! previous good copy — the same discipline the teacher applies to its
//! `SQLite` connection, adapted to flat files per `SPEC_FULL.md` §3.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{AppError, Result};

/// One running occurrence of an agent for a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Unique identifier within the owning project.
    pub instance_id: String,
    /// Free-form agent kind, e.g. `claude`, `gemini`, `opencode`.
    pub agent_type: String,
    /// Runtime-window identifier within the project's session.
    pub window_name: String,
    /// Chat channel exclusively bound to this instance, if set up.
    #[serde(alias = "discordChannelId")]
    pub channel_id: Option<String>,
    /// Whether an agent-side hook plugin is known to be installed.
    pub event_hook: bool,
    /// Whether this instance runs inside a container.
    #[serde(default)]
    pub container_mode: bool,
    /// Container identifier, when `container_mode` is set.
    #[serde(default)]
    pub container_id: Option<String>,
    /// Container name, when `container_mode` is set.
    #[serde(default)]
    pub container_name: Option<String>,
}

/// A project hosting one or more agent instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Unique, filesystem-safe project name (≤ 80 chars).
    pub project_name: String,
    /// Absolute working directory of the agent.
    pub project_path: PathBuf,
    /// Terminal-multiplexer session name; defaults to `"bridge"`.
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// Instances keyed by `instanceId`.
    pub instances: HashMap<String, Instance>,
    /// Derived: `agentType -> channelId` of the primary (first-created)
    /// instance of each agent type. Rebuilt on every normalize, never
    /// hand-edited.
    #[serde(default, alias = "discordChannels")]
    pub channels: HashMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time any instance in this project processed a message.
    pub last_active: DateTime<Utc>,
    /// Insertion order of instance ids, oldest first — needed because
    /// `HashMap` iteration order is not creation order and "primary
    /// instance of an agent type" is defined as first-by-creation.
    #[serde(default)]
    pub instance_order: Vec<String>,
}

fn default_session_name() -> String {
    "bridge".to_string()
}

impl Project {
    /// Rebuild the derived `channels` map from `instances`/`instance_order`.
    pub fn rebuild_channels(&mut self) {
        self.channels.clear();
        for instance_id in &self.instance_order {
            let Some(instance) = self.instances.get(instance_id) else {
                continue;
            };
            let Some(channel_id) = &instance.channel_id else {
                continue;
            };
            self.channels
                .entry(instance.agent_type.clone())
                .or_insert_with(|| channel_id.clone());
        }
    }

    /// The primary (first-created) instance of a given agent type, if any.
    #[must_use]
    pub fn primary_instance_for_agent(&self, agent_type: &str) -> Option<&Instance> {
        self.instance_order
            .iter()
            .filter_map(|id| self.instances.get(id))
            .find(|inst| inst.agent_type == agent_type)
    }

    /// Find the instance bound to a given chat channel.
    #[must_use]
    pub fn instance_by_channel(&self, channel_id: &str) -> Option<&Instance> {
        self.instances
            .values()
            .find(|inst| inst.channel_id.as_deref() == Some(channel_id))
    }

    /// Compute the next available instance id for `agent_type`: the first
    /// string in `{agent_type, agent_type-2, agent_type-3, ...}` not already
    /// used in this project (property 2).
    #[must_use]
    pub fn build_next_instance_id(&self, agent_type: &str) -> String {
        if !self.instances.contains_key(agent_type) {
            return agent_type.to_string();
        }
        let mut n = 2u32;
        loop {
            let candidate = format!("{agent_type}-{n}");
            if !self.instances.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Insert or replace an instance, keeping `instance_order` and
    /// `channels` consistent.
    pub fn upsert_instance(&mut self, instance: Instance) {
        let id = instance.instance_id.clone();
        if !self.instances.contains_key(&id) {
            self.instance_order.push(id.clone());
        }
        self.instances.insert(id, instance);
        self.rebuild_channels();
    }

    /// Remove an instance. Returns `true` if the project is now empty and
    /// should itself be removed (invariant: removing the last instance
    /// removes the project).
    pub fn remove_instance(&mut self, instance_id: &str) -> bool {
        self.instances.remove(instance_id);
        self.instance_order.retain(|id| id != instance_id);
        self.rebuild_channels();
        self.instances.is_empty()
    }
}

/// Top-level persisted state: one chat-platform workspace/guild and its
/// projects.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeState {
    /// Discord guild id, when the messaging platform is Discord.
    #[serde(default)]
    pub guild_id: Option<String>,
    /// Slack workspace id, when the messaging platform is Slack.
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Projects keyed by `projectName`.
    #[serde(default)]
    pub projects: HashMap<String, Project>,
}

impl BridgeState {
    /// Migrate legacy field names and rebuild every project's derived
    /// `channels` map. Idempotent — safe to call on already-normalized
    /// state (property 1).
    pub fn normalize(&mut self) {
        for project in self.projects.values_mut() {
            if project.instance_order.is_empty() && !project.instances.is_empty() {
                // Legacy state with no recorded creation order: fall back to
                // a stable (sorted) order rather than HashMap iteration
                // order, so repeated normalization is deterministic.
                let mut ids: Vec<String> = project.instances.keys().cloned().collect();
                ids.sort();
                project.instance_order = ids;
            }
            project.rebuild_channels();
        }
    }
}

/// Atomically persist `value` as pretty JSON to `path`, via a sibling
/// `.tmp` file and a rename (grounded in the atomic-write pattern shown in
/// `other_examples/b4a90aad_saltyskip-cthulu__cthulu-backend-api-mod.rs.rs`'s
/// `save_sessions`). On Unix the final file is `chmod`ed to `mode`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, body)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load `BridgeState` from disk, normalizing legacy fields. Returns the
/// default (empty) state if the file does not yet exist.
pub fn load_state(path: &Path) -> Result<BridgeState> {
    if !path.exists() {
        return Ok(BridgeState::default());
    }
    let body = std::fs::read_to_string(path)?;
    let mut state: BridgeState = serde_json::from_str(&body)
        .map_err(|err| AppError::State(format!("failed to parse state file: {err}")))?;
    state.normalize();
    Ok(state)
}

/// In-memory, lock-guarded handle to the persisted `BridgeState`. All
/// mutating operations serialize under a single writer lock and persist
/// before returning, matching §5's "state-store writes are globally
/// serialized" guarantee.
pub struct StateStore {
    path: PathBuf,
    inner: RwLock<BridgeState>,
}

impl StateStore {
    /// Load (or initialize empty) state from `path`.
    pub fn load(path: PathBuf) -> Result<Self> {
        let state = load_state(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(state),
        })
    }

    /// Re-read state from disk, discarding in-memory changes not yet
    /// persisted by this process (used by `POST /reload`).
    pub async fn reload(&self) -> Result<()> {
        let state = load_state(&self.path)?;
        *self.inner.write().await = state;
        info!("state reloaded from disk");
        Ok(())
    }

    /// Snapshot of all projects.
    pub async fn list_projects(&self) -> Vec<Project> {
        self.inner.read().await.projects.values().cloned().collect()
    }

    /// Look up a project by name.
    pub async fn get_project(&self, name: &str) -> Option<Project> {
        self.inner.read().await.projects.get(name).cloned()
    }

    /// Insert or replace a project, then persist.
    pub async fn set_project(&self, mut project: Project) -> Result<()> {
        project.rebuild_channels();
        let mut guard = self.inner.write().await;
        guard.projects.insert(project.project_name.clone(), project);
        self.persist_locked(&guard)
    }

    /// Remove a project entirely, then persist.
    pub async fn remove_project(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.projects.remove(name);
        self.persist_locked(&guard)
    }

    /// Bump `lastActive` on a project to now.
    pub async fn update_last_active(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(project) = guard.projects.get_mut(name) {
            project.last_active = Utc::now();
        }
        self.persist_locked(&guard)
    }

    /// Find the project + instance bound to `channel_id`.
    pub async fn find_by_channel(&self, channel_id: &str) -> Option<(Project, Instance)> {
        let guard = self.inner.read().await;
        for project in guard.projects.values() {
            if let Some(instance) = project.instance_by_channel(channel_id) {
                return Some((project.clone(), instance.clone()));
            }
        }
        None
    }

    /// Agent type bound to a given channel, if any.
    pub async fn agent_type_by_channel(&self, channel_id: &str) -> Option<String> {
        self.find_by_channel(channel_id)
            .await
            .map(|(_, instance)| instance.agent_type)
    }

    /// Current Discord guild id.
    pub async fn guild_id(&self) -> Option<String> {
        self.inner.read().await.guild_id.clone()
    }

    /// Set the Discord guild id and persist.
    pub async fn set_guild_id(&self, guild_id: String) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.guild_id = Some(guild_id);
        self.persist_locked(&guard)
    }

    /// Current Slack workspace id.
    pub async fn workspace_id(&self) -> Option<String> {
        self.inner.read().await.workspace_id.clone()
    }

    /// Set the Slack workspace id and persist.
    pub async fn set_workspace_id(&self, workspace_id: String) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.workspace_id = Some(workspace_id);
        self.persist_locked(&guard)
    }

    fn persist_locked(&self, state: &BridgeState) -> Result<()> {
        write_json_atomic(&self.path, state, 0o600).map_err(|err| {
            warn!(%err, "failed to persist bridge state");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instance(id: &str, agent: &str, channel: Option<&str>) -> Instance {
        Instance {
            instance_id: id.to_string(),
            agent_type: agent.to_string(),
            window_name: id.to_string(),
            channel_id: channel.map(str::to_string),
            event_hook: false,
            container_mode: false,
            container_id: None,
            container_name: None,
        }
    }

    #[test]
    fn next_instance_id_skips_taken_slots() {
        let mut project = Project {
            project_name: "demo".into(),
            project_path: PathBuf::from("/tmp/demo"),
            session_name: default_session_name(),
            instances: HashMap::new(),
            channels: HashMap::new(),
            created_at: Utc::now(),
            last_active: Utc::now(),
            instance_order: Vec::new(),
        };
        assert_eq!(project.build_next_instance_id("claude"), "claude");
        project.upsert_instance(sample_instance("claude", "claude", Some("c1")));
        assert_eq!(project.build_next_instance_id("claude"), "claude-2");
        project.upsert_instance(sample_instance("claude-2", "claude", Some("c2")));
        assert_eq!(project.build_next_instance_id("claude"), "claude-3");
    }

    #[test]
    fn removing_last_instance_empties_project() {
        let mut project = Project {
            project_name: "demo".into(),
            project_path: PathBuf::from("/tmp/demo"),
            session_name: default_session_name(),
            instances: HashMap::new(),
            channels: HashMap::new(),
            created_at: Utc::now(),
            last_active: Utc::now(),
            instance_order: Vec::new(),
        };
        project.upsert_instance(sample_instance("claude", "claude", Some("c1")));
        assert!(project.remove_instance("claude"));
    }

    #[test]
    fn derived_channels_map_is_primary_instance_per_agent() {
        let mut project = Project {
            project_name: "multi".into(),
            project_path: PathBuf::from("/tmp/multi"),
            session_name: default_session_name(),
            instances: HashMap::new(),
            channels: HashMap::new(),
            created_at: Utc::now(),
            last_active: Utc::now(),
            instance_order: Vec::new(),
        };
        project.upsert_instance(sample_instance("claude", "claude", Some("ch-1")));
        project.upsert_instance(sample_instance("claude-2", "claude", Some("ch-2")));
        assert_eq!(project.channels.get("claude"), Some(&"ch-1".to_string()));
        assert_eq!(project.instance_by_channel("ch-2").unwrap().instance_id, "claude-2");
    }

    #[test]
    fn legacy_discord_channel_id_field_is_migrated_on_load() {
        let legacy = serde_json::json!({
            "guildId": "g1",
            "projects": {
                "demo": {
                    "projectName": "demo",
                    "projectPath": "/tmp/demo",
                    "instances": {
                        "claude": {
                            "instanceId": "claude",
                            "agentType": "claude",
                            "windowName": "claude",
                            "discordChannelId": "ch-legacy",
                            "eventHook": false
                        }
                    },
                    "createdAt": "2024-01-01T00:00:00Z",
                    "lastActive": "2024-01-01T00:00:00Z"
                }
            }
        });
        let mut state: BridgeState = serde_json::from_value(legacy).unwrap_or_else(|err| {
            panic!("legacy state must deserialize: {err}")
        });
        state.normalize();
        let project = &state.projects["demo"];
        assert_eq!(
            project.instances["claude"].channel_id.as_deref(),
            Some("ch-legacy")
        );
        assert_eq!(project.channels.get("claude"), Some(&"ch-legacy".to_string()));
    }

    #[test]
    fn round_trip_preserves_normalized_shape() {
        let mut project = Project {
            project_name: "demo".into(),
            project_path: PathBuf::from("/tmp/demo"),
            session_name: default_session_name(),
            instances: HashMap::new(),
            channels: HashMap::new(),
            created_at: Utc::now(),
            last_active: Utc::now(),
            instance_order: Vec::new(),
        };
        project.upsert_instance(sample_instance("claude", "claude", Some("ch-1")));

        let mut state = BridgeState::default();
        state.projects.insert("demo".to_string(), project);

        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &state, 0o600).unwrap_or_else(|err| panic!("write: {err}"));

        let mut reloaded = load_state(&path).unwrap_or_else(|err| panic!("load: {err}"));
        reloaded.normalize();
        state.normalize();
        assert_eq!(reloaded, state);
    }
}

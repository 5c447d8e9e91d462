//! Project service (C9): setting up and resuming project instances,
//! grounded in the teacher's `orchestrator::session_manager` pause/resume/
//! terminate shape, generalized to this spec's project/instance model.

use tracing::{info, warn};

use crate::agents::AgentAdapter;
use crate::config::Config;
use crate::messaging::MessagingCapability;
use crate::runtime::Runtime;
use crate::state::{Instance, Project, StateStore};
use crate::{AppError, Result};

/// Resolve which instance a hook/router event targets: explicit
/// `instance_id` first, else the project's primary instance for
/// `agent_type`.
#[must_use]
pub fn resolve_instance<'a>(project: &'a Project, instance_id: Option<&str>, agent_type: &str) -> Option<&'a Instance> {
    if let Some(instance_id) = instance_id {
        if let Some(instance) = project.instances.get(instance_id) {
            return Some(instance);
        }
    }
    project.primary_instance_for_agent(agent_type)
}

/// Create (or reuse) a project and provision a chat channel + instance
/// record for it (`SPEC_FULL.md` §4.8).
///
/// # Errors
///
/// Returns `AppError::Messaging` if the channel cannot be provisioned, or
/// a state-store error if persistence fails.
pub async fn setup_project_instance(
    state: &StateStore,
    messaging: &dyn MessagingCapability,
    project_name: &str,
    project_path: &std::path::Path,
    agent_name: &str,
    instance_id: &str,
    hook_port: u16,
) -> Result<Instance> {
    let mut project = state.get_project(project_name).await.unwrap_or_else(|| Project {
        project_name: project_name.to_string(),
        project_path: project_path.to_path_buf(),
        session_name: project_name.to_string(),
        instances: std::collections::HashMap::new(),
        channels: std::collections::HashMap::new(),
        created_at: chrono::Utc::now(),
        last_active: chrono::Utc::now(),
        instance_order: Vec::new(),
    });

    let channel_id = messaging
        .ensure_channel(project_name, agent_name, instance_id)
        .await?;

    let instance = Instance {
        instance_id: instance_id.to_string(),
        agent_type: agent_name.to_string(),
        window_name: instance_id.to_string(),
        channel_id: Some(channel_id),
        event_hook: false,
        container_mode: false,
        container_id: None,
        container_name: None,
    };
    project.upsert_instance(instance.clone());
    state.set_project(project).await?;

    best_effort_reload(hook_port).await;
    Ok(instance)
}

/// Ensure a project's session exists and its instance's window is
/// running, reinstalling the agent's hook and starting its process if
/// necessary (`SPEC_FULL.md` §4.8).
///
/// # Errors
///
/// Returns a `Runtime` error if the session/window cannot be created.
pub async fn resume_project_instance(
    config: &Config,
    runtime: &dyn Runtime,
    adapter: &dyn AgentAdapter,
    state: &StateStore,
    project: &Project,
    instance: &Instance,
    hook_port: u16,
) -> Result<()> {
    let session = runtime
        .get_or_create_session(&project.project_name, Some(&instance.window_name))
        .await?;

    runtime
        .set_session_env(&session, "AGENT_DISCORD_PROJECT", &project.project_name)
        .await?;
    runtime
        .set_session_env(&session, "AGENT_DISCORD_PORT", &hook_port.to_string())
        .await?;
    runtime
        .set_session_env(&session, "AGENT_DISCORD_AGENT", &instance.agent_type)
        .await?;
    runtime
        .set_session_env(&session, "AGENT_DISCORD_INSTANCE", &instance.instance_id)
        .await?;

    if runtime.window_exists(&session, &instance.window_name).await? {
        return Ok(());
    }

    let mut hook_installed = false;
    match adapter.install_hook(&project.project_path, hook_port) {
        Ok(installed) => hook_installed = installed,
        Err(err) => warn!(%err, agent = %instance.agent_type, "hook install failed, continuing without it"),
    }

    let permission_allow = matches!(config.opencode_permission_mode, crate::config::OpencodePermissionMode::Allow);
    let command = if let (true, Some(container_id)) = (instance.container_mode, &instance.container_id) {
        format!("docker start -ai {container_id}")
    } else {
        let base = adapter.start_command(&project.project_path, permission_allow);
        format!("export AGENT_DISCORD_PROJECT='{}'; {base}", project.project_name)
    };

    runtime
        .start_agent_in_window(&session, &instance.window_name, &command)
        .await?;

    if hook_installed {
        let mut updated_instance = instance.clone();
        updated_instance.event_hook = true;
        let mut updated_project = project.clone();
        updated_project.upsert_instance(updated_instance);
        state.set_project(updated_project).await?;
    }

    Ok(())
}

/// Remove an instance from its project's state, deleting the project too
/// if it was the last instance.
///
/// # Errors
///
/// Returns a state-store error if persistence fails.
pub async fn remove_instance_from_project_state(state: &StateStore, project_name: &str, instance_id: &str) -> Result<()> {
    let Some(mut project) = state.get_project(project_name).await else {
        return Err(AppError::UnknownReference(format!("project {project_name} not found")));
    };
    let now_empty = project.remove_instance(instance_id);
    if now_empty {
        state.remove_project(project_name).await?;
    } else {
        state.set_project(project).await?;
    }
    Ok(())
}

async fn best_effort_reload(hook_port: u16) {
    let url = format!("http://127.0.0.1:{hook_port}/reload");
    let client = reqwest::Client::new();
    if let Err(err) = client
        .post(&url)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
    {
        info!(%err, "best-effort /reload call failed (daemon may not be running yet)");
    }
}

//! Bootstrap (C12): the daemon-start sequence described in `SPEC_FULL.md`
//! §4.9, grounded in the teacher's `main.rs` `run()` startup order (wire
//! components, then bring up each server task under one shutdown token).

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::AgentRegistry;
use crate::daemon::Daemon;
use crate::hooks::{self, HookState};
use crate::stream;
use crate::Result;

const DISCODE_SEND_SCRIPT: &str = include_str!("bootstrap/discode-send.js.tmpl");

/// Handles for every background server task started by [`run`], so a
/// caller can join or abort them together during shutdown.
pub struct BootstrapHandles {
    /// Hook HTTP server task.
    pub hooks: JoinHandle<Result<()>>,
    /// Stream server task.
    pub stream: JoinHandle<()>,
}

/// Run the full bootstrap sequence: best-effort hook (re)install for every
/// known instance, write the per-project `discode-send` helper, register
/// the channel map, and start the hook (C5) and stream (C8) servers.
///
/// # Errors
///
/// Returns an error if the stream server's listener cannot be created. The
/// hook (re)install and helper-script steps are best-effort and only log
/// warnings on failure.
pub async fn run(daemon: &Daemon, stream_socket_name: String, cancel: CancellationToken) -> Result<BootstrapHandles> {
    let agents = AgentRegistry::new();

    // Step 1: best-effort hook (re)install for every known instance.
    for project in daemon.state.list_projects().await {
        for instance in project.instances.values() {
            let adapter = agents.get(&instance.agent_type);
            match adapter.install_hook(&project.project_path, daemon.config.hook_server_port) {
                Ok(true) => info!(project = %project.project_name, instance = %instance.instance_id, "hook (re)installed"),
                Ok(false) => {}
                Err(err) => warn!(%err, project = %project.project_name, instance = %instance.instance_id, "hook install failed"),
            }

            // Step 2: per-project discode-send helper, baked-in (projectName, port).
            if let Err(err) = install_discode_send(&project.project_path, &project.project_name, daemon.config.hook_server_port) {
                warn!(%err, project = %project.project_name, "failed to install discode-send helper");
            }
        }
    }

    // Step 3: channel map, already built and handed to messaging once in
    // `Daemon::build`; re-apply here too so a restart picks up any state
    // file edits made while the daemon was down.
    daemon.router.reregister_channel_map().await?;

    // Step 4: start C5 hook server and C8 stream server. C3 runtime and
    // C6 router are already live inside `daemon`.
    let hook_state = HookState {
        state: Arc::clone(&daemon.state),
        router: Arc::clone(&daemon.router),
    };
    let hook_port = daemon.config.hook_server_port;
    let hooks_cancel = cancel.clone();
    let hooks_task = tokio::spawn(async move { hooks::serve(hook_state, hook_port, hooks_cancel).await });

    let stream_task = stream::spawn(
        Arc::clone(&daemon.runtime),
        Arc::clone(&daemon.router),
        stream_socket_name,
        cancel,
    )?;

    info!("bootstrap complete");

    Ok(BootstrapHandles {
        hooks: hooks_task,
        stream: stream_task,
    })
}

/// Write `<project_path>/.discode/bin/discode-send` (and its
/// `package.json`), a small Node helper agents can shell out to for
/// posting events back to this daemon's hook server without needing to
/// know the port or project name themselves.
fn install_discode_send(project_path: &std::path::Path, project_name: &str, port: u16) -> Result<()> {
    let bin_dir = project_path.join(".discode").join("bin");
    std::fs::create_dir_all(&bin_dir)?;

    let script = DISCODE_SEND_SCRIPT
        .replace("__PROJECT_NAME__", &json_escape(project_name))
        .replace("__PORT__", &port.to_string());
    write_executable(&bin_dir.join("discode-send"), &script)?;

    write_executable(&bin_dir.join("package.json"), "{\"type\":\"commonjs\"}\n")?;
    Ok(())
}

fn json_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn write_executable(path: &std::path::Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    {
        let _ = &path;
    }

    Ok(())
}

//! Daemon supervisor (C10): port-ownership probing, PID-file lifecycle,
//! and detached-process start/stop, grounded in the teacher's
//! `shutdown_with_timeout`/signal-handling shape in `main.rs`, generalized
//! from "shut this process down" to "manage a detached sibling process".

use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::{AppError, Result};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Whether a daemon already owns `port` (a bound TCP listener answers).
#[must_use]
pub fn is_daemon_running(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

/// Path to the daemon's PID file, `<home_dir>/daemon.pid`.
#[must_use]
pub fn pid_file_path(home_dir: &Path) -> PathBuf {
    home_dir.join("daemon.pid")
}

/// Read the PID recorded in the PID file, if any.
#[must_use]
pub fn read_pid(home_dir: &Path) -> Option<i32> {
    let text = std::fs::read_to_string(pid_file_path(home_dir)).ok()?;
    text.trim().parse().ok()
}

/// Spawn `entrypoint` as a detached background process, write its PID file,
/// and wait (polling) for `port` to start answering.
///
/// # Errors
///
/// Returns `AppError::Supervisor` if the process cannot be spawned, the PID
/// file cannot be written, or `port` never opens within the readiness
/// window.
pub fn start_daemon(entrypoint: &Path, args: &[String], home_dir: &Path, port: u16, log_path: &Path) -> Result<()> {
    std::fs::create_dir_all(home_dir)?;

    if is_daemon_running(port) {
        info!(port, "daemon already running");
        return Ok(());
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let log_file_err = log_file.try_clone()?;

    let mut command = std::process::Command::new(entrypoint);
    command
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log_file))
        .stderr(std::process::Stdio::from(log_file_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session/process group so `stop_daemon` can signal every
        // child it spawned by sending to the negative PID.
        command.process_group(0);
    }

    let child = command
        .spawn()
        .map_err(|err| AppError::Supervisor(format!("failed to spawn daemon: {err}")))?;

    let pid = child.id();
    std::fs::write(pid_file_path(home_dir), pid.to_string())?;
    drop(child);

    let deadline = Instant::now() + READY_TIMEOUT;
    while Instant::now() < deadline {
        if is_daemon_running(port) {
            info!(pid, port, "daemon started and ready");
            return Ok(());
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }

    let _ = std::fs::remove_file(pid_file_path(home_dir));
    Err(AppError::Supervisor(format!(
        "daemon (pid {pid}) did not open port {port} within {}s",
        READY_TIMEOUT.as_secs()
    )))
}

/// Send `SIGTERM` to the daemon's process group and remove the PID file
/// (removed even if the signal send fails, so a stale file never blocks a
/// subsequent start).
///
/// # Errors
///
/// Returns `AppError::Supervisor` if no PID file is present.
#[cfg(unix)]
pub fn stop_daemon(home_dir: &Path) -> Result<()> {
    let Some(pid) = read_pid(home_dir) else {
        return Err(AppError::Supervisor("no daemon PID file found".into()));
    };

    let result = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(-pid),
        nix::sys::signal::Signal::SIGTERM,
    );

    if let Err(err) = std::fs::remove_file(pid_file_path(home_dir)) {
        warn!(%err, "failed to remove pid file after stop");
    }

    result.map_err(|err| AppError::Supervisor(format!("failed to signal daemon (pid {pid}): {err}")))
}

/// Non-Unix stub: process-group signaling is POSIX-only.
#[cfg(not(unix))]
pub fn stop_daemon(_home_dir: &Path) -> Result<()> {
    Err(AppError::Supervisor("stop_daemon is only supported on unix".into()))
}

/// Stop the daemon if running, then start it again.
///
/// # Errors
///
/// Propagates errors from [`stop_daemon`] (ignored if no daemon was
/// running) and [`start_daemon`].
pub fn restart_daemon_if_running(entrypoint: &Path, args: &[String], home_dir: &Path, port: u16, log_path: &Path) -> Result<()> {
    if is_daemon_running(port) {
        if let Err(err) = stop_daemon(home_dir) {
            warn!(%err, "stop_daemon failed during restart");
        }
        let deadline = Instant::now() + READY_TIMEOUT;
        while is_daemon_running(port) && Instant::now() < deadline {
            std::thread::sleep(READY_POLL_INTERVAL);
        }
    }
    start_daemon(entrypoint, args, home_dir, port, log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_path_is_under_home_dir() {
        let path = pid_file_path(Path::new("/tmp/discode-home"));
        assert_eq!(path, PathBuf::from("/tmp/discode-home/daemon.pid"));
    }

    #[test]
    fn read_pid_returns_none_when_file_missing() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        assert_eq!(read_pid(dir.path()), None);
    }

    #[test]
    fn read_pid_parses_written_value() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        std::fs::write(pid_file_path(dir.path()), "4242").unwrap_or_else(|err| panic!("write: {err}"));
        assert_eq!(read_pid(dir.path()), Some(4242));
    }

    #[test]
    fn port_probe_reports_false_when_nothing_listens() {
        // High, unlikely-to-be-bound port.
        assert!(!is_daemon_running(59_999));
    }
}

//! Scenario S6: restarting an already-running daemon stops the old
//! process, starts a new one under a different pid, and leaves the port
//! answering again within the readiness window.
//!
//! Uses a tiny Python listener script as the "daemon" entrypoint, since the
//! supervisor only cares about pid-file lifecycle and port ownership, not
//! which binary opens the port. Unix-only: `restart_daemon_if_running`
//! relies on POSIX process-group signaling.

#![cfg(unix)]

use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;

use discode::supervisor;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|err| panic!("bind: {err}"));
    listener.local_addr().unwrap_or_else(|err| panic!("local_addr: {err}")).port()
}

fn write_listener_script(dir: &std::path::Path, port: u16) -> std::path::PathBuf {
    let script = dir.join("listener.py");
    let body = format!(
        "#!/usr/bin/env python3\n\
         import socket, time\n\
         s = socket.socket(socket.AF_INET, socket.SOCK_STREAM)\n\
         s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
         s.bind((\"127.0.0.1\", {port}))\n\
         s.listen(1)\n\
         time.sleep(60)\n"
    );
    std::fs::write(&script, body).unwrap_or_else(|err| panic!("write script: {err}"));
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap_or_else(|err| panic!("chmod: {err}"));
    script
}

#[test]
fn restart_swaps_pid_and_keeps_the_port_answering() {
    let home_dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let port = free_port();
    let script = write_listener_script(home_dir.path(), port);
    let log_path = home_dir.path().join("daemon.log");

    supervisor::start_daemon(&script, &[], home_dir.path(), port, &log_path).unwrap_or_else(|err| panic!("start_daemon: {err}"));
    let pid_before = supervisor::read_pid(home_dir.path()).unwrap_or_else(|| panic!("no pid file after start"));
    assert!(supervisor::is_daemon_running(port));

    supervisor::restart_daemon_if_running(&script, &[], home_dir.path(), port, &log_path)
        .unwrap_or_else(|err| panic!("restart_daemon_if_running: {err}"));
    let pid_after = supervisor::read_pid(home_dir.path()).unwrap_or_else(|| panic!("no pid file after restart"));

    assert_ne!(pid_before, pid_after);
    assert!(supervisor::is_daemon_running(port));

    let _ = supervisor::stop_daemon(home_dir.path());
}

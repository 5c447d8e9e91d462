#![forbid(unsafe_code)]

//! `discode-ctl` — local CLI companion for the `discode` bridge daemon.
//!
//! Two surfaces: `daemon` subcommands wrap the supervisor (start/stop/
//! restart/status), and `stream` subcommands speak the stream server's
//! line-delimited JSON protocol directly over its local socket, for
//! scripting or debugging without a full UI client.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::Engine;
use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

use discode::config::default_home_dir;
use discode::stream::default_socket_name;
use discode::stream::protocol::ClientMessage;
use discode::supervisor;

#[derive(Debug, Parser)]
#[command(name = "discode-ctl", about = "Local CLI for the discode bridge daemon", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Control the background daemon process.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Talk to the stream server's local socket.
    Stream {
        /// Stream socket name.
        #[arg(long, default_value_t = default_socket_name())]
        socket: String,

        #[command(subcommand)]
        action: StreamAction,
    },
}

#[derive(Debug, Subcommand)]
enum DaemonAction {
    /// Start the daemon if it is not already running.
    Start {
        /// Path to the `discode` binary to launch.
        #[arg(long)]
        entrypoint: Option<PathBuf>,
        /// Home directory (`~/.discode` by default).
        #[arg(long)]
        home: Option<PathBuf>,
        /// Hook server port to wait for.
        #[arg(long, default_value_t = 18470)]
        port: u16,
    },
    /// Send SIGTERM to a running daemon.
    Stop {
        /// Home directory (`~/.discode` by default).
        #[arg(long)]
        home: Option<PathBuf>,
    },
    /// Stop then start the daemon.
    Restart {
        /// Path to the `discode` binary to launch.
        #[arg(long)]
        entrypoint: Option<PathBuf>,
        /// Home directory (`~/.discode` by default).
        #[arg(long)]
        home: Option<PathBuf>,
        /// Hook server port to wait for.
        #[arg(long, default_value_t = 18470)]
        port: u16,
    },
    /// Report whether the daemon is running.
    Status {
        /// Home directory (`~/.discode` by default).
        #[arg(long)]
        home: Option<PathBuf>,
        /// Hook server port to probe.
        #[arg(long, default_value_t = 18470)]
        port: u16,
    },
}

#[derive(Debug, Subcommand)]
enum StreamAction {
    /// Send a bare hello and print the server's ack.
    Hello,
    /// Subscribe to a window and print frames/patches until interrupted.
    Subscribe {
        /// Wire window id, `"<session>:<window>"`.
        window_id: String,
        /// Column count.
        #[arg(long, default_value_t = 80)]
        cols: u16,
        /// Row count.
        #[arg(long, default_value_t = 24)]
        rows: u16,
    },
    /// Mark a window as focused.
    Focus {
        /// Wire window id.
        window_id: String,
    },
    /// Send literal text as input to a window (base64-encoded on the wire).
    Input {
        /// Wire window id.
        window_id: String,
        /// Text to send.
        text: String,
    },
    /// Resize a subscribed window.
    Resize {
        /// Wire window id.
        window_id: String,
        /// New column count.
        cols: u16,
        /// New row count.
        rows: u16,
    },
}

fn main() {
    let args = Cli::parse();

    match args.command {
        Command::Daemon { action } => run_daemon_action(action),
        Command::Stream { socket, action } => run_stream_action(&socket, action),
    }
}

fn run_daemon_action(action: DaemonAction) {
    let result = match action {
        DaemonAction::Start { entrypoint, home, port } => {
            let home_dir = resolve_home(home);
            let entrypoint = resolve_entrypoint(entrypoint);
            let log_path = home_dir.join("daemon.log");
            supervisor::start_daemon(&entrypoint, &[], &home_dir, port, &log_path)
        }
        DaemonAction::Stop { home } => supervisor::stop_daemon(&resolve_home(home)),
        DaemonAction::Restart { entrypoint, home, port } => {
            let home_dir = resolve_home(home);
            let entrypoint = resolve_entrypoint(entrypoint);
            let log_path = home_dir.join("daemon.log");
            supervisor::restart_daemon_if_running(&entrypoint, &[], &home_dir, port, &log_path)
        }
        DaemonAction::Status { home, port } => {
            let home_dir = resolve_home(home);
            let running = supervisor::is_daemon_running(port);
            let pid = supervisor::read_pid(&home_dir);
            match (running, pid) {
                (true, Some(pid)) => println!("running (pid {pid}, port {port})"),
                (true, None) => println!("running (port {port}, no pid file)"),
                (false, _) => println!("not running (port {port})"),
            }
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn resolve_home(home: Option<PathBuf>) -> PathBuf {
    home.or_else(|| default_home_dir().ok())
        .unwrap_or_else(|| PathBuf::from(".discode"))
}

fn resolve_entrypoint(entrypoint: Option<PathBuf>) -> PathBuf {
    entrypoint
        .or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|path| path.parent().map(|dir| dir.join("discode")))
        })
        .unwrap_or_else(|| PathBuf::from("discode"))
}

fn run_stream_action(socket: &str, action: StreamAction) {
    let message = match action {
        StreamAction::Hello => ClientMessage::Hello,
        StreamAction::Subscribe { window_id, cols, rows } => ClientMessage::Subscribe { window_id, cols, rows },
        StreamAction::Focus { window_id } => ClientMessage::Focus { window_id },
        StreamAction::Input { window_id, text } => ClientMessage::Input {
            window_id,
            bytes_base64: base64::engine::general_purpose::STANDARD.encode(text.as_bytes()),
        },
        StreamAction::Resize { window_id, cols, rows } => ClientMessage::Resize { window_id, cols, rows },
    };

    if let Err(err) = send_and_print(socket, &message) {
        eprintln!("Failed to talk to stream server: {err}");
        eprintln!("Is discode running with socket '{socket}'?");
        std::process::exit(1);
    }
}

/// Connect to the stream socket, send one message, then print every
/// response line that arrives. `subscribe` keeps receiving frames/patches
/// until the connection closes or the process is interrupted; other
/// commands print a single ack and return.
fn send_and_print(socket_name: &str, message: &ClientMessage) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let name = socket_name.to_owned().to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut buf = String::new();
    loop {
        buf.clear();
        let bytes_read = reader.read_line(&mut buf)?;
        if bytes_read == 0 {
            break;
        }
        print!("{buf}");
        std::io::stdout().flush()?;
    }
    Ok(())
}

//! hsse-guard - session idle timeout and realtime notification daemon
//!
//! Hosts one session guard. Input sources talk to it over a Unix socket;
//! the terminal action logs and optionally runs a sign-out command.

use clap::Parser;
use hsse_guard::config::{self, Config};
use hsse_guard::guard::{GuardActions, SessionGuard};
use hsse_guard::ipc::{self, ClientMessage};
use hsse_guard::listener::InputBus;
use hsse_guard::realtime::Alert;
use hsse_guard::server::{self, ServerState};
use hsse_guard::transport::ChannelHub;
use hsse_guard::watcher::ConfigWatcher;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "hsse-guard", about = "Session idle-timeout and realtime notification guard")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the daemon (default)
    Run,
    /// Forward newline-delimited JSON messages from stdin to the daemon
    Emit,
    /// Print the daemon's current status as JSON
    Status,
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("HSSE_GUARD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.or_else(config::default_config_path);
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config_path),
        Command::Emit => emit(),
        Command::Status => status(),
        Command::InitConfig { force } => init_config(config_path, force),
    }
}

fn run(config_path: Option<PathBuf>) -> ExitCode {
    let config = config_path
        .as_deref()
        .map(config::load_config_from)
        .unwrap_or_default();
    if let Err(e) = config.idle.validate() {
        error!(error = %e, "idle config rejected, idle timeout will stay inactive");
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to create tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    rt.block_on(async move {
        let mut guard = SessionGuard::new(
            config.idle,
            config.realtime.clone(),
            guard_actions(&config),
        );

        let input = InputBus::new();
        guard.attach_activity(&input);

        let hub = ChannelHub::new();
        for channel in &config.channels {
            guard.subscribe(&hub, &channel.key, &channel.entity_filter());
        }

        let guard = Arc::new(Mutex::new(guard));
        let _watcher = config_path.and_then(|path| ConfigWatcher::spawn(path, Arc::clone(&guard)));

        let state = ServerState { guard, input, hub };
        server::start(&ipc::socket_path(), state).await;
    });
    // Only reached when the socket could not be bound.
    ExitCode::FAILURE
}

fn guard_actions(config: &Config) -> GuardActions {
    let sign_out = config.sign_out_command.clone();
    GuardActions::new(move || sign_out_now(sign_out.as_deref()), announce)
        .with_invalidate(|entity_kind| debug!(%entity_kind, "cached queries invalidated"))
}

fn sign_out_now(command: Option<&str>) {
    warn!("session idle, signing out");
    let Some(command) = command else {
        return;
    };
    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!(%command, error = %e, "failed to run sign-out command");
            return;
        }
    };
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => info!("sign-out command finished"),
            Ok(status) => warn!(%status, "sign-out command failed"),
            Err(e) => warn!(error = %e, "failed to wait for sign-out command"),
        }
    });
}

fn announce(alert: &Alert) {
    warn!(
        channel = %alert.channel,
        severity = %alert.severity,
        drill_down = alert.drill_down().as_deref().unwrap_or("-"),
        "{}",
        alert.title
    );
    if alert.play_sound {
        eprint!("\x07");
    }
}

fn emit() -> ExitCode {
    let mut messages = Vec::new();
    for (n, line) in std::io::stdin().lock().lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("failed to read stdin: {e}");
                return ExitCode::FAILURE;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ClientMessage>(&line) {
            Ok(msg) => messages.push(msg),
            Err(e) => {
                eprintln!("line {}: {e}", n + 1);
                return ExitCode::FAILURE;
            }
        }
    }

    match ipc::send(&ipc::socket_path(), &messages) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn status() -> ExitCode {
    let status = match ipc::query_status(&ipc::socket_path()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&status) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_config(path: Option<PathBuf>, force: bool) -> ExitCode {
    let Some(path) = path else {
        eprintln!("no config directory on this platform, pass --config");
        return ExitCode::FAILURE;
    };
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        return ExitCode::FAILURE;
    }
    match config::save_config_to(&Config::default(), &path) {
        Ok(()) => {
            println!("wrote {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to write {}: {e}", path.display());
            ExitCode::FAILURE
        }
    }
}

//! procmux: runs the processes of a Procfile in tmux windows.
//!
//! This is the entry point of the application. `start` runs the supervisor;
//! `restart`, `connect` and `kill` talk to a running one over its control
//! socket; the hidden `launch` runs inside each window.

mod client;
mod command_center;
mod config;
mod error;
mod events;
mod launch;
mod mux;
mod output;
mod procfile;
mod process;
mod protocol;
mod registry;
mod supervisor;

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::client::Client;
use crate::config::{Config, StartOptions, StartSettings};
use crate::events::Interrupt;
use crate::mux::Tmux;
use crate::supervisor::{Supervisor, SupervisorConfig};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "procmux",
    version,
    about = "Runs the processes of a Procfile in tmux windows",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to a .procmux.toml configuration file.
    #[arg(long, global = true, env = "PROCMUX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SocketArg {
    /// Path of the control socket.
    #[arg(short, long, env = "PROCMUX_SOCKET")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the processes of the Procfile.
    #[command(visible_alias = "s")]
    Start(StartOptions),
    /// Restart the named processes.
    #[command(visible_alias = "r")]
    Restart {
        /// Process names, separated by spaces or commas.
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        socket: SocketArg,
    },
    /// Attach to the tmux window of a process.
    #[command(visible_alias = "c")]
    Connect {
        name: String,
        #[command(flatten)]
        socket: SocketArg,
    },
    /// Stop every process and the supervisor.
    #[command(visible_alias = "k")]
    Kill {
        #[command(flatten)]
        socket: SocketArg,
    },
    /// Run a command inside a window and report to the supervisor.
    #[command(hide = true)]
    Launch {
        #[arg(long)]
        socket: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn main() -> ExitCode {
    // Environment changes are only sound before the runtime spawns threads.
    config::load_env_files();
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("procmux: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("procmux: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PROCMUX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Start(options) => {
            let config = config::load_or_default(cli.config.as_deref())?;
            start(options, config).await
        }
        Commands::Restart { names, socket } => {
            let client = satellite(socket, cli.config)?;
            let names = names.iter().flat_map(|arg| config::split_names(arg)).collect();
            let report = client.restart(names).await?;
            for (name, outcome) in &report.entries {
                if let protocol::Outcome::Error(reason) = outcome {
                    eprintln!("procmux: failed to restart {name}: {reason}");
                }
            }
            Ok(i32::from(!report.all_ok()))
        }
        Commands::Connect { name, socket } => {
            let client = satellite(socket, cli.config)?;
            let window = client.connect(&name).await?;
            let status = Tmux::detect()?
                .attach(&window)
                .await
                .context("failed to run tmux")?;
            Ok(status.code().unwrap_or(1))
        }
        Commands::Kill { socket } => {
            satellite(socket, cli.config)?.kill().await?;
            Ok(0)
        }
        Commands::Launch {
            socket,
            name,
            port,
            command,
        } => launch::launch(&socket, &name, port, &command.join(" ")).await,
    }
}

fn satellite(socket: SocketArg, config: Option<PathBuf>) -> Result<Client> {
    let config = if socket.socket.is_some() {
        Config::default()
    } else {
        config::load_or_default(config.as_deref())?
    };
    Ok(Client::new(config::resolve_socket(socket.socket, &config)?))
}

async fn start(options: StartOptions, config: Config) -> Result<i32> {
    let settings = StartSettings::resolve(options, config)?;
    let entries = procfile::load(&settings.procfile, settings.port, settings.port_step)?;
    let specs = procfile::to_specs(entries, &settings.root);
    let host = Tmux::detect()?;

    let supervisor = Supervisor::new(
        SupervisorConfig {
            title: settings.title.clone(),
            socket: settings.socket,
            timeout: settings.timeout,
            may_die: settings.can_die.into_iter().collect(),
            only: settings.processes,
        },
        specs,
        Arc::new(host),
    )?;

    set_terminal_title(&settings.title);
    let (tx, rx) = mpsc::channel(8);
    spawn_signal_listener(tx);
    supervisor.run(rx).await?;
    Ok(0)
}

fn set_terminal_title(title: &str) {
    let mut stdout = std::io::stdout();
    if stdout.is_terminal() {
        let _ = write!(stdout, "\u{1b}]0;{title} | procmux\u{7}");
        let _ = stdout.flush();
    }
}

fn spawn_signal_listener(tx: mpsc::Sender<Interrupt>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let signals = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        );
        let (mut sigint, mut sigterm, mut sighup) = match signals {
            (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
            _ => {
                warn!("failed to install signal handlers");
                return;
            }
        };
        loop {
            let interrupt = tokio::select! {
                Some(()) = sigint.recv() => Interrupt::SigInt,
                Some(()) = sigterm.recv() => Interrupt::SigTerm,
                Some(()) = sighup.recv() => Interrupt::SigHup,
                else => break,
            };
            if tx.send(interrupt).await.is_err() {
                break;
            }
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_launch_command_after_separator() {
        let cli = Cli::try_parse_from([
            "procmux", "launch", "--socket", "/tmp/p.sock", "--name", "web", "--port", "5000",
            "--", "rails s -p $PORT",
        ])
        .unwrap();
        match cli.command {
            Commands::Launch {
                socket,
                name,
                port,
                command,
            } => {
                assert_eq!(socket, PathBuf::from("/tmp/p.sock"));
                assert_eq!(name, "web");
                assert_eq!(port, Some(5000));
                assert_eq!(command, ["rails s -p $PORT"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn satellite_aliases() {
        let cli = Cli::try_parse_from(["procmux", "r", "web,worker", "clock", "-s", "/tmp/p.sock"])
            .unwrap();
        match cli.command {
            Commands::Restart { names, socket } => {
                assert_eq!(names, ["web,worker", "clock"]);
                assert_eq!(socket.socket, Some(PathBuf::from("/tmp/p.sock")));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(matches!(
            Cli::try_parse_from(["procmux", "k"]).unwrap().command,
            Commands::Kill { .. }
        ));
        assert!(Cli::try_parse_from(["procmux", "restart"]).is_err());
    }

    #[test]
    fn start_flags() {
        let cli = Cli::try_parse_from([
            "procmux", "s", "-f", "Procfile.dev", "-l", "web,worker", "-c", "migrate", "-t", "3",
            "-P", "10",
        ])
        .unwrap();
        let Commands::Start(options) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(options.procfile, Some(PathBuf::from("Procfile.dev")));
        assert_eq!(options.processes.as_deref(), Some("web,worker"));
        assert_eq!(options.can_die.as_deref(), Some("migrate"));
        assert_eq!(options.timeout, Some(3));
        assert_eq!(options.port_step, Some(10));
    }
}

//! The terminal multiplexer that hosts every process window.
//!
//! The supervisor only talks to the [`Multiplexer`] trait. [`Tmux`] is the real
//! host: each window runs `procmux launch …`, which performs the handshake with
//! the command center before it executes the configured command.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::process::Command;
use tracing::debug;

use crate::error::SpawnError;

const SESSION_PREFIX: &str = "procmux";
const SESSION_SUFFIX_LEN: usize = 12;

/// `pane_pid` identifies the window's process, the target is what `connect` attaches to.
const WINDOW_FORMAT: &str = "#{pane_pid} #{session_name}:#{window_id}";

/// Name of the shared tmux session of one supervisor run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Builds `procmux-<title>-<random>`; the title is reduced to characters
    /// tmux accepts in session names.
    pub fn generate(title: &str) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_SUFFIX_LEN)
            .map(char::from)
            .collect();
        Self(format!("{SESSION_PREFIX}-{}-{suffix}", escape_title(title)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_title(title: &str) -> String {
    let escaped: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if escaped.is_empty() {
        "app".to_string()
    } else {
        escaped
    }
}

/// Everything needed to open one process window.
#[derive(Debug, Clone, Copy)]
pub struct WindowRequest<'a> {
    pub session: &'a SessionId,
    pub name: &'a str,
    pub cwd: &'a Path,
    pub command: &'a str,
    pub port: Option<u16>,
    /// Absolute path of the command center socket the launcher connects back to.
    pub control: &'a Path,
    /// Create the session instead of adding a window to it.
    pub new_session: bool,
}

/// A window that was opened successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Pid of the process running in the window.
    pub pid: u32,
    /// Target usable with `tmux attach-session -t`.
    pub id: String,
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn open_window(&self, request: WindowRequest<'_>) -> Result<Window, SpawnError>;

    async fn session_exists(&self, session: &SessionId) -> bool;

    /// Destroys the session. Succeeds when it is already gone.
    async fn kill_session(&self, session: &SessionId) -> io::Result<()>;
}

/// tmux, driven through its command line.
#[derive(Debug, Clone)]
pub struct Tmux {
    binary: PathBuf,
    launcher: PathBuf,
}

impl Tmux {
    /// Locates tmux on `PATH`; windows will re-enter the current executable.
    pub fn detect() -> Result<Self, SpawnError> {
        let binary = which::which("tmux").map_err(|_| SpawnError::MultiplexerMissing)?;
        let launcher = std::env::current_exe()?;
        Ok(Self { binary, launcher })
    }

    fn launch_command(&self, request: &WindowRequest<'_>) -> String {
        let mut argv = vec![
            self.launcher.display().to_string(),
            "launch".to_string(),
            "--socket".to_string(),
            request.control.display().to_string(),
            "--name".to_string(),
            request.name.to_string(),
        ];
        if let Some(port) = request.port {
            argv.push("--port".to_string());
            argv.push(port.to_string());
        }
        argv.push("--".to_string());
        argv.push(request.command.to_string());
        shell_words::join(argv)
    }

    /// Attaches the current terminal to a window, switching clients when
    /// already inside tmux.
    pub async fn attach(&self, window: &str) -> io::Result<ExitStatus> {
        match Command::new(&self.binary)
            .args(["select-window", "-t", window])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => debug!(window, %status, "select-window reported failure"),
            Err(err) => debug!(window, %err, "failed to run select-window"),
        }
        let verb = if std::env::var_os("TMUX").is_some() {
            "switch-client"
        } else {
            "attach-session"
        };
        Command::new(&self.binary)
            .args([verb, "-t", window])
            .status()
            .await
    }
}

#[async_trait]
impl Multiplexer for Tmux {
    async fn open_window(&self, request: WindowRequest<'_>) -> Result<Window, SpawnError> {
        let session = request.session.as_str();
        let target = format!("{session}:");
        let mut command = Command::new(&self.binary);
        if request.new_session {
            command.args(["new-session", "-d", "-s", session]);
        } else {
            command.args(["new-window", "-d", "-t", target.as_str()]);
        }
        command
            .args(["-n", request.name])
            .arg("-c")
            .arg(request.cwd)
            .args(["-P", "-F", WINDOW_FORMAT])
            .arg(self.launch_command(&request));

        let output = command.output().await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => SpawnError::MultiplexerMissing,
            _ => SpawnError::Io(err),
        })?;
        if !output.status.success() {
            return Err(SpawnError::WindowRefused {
                name: request.name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let window = stdout
            .lines()
            .next()
            .and_then(parse_window)
            .ok_or_else(|| SpawnError::WindowRefused {
                name: request.name.to_string(),
                reason: format!("unexpected tmux output {:?}", stdout.trim()),
            })?;
        debug!(process = request.name, pid = window.pid, window = %window.id, "window opened");
        Ok(window)
    }

    async fn session_exists(&self, session: &SessionId) -> bool {
        Command::new(&self.binary)
            .args(["has-session", "-t", session.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn kill_session(&self, session: &SessionId) -> io::Result<()> {
        let output = Command::new(&self.binary)
            .args(["kill-session", "-t", session.as_str()])
            .output()
            .await?;
        if !output.status.success() {
            debug!(
                session = %session,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "kill-session reported failure, session already gone"
            );
        }
        Ok(())
    }
}

fn parse_window(line: &str) -> Option<Window> {
    let (pid, id) = line.trim().split_once(' ')?;
    let pid = pid.parse().ok()?;
    if id.is_empty() {
        return None;
    }
    Some(Window {
        pid,
        id: id.to_string(),
    })
}

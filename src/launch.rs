//! The launcher that runs inside every tmux window.
//!
//! A launcher announces itself to the supervisor with `hello <name>` and only
//! runs the command after `go`. While the command runs it relays `started` and
//! `exited` notices upstream and turns a pushed `kill` into SIGINT for the
//! command. It exits with the command's status.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

use crate::process::ExitOutcome;
use crate::protocol::{read_line, write_line, ChildEvent, HandshakeReply, Instruction, Request};

/// Connected, `hello` sent, waiting for the supervisor's verdict.
pub struct AwaitingGo {
    name: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl AwaitingGo {
    pub async fn connect(socket: &Path, name: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("can't connect to {}", socket.display()))?;
        let (read, mut writer) = stream.into_split();
        write_line(
            &mut writer,
            Request::Hello {
                name: name.to_string(),
            },
        )
        .await?;
        Ok(Self {
            name: name.to_string(),
            reader: BufReader::new(read),
            writer,
        })
    }

    /// Reads the handshake reply; anything but `go` ends the launch.
    pub async fn handshake(mut self) -> Result<Executing> {
        let line = read_line(&mut self.reader).await?;
        match line.parse::<HandshakeReply>()? {
            HandshakeReply::Go => Ok(Executing {
                name: self.name,
                lines: Some(self.reader.lines()),
                writer: self.writer,
            }),
            HandshakeReply::Refused(reason) => {
                bail!("supervisor refused {}: {reason}", self.name)
            }
        }
    }
}

/// Handshake done; the command may run.
pub struct Executing {
    name: String,
    lines: Option<Lines<BufReader<OwnedReadHalf>>>,
    writer: OwnedWriteHalf,
}

impl Executing {
    /// Runs `command` to completion and returns the exit code to use.
    pub async fn run(mut self, command: &str, port: Option<u16>) -> Result<i32> {
        let mut child = spawn(command, port)?;
        let pid = child.id().ok_or_else(|| anyhow!("{} exited at spawn", self.name))?;
        self.report(ChildEvent::Started { pid }).await;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                instruction = next_instruction(&mut self.lines) => match instruction {
                    Some(Instruction::Kill) => interrupt(&child),
                    None => {
                        debug!(process = %self.name, "supervisor link closed");
                        self.lines = None;
                    }
                },
            }
        };

        let outcome = outcome(status);
        self.report(ChildEvent::Exited(outcome.clone())).await;
        Ok(exit_code(&outcome))
    }

    async fn report(&mut self, event: ChildEvent) {
        if self.lines.is_none() {
            return;
        }
        if let Err(err) = write_line(&mut self.writer, &event).await {
            debug!(process = %self.name, %err, "failed to report {event}");
        }
    }
}

async fn next_instruction(lines: &mut Option<Lines<BufReader<OwnedReadHalf>>>) -> Option<Instruction> {
    let Some(lines) = lines else {
        return std::future::pending().await;
    };
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.parse() {
                Ok(instruction) => return Some(instruction),
                Err(err) => warn!(%err, "ignoring instruction"),
            },
            Ok(None) => return None,
            Err(err) => {
                debug!(%err, "supervisor link failed");
                return None;
            }
        }
    }
}

fn spawn(command: &str, port: Option<u16>) -> Result<Child> {
    let shell = std::env::var_os("SHELL")
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".into());
    let mut cmd = Command::new(&shell);
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(port) = port {
        cmd.env("PORT", port.to_string());
    }
    // Ignored dispositions survive exec; the command must be interruptible.
    unsafe {
        cmd.pre_exec(|| {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
            Ok(())
        });
    }
    cmd.spawn()
        .with_context(|| format!("failed to run {}", Path::new(&shell).display()))
}

fn interrupt(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    debug!(pid, "forwarding SIGINT");
    unsafe {
        let _ = libc::kill(pid, libc::SIGINT);
    }
}

fn outcome(status: ExitStatus) -> ExitOutcome {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitOutcome::Code(code),
        (None, Some(signal)) => ExitOutcome::Signal(signal),
        (None, None) => ExitOutcome::Unknown,
    }
}

fn exit_code(outcome: &ExitOutcome) -> i32 {
    match outcome {
        ExitOutcome::Code(code) => *code,
        ExitOutcome::Signal(signal) => 128 + signal,
        ExitOutcome::Unknown | ExitOutcome::SpawnFailed(_) => 1,
    }
}

/// Keeps Ctrl-C and SIGTERM from killing the launcher before its command.
/// The command shares the window's process group and gets them directly.
fn shield_signals() -> Result<()> {
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = int.recv() => debug!("launcher ignoring SIGINT"),
                Some(()) = term.recv() => debug!("launcher ignoring SIGTERM"),
                else => break,
            }
        }
    });
    Ok(())
}

/// Entry point of `procmux launch`.
pub async fn launch(socket: &Path, name: &str, port: Option<u16>, command: &str) -> Result<i32> {
    shield_signals()?;
    let executing = AwaitingGo::connect(socket, name).await?.handshake().await?;
    executing.run(command, port).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    use super::*;

    struct Server {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Server {
        async fn accept(listener: &UnixListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, writer) = stream.into_split();
            Self {
                reader: BufReader::new(read),
                writer,
            }
        }

        async fn expect(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), read_line(&mut self.reader))
                .await
                .unwrap()
                .unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }
    }

    fn listener() -> (tempfile::TempDir, std::path::PathBuf, UnixListener) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        (dir, path, listener)
    }

    #[tokio::test]
    async fn relays_lifecycle_and_exit_code() {
        let (_dir, path, listener) = listener();
        let launcher = tokio::spawn(async move {
            let executing = AwaitingGo::connect(&path, "web")
                .await?
                .handshake()
                .await?;
            executing.run("test \"$PORT\" = 5100 && exit 7", Some(5100)).await
        });

        let mut server = Server::accept(&listener).await;
        assert_eq!(server.expect().await, "hello web");
        server.send("go").await;
        assert!(server.expect().await.starts_with("started "));
        assert_eq!(server.expect().await, "exited 7");
        assert_eq!(launcher.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn kill_instruction_interrupts_command() {
        let (_dir, path, listener) = listener();
        let launcher = tokio::spawn(async move {
            let executing = AwaitingGo::connect(&path, "web")
                .await?
                .handshake()
                .await?;
            executing.run("exec sleep 30", None).await
        });

        let mut server = Server::accept(&listener).await;
        assert_eq!(server.expect().await, "hello web");
        server.send("go").await;
        assert!(server.expect().await.starts_with("started "));
        server.send("kill").await;
        assert_eq!(server.expect().await, "exited signal:2");
        assert_eq!(launcher.await.unwrap().unwrap(), 130);
    }

    #[tokio::test]
    async fn refusal_never_runs_command() {
        let (dir, path, listener) = listener();
        let marker = dir.path().join("ran");
        let command = format!("touch {}", marker.display());
        let launcher = tokio::spawn(async move {
            let executing = AwaitingGo::connect(&path, "ghost")
                .await?
                .handshake()
                .await?;
            executing.run(&command, None).await
        });

        let mut server = Server::accept(&listener).await;
        assert_eq!(server.expect().await, "hello ghost");
        server.send("error:not_found").await;
        let err = launcher.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("not_found"), "{err}");
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn command_outlives_lost_supervisor() {
        let (_dir, path, listener) = listener();
        let launcher = tokio::spawn(async move {
            let executing = AwaitingGo::connect(&path, "web")
                .await?
                .handshake()
                .await?;
            executing.run("sleep 0.3; exit 4", None).await
        });

        let mut server = Server::accept(&listener).await;
        server.expect().await;
        server.send("go").await;
        server.expect().await;
        drop(server);
        assert_eq!(launcher.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn missing_socket_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AwaitingGo::connect(&dir.path().join("nope.sock"), "web")
            .await
            .is_err());
    }
}

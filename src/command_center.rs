//! Control socket of a running supervisor.
//!
//! Launchers in the tmux windows and the `restart`, `connect` and `kill`
//! satellites all talk to the supervisor through one Unix socket. Each
//! connection is served by its own task; a broken or hostile connection only
//! ever loses itself.

use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{BindError, CommandError, ProtocolError};
use crate::process::{Process, ProcessStatus};
use crate::protocol::{
    read_line, write_line, ChildEvent, ConnectReply, HandshakeReply, Instruction, Outcome,
    Request, RestartReport,
};
use crate::supervisor::Fleet;

/// A connection must send its request within this time.
const FIRST_LINE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a `hello` may wait for its window to be registered.
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const LINK_CAPACITY: usize = 4;

struct Listening {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct CommandCenter {
    path: PathBuf,
    fleet: Arc<Fleet>,
    listening: Mutex<Option<Listening>>,
}

impl CommandCenter {
    pub fn new(path: PathBuf, fleet: Arc<Fleet>) -> Self {
        Self {
            path,
            fleet,
            listening: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn is_listening(&self) -> bool {
        self.listening.lock().is_some()
    }

    /// Binds the socket and starts accepting. Calling it again while
    /// listening does nothing.
    pub fn start(&self) -> Result<(), BindError> {
        let mut listening = self.listening.lock();
        if listening.is_some() {
            return Ok(());
        }

        let listener = bind(&self.path)?;
        let (shutdown, rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.fleet), rx));
        *listening = Some(Listening { shutdown, task });
        info!(path = %self.path.display(), "command center listening");
        Ok(())
    }

    /// Stops accepting, drops every open connection and removes the socket.
    pub async fn stop(&self) {
        let Some(listening) = self.listening.lock().take() else {
            return;
        };
        let _ = listening.shutdown.send(());
        if let Err(err) = listening.task.await {
            warn!(%err, "command center task failed");
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), %err, "failed to remove socket"),
        }
        debug!("command center stopped");
    }
}

/// Binds `path` with owner-only permissions, replacing a stale socket left
/// behind by a dead supervisor.
fn bind(path: &Path) -> Result<UnixListener, BindError> {
    let io_err = |source| BindError::Io {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_socket() {
                return Err(BindError::NotASocket(path.to_path_buf()));
            }
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(BindError::InUse(path.to_path_buf()));
            }
            std::fs::remove_file(path).map_err(io_err)?;
            debug!(path = %path.display(), "removed stale socket");
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(err)),
    }

    let listener = UnixListener::bind(path).map_err(io_err)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    Ok(listener)
}

async fn accept_loop(
    listener: UnixListener,
    fleet: Arc<Fleet>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve(stream, Arc::clone(&fleet)));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn serve(stream: UnixStream, fleet: Arc<Fleet>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let request = match tokio::time::timeout(FIRST_LINE_TIMEOUT, read_line(&mut reader)).await {
        Ok(Ok(line)) => line.parse::<Request>(),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(ProtocolError::TimedOut),
    };
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            debug!(%err, "dropping control connection");
            if matches!(err, ProtocolError::Malformed(_) | ProtocolError::TooLong(_)) {
                let _ = write_line(&mut write, Outcome::Error("malformed".into())).await;
            }
            return;
        }
    };

    debug!(%request, "control request");
    let result = match request {
        Request::Hello { name } => serve_launcher(&fleet, name, reader, write).await,
        Request::Restart { names } => {
            let report = restart(&fleet, &names).await;
            write_line(&mut write, report).await.map_err(Into::into)
        }
        Request::Connect { name } => write_line(&mut write, connect(&fleet, &name))
            .await
            .map_err(Into::into),
        Request::Kill => {
            fleet.begin_stopping();
            let replied = write_line(&mut write, Outcome::Ok).await;
            fleet.kill_requested();
            replied.map_err(Into::into)
        }
    };
    if let Err(err) = result {
        debug!(%err, "control connection ended");
    }
}

async fn restart(fleet: &Arc<Fleet>, names: &[String]) -> RestartReport {
    let mut report = RestartReport::default();
    for name in names {
        let outcome = match fleet.restart(name).await {
            Ok(()) => Outcome::Ok,
            Err(err) => {
                warn!(process = %name, %err, "restart failed");
                Outcome::Error(err.code().to_string())
            }
        };
        report.push(name.as_str(), outcome);
    }
    report
}

fn connect(fleet: &Fleet, name: &str) -> ConnectReply {
    let err = match fleet.registry().get(name) {
        None => CommandError::NotFound(name.to_string()),
        Some(process) => match process.window() {
            Some(window) => return ConnectReply::Window(window),
            None => CommandError::NotReady(name.to_string()),
        },
    };
    ConnectReply::Error(err.code().to_string())
}

/// Checks a `hello` against the registry and attaches the connection as the
/// process's instruction link.
async fn handshake(
    fleet: &Fleet,
    name: &str,
) -> Result<(Arc<Process>, mpsc::Receiver<Instruction>), CommandError> {
    let process = fleet
        .registry()
        .get(name)
        .ok_or_else(|| CommandError::NotFound(name.to_string()))?;

    let mut status = process.subscribe();
    let ready = tokio::time::timeout(
        READY_TIMEOUT,
        status.wait_for(|status| {
            !matches!(status, ProcessStatus::Pending | ProcessStatus::Starting)
        }),
    )
    .await;
    let running = match ready {
        Ok(Ok(status)) => *status == ProcessStatus::Running,
        _ => false,
    };
    if !running {
        return Err(CommandError::NotReady(name.to_string()));
    }

    let (tx, rx) = mpsc::channel(LINK_CAPACITY);
    if !process.attach_link(tx) {
        return Err(CommandError::AlreadyConnected(name.to_string()));
    }
    Ok((process, rx))
}

async fn serve_launcher(
    fleet: &Fleet,
    name: String,
    reader: BufReader<OwnedReadHalf>,
    mut write: OwnedWriteHalf,
) -> Result<(), ProtocolError> {
    let (process, mut instructions) = match handshake(fleet, &name).await {
        Ok(linked) => linked,
        Err(err) => {
            debug!(process = %name, %err, "launcher refused");
            write_line(&mut write, HandshakeReply::Refused(err.code().to_string())).await?;
            return Ok(());
        }
    };
    write_line(&mut write, HandshakeReply::Go).await?;
    debug!(process = %name, "launcher linked");

    let mut lines = reader.lines();
    let result = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.parse::<ChildEvent>() {
                    Ok(ChildEvent::Started { pid }) => {
                        debug!(process = %name, pid, "command started");
                        process.record_child(pid);
                    }
                    Ok(ChildEvent::Exited(outcome)) => {
                        debug!(process = %name, %outcome, "command exited");
                        process.record_exit(outcome);
                    }
                    Err(err) => break Err(err),
                },
                Ok(None) => break Ok(()),
                Err(err) => break Err(err.into()),
            },
            Some(instruction) = instructions.recv() => {
                if let Err(err) = write_line(&mut write, instruction).await {
                    break Err(err.into());
                }
            }
        }
    };
    process.detach_link();
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::events::Trigger;
    use crate::mux::testing::FakeHost;
    use crate::mux::{Multiplexer, SessionId};
    use crate::process::tests::spec;
    use crate::process::ExitOutcome;
    use crate::registry::Registry;

    struct Fixture {
        center: CommandCenter,
        fleet: Arc<Fleet>,
        triggers: mpsc::Receiver<Trigger>,
        _dir: tempfile::TempDir,
    }

    fn fixture(commands: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let host: Arc<dyn Multiplexer> = Arc::new(FakeHost::new());
        let session = SessionId::generate("test");
        let processes = commands
            .iter()
            .map(|(name, command)| {
                Process::new(spec(name, command), session.clone(), Arc::clone(&host))
            })
            .collect();
        let registry = Registry::new(processes).unwrap();
        let (tx, triggers) = mpsc::channel(8);
        let fleet = Arc::new(Fleet::new(
            registry,
            host,
            session,
            path.clone(),
            HashSet::new(),
            Duration::from_secs(2),
            tx,
        ));
        let center = CommandCenter::new(path, Arc::clone(&fleet));
        Fixture {
            center,
            fleet,
            triggers,
            _dir: dir,
        }
    }

    async fn exchange(path: &Path, line: &str) -> String {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let mut reader = BufReader::new(read);
        read_line(&mut reader).await.unwrap()
    }

    async fn launch(fixture: &Fixture, name: &str) -> Arc<Process> {
        let process = fixture.fleet.registry().get(name).unwrap();
        fixture
            .fleet
            .launch(Arc::clone(&process), true)
            .await
            .unwrap();
        process
    }

    #[tokio::test]
    async fn socket_is_owner_only_and_removed_on_stop() {
        let fixture = fixture(&[("web", "sleep 30")]);
        fixture.center.start().unwrap();
        fixture.center.start().unwrap();
        assert!(fixture.center.is_listening());

        let mode = std::fs::metadata(fixture.center.path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        fixture.center.stop().await;
        fixture.center.stop().await;
        assert!(!fixture.center.path().exists());
        assert!(!fixture.center.is_listening());
    }

    #[tokio::test]
    async fn refuses_live_socket_and_regular_file() {
        let fixture = fixture(&[("web", "true")]);
        fixture.center.start().unwrap();

        let other = CommandCenter::new(
            fixture.center.path().to_path_buf(),
            Arc::clone(&fixture.fleet),
        );
        assert!(matches!(other.start(), Err(BindError::InUse(_))));
        fixture.center.stop().await;

        std::fs::write(fixture.center.path(), b"not a socket").unwrap();
        assert!(matches!(
            fixture.center.start(),
            Err(BindError::NotASocket(_))
        ));
    }

    #[tokio::test]
    async fn replaces_stale_socket() {
        let fixture = fixture(&[("web", "true")]);
        drop(std::os::unix::net::UnixListener::bind(fixture.center.path()).unwrap());
        assert!(fixture.center.path().exists());

        fixture.center.start().unwrap();
        assert_eq!(
            exchange(fixture.center.path(), "connect ghost").await,
            "error:not_found"
        );
        fixture.center.stop().await;
    }

    #[tokio::test]
    async fn connect_reports_window() {
        let fixture = fixture(&[("web", "sleep 30"), ("worker", "sleep 30")]);
        fixture.center.start().unwrap();
        let path = fixture.center.path();

        assert_eq!(exchange(path, "connect worker").await, "error:not_ready");
        let web = launch(&fixture, "web").await;
        assert_eq!(exchange(path, "connect worker").await, "error:not_ready");
        let reply = exchange(path, "connect web").await;
        assert_eq!(reply, format!("window:{}", web.window().unwrap()));
        assert_eq!(exchange(path, "connect ghost").await, "error:not_found");

        fixture.fleet.begin_stopping();
        fixture.center.stop().await;
    }

    #[tokio::test]
    async fn restart_reports_each_name() {
        let fixture = fixture(&[("web", "sleep 30")]);
        fixture.center.start().unwrap();
        let old = fixture.fleet.registry().get("web").unwrap();
        assert_eq!(
            exchange(fixture.center.path(), "restart web").await,
            "web:error:not_ready"
        );
        fixture.fleet.launch_all().await.unwrap();

        let reply = exchange(fixture.center.path(), "restart web,ghost").await;
        assert_eq!(reply, "web:ok ghost:error:not_found");
        let fresh = fixture.fleet.registry().get("web").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.status(), ProcessStatus::Running);
        assert!(old.status().is_terminal());

        fixture.fleet.begin_stopping();
        fixture.center.stop().await;
    }

    #[tokio::test]
    async fn malformed_request_gets_error() {
        let fixture = fixture(&[("web", "true")]);
        fixture.center.start().unwrap();
        let path = fixture.center.path();

        assert_eq!(exchange(path, "stop everything").await, "error:malformed");
        assert_eq!(exchange(path, "restart web;rm").await, "error:malformed");
        // The listener survives bad clients.
        assert_eq!(exchange(path, "connect ghost").await, "error:not_found");

        fixture.center.stop().await;
    }

    #[tokio::test]
    async fn kill_stops_everything_and_notifies() {
        let mut fixture = fixture(&[("web", "sleep 30"), ("worker", "sleep 30")]);
        fixture.center.start().unwrap();
        launch(&fixture, "web").await;

        assert_eq!(exchange(fixture.center.path(), "kill").await, "ok");
        loop {
            let trigger = tokio::time::timeout(Duration::from_secs(5), fixture.triggers.recv())
                .await
                .unwrap();
            if trigger == Some(Trigger::KillRequested) {
                break;
            }
        }
        assert!(fixture.fleet.is_stopping());
        assert_eq!(
            fixture.fleet.registry().get("worker").unwrap().status(),
            ProcessStatus::Killed
        );
        tokio::time::timeout(
            Duration::from_secs(5),
            fixture.fleet.registry().wait_all_terminal(),
        )
        .await
        .unwrap();

        assert_eq!(
            exchange(fixture.center.path(), "restart web").await,
            "web:error:shutting_down"
        );
        fixture.center.stop().await;
    }

    #[tokio::test]
    async fn launcher_link_relays_events_and_instructions() {
        let fixture = fixture(&[("web", "sleep 30")]);
        fixture.center.start().unwrap();
        let web = launch(&fixture, "web").await;
        let path = fixture.center.path();

        assert_eq!(exchange(path, "hello ghost").await, "error:not_found");

        let stream = UnixStream::connect(path).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        write.write_all(b"hello web\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await.unwrap(), "go");

        assert_eq!(exchange(path, "hello web").await, "error:already_connected");

        write.write_all(b"started 4242\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(web.child_pid(), Some(4242));

        // The first stop travels over the link instead of a signal.
        assert!(web.stop());
        assert_eq!(read_line(&mut reader).await.unwrap(), "kill");
        assert_eq!(web.status(), ProcessStatus::Running);

        write.write_all(b"exited 130\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(web.exit_outcome(), Some(ExitOutcome::Code(130)));

        drop(write);
        drop(reader);
        web.stop();
        tokio::time::timeout(Duration::from_secs(5), web.wait_terminal())
            .await
            .unwrap();
        assert_eq!(web.exit_outcome(), Some(ExitOutcome::Code(130)));
        fixture.center.stop().await;
    }

    #[tokio::test]
    async fn silent_connection_does_not_block_others() {
        let fixture = fixture(&[("web", "true")]);
        fixture.center.start().unwrap();
        let path = fixture.center.path();

        let _idle = UnixStream::connect(path).await.unwrap();
        assert_eq!(exchange(path, "connect ghost").await, "error:not_found");

        fixture.center.stop().await;
    }
}

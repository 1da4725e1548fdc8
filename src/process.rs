//! Supervisor-side state of one managed process.
//!
//! A [`Process`] owns the window its command runs in. Its lifecycle only moves
//! forward (`Pending → Starting → Running → Exited | Killed`); a restart builds
//! a fresh entity with [`Process::renew`] instead of rewinding this one.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{ProcessError, SpawnError};
use crate::mux::{Multiplexer, SessionId, WindowRequest};
use crate::protocol::Instruction;

/// How often a waiting monitor checks whether the window process is gone.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Specification for a process to be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Unique name, also the tmux window name.
    pub name: String,
    /// Shell command line, passed to the shell untouched.
    pub command: String,
    /// Working directory.
    pub root: PathBuf,
    /// Exported to the command as `PORT`.
    pub port: Option<u16>,
    /// 256-color palette index used for the name in output.
    pub color: u8,
}

/// The current lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Not started yet.
    Pending,
    /// Window is being opened.
    Starting,
    Running,
    /// Terminated on its own.
    Exited,
    /// Terminated after a stop was requested.
    Killed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::Exited | ProcessStatus::Killed)
    }

    fn rank(self) -> u8 {
        match self {
            ProcessStatus::Pending => 0,
            ProcessStatus::Starting => 1,
            ProcessStatus::Running => 2,
            ProcessStatus::Exited | ProcessStatus::Killed => 3,
        }
    }
}

/// How a process ended, as far as the supervisor knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
    /// The launcher never reported a status.
    Unknown,
    SpawnFailed(String),
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exit code {code}"),
            ExitOutcome::Signal(signal) => write!(f, "signal {signal}"),
            ExitOutcome::Unknown => f.write_str("unknown status"),
            ExitOutcome::SpawnFailed(reason) => write!(f, "failed to start: {reason}"),
        }
    }
}

/// Each `stop()` on a live process moves one stage further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopStage {
    Interrupt,
    Terminate,
    Kill,
}

impl StopStage {
    fn next(stage: Option<StopStage>) -> StopStage {
        match stage {
            None => StopStage::Interrupt,
            Some(StopStage::Interrupt) => StopStage::Terminate,
            Some(_) => StopStage::Kill,
        }
    }

    fn signal(self) -> libc::c_int {
        match self {
            StopStage::Interrupt => libc::SIGINT,
            StopStage::Terminate => libc::SIGTERM,
            StopStage::Kill => libc::SIGKILL,
        }
    }

    fn label(self) -> &'static str {
        match self {
            StopStage::Interrupt => "SIGINT",
            StopStage::Terminate => "SIGTERM",
            StopStage::Kill => "SIGKILL",
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    pid: Option<u32>,
    window: Option<String>,
    child_pid: Option<u32>,
    exit: Option<ExitOutcome>,
    stop_stage: Option<StopStage>,
    link: Option<mpsc::Sender<Instruction>>,
}

/// One supervised command and its window.
pub struct Process {
    spec: ProcessSpec,
    session: SessionId,
    host: Arc<dyn Multiplexer>,
    status: watch::Sender<ProcessStatus>,
    inner: Mutex<Inner>,
    waited: AtomicBool,
    retired: AtomicBool,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.spec.name)
            .field("status", &self.status())
            .field("pid", &self.pid())
            .field("child_pid", &self.child_pid())
            .finish()
    }
}

impl Process {
    pub fn new(spec: ProcessSpec, session: SessionId, host: Arc<dyn Multiplexer>) -> Self {
        let (status, _) = watch::channel(ProcessStatus::Pending);
        Self {
            spec,
            session,
            host,
            status,
            inner: Mutex::new(Inner::default()),
            waited: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    /// A pending copy of this process, same spec and session.
    pub fn renew(&self) -> Self {
        Self::new(self.spec.clone(), self.session.clone(), Arc::clone(&self.host))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status.subscribe()
    }

    /// Pid of the window process, `None` until `start` succeeded.
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    pub fn window(&self) -> Option<String> {
        self.inner.lock().window.clone()
    }

    /// Pid of the command itself, as relayed by the launcher.
    pub fn child_pid(&self) -> Option<u32> {
        self.inner.lock().child_pid
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.inner.lock().exit.clone()
    }

    // Moves forward only, never out of a terminal state.
    fn advance(&self, next: ProcessStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.is_terminal() || next.rank() <= current.rank() {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Opens the window, creating the session when `is_first` is set.
    pub async fn start(&self, control: &Path, is_first: bool) -> Result<(), SpawnError> {
        if !self.advance(ProcessStatus::Starting) {
            return Err(SpawnError::AlreadyStarted {
                name: self.spec.name.clone(),
            });
        }
        if !self.spec.root.is_dir() {
            let err = SpawnError::InvalidDirectory(self.spec.root.clone());
            self.fail(&err);
            return Err(err);
        }

        let request = WindowRequest {
            session: &self.session,
            name: &self.spec.name,
            cwd: &self.spec.root,
            command: &self.spec.command,
            port: self.spec.port,
            control,
            new_session: is_first,
        };
        let window = match self.host.open_window(request).await {
            Ok(window) => window,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        let deferred_stop = {
            let mut inner = self.inner.lock();
            inner.pid = Some(window.pid);
            inner.window = Some(window.id);
            inner.stop_stage
        };
        self.advance(ProcessStatus::Running);
        if let Some(stage) = deferred_stop {
            // A stop arrived while the window was being opened.
            signal_group(window.pid, stage.signal());
        }
        Ok(())
    }

    fn fail(&self, err: &SpawnError) {
        self.inner.lock().exit = Some(ExitOutcome::SpawnFailed(err.to_string()));
        self.advance(ProcessStatus::Exited);
    }

    /// Blocks until the window process is gone. Only one caller may wait.
    pub async fn wait(&self) -> Result<ExitOutcome, ProcessError> {
        let Some(pid) = self.pid() else {
            return Err(ProcessError::NotStarted(self.spec.name.clone()));
        };
        if self.waited.swap(true, Ordering::SeqCst) {
            return Err(ProcessError::AlreadyWaited(self.spec.name.clone()));
        }

        while pid_alive(pid) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let (outcome, stopped) = {
            let mut inner = self.inner.lock();
            inner.link = None;
            let outcome = inner.exit.get_or_insert(ExitOutcome::Unknown).clone();
            (outcome, inner.stop_stage.is_some())
        };
        self.advance(if stopped {
            ProcessStatus::Killed
        } else {
            ProcessStatus::Exited
        });
        Ok(outcome)
    }

    /// Resolves once the process reached `Exited` or `Killed`.
    pub async fn wait_terminal(&self) -> ProcessStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            // The sender lives in `self`, so it cannot be gone while we borrow it.
            Err(_) => self.status(),
        };
        status
    }

    /// Asks the process to terminate, escalating on every repeated call.
    ///
    /// The first call is graceful: a `kill` instruction over the launcher link,
    /// or SIGINT to the window's process group. Later calls send SIGTERM, then
    /// SIGKILL. Returns `false` when there was nothing left to stop.
    pub fn stop(&self) -> bool {
        match self.status() {
            ProcessStatus::Exited | ProcessStatus::Killed => return false,
            ProcessStatus::Pending => return self.advance(ProcessStatus::Killed),
            ProcessStatus::Starting | ProcessStatus::Running => {}
        }

        let (pid, stage, link) = {
            let mut inner = self.inner.lock();
            let stage = StopStage::next(inner.stop_stage);
            inner.stop_stage = Some(stage);
            (inner.pid, stage, inner.link.clone())
        };
        let Some(pid) = pid else {
            // Still starting; `start` delivers the signal once the pid is known.
            return true;
        };

        if stage == StopStage::Interrupt {
            if let Some(link) = link {
                if link.try_send(Instruction::Kill).is_ok() {
                    debug!(process = %self.spec.name, "sent kill instruction");
                    return true;
                }
            }
        }
        debug!(process = %self.spec.name, pid, signal = stage.label(), "signalling process group");
        signal_group(pid, stage.signal());
        true
    }

    /// Marks this entity as replaced; its exit no longer concerns the supervisor.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Registers the launcher connection of this window. Only one is accepted.
    pub fn attach_link(&self, link: mpsc::Sender<Instruction>) -> bool {
        let mut inner = self.inner.lock();
        if inner.link.as_ref().is_some_and(|l| !l.is_closed()) {
            return false;
        }
        inner.link = Some(link);
        true
    }

    pub fn detach_link(&self) {
        self.inner.lock().link = None;
    }

    pub fn record_child(&self, pid: u32) {
        self.inner.lock().child_pid = Some(pid);
    }

    pub fn record_exit(&self, outcome: ExitOutcome) {
        self.inner.lock().exit = Some(outcome);
    }
}

/// Sends `signal` to the process group led by `pid`, and to `pid` itself.
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = i32::try_from(pid) else {
        warn!(pid, "pid out of range, not signalling");
        return;
    };
    if pid <= 0 {
        return;
    }
    unsafe {
        let _ = libc::kill(-pid, signal);
        let _ = libc::kill(pid, signal);
    }
}

fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

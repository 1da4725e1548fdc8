//! Top-level orchestration of one `procmux start` run.
//!
//! The supervisor moves through `Launching → Running → Stopping → Terminated`.
//! Processes are started in list order, each gets a monitor task, and the
//! first qualifying exit, interrupt or `kill` request ends `Running`. Stopping
//! repeats the stop-and-wait round until every process is gone, then the tmux
//! session is destroyed and the command center shut down.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command_center::CommandCenter;
use crate::error::{CommandError, SpawnError};
use crate::events::{Interrupt, Trigger};
use crate::mux::{Multiplexer, SessionId};
use crate::output::Output;
use crate::process::{Process, ProcessSpec};
use crate::registry::Registry;

/// Settings of one supervisor run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Human-readable part of the session name.
    pub title: String,
    /// Absolute path of the control socket.
    pub socket: PathBuf,
    /// Length of one stop-and-wait round.
    pub timeout: Duration,
    /// Processes whose exit does not end the run.
    pub may_die: HashSet<String>,
    /// Start only these processes; all of them when empty.
    pub only: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Launching,
    Running,
    Stopping,
    Terminated,
}

/// State shared by the supervisor, its monitors and the command center.
pub struct Fleet {
    registry: Registry,
    host: Arc<dyn Multiplexer>,
    session: SessionId,
    control: PathBuf,
    may_die: HashSet<String>,
    timeout: Duration,
    output: Output,
    triggers: mpsc::Sender<Trigger>,
    launched: AtomicBool,
    stopping: AtomicBool,
}

impl Fleet {
    pub fn new(
        registry: Registry,
        host: Arc<dyn Multiplexer>,
        session: SessionId,
        control: PathBuf,
        may_die: HashSet<String>,
        timeout: Duration,
        triggers: mpsc::Sender<Trigger>,
    ) -> Self {
        let output = Output::new(registry.max_name_len());
        Self {
            registry,
            host,
            session,
            control,
            may_die,
            timeout,
            output,
            triggers,
            launched: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Starts `process` and puts a monitor on it.
    pub async fn launch(self: &Arc<Self>, process: Arc<Process>, is_first: bool) -> Result<(), SpawnError> {
        if let Err(err) = process.start(&self.control, is_first).await {
            self.output.process(process.spec(), format_args!("Failed to start: {err}"));
            return Err(err);
        }
        let pid = process.pid().unwrap_or_default();
        self.output
            .process(process.spec(), format_args!("Started with pid {pid}..."));
        self.monitor(process);
        Ok(())
    }

    fn monitor(self: &Arc<Self>, process: Arc<Process>) {
        let fleet = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match process.wait().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(process = process.name(), %err, "monitor could not wait");
                    return;
                }
            };
            fleet
                .output
                .process(process.spec(), format_args!("Exited ({outcome})"));

            if process.is_retired() || fleet.may_die.contains(process.name()) {
                debug!(process = process.name(), "exit does not end the run");
                return;
            }
            fleet.notify(Trigger::Exited {
                name: process.name().to_string(),
                outcome,
            });
        });
    }

    // A full channel already holds a pending trigger, so dropping is fine.
    fn notify(&self, trigger: Trigger) {
        if let Err(err) = self.triggers.try_send(trigger) {
            debug!(%err, "trigger dropped");
        }
    }

    /// Enters the stopping state and stops every process. Only the first call
    /// does anything; returns whether it was this one.
    pub fn begin_stopping(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.output.system("Interrupting...");
        self.stop_all();
        true
    }

    /// Sends the next stop stage to every process that is still alive.
    pub fn stop_all(&self) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|process| process.stop())
            .count()
    }

    /// Starts every process in list order; the first one creates the session.
    /// Stops at the first failure.
    pub async fn launch_all(self: &Arc<Self>) -> Result<(), SpawnError> {
        let mut is_first = true;
        for process in self.registry.snapshot() {
            if self.is_stopping() {
                break;
            }
            self.launch(process, is_first).await?;
            is_first = false;
        }
        self.launched.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Wakes the supervisor after a `kill` command.
    pub fn kill_requested(&self) {
        self.notify(Trigger::KillRequested);
    }

    /// Stops one process, waits for it and starts a fresh entity in its slot.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<(), CommandError> {
        if self.is_stopping() {
            return Err(CommandError::ShuttingDown);
        }
        // The launch loop owns session creation until every window is open.
        if !self.launched.load(Ordering::SeqCst) {
            return Err(CommandError::NotReady(name.to_string()));
        }
        let slot = self
            .registry
            .lock(name)
            .await
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;
        if self.is_stopping() {
            return Err(CommandError::ShuttingDown);
        }

        let old = slot.current();
        self.output.process(old.spec(), "Restarting...");
        old.retire();
        self.stop_and_wait(&old).await;
        if self.is_stopping() {
            return Err(CommandError::ShuttingDown);
        }

        let fresh = slot.replace(old.renew());
        // The stop round snapshots after setting the flag: one of us sees `fresh`.
        if self.is_stopping() {
            fresh.stop();
            return Err(CommandError::ShuttingDown);
        }
        let is_first = !self.host.session_exists(&self.session).await;
        self.launch(fresh, is_first).await?;
        Ok(())
    }

    async fn stop_and_wait(&self, process: &Process) {
        while process.stop() {
            if tokio::time::timeout(self.timeout, process.wait_terminal())
                .await
                .is_ok()
            {
                break;
            }
            debug!(process = process.name(), "still running after stop, escalating");
        }
    }
}

pub struct Supervisor {
    fleet: Arc<Fleet>,
    center: CommandCenter,
    triggers: mpsc::Receiver<Trigger>,
    phase: watch::Sender<Phase>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        specs: Vec<ProcessSpec>,
        host: Arc<dyn Multiplexer>,
    ) -> Result<Self> {
        let session = SessionId::generate(&config.title);
        let registry = Registry::build(specs, &config.only, |spec| {
            Process::new(spec, session.clone(), Arc::clone(&host))
        })?;
        if registry.is_empty() {
            bail!("no processes to run");
        }

        let (tx, rx) = mpsc::channel(registry.len() + 1);
        let fleet = Arc::new(Fleet::new(
            registry,
            host,
            session,
            config.socket.clone(),
            config.may_die,
            config.timeout,
            tx,
        ));
        let center = CommandCenter::new(config.socket, Arc::clone(&fleet));
        let (phase, _) = watch::channel(Phase::Launching);

        Ok(Self {
            fleet,
            center,
            triggers: rx,
            phase,
        })
    }

    pub fn fleet(&self) -> Arc<Fleet> {
        Arc::clone(&self.fleet)
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Runs until every process is gone. `interrupts` carries the signals
    /// received by the supervisor; the first one ends `Running`, later ones
    /// cut the current stop round short.
    pub async fn run(self, mut interrupts: mpsc::Receiver<Interrupt>) -> Result<()> {
        let Supervisor {
            fleet,
            center,
            mut triggers,
            phase,
        } = self;

        center.start()?;
        info!(socket = %center.path().display(), "control socket listening");
        fleet
            .output
            .system(format_args!("Tmux session ID: {}", fleet.session));

        let failure = match fleet.launch_all().await {
            Ok(()) => {
                phase.send_replace(Phase::Running);
                wait_for_trigger(&fleet, &mut triggers, &mut interrupts).await;
                None
            }
            Err(err) => Some(err),
        };

        phase.send_replace(Phase::Stopping);
        fleet.begin_stopping();
        escalate(&fleet, &mut triggers, &mut interrupts).await;

        // Windows close with their processes; this catches anything left over.
        if let Err(err) = fleet.host.kill_session(&fleet.session).await {
            warn!(session = %fleet.session, %err, "failed to kill session");
        }
        center.stop().await;
        phase.send_replace(Phase::Terminated);
        info!(session = %fleet.session, "supervisor terminated");

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

async fn wait_for_trigger(
    fleet: &Fleet,
    triggers: &mut mpsc::Receiver<Trigger>,
    interrupts: &mut mpsc::Receiver<Interrupt>,
) {
    tokio::select! {
        Some(trigger) = triggers.recv() => match trigger {
            Trigger::Exited { name, outcome } => {
                info!(process = %name, %outcome, "process exited, stopping");
            }
            Trigger::KillRequested => {
                fleet.output.system("Kill requested");
            }
        },
        Some(interrupt) = interrupts.recv() => {
            fleet
                .output
                .system(format_args!("Received {}", interrupt.label()));
        }
        else => {}
    }
}

/// Stop rounds until every process is terminal. A round ends early on an
/// interrupt or another `kill`; exits in between only end it once nothing is
/// left running.
async fn escalate(
    fleet: &Fleet,
    triggers: &mut mpsc::Receiver<Trigger>,
    interrupts: &mut mpsc::Receiver<Interrupt>,
) {
    loop {
        if fleet.registry.all_terminal() {
            return;
        }
        let deadline = Instant::now() + fleet.timeout;
        loop {
            tokio::select! {
                _ = fleet.registry.wait_all_terminal() => {
                    // A restart may have swapped in a fresh entity meanwhile.
                    if fleet.registry.all_terminal() {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("stop round timed out");
                    break;
                }
                Some(interrupt) = interrupts.recv() => {
                    debug!(signal = interrupt.label(), "interrupt during stop round");
                    break;
                }
                Some(trigger) = triggers.recv() => {
                    if trigger == Trigger::KillRequested {
                        break;
                    }
                }
            }
        }
        if fleet.registry.all_terminal() {
            return;
        }
        let signalled = fleet.stop_all();
        fleet
            .output
            .system(format_args!("Stopping {signalled} remaining process(es) again..."));
    }
}

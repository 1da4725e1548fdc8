//! Messages that drive the supervisor's state machine.
//!
//! Monitors and the command center fan in through one [`Trigger`] channel;
//! operating-system signals arrive separately as [`Interrupt`]s so the
//! escalation loop can tell them apart.

use crate::process::ExitOutcome;

/// Something that may end the `Running` phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A monitored process that is not allowed to die terminated.
    Exited { name: String, outcome: ExitOutcome },
    /// A satellite sent `kill`.
    KillRequested,
}

/// A signal received by the supervisor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SigInt,
    SigTerm,
    SigHup,
}

impl Interrupt {
    pub fn label(self) -> &'static str {
        match self {
            Interrupt::SigInt => "SIGINT",
            Interrupt::SigTerm => "SIGTERM",
            Interrupt::SigHup => "SIGHUP",
        }
    }
}

//! Error types shared by the supervisor, the command center and the clients.
//!
//! Each failure class gets its own type so callers can decide what is fatal:
//! spawn and bind errors end a `start` run, command errors are reported per
//! request, protocol errors only ever cost the one connection they came from.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A process window could not be created.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("can't find tmux, did you forget to install it?")]
    MultiplexerMissing,
    #[error("working directory {} does not exist or is not a directory", .0.display())]
    InvalidDirectory(PathBuf),
    #[error("{name} has already been started")]
    AlreadyStarted { name: String },
    #[error("tmux refused to open a window for {name}: {reason}")]
    WindowRefused { name: String, reason: String },
    #[error("failed to run tmux: {0}")]
    Io(#[from] io::Error),
}

/// The control socket could not be created.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("{} is already in use by a running supervisor", .0.display())]
    InUse(PathBuf),
    #[error("{} exists and is not a socket", .0.display())]
    NotASocket(PathBuf),
    #[error("failed to bind control socket {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Malformed or unexpected traffic on a control connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0:?}")]
    Malformed(String),
    #[error("message exceeds {0} bytes")]
    TooLong(usize),
    #[error("connection closed before a message arrived")]
    Closed,
    #[error("timed out waiting for a message")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-request failure reported back to a satellite or a launcher.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no process named {0}")]
    NotFound(String),
    #[error("{0} is not ready")]
    NotReady(String),
    #[error("{0} already has a launcher connected")]
    AlreadyConnected(String),
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl CommandError {
    /// Short token used on the wire after `error:`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotReady(_) => "not_ready",
            Self::AlreadyConnected(_) => "already_connected",
            Self::ShuttingDown => "shutting_down",
            Self::Spawn(_) => "spawn_failed",
        }
    }
}

/// Misuse of a process entity's lifecycle operations.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{0} was never started")]
    NotStarted(String),
    #[error("{0} is already being waited on")]
    AlreadyWaited(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_codes_are_wire_safe() {
        let errors = [
            CommandError::NotFound("web".into()),
            CommandError::NotReady("web".into()),
            CommandError::AlreadyConnected("web".into()),
            CommandError::ShuttingDown,
            CommandError::Spawn(SpawnError::MultiplexerMissing),
        ];
        for err in errors {
            let code = err.code();
            assert!(!code.is_empty());
            assert!(code.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}

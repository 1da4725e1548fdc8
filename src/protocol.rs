//! Line-oriented wire format of the control socket.
//!
//! Every message is a single `\n`-terminated UTF-8 line. A satellite command
//! connection sends one [`Request`] and reads one reply line. A launcher sends
//! `hello <name>`, reads a [`HandshakeReply`], and afterwards the same
//! connection carries [`ChildEvent`]s upstream and [`Instruction`]s downstream.

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::process::ExitOutcome;

/// Longest accepted line, newline excluded.
pub const MAX_LINE: usize = 4096;

/// Process names travel unquoted, so they are restricted to this alphabet.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// First line sent on any connection to the command center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A launcher announcing the process it hosts.
    Hello { name: String },
    Restart { names: Vec<String> },
    Connect { name: String },
    Kill,
}

impl FromStr for Request {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let malformed = || ProtocolError::Malformed(line.to_string());

        match verb {
            "hello" => single_name(rest)
                .map(|name| Request::Hello { name })
                .ok_or_else(malformed),
            "connect" => single_name(rest)
                .map(|name| Request::Connect { name })
                .ok_or_else(malformed),
            "restart" => {
                let names: Vec<String> = rest
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect();
                if names.is_empty() || !names.iter().all(|n| is_valid_name(n)) {
                    return Err(malformed());
                }
                Ok(Request::Restart { names })
            }
            "kill" if rest.is_empty() => Ok(Request::Kill),
            _ => Err(malformed()),
        }
    }
}

fn single_name(rest: &str) -> Option<String> {
    if is_valid_name(rest) {
        Some(rest.to_string())
    } else {
        None
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Hello { name } => write!(f, "hello {name}"),
            Request::Restart { names } => write!(f, "restart {}", names.join(",")),
            Request::Connect { name } => write!(f, "connect {name}"),
            Request::Kill => f.write_str("kill"),
        }
    }
}

/// Result of one command, `ok` or `error:<reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error(String),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => f.write_str("ok"),
            Outcome::Error(reason) => write!(f, "error:{reason}"),
        }
    }
}

impl FromStr for Outcome {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ok" {
            return Ok(Outcome::Ok);
        }
        match s.strip_prefix("error:") {
            Some(reason) if !reason.is_empty() => Ok(Outcome::Error(reason.to_string())),
            _ => Err(ProtocolError::Malformed(s.to_string())),
        }
    }
}

/// Reply to `restart`: one `<name>:<outcome>` entry per requested name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartReport {
    pub entries: Vec<(String, Outcome)>,
}

impl RestartReport {
    pub fn push(&mut self, name: impl Into<String>, outcome: Outcome) {
        self.entries.push((name.into(), outcome));
    }

    pub fn all_ok(&self) -> bool {
        self.entries.iter().all(|(_, outcome)| outcome.is_ok())
    }

    pub fn get(&self, name: &str) -> Option<&Outcome> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, outcome)| outcome)
    }
}

impl fmt::Display for RestartReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (name, outcome)) in self.entries.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}:{outcome}")?;
        }
        Ok(())
    }
}

impl FromStr for RestartReport {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut report = RestartReport::default();
        for entry in line.split_whitespace() {
            let (name, outcome) = entry
                .split_once(':')
                .ok_or_else(|| ProtocolError::Malformed(entry.to_string()))?;
            report.push(name, outcome.parse()?);
        }
        if report.entries.is_empty() {
            return Err(ProtocolError::Malformed(line.to_string()));
        }
        Ok(report)
    }
}

/// Reply to `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReply {
    Window(String),
    Error(String),
}

impl fmt::Display for ConnectReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReply::Window(id) => write!(f, "window:{id}"),
            ConnectReply::Error(reason) => write!(f, "error:{reason}"),
        }
    }
}

impl FromStr for ConnectReply {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        if let Some(id) = line.strip_prefix("window:").filter(|id| !id.is_empty()) {
            return Ok(ConnectReply::Window(id.to_string()));
        }
        match line.parse::<Outcome>()? {
            Outcome::Error(reason) => Ok(ConnectReply::Error(reason)),
            Outcome::Ok => Err(ProtocolError::Malformed(line.to_string())),
        }
    }
}

/// Reply to `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Go,
    Refused(String),
}

impl fmt::Display for HandshakeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeReply::Go => f.write_str("go"),
            HandshakeReply::Refused(reason) => write!(f, "error:{reason}"),
        }
    }
}

impl FromStr for HandshakeReply {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        if line == "go" {
            return Ok(HandshakeReply::Go);
        }
        match line.parse::<Outcome>()? {
            Outcome::Error(reason) => Ok(HandshakeReply::Refused(reason)),
            Outcome::Ok => Err(ProtocolError::Malformed(line.to_string())),
        }
    }
}

/// Lifecycle notices a launcher relays after `go`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Started { pid: u32 },
    Exited(ExitOutcome),
}

impl fmt::Display for ChildEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildEvent::Started { pid } => write!(f, "started {pid}"),
            ChildEvent::Exited(ExitOutcome::Code(code)) => write!(f, "exited {code}"),
            ChildEvent::Exited(ExitOutcome::Signal(signal)) => write!(f, "exited signal:{signal}"),
            ChildEvent::Exited(_) => f.write_str("exited unknown"),
        }
    }
}

impl FromStr for ChildEvent {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::Malformed(line.to_string());
        let (verb, arg) = line.trim().split_once(' ').ok_or_else(malformed)?;
        match verb {
            "started" => arg
                .parse()
                .map(|pid| ChildEvent::Started { pid })
                .map_err(|_| malformed()),
            "exited" => {
                let outcome = if arg == "unknown" {
                    ExitOutcome::Unknown
                } else if let Some(signal) = arg.strip_prefix("signal:") {
                    ExitOutcome::Signal(signal.parse().map_err(|_| malformed())?)
                } else {
                    ExitOutcome::Code(arg.parse().map_err(|_| malformed())?)
                };
                Ok(ChildEvent::Exited(outcome))
            }
            _ => Err(malformed()),
        }
    }
}

/// Pushed by the command center at one specific window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Interrupt the hosted command.
    Kill,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Kill => f.write_str("kill"),
        }
    }
}

impl FromStr for Instruction {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim() {
            "kill" => Ok(Instruction::Kill),
            other => Err(ProtocolError::Malformed(other.to_string())),
        }
    }
}

/// Reads one line of at most [`MAX_LINE`] bytes, without its terminator.
///
/// Not cancel safe: use it where losing a partial line also means dropping
/// the connection.
pub async fn read_line<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = String::new();
    let limit = MAX_LINE as u64 + 1;
    let read = (&mut *reader).take(limit).read_line(&mut buf).await?;
    if read == 0 {
        return Err(ProtocolError::Closed);
    }
    if !buf.ends_with('\n') && read as u64 >= limit {
        return Err(ProtocolError::TooLong(MAX_LINE));
    }
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}

/// Writes `message` followed by a newline and flushes.
pub async fn write_line<W, M>(writer: &mut W, message: M) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: fmt::Display,
{
    let mut line = message.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

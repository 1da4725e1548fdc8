//! Satellite side of the control socket: `restart`, `connect` and `kill`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::BufReader;
use tokio::net::UnixStream;

use crate::error::ProtocolError;
use crate::protocol::{
    is_valid_name, read_line, write_line, ConnectReply, Outcome, Request, RestartReport,
};

/// Reply deadline of `connect` and `kill`. Restarts sit through stop rounds
/// and wait as long as they take.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    socket: PathBuf,
}

impl Client {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn exchange(&self, request: Request, deadline: Option<Duration>) -> Result<String> {
        let stream = UnixStream::connect(&self.socket).await.with_context(|| {
            format!(
                "can't connect to {}, is procmux running?",
                self.socket.display()
            )
        })?;
        let (read, mut write) = stream.into_split();
        write_line(&mut write, &request).await?;

        let mut reader = BufReader::new(read);
        let reply = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, read_line(&mut reader))
                .await
                .map_err(|_| ProtocolError::TimedOut)??,
            None => read_line(&mut reader).await?,
        };
        Ok(reply)
    }

    pub async fn restart(&self, names: Vec<String>) -> Result<RestartReport> {
        if let Some(bad) = names.iter().find(|name| !is_valid_name(name)) {
            bail!("invalid process name {bad:?}");
        }
        if names.is_empty() {
            bail!("no process names given");
        }
        let reply = self.exchange(Request::Restart { names }, None).await?;
        if let Some(reason) = reply.strip_prefix("error:") {
            bail!("restart rejected: {reason}");
        }
        Ok(reply.parse()?)
    }

    /// Window id of `name`, ready for `tmux attach`.
    pub async fn connect(&self, name: &str) -> Result<String> {
        if !is_valid_name(name) {
            bail!("invalid process name {name:?}");
        }
        let request = Request::Connect {
            name: name.to_string(),
        };
        let reply = self.exchange(request, Some(REPLY_TIMEOUT)).await?;
        match reply.parse::<ConnectReply>()? {
            ConnectReply::Window(id) => Ok(id),
            ConnectReply::Error(reason) => bail!("can't connect to {name}: {reason}"),
        }
    }

    pub async fn kill(&self) -> Result<()> {
        let reply = self.exchange(Request::Kill, Some(REPLY_TIMEOUT)).await?;
        match reply.parse::<Outcome>()? {
            Outcome::Ok => Ok(()),
            Outcome::Error(reason) => bail!("kill failed: {reason}"),
        }
    }
}

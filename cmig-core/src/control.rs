// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Local operator control channel.
//!
//! A Unix-domain socket accepting one text command per connection:
//! `CHECKPOINT` or `MIGRATE <container-id>`. Every command gets a single
//! reply line, `OK` or `ERR <reason>`.

use std::fmt;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::error::ControlError;
use crate::types::ContainerId;

/// Operator commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Take a manual full dump, leaving the container running.
    Checkpoint,
    /// Hand the named container off to the first replica.
    Migrate(ContainerId),
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("CHECKPOINT") => Ok(Self::Checkpoint),
            Some("MIGRATE") => {
                let id = words
                    .next()
                    .ok_or(ControlError::MissingArgument { command: "MIGRATE" })?;
                let id = ContainerId::new(id).map_err(|e| ControlError::Refused {
                    reason: e.to_string(),
                })?;
                Ok(Self::Migrate(id))
            }
            Some(other) => Err(ControlError::UnknownCommand {
                command: other.to_string(),
            }),
            None => Err(ControlError::UnknownCommand {
                command: String::new(),
            }),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checkpoint => write!(f, "CHECKPOINT"),
            Self::Migrate(id) => write!(f, "MIGRATE {}", id),
        }
    }
}

/// Executes operator commands.
pub trait ControlHandler: Send + Sync + 'static {
    fn execute(&self, command: ControlCommand)
        -> impl Future<Output = Result<(), ControlError>> + Send;
}

/// Control socket listener.
pub struct ControlServer<H> {
    path: PathBuf,
    listener: UnixListener,
    handler: Arc<H>,
}

impl<H: ControlHandler> ControlServer<H> {
    /// Bind the socket, replacing a stale one left by a previous run.
    pub fn bind(path: impl Into<PathBuf>, handler: Arc<H>) -> Result<Self, ControlError> {
        let path = path.into();
        let socket_err = |source: std::io::Error| ControlError::Socket {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(socket_err)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not remove stale control socket")
            }
        }

        let listener = UnixListener::bind(&path).map_err(socket_err)?;
        // Owner only. Binding fails rather than leave the socket open.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(socket_err)?;

        tracing::info!(path = %path.display(), "Control socket listening");
        Ok(Self {
            path,
            listener,
            handler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(handler, stream).await {
                            tracing::debug!(error = %e, "Control connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Control socket accept failed");
                    return;
                }
            }
        }
    }
}

impl<H> Drop for ControlServer<H> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not remove control socket");
        }
    }
}

async fn handle_connection<H: ControlHandler>(
    handler: Arc<H>,
    stream: UnixStream,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;

    let result = match line.trim().parse::<ControlCommand>() {
        Ok(command) => {
            tracing::info!(command = %command, "Control command received");
            handler.execute(command).await
        }
        Err(e) => Err(e),
    };

    let reply = match result {
        Ok(()) => "OK\n".to_string(),
        Err(ControlError::Refused { reason }) => {
            tracing::warn!(reason = %reason, "Control command refused");
            format!("ERR {}\n", reason)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Control command failed");
            format!("ERR {}\n", e)
        }
    };
    writer.write_all(reply.as_bytes()).await?;
    writer.flush().await
}

/// Send one command to a running node and wait for its reply.
pub async fn send_command(path: &Path, command: &ControlCommand) -> Result<(), ControlError> {
    let socket_err = |source: std::io::Error| ControlError::Socket {
        path: path.to_path_buf(),
        source,
    };

    let stream = UnixStream::connect(path).await.map_err(socket_err)?;
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{}\n", command).as_bytes())
        .await
        .map_err(socket_err)?;
    writer.flush().await.map_err(socket_err)?;

    let mut reply = String::new();
    BufReader::new(reader)
        .read_line(&mut reply)
        .await
        .map_err(socket_err)?;

    let reply = reply.trim();
    if reply == "OK" {
        return Ok(());
    }
    Err(ControlError::Refused {
        reason: reply.strip_prefix("ERR ").unwrap_or(reply).to_string(),
    })
}

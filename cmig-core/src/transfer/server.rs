// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Receiving side of dump replication.
//!
//! Writes incoming dump files under the local dump root. Each file lands in
//! a `.part` file first and is renamed once its checksum has been verified.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::{read_frame, write_json, FrameAuth, FrameHeader, TransferAck, PARENT_LINK};
use crate::dump::Dump;
use crate::error::TransferError;

const CHUNK_SIZE: usize = 64 * 1024;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after `failures` consecutive accept errors, doubling up to a cap.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Accepts dump transfers from upstream nodes.
#[derive(Debug)]
pub struct TransferServer {
    dump_root: PathBuf,
    auth: FrameAuth,
}

impl TransferServer {
    pub fn new(dump_root: impl Into<PathBuf>, auth: FrameAuth) -> Self {
        Self {
            dump_root: dump_root.into(),
            auth,
        }
    }

    /// Accept connections forever, one task per sender. Accept errors
    /// (descriptor exhaustion and the like) back off before retrying.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                address = %addr,
                dump_root = %self.dump_root.display(),
                authenticated = self.auth.is_enabled(),
                "File transfer listener started"
            );
        }
        let mut failures = 0u32;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    failures = 0;
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            tracing::warn!(peer = %peer, error = %e, "Dump transfer failed");
                        }
                    });
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let pause = accept_backoff(failures);
                    tracing::error!(
                        error = %e,
                        failures = failures,
                        retry_in_ms = pause.as_millis() as u64,
                        "File transfer listener failed to accept"
                    );
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), TransferError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let outcome = self.receive_dump(&mut reader).await;
        let ack = match &outcome {
            Ok(_) => TransferAck {
                ok: true,
                reason: None,
            },
            Err(e) => TransferAck {
                ok: false,
                reason: Some(e.to_string()),
            },
        };
        // The sender may already be gone after a transport error.
        let _ = write_json(&mut writer, &ack).await;
        let _ = writer.flush().await;

        let dump = outcome?;
        tracing::info!(dump = %dump, "Dump received");
        Ok(())
    }

    async fn receive_dump<R>(&self, reader: &mut R) -> Result<String, TransferError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        loop {
            match read_frame(reader, &self.auth).await? {
                FrameHeader::File {
                    dump,
                    name,
                    size,
                    crc32,
                } => {
                    let dir = self.dump_dir(&dump)?;
                    check_file_name(&name)?;
                    self.receive_file(reader, &dir, &name, size, crc32).await?;
                }
                FrameHeader::ParentLink { dump, points_to } => {
                    let dir = self.dump_dir(&dump)?;
                    check_parent_target(&points_to)?;
                    create_parent_link(&dir, &points_to).await?;
                }
                FrameHeader::Done { dump } => {
                    // An empty dump still gets its directory.
                    let dir = self.dump_dir(&dump)?;
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .map_err(|e| TransferError::Io {
                            context: "creating dump directory",
                            source: e,
                        })?;
                    return Ok(dump);
                }
            }
        }
    }

    fn dump_dir(&self, dump: &str) -> Result<PathBuf, TransferError> {
        let parsed = Dump::from_name(dump).map_err(|e| TransferError::Rejected {
            name: dump.to_string(),
            reason: e.to_string(),
        })?;
        Ok(parsed.path_in(&self.dump_root))
    }

    async fn receive_file<R>(
        &self,
        reader: &mut R,
        dir: &Path,
        name: &str,
        size: u64,
        expected: u32,
    ) -> Result<(), TransferError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TransferError::Io {
                context: "creating dump directory",
                source: e,
            })?;

        let final_path = dir.join(name);
        let part_path = dir.join(format!(".{}.part", name));
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| TransferError::Io {
                context: "creating dump file",
                source: e,
            })?;

        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = size;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let n = reader
                .read(&mut buf[..want])
                .await
                .map_err(|e| TransferError::Io {
                    context: "receiving dump file",
                    source: e,
                })?;
            if n == 0 {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(TransferError::Io {
                    context: "receiving dump file",
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{} bytes of {} missing", remaining, name),
                    ),
                });
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| TransferError::Io {
                    context: "writing dump file",
                    source: e,
                })?;
            remaining -= n as u64;
        }
        file.flush().await.map_err(|e| TransferError::Io {
            context: "writing dump file",
            source: e,
        })?;
        drop(file);

        let actual = hasher.finalize();
        if actual != expected {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(TransferError::ChecksumMismatch {
                file: name.to_string(),
                expected,
                actual,
            });
        }

        tokio::fs::rename(&part_path, &final_path)
            .await
            .map_err(|e| TransferError::Io {
                context: "finalizing dump file",
                source: e,
            })?;
        tracing::trace!(file = %final_path.display(), size = size, "File received");
        Ok(())
    }
}

/// File names must stay inside their dump directory.
fn check_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name == PARENT_LINK
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(TransferError::Rejected {
            name: name.to_string(),
            reason: "not a plain file name".to_string(),
        });
    }
    Ok(())
}

/// Parent links must point at a sibling dump directory.
fn check_parent_target(points_to: &str) -> Result<(), TransferError> {
    let sibling = points_to
        .strip_prefix("../")
        .ok_or_else(|| TransferError::Rejected {
            name: points_to.to_string(),
            reason: "parent link must be relative to the dump root".to_string(),
        })?;
    Dump::from_name(sibling).map_err(|e| TransferError::Rejected {
        name: points_to.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

async fn create_parent_link(dir: &Path, points_to: &str) -> Result<(), TransferError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| TransferError::Io {
            context: "creating dump directory",
            source: e,
        })?;
    let link = dir.join(PARENT_LINK);
    if tokio::fs::symlink_metadata(&link).await.is_ok() {
        tokio::fs::remove_file(&link)
            .await
            .map_err(|e| TransferError::Io {
                context: "replacing parent link",
                source: e,
            })?;
    }
    tokio::fs::symlink(points_to, &link)
        .await
        .map_err(|e| TransferError::Io {
            context: "creating parent link",
            source: e,
        })?;
    tracing::trace!(link = %link.display(), points_to = %points_to, "Parent link created");
    Ok(())
}

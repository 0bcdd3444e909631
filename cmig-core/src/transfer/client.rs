// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Sending side of dump replication.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use super::{read_json, write_frame, DumpTransfer, FrameAuth, FrameHeader, TransferAck, PARENT_LINK};
use crate::dump::Dump;
use crate::error::TransferError;
use crate::target::RemoteTarget;

const CHUNK_SIZE: usize = 64 * 1024;

/// Replicates dump directories from the local dump root over TCP.
///
/// `io_timeout` bounds the connect and every later step of the exchange
/// (each frame, each file chunk, the final ack). A replica that accepts the
/// connection and then stops reading fails the transfer instead of holding
/// the caller forever.
#[derive(Debug, Clone)]
pub struct TcpTransfer {
    dump_root: PathBuf,
    auth: FrameAuth,
    io_timeout: Duration,
}

impl TcpTransfer {
    pub fn new(dump_root: impl Into<PathBuf>, auth: FrameAuth, io_timeout: Duration) -> Self {
        Self {
            dump_root: dump_root.into(),
            auth,
            io_timeout,
        }
    }

    pub fn dump_root(&self) -> &Path {
        &self.dump_root
    }

    async fn connect(&self, target: &RemoteTarget) -> Result<TcpStream, TransferError> {
        let addr = target.file_transfer_addr();
        self.bounded("connecting to file transfer port", async {
            TcpStream::connect(&addr).await.map_err(|e| TransferError::Io {
                context: "connecting to file transfer port",
                source: e,
            })
        })
        .await
    }

    /// Run one step of the exchange under the I/O deadline.
    async fn bounded<T>(
        &self,
        context: &'static str,
        step: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        match tokio::time::timeout(self.io_timeout, step).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Io {
                context,
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("replica stalled for {:?}", self.io_timeout),
                ),
            }),
        }
    }

    /// Stream `size` bytes of `path`, each chunk under the I/O deadline.
    async fn send_file<W>(&self, path: &Path, size: u64, writer: &mut W) -> Result<(), TransferError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let send_err = |e: std::io::Error| TransferError::Io {
            context: "sending dump file",
            source: e,
        };
        let mut file = File::open(path).await.map_err(|e| TransferError::Io {
            context: "opening dump file",
            source: e,
        })?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let n = file.read(&mut buf[..want]).await.map_err(send_err)?;
            if n == 0 {
                return Err(send_err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file shrank during transfer",
                )));
            }
            self.bounded("sending dump file", async {
                writer.write_all(&buf[..n]).await.map_err(send_err)
            })
            .await?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

impl DumpTransfer for TcpTransfer {
    async fn transfer_dump(
        &self,
        dump: &Dump,
        predecessor: Option<&Dump>,
        target: &RemoteTarget,
    ) -> Result<(), TransferError> {
        let start = Instant::now();
        let dir = dump.path_in(&self.dump_root);
        let dump_name = dump.name();

        tracing::debug!(
            dump = %dump_name,
            replica = %target,
            advertised_root = %target.dump_path.display(),
            "Copying dump to remote"
        );

        let stream = self.connect(target).await?;
        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| TransferError::Io {
            context: "listing dump directory",
            source: e,
        })?;

        let mut files = 0usize;
        let mut bytes = 0u64;
        while let Some(entry) = entries.next_entry().await.map_err(|e| TransferError::Io {
            context: "listing dump directory",
            source: e,
        })? {
            let file_type = entry.file_type().await.map_err(|e| TransferError::Io {
                context: "inspecting dump entry",
                source: e,
            })?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::warn!(dump = %dump_name, "Skipping entry with non UTF-8 name");
                continue;
            };

            if file_type.is_symlink() {
                if name != PARENT_LINK {
                    tracing::warn!(dump = %dump_name, entry = %name, "Skipping unexpected symlink");
                    continue;
                }
                let points_to = match predecessor {
                    Some(prev) => prev.parent_path(),
                    None => tokio::fs::read_link(entry.path())
                        .await
                        .map_err(|e| TransferError::Io {
                            context: "reading parent link",
                            source: e,
                        })?
                        .to_string_lossy()
                        .into_owned(),
                };
                tracing::trace!(dump = %dump_name, points_to = %points_to, "Sending parent link");
                let header = FrameHeader::ParentLink {
                    dump: dump_name.clone(),
                    points_to,
                };
                self.bounded("writing frame", write_frame(&mut writer, &self.auth, header))
                    .await?;
                continue;
            }

            if !file_type.is_file() {
                continue;
            }

            let path = entry.path();
            let (size, crc32) = file_checksum(&path).await?;
            tracing::trace!(dump = %dump_name, file = %name, size = size, "Transferring file");
            let header = FrameHeader::File {
                dump: dump_name.clone(),
                name,
                size,
                crc32,
            };
            self.bounded("writing frame", write_frame(&mut writer, &self.auth, header))
                .await?;
            self.send_file(&path, size, &mut writer).await?;
            files += 1;
            bytes += size;
        }

        let done = FrameHeader::Done {
            dump: dump_name.clone(),
        };
        self.bounded("writing frame", write_frame(&mut writer, &self.auth, done))
            .await?;
        self.bounded("flushing transfer", async {
            writer.flush().await.map_err(|e| TransferError::Io {
                context: "flushing transfer",
                source: e,
            })
        })
        .await?;

        let ack: TransferAck = self
            .bounded("waiting for transfer ack", read_json(&mut reader))
            .await?;
        if !ack.ok {
            return Err(TransferError::Rejected {
                name: dump_name,
                reason: ack.reason.unwrap_or_else(|| "no reason given".to_string()),
            });
        }

        tracing::info!(
            dump = %dump_name,
            replica = %target,
            files = files,
            bytes = bytes,
            elapsed_ms = start.elapsed().as_millis(),
            "Dump transferred"
        );
        Ok(())
    }
}

/// Size and CRC32 of a file, read in chunks.
async fn file_checksum(path: &Path) -> Result<(u64, u32), TransferError> {
    let mut file = File::open(path).await.map_err(|e| TransferError::Io {
        context: "opening dump file",
        source: e,
    })?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(|e| TransferError::Io {
            context: "checksumming dump file",
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize()))
}

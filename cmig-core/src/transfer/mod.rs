// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Bulk dump transfer between nodes.
//!
//! A dump directory is replicated file by file over a dedicated TCP port.
//! Each frame is a length-prefixed JSON header; `File` headers are followed
//! by the raw file bytes. The `parent` symlink is never copied as a file: the
//! receiver recreates it from a `ParentLink` header.

mod client;
mod server;

use std::future::Future;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use client::TcpTransfer;
pub use server::TransferServer;

use crate::dump::Dump;
use crate::error::TransferError;
use crate::target::RemoteTarget;

/// Name of the predecessor link inside a dump directory.
pub const PARENT_LINK: &str = "parent";

/// Maximum size of an encoded frame header.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Copies one dump directory to a remote target.
pub trait DumpTransfer: Send + Sync {
    /// Transfer `dump` to `target`. `predecessor` is the dump's parent in the
    /// chain, if the chain still holds it.
    fn transfer_dump(
        &self,
        dump: &Dump,
        predecessor: Option<&Dump>,
        target: &RemoteTarget,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Frame header kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameHeader {
    File {
        dump: String,
        name: String,
        size: u64,
        crc32: u32,
    },
    ParentLink {
        dump: String,
        points_to: String,
    },
    Done {
        dump: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    header: FrameHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mac: Option<String>,
}

/// Receiver's verdict once a dump is complete.
#[derive(Debug, Serialize, Deserialize)]
struct TransferAck {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Optional HMAC-SHA256 authentication of frame headers.
#[derive(Clone, Default)]
pub struct FrameAuth {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for FrameAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAuth")
            .field("enabled", &self.key.is_some())
            .finish()
    }
}

impl FrameAuth {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.map(|s| s.as_bytes().to_vec()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    fn sign(&self, header: &FrameHeader) -> Result<Option<String>, TransferError> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .map_err(|_| TransferError::Unauthenticated)?;
        mac.update(&header_bytes(header)?);
        Ok(Some(hex::encode(mac.finalize().into_bytes())))
    }

    fn verify(&self, header: &FrameHeader, tag: Option<&str>) -> Result<(), TransferError> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        let tag = tag.ok_or(TransferError::Unauthenticated)?;
        let expected = hex::decode(tag).map_err(|_| TransferError::Unauthenticated)?;
        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .map_err(|_| TransferError::Unauthenticated)?;
        mac.update(&header_bytes(header)?);
        mac.verify_slice(&expected)
            .map_err(|_| TransferError::Unauthenticated)
    }
}

fn header_bytes(header: &FrameHeader) -> Result<Vec<u8>, TransferError> {
    serde_json::to_vec(header).map_err(|e| TransferError::MalformedFrame {
        reason: e.to_string(),
    })
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value).map_err(|e| TransferError::MalformedFrame {
        reason: e.to_string(),
    })?;
    if bytes.len() > MAX_HEADER_SIZE {
        return Err(TransferError::MalformedFrame {
            reason: format!("header of {} bytes exceeds {}", bytes.len(), MAX_HEADER_SIZE),
        });
    }
    writer
        .write_u32(bytes.len() as u32)
        .await
        .map_err(|e| TransferError::Io {
            context: "writing frame length",
            source: e,
        })?;
    writer.write_all(&bytes).await.map_err(|e| TransferError::Io {
        context: "writing frame",
        source: e,
    })
}

async fn read_json<R, T>(reader: &mut R) -> Result<T, TransferError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let len = reader.read_u32().await.map_err(|e| TransferError::Io {
        context: "reading frame length",
        source: e,
    })? as usize;
    if len > MAX_HEADER_SIZE {
        return Err(TransferError::MalformedFrame {
            reason: format!("header of {} bytes exceeds {}", len, MAX_HEADER_SIZE),
        });
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransferError::Io {
            context: "reading frame",
            source: e,
        })?;
    serde_json::from_slice(&buf).map_err(|e| TransferError::MalformedFrame {
        reason: e.to_string(),
    })
}

async fn write_frame<W>(
    writer: &mut W,
    auth: &FrameAuth,
    header: FrameHeader,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mac = auth.sign(&header)?;
    write_json(writer, &Frame { header, mac }).await
}

async fn read_frame<R>(reader: &mut R, auth: &FrameAuth) -> Result<FrameHeader, TransferError>
where
    R: AsyncRead + Unpin,
{
    let frame: Frame = read_json(reader).await?;
    auth.verify(&frame.header, frame.mac.as_deref())?;
    Ok(frame.header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FrameHeader {
        FrameHeader::File {
            dump: "p1".to_string(),
            name: "pages-1.img".to_string(),
            size: 4096,
            crc32: 0x1234_5678,
        }
    }

    #[test]
    fn test_auth_disabled_accepts_anything() {
        let auth = FrameAuth::new(None);
        assert!(auth.sign(&sample_header()).unwrap().is_none());
        assert!(auth.verify(&sample_header(), None).is_ok());
    }

    #[test]
    fn test_auth_rejects_wrong_key_and_tampering() {
        let sender = FrameAuth::new(Some("s3cret"));
        let tag = sender.sign(&sample_header()).unwrap();
        assert!(sender.verify(&sample_header(), tag.as_deref()).is_ok());

        let other = FrameAuth::new(Some("other"));
        assert!(other.verify(&sample_header(), tag.as_deref()).is_err());

        let tampered = FrameHeader::File {
            dump: "p1".to_string(),
            name: "pages-1.img".to_string(),
            size: 4097,
            crc32: 0x1234_5678,
        };
        assert!(sender.verify(&tampered, tag.as_deref()).is_err());
        assert!(sender.verify(&sample_header(), None).is_err());
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let auth = FrameAuth::new(Some("k"));
        write_frame(&mut a, &auth, sample_header()).await.unwrap();
        let got = read_frame(&mut b, &auth).await.unwrap();
        assert_eq!(got, sample_header());
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! RPC listener.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::message::{RpcMessage, RpcReply};

/// Longest request line accepted, newline included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Connections idle for this long are closed.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Receiver-side effects of each message.
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle a decoded request from `peer` and produce the reply.
    fn handle(&self, peer: SocketAddr, msg: RpcMessage) -> impl Future<Output = RpcReply> + Send;
}

/// Accepts connections and feeds each request line to the handler.
pub struct RpcServer<H> {
    handler: Arc<H>,
    read_timeout: Duration,
}

impl<H: RpcHandler> RpcServer<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "RPC listener started");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&self.handler);
                    let read_timeout = self.read_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(handler, stream, peer, read_timeout).await
                        {
                            tracing::debug!(peer = %peer, error = %e, "RPC connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "RPC accept failed");
                    return;
                }
            }
        }
    }
}

async fn handle_connection<H: RpcHandler>(
    handler: Arc<H>,
    stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LEN as u64);
        let n = match tokio::time::timeout(read_timeout, limited.read_line(&mut line)).await {
            Ok(read) => read?,
            Err(_) => {
                tracing::debug!(peer = %peer, "Closing idle RPC connection");
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(());
        }
        if n >= MAX_LINE_LEN && !line.ends_with('\n') {
            tracing::warn!(peer = %peer, limit = MAX_LINE_LEN, "Dropping oversized RPC message");
            return Ok(());
        }

        let msg = match RpcMessage::decode(line.trim_end_matches(&['\n', '\r'][..])) {
            Ok(msg) => msg,
            Err(e) => {
                // Dropped without a reply; the sender treats the call as failed.
                tracing::warn!(peer = %peer, error = %e, "Dropping malformed RPC message");
                return Ok(());
            }
        };

        tracing::debug!(peer = %peer, tag = msg.tag(), "Received RPC");
        let reply = handler.handle(peer, msg).await;

        let mut out = serde_json::to_string(&reply)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::error::RpcError;
    use crate::rpc::{Join, Migrate, RpcClient};

    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<&'static str>>,
    }

    impl RpcHandler for Echo {
        async fn handle(&self, _peer: SocketAddr, msg: RpcMessage) -> RpcReply {
            self.seen.lock().unwrap().push(msg.tag());
            match msg {
                RpcMessage::Join(_) => RpcReply::Joined {
                    container_id: "box".to_string(),
                },
                RpcMessage::Migrate(m) if m.dumps().len() > 3 => RpcReply::Error {
                    reason: "too many".to_string(),
                },
                _ => RpcReply::Ack,
            }
        }
    }

    async fn start() -> (Arc<Echo>, String) {
        let handler = Arc::new(Echo::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(RpcServer::new(Arc::clone(&handler)).serve(listener));
        (handler, addr)
    }

    fn client() -> RpcClient {
        RpcClient::new(Duration::from_secs(2), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_join_ping_migrate() {
        let (handler, addr) = start().await;
        let client = client();

        let id = client
            .join(&addr, Join::new(4000, "/dumps", 4001).unwrap())
            .await
            .unwrap();
        assert_eq!(id.as_str(), "box");

        client.ping(&addr).await.unwrap();

        let ok = Migrate::new(&["p1", "d2"], "box", "/b").unwrap();
        client.migrate(&addr, ok).await.unwrap();

        let rejected = Migrate::new(&["p1", "p2", "p3", "d4"], "box", "/b").unwrap();
        assert!(matches!(
            client.migrate(&addr, rejected).await,
            Err(RpcError::Rejected { .. })
        ));

        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec!["Join", "Ping", "Migrate", "Migrate"]
        );
    }

    #[tokio::test]
    async fn test_malformed_message_gets_no_reply() {
        let (handler, addr) = start().await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        stream.write_all(b"{\"tag\":\"Bogus\"}\n").await.unwrap();
        let mut buf = String::new();
        let mut reader = BufReader::new(stream);
        let n = reader.read_line(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped() {
        let (handler, addr) = start().await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let flood = vec![b'a'; MAX_LINE_LEN + 1024];
        // The server may reset the connection before the whole flood is written.
        let _ = stream.write_all(&flood).await;

        let mut buf = String::new();
        let mut reader = BufReader::new(stream);
        let read = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let handler = Arc::new(Echo::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RpcServer::new(handler).with_read_timeout(Duration::from_millis(100));
        tokio::spawn(server.serve(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = String::new();
        let mut reader = BufReader::new(stream);
        let n = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(client().ping(&addr).await.is_err());
    }
}

//! Links: a framed byte stream turned into a pair of bounded message channels.
//!
//! [`spawn_stream`] takes any `AsyncRead + AsyncWrite` (a unix socket, an
//! in-process duplex pipe) and runs one reader and one writer task over it.
//! The writer is the only task that touches the write half, so frames never
//! interleave. A frame that fails to decode or validate closes the link.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::LinkConfig;
use crate::protocol::{read_frame, write_frame, RpcMessage};

/// Shared close switch for one link. Closing stops both link tasks and
/// drops the underlying stream.
#[derive(Debug, Clone)]
pub struct LinkCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl LinkCloser {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the link is closed.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Both directions of a live link.
#[derive(Debug)]
pub struct Transport {
    /// Messages queued here are framed and written in order.
    pub outbound: mpsc::Sender<RpcMessage>,
    /// Decoded, validated messages from the peer. Yields `None` once the link is gone.
    pub inbound: mpsc::Receiver<RpcMessage>,
    pub closer: LinkCloser,
    /// Human-readable peer description for logs.
    pub peer: String,
}

/// Start the reader and writer tasks for a byte stream.
pub fn spawn_stream<S>(stream: S, peer: impl Into<String>) -> Transport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let peer = peer.into();
    let (reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel(LinkConfig::CHANNEL_SIZE);
    let (in_tx, in_rx) = mpsc::channel(LinkConfig::CHANNEL_SIZE);
    let closer = LinkCloser::new();

    tokio::spawn(read_loop(reader, in_tx, closer.clone(), peer.clone()));
    tokio::spawn(write_loop(writer, out_rx, closer.clone(), peer.clone()));

    Transport {
        outbound: out_tx,
        inbound: in_rx,
        closer,
        peer,
    }
}

/// Create a connected in-process link pair.
pub fn pipe(a_peer: &str, b_peer: &str) -> (Transport, Transport) {
    let (a, b) = tokio::io::duplex(LinkConfig::PIPE_BUFFER_SIZE);
    (spawn_stream(a, a_peer), spawn_stream(b, b_peer))
}

async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<RpcMessage>,
    closer: LinkCloser,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = closer.closed() => break,
        };

        match frame {
            Ok(Some(bytes)) => match RpcMessage::decode(&bytes) {
                Ok(msg) => {
                    tokio::select! {
                        sent = inbound.send(msg) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = closer.closed() => break,
                    }
                }
                Err(e) => {
                    warn!("Closing link {}: {}", peer, e);
                    break;
                }
            },
            Ok(None) => {
                debug!("Link {} reached EOF", peer);
                break;
            }
            Err(e) => {
                warn!("Closing link {}: {}", peer, e);
                break;
            }
        }
    }
    closer.close();
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<RpcMessage>,
    closer: LinkCloser,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = closer.closed() => break,
        };

        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping unencodable message on {}: {}", peer, e);
                continue;
            }
        };
        if let Err(e) = write_frame(&mut writer, &bytes).await {
            debug!("Write failed on link {}: {}", peer, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    closer.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_pipe_delivers_in_order() {
        let (a, mut b) = pipe("a", "b");
        for i in 0..5 {
            let msg = RpcMessage::request("tick", Some(serde_json::json!(i)), None, None, None);
            a.outbound.send(msg).await.unwrap();
        }
        for i in 0..5 {
            let msg = b.inbound.recv().await.unwrap();
            assert_eq!(msg.data, Some(serde_json::json!(i)));
        }
    }

    #[tokio::test]
    async fn test_close_reaches_peer() {
        let (a, mut b) = pipe("a", "b");
        a.closer.close();
        assert!(b.inbound.recv().await.is_none());
        assert!(b.closer.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_link() {
        let (raw, peer_side) = tokio::io::duplex(1024);
        let mut link = spawn_stream(peer_side, "peer");
        let (_raw_read, mut raw_write) = tokio::io::split(raw);

        let garbage = br#"{"cont":true}"#;
        raw_write
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        raw_write.write_all(garbage).await.unwrap();

        assert!(link.inbound.recv().await.is_none());
        assert!(link.closer.is_closed());
    }
}

//! WebSocket transport: the connection state machine's vocabulary and the
//! framed link.
//!
//! A [`TransportLink`] owns nothing after `open()` returns: the socket is
//! split into a writer task fed by an mpsc channel and a reader task feeding
//! one. Dropping the link closes both sides; a dead writer surfaces as a
//! failed [`TransportLink::send`], a dead reader as `None` from
//! [`TransportLink::recv`]. Frames are binary WebSocket messages carrying
//! bincode-encoded envelopes; everything else on the wire is ignored.

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;

/// Frames buffered per direction before backpressure.
const LINK_BUFFER: usize = 256;

// ───────────────────────────────────────────────────────────────────
// Connection state
// ───────────────────────────────────────────────────────────────────

/// Session connection lifecycle.
///
/// `Disconnected` is both the initial state and the terminal one after an
/// exhausted retry budget or an explicit disconnect; only a user-triggered
/// connect leaves it. `Reconnecting` means a retry timer is pending or a
/// dial attempt is in flight after a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Framed link
// ───────────────────────────────────────────────────────────────────

/// One live WebSocket connection, split into background reader and writer
/// tasks.
pub struct TransportLink {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl TransportLink {
    /// Dial `url` and spawn the reader and writer tasks. A dial that does
    /// not complete within `connect_timeout` counts as a transport failure.
    pub async fn open(url: &str, connect_timeout: Duration) -> Result<Self, SyncError> {
        let dial = tokio_tungstenite::connect_async(url);
        let (ws_stream, _) = tokio::time::timeout(connect_timeout, dial)
            .await
            .map_err(|_| SyncError::Transport(format!("connect to {url} timed out")))?
            .map_err(|e| SyncError::Transport(format!("connect to {url} failed: {e}")))?;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(LINK_BUFFER);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(LINK_BUFFER);
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.into()).await.is_err() {
                            // Link was dropped on our side.
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    /// Queue one binary frame for the writer task. An error means the
    /// socket's write half is gone and the link should be torn down.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), SyncError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SyncError::Transport("link writer closed".into()))
    }

    /// Next inbound frame, or `None` once the link is down.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

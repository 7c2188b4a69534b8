use crate::capture::AudioChunk;
use crate::error::{DictationError, Result};
use crate::protocol::ServerMsg;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ACCESS_DENIED: u16 = 1008;

/// Lifecycle events reported by a transport session.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Message(ServerMsg),
    Closed { code: u16, reason: String },
    Failed(String),
}

#[derive(Debug)]
pub(crate) enum SendCmd {
    Chunk(AudioChunk),
    Close,
}

/// Session parameters reported by the service at accept time. Immutable for
/// the session's lifetime.
#[derive(Clone, Debug)]
pub struct Accepted {
    pub tier: String,
    pub max_duration_seconds: u64,
}

/// Opens one duplex connection per call. The indirection keeps the session
/// controller testable without a network.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, credential: &str) -> Result<TransportHandle>;
}

/// Outbound half of a transport session. Cheap to clone; sends after the
/// connection has closed are dropped, never queued.
#[derive(Clone, Debug)]
pub struct ChunkSender {
    tx: mpsc::Sender<SendCmd>,
}

impl ChunkSender {
    pub async fn send(&self, chunk: AudioChunk) -> Result<()> {
        self.tx
            .send(SendCmd::Chunk(chunk))
            .await
            .map_err(|_| DictationError::ConnectionLost("transport send loop ended".to_string()))
    }

    pub async fn close(&self) {
        let _ = self.tx.send(SendCmd::Close).await;
    }
}

/// One duplex connection to the transcription service, owned for the
/// lifetime of one session.
pub struct TransportHandle {
    sender: ChunkSender,
    events: mpsc::Receiver<TransportEvent>,
}

impl TransportHandle {
    pub(crate) fn from_parts(
        tx: mpsc::Sender<SendCmd>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            sender: ChunkSender { tx },
            events,
        }
    }

    pub fn sender(&self) -> ChunkSender {
        self.sender.clone()
    }

    /// Await the handshake: exactly one `SessionAccepted` must arrive before
    /// anything else. Any other message, or a close or failure first, is a
    /// handshake failure and the session never becomes ready.
    pub async fn ready(&mut self) -> Result<Accepted> {
        match self.events.recv().await {
            Some(TransportEvent::Message(ServerMsg::SessionAccepted {
                tier,
                max_duration_seconds,
            })) => Ok(Accepted {
                tier,
                max_duration_seconds,
            }),
            Some(TransportEvent::Message(other)) => Err(DictationError::Protocol(format!(
                "expected session accept as the first message, got {}",
                other.kind()
            ))),
            Some(TransportEvent::Closed { code, reason }) => Err(close_error(code, &reason)),
            Some(TransportEvent::Failed(reason)) => Err(DictationError::Handshake(reason)),
            None => Err(DictationError::Handshake(
                "connection ended before the session was accepted".to_string(),
            )),
        }
    }

    /// Next inbound event after the handshake. `None` once the connection's
    /// io loop has ended.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Map a websocket close to the error a caller should see. Access-denied
/// closes get their own variant so callers can route to billing instead of
/// offering a retry.
pub fn close_error(code: u16, reason: &str) -> DictationError {
    let reason = reason.trim();
    let suffix = if reason.is_empty() {
        String::new()
    } else {
        format!(" (reason: {reason})")
    };

    match code {
        CLOSE_ACCESS_DENIED => DictationError::AccessDenied(format!(
            "the service refused the session (close code {code}){suffix}"
        )),
        code => {
            DictationError::ConnectionLost(format!("websocket closed (code {code}){suffix}"))
        }
    }
}

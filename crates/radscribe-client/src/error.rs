use thiserror::Error;

pub type Result<T> = std::result::Result<T, DictationError>;

/// Failure taxonomy for a dictation session. Every variant is fatal to the
/// session it occurred in; none of them trigger an automatic retry.
#[derive(Debug, Error)]
pub enum DictationError {
    /// The runtime cannot capture audio: no input device, no supported
    /// encoding, or permission denied.
    #[error("audio capture unavailable: {0}")]
    Capability(String),

    /// The connection failed before the service accepted the session.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The service refused the supplied credential.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The connection dropped while the session was live.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// An inbound message violated the wire contract.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

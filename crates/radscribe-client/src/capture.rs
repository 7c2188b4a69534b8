use crate::error::Result;

use async_trait::async_trait;
use std::sync::Arc;

pub mod level;
pub use level::{AudioLevel, LevelMeter};

#[cfg(feature = "mic")]
pub mod mic;

#[cfg(feature = "mic")]
pub use mic::{MicCapture, MicCaptureFactory};

/// One bounded unit of encoded audio handed from capture to transport.
///
/// A zero-byte chunk is a valid "no data yet" signal; it must still be
/// forwarded to keep the remote session alive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioChunk {
    bytes: Vec<u8>,
}

impl AudioChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Acquires audio input devices. The capability probe lets the session
/// controller fail fast before it opens a transport.
#[async_trait]
pub trait CaptureFactory: Send + Sync {
    /// Whether the runtime exposes an audio capture capability at all.
    fn is_available(&self) -> bool;

    /// Acquire the device and start emitting chunks. Returns the chunk
    /// stream and a control handle usable from other tasks.
    async fn open(&self) -> Result<(Box<dyn CaptureStream>, Arc<dyn CaptureControl>)>;
}

/// The receiving half of an open capture: a sequence of encoded chunks on a
/// fixed cadence, plus whatever an out-of-band flush produces.
#[async_trait]
pub trait CaptureStream: Send {
    /// Next encoded chunk. Returns `None` once capture has stopped or the
    /// device has gone away.
    async fn recv(&mut self) -> Option<AudioChunk>;
}

/// The controlling half of an open capture.
pub trait CaptureControl: Send + Sync {
    /// Request the encoder emit whatever it has buffered, even if the
    /// regular cadence has not come around yet.
    fn flush(&self);

    /// Release the device. No chunk is emitted after this returns.
    fn stop(&self);
}

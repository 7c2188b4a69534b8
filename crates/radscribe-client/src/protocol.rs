use crate::error::{DictationError, Result};
use serde::{Deserialize, Serialize};

/// Inbound protocol messages, discriminated by a `type` field.
///
/// Exactly one `SessionAccepted` is expected as the first message of a
/// session; anything else arriving before it is a protocol violation.
/// Outbound frames are raw audio chunk payloads and have no struct here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    SessionAccepted {
        tier: String,
        max_duration_seconds: u64,
    },

    Transcript {
        text: String,
        is_final: bool,
    },

    DurationLimitReached {
        message: String,
    },

    Error {
        message: String,
    },
}

impl ServerMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMsg::SessionAccepted { .. } => "session accept",
            ServerMsg::Transcript { .. } => "transcript",
            ServerMsg::DurationLimitReached { .. } => "duration limit",
            ServerMsg::Error { .. } => "service error",
        }
    }
}

pub fn decode_server_msg(text: &str) -> Result<ServerMsg> {
    serde_json::from_str(text)
        .map_err(|e| DictationError::Protocol(format!("malformed protocol message: {e}")))
}

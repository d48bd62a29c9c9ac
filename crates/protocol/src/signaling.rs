use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alphabet for room codes: A-Z without I/O, digits 2-9.
/// Excludes every glyph that reads ambiguously (0/O, 1/I/l).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a room code.
pub const ROOM_CODE_LEN: usize = 6;

/// Returns true if `code` is a well-formed room code.
pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN && code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b))
}

/// Envelope exchanged with the HTTPS signaling host. The gateway treats
/// `payload` as opaque except for the typed accessors below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Room code, e.g. "ABCDE2".
    pub room: String,
    /// Peer id assigned by the signaling host.
    pub peer: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Join,
    Leave,
}

/// Payload of `offer` / `answer` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

/// Payload of `candidate` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Payload of `join` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub name: String,
    /// Join as a spectator instead of requesting a player slot.
    #[serde(default)]
    pub spectator: bool,
}

impl SignalEnvelope {
    pub fn new(kind: SignalKind, room: &str, peer: Uuid, payload: impl Serialize) -> Self {
        Self {
            kind,
            room: room.to_string(),
            peer,
            payload: serde_json::to_value(payload).ok(),
        }
    }

    /// Decode the payload as a concrete type.
    pub fn decode_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T, SignalError> {
        let value = self.payload.as_ref().ok_or(SignalError::MissingPayload)?;
        T::deserialize(value).map_err(|e| SignalError::BadPayload(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("envelope has no payload")]
    MissingPayload,
    #[error("malformed payload: {0}")]
    BadPayload(String),
    #[error("unknown room {0}")]
    UnknownRoom(String),
    #[error("unknown peer {0}")]
    UnknownPeer(Uuid),
}

//! JSON framing for envelopes crossing a process boundary.

use crate::error::SyncError;
use crate::message::Envelope;

pub fn encode(envelope: &Envelope) -> Result<String, SyncError> {
    serde_json::to_string(envelope).map_err(SyncError::Codec)
}

/// Parses one frame.
///
/// Frames that are valid JSON but do not describe a known message are
/// reported as [`SyncError::ProtocolMismatch`] so the receiver can skip them.
pub fn decode(frame: &str) -> Result<Envelope, SyncError> {
    serde_json::from_str(frame).map_err(|err| {
        if err.is_data() {
            SyncError::ProtocolMismatch(err.to_string())
        } else {
            SyncError::Codec(err)
        }
    })
}

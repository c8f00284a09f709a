/// Failures raised by the synchronization link.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The peer speaks a different protocol or sent a payload we cannot use.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("sync channel '{0}' disconnected")]
    Disconnected(&'static str),
    #[error("failed to encode or decode sync message")]
    Codec(#[source] serde_json::Error),
}

//! Error taxonomy for the transport core.

use thiserror::Error;

/// Errors surfaced by the crypto, transport, discovery and session layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Room ID failed prefix/length/base58 validation.
    #[error("invalid room ID format")]
    InvalidRoomId,

    /// No port in the configured range could be bound on both UDP and TCP.
    #[error("no available port found in range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },

    /// An operation required an established connection and there was none.
    #[error("connection not established")]
    NotConnected,

    /// A frame failed to decode or violated protocol rules; the frame is
    /// dropped but the connection survives.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A Dilithium signature did not verify.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The announcement carried an access key that does not match the room's.
    #[error("invalid room access key")]
    AccessKeyMismatch,

    /// The announcement targeted a different room than the one we host.
    #[error("room ID mismatch: expected {expected}, got {got}")]
    RoomIdMismatch { expected: String, got: String },

    /// The remote TLS certificate hash differs from the announced
    /// fingerprint. Tears the connection down.
    #[error("TLS certificate fingerprint mismatch; possible MITM")]
    PossibleMitm,

    /// No hole-punch confirmation arrived within the overall deadline.
    #[error("timeout during UDP hole punching")]
    HolePunchTimeout,

    /// Every discovery strategy was exhausted without a working address.
    #[error("all connection methods failed; try a direct address")]
    DiscoveryExhausted,

    /// The signalling server could not be reached or answered with an error.
    #[error("signalling server unavailable: {0}")]
    SignallingUnavailable(String),

    /// The signalling server has no registration for the room.
    #[error("room {0} not registered on the signalling server")]
    RoomNotFound(String),

    /// Key rotation could not complete for at least one peer.
    #[error("key rotation failed: {0}")]
    KeyRotationFailed(String),

    /// The QUIC connection was closed underneath us.
    #[error("transport closed")]
    TransportClosed,

    /// Raw cryptographic failure (bad key/ciphertext bytes, AEAD error).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Inner payload (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_cbor::Error> for Error {
    fn from(e: serde_cbor::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Codec(e.to_string())
    }
}

impl Error {
    /// True for frame-level failures that are logged and dropped without
    /// affecting the connection.
    pub fn is_frame_level(&self) -> bool {
        matches!(
            self,
            Error::InvalidFrame(_) | Error::SignatureInvalid | Error::Codec(_)
        )
    }
}

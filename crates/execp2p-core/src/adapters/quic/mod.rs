//! QUIC transport adapter (Quinn) with pinning-only TLS.

pub mod tls;
pub mod transport;

pub use transport::{ConnectionState, QuicTransport};

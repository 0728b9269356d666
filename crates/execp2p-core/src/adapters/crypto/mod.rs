//! Post-quantum crypto adapters: Kyber-1024 + Dilithium-5 identity and
//! ChaCha20-Poly1305 session framing.

pub mod identity;
pub mod session;

pub use identity::PqIdentity;
pub use session::SessionCrypto;

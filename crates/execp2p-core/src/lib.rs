//! execp2p-core — serverless, post-quantum, end-to-end encrypted P2P chat.
//!
//! # Architecture
//!
//! - **domain**: rooms, identifiers, wire frames, error taxonomy (no I/O).
//! - **application**: session orchestrator, event bus, status surface.
//! - **adapters**: crypto (Kyber-1024 + Dilithium-5 + ChaCha20-Poly1305),
//!   QUIC transport (Quinn, pinning-only TLS), discovery (mDNS, UDP
//!   broadcast, mainline DHT, STUN, hole punching, signalling).

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;

pub use application::{AppEvent, CreateRoomResult, EventBus, Session};
pub use config::Config;
pub use domain::error::{Error, Result};

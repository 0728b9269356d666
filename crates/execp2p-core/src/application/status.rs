//! Status and security snapshots handed to front ends.

use std::collections::HashMap;

use serde::Serialize;

/// Pull-style connection status, also pushed periodically on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub peer_id: String,
    pub listen_port: u16,
    pub room_id: String,
    pub connected_peers: usize,
    pub verified_peers: usize,
    pub e2e_encryption: bool,
    pub is_running: bool,
    pub is_listener: bool,
}

/// Algorithm suite in use; fixed for the lifetime of the build.
#[derive(Debug, Clone, Serialize)]
pub struct EncryptionAlgorithms {
    pub key_exchange: &'static str,
    pub signatures: &'static str,
    pub symmetric: &'static str,
}

impl Default for EncryptionAlgorithms {
    fn default() -> Self {
        Self {
            key_exchange: "CRYSTALS-Kyber-1024",
            signatures: "CRYSTALS-DILITHIUM-5",
            symmetric: "ChaCha20-Poly1305",
        }
    }
}

/// Room details exposed only to the room's creator.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub access_key: Option<String>,
    pub is_private: bool,
}

/// Security overview for the UI's lock icon and fingerprint dialog.
#[derive(Debug, Clone, Serialize)]
pub struct SecuritySummary {
    pub encryption_algorithms: EncryptionAlgorithms,
    pub identity_fingerprint: String,
    pub peer_fingerprints: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_info: Option<RoomSummary>,
}

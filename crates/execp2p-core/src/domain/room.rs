//! Room identity: ID generation/validation, access keys, discovery hashes.
//!
//! Pure data — no I/O.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{Error, Result};

/// Total room ID length in characters, prefix included.
pub const ROOM_ID_LENGTH: usize = 32;

/// Prefix for all ExecP2P room IDs.
pub const ROOM_ID_PREFIX: &str = "ExecP2P_";

/// Maximum access key length in characters.
pub const ACCESS_KEY_MAX_LENGTH: usize = 24;

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A chat room and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: i64,
    pub max_peers: usize,
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

impl Room {
    /// Create a new room; private rooms get a fresh access key.
    pub fn new(name: &str, description: &str, max_peers: usize, is_private: bool) -> Self {
        Self {
            id: generate_room_id(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: unix_now(),
            max_peers,
            is_private,
            access_key: is_private.then(generate_access_key),
            listen_port: None,
        }
    }

    /// Build the joiner-side view of a room we have not reached yet.
    pub fn for_join(room_id: &str, max_peers: usize, access_key: &str) -> Self {
        Self {
            id: room_id.to_string(),
            name: "ExecP2P Chat".to_string(),
            description: String::new(),
            created_at: unix_now(),
            max_peers,
            is_private: true,
            access_key: Some(access_key.to_string()),
            listen_port: None,
        }
    }

    /// Replace the access key. Listener-only; public rooms have no key.
    pub fn regenerate_access_key(&mut self) -> Result<&str> {
        if !self.is_private {
            return Err(Error::KeyRotationFailed(
                "cannot generate an access key for a public room".into(),
            ));
        }
        self.access_key = Some(generate_access_key());
        Ok(self.access_key.as_deref().unwrap_or_default())
    }

    /// Public rooms accept anything; private rooms compare exactly.
    pub fn validate_access_key(&self, key: &str) -> bool {
        match &self.access_key {
            None => true,
            Some(expected) => expected == key,
        }
    }

    /// Shortened ID for display: first 8 + "..." + last 8.
    pub fn short_id(&self) -> String {
        if self.id.len() > 16 {
            format!("{}...{}", &self.id[..8], &self.id[self.id.len() - 8..])
        } else {
            self.id.clone()
        }
    }

    /// mDNS service type for this room.
    pub fn service_name(&self) -> String {
        format!("_execp2p_{}._tcp", discovery_hash(&self.id))
    }
}

// ---------------------------------------------------------------------------
// Room ID
// ---------------------------------------------------------------------------

/// Generate a room ID from fresh OS randomness (192 bits of entropy).
pub fn generate_room_id() -> String {
    let mut seed = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut seed);
    generate_room_id_from_seed(&seed)
}

/// Deterministic variant: `ExecP2P_` + base58(seed) padded/truncated so the
/// total length is exactly [`ROOM_ID_LENGTH`].
pub fn generate_room_id_from_seed(seed: &[u8; 24]) -> String {
    let target = ROOM_ID_LENGTH - ROOM_ID_PREFIX.len();
    let mut encoded = bs58::encode(seed).into_string();
    while encoded.len() < target {
        let mut padding = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut padding);
        encoded.push_str(&bs58::encode(padding).into_string());
    }
    encoded.truncate(target);
    format!("{ROOM_ID_PREFIX}{encoded}")
}

/// Check prefix, exact length, and base58 decodability of the suffix.
pub fn validate_room_id(room_id: &str) -> bool {
    if !room_id.starts_with(ROOM_ID_PREFIX) || room_id.len() != ROOM_ID_LENGTH {
        return false;
    }
    let encoded = &room_id[ROOM_ID_PREFIX.len()..];
    match bs58::decode(encoded).into_vec() {
        Ok(decoded) => !decoded.is_empty(),
        Err(_) => false,
    }
}

/// BitTorrent-compatible info hash: first 20 bytes of SHA-256(room_id), hex.
pub fn info_hash(room_id: &str) -> String {
    let hash = Sha256::digest(room_id.as_bytes());
    hex::encode(&hash[..20])
}

/// Short discovery hash for mDNS service names: first 8 bytes, hex.
pub fn discovery_hash(room_id: &str) -> String {
    let hash = Sha256::digest(room_id.as_bytes());
    hex::encode(&hash[..8])
}

/// Random base58 access key, at most [`ACCESS_KEY_MAX_LENGTH`] characters.
pub fn generate_access_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut key = bs58::encode(bytes).into_string();
    key.truncate(ACCESS_KEY_MAX_LENGTH);
    key
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn generated_room_ids_round_trip() {
        for _ in 0..100 {
            let mut seed = [0u8; 24];
            rand::thread_rng().fill_bytes(&mut seed);
            let id = generate_room_id_from_seed(&seed);
            assert_eq!(id.len(), ROOM_ID_LENGTH);
            assert!(validate_room_id(&id), "round-trip failed for {id}");
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!validate_room_id(""));
        assert!(!validate_room_id("ExecP2P_"));
        assert!(!validate_room_id("ExecP2P_short"));
        // correct length, wrong prefix
        assert!(!validate_room_id("BadPref_5K3mW8qPzR7vT2nY4cF6hJ9x"));
        // base58 excludes 0, O, I, l
        assert!(!validate_room_id("ExecP2P_0000000000000000000000O0"));
    }

    #[test]
    fn access_key_is_bounded_base58() {
        for _ in 0..50 {
            let key = generate_access_key();
            assert!(key.len() <= ACCESS_KEY_MAX_LENGTH);
            assert!(bs58::decode(&key).into_vec().is_ok());
        }
    }

    #[test]
    fn hashes_have_expected_widths() {
        let id = generate_room_id();
        assert_eq!(info_hash(&id).len(), 40);
        assert_eq!(discovery_hash(&id).len(), 16);
        // stable for the same input
        assert_eq!(info_hash(&id), info_hash(&id));
    }

    #[test]
    fn private_room_gets_key_public_does_not() {
        let private = Room::new("a", "b", 2, true);
        assert!(private.access_key.is_some());
        assert!(private.validate_access_key(private.access_key.as_ref().unwrap()));
        assert!(!private.validate_access_key("zzz"));

        let public = Room::new("a", "b", 2, false);
        assert!(public.access_key.is_none());
        assert!(public.validate_access_key("anything"));
    }

    #[test]
    fn regenerate_invalidates_old_key() {
        let mut room = Room::new("a", "b", 2, true);
        let old = room.access_key.clone().unwrap();
        room.regenerate_access_key().unwrap();
        assert!(!room.validate_access_key(&old));
    }

    #[test]
    fn service_name_embeds_discovery_hash() {
        let room = Room::new("a", "b", 2, false);
        assert_eq!(
            room.service_name(),
            format!("_execp2p_{}._tcp", discovery_hash(&room.id))
        );
    }
}

//! Wire formats: the outer JSON envelope, the CBOR inner frames, and the
//! UDP discovery datagrams.
//!
//! Every QUIC stream carries exactly one [`Envelope`]. The envelope's
//! `payload` is the hex encoding of a CBOR-serialized inner frame; which
//! frame depends on `frame_type`. `room_id`/`access_key` are populated only
//! on announcements.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{Error, Result};
use super::room::unix_now;

/// Upper bound for one serialized envelope: 10 MiB of chat plaintext
/// survives CBOR + hex doubling + JSON overhead within this limit.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Announcement,
    Keyexchange,
    Message,
}

/// Outer JSON wrapper sent over each QUIC stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Hex-encoded CBOR of the inner frame.
    pub payload: String,
    pub timestamp: i64,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key: String,
}

impl Envelope {
    pub fn new(frame_type: FrameType, inner: &[u8], sender_id: &str) -> Self {
        Self {
            frame_type,
            payload: hex::encode(inner),
            timestamp: unix_now(),
            sender_id: sender_id.to_string(),
            room_id: String::new(),
            access_key: String::new(),
        }
    }

    /// Attach routing fields; only announcements carry them.
    pub fn with_room(mut self, room_id: &str, access_key: &str) -> Self {
        self.room_id = room_id.to_string();
        self.access_key = access_key.to_string();
        self
    }

    /// Decode the hex payload back to inner-frame bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        Ok(hex::decode(&self.payload)?)
    }
}

// ---------------------------------------------------------------------------
// Inner frames (CBOR)
// ---------------------------------------------------------------------------

/// First signed frame after a QUIC session opens. Binds the peer ID, the
/// long-lived Dilithium key, the Kyber key and the TLS certificate hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: String,
    pub sig_public_key: Vec<u8>,
    pub kem_public_key: Vec<u8>,
    pub tls_cert_fingerprint: String,
    pub nonce: u64,
    pub timestamp: i64,
    pub signature: Vec<u8>,
}

impl PeerAnnouncement {
    /// Digest covered by the signature: every field preceding it, under a
    /// domain-separation label.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"execp2p/announcement/v1");
        hasher.update(self.peer_id.as_bytes());
        hasher.update(&self.sig_public_key);
        hasher.update(&self.kem_public_key);
        hasher.update(self.tls_cert_fingerprint.as_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.finalize().to_vec()
    }
}

/// Signed KEM encapsulation establishing (or rotating) directional keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchange {
    pub sender_id: String,
    pub receiver_id: String,
    pub epoch: u64,
    pub kem_ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

impl KeyExchange {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"execp2p/keyexchange/v1");
        hasher.update(self.sender_id.as_bytes());
        hasher.update(self.receiver_id.as_bytes());
        hasher.update(self.epoch.to_be_bytes());
        hasher.update(&self.kem_ciphertext);
        hasher.finalize().to_vec()
    }
}

/// AEAD-sealed chat frame. The nonce is the per-(sender, epoch) counter;
/// the AAD is `sender_id || timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub epoch: u64,
    pub counter: u64,
    pub timestamp: i64,
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    pub fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.sender_id.len() + 8);
        aad.extend_from_slice(self.sender_id.as_bytes());
        aad.extend_from_slice(&self.timestamp.to_be_bytes());
        aad
    }
}

/// Decrypted chat payload handed to the application. The `message` body is
/// opaque UTF-8; front ends may layer their own JSON sub-protocol inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub sender_id: String,
    pub message: String,
    pub timestamp: i64,
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_cbor::to_vec(value)?)
}

pub fn from_cbor<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_cbor::from_slice(bytes).map_err(|e| Error::InvalidFrame(e.to_string()))
}

// ---------------------------------------------------------------------------
// UDP discovery datagrams
// ---------------------------------------------------------------------------

/// Hole-punch datagram kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PunchKind {
    Punch,
    Pong,
    Connected,
}

/// JSON datagram exchanged during UDP hole punching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchMessage {
    #[serde(rename = "type")]
    pub kind: PunchKind,
    #[serde(default)]
    pub sender_addr: String,
    pub room_id: String,
    pub port: u16,
}

/// LAN broadcast beacon sent by joiners on port 19847.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastBeacon {
    pub room_id: String,
    pub port: u16,
}

/// Reply from a listener to a matching beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastReply {
    pub room_id: String,
    #[serde(default)]
    pub host: String,
    pub port: u16,
}

// ---------------------------------------------------------------------------
// Signalling DTOs
// ---------------------------------------------------------------------------

/// Body of `POST /api/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRegistration {
    pub room_id: String,
    pub public_addr: String,
    pub is_nated: bool,
    pub stun_addr: String,
    pub behind_sym_nat: bool,
    pub creation_time: i64,
    pub expiration_time: i64,
}

/// Response of `GET /api/room/{room_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub public_addrs: Vec<String>,
    pub last_seen: i64,
    pub behind_sym_nat: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_json_round_trip() {
        let env = Envelope::new(FrameType::Announcement, b"\x01\x02\xff", "abcd1234")
            .with_room("ExecP2P_test", "secret");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"announcement\""));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload_bytes().unwrap(), b"\x01\x02\xff");
        assert_eq!(back.room_id, "ExecP2P_test");
        assert_eq!(back.access_key, "secret");
    }

    #[test]
    fn non_announcement_omits_routing_fields() {
        let env = Envelope::new(FrameType::Message, b"x", "abcd1234");
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("room_id"));
        assert!(!json.contains("access_key"));
    }

    #[test]
    fn announcement_signing_bytes_cover_all_fields() {
        let mut ann = PeerAnnouncement {
            peer_id: "p".into(),
            sig_public_key: vec![1, 2, 3],
            kem_public_key: vec![4, 5],
            tls_cert_fingerprint: "fp".into(),
            nonce: 7,
            timestamp: 1000,
            signature: vec![],
        };
        let a = ann.signing_bytes();
        ann.tls_cert_fingerprint = "other".into();
        assert_ne!(a, ann.signing_bytes());
        ann.tls_cert_fingerprint = "fp".into();
        ann.nonce = 8;
        assert_ne!(a, ann.signing_bytes());
    }

    #[test]
    fn punch_message_uses_lowercase_type_tags() {
        let msg = PunchMessage {
            kind: PunchKind::Pong,
            sender_addr: "1.2.3.4:5".into(),
            room_id: "r".into(),
            port: 9000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"pong\""));
        let back: PunchMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, PunchKind::Pong);
    }

    #[test]
    fn cbor_round_trip_key_exchange() {
        let kx = KeyExchange {
            sender_id: "a".into(),
            receiver_id: "b".into(),
            epoch: 1,
            kem_ciphertext: vec![9; 16],
            signature: vec![1; 8],
        };
        let bytes = to_cbor(&kx).unwrap();
        let back: KeyExchange = from_cbor(&bytes).unwrap();
        assert_eq!(back.epoch, 1);
        assert_eq!(back.kem_ciphertext, kx.kem_ciphertext);
    }
}

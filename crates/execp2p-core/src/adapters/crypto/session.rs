//! Per-peer session crypto: announcement verification, KEM key exchange,
//! directional-key derivation, AEAD chat framing, replay defence, rotation.
//!
//! Each direction of a session is keyed by its own encapsulation: the
//! sender encapsulates to the receiver's announced Kyber key, expands the
//! shared secret with HKDF, and seals with its outbound key; the receiver
//! derives the same key from the decapsulated secret. Rotating re-runs the
//! encapsulation for the outbound direction and bumps its epoch.

use std::collections::HashMap;
use std::time::Instant;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::error::{Error, Result};
use crate::domain::identity::identity_fingerprint;
use crate::domain::room::unix_now;
use crate::domain::wire::{EncryptedMessage, KeyExchange, MessagePayload, PeerAnnouncement};

use super::identity::{encapsulate, verify_signature, PqIdentity};

/// HKDF salt; domain-separates session keys from any other use of the KEM
/// shared secret.
const SESSION_KDF_LABEL: &[u8] = b"execp2p/session/v1";

/// Minimum interval between effective key rotations.
const ROTATION_MIN_INTERVAL_SECS: u64 = 60;

/// Clock-skew window for announcement timestamps.
const ANNOUNCEMENT_MAX_SKEW_SECS: i64 = 5 * 60;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// One 32-byte AEAD key; wiped on drop so rotated-away epochs stay dead.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SessionKey([u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(***)")
    }
}

/// Expand a KEM shared secret into the two directional keys. Both parties
/// compute the same pair; direction selection happens at the call site.
fn expand_directional_keys(
    shared_secret: &[u8; 32],
    peer_a: &str,
    peer_b: &str,
) -> (SessionKey, SessionKey) {
    let (low, high) = if peer_a <= peer_b {
        (peer_a, peer_b)
    } else {
        (peer_b, peer_a)
    };
    let mut info = Vec::with_capacity(low.len() + high.len());
    info.extend_from_slice(low.as_bytes());
    info.extend_from_slice(high.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(SESSION_KDF_LABEL), shared_secret);
    let mut okm = [0u8; 64];
    hk.expand(&info, &mut okm)
        .expect("64 bytes is a valid HKDF-SHA256 output length");

    let mut low_to_high = [0u8; 32];
    let mut high_to_low = [0u8; 32];
    low_to_high.copy_from_slice(&okm[..32]);
    high_to_low.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (SessionKey(low_to_high), SessionKey(high_to_low))
}

/// Pick the `local -> remote` key out of the expanded pair.
fn outbound_key(shared_secret: &[u8; 32], local: &str, remote: &str) -> SessionKey {
    let (low_to_high, high_to_low) = expand_directional_keys(shared_secret, local, remote);
    if local <= remote {
        low_to_high
    } else {
        high_to_low
    }
}

fn counter_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(bytes)
}

// ---------------------------------------------------------------------------
// Peer session state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PeerSession {
    sig_public_key: Vec<u8>,
    kem_public_key: Vec<u8>,
    tls_cert_fingerprint: String,
    fingerprint: String,
    /// Our outbound key (us -> peer) and its epoch/counter.
    tx_key: Option<SessionKey>,
    tx_epoch: u64,
    send_counter: u64,
    /// Peer's outbound key (peer -> us), epoch, and the replay cursor.
    rx_key: Option<SessionKey>,
    rx_epoch: u64,
    highest_recv_counter: u64,
}

impl PeerSession {
    fn verified(&self) -> bool {
        self.rx_key.is_some()
    }
}

// ---------------------------------------------------------------------------
// SessionCrypto
// ---------------------------------------------------------------------------

/// Owns the local identity and all per-peer session state.
pub struct SessionCrypto {
    identity: PqIdentity,
    peers: RwLock<HashMap<String, PeerSession>>,
    last_rotation: Mutex<Option<Instant>>,
}

impl SessionCrypto {
    pub fn new() -> Self {
        Self {
            identity: PqIdentity::generate(),
            peers: RwLock::new(HashMap::new()),
            last_rotation: Mutex::new(None),
        }
    }

    pub fn local_peer_id(&self) -> String {
        self.identity.peer_id().as_str().to_string()
    }

    pub fn identity_fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    // -- Announcements --

    /// Build our signed announcement, binding identity keys to the TLS cert.
    pub fn create_announcement(&self, tls_cert_fingerprint: &str) -> PeerAnnouncement {
        let mut announcement = PeerAnnouncement {
            peer_id: self.local_peer_id(),
            sig_public_key: self.identity.sig_public_bytes(),
            kem_public_key: self.identity.kem_public_bytes(),
            tls_cert_fingerprint: tls_cert_fingerprint.to_string(),
            nonce: rand::thread_rng().next_u64(),
            timestamp: unix_now(),
            signature: Vec::new(),
        };
        announcement.signature = self.identity.sign(&announcement.signing_bytes());
        announcement
    }

    /// Validate a peer announcement and record the peer. Returns `true` if
    /// the peer was newly added; repeated announcements are no-ops.
    pub fn process_announcement(&self, announcement: &PeerAnnouncement) -> Result<bool> {
        let skew = (unix_now() - announcement.timestamp).abs();
        if skew > ANNOUNCEMENT_MAX_SKEW_SECS {
            return Err(Error::InvalidFrame(format!(
                "announcement timestamp skewed by {skew}s"
            )));
        }

        verify_signature(
            &announcement.sig_public_key,
            &announcement.signing_bytes(),
            &announcement.signature,
        )?;

        let mut peers = self.peers.write();
        if peers.contains_key(&announcement.peer_id) {
            return Ok(false);
        }
        peers.insert(
            announcement.peer_id.clone(),
            PeerSession {
                sig_public_key: announcement.sig_public_key.clone(),
                kem_public_key: announcement.kem_public_key.clone(),
                tls_cert_fingerprint: announcement.tls_cert_fingerprint.clone(),
                fingerprint: identity_fingerprint(&announcement.sig_public_key),
                tx_key: None,
                tx_epoch: 0,
                send_counter: 0,
                rx_key: None,
                rx_epoch: 0,
                highest_recv_counter: 0,
            },
        );
        Ok(true)
    }

    /// Compare the live TLS certificate hash against the announced one.
    pub fn verify_tls_binding(&self, peer_id: &str, remote_cert_fingerprint: &str) -> Result<()> {
        let peers = self.peers.read();
        let peer = peers
            .get(peer_id)
            .ok_or_else(|| Error::InvalidFrame(format!("unknown peer {peer_id}")))?;
        if peer.tls_cert_fingerprint != remote_cert_fingerprint {
            return Err(Error::PossibleMitm);
        }
        Ok(())
    }

    // -- Key exchange --

    /// Encapsulate to the peer's Kyber key, install our new outbound key,
    /// and return the signed frame to send.
    pub fn initiate_key_exchange(&self, peer_id: &str) -> Result<KeyExchange> {
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::InvalidFrame(format!("unknown peer {peer_id}")))?;

        let (ciphertext, shared_secret) = encapsulate(&peer.kem_public_key)?;
        let local_id = self.local_peer_id();
        let key = outbound_key(&shared_secret, &local_id, peer_id);

        peer.tx_epoch += 1;
        peer.tx_key = Some(key);
        peer.send_counter = 0;

        let mut exchange = KeyExchange {
            sender_id: local_id,
            receiver_id: peer_id.to_string(),
            epoch: peer.tx_epoch,
            kem_ciphertext: ciphertext,
            signature: Vec::new(),
        };
        exchange.signature = self.identity.sign(&exchange.signing_bytes());
        Ok(exchange)
    }

    /// Verify and apply a peer's key exchange: decapsulate, install the
    /// inbound key for that direction, reset the replay cursor.
    pub fn process_key_exchange(&self, exchange: &KeyExchange) -> Result<()> {
        let local_id = self.local_peer_id();
        if exchange.receiver_id != local_id {
            return Err(Error::InvalidFrame(format!(
                "key exchange addressed to {}",
                exchange.receiver_id
            )));
        }

        let mut peers = self.peers.write();
        let peer = peers.get_mut(&exchange.sender_id).ok_or_else(|| {
            Error::InvalidFrame("key exchange from unannounced peer".to_string())
        })?;

        verify_signature(
            &peer.sig_public_key,
            &exchange.signing_bytes(),
            &exchange.signature,
        )?;

        if exchange.epoch <= peer.rx_epoch {
            return Err(Error::InvalidFrame(format!(
                "key exchange epoch {} not newer than {}",
                exchange.epoch, peer.rx_epoch
            )));
        }

        let shared_secret = self.identity.decapsulate(&exchange.kem_ciphertext)?;
        let key = outbound_key(&shared_secret, &exchange.sender_id, &local_id);

        peer.rx_key = Some(key);
        peer.rx_epoch = exchange.epoch;
        peer.highest_recv_counter = 0;
        Ok(())
    }

    // -- Chat frames --

    /// Seal a chat message for a peer under our outbound key.
    pub fn encrypt_for_peer(&self, peer_id: &str, message: &str) -> Result<EncryptedMessage> {
        let local_id = self.local_peer_id();
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::InvalidFrame(format!("unknown peer {peer_id}")))?;
        let key = peer
            .tx_key
            .clone()
            .ok_or_else(|| Error::Crypto("no outbound session key for peer".into()))?;

        peer.send_counter += 1;
        let counter = peer.send_counter;
        let timestamp = unix_now();

        let payload = MessagePayload {
            sender_id: local_id.clone(),
            message: message.to_string(),
            timestamp,
            message_id: format!("{}-{}", local_id, nanos_now()),
        };
        let plaintext = crate::domain::wire::to_cbor(&payload)?;

        let mut frame = EncryptedMessage {
            sender_id: local_id,
            receiver_id: peer_id.to_string(),
            epoch: peer.tx_epoch,
            counter,
            timestamp,
            ciphertext: Vec::new(),
        };

        let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        frame.ciphertext = cipher
            .encrypt(
                &counter_nonce(counter),
                Payload {
                    msg: &plaintext,
                    aad: &frame.aad(),
                },
            )
            .map_err(|e| Error::Crypto(format!("AEAD seal failed: {e}")))?;

        Ok(frame)
    }

    /// Open a chat frame: epoch must be current, counter strictly increasing.
    pub fn decrypt_from_peer(&self, frame: &EncryptedMessage) -> Result<MessagePayload> {
        if frame.receiver_id != self.local_peer_id() {
            return Err(Error::InvalidFrame(format!(
                "chat frame addressed to {}",
                frame.receiver_id
            )));
        }

        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(&frame.sender_id)
            .ok_or_else(|| Error::InvalidFrame("chat frame from unknown peer".into()))?;
        let key = peer
            .rx_key
            .as_ref()
            .ok_or_else(|| Error::InvalidFrame("chat frame before key exchange".into()))?;

        if frame.epoch != peer.rx_epoch {
            return Err(Error::InvalidFrame(format!(
                "chat frame epoch {} does not match current epoch {}",
                frame.epoch, peer.rx_epoch
            )));
        }
        if frame.counter <= peer.highest_recv_counter {
            return Err(Error::InvalidFrame(format!(
                "replayed counter {} (highest accepted {})",
                frame.counter, peer.highest_recv_counter
            )));
        }

        let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let plaintext = cipher
            .decrypt(
                &counter_nonce(frame.counter),
                Payload {
                    msg: &frame.ciphertext,
                    aad: &frame.aad(),
                },
            )
            .map_err(|_| Error::InvalidFrame("AEAD open failed".into()))?;

        let payload: MessagePayload = crate::domain::wire::from_cbor(&plaintext)?;
        if payload.sender_id != frame.sender_id {
            return Err(Error::InvalidFrame(
                "payload sender does not match frame sender".into(),
            ));
        }

        peer.highest_recv_counter = frame.counter;
        Ok(payload)
    }

    // -- Rotation --

    /// Gate for on-demand rotation: returns `false` (no-op) when there are
    /// no keyed peers or the previous rotation was under a minute ago. The
    /// caller re-initiates the key exchange per peer on `true`.
    pub fn rotate_keys(&self) -> Result<bool> {
        let has_keyed_peer = self.peers.read().values().any(|p| p.tx_key.is_some());
        if !has_keyed_peer {
            return Ok(false);
        }

        let mut last = self.last_rotation.lock();
        if let Some(at) = *last {
            if at.elapsed().as_secs() < ROTATION_MIN_INTERVAL_SECS {
                return Ok(false);
            }
        }
        *last = Some(Instant::now());
        Ok(true)
    }

    // -- Introspection --

    /// Peers with an established inbound key.
    pub fn verified_peers(&self) -> Vec<String> {
        self.peers
            .read()
            .iter()
            .filter(|(_, p)| p.verified())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn peer_fingerprint(&self, peer_id: &str) -> Result<String> {
        self.peers
            .read()
            .get(peer_id)
            .map(|p| p.fingerprint.clone())
            .ok_or_else(|| Error::InvalidFrame(format!("unknown peer {peer_id}")))
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.peers.write().remove(peer_id);
    }
}

impl Default for SessionCrypto {
    fn default() -> Self {
        Self::new()
    }
}

fn nanos_now() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exchange announcements and key exchanges in both directions.
    fn establish(a: &SessionCrypto, b: &SessionCrypto) {
        let ann_a = a.create_announcement("fp-a");
        let ann_b = b.create_announcement("fp-b");
        assert!(b.process_announcement(&ann_a).unwrap());
        assert!(a.process_announcement(&ann_b).unwrap());

        let kx_a = a.initiate_key_exchange(&b.local_peer_id()).unwrap();
        let kx_b = b.initiate_key_exchange(&a.local_peer_id()).unwrap();
        b.process_key_exchange(&kx_a).unwrap();
        a.process_key_exchange(&kx_b).unwrap();
    }

    #[test]
    fn full_handshake_enables_both_directions() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        establish(&a, &b);

        let to_b = a.encrypt_for_peer(&b.local_peer_id(), "hello").unwrap();
        let at_b = b.decrypt_from_peer(&to_b).unwrap();
        assert_eq!(at_b.message, "hello");
        assert_eq!(at_b.sender_id, a.local_peer_id());

        let to_a = b.encrypt_for_peer(&a.local_peer_id(), "hi back").unwrap();
        assert_eq!(a.decrypt_from_peer(&to_a).unwrap().message, "hi back");
    }

    #[test]
    fn replayed_frame_is_dropped() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        establish(&a, &b);

        let frame = a.encrypt_for_peer(&b.local_peer_id(), "once").unwrap();
        b.decrypt_from_peer(&frame).unwrap();
        assert!(matches!(
            b.decrypt_from_peer(&frame),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn repeated_announcement_does_not_reset_session() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        establish(&a, &b);

        // Replay A's announcement at B: no new record, keys untouched.
        let ann_a = a.create_announcement("fp-a");
        assert!(!b.process_announcement(&ann_a).unwrap());

        let frame = a.encrypt_for_peer(&b.local_peer_id(), "still works").unwrap();
        assert_eq!(b.decrypt_from_peer(&frame).unwrap().message, "still works");
    }

    #[test]
    fn rotation_invalidates_prior_epoch_ciphertext() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        establish(&a, &b);

        // Capture a frame from epoch 1, deliver a later one first.
        let captured = a.encrypt_for_peer(&b.local_peer_id(), "secret").unwrap();

        // A rotates: fresh encapsulation, epoch 2.
        let kx = a.initiate_key_exchange(&b.local_peer_id()).unwrap();
        assert_eq!(kx.epoch, 2);
        b.process_key_exchange(&kx).unwrap();

        let fresh = a.encrypt_for_peer(&b.local_peer_id(), "after").unwrap();
        assert_eq!(b.decrypt_from_peer(&fresh).unwrap().message, "after");

        // The pre-rotation capture no longer decrypts.
        assert!(b.decrypt_from_peer(&captured).is_err());
    }

    #[test]
    fn rotation_gate_is_idempotent_within_a_minute() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        establish(&a, &b);

        assert!(a.rotate_keys().unwrap());
        assert!(!a.rotate_keys().unwrap());
    }

    #[test]
    fn rotation_without_peers_is_a_noop() {
        let a = SessionCrypto::new();
        assert!(!a.rotate_keys().unwrap());
    }

    #[test]
    fn tampered_announcement_signature_rejected() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        let mut ann = a.create_announcement("fp-a");
        ann.signature[0] ^= 0xff;
        assert!(matches!(
            b.process_announcement(&ann),
            Err(Error::SignatureInvalid)
        ));
    }

    #[test]
    fn skewed_announcement_rejected() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        let mut ann = a.create_announcement("fp-a");
        ann.timestamp -= 6 * 60;
        // signature still covers the original timestamp, but skew is
        // checked first
        assert!(matches!(
            b.process_announcement(&ann),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn tls_binding_mismatch_is_possible_mitm() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        let ann = a.create_announcement("fp-a");
        b.process_announcement(&ann).unwrap();
        b.verify_tls_binding(&a.local_peer_id(), "fp-a").unwrap();
        assert!(matches!(
            b.verify_tls_binding(&a.local_peer_id(), "fp-evil"),
            Err(Error::PossibleMitm)
        ));
    }

    #[test]
    fn spoofed_sender_under_different_key_is_dropped() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        let mallory = SessionCrypto::new();
        establish(&a, &b);
        establish(&mallory, &b);

        // Mallory seals a frame with her own (valid) session key but claims
        // A's sender ID on the envelope frame.
        let mut frame = mallory
            .encrypt_for_peer(&b.local_peer_id(), "spoofed")
            .unwrap();
        frame.sender_id = a.local_peer_id();
        assert!(b.decrypt_from_peer(&frame).is_err());
    }

    #[test]
    fn key_exchange_from_unknown_peer_rejected() {
        let a = SessionCrypto::new();
        let b = SessionCrypto::new();
        let ann_b = b.create_announcement("fp-b");
        a.process_announcement(&ann_b).unwrap();
        let kx = a.initiate_key_exchange(&b.local_peer_id()).unwrap();
        // B never saw A's announcement.
        assert!(matches!(
            b.process_key_exchange(&kx),
            Err(Error::InvalidFrame(_))
        ));
    }
}

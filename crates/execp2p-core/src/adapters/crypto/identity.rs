//! Long-lived post-quantum identity: Kyber-1024 KEM + Dilithium-5 signatures.

use pqcrypto_dilithium::dilithium5;
use pqcrypto_kyber::kyber1024;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SharedSecret as _,
};
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _};

use crate::domain::error::{Error, Result};
use crate::domain::identity::{identity_fingerprint, PeerId};

/// Holds this process's key material. Secret keys never leave the struct.
pub struct PqIdentity {
    peer_id: PeerId,
    kem_public: kyber1024::PublicKey,
    kem_secret: kyber1024::SecretKey,
    sig_public: dilithium5::PublicKey,
    sig_secret: dilithium5::SecretKey,
}

impl std::fmt::Debug for PqIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PqIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl PqIdentity {
    /// Generate a fresh identity (random keypairs + peer ID).
    pub fn generate() -> Self {
        let (kem_public, kem_secret) = kyber1024::keypair();
        let (sig_public, sig_secret) = dilithium5::keypair();
        Self {
            peer_id: PeerId::generate(),
            kem_public,
            kem_secret,
            sig_public,
            sig_secret,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn kem_public_bytes(&self) -> Vec<u8> {
        self.kem_public.as_bytes().to_vec()
    }

    pub fn sig_public_bytes(&self) -> Vec<u8> {
        self.sig_public.as_bytes().to_vec()
    }

    /// Colon-hex SHA-256 of our Dilithium public key.
    pub fn fingerprint(&self) -> String {
        identity_fingerprint(self.sig_public.as_bytes())
    }

    /// Detached Dilithium-5 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        dilithium5::detached_sign(message, &self.sig_secret)
            .as_bytes()
            .to_vec()
    }

    /// Recover the shared secret from a peer's encapsulation to us.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<[u8; 32]> {
        let ct = kyber1024::Ciphertext::from_bytes(ciphertext)
            .map_err(|_| Error::Crypto("invalid KEM ciphertext length".into()))?;
        let ss = kyber1024::decapsulate(&ct, &self.kem_secret);
        let mut out = [0u8; 32];
        out.copy_from_slice(ss.as_bytes());
        Ok(out)
    }
}

/// Encapsulate to a peer's announced Kyber public key.
/// Returns `(ciphertext, shared_secret)`.
pub fn encapsulate(peer_kem_public: &[u8]) -> Result<(Vec<u8>, [u8; 32])> {
    let pk = kyber1024::PublicKey::from_bytes(peer_kem_public)
        .map_err(|_| Error::Crypto("invalid KEM public key length".into()))?;
    let (ss, ct) = kyber1024::encapsulate(&pk);
    let mut out = [0u8; 32];
    out.copy_from_slice(ss.as_bytes());
    Ok((ct.as_bytes().to_vec(), out))
}

/// Verify a detached Dilithium-5 signature under `sig_public`.
pub fn verify_signature(sig_public: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let pk = dilithium5::PublicKey::from_bytes(sig_public)
        .map_err(|_| Error::Crypto("invalid signature public key length".into()))?;
    let sig = dilithium5::DetachedSignature::from_bytes(signature)
        .map_err(|_| Error::SignatureInvalid)?;
    dilithium5::verify_detached_signature(&sig, message, &pk)
        .map_err(|_| Error::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulation_round_trip() {
        let alice = PqIdentity::generate();
        let (ct, ss_remote) = encapsulate(&alice.kem_public_bytes()).unwrap();
        let ss_local = alice.decapsulate(&ct).unwrap();
        assert_eq!(ss_local, ss_remote);
    }

    #[test]
    fn sign_and_verify() {
        let id = PqIdentity::generate();
        let sig = id.sign(b"hello");
        verify_signature(&id.sig_public_bytes(), b"hello", &sig).unwrap();
        assert!(verify_signature(&id.sig_public_bytes(), b"tampered", &sig).is_err());
    }

    #[test]
    fn signature_from_wrong_key_rejected() {
        let a = PqIdentity::generate();
        let b = PqIdentity::generate();
        let sig = a.sign(b"msg");
        assert!(matches!(
            verify_signature(&b.sig_public_bytes(), b"msg", &sig),
            Err(Error::SignatureInvalid)
        ));
    }
}

//! Signed digests carried on the signed-digest stream.
//!
//! Layout: `"BSIG"`, version, signer count, then per signer an 8-byte key id,
//! the digest algorithm id and a 64-byte Ed25519 signature over
//! `algorithm id || digest`.

use super::digest::DigestAlgorithm;
use super::CryptoError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

const MAGIC: &[u8; 4] = b"BSIG";
const VERSION: u8 = 1;
const KEY_ID_LEN: usize = 8;
const ENTRY_LEN: usize = KEY_ID_LEN + 1 + 64;

/// Short identifier of a public key: the first 8 bytes of its SHA-256.
pub fn key_id(public: &[u8]) -> [u8; KEY_ID_LEN] {
    let hash = Sha256::digest(public);
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&hash[..KEY_ID_LEN]);
    id
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SignerInfo {
    key_id: [u8; KEY_ID_LEN],
    algorithm: DigestAlgorithm,
    signature: [u8; 64],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedDigest {
    signers: Vec<SignerInfo>,
}

fn signed_message(algorithm: DigestAlgorithm, digest: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(1 + digest.len());
    msg.push(algorithm.id());
    msg.extend_from_slice(digest);
    msg
}

impl SignedDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign `digest` (computed with `algorithm`) with `key`.
    pub fn add_signer(&mut self, key: &SigningKey, algorithm: DigestAlgorithm, digest: &[u8]) {
        let signature = key.sign(&signed_message(algorithm, digest));
        self.signers.push(SignerInfo {
            key_id: key_id(key.verifying_key().as_bytes()),
            algorithm,
            signature: signature.to_bytes(),
        });
    }

    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.signers.len() * ENTRY_LEN);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(self.signers.len() as u8);
        for s in &self.signers {
            out.extend_from_slice(&s.key_id);
            out.push(s.algorithm.id());
            out.extend_from_slice(&s.signature);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CryptoError> {
        let bad = |reason: &str| CryptoError::Decode {
            what: "signed digest",
            reason: reason.to_string(),
        };
        if buf.len() < 6 || &buf[..4] != MAGIC {
            return Err(bad("bad magic"));
        }
        if buf[4] != VERSION {
            return Err(bad("unsupported version"));
        }
        let count = buf[5] as usize;
        let body = &buf[6..];
        if body.len() != count * ENTRY_LEN {
            return Err(bad("truncated signer list"));
        }
        let mut signers = Vec::with_capacity(count);
        for entry in body.chunks_exact(ENTRY_LEN) {
            let mut key_id = [0u8; KEY_ID_LEN];
            key_id.copy_from_slice(&entry[..KEY_ID_LEN]);
            let algorithm = DigestAlgorithm::from_id(entry[KEY_ID_LEN])
                .ok_or_else(|| bad("unknown digest algorithm"))?;
            let mut signature = [0u8; 64];
            signature.copy_from_slice(&entry[KEY_ID_LEN + 1..]);
            signers.push(SignerInfo {
                key_id,
                algorithm,
                signature,
            });
        }
        Ok(Self { signers })
    }

    /// Digest algorithm bound into the signature made by `key`, if any.
    pub fn algorithm_for(&self, key: &VerifyingKey) -> Option<DigestAlgorithm> {
        let id = key_id(key.as_bytes());
        self.signers
            .iter()
            .find(|s| s.key_id == id)
            .map(|s| s.algorithm)
    }

    /// Check the signature by `key` over a freshly computed `digest`.
    pub fn verify(&self, key: &VerifyingKey, digest: &[u8]) -> Result<(), CryptoError> {
        let id = key_id(key.as_bytes());
        let signer = self
            .signers
            .iter()
            .find(|s| s.key_id == id)
            .ok_or(CryptoError::NoSigner)?;
        let signature = Signature::from_bytes(&signer.signature);
        key.verify(&signed_message(signer.algorithm, digest), &signature)
            .map_err(|_| CryptoError::Verify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_sign_encode_verify() -> anyhow::Result<()> {
        let key = SigningKey::generate(&mut OsRng);
        let digest = Sha256::digest(b"file content").to_vec();

        let mut sig = SignedDigest::new();
        sig.add_signer(&key, DigestAlgorithm::Sha256, &digest);
        let back = SignedDigest::decode(&sig.encode())?;
        assert_eq!(back, sig);

        let vk = key.verifying_key();
        assert_eq!(back.algorithm_for(&vk), Some(DigestAlgorithm::Sha256));
        back.verify(&vk, &digest)?;

        let other = Sha256::digest(b"tampered").to_vec();
        assert!(matches!(back.verify(&vk, &other), Err(CryptoError::Verify)));
        Ok(())
    }

    #[test]
    fn test_unknown_signer() {
        let key = SigningKey::generate(&mut OsRng);
        let stranger = SigningKey::generate(&mut OsRng).verifying_key();
        let mut sig = SignedDigest::new();
        sig.add_signer(&key, DigestAlgorithm::Sha1, &[0u8; 20]);
        assert_eq!(sig.algorithm_for(&stranger), None);
        assert!(matches!(
            sig.verify(&stranger, &[0u8; 20]),
            Err(CryptoError::NoSigner)
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SignedDigest::decode(b"").is_err());
        assert!(SignedDigest::decode(b"BSIG\x01\x01short").is_err());
        assert!(SignedDigest::decode(b"XXXX\x01\x00").is_err());
    }
}

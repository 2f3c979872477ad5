//! Digests, signed digests and per-file data encryption.

pub mod digest;
pub mod keys;
pub mod session;
pub mod signature;

use crate::config::PkiConfig;
use ed25519_dalek::{SigningKey, VerifyingKey};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

pub use self::digest::{digest_file, DigestAlgorithm, FileDigest};
pub use session::{CipherContext, SessionKey};
pub use signature::SignedDigest;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Malformed {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("No trusted signer matches the signature")]
    NoSigner,

    #[error("Session key is not addressed to this client")]
    RecipientMismatch,

    #[error("Signature verification failed")]
    Verify,

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Cannot load key {path}: {reason}")]
    Key { path: String, reason: String },
}

/// Key material of one job.
#[derive(Default)]
pub struct PkiContext {
    /// Signs file digests on backup
    pub signer: Option<SigningKey>,
    /// Accepted on restore
    pub trusted_signers: Vec<VerifyingKey>,
    /// Session keys are wrapped for each of these
    pub recipients: Vec<PublicKey>,
    /// Unwraps session keys on restore
    pub decryption_key: Option<StaticSecret>,
    pub encrypt: bool,
}

impl PkiContext {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Load keys named in the configuration. Our own public keys are always
    /// trusted and always recipients.
    pub fn from_config(config: &PkiConfig) -> Result<Self, CryptoError> {
        let mut pki = PkiContext::default();

        if let Some(path) = &config.signing_key {
            let key = keys::load_signing_key(path)?;
            pki.trusted_signers.push(key.verifying_key());
            if config.signatures {
                pki.signer = Some(key);
            }
        }
        for path in &config.signers {
            pki.trusted_signers.push(keys::load_verifying_key(path)?);
        }

        if let Some(path) = &config.encryption_key {
            let secret = keys::load_encryption_key(path)?;
            pki.recipients.push(PublicKey::from(&secret));
            pki.decryption_key = Some(secret);
        }
        for path in &config.master_keys {
            pki.recipients.push(keys::load_recipient(path)?);
        }
        pki.encrypt = config.encryption && !pki.recipients.is_empty();
        Ok(pki)
    }

    pub fn with_signer(mut self, key: SigningKey) -> Self {
        self.trusted_signers.push(key.verifying_key());
        self.signer = Some(key);
        self
    }

    pub fn with_encryption(mut self, secret: StaticSecret) -> Self {
        self.recipients.push(PublicKey::from(&secret));
        self.decryption_key = Some(secret);
        self.encrypt = true;
        self
    }

    pub fn signing(&self) -> bool {
        self.signer.is_some()
    }

    pub fn encrypting(&self) -> bool {
        self.encrypt && !self.recipients.is_empty()
    }
}

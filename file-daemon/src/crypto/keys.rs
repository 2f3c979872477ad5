//! Key files: 32 bytes, hex encoded, one key per file.

use super::CryptoError;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use x25519_dalek::{PublicKey, StaticSecret};

fn read_key(path: &Path) -> Result<[u8; 32], CryptoError> {
    let key_err = |reason: String| CryptoError::Key {
        path: path.display().to_string(),
        reason,
    };
    let text = fs::read_to_string(path).map_err(|e| key_err(e.to_string()))?;
    let bytes = hex::decode(text.trim()).map_err(|e| key_err(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| key_err(format!("expected 32 bytes, got {}", b.len())))
}

pub fn load_signing_key(path: &Path) -> Result<SigningKey, CryptoError> {
    Ok(SigningKey::from_bytes(&read_key(path)?))
}

pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_bytes(&read_key(path)?).map_err(|e| CryptoError::Key {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

pub fn load_encryption_key(path: &Path) -> Result<StaticSecret, CryptoError> {
    Ok(StaticSecret::from(read_key(path)?))
}

pub fn load_recipient(path: &Path) -> Result<PublicKey, CryptoError> {
    Ok(PublicKey::from(read_key(path)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum KeyKind {
    /// Ed25519 key pair for signed digests
    Signing,
    /// X25519 key pair for session keys
    Encryption,
}

/// Write a new key pair to `<prefix>.key` and `<prefix>.pub`. Returns both paths.
pub fn generate(kind: KeyKind, prefix: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
    let (secret, public) = match kind {
        KeyKind::Signing => {
            let key = SigningKey::generate(&mut OsRng);
            (key.to_bytes(), key.verifying_key().to_bytes())
        }
        KeyKind::Encryption => {
            let key = StaticSecret::random_from_rng(OsRng);
            (key.to_bytes(), PublicKey::from(&key).to_bytes())
        }
    };
    let secret_path = prefix.with_extension("key");
    let public_path = prefix.with_extension("pub");
    fs::write(&secret_path, hex::encode(secret) + "\n")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))?;
    }
    fs::write(&public_path, hex::encode(public) + "\n")?;
    Ok((secret_path, public_path))
}

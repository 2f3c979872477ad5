//! Per-file session keys and the streaming data cipher.
//!
//! Each encrypted file gets a fresh 32-byte key, wrapped once per recipient
//! with an ephemeral X25519 exchange and XChaCha20-Poly1305. File data is
//! cut into 4096-byte segments, each sealed separately with a nonce built
//! from a per-file prefix, the segment counter and a last-segment flag, so
//! truncation and reordering are detected.
//!
//! Session blob: `"BSES"`, version, recipient count, 15-byte nonce prefix,
//! then per recipient: key id (8), ephemeral public key (32), nonce (24),
//! wrapped length (u16 BE), wrapped key.

use super::signature::key_id;
use super::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const MAGIC: &[u8; 4] = b"BSES";
const VERSION: u8 = 1;
const KEY_LEN: usize = 32;
const PREFIX_LEN: usize = 15;
const WRAP_LABEL: &[u8] = b"file-daemon session key v1";

pub const SEGMENT_LEN: usize = 4096;
pub const TAG_LEN: usize = 16;

/// A file's symmetric session.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; KEY_LEN],
    prefix: [u8; PREFIX_LEN],
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

fn wrapping_key(shared: &[u8], eph_pub: &PublicKey, recipient: &PublicKey) -> XChaCha20Poly1305 {
    let mut h = Sha256::new();
    h.update(WRAP_LABEL);
    h.update(shared);
    h.update(eph_pub.as_bytes());
    h.update(recipient.as_bytes());
    let kek = h.finalize();
    XChaCha20Poly1305::new(Key::from_slice(&kek))
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut prefix = [0u8; PREFIX_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut prefix);
        Self { key, prefix }
    }

    /// Wrap the key for every recipient.
    pub fn encode(&self, recipients: &[PublicKey]) -> Result<Vec<u8>, CryptoError> {
        if recipients.is_empty() || recipients.len() > u8::MAX as usize {
            return Err(CryptoError::Cipher(format!(
                "invalid recipient count {}",
                recipients.len()
            )));
        }
        let mut out = Vec::with_capacity(6 + PREFIX_LEN + recipients.len() * 130);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(recipients.len() as u8);
        out.extend_from_slice(&self.prefix);
        for recipient in recipients {
            let eph = EphemeralSecret::random_from_rng(OsRng);
            let eph_pub = PublicKey::from(&eph);
            let shared = eph.diffie_hellman(recipient);
            let mut nonce = [0u8; 24];
            OsRng.fill_bytes(&mut nonce);
            let wrapped = wrapping_key(shared.as_bytes(), &eph_pub, recipient)
                .encrypt(XNonce::from_slice(&nonce), self.key.as_slice())
                .map_err(|e| CryptoError::Cipher(e.to_string()))?;

            out.extend_from_slice(&key_id(recipient.as_bytes()));
            out.extend_from_slice(eph_pub.as_bytes());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
            out.extend_from_slice(&wrapped);
        }
        Ok(out)
    }

    /// Unwrap the entry addressed to `secret`.
    pub fn decode(buf: &[u8], secret: &StaticSecret) -> Result<Self, CryptoError> {
        let bad = |reason: &str| CryptoError::Decode {
            what: "session data",
            reason: reason.to_string(),
        };
        let header = 6 + PREFIX_LEN;
        if buf.len() < header || &buf[..4] != MAGIC {
            return Err(bad("bad magic"));
        }
        if buf[4] != VERSION {
            return Err(bad("unsupported version"));
        }
        let count = buf[5] as usize;
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&buf[6..header]);

        let own = PublicKey::from(secret);
        let own_id = key_id(own.as_bytes());
        let mut rest = &buf[header..];
        for _ in 0..count {
            if rest.len() < 8 + 32 + 24 + 2 {
                return Err(bad("truncated recipient"));
            }
            let id = &rest[..8];
            let mut eph = [0u8; 32];
            eph.copy_from_slice(&rest[8..40]);
            let nonce = XNonce::clone_from_slice(&rest[40..64]);
            let len = u16::from_be_bytes([rest[64], rest[65]]) as usize;
            if rest.len() < 66 + len {
                return Err(bad("truncated wrapped key"));
            }
            let wrapped = &rest[66..66 + len];
            rest = &rest[66 + len..];

            if id != own_id {
                continue;
            }
            let eph_pub = PublicKey::from(eph);
            let shared = secret.diffie_hellman(&eph_pub);
            let plain = wrapping_key(shared.as_bytes(), &eph_pub, &own)
                .decrypt(&nonce, wrapped)
                .map_err(|_| CryptoError::Cipher("session key unwrap failed".to_string()))?;
            if plain.len() != KEY_LEN {
                return Err(bad("bad session key length"));
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&plain);
            return Ok(Self { key, prefix });
        }
        Err(CryptoError::RecipientMismatch)
    }

    pub fn encryptor(&self) -> CipherContext {
        CipherContext::new(self, Direction::Encrypt)
    }

    pub fn decryptor(&self) -> CipherContext {
        CipherContext::new(self, Direction::Decrypt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// Streaming segment cipher. `update` may hold input back without
/// producing output; `finalize` flushes the last segment.
pub struct CipherContext {
    aead: XChaCha20Poly1305,
    prefix: [u8; PREFIX_LEN],
    direction: Direction,
    counter: u64,
    pending: Vec<u8>,
    finished: bool,
}

impl CipherContext {
    fn new(session: &SessionKey, direction: Direction) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(&session.key)),
            prefix: session.prefix,
            direction,
            counter: 0,
            pending: Vec::with_capacity(SEGMENT_LEN + TAG_LEN),
            finished: false,
        }
    }

    fn input_segment_len(&self) -> usize {
        match self.direction {
            Direction::Encrypt => SEGMENT_LEN,
            Direction::Decrypt => SEGMENT_LEN + TAG_LEN,
        }
    }

    /// Upper bound of bytes produced by feeding `input_len` more bytes.
    pub fn max_output_len(&self, input_len: usize) -> usize {
        let total = self.pending.len() + input_len;
        let segments = total / self.input_segment_len() + 1;
        match self.direction {
            Direction::Encrypt => total + segments * TAG_LEN,
            Direction::Decrypt => total,
        }
    }

    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.finished {
            return Err(CryptoError::Cipher("update after finalize".to_string()));
        }
        self.pending.extend_from_slice(input);
        let seg = self.input_segment_len();
        // The last segment is only known at finalize, so keep one back.
        while self.pending.len() > seg {
            let chunk: Vec<u8> = self.pending.drain(..seg).collect();
            self.process(&chunk, false, out)?;
        }
        Ok(())
    }

    pub fn finalize(&mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let chunk = std::mem::take(&mut self.pending);
        self.process(&chunk, true, out)
    }

    fn nonce(&self, last: bool) -> XNonce {
        let mut n = [0u8; 24];
        n[..PREFIX_LEN].copy_from_slice(&self.prefix);
        n[PREFIX_LEN..PREFIX_LEN + 8].copy_from_slice(&self.counter.to_le_bytes());
        n[23] = last as u8;
        XNonce::clone_from_slice(&n)
    }

    fn process(&mut self, chunk: &[u8], last: bool, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.nonce(last);
        self.counter += 1;
        let result = match self.direction {
            Direction::Encrypt => self.aead.encrypt(&nonce, chunk),
            Direction::Decrypt => self.aead.decrypt(&nonce, chunk),
        };
        let data = result.map_err(|_| {
            CryptoError::Cipher(format!("segment {} failed authentication", self.counter - 1))
        })?;
        out.extend_from_slice(&data);
        Ok(())
    }
}

//! File digests for the plain digest streams and signed digests.

use bnet::StreamType;
use digest::DynDigest;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Stream the finished digest is sent on.
    pub fn stream(self) -> StreamType {
        match self {
            DigestAlgorithm::Md5 => StreamType::Md5Digest,
            DigestAlgorithm::Sha1 => StreamType::Sha1Digest,
            DigestAlgorithm::Sha256 => StreamType::Sha256Digest,
            DigestAlgorithm::Sha512 => StreamType::Sha512Digest,
        }
    }

    pub fn from_stream(stream: StreamType) -> Option<Self> {
        match stream {
            StreamType::Md5Digest => Some(DigestAlgorithm::Md5),
            StreamType::Sha1Digest => Some(DigestAlgorithm::Sha1),
            StreamType::Sha256Digest => Some(DigestAlgorithm::Sha256),
            StreamType::Sha512Digest => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Identifier bound into signatures.
    pub fn id(self) -> u8 {
        match self {
            DigestAlgorithm::Md5 => 1,
            DigestAlgorithm::Sha1 => 2,
            DigestAlgorithm::Sha256 => 3,
            DigestAlgorithm::Sha512 => 4,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(DigestAlgorithm::Md5),
            2 => Some(DigestAlgorithm::Sha1),
            3 => Some(DigestAlgorithm::Sha256),
            4 => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha1 => "SHA1",
            DigestAlgorithm::Sha256 => "SHA256",
            DigestAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn hasher(self) -> FileDigest {
        let inner: Box<dyn DynDigest + Send> = match self {
            DigestAlgorithm::Md5 => Box::new(md5::Md5::default()),
            DigestAlgorithm::Sha1 => Box::new(sha1::Sha1::default()),
            DigestAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            DigestAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
        };
        FileDigest {
            algorithm: self,
            inner,
        }
    }
}

/// Running digest over a file's content.
pub struct FileDigest {
    algorithm: DigestAlgorithm,
    inner: Box<dyn DynDigest + Send>,
}

impl FileDigest {
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Vec<u8> {
        self.inner.finalize().into_vec()
    }
}

/// Digest a file from disk.
pub fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

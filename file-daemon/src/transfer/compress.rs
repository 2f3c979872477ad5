//! zlib compression of individual data records.
//!
//! Every record is compressed on its own so the restore side can inflate
//! records independently of each other.

use crate::utils::errors::{FdError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Worst-case compressed size of `n` input bytes.
pub fn compress_buf_size(n: usize) -> usize {
    n + (n + 999) / 1000 + 12
}

/// Restore-side scratch size for records read with buffer size `n`.
pub fn decompress_buf_size(n: usize) -> usize {
    compress_buf_size(n) + 100
}

/// Compress `input` into `out`, replacing its contents.
pub fn compress_into(input: &[u8], level: u32, out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    out.reserve(compress_buf_size(input.len()));
    let mut encoder = ZlibEncoder::new(std::mem::take(out), Compression::new(level.min(9)));
    encoder
        .write_all(input)
        .map_err(|e| FdError::Compression(format!("Compression error: {}", e)))?;
    *out = encoder
        .finish()
        .map_err(|e| FdError::Compression(format!("Compression error: {}", e)))?;
    Ok(())
}

/// Inflate `input` into `out`. Output larger than `max` is an error.
pub fn decompress_into(input: &[u8], max: usize, out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    let mut decoder = ZlibDecoder::new(input).take(max as u64 + 1);
    decoder
        .read_to_end(out)
        .map_err(|e| FdError::Compression(format!("Uncompression error: {}", e)))?;
    if out.len() > max {
        return Err(FdError::Compression(format!(
            "Uncompression error: output exceeds {} bytes",
            max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_then_inflate() -> anyhow::Result<()> {
        let input: Vec<u8> = b"the quick brown fox ".repeat(1000);
        let mut packed = Vec::new();
        compress_into(&input, 6, &mut packed)?;
        assert!(packed.len() < input.len());

        let mut plain = Vec::new();
        decompress_into(&packed, input.len(), &mut plain)?;
        assert_eq!(plain, input);
        Ok(())
    }

    #[test]
    fn test_incompressible_fits_bound() -> anyhow::Result<()> {
        let input: Vec<u8> = (0..65536u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let mut packed = Vec::new();
        compress_into(&input, 9, &mut packed)?;
        assert!(packed.len() <= compress_buf_size(input.len()));
        Ok(())
    }

    #[test]
    fn test_inflate_errors() {
        let mut out = Vec::new();
        assert!(decompress_into(b"not zlib", 1024, &mut out).is_err());

        let mut packed = Vec::new();
        compress_into(&[0u8; 4096], 6, &mut packed).unwrap();
        assert!(matches!(
            decompress_into(&packed, 100, &mut out),
            Err(FdError::Compression(_))
        ));
    }
}

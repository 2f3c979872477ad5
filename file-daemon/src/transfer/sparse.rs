//! Sparse data records: holes are not sent, every sent chunk carries its
//! file offset as an 8-byte big-endian prefix.

pub const SPARSE_FADDR_SIZE: usize = 8;

/// A chunk is a hole when it is a full read, lies entirely before the end
/// of the file and holds only zeros. The final chunk is always sent so the
/// restored file gets its full length.
pub fn is_hole(chunk: &[u8], read_size: usize, offset: u64, file_size: u64) -> bool {
    chunk.len() == read_size
        && offset + (chunk.len() as u64) < file_size
        && chunk.iter().all(|b| *b == 0)
}

/// Start a sparse record in `out` with the offset prefix.
pub fn put_offset(out: &mut Vec<u8>, offset: u64) {
    out.extend_from_slice(&offset.to_be_bytes());
}

/// Split a sparse record into its offset and payload.
pub fn split_offset(record: &[u8]) -> Option<(u64, &[u8])> {
    if record.len() < SPARSE_FADDR_SIZE {
        return None;
    }
    let (head, rest) = record.split_at(SPARSE_FADDR_SIZE);
    let mut faddr = [0u8; SPARSE_FADDR_SIZE];
    faddr.copy_from_slice(head);
    Some((u64::from_be_bytes(faddr), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hole_detection() {
        let zeros = vec![0u8; 16];
        assert!(is_hole(&zeros, 16, 0, 64));
        // Final chunk reaching end of file is sent
        assert!(!is_hole(&zeros, 16, 48, 64));
        // Short read
        assert!(!is_hole(&zeros[..8], 16, 0, 64));
        let mut data = zeros.clone();
        data[15] = 1;
        assert!(!is_hole(&data, 16, 0, 64));
    }

    #[test]
    fn test_offset_prefix() {
        let mut rec = Vec::new();
        put_offset(&mut rec, 0x0102_0304_0506_0708);
        rec.extend_from_slice(b"payload");
        assert_eq!(&rec[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        let (offset, data) = split_offset(&rec).unwrap();
        assert_eq!(offset, 0x0102_0304_0506_0708);
        assert_eq!(data, b"payload");
        assert!(split_offset(b"short").is_none());
    }
}

//! The variable-length base-64 integer packing used in attribute records.
//!
//! This is not RFC 4648 base64: each integer is written most significant
//! digit first with no padding, and negative values get a leading `-`.

const DIGITS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn digit_value(c: u8) -> Option<u64> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u64),
        b'a'..=b'z' => Some((c - b'a') as u64 + 26),
        b'0'..=b'9' => Some((c - b'0') as u64 + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Append the packed form of `value` to `out`.
pub fn to_base64(value: i64, out: &mut String) {
    if value < 0 {
        out.push('-');
    }
    let mut val = value.unsigned_abs();
    let mut digits = [0u8; 11];
    let mut n = 0;
    loop {
        digits[n] = DIGITS[(val & 0x3f) as usize];
        n += 1;
        val >>= 6;
        if val == 0 {
            break;
        }
    }
    out.extend(digits[..n].iter().rev().map(|b| *b as char));
}

/// Decode one packed integer. Returns `None` on an empty or malformed field.
pub fn from_base64(field: &str) -> Option<i64> {
    let (neg, digits) = match field.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, field),
    };
    if digits.is_empty() {
        return None;
    }
    let mut val: u64 = 0;
    for c in digits.bytes() {
        val = (val << 6) | digit_value(c)?;
    }
    let val = val as i64;
    Some(if neg { val.wrapping_neg() } else { val })
}

/// Encode a binary digest with the same alphabet, six bits at a time,
/// without padding. Used when digests are shown as text.
pub fn bin_to_base64(bin: &[u8]) -> String {
    let mut out = String::with_capacity(bin.len() * 4 / 3 + 2);
    let mut reg: u32 = 0;
    let mut rem: u32 = 0;
    for byte in bin {
        reg = (reg << 8) | *byte as u32;
        rem += 8;
        while rem >= 6 {
            rem -= 6;
            out.push(DIGITS[((reg >> rem) & 0x3f) as usize] as char);
        }
    }
    if rem > 0 {
        out.push(DIGITS[((reg << (6 - rem)) & 0x3f) as usize] as char);
    }
    out
}

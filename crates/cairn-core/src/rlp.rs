//! Recursive-length-prefix coding.
//!
//! ENRs, execution headers, and trie nodes are all RLP; this is the small
//! subset the rest of the crate needs. Decoding is strict: canonical
//! length forms only, no trailing bytes at the top level.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RlpError {
    #[error("input truncated")]
    Truncated,
    #[error("non-canonical length encoding")]
    NonCanonical,
    #[error("expected a byte string, found a list")]
    ExpectedBytes,
    #[error("expected a list, found a byte string")]
    ExpectedList,
    #[error("unexpected trailing bytes")]
    TrailingBytes,
    #[error("integer too large or has leading zeros")]
    BadInteger,
    #[error("wrong item length: expected {expected}, got {got}")]
    WrongLength { expected: usize, got: usize },
}

/// A decoded RLP item borrowing from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item<'a> {
    Bytes(&'a [u8]),
    List(Vec<Item<'a>>),
}

impl<'a> Item<'a> {
    pub fn as_bytes(&self) -> Result<&'a [u8], RlpError> {
        match self {
            Item::Bytes(b) => Ok(b),
            Item::List(_) => Err(RlpError::ExpectedBytes),
        }
    }

    pub fn as_list(&self) -> Result<&[Item<'a>], RlpError> {
        match self {
            Item::List(items) => Ok(items),
            Item::Bytes(_) => Err(RlpError::ExpectedList),
        }
    }

    /// Byte string of exactly N bytes.
    pub fn as_fixed<const N: usize>(&self) -> Result<[u8; N], RlpError> {
        let bytes = self.as_bytes()?;
        if bytes.len() != N {
            return Err(RlpError::WrongLength {
                expected: N,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Minimal big-endian unsigned integer.
    pub fn as_uint(&self) -> Result<u64, RlpError> {
        let bytes = self.as_bytes()?;
        if bytes.len() > 8 || (bytes.len() > 1 && bytes[0] == 0) {
            return Err(RlpError::BadInteger);
        }
        let mut value = 0u64;
        for b in bytes {
            value = (value << 8) | u64::from(*b);
        }
        Ok(value)
    }
}

/// Decode a complete buffer as one item; trailing bytes are an error.
pub fn decode(buf: &[u8]) -> Result<Item<'_>, RlpError> {
    let (item, rest) = decode_item(buf)?;
    if !rest.is_empty() {
        return Err(RlpError::TrailingBytes);
    }
    Ok(item)
}

/// Decode one item from the front of the buffer, returning the remainder.
pub fn decode_item(buf: &[u8]) -> Result<(Item<'_>, &[u8]), RlpError> {
    let (header_len, payload_len, is_list) = decode_header(buf)?;
    let total = header_len + payload_len;
    if buf.len() < total {
        return Err(RlpError::Truncated);
    }
    let payload = &buf[header_len..total];
    let rest = &buf[total..];

    if !is_list {
        return Ok((Item::Bytes(payload), rest));
    }

    let mut items = Vec::new();
    let mut cursor = payload;
    while !cursor.is_empty() {
        let (item, next) = decode_item(cursor)?;
        items.push(item);
        cursor = next;
    }
    Ok((Item::List(items), rest))
}

/// Length in bytes of the complete item at the front of the buffer.
pub fn item_len(buf: &[u8]) -> Result<usize, RlpError> {
    let (header_len, payload_len, _) = decode_header(buf)?;
    Ok(header_len + payload_len)
}

fn decode_header(buf: &[u8]) -> Result<(usize, usize, bool), RlpError> {
    let first = *buf.first().ok_or(RlpError::Truncated)?;
    match first {
        0x00..=0x7f => Ok((0, 1, false)),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            if len == 1 {
                // A single byte below 0x80 must use the direct form.
                let b = *buf.get(1).ok_or(RlpError::Truncated)?;
                if b < 0x80 {
                    return Err(RlpError::NonCanonical);
                }
            }
            Ok((1, len, false))
        }
        0xb8..=0xbf => {
            let len_of_len = (first - 0xb7) as usize;
            let len = read_length(buf, len_of_len)?;
            if len < 56 {
                return Err(RlpError::NonCanonical);
            }
            Ok((1 + len_of_len, len, false))
        }
        0xc0..=0xf7 => Ok((1, (first - 0xc0) as usize, true)),
        0xf8..=0xff => {
            let len_of_len = (first - 0xf7) as usize;
            let len = read_length(buf, len_of_len)?;
            if len < 56 {
                return Err(RlpError::NonCanonical);
            }
            Ok((1 + len_of_len, len, true))
        }
    }
}

fn read_length(buf: &[u8], len_of_len: usize) -> Result<usize, RlpError> {
    if buf.len() < 1 + len_of_len {
        return Err(RlpError::Truncated);
    }
    let bytes = &buf[1..1 + len_of_len];
    if bytes[0] == 0 {
        return Err(RlpError::NonCanonical);
    }
    let mut len = 0usize;
    for b in bytes {
        len = len
            .checked_shl(8)
            .ok_or(RlpError::NonCanonical)?
            .checked_add(*b as usize)
            .ok_or(RlpError::NonCanonical)?;
    }
    Ok(len)
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Re-encode a decoded item. Decoding is canonical-only, so this is an
/// exact inverse of `decode`.
pub fn encode_item(item: &Item<'_>) -> Vec<u8> {
    match item {
        Item::Bytes(b) => encode_bytes(b),
        Item::List(items) => {
            let encoded: Vec<Vec<u8>> = items.iter().map(encode_item).collect();
            encode_list(&encoded)
        }
    }
}

/// Encode a byte string.
pub fn encode_bytes(payload: &[u8]) -> Vec<u8> {
    if payload.len() == 1 && payload[0] < 0x80 {
        return payload.to_vec();
    }
    let mut out = encode_length(payload.len(), 0x80);
    out.extend_from_slice(payload);
    out
}

/// Encode an unsigned integer as a minimal big-endian byte string.
pub fn encode_uint(value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0x80];
    }
    let be = value.to_be_bytes();
    let start = be.iter().position(|b| *b != 0).unwrap_or(7);
    encode_bytes(&be[start..])
}

/// Wrap already-encoded items into a list.
pub fn encode_list(encoded_items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = encoded_items.iter().map(Vec::len).sum();
    let mut out = encode_length(payload_len, 0xc0);
    for item in encoded_items {
        out.extend_from_slice(item);
    }
    out
}

fn encode_length(len: usize, offset: u8) -> Vec<u8> {
    if len < 56 {
        vec![offset + len as u8]
    } else {
        let be = (len as u64).to_be_bytes();
        let start = be.iter().position(|b| *b != 0).unwrap_or(7);
        let len_bytes = &be[start..];
        let mut out = vec![offset + 55 + len_bytes.len() as u8];
        out.extend_from_slice(len_bytes);
        out
    }
}

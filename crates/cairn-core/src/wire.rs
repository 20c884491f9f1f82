//! Portal wire format — on-wire types for all overlay communication.
//!
//! These types ARE the protocol. Every selector byte, every offset, every
//! union arm is part of the wire format and must match the Portal Network
//! specification byte-for-byte. Messages use a 1-byte selector followed by
//! a typed encoding: fixed-size fields first, variable-size fields behind
//! 4-byte little-endian offsets into the variable region.

use bytes::Bytes;

use crate::distance::{radius_from_le_bytes, radius_to_le_bytes, Radius};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Ceiling for a single message on the discovery channel, after handshake
/// overhead. Anything larger goes over the bulk-transfer channel.
pub const MAX_TALK_PAYLOAD: usize = 1100;

/// Largest content payload the CONTENT inline arm may carry:
/// message selector + union selector are subtracted from the ceiling.
pub const MAX_INLINE_CONTENT: usize = MAX_TALK_PAYLOAD - 2;

/// Maximum number of distances in one FINDNODES request.
pub const MAX_DISTANCES: usize = 256;

/// Maximum number of ENRs across NODES / CONTENT responses.
pub const NODES_LIMIT: usize = 32;

/// Maximum content keys per OFFER, and the ACCEPT bitlist capacity.
pub const MAX_OFFER_KEYS: usize = 64;

/// Radius payloads are a 32-byte little-endian unsigned integer.
pub const RADIUS_BYTES: usize = 32;

// ── Sub-protocols ─────────────────────────────────────────────────────────────

/// Logical overlay identifier: a 2-byte tag carried by the discovery layer.
/// Each sub-protocol owns an independent routing table and content space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolId {
    History,
    State,
    Beacon,
    CanonicalIndices,
}

impl ProtocolId {
    pub const fn tag(self) -> [u8; 2] {
        match self {
            ProtocolId::State => [0x50, 0x0a],
            ProtocolId::History => [0x50, 0x0b],
            ProtocolId::CanonicalIndices => [0x50, 0x0c],
            ProtocolId::Beacon => [0x50, 0x1a],
        }
    }

    pub fn from_tag(tag: [u8; 2]) -> Option<ProtocolId> {
        match tag {
            [0x50, 0x0a] => Some(ProtocolId::State),
            [0x50, 0x0b] => Some(ProtocolId::History),
            [0x50, 0x0c] => Some(ProtocolId::CanonicalIndices),
            [0x50, 0x1a] => Some(ProtocolId::Beacon),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolId::History => "history",
            ProtocolId::State => "state",
            ProtocolId::Beacon => "beacon",
            ProtocolId::CanonicalIndices => "canonical-indices",
        }
    }
}

// ── Message types ─────────────────────────────────────────────────────────────

pub const PING_SELECTOR: u8 = 0x00;
pub const PONG_SELECTOR: u8 = 0x01;
pub const FINDNODES_SELECTOR: u8 = 0x02;
pub const NODES_SELECTOR: u8 = 0x03;
pub const FINDCONTENT_SELECTOR: u8 = 0x04;
pub const CONTENT_SELECTOR: u8 = 0x05;
pub const OFFER_SELECTOR: u8 = 0x06;
pub const ACCEPT_SELECTOR: u8 = 0x07;

/// Liveness probe carrying the sender's record sequence and radius.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub enr_seq: u64,
    /// Custom payload: the sender's radius, 32 bytes little-endian.
    pub custom_payload: Bytes,
}

/// Liveness reply; same shape as PING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub enr_seq: u64,
    pub custom_payload: Bytes,
}

/// Request for peers at the given log2 distances from the recipient.
/// Distance 0 asks for the recipient's own record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodes {
    pub distances: Vec<u16>,
}

/// Response to FINDNODES: signed records, possibly spanning `total` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nodes {
    pub total: u8,
    /// RLP-encoded ENRs; decoded and verified by the overlay layer.
    pub enrs: Vec<Bytes>,
}

/// Request for a content item by serialized content key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindContent {
    pub content_key: Bytes,
}

/// The CONTENT response union: exactly one of a bulk-transfer connection
/// id, the inline payload, or a list of peers closer to the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Union selector 0: u16 connection id, big-endian on the wire.
    ConnectionId(u16),
    /// Union selector 1: the item itself, when it fits the ceiling.
    Payload(Bytes),
    /// Union selector 2: RLP-encoded ENRs closer to the content id.
    Enrs(Vec<Bytes>),
}

/// Advertisement of locally stored content keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub content_keys: Vec<Bytes>,
}

/// Response to OFFER: a connection id for the transfer plus a bitlist
/// selecting which offered keys are wanted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept {
    pub connection_id: u16,
    pub content_keys: Vec<bool>,
}

/// Any Portal wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNodes(FindNodes),
    Nodes(Nodes),
    FindContent(FindContent),
    Content(Content),
    Offer(Offer),
    Accept(Accept),
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("unknown message selector: 0x{0:02x}")]
    UnknownSelector(u8),
    #[error("unknown union selector: 0x{0:02x}")]
    UnknownUnionArm(u8),
    #[error("message truncated")]
    Truncated,
    #[error("invalid offset")]
    BadOffset,
    #[error("variable region length not a multiple of the element size")]
    BadElementSize,
    #[error("list exceeds limit of {0}")]
    ListTooLong(usize),
    #[error("payload exceeds inline ceiling of {MAX_INLINE_CONTENT} bytes")]
    PayloadTooLarge,
    #[error("malformed bitlist")]
    BadBitlist,
    #[error("trailing bytes after message body")]
    TrailingBytes,
}

// ── Encoding ──────────────────────────────────────────────────────────────────

impl Message {
    pub fn selector(&self) -> u8 {
        match self {
            Message::Ping(_) => PING_SELECTOR,
            Message::Pong(_) => PONG_SELECTOR,
            Message::FindNodes(_) => FINDNODES_SELECTOR,
            Message::Nodes(_) => NODES_SELECTOR,
            Message::FindContent(_) => FINDCONTENT_SELECTOR,
            Message::Content(_) => CONTENT_SELECTOR,
            Message::Offer(_) => OFFER_SELECTOR,
            Message::Accept(_) => ACCEPT_SELECTOR,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.selector()];
        match self {
            Message::Ping(m) => encode_ping_pong(&mut out, m.enr_seq, &m.custom_payload),
            Message::Pong(m) => encode_ping_pong(&mut out, m.enr_seq, &m.custom_payload),
            Message::FindNodes(m) => {
                out.extend_from_slice(&4u32.to_le_bytes());
                for d in &m.distances {
                    out.extend_from_slice(&d.to_le_bytes());
                }
            }
            Message::Nodes(m) => {
                out.push(m.total);
                out.extend_from_slice(&5u32.to_le_bytes());
                out.extend_from_slice(&encode_byte_lists(&m.enrs));
            }
            Message::FindContent(m) => {
                out.extend_from_slice(&4u32.to_le_bytes());
                out.extend_from_slice(&m.content_key);
            }
            Message::Content(union) => match union {
                Content::ConnectionId(id) => {
                    out.push(0);
                    out.extend_from_slice(&id.to_be_bytes());
                }
                Content::Payload(payload) => {
                    out.push(1);
                    out.extend_from_slice(payload);
                }
                Content::Enrs(enrs) => {
                    out.push(2);
                    out.extend_from_slice(&encode_byte_lists(enrs));
                }
            },
            Message::Offer(m) => {
                out.extend_from_slice(&4u32.to_le_bytes());
                out.extend_from_slice(&encode_byte_lists(&m.content_keys));
            }
            Message::Accept(m) => {
                out.extend_from_slice(&m.connection_id.to_be_bytes());
                out.extend_from_slice(&6u32.to_le_bytes());
                out.extend_from_slice(&encode_bitlist(&m.content_keys));
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        let (&selector, body) = buf.split_first().ok_or(WireError::Empty)?;
        match selector {
            PING_SELECTOR => {
                let (enr_seq, custom_payload) = decode_ping_pong(body)?;
                Ok(Message::Ping(Ping {
                    enr_seq,
                    custom_payload,
                }))
            }
            PONG_SELECTOR => {
                let (enr_seq, custom_payload) = decode_ping_pong(body)?;
                Ok(Message::Pong(Pong {
                    enr_seq,
                    custom_payload,
                }))
            }
            FINDNODES_SELECTOR => {
                let region = single_variable_region(body, 4)?;
                if region.len() % 2 != 0 {
                    return Err(WireError::BadElementSize);
                }
                let count = region.len() / 2;
                if count > MAX_DISTANCES {
                    return Err(WireError::ListTooLong(MAX_DISTANCES));
                }
                let distances = region
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                Ok(Message::FindNodes(FindNodes { distances }))
            }
            NODES_SELECTOR => {
                if body.is_empty() {
                    return Err(WireError::Truncated);
                }
                let total = body[0];
                let region = single_variable_region(&body[1..], 5)?;
                let enrs = decode_byte_lists(region, NODES_LIMIT)?;
                Ok(Message::Nodes(Nodes { total, enrs }))
            }
            FINDCONTENT_SELECTOR => {
                let region = single_variable_region(body, 4)?;
                Ok(Message::FindContent(FindContent {
                    content_key: Bytes::copy_from_slice(region),
                }))
            }
            CONTENT_SELECTOR => {
                let (&arm, rest) = body.split_first().ok_or(WireError::Truncated)?;
                let union = match arm {
                    0 => {
                        if rest.len() != 2 {
                            return Err(WireError::Truncated);
                        }
                        Content::ConnectionId(u16::from_be_bytes([rest[0], rest[1]]))
                    }
                    1 => {
                        if rest.len() > MAX_INLINE_CONTENT {
                            return Err(WireError::PayloadTooLarge);
                        }
                        Content::Payload(Bytes::copy_from_slice(rest))
                    }
                    2 => Content::Enrs(decode_byte_lists(rest, NODES_LIMIT)?),
                    other => return Err(WireError::UnknownUnionArm(other)),
                };
                Ok(Message::Content(union))
            }
            OFFER_SELECTOR => {
                let region = single_variable_region(body, 4)?;
                let content_keys = decode_byte_lists(region, MAX_OFFER_KEYS)?;
                if content_keys.is_empty() {
                    return Err(WireError::BadOffset);
                }
                Ok(Message::Offer(Offer { content_keys }))
            }
            ACCEPT_SELECTOR => {
                if body.len() < 6 {
                    return Err(WireError::Truncated);
                }
                let connection_id = u16::from_be_bytes([body[0], body[1]]);
                let region = single_variable_region(&body[2..], 6)?;
                let content_keys = decode_bitlist(region, MAX_OFFER_KEYS)?;
                Ok(Message::Accept(Accept {
                    connection_id,
                    content_keys,
                }))
            }
            other => Err(WireError::UnknownSelector(other)),
        }
    }
}

impl Ping {
    /// A ping advertising the given radius.
    pub fn with_radius(enr_seq: u64, radius: &Radius) -> Ping {
        Ping {
            enr_seq,
            custom_payload: Bytes::copy_from_slice(&radius_to_le_bytes(radius)),
        }
    }

    pub fn radius(&self) -> Option<Radius> {
        parse_radius(&self.custom_payload)
    }
}

impl Pong {
    pub fn with_radius(enr_seq: u64, radius: &Radius) -> Pong {
        Pong {
            enr_seq,
            custom_payload: Bytes::copy_from_slice(&radius_to_le_bytes(radius)),
        }
    }

    pub fn radius(&self) -> Option<Radius> {
        parse_radius(&self.custom_payload)
    }
}

fn parse_radius(payload: &[u8]) -> Option<Radius> {
    if payload.len() != RADIUS_BYTES {
        return None;
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(payload);
    Some(radius_from_le_bytes(&bytes))
}

// ── Encoding helpers ──────────────────────────────────────────────────────────

fn encode_ping_pong(out: &mut Vec<u8>, enr_seq: u64, payload: &[u8]) {
    out.extend_from_slice(&enr_seq.to_le_bytes());
    out.extend_from_slice(&12u32.to_le_bytes());
    out.extend_from_slice(payload);
}

fn decode_ping_pong(body: &[u8]) -> Result<(u64, Bytes), WireError> {
    if body.len() < 12 {
        return Err(WireError::Truncated);
    }
    let enr_seq = u64::from_le_bytes(body[..8].try_into().expect("length checked"));
    let region = single_variable_region(&body[8..], 12)?;
    Ok((enr_seq, Bytes::copy_from_slice(region)))
}

/// Reads the single trailing variable field of a message whose fixed
/// region ends with one offset. The offset must point exactly to the end
/// of the fixed region.
fn single_variable_region(tail: &[u8], fixed_len: u32) -> Result<&[u8], WireError> {
    if tail.len() < 4 {
        return Err(WireError::Truncated);
    }
    let offset = u32::from_le_bytes(tail[..4].try_into().expect("length checked"));
    if offset != fixed_len {
        return Err(WireError::BadOffset);
    }
    Ok(&tail[4..])
}

/// Encode a list of variable-size byte strings: a table of 4-byte offsets
/// (relative to the start of the list region) followed by the elements.
/// Also used for content value containers that carry item lists.
pub fn encode_byte_lists(items: &[Bytes]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offset = 4 * items.len() as u32;
    for item in items {
        out.extend_from_slice(&offset.to_le_bytes());
        offset += item.len() as u32;
    }
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

pub fn decode_byte_lists(region: &[u8], limit: usize) -> Result<Vec<Bytes>, WireError> {
    if region.is_empty() {
        return Ok(Vec::new());
    }
    if region.len() < 4 {
        return Err(WireError::Truncated);
    }
    let first = u32::from_le_bytes(region[..4].try_into().expect("length checked")) as usize;
    if first % 4 != 0 || first > region.len() {
        return Err(WireError::BadOffset);
    }
    let count = first / 4;
    if count > limit {
        return Err(WireError::ListTooLong(limit));
    }
    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..count {
        let at = i * 4;
        let off =
            u32::from_le_bytes(region[at..at + 4].try_into().expect("length checked")) as usize;
        offsets.push(off);
    }
    offsets.push(region.len());

    let mut items = Vec::with_capacity(count);
    for pair in offsets.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if start > end || end > region.len() {
            return Err(WireError::BadOffset);
        }
        items.push(Bytes::copy_from_slice(&region[start..end]));
    }
    Ok(items)
}

/// Bitlist: bits packed LSB-first, terminated by a single delimiter bit.
fn encode_bitlist(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len() / 8 + 1];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    // Delimiter bit one past the last data bit.
    out[bits.len() / 8] |= 1 << (bits.len() % 8);
    out
}

fn decode_bitlist(bytes: &[u8], limit: usize) -> Result<Vec<bool>, WireError> {
    let last = *bytes.last().ok_or(WireError::BadBitlist)?;
    if last == 0 {
        return Err(WireError::BadBitlist);
    }
    let delimiter = (bytes.len() - 1) * 8 + (7 - last.leading_zeros() as usize);
    if delimiter > limit {
        return Err(WireError::ListTooLong(limit));
    }
    let mut bits = Vec::with_capacity(delimiter);
    for i in 0..delimiter {
        bits.push(bytes[i / 8] & (1 << (i % 8)) != 0);
    }
    Ok(bits)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

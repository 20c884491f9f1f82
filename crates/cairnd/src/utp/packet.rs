//! Bulk-transfer packet format.
//!
//! These types ARE the wire format of the transfer channel. The 20-byte
//! header is big-endian on the wire; zerocopy byteorder fields keep the
//! layout deterministic without any manual shifting.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Transfer protocol version, carried in the low nibble of the first byte.
pub const UTP_VERSION: u8 = 1;

/// Header length on the wire.
pub const HEADER_LEN: usize = 20;

/// Datagram ceiling for transfer packets; payload chunks are split to fit.
pub const UTP_MTU: usize = 1200;

/// Largest data chunk per packet.
pub const MAX_CHUNK: usize = UTP_MTU - HEADER_LEN;

/// Packet type, carried in the high nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    pub fn from_nibble(nibble: u8) -> Option<PacketType> {
        match nibble {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }
}

/// The fixed transfer header.
///
/// Wire size: 20 bytes, all multi-byte fields big-endian.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// High nibble: packet type. Low nibble: version.
    pub type_version: u8,
    /// Extension selector. Always zero; nonzero is dropped.
    pub extension: u8,
    /// Connection id: the sender's receive id.
    pub connection_id: U16<BigEndian>,
    /// Sender clock at transmit time, microseconds (wrapping).
    pub timestamp_micros: U32<BigEndian>,
    /// Sender's measured delay from its peer, microseconds.
    pub timestamp_diff_micros: U32<BigEndian>,
    /// Sender's advertised receive window, bytes.
    pub window_size: U32<BigEndian>,
    /// Sequence number of this packet.
    pub seq_nr: U16<BigEndian>,
    /// Latest in-order sequence received from the peer.
    pub ack_nr: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHeader, [u8; 20]);

impl PacketHeader {
    pub fn packet_type(&self) -> Option<PacketType> {
        if self.type_version & 0x0f != UTP_VERSION {
            return None;
        }
        PacketType::from_nibble(self.type_version >> 4)
    }

    pub fn type_version_byte(packet_type: PacketType) -> u8 {
        ((packet_type as u8) << 4) | UTP_VERSION
    }
}

/// A parsed transfer datagram: header plus payload chunk.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub timestamp_micros: u32,
    pub timestamp_diff_micros: u32,
    pub window_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let header = PacketHeader {
            type_version: PacketHeader::type_version_byte(self.packet_type),
            extension: 0,
            connection_id: U16::new(self.connection_id),
            timestamp_micros: U32::new(self.timestamp_micros),
            timestamp_diff_micros: U32::new(self.timestamp_diff_micros),
            window_size: U32::new(self.window_size),
            seq_nr: U16::new(self.seq_nr),
            ack_nr: U16::new(self.ack_nr),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a datagram. Returns None for anything that is not a valid
    /// version-1 transfer packet.
    pub fn decode(buf: &[u8]) -> Option<Packet> {
        if buf.len() < HEADER_LEN || buf.len() > UTP_MTU {
            return None;
        }
        let header = PacketHeader::read_from_prefix(&buf[..HEADER_LEN])?;
        let packet_type = header.packet_type()?;
        if header.extension != 0 {
            return None;
        }
        Some(Packet {
            packet_type,
            connection_id: header.connection_id.get(),
            timestamp_micros: header.timestamp_micros.get(),
            timestamp_diff_micros: header.timestamp_diff_micros.get(),
            window_size: header.window_size.get(),
            seq_nr: header.seq_nr.get(),
            ack_nr: header.ack_nr.get(),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Could this datagram be a transfer packet? Used by the socket reader to
/// split transfer traffic from discovery frames.
pub fn looks_like_utp(buf: &[u8]) -> bool {
    if buf.len() < HEADER_LEN {
        return false;
    }
    let first = buf[0];
    first & 0x0f == UTP_VERSION && PacketType::from_nibble(first >> 4).is_some()
}

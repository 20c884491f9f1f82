//! XOR metric over 32-byte identifiers.
//!
//! Node ids and content ids share one keyspace; closeness is the XOR of
//! the two values read as an unsigned 256-bit big-endian integer. The
//! routing table buckets entries by the floor of the base-2 logarithm of
//! that distance.

use std::fmt;

/// 32-byte node identifier, derived from the peer's signing key.
pub type NodeId = [u8; 32];

/// 32-byte content identifier, derived from a serialized content key.
pub type ContentId = [u8; 32];

/// Number of routing-table buckets: one per possible log2 distance.
pub const BUCKET_COUNT: usize = 256;

/// XOR distance between two 32-byte identifiers.
///
/// Ordering and equality follow the unsigned 256-bit big-endian value,
/// which for a byte array is plain lexicographic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; 32]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; 32]);
    pub const MAX: Distance = Distance([0xff; 32]);

    /// XOR of two identifiers.
    pub fn between(a: &[u8; 32], b: &[u8; 32]) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = a[i] ^ b[i];
        }
        Distance(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// floor(log2(distance)). None when the distance is zero.
    pub fn log2(&self) -> Option<u32> {
        let lz = self.leading_zeros()?;
        Some(255 - lz)
    }

    /// Bucket index for this distance: `256 - floor(log2(d)) - 1`,
    /// which is exactly the number of leading zero bits.
    pub fn bucket_index(&self) -> Option<usize> {
        self.leading_zeros().map(|lz| lz as usize)
    }

    fn leading_zeros(&self) -> Option<u32> {
        let mut zeros = 0u32;
        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                return Some(zeros + byte.leading_zeros());
            }
        }
        // All bytes zero: the identifiers were equal.
        None
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Responsibility radius: content whose distance from the local node id
/// is at or below this bound is stored. Shrinks under storage pressure;
/// grows only through explicit reconfiguration.
pub type Radius = Distance;

/// Little-endian byte form of a radius, as carried in PING/PONG payloads.
pub fn radius_to_le_bytes(radius: &Radius) -> [u8; 32] {
    let mut out = radius.0;
    out.reverse();
    out
}

/// Parse a radius from its little-endian wire form.
pub fn radius_from_le_bytes(bytes: &[u8; 32]) -> Radius {
    let mut out = *bytes;
    out.reverse();
    Distance(out)
}

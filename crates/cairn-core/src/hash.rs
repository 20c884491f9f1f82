//! Hash helpers used across the crate.
//!
//! Keccak-256 is the protocol hash: content ids, node ids, trie nodes,
//! block hashes. SHA-256 appears only in the accumulator merkleization.

use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest, Keccak256};

/// Keccak-256 of the input bytes.
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data.as_ref()));
    out
}

/// Keccak-256 over two concatenated inputs, without an intermediate buffer.
pub fn keccak256_pair(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// SHA-256 over two 32-byte tree nodes.
pub fn sha256_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_empty_input() {
        // Well-known keccak256("") digest.
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn keccak_pair_matches_concat() {
        let a = b"portal";
        let b = b"network";
        let mut joined = Vec::new();
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        assert_eq!(keccak256_pair(a, b), keccak256(&joined));
    }
}

//! Ethereum Node Records.
//!
//! An ENR is a signed, versioned key/value descriptor of a peer. This
//! module implements the record format directly: RLP decode/encode, the
//! "v4" identity scheme (secp256k1 + keccak), and sequence-number rules.
//! The highest observed sequence number for a node id wins; that rule is
//! enforced by the routing table, not here.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

use crate::distance::NodeId;
use crate::hash::keccak256;
use crate::rlp;

/// Maximum encoded record size, per the ENR specification.
pub const MAX_ENR_SIZE: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrError {
    #[error("rlp: {0}")]
    Rlp(#[from] rlp::RlpError),
    #[error("record exceeds {MAX_ENR_SIZE} bytes")]
    TooLarge,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("pair keys not strictly ascending")]
    KeyOrder,
    #[error("odd number of key/value items")]
    OddPairCount,
    #[error("only byte-string pair values are supported")]
    UnsupportedValue,
    #[error("unsupported identity scheme")]
    UnsupportedIdScheme,
    #[error("signature verification failed")]
    BadSignature,
    #[error("invalid public key")]
    BadPublicKey,
    #[error("invalid hex encoding")]
    BadHex,
}

/// A validated node record. Immutable once decoded; revisions are new
/// records with a higher sequence number.
#[derive(Clone)]
pub struct Enr {
    raw: Vec<u8>,
    seq: u64,
    node_id: NodeId,
    pairs: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Enr {
    /// Decode and verify a signed record.
    pub fn decode(buf: &[u8]) -> Result<Enr, EnrError> {
        if buf.len() > MAX_ENR_SIZE {
            return Err(EnrError::TooLarge);
        }
        let item = rlp::decode(buf)?;
        let items = item.as_list()?;
        if items.len() < 2 {
            return Err(EnrError::MissingField("signature"));
        }
        let signature: [u8; 64] = items[0].as_fixed()?;
        let seq = items[1].as_uint()?;

        let pair_items = &items[2..];
        if pair_items.len() % 2 != 0 {
            return Err(EnrError::OddPairCount);
        }
        let mut pairs = BTreeMap::new();
        let mut prev_key: Option<&[u8]> = None;
        for kv in pair_items.chunks(2) {
            let key = kv[0].as_bytes()?;
            let value = kv[1].as_bytes().map_err(|_| EnrError::UnsupportedValue)?;
            if let Some(prev) = prev_key {
                if key <= prev {
                    return Err(EnrError::KeyOrder);
                }
            }
            prev_key = Some(key);
            pairs.insert(key.to_vec(), value.to_vec());
        }

        let id = pairs.get(b"id".as_slice()).ok_or(EnrError::MissingField("id"))?;
        if id != b"v4" {
            return Err(EnrError::UnsupportedIdScheme);
        }
        let pubkey = pairs
            .get(b"secp256k1".as_slice())
            .ok_or(EnrError::MissingField("secp256k1"))?;

        let verifying_key =
            VerifyingKey::from_sec1_bytes(pubkey).map_err(|_| EnrError::BadPublicKey)?;
        let digest = keccak256(signed_content(seq, &pairs));
        let sig = Signature::from_slice(&signature).map_err(|_| EnrError::BadSignature)?;
        verifying_key
            .verify_prehash(&digest, &sig)
            .map_err(|_| EnrError::BadSignature)?;

        let point = verifying_key.to_encoded_point(false);
        let node_id = keccak256(&point.as_bytes()[1..65]);

        Ok(Enr {
            raw: buf.to_vec(),
            seq,
            node_id,
            pairs,
        })
    }

    /// The signed RLP encoding.
    pub fn encoded(&self) -> &[u8] {
        &self.raw
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Compressed secp256k1 public key.
    pub fn public_key(&self) -> &[u8] {
        self.pairs
            .get(b"secp256k1".as_slice())
            .expect("validated at decode")
    }

    /// IPv4 address + UDP port, when both are advertised.
    pub fn udp4_socket(&self) -> Option<SocketAddrV4> {
        let ip_bytes = self.pairs.get(b"ip".as_slice())?;
        if ip_bytes.len() != 4 {
            return None;
        }
        let ip = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);
        let port_bytes = self.pairs.get(b"udp".as_slice())?;
        let port = match port_bytes.len() {
            1 => u16::from(port_bytes[0]),
            2 => u16::from_be_bytes([port_bytes[0], port_bytes[1]]),
            _ => return None,
        };
        Some(SocketAddrV4::new(ip, port))
    }

    /// Raw value of an arbitrary pair.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs.get(key).map(Vec::as_slice)
    }

    /// Hex form used in config files and logs.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.raw))
    }

    /// Parse the hex form (with or without 0x prefix).
    pub fn from_hex(text: &str) -> Result<Enr, EnrError> {
        let stripped = text.trim().trim_start_matches("0x");
        let bytes = hex::decode(stripped).map_err(|_| EnrError::BadHex)?;
        Enr::decode(&bytes)
    }
}

impl PartialEq for Enr {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Enr {}

impl fmt::Debug for Enr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Enr(id={}.., seq={})",
            &hex::encode(self.node_id)[..8],
            self.seq
        )
    }
}

/// The byte content covered by the record signature:
/// rlp_list(seq, k1, v1, k2, v2, ...).
fn signed_content(seq: u64, pairs: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
    let mut items = vec![rlp::encode_uint(seq)];
    for (key, value) in pairs {
        items.push(rlp::encode_bytes(key));
        items.push(rlp::encode_bytes(value));
    }
    rlp::encode_list(&items)
}

/// Builds and signs a fresh record.
pub struct EnrBuilder {
    seq: u64,
    pairs: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl EnrBuilder {
    pub fn new() -> Self {
        let mut pairs = BTreeMap::new();
        pairs.insert(b"id".to_vec(), b"v4".to_vec());
        EnrBuilder { seq: 1, pairs }
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn ip4(mut self, ip: Ipv4Addr) -> Self {
        self.pairs.insert(b"ip".to_vec(), ip.octets().to_vec());
        self
    }

    pub fn udp4(mut self, port: u16) -> Self {
        let be = port.to_be_bytes();
        let minimal = if be[0] == 0 { vec![be[1]] } else { be.to_vec() };
        self.pairs.insert(b"udp".to_vec(), minimal);
        self
    }

    pub fn pair(mut self, key: &[u8], value: Vec<u8>) -> Self {
        self.pairs.insert(key.to_vec(), value);
        self
    }

    /// Sign the record and return the validated form.
    pub fn build(mut self, key: &SigningKey) -> Result<Enr, EnrError> {
        let verifying = VerifyingKey::from(key);
        let compressed = verifying.to_encoded_point(true);
        self.pairs
            .insert(b"secp256k1".to_vec(), compressed.as_bytes().to_vec());

        let digest = keccak256(signed_content(self.seq, &self.pairs));
        let sig: Signature = key
            .sign_prehash(&digest)
            .map_err(|_| EnrError::BadSignature)?;
        let sig = sig.normalize_s().unwrap_or(sig);

        let mut items = vec![
            rlp::encode_bytes(sig.to_bytes().as_slice()),
            rlp::encode_uint(self.seq),
        ];
        for (k, v) in &self.pairs {
            items.push(rlp::encode_bytes(k));
            items.push(rlp::encode_bytes(v));
        }
        let raw = rlp::encode_list(&items);
        Enr::decode(&raw)
    }
}

impl Default for EnrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Execution-chain header and body views.
//!
//! Only the fields the verifiers consume are decoded; the raw RLP is kept
//! so the header hash is always computed over the original bytes.

use thiserror::Error;

use crate::hash::keccak256;
use crate::rlp;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("rlp: {0}")]
    Rlp(#[from] rlp::RlpError),
    #[error("header has too few fields")]
    TooFewFields,
    #[error("body region malformed")]
    BadBody,
}

/// Decoded view of an execution block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: [u8; 32],
    pub uncles_hash: [u8; 32],
    pub state_root: [u8; 32],
    pub transactions_root: [u8; 32],
    pub receipts_root: [u8; 32],
    pub number: u64,
    raw: Vec<u8>,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Header, HeaderError> {
        let item = rlp::decode(buf)?;
        let fields = item.as_list()?;
        if fields.len() < 15 {
            return Err(HeaderError::TooFewFields);
        }
        Ok(Header {
            parent_hash: fields[0].as_fixed()?,
            uncles_hash: fields[1].as_fixed()?,
            state_root: fields[3].as_fixed()?,
            transactions_root: fields[4].as_fixed()?,
            receipts_root: fields[5].as_fixed()?,
            number: fields[8].as_uint()?,
            raw: buf.to_vec(),
        })
    }

    /// Block hash: keccak over the original header bytes.
    pub fn hash(&self) -> [u8; 32] {
        keccak256(&self.raw)
    }

    pub fn encoded(&self) -> &[u8] {
        &self.raw
    }
}

/// Block body: raw transaction RLP items plus the raw uncle-list RLP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
    pub uncles: Vec<u8>,
}

impl BlockBody {
    /// Wire value format: two offsets, then a list of transaction byte
    /// strings, then the uncle-list RLP.
    pub fn encode(&self) -> Vec<u8> {
        let tx_region = encode_tx_region(&self.transactions);
        let mut out = Vec::with_capacity(8 + tx_region.len() + self.uncles.len());
        out.extend_from_slice(&8u32.to_le_bytes());
        out.extend_from_slice(&(8 + tx_region.len() as u32).to_le_bytes());
        out.extend_from_slice(&tx_region);
        out.extend_from_slice(&self.uncles);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<BlockBody, HeaderError> {
        if buf.len() < 8 {
            return Err(HeaderError::BadBody);
        }
        let tx_off = u32::from_le_bytes(buf[0..4].try_into().expect("length checked")) as usize;
        let uncles_off = u32::from_le_bytes(buf[4..8].try_into().expect("length checked")) as usize;
        if tx_off != 8 || uncles_off < tx_off || uncles_off > buf.len() {
            return Err(HeaderError::BadBody);
        }
        let transactions = decode_tx_region(&buf[tx_off..uncles_off])?;
        Ok(BlockBody {
            transactions,
            uncles: buf[uncles_off..].to_vec(),
        })
    }

    /// keccak of the uncle-list RLP, compared against the header field.
    pub fn uncles_hash(&self) -> [u8; 32] {
        keccak256(&self.uncles)
    }

    /// Root of the ordered transaction trie.
    pub fn transactions_root(&self) -> [u8; 32] {
        crate::trie::ordered_trie_root(&self.transactions)
    }

    /// A body belongs to a header when the reconstructed block commits to
    /// the same transaction root and uncle hash.
    pub fn matches_header(&self, header: &Header) -> bool {
        self.transactions_root() == header.transactions_root
            && self.uncles_hash() == header.uncles_hash
    }
}

fn encode_tx_region(transactions: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offset = 4 * transactions.len() as u32;
    for tx in transactions {
        out.extend_from_slice(&offset.to_le_bytes());
        offset += tx.len() as u32;
    }
    for tx in transactions {
        out.extend_from_slice(tx);
    }
    out
}

fn decode_tx_region(region: &[u8]) -> Result<Vec<Vec<u8>>, HeaderError> {
    if region.is_empty() {
        return Ok(Vec::new());
    }
    if region.len() < 4 {
        return Err(HeaderError::BadBody);
    }
    let first = u32::from_le_bytes(region[0..4].try_into().expect("length checked")) as usize;
    if first % 4 != 0 || first > region.len() {
        return Err(HeaderError::BadBody);
    }
    let count = first / 4;
    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..count {
        let at = i * 4;
        offsets.push(
            u32::from_le_bytes(region[at..at + 4].try_into().expect("length checked")) as usize,
        );
    }
    offsets.push(region.len());
    let mut txs = Vec::with_capacity(count);
    for pair in offsets.windows(2) {
        if pair[0] > pair[1] || pair[1] > region.len() {
            return Err(HeaderError::BadBody);
        }
        txs.push(region[pair[0]..pair[1]].to_vec());
    }
    Ok(txs)
}

//! Epoch accumulators and the pre-merge header proof scheme.
//!
//! An epoch accumulator is an ordered list of (block hash, total
//! difficulty) records, 8192 per epoch. Its Merkle tree flattens each
//! record into two 32-byte leaves, so the tree spans 16384 leaf slots plus
//! a length mix-in; a header's leaf generalized index is therefore
//! `(block_number mod 8192) * 2 + 2 * 16384`.

use thiserror::Error;

use crate::hash::{keccak256, sha256_node};

/// Records per epoch.
pub const EPOCH_SIZE: u64 = 8192;

/// Flattened leaves per epoch tree: two per record.
pub const RECORD_LEAVES: u64 = 2 * EPOCH_SIZE;

/// Siblings in a header inclusion proof: 14 tree levels plus the length
/// mix-in.
pub const PROOF_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccumulatorError {
    #[error("record list length {0} is not a multiple of 64")]
    BadLength(usize),
    #[error("epoch holds more than {EPOCH_SIZE} records")]
    TooManyRecords,
    #[error("proof has wrong length: expected {PROOF_LEN}, got {0}")]
    BadProofLen(usize),
    #[error("block number outside the accumulated range")]
    OutOfRange,
    #[error("inclusion proof does not reconstruct the epoch root")]
    InvalidProof,
}

/// One accumulated header: its hash and the chain's total difficulty
/// after it. The difficulty is stored little-endian, as merkleized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRecord {
    pub block_hash: [u8; 32],
    pub total_difficulty: [u8; 32],
}

impl HeaderRecord {
    pub const ENCODED_LEN: usize = 64;

    pub fn encode(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.block_hash);
        out[32..].copy_from_slice(&self.total_difficulty);
        out
    }

    pub fn decode(buf: &[u8; 64]) -> HeaderRecord {
        let mut block_hash = [0u8; 32];
        let mut total_difficulty = [0u8; 32];
        block_hash.copy_from_slice(&buf[..32]);
        total_difficulty.copy_from_slice(&buf[32..]);
        HeaderRecord {
            block_hash,
            total_difficulty,
        }
    }
}

/// Index of a block's hash leaf within its epoch tree.
pub fn block_number_to_leaf_index(block_number: u64) -> u64 {
    (block_number % EPOCH_SIZE) * 2
}

/// Generalized index of a block's hash leaf: leaf slots start at
/// 2 * RECORD_LEAVES because the length mix-in adds one tree level.
pub fn block_number_to_gindex(block_number: u64) -> u64 {
    block_number_to_leaf_index(block_number) + 2 * RECORD_LEAVES
}

/// A complete epoch's record list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochAccumulator {
    records: Vec<HeaderRecord>,
}

impl EpochAccumulator {
    pub fn new(records: Vec<HeaderRecord>) -> Result<EpochAccumulator, AccumulatorError> {
        if records.len() as u64 > EPOCH_SIZE {
            return Err(AccumulatorError::TooManyRecords);
        }
        Ok(EpochAccumulator { records })
    }

    pub fn from_bytes(buf: &[u8]) -> Result<EpochAccumulator, AccumulatorError> {
        if buf.len() % HeaderRecord::ENCODED_LEN != 0 {
            return Err(AccumulatorError::BadLength(buf.len()));
        }
        let records = buf
            .chunks_exact(HeaderRecord::ENCODED_LEN)
            .map(|chunk| HeaderRecord::decode(chunk.try_into().expect("chunk size is 64")))
            .collect();
        EpochAccumulator::new(records)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.records.len() * HeaderRecord::ENCODED_LEN);
        for record in &self.records {
            out.extend_from_slice(&record.encode());
        }
        out
    }

    pub fn records(&self) -> &[HeaderRecord] {
        &self.records
    }

    /// Content identity of the serialized list. This is what the epoch
    /// accumulator content key commits to.
    pub fn content_hash(&self) -> [u8; 32] {
        keccak256(self.to_bytes())
    }

    /// Merkle root of the epoch tree: the flattened record leaves padded
    /// to RECORD_LEAVES, with the record count mixed in at the top.
    pub fn tree_root(&self) -> [u8; 32] {
        let layers = self.tree_layers();
        let data_root = layers.last().expect("at least one layer")[0];
        sha256_node(&data_root, &length_leaf(self.records.len() as u64))
    }

    /// Inclusion proof for the block at `block_number`, ordered leaf to
    /// root; the final sibling is the length mix-in.
    pub fn build_proof(&self, block_number: u64) -> Result<Vec<[u8; 32]>, AccumulatorError> {
        let epoch_offset = (block_number % EPOCH_SIZE) as usize;
        if epoch_offset >= self.records.len() {
            return Err(AccumulatorError::OutOfRange);
        }
        let layers = self.tree_layers();
        let mut proof = Vec::with_capacity(PROOF_LEN);
        let mut index = block_number_to_leaf_index(block_number) as usize;
        for layer in &layers[..layers.len() - 1] {
            proof.push(layer[index ^ 1]);
            index /= 2;
        }
        proof.push(length_leaf(self.records.len() as u64));
        Ok(proof)
    }

    /// All tree layers, leaves first, over the padded leaf vector.
    fn tree_layers(&self) -> Vec<Vec<[u8; 32]>> {
        let mut leaves = vec![[0u8; 32]; RECORD_LEAVES as usize];
        for (i, record) in self.records.iter().enumerate() {
            leaves[2 * i] = record.block_hash;
            leaves[2 * i + 1] = record.total_difficulty;
        }
        let mut layers = vec![leaves];
        while layers.last().expect("non-empty").len() > 1 {
            let prev = layers.last().expect("non-empty");
            let mut next = Vec::with_capacity(prev.len() / 2);
            for pair in prev.chunks_exact(2) {
                next.push(sha256_node(&pair[0], &pair[1]));
            }
            layers.push(next);
        }
        layers
    }
}

fn length_leaf(count: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&count.to_le_bytes());
    out
}

/// Verify a header inclusion proof against an epoch root.
///
/// `proof` walks from the block-hash leaf to the root; the path is the
/// generalized index of the leaf.
pub fn verify_header_proof(
    epoch_root: &[u8; 32],
    block_hash: &[u8; 32],
    block_number: u64,
    proof: &[[u8; 32]],
) -> Result<(), AccumulatorError> {
    if proof.len() != PROOF_LEN {
        return Err(AccumulatorError::BadProofLen(proof.len()));
    }
    let mut node = *block_hash;
    let mut gindex = block_number_to_gindex(block_number);
    for sibling in proof {
        node = if gindex % 2 == 1 {
            sha256_node(sibling, &node)
        } else {
            sha256_node(&node, sibling)
        };
        gindex /= 2;
    }
    debug_assert_eq!(gindex, 1);
    if node != *epoch_root {
        return Err(AccumulatorError::InvalidProof);
    }
    Ok(())
}

/// The ordered list of historical epoch roots a node trusts. Proof
/// verification resolves a block number to its epoch root through this.
#[derive(Debug, Clone, Default)]
pub struct MasterAccumulator {
    epoch_roots: Vec<[u8; 32]>,
}

impl MasterAccumulator {
    pub fn new(epoch_roots: Vec<[u8; 32]>) -> MasterAccumulator {
        MasterAccumulator { epoch_roots }
    }

    pub fn epoch_count(&self) -> usize {
        self.epoch_roots.len()
    }

    pub fn epoch_root_by_index(&self, index: usize) -> Option<[u8; 32]> {
        self.epoch_roots.get(index).copied()
    }

    pub fn epoch_root_by_block_number(&self, block_number: u64) -> Option<[u8; 32]> {
        self.epoch_root_by_index((block_number / EPOCH_SIZE) as usize)
    }

    /// Highest block number covered by the accumulated epochs.
    pub fn covers(&self, block_number: u64) -> bool {
        (block_number / EPOCH_SIZE) < self.epoch_roots.len() as u64
    }

    /// Verify a pre-merge header against the accumulated epoch roots.
    pub fn verify_header(
        &self,
        block_hash: &[u8; 32],
        block_number: u64,
        proof: &[[u8; 32]],
    ) -> Result<(), AccumulatorError> {
        let root = self
            .epoch_root_by_block_number(block_number)
            .ok_or(AccumulatorError::OutOfRange)?;
        verify_header_proof(&root, block_hash, block_number, proof)
    }
}

//! Content keys and content-id derivation.
//!
//! A content key is a tagged union, encoded as `selector ‖ body`. The
//! content id — the key's position in the overlay keyspace — is the
//! keccak-256 of the serialized key for both the History and State
//! sub-protocols.

use thiserror::Error;

use crate::distance::ContentId;
use crate::hash::keccak256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentKeyError {
    #[error("empty content key")]
    Empty,
    #[error("unknown content key selector: 0x{0:02x}")]
    UnknownSelector(u8),
    #[error("content key body has wrong length: expected {expected}, got {got}")]
    WrongLength { expected: usize, got: usize },
}

/// Derive a content id from an already-serialized content key.
pub fn serialized_key_to_content_id(serialized: &[u8]) -> ContentId {
    keccak256(serialized)
}

// ── History ───────────────────────────────────────────────────────────────────

pub const HEADER_BY_HASH_SELECTOR: u8 = 0x00;
pub const BLOCK_BODY_SELECTOR: u8 = 0x01;
pub const RECEIPTS_SELECTOR: u8 = 0x02;
pub const EPOCH_ACCUMULATOR_SELECTOR: u8 = 0x03;

/// Content key grammar of the History sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryContentKey {
    /// Header, addressed by block hash. The value is a header-with-proof
    /// container; pre-merge headers carry an accumulator proof.
    HeaderByHash([u8; 32]),
    /// Block body (transactions + uncles), addressed by block hash.
    BlockBody([u8; 32]),
    /// Receipt list, addressed by block hash.
    Receipts([u8; 32]),
    /// A full epoch accumulator, addressed by its epoch root.
    EpochAccumulator([u8; 32]),
}

impl HistoryContentKey {
    pub fn selector(&self) -> u8 {
        match self {
            HistoryContentKey::HeaderByHash(_) => HEADER_BY_HASH_SELECTOR,
            HistoryContentKey::BlockBody(_) => BLOCK_BODY_SELECTOR,
            HistoryContentKey::Receipts(_) => RECEIPTS_SELECTOR,
            HistoryContentKey::EpochAccumulator(_) => EPOCH_ACCUMULATOR_SELECTOR,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (selector, hash) = match self {
            HistoryContentKey::HeaderByHash(h) => (HEADER_BY_HASH_SELECTOR, h),
            HistoryContentKey::BlockBody(h) => (BLOCK_BODY_SELECTOR, h),
            HistoryContentKey::Receipts(h) => (RECEIPTS_SELECTOR, h),
            HistoryContentKey::EpochAccumulator(h) => (EPOCH_ACCUMULATOR_SELECTOR, h),
        };
        let mut out = Vec::with_capacity(33);
        out.push(selector);
        out.extend_from_slice(hash);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<HistoryContentKey, ContentKeyError> {
        let (&selector, body) = buf.split_first().ok_or(ContentKeyError::Empty)?;
        let hash = fixed::<32>(body)?;
        match selector {
            HEADER_BY_HASH_SELECTOR => Ok(HistoryContentKey::HeaderByHash(hash)),
            BLOCK_BODY_SELECTOR => Ok(HistoryContentKey::BlockBody(hash)),
            RECEIPTS_SELECTOR => Ok(HistoryContentKey::Receipts(hash)),
            EPOCH_ACCUMULATOR_SELECTOR => Ok(HistoryContentKey::EpochAccumulator(hash)),
            other => Err(ContentKeyError::UnknownSelector(other)),
        }
    }

    pub fn content_id(&self) -> ContentId {
        serialized_key_to_content_id(&self.encode())
    }

    /// The block hash or epoch root this key addresses.
    pub fn hash(&self) -> [u8; 32] {
        match self {
            HistoryContentKey::HeaderByHash(h)
            | HistoryContentKey::BlockBody(h)
            | HistoryContentKey::Receipts(h)
            | HistoryContentKey::EpochAccumulator(h) => *h,
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

pub const ACCOUNT_TRIE_PROOF_SELECTOR: u8 = 0x00;
pub const CONTRACT_STORAGE_SELECTOR: u8 = 0x01;
pub const BYTECODE_SELECTOR: u8 = 0x02;

/// Content key grammar of the State sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateContentKey {
    /// Merkle-Patricia proof for an account under a specific state root.
    AccountTrieProof {
        address: [u8; 20],
        state_root: [u8; 32],
    },
    /// Proof for one storage slot of a contract under a state root.
    ContractStorage {
        address: [u8; 20],
        slot: [u8; 32],
        state_root: [u8; 32],
    },
    /// Contract bytecode, addressed by account and code hash.
    Bytecode {
        address: [u8; 20],
        code_hash: [u8; 32],
    },
}

impl StateContentKey {
    pub fn selector(&self) -> u8 {
        match self {
            StateContentKey::AccountTrieProof { .. } => ACCOUNT_TRIE_PROOF_SELECTOR,
            StateContentKey::ContractStorage { .. } => CONTRACT_STORAGE_SELECTOR,
            StateContentKey::Bytecode { .. } => BYTECODE_SELECTOR,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.selector()];
        match self {
            StateContentKey::AccountTrieProof {
                address,
                state_root,
            } => {
                out.extend_from_slice(address);
                out.extend_from_slice(state_root);
            }
            StateContentKey::ContractStorage {
                address,
                slot,
                state_root,
            } => {
                out.extend_from_slice(address);
                out.extend_from_slice(slot);
                out.extend_from_slice(state_root);
            }
            StateContentKey::Bytecode { address, code_hash } => {
                out.extend_from_slice(address);
                out.extend_from_slice(code_hash);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<StateContentKey, ContentKeyError> {
        let (&selector, body) = buf.split_first().ok_or(ContentKeyError::Empty)?;
        match selector {
            ACCOUNT_TRIE_PROOF_SELECTOR => {
                expect_len(body, 52)?;
                Ok(StateContentKey::AccountTrieProof {
                    address: fixed_at::<20>(body, 0),
                    state_root: fixed_at::<32>(body, 20),
                })
            }
            CONTRACT_STORAGE_SELECTOR => {
                expect_len(body, 84)?;
                Ok(StateContentKey::ContractStorage {
                    address: fixed_at::<20>(body, 0),
                    slot: fixed_at::<32>(body, 20),
                    state_root: fixed_at::<32>(body, 52),
                })
            }
            BYTECODE_SELECTOR => {
                expect_len(body, 52)?;
                Ok(StateContentKey::Bytecode {
                    address: fixed_at::<20>(body, 0),
                    code_hash: fixed_at::<32>(body, 20),
                })
            }
            other => Err(ContentKeyError::UnknownSelector(other)),
        }
    }

    pub fn content_id(&self) -> ContentId {
        serialized_key_to_content_id(&self.encode())
    }

    pub fn address(&self) -> [u8; 20] {
        match self {
            StateContentKey::AccountTrieProof { address, .. }
            | StateContentKey::ContractStorage { address, .. }
            | StateContentKey::Bytecode { address, .. } => *address,
        }
    }
}

fn expect_len(body: &[u8], expected: usize) -> Result<(), ContentKeyError> {
    if body.len() != expected {
        return Err(ContentKeyError::WrongLength {
            expected,
            got: body.len(),
        });
    }
    Ok(())
}

fn fixed<const N: usize>(body: &[u8]) -> Result<[u8; N], ContentKeyError> {
    expect_len(body, N)?;
    Ok(fixed_at::<N>(body, 0))
}

fn fixed_at<const N: usize>(body: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&body[at..at + N]);
    out
}

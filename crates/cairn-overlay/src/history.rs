//! History sub-protocol: headers, bodies, receipts, and epoch
//! accumulators.
//!
//! Every value format carries its own proof obligation: headers hash to
//! their key (pre-merge headers additionally prove accumulator
//! inclusion), bodies and receipts re-commit to the stored header, and an
//! epoch accumulator hashes to its epoch root.

use std::sync::Arc;

use bytes::Bytes;
use cairn_core::accumulator::{EpochAccumulator, MasterAccumulator, PROOF_LEN};
use cairn_core::content::{ContentKeyError, HistoryContentKey};
use cairn_core::distance::ContentId;
use cairn_core::hash::keccak256;
use cairn_core::header::{BlockBody, Header};
use cairn_core::trie::ordered_trie_root;
use cairn_core::wire::{decode_byte_lists, encode_byte_lists, ProtocolId};

use crate::protocol::{ContentReader, SubProtocol, VerifyError};

/// First post-merge execution block on mainnet; headers from here on
/// carry no accumulator proof.
pub const MAINNET_MERGE_BLOCK: u64 = 15_537_394;

/// Receipt lists are bounded by block gas, far below this.
const MAX_RECEIPTS: usize = 16_384;

/// The header value container: the header RLP plus an optional
/// accumulator inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderWithProof {
    pub header: Vec<u8>,
    pub proof: Option<[[u8; 32]; PROOF_LEN]>,
}

impl HeaderWithProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.header.len() + 1 + PROOF_LEN * 32);
        out.extend_from_slice(&8u32.to_le_bytes());
        out.extend_from_slice(&(8 + self.header.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.header);
        match &self.proof {
            None => out.push(0),
            Some(proof) => {
                out.push(1);
                for sibling in proof {
                    out.extend_from_slice(sibling);
                }
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<HeaderWithProof, VerifyError> {
        let malformed = || VerifyError::Decode("malformed header-with-proof".to_string());
        if buf.len() < 9 {
            return Err(malformed());
        }
        let header_off =
            u32::from_le_bytes(buf[0..4].try_into().expect("length checked")) as usize;
        let proof_off = u32::from_le_bytes(buf[4..8].try_into().expect("length checked")) as usize;
        if header_off != 8 || proof_off < header_off || proof_off >= buf.len() {
            return Err(malformed());
        }
        let header = buf[header_off..proof_off].to_vec();
        let proof_region = &buf[proof_off..];
        let proof = match proof_region[0] {
            0 => {
                if proof_region.len() != 1 {
                    return Err(malformed());
                }
                None
            }
            1 => {
                if proof_region.len() != 1 + PROOF_LEN * 32 {
                    return Err(malformed());
                }
                let mut proof = [[0u8; 32]; PROOF_LEN];
                for (i, sibling) in proof_region[1..].chunks_exact(32).enumerate() {
                    proof[i].copy_from_slice(sibling);
                }
                Some(proof)
            }
            _ => return Err(malformed()),
        };
        Ok(HeaderWithProof { header, proof })
    }
}

/// Encode a receipt list into the wire value format.
pub fn encode_receipts(receipts: &[Vec<u8>]) -> Vec<u8> {
    let items: Vec<Bytes> = receipts
        .iter()
        .map(|r| Bytes::copy_from_slice(r))
        .collect();
    encode_byte_lists(&items)
}

/// The History specialization: key grammar, id derivation, verifiers.
pub struct HistoryNetwork {
    master: Arc<MasterAccumulator>,
    merge_block: u64,
}

impl HistoryNetwork {
    pub fn new(master: Arc<MasterAccumulator>) -> HistoryNetwork {
        HistoryNetwork {
            master,
            merge_block: MAINNET_MERGE_BLOCK,
        }
    }

    /// Override the proof boundary, for networks other than mainnet.
    pub fn with_merge_block(master: Arc<MasterAccumulator>, merge_block: u64) -> HistoryNetwork {
        HistoryNetwork {
            master,
            merge_block,
        }
    }

    fn verify_header(&self, hash: &[u8; 32], value: &[u8]) -> Result<(), VerifyError> {
        let hwp = HeaderWithProof::decode(value)?;
        let header =
            Header::decode(&hwp.header).map_err(|e| VerifyError::Decode(e.to_string()))?;
        if header.hash() != *hash {
            return Err(VerifyError::HashMismatch);
        }
        match hwp.proof {
            Some(proof) => self
                .master
                .verify_header(hash, header.number, &proof)
                .map_err(|e| VerifyError::Proof(e.to_string())),
            None if header.number < self.merge_block => Err(VerifyError::Proof(
                "pre-merge header offered without an accumulator proof".to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Resolve the already-stored header a body or receipt list commits to.
    fn stored_header(
        &self,
        hash: &[u8; 32],
        reader: &dyn ContentReader,
    ) -> Result<Header, VerifyError> {
        let key = HistoryContentKey::HeaderByHash(*hash).encode();
        let value = reader
            .read(&key)
            .ok_or(VerifyError::MissingDependency("stored header"))?;
        let hwp = HeaderWithProof::decode(&value)?;
        Header::decode(&hwp.header).map_err(|e| VerifyError::Decode(e.to_string()))
    }

    fn verify_body(
        &self,
        hash: &[u8; 32],
        value: &[u8],
        reader: &dyn ContentReader,
    ) -> Result<(), VerifyError> {
        let header = self.stored_header(hash, reader)?;
        let body = BlockBody::decode(value).map_err(|e| VerifyError::Decode(e.to_string()))?;
        if !body.matches_header(&header) {
            return Err(VerifyError::RootMismatch);
        }
        Ok(())
    }

    fn verify_receipts(
        &self,
        hash: &[u8; 32],
        value: &[u8],
        reader: &dyn ContentReader,
    ) -> Result<(), VerifyError> {
        let header = self.stored_header(hash, reader)?;
        let receipts = decode_byte_lists(value, MAX_RECEIPTS)
            .map_err(|e| VerifyError::Decode(e.to_string()))?;
        if ordered_trie_root(&receipts) != header.receipts_root {
            return Err(VerifyError::RootMismatch);
        }
        Ok(())
    }

    fn verify_epoch_accumulator(&self, root: &[u8; 32], value: &[u8]) -> Result<(), VerifyError> {
        EpochAccumulator::from_bytes(value).map_err(|e| VerifyError::Decode(e.to_string()))?;
        if keccak256(value) != *root {
            return Err(VerifyError::HashMismatch);
        }
        Ok(())
    }
}

impl SubProtocol for HistoryNetwork {
    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::History
    }

    fn content_id(&self, key: &[u8]) -> Result<ContentId, ContentKeyError> {
        Ok(HistoryContentKey::decode(key)?.content_id())
    }

    fn verify(
        &self,
        key: &[u8],
        value: &[u8],
        reader: &dyn ContentReader,
    ) -> Result<(), VerifyError> {
        match HistoryContentKey::decode(key)? {
            HistoryContentKey::HeaderByHash(hash) => self.verify_header(&hash, value),
            HistoryContentKey::BlockBody(hash) => self.verify_body(&hash, value, reader),
            HistoryContentKey::Receipts(hash) => self.verify_receipts(&hash, value, reader),
            HistoryContentKey::EpochAccumulator(root) => {
                self.verify_epoch_accumulator(&root, value)
            }
        }
    }
}

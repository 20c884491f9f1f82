//! State sub-protocol: account proofs, contract storage, bytecode.
//!
//! Account and storage values are Merkle-Patricia proof chains anchored
//! at the state root named in the content key; bytecode is plain
//! content-addressed data. Admitted account proofs additionally feed an
//! address → state-root index so callers can order the known roots for an
//! account by its (nonce, balance) trajectory.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use bytes::Bytes;
use cairn_core::content::{ContentKeyError, StateContentKey};
use cairn_core::distance::ContentId;
use cairn_core::hash::keccak256;
use cairn_core::rlp;
use cairn_core::trie::verify_proof;
use cairn_core::wire::{decode_byte_lists, encode_byte_lists, ProtocolId};

use crate::protocol::{ContentReader, SubProtocol, VerifyError};

/// Proof chains stay shallow; the bound only rejects garbage.
const MAX_PROOF_NODES: usize = 1024;

/// Decoded account leaf: [nonce, balance, storage_root, code_hash].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    /// Big-endian, zero-padded to 32 bytes; full-width so ordering never
    /// narrows a balance difference.
    pub balance: [u8; 32],
    pub storage_root: [u8; 32],
    pub code_hash: [u8; 32],
}

impl Account {
    pub fn decode(leaf: &[u8]) -> Result<Account, VerifyError> {
        let decode_err = |e: rlp::RlpError| VerifyError::Decode(e.to_string());
        let item = rlp::decode(leaf).map_err(decode_err)?;
        let fields = item.as_list().map_err(decode_err)?;
        if fields.len() != 4 {
            return Err(VerifyError::Decode("account leaf is not 4 fields".into()));
        }
        let balance_bytes = fields[1].as_bytes().map_err(decode_err)?;
        if balance_bytes.len() > 32 {
            return Err(VerifyError::Decode("balance wider than 256 bits".into()));
        }
        let mut balance = [0u8; 32];
        balance[32 - balance_bytes.len()..].copy_from_slice(balance_bytes);
        Ok(Account {
            nonce: fields[0].as_uint().map_err(decode_err)?,
            balance,
            storage_root: fields[2].as_fixed().map_err(decode_err)?,
            code_hash: fields[3].as_fixed().map_err(decode_err)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let balance_start = self
            .balance
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(32);
        rlp::encode_list(&[
            rlp::encode_uint(self.nonce),
            rlp::encode_bytes(&self.balance[balance_start..]),
            rlp::encode_bytes(&self.storage_root),
            rlp::encode_bytes(&self.code_hash),
        ])
    }
}

/// Encode a proof-node chain into the wire value format.
pub fn encode_proof_value(nodes: &[Vec<u8>]) -> Vec<u8> {
    let items: Vec<Bytes> = nodes.iter().map(|n| Bytes::copy_from_slice(n)).collect();
    encode_byte_lists(&items)
}

fn decode_proof_value(value: &[u8]) -> Result<Vec<Bytes>, VerifyError> {
    decode_byte_lists(value, MAX_PROOF_NODES).map_err(|e| VerifyError::Decode(e.to_string()))
}

/// The State specialization.
#[derive(Default)]
pub struct StateNetwork {
    /// Addresses → state roots they are known under, fed by admission.
    root_index: RwLock<HashMap<[u8; 20], BTreeSet<[u8; 32]>>>,
}

impl StateNetwork {
    pub fn new() -> StateNetwork {
        StateNetwork::default()
    }

    /// Walk an account proof and return the proven account.
    fn account_from_proof(
        address: &[u8; 20],
        state_root: &[u8; 32],
        value: &[u8],
    ) -> Result<Account, VerifyError> {
        let nodes = decode_proof_value(value)?;
        let path = keccak256(address);
        let leaf = verify_proof(state_root, &path, &nodes)
            .map_err(|e| VerifyError::Proof(e.to_string()))?
            .ok_or_else(|| VerifyError::Proof("account absent under state root".into()))?;
        Account::decode(&leaf)
    }

    /// The account a stored proof asserts for (address, state_root), if
    /// that proof has been admitted.
    pub fn account_state(
        &self,
        address: [u8; 20],
        state_root: [u8; 32],
        reader: &dyn ContentReader,
    ) -> Option<Account> {
        let key = StateContentKey::AccountTrieProof {
            address,
            state_root,
        }
        .encode();
        let value = reader.read(&key)?;
        Self::account_from_proof(&address, &state_root, &value).ok()
    }

    /// State roots an address is known under, ordered by the account's
    /// (nonce, balance) ascending. Balance ordering is full 256-bit.
    pub fn known_roots(&self, address: [u8; 20], reader: &dyn ContentReader) -> Vec<[u8; 32]> {
        let roots: Vec<[u8; 32]> = {
            let index = self.root_index.read().expect("state index lock poisoned");
            match index.get(&address) {
                Some(roots) => roots.iter().copied().collect(),
                None => return Vec::new(),
            }
        };
        let mut ordered: Vec<(u64, [u8; 32], [u8; 32])> = roots
            .into_iter()
            .filter_map(|root| {
                self.account_state(address, root, reader)
                    .map(|account| (account.nonce, account.balance, root))
            })
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        ordered.into_iter().map(|(_, _, root)| root).collect()
    }

    fn verify_storage(
        &self,
        address: &[u8; 20],
        slot: &[u8; 32],
        state_root: &[u8; 32],
        value: &[u8],
        reader: &dyn ContentReader,
    ) -> Result<(), VerifyError> {
        let account_key = StateContentKey::AccountTrieProof {
            address: *address,
            state_root: *state_root,
        }
        .encode();
        let account_value = reader
            .read(&account_key)
            .ok_or(VerifyError::MissingDependency("stored account proof"))?;
        let account = Self::account_from_proof(address, state_root, &account_value)?;

        let nodes = decode_proof_value(value)?;
        let path = keccak256(slot);
        verify_proof(&account.storage_root, &path, &nodes)
            .map_err(|e| VerifyError::Proof(e.to_string()))?
            .ok_or_else(|| VerifyError::Proof("slot absent under storage root".into()))?;
        Ok(())
    }
}

impl SubProtocol for StateNetwork {
    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::State
    }

    fn content_id(&self, key: &[u8]) -> Result<ContentId, ContentKeyError> {
        Ok(StateContentKey::decode(key)?.content_id())
    }

    fn verify(
        &self,
        key: &[u8],
        value: &[u8],
        reader: &dyn ContentReader,
    ) -> Result<(), VerifyError> {
        match StateContentKey::decode(key)? {
            StateContentKey::AccountTrieProof {
                address,
                state_root,
            } => {
                Self::account_from_proof(&address, &state_root, value)?;
                Ok(())
            }
            StateContentKey::ContractStorage {
                address,
                slot,
                state_root,
            } => self.verify_storage(&address, &slot, &state_root, value, reader),
            StateContentKey::Bytecode { code_hash, .. } => {
                if keccak256(value) != code_hash {
                    return Err(VerifyError::HashMismatch);
                }
                Ok(())
            }
        }
    }

    fn on_admitted(&self, key: &[u8], _value: &[u8]) {
        if let Ok(StateContentKey::AccountTrieProof {
            address,
            state_root,
        }) = StateContentKey::decode(key)
        {
            self.root_index
                .write()
                .expect("state index lock poisoned")
                .entry(address)
                .or_default()
                .insert(state_root);
        }
    }
}

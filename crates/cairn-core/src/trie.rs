//! Merkle-Patricia trie verification.
//!
//! Two entry points: walking a supplied proof chain from a root to a leaf
//! (account and storage proofs), and computing the root of an
//! index-ordered trie (transaction and receipt lists). Nodes shorter than
//! 32 bytes are embedded in their parent, exactly as the trie
//! specification requires; everything else is referenced by keccak hash.

use thiserror::Error;

use crate::hash::keccak256;
use crate::rlp::{self, Item};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrieError {
    #[error("rlp: {0}")]
    Rlp(#[from] rlp::RlpError),
    #[error("proof node does not hash to its reference")]
    HashMismatch,
    #[error("proof ended before the path was resolved")]
    Exhausted,
    #[error("malformed trie node")]
    Malformed,
}

/// Walk a Merkle proof from `root` toward the 32-byte `key`.
///
/// `proof` is the node chain ordered root-first. Returns the leaf value
/// when the key is present, `None` when the proof shows absence. Any
/// structural defect is an error: absence must be proven, not implied.
pub fn verify_proof(
    root: &[u8; 32],
    key: &[u8; 32],
    proof: &[impl AsRef<[u8]>],
) -> Result<Option<Vec<u8>>, TrieError> {
    let path = key_nibbles(key);
    let mut expected = *root;
    let mut depth = 0usize;
    let mut index = 0usize;

    loop {
        let node_bytes = proof.get(index).ok_or(TrieError::Exhausted)?.as_ref();
        index += 1;
        if keccak256(node_bytes) != expected {
            return Err(TrieError::HashMismatch);
        }
        let node = rlp::decode(node_bytes)?;
        match walk(&node, &path, depth)? {
            Step::Done(value) => return Ok(value),
            Step::Descend(next_hash, next_depth) => {
                expected = next_hash;
                depth = next_depth;
            }
        }
    }
}

enum Step {
    /// Resolution finished inside this node (value found or absence proven).
    Done(Option<Vec<u8>>),
    /// Follow a hashed child reference; the next proof node must match.
    Descend([u8; 32], usize),
}

fn walk(node: &Item<'_>, path: &[u8], depth: usize) -> Result<Step, TrieError> {
    let items = node.as_list().map_err(|_| TrieError::Malformed)?;
    match items.len() {
        17 => {
            if depth == path.len() {
                let value = items[16].as_bytes().map_err(|_| TrieError::Malformed)?;
                return Ok(Step::Done(non_empty(value)));
            }
            let child = &items[path[depth] as usize];
            follow_child(child, path, depth + 1)
        }
        2 => {
            let encoded_path = items[0].as_bytes().map_err(|_| TrieError::Malformed)?;
            let (prefix, is_leaf) = decode_hex_prefix(encoded_path)?;
            if !path[depth..].starts_with(&prefix) {
                // Divergent prefix proves the key is absent.
                return Ok(Step::Done(None));
            }
            let new_depth = depth + prefix.len();
            if is_leaf {
                if new_depth != path.len() {
                    return Ok(Step::Done(None));
                }
                let value = items[1].as_bytes().map_err(|_| TrieError::Malformed)?;
                return Ok(Step::Done(non_empty(value)));
            }
            follow_child(&items[1], path, new_depth)
        }
        _ => Err(TrieError::Malformed),
    }
}

fn follow_child(child: &Item<'_>, path: &[u8], depth: usize) -> Result<Step, TrieError> {
    match child {
        Item::Bytes(b) if b.is_empty() => Ok(Step::Done(None)),
        Item::Bytes(b) if b.len() == 32 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(b);
            Ok(Step::Descend(hash, depth))
        }
        Item::Bytes(_) => Err(TrieError::Malformed),
        // Inline node: recurse without consuming another proof element.
        Item::List(_) => walk(child, path, depth),
    }
}

fn non_empty(value: &[u8]) -> Option<Vec<u8>> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_vec())
    }
}

fn key_nibbles(key: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    for byte in key {
        out.push(byte >> 4);
        out.push(byte & 0x0f);
    }
    out
}

// ── Ordered trie root ─────────────────────────────────────────────────────────

/// Root of the trie mapping rlp(index) → item, used for transaction and
/// receipt commitments.
pub fn ordered_trie_root<T: AsRef<[u8]>>(items: &[T]) -> [u8; 32] {
    let mut pairs: Vec<(Vec<u8>, &[u8])> = items
        .iter()
        .enumerate()
        .map(|(i, v)| (nibbles_of(&rlp::encode_uint(i as u64)), v.as_ref()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.is_empty() {
        return keccak256(rlp::encode_bytes(&[]));
    }
    let refs: Vec<(&[u8], &[u8])> = pairs.iter().map(|(n, v)| (n.as_slice(), *v)).collect();
    keccak256(build_node(&refs, 0))
}

fn nibbles_of(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(byte >> 4);
        out.push(byte & 0x0f);
    }
    out
}

/// Build the encoded node covering `pairs`, all of which share their first
/// `depth` nibbles.
fn build_node(pairs: &[(&[u8], &[u8])], depth: usize) -> Vec<u8> {
    if pairs.len() == 1 {
        let (nibbles, value) = pairs[0];
        return rlp::encode_list(&[
            rlp::encode_bytes(&hex_prefix(&nibbles[depth..], true)),
            rlp::encode_bytes(value),
        ]);
    }

    let common = common_prefix_len(pairs, depth);
    if common > 0 {
        let child = build_node(pairs, depth + common);
        let prefix = &pairs[0].0[depth..depth + common];
        return rlp::encode_list(&[
            rlp::encode_bytes(&hex_prefix(prefix, false)),
            node_ref(child),
        ]);
    }

    // Branch node: group by the nibble at `depth`.
    let mut slots: Vec<Vec<u8>> = vec![rlp::encode_bytes(&[]); 17];
    let mut start = 0usize;
    // A key exhausted at this depth lands in the value slot.
    while start < pairs.len() && pairs[start].0.len() == depth {
        slots[16] = rlp::encode_bytes(pairs[start].1);
        start += 1;
    }
    let mut i = start;
    while i < pairs.len() {
        let nibble = pairs[i].0[depth];
        let mut j = i;
        while j < pairs.len() && pairs[j].0[depth] == nibble {
            j += 1;
        }
        let child = build_node(&pairs[i..j], depth + 1);
        slots[nibble as usize] = node_ref(child);
        i = j;
    }
    rlp::encode_list(&slots)
}

fn common_prefix_len(pairs: &[(&[u8], &[u8])], depth: usize) -> usize {
    let first = &pairs[0].0[depth..];
    let mut len = first.len();
    for (nibbles, _) in &pairs[1..] {
        let rest = &nibbles[depth..];
        let mut shared = 0;
        while shared < len && shared < rest.len() && first[shared] == rest[shared] {
            shared += 1;
        }
        len = shared;
        if len == 0 {
            break;
        }
    }
    len
}

/// Short nodes embed directly; others are referenced by hash.
fn node_ref(encoded: Vec<u8>) -> Vec<u8> {
    if encoded.len() < 32 {
        encoded
    } else {
        rlp::encode_bytes(&keccak256(&encoded))
    }
}

/// Hex-prefix coding of a nibble path, with the leaf flag.
fn hex_prefix(nibbles: &[u8], leaf: bool) -> Vec<u8> {
    let flag: u8 = if leaf { 2 } else { 0 };
    let mut out;
    if nibbles.len() % 2 == 1 {
        out = Vec::with_capacity(1 + nibbles.len() / 2);
        out.push(((flag + 1) << 4) | nibbles[0]);
        for pair in nibbles[1..].chunks_exact(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    } else {
        out = Vec::with_capacity(1 + nibbles.len() / 2);
        out.push(flag << 4);
        for pair in nibbles.chunks_exact(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    }
    out
}

// ── Proof construction ────────────────────────────────────────────────────────
// Building proofs requires the whole trie in memory; retrieval clients
// only ever do this over small local tries (tests, fixtures, gossip
// seeding tools), never over full state.

/// Root of a trie over 32-byte keys.
pub fn trie_root(entries: &std::collections::BTreeMap<[u8; 32], Vec<u8>>) -> [u8; 32] {
    let pairs: Vec<(Vec<u8>, &[u8])> = entries
        .iter()
        .map(|(k, v)| (key_nibbles(k), v.as_slice()))
        .collect();
    if pairs.is_empty() {
        return keccak256(rlp::encode_bytes(&[]));
    }
    let refs: Vec<(&[u8], &[u8])> = pairs.iter().map(|(n, v)| (n.as_slice(), *v)).collect();
    keccak256(build_node(&refs, 0))
}

/// Proof chain (root node first) for `key` over the same entries. Works
/// for absent keys as well: the chain ends at the node proving absence.
pub fn prove(
    entries: &std::collections::BTreeMap<[u8; 32], Vec<u8>>,
    key: &[u8; 32],
) -> Vec<Vec<u8>> {
    let pairs: Vec<(Vec<u8>, &[u8])> = entries
        .iter()
        .map(|(k, v)| (key_nibbles(k), v.as_slice()))
        .collect();
    let refs: Vec<(&[u8], &[u8])> = pairs.iter().map(|(n, v)| (n.as_slice(), *v)).collect();
    let mut nodes = Vec::new();
    if !refs.is_empty() {
        collect_path(&refs, 0, &key_nibbles(key), &mut nodes);
    }
    nodes
}

/// Push the hashed nodes along `path`, in traversal order. Inline nodes
/// are embedded in their parent and never appear separately.
fn collect_path(pairs: &[(&[u8], &[u8])], depth: usize, path: &[u8], out: &mut Vec<Vec<u8>>) {
    let encoded = build_node(pairs, depth);
    if encoded.len() >= 32 || depth == 0 {
        out.push(encoded);
    }
    if pairs.len() == 1 {
        return;
    }
    let common = common_prefix_len(pairs, depth);
    if common > 0 {
        if path[depth..].starts_with(&pairs[0].0[depth..depth + common]) {
            collect_path(pairs, depth + common, path, out);
        }
        return;
    }
    if depth >= path.len() {
        return;
    }
    let nibble = path[depth];
    let mut i = 0usize;
    while i < pairs.len() && pairs[i].0.len() == depth {
        i += 1;
    }
    while i < pairs.len() {
        let n = pairs[i].0[depth];
        let mut j = i;
        while j < pairs.len() && pairs[j].0[depth] == n {
            j += 1;
        }
        if n == nibble {
            collect_path(&pairs[i..j], depth + 1, path, out);
            return;
        }
        i = j;
    }
}

fn decode_hex_prefix(encoded: &[u8]) -> Result<(Vec<u8>, bool), TrieError> {
    let first = *encoded.first().ok_or(TrieError::Malformed)?;
    let flag = first >> 4;
    if flag > 3 {
        return Err(TrieError::Malformed);
    }
    let is_leaf = flag >= 2;
    let odd = flag % 2 == 1;
    let mut nibbles = Vec::new();
    if odd {
        nibbles.push(first & 0x0f);
    } else if first & 0x0f != 0 {
        return Err(TrieError::Malformed);
    }
    for byte in &encoded[1..] {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    Ok((nibbles, is_leaf))
}

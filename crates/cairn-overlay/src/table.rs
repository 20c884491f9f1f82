//! Per-sub-protocol routing table.
//!
//! 256 buckets indexed by log2 XOR distance from the local node id. Each
//! bucket holds up to K live entries ordered by recency of successful
//! liveness check, plus a bounded replacement cache. Inserting into a full
//! bucket does not evict on its own: the caller probes the least-recent
//! entry and reports the outcome, which keeps the ping round-trip out of
//! the table lock.

use std::time::{Duration, Instant};

use cairn_core::distance::{Distance, NodeId, Radius, BUCKET_COUNT};
use cairn_core::enr::Enr;

/// Live entries per bucket.
pub const BUCKET_SIZE: usize = 16;

/// Replacement cache bound, equal to the live bound.
pub const REPLACEMENT_CACHE_SIZE: usize = 16;

/// Consecutive liveness failures before eviction.
pub const MAX_FAILURES: u8 = 3;

/// Base backoff before re-probing an unresponsive peer; doubles per
/// consecutive failure.
pub const PROBE_BACKOFF: Duration = Duration::from_secs(30);

/// A tracked peer.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub enr: Enr,
    /// Last radius the peer advertised in a PONG; MAX until heard.
    pub radius: Radius,
    pub failures: u8,
    pub last_seen: Instant,
    pub next_probe_at: Instant,
    /// Monotonic insertion stamp, the nearest-tie-break.
    inserted_at: u64,
}

impl NodeEntry {
    fn new(enr: Enr, inserted_at: u64) -> NodeEntry {
        let now = Instant::now();
        NodeEntry {
            enr,
            radius: Distance::MAX,
            failures: 0,
            last_seen: now,
            next_probe_at: now,
            inserted_at,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.enr.node_id()
    }
}

#[derive(Debug, Default)]
struct Bucket {
    /// Index 0 is least-recently confirmed live; the tail is freshest.
    live: Vec<NodeEntry>,
    replacements: Vec<NodeEntry>,
}

/// Outcome of an insert attempt.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// Entry added to a bucket with room.
    Inserted,
    /// Known entry refreshed with a newer record revision.
    Updated,
    /// Known entry, no newer revision; nothing changed.
    Unchanged,
    /// Bucket full; entry parked in the replacement cache. The caller
    /// should probe the returned least-recent live entry and report the
    /// result via `confirm_live` or `mark_failure`.
    Pending { probe: Enr },
    /// The local node id is never a table entry.
    SelfEntry,
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    insert_counter: u64,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> RoutingTable {
        RoutingTable {
            local_id,
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::default()).collect(),
            insert_counter: 0,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        Distance::between(&self.local_id, node_id).bucket_index()
    }

    /// Attempt to add or refresh a record.
    pub fn insert(&mut self, enr: Enr) -> InsertOutcome {
        let node_id = enr.node_id();
        let Some(index) = self.bucket_index(&node_id) else {
            return InsertOutcome::SelfEntry;
        };
        let stamp = self.next_stamp();
        let bucket = &mut self.buckets[index];

        if let Some(entry) = bucket.live.iter_mut().find(|e| e.node_id() == node_id) {
            // Sequence numbers are monotonic: only a newer revision wins.
            if enr.seq() > entry.enr.seq() {
                entry.enr = enr;
                return InsertOutcome::Updated;
            }
            return InsertOutcome::Unchanged;
        }

        if bucket.live.len() < BUCKET_SIZE {
            bucket.live.push(NodeEntry::new(enr, stamp));
            return InsertOutcome::Inserted;
        }

        if let Some(cached) = bucket
            .replacements
            .iter_mut()
            .find(|e| e.node_id() == node_id)
        {
            if enr.seq() > cached.enr.seq() {
                cached.enr = enr;
            }
        } else {
            if bucket.replacements.len() >= REPLACEMENT_CACHE_SIZE {
                bucket.replacements.remove(0);
            }
            bucket.replacements.push(NodeEntry::new(enr, stamp));
        }

        let probe = bucket.live[0].enr.clone();
        InsertOutcome::Pending { probe }
    }

    /// Record a successful liveness check: the entry becomes most-recent
    /// and its failure state clears.
    pub fn confirm_live(&mut self, node_id: &NodeId) {
        let Some(index) = self.bucket_index(node_id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.live.iter().position(|e| e.node_id() == *node_id) {
            let mut entry = bucket.live.remove(pos);
            entry.failures = 0;
            entry.last_seen = Instant::now();
            entry.next_probe_at = Instant::now();
            bucket.live.push(entry);
        }
    }

    /// Record a failed liveness check. Returns the evicted record after
    /// the third consecutive failure, with a replacement promoted.
    pub fn mark_failure(&mut self, node_id: &NodeId) -> Option<Enr> {
        let Some(index) = self.bucket_index(node_id) else {
            return None;
        };
        let bucket = &mut self.buckets[index];
        let pos = bucket.live.iter().position(|e| e.node_id() == *node_id)?;
        let entry = &mut bucket.live[pos];
        entry.failures += 1;
        if entry.failures >= MAX_FAILURES {
            let evicted = bucket.live.remove(pos);
            Self::promote_replacement(bucket);
            return Some(evicted.enr);
        }
        let backoff = PROBE_BACKOFF * 2u32.saturating_pow(u32::from(entry.failures) - 1);
        entry.next_probe_at = Instant::now() + backoff;
        None
    }

    /// Drop an entry outright and promote from the replacement cache.
    pub fn remove(&mut self, node_id: &NodeId) -> Option<Enr> {
        let index = self.bucket_index(node_id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.live.iter().position(|e| e.node_id() == *node_id)?;
        let removed = bucket.live.remove(pos);
        Self::promote_replacement(bucket);
        Some(removed.enr)
    }

    fn promote_replacement(bucket: &mut Bucket) {
        if bucket.live.len() < BUCKET_SIZE {
            if let Some(promoted) = bucket.replacements.pop() {
                bucket.live.push(promoted);
            }
        }
    }

    /// Accept a record revision only if its sequence is strictly newer.
    pub fn update_seq(&mut self, enr: Enr) -> bool {
        let node_id = enr.node_id();
        let Some(index) = self.bucket_index(&node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        if let Some(entry) = bucket.live.iter_mut().find(|e| e.node_id() == node_id) {
            if enr.seq() > entry.enr.seq() {
                entry.enr = enr;
                return true;
            }
        }
        false
    }

    /// Record the radius a peer advertised.
    pub fn set_radius(&mut self, node_id: &NodeId, radius: Radius) {
        if let Some(index) = self.bucket_index(node_id) {
            if let Some(entry) = self.buckets[index]
                .live
                .iter_mut()
                .find(|e| e.node_id() == *node_id)
            {
                entry.radius = radius;
            }
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&NodeEntry> {
        let index = self.bucket_index(node_id)?;
        self.buckets[index]
            .live
            .iter()
            .find(|e| e.node_id() == *node_id)
    }

    /// Up to k records closest to the target by XOR distance. Ties break
    /// toward the earlier-inserted entry.
    pub fn nearest(&self, target: &[u8; 32], k: usize) -> Vec<Enr> {
        self.nearest_excluding(target, k, None)
    }

    pub fn nearest_excluding(
        &self,
        target: &[u8; 32],
        k: usize,
        exclude: Option<&NodeId>,
    ) -> Vec<Enr> {
        let mut scored: Vec<(Distance, u64, &NodeEntry)> = self
            .buckets
            .iter()
            .flat_map(|b| b.live.iter())
            .filter(|e| exclude.map_or(true, |x| e.node_id() != *x))
            .map(|e| {
                (
                    Distance::between(&e.node_id(), target),
                    e.inserted_at,
                    e,
                )
            })
            .collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.into_iter().take(k).map(|(_, _, e)| e.enr.clone()).collect()
    }

    /// Entries whose log2 distance from the local node equals `distance`.
    pub fn entries_at_log_distance(&self, distance: u16) -> Vec<Enr> {
        if distance == 0 || distance > BUCKET_COUNT as u16 {
            return Vec::new();
        }
        // log2 distance d lives in bucket 256 - d.
        let index = BUCKET_COUNT - distance as usize;
        self.buckets[index]
            .live
            .iter()
            .map(|e| e.enr.clone())
            .collect()
    }

    /// All live entries; gossip selection filters these by radius.
    pub fn entries(&self) -> Vec<NodeEntry> {
        self.buckets
            .iter()
            .flat_map(|b| b.live.iter().cloned())
            .collect()
    }

    /// Entries due for a liveness re-probe.
    pub fn probe_candidates(&self, now: Instant) -> Vec<Enr> {
        self.buckets
            .iter()
            .flat_map(|b| b.live.iter())
            .filter(|e| e.failures > 0 && e.next_probe_at <= now)
            .map(|e| e.enr.clone())
            .collect()
    }

    /// The entry whose liveness information is stalest.
    pub fn least_recently_seen(&self) -> Option<Enr> {
        self.buckets
            .iter()
            .flat_map(|b| b.live.iter())
            .min_by_key(|e| e.last_seen)
            .map(|e| e.enr.clone())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_stamp(&mut self) -> u64 {
        self.insert_counter += 1;
        self.insert_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::enr::EnrBuilder;
    use k256::ecdsa::SigningKey;
    use std::net::Ipv4Addr;

    fn key(seed: u16) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[30..].copy_from_slice(&seed.to_be_bytes());
        bytes[0] = 1;
        SigningKey::from_slice(&bytes).unwrap()
    }

    fn enr(seed: u16) -> Enr {
        enr_with_seq(seed, 1)
    }

    fn enr_with_seq(seed: u16, seq: u64) -> Enr {
        EnrBuilder::new()
            .seq(seq)
            .ip4(Ipv4Addr::new(127, 0, 0, 1))
            .udp4(9000 + seed)
            .build(&key(seed))
            .unwrap()
    }

    fn table() -> RoutingTable {
        RoutingTable::new([0u8; 32])
    }

    #[test]
    fn insert_and_lookup() {
        let mut table = table();
        let record = enr(1);
        assert!(matches!(table.insert(record.clone()), InsertOutcome::Inserted));
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(&record.node_id()).unwrap().enr.node_id(),
            record.node_id()
        );
    }

    #[test]
    fn local_id_never_inserted() {
        let record = enr(1);
        let mut table = RoutingTable::new(record.node_id());
        assert!(matches!(table.insert(record), InsertOutcome::SelfEntry));
        assert!(table.is_empty());
    }

    #[test]
    fn bucket_index_invariant_holds_for_every_entry() {
        let mut table = table();
        for seed in 1..=200u16 {
            table.insert(enr(seed));
        }
        for entry in table.entries() {
            let d = Distance::between(&table.local_id(), &entry.node_id());
            let log2 = d.log2().unwrap() as usize;
            let expected = 256 - log2 - 1;
            assert_eq!(d.bucket_index().unwrap(), expected);
        }
    }

    #[test]
    fn seq_update_is_monotonic() {
        let mut table = table();
        table.insert(enr_with_seq(5, 2));
        let id = enr(5).node_id();

        // Older revision is ignored.
        assert!(!table.update_seq(enr_with_seq(5, 1)));
        assert_eq!(table.get(&id).unwrap().enr.seq(), 2);

        // Equal revision is ignored.
        assert!(!table.update_seq(enr_with_seq(5, 2)));

        // Newer revision wins.
        assert!(table.update_seq(enr_with_seq(5, 3)));
        assert_eq!(table.get(&id).unwrap().enr.seq(), 3);
    }

    #[test]
    fn third_failure_evicts() {
        let mut table = table();
        let record = enr(9);
        table.insert(record.clone());
        let id = record.node_id();

        assert!(table.mark_failure(&id).is_none());
        assert!(table.mark_failure(&id).is_none());
        let evicted = table.mark_failure(&id);
        assert_eq!(evicted.map(|e| e.node_id()), Some(id));
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn confirm_live_resets_failures_and_moves_to_tail() {
        let mut table = table();
        let record = enr(9);
        table.insert(record.clone());
        let id = record.node_id();
        table.mark_failure(&id);
        table.confirm_live(&id);
        assert_eq!(table.get(&id).unwrap().failures, 0);
        // Two more failures must not evict after the reset.
        assert!(table.mark_failure(&id).is_none());
        assert!(table.mark_failure(&id).is_none());
        assert!(table.get(&id).is_some());
    }

    #[test]
    fn nearest_orders_by_distance() {
        let mut table = table();
        let records: Vec<Enr> = (1..=50u16).map(enr).collect();
        for r in &records {
            table.insert(r.clone());
        }
        let target = records[10].node_id();
        let nearest = table.nearest(&target, 5);
        assert_eq!(nearest.len(), 5);
        assert_eq!(nearest[0].node_id(), target);
        for pair in nearest.windows(2) {
            let d0 = Distance::between(&pair[0].node_id(), &target);
            let d1 = Distance::between(&pair[1].node_id(), &target);
            assert!(d0 <= d1);
        }
    }

    #[test]
    fn nearest_excluding_drops_requester() {
        let mut table = table();
        for seed in 1..=10u16 {
            table.insert(enr(seed));
        }
        let excluded = enr(3).node_id();
        let nearest = table.nearest_excluding(&excluded, 10, Some(&excluded));
        assert!(nearest.iter().all(|e| e.node_id() != excluded));
    }

    #[test]
    fn full_bucket_parks_in_replacement_cache() {
        let mut table = table();
        // Find enough records landing in one bucket by brute force.
        let mut by_bucket: std::collections::HashMap<usize, Vec<Enr>> = Default::default();
        for seed in 1..=2000u16 {
            let record = enr(seed);
            let index = Distance::between(&[0u8; 32], &record.node_id())
                .bucket_index()
                .unwrap();
            by_bucket.entry(index).or_default().push(record);
        }
        let (_, records) = by_bucket
            .into_iter()
            .find(|(_, v)| v.len() > BUCKET_SIZE)
            .expect("some bucket must overflow across 2000 records");

        for record in &records[..BUCKET_SIZE] {
            assert!(matches!(table.insert(record.clone()), InsertOutcome::Inserted));
        }
        let overflow = records[BUCKET_SIZE].clone();
        let outcome = table.insert(overflow.clone());
        let InsertOutcome::Pending { probe } = outcome else {
            panic!("expected Pending, got {outcome:?}");
        };
        // The probe target is the least-recent live entry.
        assert_eq!(probe.node_id(), records[0].node_id());

        // Probe fails three times: the stale entry leaves, the cached
        // newcomer is promoted.
        let probe_id = probe.node_id();
        table.mark_failure(&probe_id);
        table.mark_failure(&probe_id);
        assert!(table.mark_failure(&probe_id).is_some());
        assert!(table.get(&overflow.node_id()).is_some());
    }

    #[test]
    fn entries_at_log_distance_match_buckets() {
        let mut table = table();
        for seed in 1..=100u16 {
            table.insert(enr(seed));
        }
        for entry in table.entries() {
            let d = Distance::between(&table.local_id(), &entry.node_id());
            let log2 = d.log2().unwrap() as u16 + 1;
            let peers = table.entries_at_log_distance(log2);
            assert!(peers.iter().any(|e| e.node_id() == entry.node_id()));
        }
        assert!(table.entries_at_log_distance(0).is_empty());
    }
}

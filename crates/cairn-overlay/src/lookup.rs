//! Iterative lookup state.
//!
//! One state machine serves both FINDNODE and FINDCONTENT lookups: the
//! target is a 32-byte keyspace position, candidates are every record the
//! lookup has observed, and probes are issued α at a time toward the
//! closest unqueried candidates that could still improve the running
//! closest-K set. The async driving loop lives in the protocol layer;
//! this module owns no I/O.

use std::collections::BTreeMap;
use std::time::Duration;

use cairn_core::distance::{Distance, NodeId};
use cairn_core::enr::Enr;

/// Parallelism of iterative lookups.
pub const ALPHA: usize = 3;

/// Closest-set size a lookup converges toward.
pub const LOOKUP_K: usize = 16;

/// Per-probe response timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Whole-lookup deadline.
pub const LOOKUP_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Pending,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    enr: Enr,
    state: CandidateState,
}

/// Candidate bookkeeping for one lookup.
pub struct Lookup {
    target: [u8; 32],
    local_id: NodeId,
    /// Every node ever observed for this lookup, ordered by distance to
    /// the target. Distance is injective per target, so it is the key.
    candidates: BTreeMap<Distance, Candidate>,
    in_flight: usize,
}

impl Lookup {
    pub fn new(target: [u8; 32], local_id: NodeId, seeds: Vec<Enr>) -> Lookup {
        let mut lookup = Lookup {
            target,
            local_id,
            candidates: BTreeMap::new(),
            in_flight: 0,
        };
        lookup.merge(seeds);
        lookup
    }

    pub fn target(&self) -> [u8; 32] {
        self.target
    }

    /// Add newly discovered records as pending candidates. The local node
    /// and already-known nodes are ignored.
    pub fn merge(&mut self, discovered: Vec<Enr>) {
        for enr in discovered {
            let node_id = enr.node_id();
            if node_id == self.local_id {
                continue;
            }
            let distance = Distance::between(&node_id, &self.target);
            self.candidates.entry(distance).or_insert(Candidate {
                enr,
                state: CandidateState::Pending,
            });
        }
    }

    /// Next records to probe: closest pending candidates that can still
    /// improve the closest-K set, bounded by the α parallelism budget.
    pub fn next_batch(&mut self) -> Vec<Enr> {
        let threshold = self.kth_best_distance();
        let mut batch = Vec::new();
        for (distance, candidate) in self.candidates.iter_mut() {
            if self.in_flight + batch.len() >= ALPHA {
                break;
            }
            if candidate.state != CandidateState::Pending {
                continue;
            }
            if let Some(kth) = threshold {
                if *distance >= kth {
                    break;
                }
            }
            candidate.state = CandidateState::InFlight;
            batch.push(candidate.enr.clone());
        }
        self.in_flight += batch.len();
        batch
    }

    /// A probe answered: mark the responder and merge what it returned.
    pub fn on_response(&mut self, from: &NodeId, discovered: Vec<Enr>) {
        self.settle(from, CandidateState::Responded);
        self.merge(discovered);
    }

    /// A probe timed out or failed verification; the node no longer
    /// counts toward the closest set.
    pub fn on_failure(&mut self, from: &NodeId) {
        self.settle(from, CandidateState::Failed);
    }

    fn settle(&mut self, from: &NodeId, state: CandidateState) {
        let distance = Distance::between(from, &self.target);
        if let Some(candidate) = self.candidates.get_mut(&distance) {
            if candidate.state == CandidateState::InFlight {
                self.in_flight -= 1;
            }
            candidate.state = state;
        }
    }

    /// True when no in-flight probe remains and no pending candidate can
    /// improve the closest-K set.
    pub fn is_finished(&self) -> bool {
        if self.in_flight > 0 {
            return false;
        }
        let threshold = self.kth_best_distance();
        !self
            .candidates
            .iter()
            .any(|(distance, c)| match (c.state, threshold) {
                (CandidateState::Pending, Some(kth)) => *distance < kth,
                (CandidateState::Pending, None) => true,
                _ => false,
            })
    }

    /// The K closest responded records, nearest first.
    pub fn closest(&self, k: usize) -> Vec<Enr> {
        self.candidates
            .values()
            .filter(|c| c.state == CandidateState::Responded)
            .take(k)
            .map(|c| c.enr.clone())
            .collect()
    }

    /// Release all candidate state. In-flight requests are not recalled;
    /// their late responses will find nothing to settle against.
    pub fn cancel(&mut self) {
        self.candidates.clear();
        self.in_flight = 0;
    }

    /// Distance of the K-th closest responded candidate, if K responded.
    fn kth_best_distance(&self) -> Option<Distance> {
        let mut responded = 0usize;
        for (distance, candidate) in self.candidates.iter() {
            if candidate.state == CandidateState::Responded {
                responded += 1;
                if responded == LOOKUP_K {
                    return Some(*distance);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::enr::EnrBuilder;
    use k256::ecdsa::SigningKey;
    use std::net::Ipv4Addr;

    fn enr(seed: u16) -> Enr {
        let mut bytes = [0u8; 32];
        bytes[30..].copy_from_slice(&seed.to_be_bytes());
        bytes[0] = 1;
        EnrBuilder::new()
            .ip4(Ipv4Addr::new(127, 0, 0, 1))
            .udp4(9000 + seed)
            .build(&SigningKey::from_slice(&bytes).unwrap())
            .unwrap()
    }

    #[test]
    fn batch_respects_alpha() {
        let seeds: Vec<Enr> = (1..=10).map(enr).collect();
        let mut lookup = Lookup::new([0u8; 32], [0xee; 32], seeds);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), ALPHA);
        // No more probes until something settles.
        assert!(lookup.next_batch().is_empty());

        let first = batch[0].node_id();
        lookup.on_response(&first, vec![]);
        assert_eq!(lookup.next_batch().len(), 1);
    }

    #[test]
    fn batch_prefers_closest_candidates() {
        let seeds: Vec<Enr> = (1..=10).map(enr).collect();
        let target = seeds[4].node_id();
        let mut lookup = Lookup::new(target, [0xee; 32], seeds);
        let batch = lookup.next_batch();
        // The first probe is the node closest to the target: the target
        // node itself, at distance zero... which is in the candidate set.
        assert_eq!(batch[0].node_id(), target);
    }

    #[test]
    fn merge_dedups_and_skips_local() {
        let local = enr(99);
        let mut lookup = Lookup::new([0u8; 32], local.node_id(), vec![]);
        lookup.merge(vec![enr(1), enr(1), local.clone()]);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].node_id(), enr(1).node_id());
    }

    #[test]
    fn finishes_when_candidates_exhausted() {
        let seeds: Vec<Enr> = (1..=2).map(enr).collect();
        let mut lookup = Lookup::new([0u8; 32], [0xee; 32], seeds);
        assert!(!lookup.is_finished());
        let batch = lookup.next_batch();
        for enr in &batch {
            lookup.on_response(&enr.node_id(), vec![]);
        }
        assert!(lookup.is_finished());
        assert_eq!(lookup.closest(16).len(), 2);
    }

    #[test]
    fn failure_excludes_from_closest() {
        let seeds: Vec<Enr> = (1..=3).map(enr).collect();
        let mut lookup = Lookup::new([0u8; 32], [0xee; 32], seeds);
        let batch = lookup.next_batch();
        lookup.on_failure(&batch[0].node_id());
        lookup.on_response(&batch[1].node_id(), vec![]);
        lookup.on_response(&batch[2].node_id(), vec![]);
        assert!(lookup.is_finished());
        let closest = lookup.closest(16);
        assert_eq!(closest.len(), 2);
        assert!(closest.iter().all(|e| e.node_id() != batch[0].node_id()));
    }

    #[test]
    fn responses_widen_the_frontier() {
        let mut lookup = Lookup::new([0u8; 32], [0xee; 32], vec![enr(1)]);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);
        lookup.on_response(&batch[0].node_id(), vec![enr(2), enr(3), enr(4)]);
        assert!(!lookup.is_finished());
        assert_eq!(lookup.next_batch().len(), ALPHA);
    }

    #[test]
    fn cancel_releases_everything() {
        let seeds: Vec<Enr> = (1..=5).map(enr).collect();
        let mut lookup = Lookup::new([0u8; 32], [0xee; 32], seeds);
        lookup.next_batch();
        lookup.cancel();
        assert!(lookup.is_finished());
        assert!(lookup.next_batch().is_empty());
        assert!(lookup.closest(16).is_empty());
    }

    #[test]
    fn converged_lookup_stops_probing_far_candidates() {
        // Fill the closest-K set, then offer a candidate farther than the
        // K-th best: it must not be probed.
        let mut lookup = Lookup::new([0u8; 32], [0xee; 32], vec![]);
        let mut all: Vec<Enr> = (1..=40).map(enr).collect();
        all.sort_by_key(|e| Distance::between(&e.node_id(), &[0u8; 32]));
        let close: Vec<Enr> = all[..LOOKUP_K].to_vec();
        let far = all[LOOKUP_K + 2].clone();

        lookup.merge(close.clone());
        loop {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }
            for enr in batch {
                lookup.on_response(&enr.node_id(), vec![]);
            }
        }
        assert!(lookup.is_finished());

        lookup.merge(vec![far]);
        assert!(lookup.is_finished());
        assert!(lookup.next_batch().is_empty());
    }
}

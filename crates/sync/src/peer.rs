//! Connected-peer bookkeeping: advertised shard capability, per-peer
//! in-flight accounting and assignment.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use shardsync_core::{ContractAddress, PeerId, ShardId, ShardKey};
use tracing::{debug, warn};

/// A peer's advertised capability: the `(contract, shardIds)` pairs it
/// claims to serve, read from the peer-store under the well-known
/// `"ethstorage"` key at connect time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub shards: HashMap<ContractAddress, HashSet<ShardId>>,
}

impl Advertisement {
    pub fn advertises(&self, shard: ShardKey) -> bool {
        self.shards
            .get(&shard.contract)
            .map(|ids| ids.contains(&shard.shard_id))
            .unwrap_or(false)
    }

    /// Parses the length-prefixed `{contract: 20B, shards: list<u64>}[]`
    /// wire form. Returns `None` (peer is rejected) on any malformed entry.
    pub fn parse(entries: &[(ContractAddress, Vec<ShardId>)]) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        let mut shards: HashMap<ContractAddress, HashSet<ShardId>> = HashMap::new();
        for (contract, ids) in entries {
            if ids.is_empty() {
                return None;
            }
            shards.entry(*contract).or_default().extend(ids.iter().copied());
        }
        Some(Self { shards })
    }
}

/// A connected peer's record: identity, advertised capability and the
/// rolling accounting the dispatcher and table use to pick assignments.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub advertisement: Advertisement,
    pub in_flight: u32,
    pub failures: u32,
    rtt_ewma: Option<Duration>,
}

const RTT_EWMA_WEIGHT: f64 = 0.25;

impl PeerRecord {
    pub fn new(peer_id: PeerId, advertisement: Advertisement) -> Self {
        Self {
            peer_id,
            advertisement,
            in_flight: 0,
            failures: 0,
            rtt_ewma: None,
        }
    }

    pub fn record_rtt(&mut self, sample: Duration) {
        self.rtt_ewma = Some(match self.rtt_ewma {
            None => sample,
            Some(prev) => prev.mul_f64(1.0 - RTT_EWMA_WEIGHT) + sample.mul_f64(RTT_EWMA_WEIGHT),
        });
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt_ewma
    }
}

/// Table of connected peers. Enforces a global `maxPeers` limit and an
/// eviction threshold on accumulated per-peer failures, and assigns work
/// via `pick_peer`, breaking ties on in-flight load with a per-shard
/// round-robin cursor rather than hash-map iteration order.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerRecord>,
    max_peers: usize,
    max_peer_failures: u32,
    round_robin_cursors: HashMap<ShardKey, usize>,
}

impl PeerTable {
    pub fn new(max_peers: usize, max_peer_failures: u32) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            max_peer_failures,
            round_robin_cursors: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&peer_id)
    }

    /// Admits a newly connected, already-validated peer. Returns `false`
    /// (caller must close the connection) once `max_peers` is reached.
    pub fn add_peer(&mut self, peer_id: PeerId, advertisement: Advertisement) -> bool {
        if self.peers.len() >= self.max_peers {
            warn!(peer = %peer_id, "peer table full, rejecting connection");
            return false;
        }
        debug!(peer = %peer_id, "peer admitted");
        self.peers.insert(peer_id, PeerRecord::new(peer_id, advertisement));
        true
    }

    /// Removes a disconnected peer, returning its record so the caller can
    /// route any in-flight reservations back to the heal-task.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<PeerRecord> {
        self.peers.remove(&peer_id)
    }

    pub fn record_failure(&mut self, peer_id: PeerId) -> bool {
        let Some(record) = self.peers.get_mut(&peer_id) else {
            return false;
        };
        record.failures += 1;
        let evict = record.failures > self.max_peer_failures;
        if evict {
            warn!(peer = %peer_id, failures = record.failures, "evicting peer after repeated failures");
            self.peers.remove(&peer_id);
        }
        evict
    }

    pub fn reserve(&mut self, peer_id: PeerId) {
        if let Some(record) = self.peers.get_mut(&peer_id) {
            record.in_flight += 1;
        }
    }

    pub fn release(&mut self, peer_id: PeerId) {
        if let Some(record) = self.peers.get_mut(&peer_id) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
    }

    /// The least-loaded peer advertising `shard` with in-flight count below
    /// `max_in_flight`. Ties are broken round-robin across calls for the
    /// same shard so load fans out rather than always landing on the first
    /// peer a hash-map iteration happens to yield.
    pub fn pick_peer(&mut self, shard: ShardKey, max_in_flight: u32) -> Option<PeerId> {
        let mut candidates: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|p| p.advertisement.advertises(shard) && p.in_flight < max_in_flight)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|p| (p.in_flight, p.peer_id));
        let min_load = candidates[0].in_flight;
        let tied: Vec<&PeerRecord> = candidates
            .into_iter()
            .take_while(|p| p.in_flight == min_load)
            .collect();
        let cursor = self.round_robin_cursors.entry(shard).or_insert(0);
        let chosen = tied[*cursor % tied.len()].peer_id;
        *cursor = cursor.wrapping_add(1);
        Some(chosen)
    }

    pub fn peers_advertising(&self, shard: ShardKey) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values().filter(move |p| p.advertisement.advertises(shard))
    }
}

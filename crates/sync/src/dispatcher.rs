//! Matches idle peers to pending work and issues one of the two request
//! protocols, enforcing per-peer concurrency and per-request timeouts.
//! Responsible for the invariant that a kv-index is never in two in-flight
//! requests at once: indices are reserved before a request is sent and
//! released when it completes, times out, or the owning peer disconnects.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shardsync_core::{KvIndex, PeerId, ShardKey};
use shardsync_storage::StorageManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ProtocolError, ValidationError};
use crate::host::Host;
use crate::peer::PeerTable;
use crate::protocol::{
    length_prefix, list_protocol_id, range_protocol_id, ListRequest, RangeRequest, Response,
};
use crate::task::Task;
use crate::validator::{validate_and_write, Prover};

/// Upper bound on a single response frame, generous enough for a full range
/// batch of small blobs; a real deployment would size this from the
/// storage engine's slot size.
const MAX_RESPONSE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub chain_id: u64,
    pub max_in_flight_per_peer: u32,
    pub range_batch: u64,
    pub list_batch: usize,
    pub request_timeout: Duration,
    pub heal_backoff_base: Duration,
    pub heal_backoff_cap: Duration,
}

/// Shared mutable state: the per-shard task table, the peer table, and the
/// set of indices currently reserved by an in-flight request. Protected by
/// a single coarse mutex that is never held across an I/O await point.
pub struct SyncState {
    pub tasks: HashMap<ShardKey, Task>,
    pub peers: PeerTable,
    reserved: HashSet<(ShardKey, KvIndex)>,
}

impl SyncState {
    pub fn new(peers: PeerTable) -> Self {
        Self {
            tasks: HashMap::new(),
            peers,
            reserved: HashSet::new(),
        }
    }
}

pub struct Dispatcher {
    state: Arc<Mutex<SyncState>>,
    host: Arc<dyn Host>,
    storage: Arc<dyn StorageManager>,
    prover: Arc<dyn Prover>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        state: Arc<Mutex<SyncState>>,
        host: Arc<dyn Host>,
        storage: Arc<dyn StorageManager>,
        prover: Arc<dyn Prover>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            host,
            storage,
            prover,
            config,
        })
    }

    /// One dispatch pass over every tracked shard. Spawns at most one new
    /// request per shard this tick; outstanding requests from prior ticks
    /// keep running concurrently and apply their own results when they
    /// land.
    pub async fn dispatch_tick(self: &Arc<Self>) {
        let shards: Vec<ShardKey> = {
            let state = self.state.lock().await;
            state.tasks.keys().copied().collect()
        };
        for shard in shards {
            self.clone().try_dispatch_shard(shard).await;
        }
    }

    async fn try_dispatch_shard(self: Arc<Self>, shard: ShardKey) {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get(&shard) else {
            return;
        };
        if task.done {
            return;
        }

        let pending_range = task
            .sub_tasks
            .iter()
            .find_map(|st| st.pending_range(self.config.range_batch));

        if let Some(range) = pending_range {
            let Some(peer_id) = state.peers.pick_peer(shard, self.config.max_in_flight_per_peer) else {
                return;
            };
            for idx in range.clone() {
                state.reserved.insert((shard, idx));
            }
            state.peers.reserve(peer_id);
            drop(state);
            tokio::spawn(self.clone().run_range_request(shard, peer_id, range));
            return;
        }

        let due = task.heal.due(Instant::now(), self.config.list_batch);
        if !due.is_empty() {
            let Some(peer_id) = state.peers.pick_peer(shard, self.config.max_in_flight_per_peer) else {
                return;
            };
            for idx in &due {
                state.reserved.insert((shard, *idx));
            }
            state.peers.reserve(peer_id);
            drop(state);
            tokio::spawn(self.clone().run_list_request(shard, peer_id, due));
        }
    }

    async fn send_and_receive(&self, peer_id: PeerId, protocol_id: &str, frame: bytes::BytesMut) -> Result<Vec<u8>, ProtocolError> {
        let mut stream = self.host.new_stream(peer_id, protocol_id).await?;
        let framed = length_prefix(&frame);
        stream.write_all(&framed).await?;
        stream.flush().await?;
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    async fn run_range_request(self: Arc<Self>, shard: ShardKey, peer_id: PeerId, range: Range<KvIndex>) {
        let requested: Vec<KvIndex> = range.clone().collect();
        let request_id = rand::random();
        let protocol_id = range_protocol_id(self.config.chain_id);
        let req = RangeRequest {
            request_id,
            contract: shard.contract,
            shard_id: shard.shard_id,
            origin: range.start,
            limit: range.end - range.start,
            max_bytes: MAX_RESPONSE_BYTES,
        };
        let outcome = timeout(
            self.config.request_timeout,
            self.send_and_receive(peer_id, &protocol_id, req.encode()),
        )
        .await;
        self.complete_request(shard, peer_id, requested, outcome).await;
    }

    async fn run_list_request(self: Arc<Self>, shard: ShardKey, peer_id: PeerId, indices: Vec<KvIndex>) {
        let request_id = rand::random();
        let protocol_id = list_protocol_id(self.config.chain_id);
        let req = ListRequest {
            request_id,
            contract: shard.contract,
            shard_id: shard.shard_id,
            indices: indices.clone(),
        };
        let outcome = timeout(
            self.config.request_timeout,
            self.send_and_receive(peer_id, &protocol_id, req.encode()),
        )
        .await;
        self.complete_request(shard, peer_id, indices, outcome).await;
    }

    async fn complete_request(
        self: Arc<Self>,
        shard: ShardKey,
        peer_id: PeerId,
        requested: Vec<KvIndex>,
        outcome: Result<Result<Vec<u8>, ProtocolError>, tokio::time::error::Elapsed>,
    ) {
        let response = match outcome {
            Ok(Ok(bytes)) => match Response::decode(&bytes) {
                Ok(response) => Some(response),
                Err(err) => {
                    warn!(shard = %shard, peer = %peer_id, error = %err, "malformed response frame");
                    None
                }
            },
            Ok(Err(err)) => {
                warn!(shard = %shard, peer = %peer_id, error = %err, "request failed");
                None
            }
            Err(_) => {
                warn!(shard = %shard, peer = %peer_id, "request timed out");
                None
            }
        };

        // Whole-request failure: every requested index heals, peer takes one failure.
        let Some(response) = response else {
            self.apply_outcome(shard, peer_id, requested, HashMap::new(), HashSet::new(), true).await;
            return;
        };

        let mut outcomes = HashMap::new();
        let mut peer_fault_indices = HashSet::new();
        for entry in &response.entries {
            let result = validate_and_write(self.storage.as_ref(), self.prover.as_ref(), shard, entry.kv_index, entry);
            let accepted = result.is_ok();
            match result {
                Err(ValidationError::CommitmentMismatch(idx)) => {
                    debug!(shard = %shard, peer = %peer_id, idx, "rejecting payload, commitment mismatch");
                    peer_fault_indices.insert(idx);
                }
                Err(ValidationError::Storage(ref err)) => {
                    warn!(shard = %shard, peer = %peer_id, idx = entry.kv_index, error = %err, "local write failed, not holding peer at fault");
                }
                Ok(()) => {}
            }
            outcomes.insert(entry.kv_index, accepted);
        }
        self.apply_outcome(shard, peer_id, requested, outcomes, peer_fault_indices, false).await;
    }

    /// Applies one request's results to shared state: releases reservations
    /// and the peer's in-flight slot, advances/heals sub-tasks, and removes
    /// successfully-written indices from the heal-task.
    async fn apply_outcome(
        &self,
        shard: ShardKey,
        peer_id: PeerId,
        requested: Vec<KvIndex>,
        outcomes: HashMap<KvIndex, bool>,
        peer_fault_indices: HashSet<KvIndex>,
        whole_request_failed: bool,
    ) {
        let mut state = self.state.lock().await;

        for idx in &requested {
            state.reserved.remove(&(shard, *idx));
        }
        state.peers.release(peer_id);

        if let Some(task) = state.tasks.get_mut(&shard) {
            for idx in &requested {
                let accepted = outcomes.get(idx).copied().unwrap_or(false);
                if accepted {
                    task.heal.remove(*idx);
                    if let Some(st) = task.sub_task_containing_mut(*idx) {
                        st.confirm(*idx);
                    }
                } else {
                    task.heal.insert_with_backoff(
                        *idx,
                        self.config.heal_backoff_base,
                        self.config.heal_backoff_cap,
                    );
                    if let Some(st) = task.sub_task_containing_mut(*idx) {
                        st.confirm(*idx);
                    }
                }
            }
        }

        if whole_request_failed || !peer_fault_indices.is_empty() {
            state.peers.record_failure(peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Advertisement, PeerTable};
    use crate::task::Task;
    use crate::validator::{Keccak256Prover, Prover};
    use async_trait::async_trait;
    use shardsync_core::{Commitment, ContractAddress, EncodingKind};
    use shardsync_storage::InMemoryStorageManager;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc;

    struct LoopbackHost {
        shard: ShardKey,
        storage: Arc<InMemoryStorageManager>,
    }

    #[async_trait]
    impl Host for LoopbackHost {
        async fn new_stream(&self, _peer_id: PeerId, protocol_id: &str) -> Result<crate::host::BoxedStream, ProtocolError> {
            let (client, server) = duplex(64 * 1024);
            let shard = self.shard;
            let storage = self.storage.clone();
            let is_range = protocol_id.contains("blobs_by_range");
            tokio::spawn(serve_one(server, shard, storage, is_range));
            Ok(Box::pin(client))
        }

        fn set_stream_handler(&self, _protocol_id: &str, _handler: crate::host::StreamHandler) {}

        async fn peerstore_get(&self, _peer_id: PeerId, _key: &str) -> Option<Vec<u8>> {
            None
        }

        async fn peerstore_put(&self, _peer_id: PeerId, _key: &str, _value: Vec<u8>) {}

        fn subscribe_network_events(&self) -> mpsc::Receiver<crate::host::NetworkEvent> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }

        async fn initial_connections(&self) -> Vec<PeerId> {
            vec![]
        }
    }

    async fn serve_one(mut stream: DuplexStream, shard: ShardKey, storage: Arc<InMemoryStorageManager>, is_range: bool) {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();

        let indices: Vec<u64>;
        let request_id;
        if is_range {
            let req = RangeRequest::decode(&body).unwrap();
            request_id = req.request_id;
            indices = (req.origin..req.origin + req.limit).collect();
        } else {
            let req = ListRequest::decode(&body).unwrap();
            request_id = req.request_id;
            indices = req.indices;
        }

        let mut entries = Vec::new();
        for idx in indices {
            // The peer "holds" every index and serves it pre-encoded under
            // keccak256, matching the peer data planted by the test below.
            let raw = format!("value-{idx}").into_bytes();
            let encoded = xor_for_test(&raw);
            let root = Keccak256Prover.get_root(&raw);
            let commitment = Commitment::from_root(&root, false);
            let _ = storage.set_chain_commitment(shard, idx, commitment);
            entries.push(crate::protocol::ResponseEntry {
                miner_address: shardsync_core::MinerAddress([7; 20]),
                kv_index: idx,
                commitment,
                encode_type: EncodingKind::Keccak256,
                encoded_blob: encoded,
            });
        }

        let response = Response {
            request_id,
            status: crate::protocol::ResponseStatus::Ok,
            entries,
        };
        let encoded = response.encode();
        let framed = length_prefix(&encoded);
        stream.write_all(&framed).await.unwrap();
    }

    fn xor_for_test(raw: &[u8]) -> Vec<u8> {
        raw.iter().map(|b| b ^ 0x5A).collect()
    }

    fn shard() -> ShardKey {
        ShardKey::new(ContractAddress::zero(), 0)
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            chain_id: 1,
            max_in_flight_per_peer: 2,
            range_batch: 4,
            list_batch: 4,
            request_timeout: Duration::from_secs(2),
            heal_backoff_base: Duration::from_millis(50),
            heal_backoff_cap: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn dispatch_tick_fetches_a_range_and_writes_through() {
        let storage = Arc::new(InMemoryStorageManager::new(16, EncodingKind::None));
        storage.set_last_kv_index(shard(), 16);
        let host: Arc<dyn Host> = Arc::new(LoopbackHost {
            shard: shard(),
            storage: storage.clone(),
        });

        let mut peers = PeerTable::new(10, 5);
        let advertisement = Advertisement::parse(&[(shard().contract, vec![shard().shard_id])]).unwrap();
        peers.add_peer(PeerId([1; 32]), advertisement);

        let mut state = SyncState::new(peers);
        state.tasks.insert(shard(), Task::fresh(shard(), 16, 16, 16));
        let state = Arc::new(Mutex::new(state));

        let dispatcher = Dispatcher::new(
            state.clone(),
            host,
            storage.clone() as Arc<dyn StorageManager>,
            Arc::new(Keccak256Prover),
            config(),
        );

        dispatcher.dispatch_tick().await;
        // give the spawned request task a chance to run to completion.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(storage.written_count(), 4, "first tick issues one range batch");
        let locked = state.lock().await;
        let task = locked.tasks.get(&shard()).unwrap();
        assert_eq!(task.sub_tasks[0].next, 4);
    }
}

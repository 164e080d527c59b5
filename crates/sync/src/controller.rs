//! Top-level driver: processes connect/disconnect notifications, drives the
//! dispatcher and empty-fill pass, tracks per-shard phase transitions, and
//! gates graceful shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shardsync_core::ShardKey;
use shardsync_storage::{StorageManager, TaskStore};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, SyncState};
use crate::error::SyncError;
use crate::events::{Event, EventBus};
use crate::fill::FillPass;
use crate::host::{Host, NetworkEvent};
use crate::peer::Advertisement;
use crate::protocol::decode_advertisement;
use crate::task::Task;

/// A shard's place in its own state machine, independent of the others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Syncing,
    Healing,
    Done,
}

struct ShardRuntime {
    phase: Phase,
    fill: FillPass,
    last_heal_len: usize,
    last_heal_progress_at: Instant,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub entries_per_shard: u64,
    pub max_sub_task_span: u64,
    pub stall_timeout: Duration,
    pub tick_interval: Duration,
}

pub struct Controller {
    state: Arc<Mutex<SyncState>>,
    dispatcher: Arc<Dispatcher>,
    storage: Arc<dyn StorageManager>,
    task_store: Arc<dyn TaskStore>,
    events: Arc<dyn EventBus>,
    host: Arc<dyn Host>,
    config: ControllerConfig,
    cancel: CancellationToken,
    shard_runtime: Mutex<HashMap<ShardKey, ShardRuntime>>,
    sync_done: AtomicBool,
}

impl Controller {
    pub fn new(
        state: Arc<Mutex<SyncState>>,
        dispatcher: Arc<Dispatcher>,
        storage: Arc<dyn StorageManager>,
        task_store: Arc<dyn TaskStore>,
        events: Arc<dyn EventBus>,
        host: Arc<dyn Host>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            state,
            dispatcher,
            storage,
            task_store,
            events,
            host,
            config,
            cancel: CancellationToken::new(),
            shard_runtime: Mutex::new(HashMap::new()),
            sync_done: AtomicBool::new(false),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sync_done(&self) -> bool {
        self.sync_done.load(Ordering::SeqCst)
    }

    /// Loads persisted tasks for every locally held shard, discarding
    /// entries for shards no longer held and creating fresh tasks for
    /// newly-held shards with none persisted.
    pub async fn bootstrap(&self) -> Result<(), SyncError> {
        let held: Vec<ShardKey> = self.storage.held_shards();
        if held.is_empty() {
            return Err(SyncError::NoShardsHeld);
        }
        let persisted = self.task_store.load_all()?;

        let mut state = self.state.lock().await;
        let mut runtime = self.shard_runtime.lock().await;
        for shard in &held {
            let last_kv_index = self.storage.last_kv_index(*shard)?;
            let task = match persisted.get(shard) {
                Some(p) => Task::from_persisted(*shard, p.clone()),
                None => Task::fresh(
                    *shard,
                    self.config.entries_per_shard,
                    self.config.max_sub_task_span,
                    last_kv_index,
                ),
            };
            runtime.insert(
                *shard,
                ShardRuntime {
                    phase: Phase::Pending,
                    fill: FillPass::new(*shard, self.config.entries_per_shard, last_kv_index),
                    last_heal_len: task.heal.len(),
                    last_heal_progress_at: Instant::now(),
                },
            );
            state.tasks.insert(*shard, task);
        }
        Ok(())
    }

    /// Runs until the cancellation token fires, ticking at `tick_interval`.
    /// Each tick drains any pending network events before dispatching, so
    /// connect/disconnect notifications are never more than one tick stale.
    pub async fn run(&self) {
        let mut events_rx = self.host.subscribe_network_events();
        self.seed_initial_connections().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown requested, draining sync controller");
                    break;
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    self.tick(&mut events_rx).await;
                }
            }
        }
        self.shutdown().await;
    }

    async fn tick(&self, events_rx: &mut tokio::sync::mpsc::Receiver<NetworkEvent>) {
        while let Ok(event) = events_rx.try_recv() {
            self.handle_network_event(event).await;
        }

        self.dispatcher.dispatch_tick().await;
        self.step_fill_passes().await;
        self.check_transitions().await;

        if let Err(err) = self.save_progress().await {
            warn!(error = %err, "failed to persist task progress this tick");
        }
    }

    /// Admits peers already connected before `subscribe_network_events` was
    /// called, so a connection established during host startup isn't
    /// silently missed for having no corresponding event.
    async fn seed_initial_connections(&self) {
        for peer_id in self.host.initial_connections().await {
            let advertisement = self.host.peerstore_get(peer_id, "ethstorage").await;
            self.handle_network_event(NetworkEvent::Connected { peer_id, advertisement }).await;
        }
    }

    async fn handle_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected { peer_id, advertisement } => {
                let Some(raw) = advertisement else {
                    debug!(peer = %peer_id, "no advertisement at connect, rejecting");
                    return;
                };
                let parsed = decode_advertisement(&raw)
                    .ok()
                    .and_then(|entries| Advertisement::parse(&entries));
                let Some(advertisement) = parsed else {
                    debug!(peer = %peer_id, "malformed advertisement, rejecting");
                    return;
                };
                let mut state = self.state.lock().await;
                state.peers.add_peer(peer_id, advertisement);
            }
            NetworkEvent::Disconnected { peer_id } => {
                let mut state = self.state.lock().await;
                state.peers.remove_peer(peer_id);
            }
        }
    }

    /// Advances each shard's empty-fill pass by one slot per tick,
    /// cooperatively, once its range and heal work are both drained.
    async fn step_fill_passes(&self) {
        let shards: Vec<ShardKey> = {
            let state = self.state.lock().await;
            state.tasks.keys().copied().collect()
        };
        let mut runtime = self.shard_runtime.lock().await;
        for shard in shards {
            let ranges_and_heal_drained = {
                let state = self.state.lock().await;
                state
                    .tasks
                    .get(&shard)
                    .map(|t| t.ranges_drained() && t.heal.is_empty())
                    .unwrap_or(false)
            };
            if !ranges_and_heal_drained {
                continue;
            }
            if let Some(rt) = runtime.get_mut(&shard) {
                if !rt.fill.is_complete() {
                    if let Err(err) = rt.fill.step(self.storage.as_ref()).await {
                        warn!(shard = %shard, error = %err, "empty-fill step failed");
                    }
                }
            }
        }
    }

    async fn check_transitions(&self) {
        let mut state = self.state.lock().await;
        let mut runtime = self.shard_runtime.lock().await;
        let mut all_done = true;

        let shards_with_advertising_peer: HashSet<ShardKey> = state
            .tasks
            .keys()
            .filter(|shard| state.peers.peers_advertising(**shard).next().is_some())
            .copied()
            .collect();

        for (shard, task) in state.tasks.iter_mut() {
            let Some(rt) = runtime.get_mut(shard) else {
                continue;
            };

            if rt.phase == Phase::Pending
                && (task.ranges_drained() || shards_with_advertising_peer.contains(shard))
            {
                rt.phase = Phase::Syncing;
            }
            if rt.phase == Phase::Syncing && task.ranges_drained() {
                rt.phase = Phase::Healing;
            }

            if task.heal.len() < rt.last_heal_len {
                rt.last_heal_progress_at = Instant::now();
            } else if task.heal.len() > 0
                && rt.last_heal_progress_at.elapsed() > self.config.stall_timeout
            {
                warn!(shard = %shard, heal_len = task.heal.len(), "heal-task has not shrunk for stallTimeout; shard cannot complete without a peer holding the data");
            }
            rt.last_heal_len = task.heal.len();

            task.clean(rt.fill.is_complete());

            if rt.phase == Phase::Healing && task.done {
                rt.phase = Phase::Done;
                self.events.publish(Event::ShardDone {
                    contract: shard.contract,
                    shard_id: shard.shard_id,
                });
                info!(shard = %shard, "shard sync done");
            }

            if rt.phase != Phase::Done {
                all_done = false;
            }
        }

        if all_done && !self.sync_done.load(Ordering::SeqCst) {
            self.sync_done.store(true, Ordering::SeqCst);
            self.events.publish(Event::AllShardDone);
            info!("all shards synced");
        }
    }

    async fn save_progress(&self) -> Result<(), SyncError> {
        let state = self.state.lock().await;
        for (shard, task) in state.tasks.iter() {
            self.task_store.save(*shard, &task.to_persisted())?;
        }
        Ok(())
    }

    /// Signals shutdown, waits out the drain, and does a best-effort final
    /// save. A save failure is reported but never blocks shutdown.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(err) = self.save_progress().await {
            warn!(error = %err, "best-effort save on shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerTable;
    use shardsync_storage::InMemoryTaskStore;

    #[tokio::test]
    async fn bootstrap_errors_when_no_shards_held() {
        let storage = Arc::new(shardsync_storage::InMemoryStorageManager::new(16, shardsync_core::EncodingKind::None));
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let state = Arc::new(Mutex::new(SyncState::new(PeerTable::new(10, 5))));
        let events: Arc<dyn EventBus> = Arc::new(crate::events::BroadcastEventBus::new(8));
        let storage_dyn: Arc<dyn StorageManager> = storage.clone();

        struct NoHost;
        #[async_trait::async_trait]
        impl Host for NoHost {
            async fn new_stream(&self, _: shardsync_core::PeerId, _: &str) -> Result<crate::host::BoxedStream, crate::error::ProtocolError> {
                unreachable!()
            }
            fn set_stream_handler(&self, _: &str, _: crate::host::StreamHandler) {}
            async fn peerstore_get(&self, _: shardsync_core::PeerId, _: &str) -> Option<Vec<u8>> {
                None
            }
            async fn peerstore_put(&self, _: shardsync_core::PeerId, _: &str, _: Vec<u8>) {}
            fn subscribe_network_events(&self) -> tokio::sync::mpsc::Receiver<NetworkEvent> {
                tokio::sync::mpsc::channel(1).1
            }
            async fn initial_connections(&self) -> Vec<shardsync_core::PeerId> {
                vec![]
            }
        }

        let dispatcher = Dispatcher::new(
            state.clone(),
            Arc::new(NoHost),
            storage_dyn.clone(),
            Arc::new(crate::validator::Keccak256Prover),
            crate::dispatcher::DispatcherConfig {
                chain_id: 1,
                max_in_flight_per_peer: 2,
                range_batch: 8,
                list_batch: 8,
                request_timeout: Duration::from_secs(1),
                heal_backoff_base: Duration::from_millis(10),
                heal_backoff_cap: Duration::from_secs(1),
            },
        );

        let controller = Controller::new(
            state,
            dispatcher,
            storage_dyn,
            task_store,
            events,
            Arc::new(NoHost),
            ControllerConfig {
                entries_per_shard: 16,
                max_sub_task_span: 16,
                stall_timeout: Duration::from_secs(5),
                tick_interval: Duration::from_millis(50),
            },
        );

        let result = controller.bootstrap().await;
        assert!(matches!(result, Err(SyncError::NoShardsHeld)));
    }
}

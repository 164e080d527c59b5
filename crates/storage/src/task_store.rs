use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use shardsync_core::{ContractAddress, KvIndex, ShardKey};

use crate::error::StoreError;

/// On-disk shape of one sub-task: a contiguous range `[first, last]` with a
/// cursor `next` (`next > last` means drained).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSubTask {
    pub first: KvIndex,
    pub last: KvIndex,
    pub next: KvIndex,
}

/// Persisted form of a shard's sync progress: sub-tasks, heal indices (their
/// deadlines are not persisted — on load they reset to zero, allowing
/// immediate retry) and the sticky `done` flag.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedTask {
    pub sub_tasks: Vec<PersistedSubTask>,
    pub heal_indices: Vec<KvIndex>,
    pub done: bool,
}

/// Persistence contract for per-shard sync progress, keyed by
/// `("sync-status", contract, shardId)` under a well-known namespace in the
/// backing key-value database.
pub trait TaskStore: Send + Sync {
    fn save(&self, shard: ShardKey, task: &PersistedTask) -> Result<(), StoreError>;
    fn load(&self, shard: ShardKey) -> Result<Option<PersistedTask>, StoreError>;
    fn load_all(&self) -> Result<HashMap<ShardKey, PersistedTask>, StoreError>;
    fn remove(&self, shard: ShardKey) -> Result<(), StoreError>;
}

fn task_key(shard: ShardKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(12 + 20 + 8);
    key.extend_from_slice(b"sync-status:");
    key.extend_from_slice(&shard.contract.0);
    key.extend_from_slice(&shard.shard_id.to_be_bytes());
    key
}

fn contract_from_suffix(bytes: &[u8]) -> Option<(ContractAddress, u64)> {
    if bytes.len() != 28 {
        return None;
    }
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&bytes[..20]);
    let mut shard_bytes = [0u8; 8];
    shard_bytes.copy_from_slice(&bytes[20..]);
    Some((ContractAddress(addr), u64::from_be_bytes(shard_bytes)))
}

/// In-process task store; used by tests and as the default before a node
/// wrapper wires up persistence.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<ShardKey, PersistedTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn save(&self, shard: ShardKey, task: &PersistedTask) -> Result<(), StoreError> {
        self.tasks.lock().unwrap().insert(shard, task.clone());
        Ok(())
    }

    fn load(&self, shard: ShardKey) -> Result<Option<PersistedTask>, StoreError> {
        Ok(self.tasks.lock().unwrap().get(&shard).cloned())
    }

    fn load_all(&self) -> Result<HashMap<ShardKey, PersistedTask>, StoreError> {
        Ok(self.tasks.lock().unwrap().clone())
    }

    fn remove(&self, shard: ShardKey) -> Result<(), StoreError> {
        self.tasks.lock().unwrap().remove(&shard);
        Ok(())
    }
}

/// `sled`-backed task store: survives restarts under a single embedded
/// database file, keyed under a well-known namespace prefix so other state
/// can share the same database.
#[derive(Debug)]
pub struct SledTaskStore {
    db: sled::Db,
}

impl SledTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }
}

impl TaskStore for SledTaskStore {
    fn save(&self, shard: ShardKey, task: &PersistedTask) -> Result<(), StoreError> {
        let value = serde_json::to_vec(task)?;
        self.db.insert(task_key(shard), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, shard: ShardKey) -> Result<Option<PersistedTask>, StoreError> {
        match self.db.get(task_key(shard))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_all(&self) -> Result<HashMap<ShardKey, PersistedTask>, StoreError> {
        let mut out = HashMap::new();
        for entry in self.db.scan_prefix(b"sync-status:") {
            let (key, value) = entry?;
            let Some(suffix) = key.strip_prefix(b"sync-status:") else {
                continue;
            };
            let Some((contract, shard_id)) = contract_from_suffix(suffix) else {
                continue;
            };
            let task: PersistedTask = serde_json::from_slice(&value)?;
            out.insert(ShardKey::new(contract, shard_id), task);
        }
        Ok(out)
    }

    fn remove(&self, shard: ShardKey) -> Result<(), StoreError> {
        self.db.remove(task_key(shard))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardKey {
        ShardKey::new(ContractAddress::zero(), 7)
    }

    fn sample() -> PersistedTask {
        PersistedTask {
            sub_tasks: vec![PersistedSubTask {
                first: 0,
                last: 15,
                next: 8,
            }],
            heal_indices: vec![2, 9],
            done: false,
        }
    }

    #[test]
    fn in_memory_save_load_roundtrips() {
        let store = InMemoryTaskStore::new();
        store.save(shard(), &sample()).unwrap();
        assert_eq!(store.load(shard()).unwrap(), Some(sample()));
    }

    #[test]
    fn sled_save_load_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledTaskStore::open(dir.path()).unwrap();
            store.save(shard(), &sample()).unwrap();
        }
        let store = SledTaskStore::open(dir.path()).unwrap();
        assert_eq!(store.load(shard()).unwrap(), Some(sample()));
        let all = store.load_all().unwrap();
        assert_eq!(all.get(&shard()), Some(&sample()));
    }

    #[test]
    fn remove_clears_entry() {
        let store = InMemoryTaskStore::new();
        store.save(shard(), &sample()).unwrap();
        store.remove(shard()).unwrap();
        assert_eq!(store.load(shard()).unwrap(), None);
    }
}

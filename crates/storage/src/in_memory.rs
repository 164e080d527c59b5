use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use shardsync_core::{Commitment, EncodingKind, KvIndex, MinerAddress, ShardKey};

use crate::error::StoreError;
use crate::manager::StorageManager;

/// Reference/test-double implementation of [`StorageManager`] backed by
/// in-process maps. A real node backs this capability with an on-disk
/// engine kept in sync with chain events; that engine is out of scope here,
/// mirroring how the codebase this core is grounded on keeps engines (e.g.
/// `InMemoryStore`, `LibmdbxStore`) behind the same trait its business logic
/// is written against.
///
/// The encode/decode transform used here is a reversible XOR mask keyed by
/// the [`EncodingKind`] discriminant. It exists only to make cross-encoding
/// transcoding observable in tests; it is not a stand-in for any real
/// KECCAK_256/ETHASH/BLOB_POSEIDON algorithm, which lives entirely on the
/// external engine side of this trait.
#[derive(Debug)]
pub struct InMemoryStorageManager {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    entries_per_shard: u64,
    local_encoding: EncodingKind,
    held_shards: HashSet<ShardKey>,
    last_kv_index: HashMap<ShardKey, KvIndex>,
    chain_commitments: HashMap<(ShardKey, KvIndex), Commitment>,
    stored: HashMap<(ShardKey, KvIndex), (Vec<u8>, Commitment)>,
}

fn encoding_key(kind: EncodingKind) -> u8 {
    match kind {
        EncodingKind::None => 0x00,
        EncodingKind::Keccak256 => 0x5A,
        EncodingKind::EthHash => 0x3C,
        EncodingKind::BlobPoseidon => 0x7E,
    }
}

fn xor_transform(bytes: &[u8], key: u8) -> Vec<u8> {
    if key == 0 {
        return bytes.to_vec();
    }
    bytes.iter().map(|b| b ^ key).collect()
}

impl InMemoryStorageManager {
    pub fn new(entries_per_shard: u64, local_encoding: EncodingKind) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries_per_shard,
                local_encoding,
                held_shards: HashSet::new(),
                last_kv_index: HashMap::new(),
                chain_commitments: HashMap::new(),
                stored: HashMap::new(),
            }),
        }
    }

    /// Test/setup helper: declares a shard as locally held.
    pub fn add_held_shard(&self, shard: ShardKey) {
        self.inner.lock().unwrap().held_shards.insert(shard);
    }

    /// Test/setup helper: sets the chain's `lastKvIndex` for a shard.
    pub fn set_last_kv_index(&self, shard: ShardKey, last: KvIndex) {
        self.inner.lock().unwrap().last_kv_index.insert(shard, last);
    }

    /// Test/setup helper: installs the authoritative chain commitment for
    /// `index`. Indices without an explicit entry that are below
    /// `last_kv_index` are treated as chain-unknown (tests should set these
    /// explicitly, as a real node would learn them from chain events).
    pub fn set_chain_commitment(&self, shard: ShardKey, index: KvIndex, commitment: Commitment) {
        self.inner
            .lock()
            .unwrap()
            .chain_commitments
            .insert((shard, index), commitment);
    }

    /// Test helper: number of slots written so far.
    pub fn written_count(&self) -> usize {
        self.inner.lock().unwrap().stored.len()
    }
}

impl StorageManager for InMemoryStorageManager {
    fn entries_per_shard(&self) -> u64 {
        self.inner.lock().unwrap().entries_per_shard
    }

    fn local_encoding(&self) -> EncodingKind {
        self.inner.lock().unwrap().local_encoding
    }

    fn held_shards(&self) -> Vec<ShardKey> {
        self.inner.lock().unwrap().held_shards.iter().copied().collect()
    }

    fn last_kv_index(&self, shard: ShardKey) -> Result<KvIndex, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .last_kv_index
            .get(&shard)
            .copied()
            .unwrap_or(0))
    }

    fn chain_commitment(
        &self,
        shard: ShardKey,
        index: KvIndex,
    ) -> Result<Option<Commitment>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let last = inner.last_kv_index.get(&shard).copied().unwrap_or(0);
        if index >= last {
            return Ok(None);
        }
        Ok(inner.chain_commitments.get(&(shard, index)).copied())
    }

    fn try_read(
        &self,
        shard: ShardKey,
        index: KvIndex,
    ) -> Result<Option<(Vec<u8>, Commitment)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .stored
            .get(&(shard, index))
            .cloned())
    }

    fn decode_kv(
        &self,
        _shard: ShardKey,
        _index: KvIndex,
        encoded_blob: &[u8],
        _commitment: Commitment,
        _miner_address: MinerAddress,
        encode_type: EncodingKind,
    ) -> Result<Vec<u8>, StoreError> {
        Ok(xor_transform(encoded_blob, encoding_key(encode_type)))
    }

    fn encode_kv(&self, _shard: ShardKey, _index: KvIndex, raw: &[u8]) -> Result<Vec<u8>, StoreError> {
        let local = self.local_encoding();
        Ok(xor_transform(raw, encoding_key(local)))
    }

    fn commit_blob(
        &self,
        shard: ShardKey,
        index: KvIndex,
        encoded_bytes: Vec<u8>,
        commitment: Commitment,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stored.insert((shard, index), (encoded_bytes, commitment));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsync_core::ContractAddress;

    fn shard() -> ShardKey {
        ShardKey::new(ContractAddress::zero(), 0)
    }

    #[test]
    fn commit_then_read_roundtrips() {
        let mgr = InMemoryStorageManager::new(16, EncodingKind::None);
        let c = Commitment::from_root(&[1; 32], false);
        mgr.commit_blob(shard(), 3, vec![1, 2, 3], c).unwrap();
        let (bytes, commitment) = mgr.try_read(shard(), 3).unwrap().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(commitment, c);
    }

    #[test]
    fn cross_encoding_roundtrips_through_raw() {
        let mgr = InMemoryStorageManager::new(16, EncodingKind::None);
        let raw = vec![10u8, 20, 30];
        let peer_encoded = xor_transform(&raw, encoding_key(EncodingKind::Keccak256));
        let decoded = mgr
            .decode_kv(
                shard(),
                0,
                &peer_encoded,
                Commitment::empty_marker(),
                MinerAddress([0; 20]),
                EncodingKind::Keccak256,
            )
            .unwrap();
        assert_eq!(decoded, raw);
        let local_encoded = mgr.encode_kv(shard(), 0, &decoded).unwrap();
        assert_eq!(local_encoded, raw); // local encoding is NONE
    }

    #[test]
    fn chain_commitment_is_none_beyond_last_kv_index() {
        let mgr = InMemoryStorageManager::new(16, EncodingKind::None);
        mgr.set_last_kv_index(shard(), 4);
        assert!(mgr.chain_commitment(shard(), 4).unwrap().is_none());
        assert!(mgr.chain_commitment(shard(), 10).unwrap().is_none());
    }
}

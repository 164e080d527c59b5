//! Validates a returned blob against the chain's view of its commitment,
//! transcodes it to the local encoding, and writes it through to storage.

use shardsync_core::{Commitment, KvIndex, ShardKey};
use shardsync_storage::StorageManager;
use tracing::debug;

use crate::error::ValidationError;
use crate::protocol::ResponseEntry;

/// Pure function from decoded blob bytes to a content root. A real node
/// backs this with the chunked-hash primitive the chain's commitment
/// scheme specifies; this crate only consumes the contract.
pub trait Prover: Send + Sync {
    fn get_root(&self, decoded_blob: &[u8]) -> [u8; 32];
}

/// Reference prover: the root is the Keccak-256 digest of the decoded
/// bytes. Stands in for whatever chunked commitment scheme the chain
/// actually specifies, which is out of scope here.
#[derive(Debug, Default)]
pub struct Keccak256Prover;

impl Prover for Keccak256Prover {
    fn get_root(&self, decoded_blob: &[u8]) -> [u8; 32] {
        use sha3::{Digest, Keccak256};
        let mut hasher = Keccak256::new();
        hasher.update(decoded_blob);
        hasher.finalize().into()
    }
}

/// Validates one payload against `shard`'s chain view and, if it passes,
/// writes it through to `storage` under the local encoding.
pub fn validate_and_write(
    storage: &dyn StorageManager,
    prover: &dyn Prover,
    shard: ShardKey,
    index: KvIndex,
    payload: &ResponseEntry,
) -> Result<(), ValidationError> {
    let expected = storage
        .chain_commitment(shard, index)?
        .unwrap_or_else(Commitment::empty_marker);

    if payload.commitment != expected {
        debug!(shard = %shard, index, "commitment mismatch against chain view");
        return Err(ValidationError::CommitmentMismatch(index));
    }

    let raw = storage.decode_kv(
        shard,
        index,
        &payload.encoded_blob,
        payload.commitment,
        payload.miner_address,
        payload.encode_type,
    )?;

    // An empty-filling slot has no chunked commitment to recompute: the
    // chain's view is just the marker itself, so any prover root would
    // mismatch it. Only the decoded bytes being empty is checked.
    if expected.is_empty_marker() {
        if !raw.is_empty() {
            debug!(shard = %shard, index, "non-empty payload for empty-filling slot");
            return Err(ValidationError::CommitmentMismatch(index));
        }
    } else {
        let root = prover.get_root(&raw);
        let recomputed = Commitment::from_root(&root, false);
        if recomputed.root_bytes() != expected.root_bytes() {
            debug!(shard = %shard, index, "prover root does not match chain commitment");
            return Err(ValidationError::CommitmentMismatch(index));
        }
    }

    let encoded = storage.encode_kv(shard, index, &raw)?;
    storage.commit_blob(shard, index, encoded, expected)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsync_core::{ContractAddress, EncodingKind, MinerAddress};
    use shardsync_storage::InMemoryStorageManager;

    fn shard() -> ShardKey {
        ShardKey::new(ContractAddress::zero(), 0)
    }

    fn payload_for(raw: &[u8], prover: &Keccak256Prover, encode_type: EncodingKind) -> ResponseEntry {
        let root = prover.get_root(raw);
        ResponseEntry {
            miner_address: MinerAddress([0; 20]),
            kv_index: 0,
            commitment: Commitment::from_root(&root, false),
            encode_type,
            encoded_blob: raw.to_vec(),
        }
    }

    #[test]
    fn matching_commitment_writes_through() {
        let storage = InMemoryStorageManager::new(16, EncodingKind::None);
        storage.set_last_kv_index(shard(), 16);
        let prover = Keccak256Prover;
        let raw = b"hello world".to_vec();
        let payload = payload_for(&raw, &prover, EncodingKind::None);
        storage.set_chain_commitment(shard(), 0, payload.commitment);

        validate_and_write(&storage, &prover, shard(), 0, &payload).unwrap();

        let (stored, commitment) = storage.try_read(shard(), 0).unwrap().unwrap();
        assert_eq!(stored, raw);
        assert_eq!(commitment, payload.commitment);
    }

    #[test]
    fn mismatched_commitment_is_rejected() {
        let storage = InMemoryStorageManager::new(16, EncodingKind::None);
        storage.set_last_kv_index(shard(), 16);
        let prover = Keccak256Prover;
        let payload = payload_for(b"hello", &prover, EncodingKind::None);
        storage.set_chain_commitment(shard(), 0, Commitment::from_root(&[0xFF; 32], false));

        let result = validate_and_write(&storage, &prover, shard(), 0, &payload);
        assert!(matches!(result, Err(ValidationError::CommitmentMismatch(0))));
        assert!(storage.try_read(shard(), 0).unwrap().is_none());
    }

    #[test]
    fn beyond_last_kv_index_expects_empty_marker() {
        let storage = InMemoryStorageManager::new(16, EncodingKind::None);
        storage.set_last_kv_index(shard(), 4);
        let prover = Keccak256Prover;
        let payload = ResponseEntry {
            miner_address: MinerAddress([0; 20]),
            kv_index: 10,
            commitment: Commitment::empty_marker(),
            encode_type: EncodingKind::None,
            encoded_blob: vec![],
        };
        validate_and_write(&storage, &prover, shard(), 10, &payload).unwrap();
    }

    #[test]
    fn writes_are_idempotent_on_identical_commitment() {
        let storage = InMemoryStorageManager::new(16, EncodingKind::None);
        storage.set_last_kv_index(shard(), 16);
        let prover = Keccak256Prover;
        let raw = b"abc".to_vec();
        let payload = payload_for(&raw, &prover, EncodingKind::None);
        storage.set_chain_commitment(shard(), 2, payload.commitment);

        validate_and_write(&storage, &prover, shard(), 2, &payload).unwrap();
        validate_and_write(&storage, &prover, shard(), 2, &payload).unwrap();
        assert_eq!(storage.written_count(), 1);
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of root bytes a [`Commitment`] carries before its flag byte.
///
/// The remaining `32 - HASH_SIZE_IN_CONTRACT - 1` bytes are always zero;
/// they exist only so the commitment occupies a full 32-byte slot on chain.
pub const HASH_SIZE_IN_CONTRACT: usize = 24;

/// Bit 7 of the flag byte marks a slot as the empty-filling placeholder.
pub const EMPTY_FILLING_MASK: u8 = 0b1000_0000;

/// Opaque 20-byte identifier of a storage contract.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractAddress(pub [u8; 20]);

impl ContractAddress {
    pub const fn zero() -> Self {
        Self([0u8; 20])
    }
}

impl fmt::Debug for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<[u8; 20]> for ContractAddress {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// 20-byte address of the miner/peer that produced a blob, as reported in
/// the wire payload. Unrelated to the node's own libp2p-style peer id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MinerAddress(pub [u8; 20]);

impl fmt::Debug for MinerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Shard identifier within a contract. Shard `S` owns kv-indices
/// `[S * entries_per_shard, (S + 1) * entries_per_shard)`.
pub type ShardId = u64;

/// Global, monotonically assigned storage slot identifier.
pub type KvIndex = u64;

/// A 20-byte identity used to key peers in the peer table. Left abstract
/// here; the concrete node-id type lives with whatever `Host` the node
/// wrapper is wired to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A shard coordinate: the unit a [`Task`](crate::task placeholder) tracks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct ShardKey {
    pub contract: ContractAddress,
    pub shard_id: ShardId,
}

impl ShardKey {
    pub fn new(contract: ContractAddress, shard_id: ShardId) -> Self {
        Self { contract, shard_id }
    }

    /// Half-open kv-index range owned by this shard given `entries_per_shard`.
    pub fn index_range(&self, entries_per_shard: u64) -> std::ops::Range<KvIndex> {
        let first = self.shard_id * entries_per_shard;
        first..(first + entries_per_shard)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.contract, self.shard_id)
    }
}

/// Encoding a blob may be stored under. Stored blobs are always in the
/// node's locally configured encoding; peers may hold another and the
/// validator transcodes on the way in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[repr(u8)]
pub enum EncodingKind {
    None = 0,
    Keccak256 = 1,
    EthHash = 2,
    BlobPoseidon = 3,
}

impl EncodingKind {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Keccak256),
            2 => Some(Self::EthHash),
            3 => Some(Self::BlobPoseidon),
            _ => None,
        }
    }

    pub fn as_u64(self) -> u64 {
        self as u8 as u64
    }
}

/// 32-byte on-chain commitment: a truncated content root plus a flag byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment(pub [u8; 32]);

impl Commitment {
    /// Builds a commitment from a full root hash, truncating to
    /// [`HASH_SIZE_IN_CONTRACT`] bytes and setting the empty-filling bit
    /// according to `is_empty`.
    pub fn from_root(root: &[u8], is_empty: bool) -> Self {
        let mut bytes = [0u8; 32];
        let take = root.len().min(HASH_SIZE_IN_CONTRACT);
        bytes[..take].copy_from_slice(&root[..take]);
        if is_empty {
            bytes[HASH_SIZE_IN_CONTRACT] |= EMPTY_FILLING_MASK;
        }
        Self(bytes)
    }

    /// The empty-marker commitment: all-zero root, empty-filling bit set.
    pub fn empty_marker() -> Self {
        Self::from_root(&[], true)
    }

    pub fn root_bytes(&self) -> &[u8] {
        &self.0[..HASH_SIZE_IN_CONTRACT]
    }

    pub fn flags(&self) -> u8 {
        self.0[HASH_SIZE_IN_CONTRACT]
    }

    pub fn is_empty_marker(&self) -> bool {
        self.flags() & EMPTY_FILLING_MASK != 0
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Wire-level blob payload, as returned by either request protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPayload {
    pub miner_address: MinerAddress,
    pub kv_index: KvIndex,
    pub commitment: Commitment,
    pub encode_type: EncodingKind,
    pub encoded_blob: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_marker_has_zero_root_and_flag_set() {
        let marker = Commitment::empty_marker();
        assert!(marker.root_bytes().iter().all(|b| *b == 0));
        assert!(marker.is_empty_marker());
    }

    #[test]
    fn from_root_truncates_and_preserves_flag() {
        let root = [0xAAu8; 32];
        let c = Commitment::from_root(&root, false);
        assert_eq!(c.root_bytes(), &root[..HASH_SIZE_IN_CONTRACT]);
        assert!(!c.is_empty_marker());
    }

    #[test]
    fn shard_key_index_range() {
        let key = ShardKey::new(ContractAddress::zero(), 2);
        assert_eq!(key.index_range(16), 32..48);
    }

    #[test]
    fn encoding_kind_roundtrip() {
        for kind in [
            EncodingKind::None,
            EncodingKind::Keccak256,
            EncodingKind::EthHash,
            EncodingKind::BlobPoseidon,
        ] {
            assert_eq!(EncodingKind::from_u64(kind.as_u64()), Some(kind));
        }
        assert_eq!(EncodingKind::from_u64(99), None);
    }
}

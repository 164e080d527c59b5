//! Wire format for the two request/response protocols. Framing is a manual
//! length-prefixed encoding (u32 byte-length header per frame, fields in
//! declared order) rather than a generic serialization format, mirroring
//! how the grounding codebase hand-rolls its devp2p message bodies instead
//! of reaching for a schema-driven codec.

use bytes::{Buf, BufMut, BytesMut};
use shardsync_core::{Commitment, ContractAddress, EncodingKind, KvIndex, MinerAddress, ShardId};

use crate::error::ProtocolError;

pub fn range_protocol_id(chain_id: u64) -> String {
    format!("/ethstorage/blobs_by_range/{chain_id}/1")
}

pub fn list_protocol_id(chain_id: u64) -> String {
    format!("/ethstorage/blobs_by_list/{chain_id}/1")
}

/// `BlobsByRange` request: up to `limit` payloads with kv-indices in
/// `[origin, origin + limit)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeRequest {
    pub request_id: u64,
    pub contract: ContractAddress,
    pub shard_id: ShardId,
    pub origin: KvIndex,
    pub limit: u64,
    pub max_bytes: u64,
}

/// `BlobsByList` request: payloads for exactly the requested indices the
/// peer holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListRequest {
    pub request_id: u64,
    pub contract: ContractAddress,
    pub shard_id: ShardId,
    pub indices: Vec<KvIndex>,
}

/// Status byte prefixing every response frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Ok = 0,
    ShardNotHeld = 1,
    InternalError = 2,
}

impl ResponseStatus {
    fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Self::Ok),
            1 => Ok(Self::ShardNotHeld),
            2 => Ok(Self::InternalError),
            other => Err(ProtocolError::BadStatus(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseEntry {
    pub miner_address: MinerAddress,
    pub kv_index: KvIndex,
    pub commitment: Commitment,
    pub encode_type: EncodingKind,
    pub encoded_blob: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub request_id: u64,
    pub status: ResponseStatus,
    pub entries: Vec<ResponseEntry>,
}

fn put_bytes_field(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes_field(buf: &mut impl Buf) -> Result<Vec<u8>, ProtocolError> {
    require(buf, 4)?;
    let len = buf.get_u32() as usize;
    require(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn require(buf: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        Err(ProtocolError::Malformed(format!(
            "expected {n} more bytes, {} remaining",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn get_u64(buf: &mut impl Buf) -> Result<u64, ProtocolError> {
    require(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, ProtocolError> {
    require(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_array20(buf: &mut impl Buf) -> Result<[u8; 20], ProtocolError> {
    require(buf, 20)?;
    let mut out = [0u8; 20];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_array32(buf: &mut impl Buf) -> Result<[u8; 32], ProtocolError> {
    require(buf, 32)?;
    let mut out = [0u8; 32];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

impl RangeRequest {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u64(self.request_id);
        buf.put_slice(&self.contract.0);
        buf.put_u64(self.shard_id);
        buf.put_u64(self.origin);
        buf.put_u64(self.limit);
        buf.put_u64(self.max_bytes);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, ProtocolError> {
        let request_id = get_u64(&mut bytes)?;
        let contract = ContractAddress(get_array20(&mut bytes)?);
        let shard_id = get_u64(&mut bytes)?;
        let origin = get_u64(&mut bytes)?;
        let limit = get_u64(&mut bytes)?;
        let max_bytes = get_u64(&mut bytes)?;
        Ok(Self {
            request_id,
            contract,
            shard_id,
            origin,
            limit,
            max_bytes,
        })
    }
}

impl ListRequest {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u64(self.request_id);
        buf.put_slice(&self.contract.0);
        buf.put_u64(self.shard_id);
        buf.put_u32(self.indices.len() as u32);
        for idx in &self.indices {
            buf.put_u64(*idx);
        }
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, ProtocolError> {
        let request_id = get_u64(&mut bytes)?;
        let contract = ContractAddress(get_array20(&mut bytes)?);
        let shard_id = get_u64(&mut bytes)?;
        require(&bytes, 4)?;
        let count = bytes.get_u32() as usize;
        let mut indices = Vec::with_capacity(count);
        for _ in 0..count {
            indices.push(get_u64(&mut bytes)?);
        }
        Ok(Self {
            request_id,
            contract,
            shard_id,
            indices,
        })
    }
}

impl Response {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u64(self.request_id);
        buf.put_u8(self.status as u8);
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_slice(&entry.miner_address.0);
            buf.put_u64(entry.kv_index);
            buf.put_slice(&entry.commitment.0);
            buf.put_u64(entry.encode_type.as_u64());
            put_bytes_field(&mut buf, &entry.encoded_blob);
        }
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, ProtocolError> {
        let request_id = get_u64(&mut bytes)?;
        let status = ResponseStatus::from_u8(get_u8(&mut bytes)?)?;
        require(&bytes, 4)?;
        let count = bytes.get_u32() as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let miner_address = MinerAddress(get_array20(&mut bytes)?);
            let kv_index = get_u64(&mut bytes)?;
            let commitment = Commitment(get_array32(&mut bytes)?);
            let encode_value = get_u64(&mut bytes)?;
            let encode_type = EncodingKind::from_u64(encode_value)
                .ok_or_else(|| ProtocolError::Malformed(format!("unknown encode type {encode_value}")))?;
            let encoded_blob = get_bytes_field(&mut bytes)?;
            entries.push(ResponseEntry {
                miner_address,
                kv_index,
                commitment,
                encode_type,
                encoded_blob,
            });
        }
        Ok(Self {
            request_id,
            status,
            entries,
        })
    }
}

/// Prefixes `frame` with a u32 byte-length header, for length-prefixed
/// stream framing.
pub fn length_prefix(frame: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(4 + frame.len());
    out.put_u32(frame.len() as u32);
    out.put_slice(frame);
    out
}

/// Encodes the peer-store advertisement value: a length-prefixed list of
/// `{contract: 20B, shards: list<u64>}` entries.
pub fn encode_advertisement(entries: &[(ContractAddress, Vec<ShardId>)]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32(entries.len() as u32);
    for (contract, shards) in entries {
        buf.put_slice(&contract.0);
        buf.put_u32(shards.len() as u32);
        for id in shards {
            buf.put_u64(*id);
        }
    }
    buf
}

pub fn decode_advertisement(mut bytes: &[u8]) -> Result<Vec<(ContractAddress, Vec<ShardId>)>, ProtocolError> {
    require(&bytes, 4)?;
    let count = bytes.get_u32() as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let contract = ContractAddress(get_array20(&mut bytes)?);
        require(&bytes, 4)?;
        let shard_count = bytes.get_u32() as usize;
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(get_u64(&mut bytes)?);
        }
        entries.push((contract, shards));
    }
    Ok(entries)
}

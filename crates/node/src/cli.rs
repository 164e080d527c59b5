use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use shardsync_core::{ContractAddress, ShardId};

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "shardsync-node", author, version = VERSION_STRING, about = "Peer-to-peer shard sync core", long_about = None)]
pub struct NodeCli {
    /// Directory holding the sled task-progress database.
    #[arg(long, default_value = "./shardsync-data")]
    pub data_dir: PathBuf,

    /// Shards this node holds, as `<40-hex-char contract>:<shard_id>`. Repeat for multiple.
    #[arg(long = "held-shard", value_parser = parse_held_shard, required = true)]
    pub held_shards: Vec<HeldShard>,

    /// Entries per shard, i.e. the fixed size of a shard's kv-index range.
    #[arg(long, default_value_t = 16_384)]
    pub entries_per_shard: u64,

    /// Maximum kv-index span a single sub-task's range request covers.
    #[arg(long, default_value_t = 256)]
    pub max_sub_task_span: u64,

    /// Maximum peers tracked in the peer table at once.
    #[arg(long, default_value_t = 64)]
    pub max_peers: usize,

    /// Consecutive failures a peer tolerates before eviction.
    #[arg(long, default_value_t = 8)]
    pub max_peer_failures: u32,

    /// Maximum concurrent in-flight requests against a single peer.
    #[arg(long, default_value_t = 4)]
    pub max_in_flight_per_peer: u32,

    /// Per-request timeout, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    /// Base back-off delay for a failed heal index, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    pub heal_backoff_base_ms: u64,

    /// Cap on heal back-off delay, in milliseconds.
    #[arg(long, default_value_t = 600_000)]
    pub heal_backoff_cap_ms: u64,

    /// Seconds a shard's heal-task may go without shrinking before a stall warning.
    #[arg(long, default_value_t = 120)]
    pub stall_timeout_secs: u64,

    /// Controller tick interval, in milliseconds.
    #[arg(long, default_value_t = 250)]
    pub tick_interval_ms: u64,

    /// Chain id embedded in the wire protocol ids.
    #[arg(long, default_value_t = 1)]
    pub chain_id: u64,

    /// Local storage encoding.
    #[arg(long, value_enum, default_value = "none")]
    pub local_encoding: EncodingArg,

    /// Static peers to dial at startup, as `<host>:<port>@<64-hex-char peer id>`. Repeat for multiple.
    #[arg(long = "dial", value_parser = parse_dial_peer)]
    pub dial_peers: Vec<DialPeer>,

    /// TCP address this node's listener binds to.
    #[arg(long, default_value = "0.0.0.0:30333")]
    pub listen_addr: String,

    /// Log level passed to the tracing env-filter (e.g. info, debug, shardsync_sync=trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl NodeCli {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heal_backoff_base(&self) -> Duration {
        Duration::from_millis(self.heal_backoff_base_ms)
    }

    pub fn heal_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.heal_backoff_cap_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HeldShard {
    pub contract: ContractAddress,
    pub shard_id: ShardId,
}

fn parse_held_shard(raw: &str) -> Result<HeldShard, String> {
    let (contract_hex, shard_id) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected <contract>:<shard_id>, got `{raw}`"))?;
    let contract = parse_contract(contract_hex)?;
    let shard_id = shard_id
        .parse::<ShardId>()
        .map_err(|e| format!("invalid shard id `{shard_id}`: {e}"))?;
    Ok(HeldShard { contract, shard_id })
}

fn parse_contract(raw: &str) -> Result<ContractAddress, String> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).map_err(|e| format!("invalid contract hex `{raw}`: {e}"))?;
    let arr: [u8; 20] = bytes
        .try_into()
        .map_err(|_| format!("contract address must be 20 bytes, got `{raw}`"))?;
    Ok(ContractAddress(arr))
}

#[derive(Clone, Debug)]
pub struct DialPeer {
    pub addr: String,
    pub peer_id: shardsync_core::PeerId,
}

fn parse_dial_peer(raw: &str) -> Result<DialPeer, String> {
    let (addr, peer_hex) = raw
        .split_once('@')
        .ok_or_else(|| format!("expected <host>:<port>@<peer_id>, got `{raw}`"))?;
    let peer_hex = peer_hex.strip_prefix("0x").unwrap_or(peer_hex);
    let bytes = hex::decode(peer_hex).map_err(|e| format!("invalid peer id hex `{peer_hex}`: {e}"))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| format!("peer id must be 32 bytes, got `{peer_hex}`"))?;
    Ok(DialPeer {
        addr: addr.to_string(),
        peer_id: shardsync_core::PeerId(arr),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum EncodingArg {
    None,
    Keccak256,
    EthHash,
    BlobPoseidon,
}

impl From<EncodingArg> for shardsync_core::EncodingKind {
    fn from(value: EncodingArg) -> Self {
        match value {
            EncodingArg::None => Self::None,
            EncodingArg::Keccak256 => Self::Keccak256,
            EncodingArg::EthHash => Self::EthHash,
            EncodingArg::BlobPoseidon => Self::BlobPoseidon,
        }
    }
}

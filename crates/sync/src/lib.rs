//! Peer-to-peer shard synchronization core. For every locally held shard,
//! obtains authoritative blob content for each kv-index from remote peers,
//! verifies it against the on-chain commitment, decodes it to the local
//! encoding, and writes it into local storage, tolerating excluded
//! indices, peer churn, persistent failures and restarts.
//!
//! Host/transport, the real storage engine, the commitment-proving
//! primitive and the outer node wrapper are consumed as capabilities
//! ([`host::Host`], [`shardsync_storage::StorageManager`],
//! [`validator::Prover`]) rather than implemented here.

pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fill;
pub mod host;
pub mod peer;
pub mod protocol;
pub mod task;
pub mod validator;

pub use controller::{Controller, ControllerConfig, Phase};
pub use dispatcher::{Dispatcher, DispatcherConfig, SyncState};
pub use error::{ProtocolError, SyncError, ValidationError};
pub use events::{BroadcastEventBus, Event, EventBus};
pub use fill::FillPass;
pub use host::{BoxedStream, Host, NetworkEvent, Stream, StreamHandler};
pub use peer::{Advertisement, PeerRecord, PeerTable};
pub use task::{HealTask, SubTask, Task};
pub use validator::{Keccak256Prover, Prover};

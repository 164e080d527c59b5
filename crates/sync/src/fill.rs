//! Incremental empty-blob fill pass: writes the empty-marker commitment to
//! every slot at or beyond the chain's `lastKvIndex`.

use shardsync_core::{Commitment, KvIndex, ShardKey};
use shardsync_storage::{StorageManager, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tracks progress of filling one shard's tail with empty markers. A single
/// worker steps through it one slot at a time, yielding cooperatively so the
/// controller can cancel mid-pass without blocking on a long loop.
#[derive(Clone, Debug)]
pub struct FillPass {
    pub shard: ShardKey,
    pub filled: u64,
    pub to_fill: u64,
    cursor: KvIndex,
}

impl FillPass {
    /// `last_kv_index` is the chain's current boundary; everything from
    /// there to the end of the shard's range needs an empty marker. Slots
    /// already holding the empty marker (e.g. from a prior, interrupted
    /// pass) are skipped rather than rewritten, which is what makes this
    /// resumable without separately persisted progress.
    pub fn new(shard: ShardKey, entries_per_shard: u64, last_kv_index: KvIndex) -> Self {
        let range = shard.index_range(entries_per_shard);
        let start = last_kv_index.max(range.start);
        let to_fill = range.end.saturating_sub(start);
        Self {
            shard,
            filled: 0,
            to_fill,
            cursor: start,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.filled >= self.to_fill
    }

    /// Advances one slot. Returns `true` once the pass has completed.
    pub async fn step(&mut self, storage: &dyn StorageManager) -> Result<bool, StoreError> {
        if self.is_complete() {
            return Ok(true);
        }
        let index = self.cursor;
        let already_filled = storage
            .try_read(self.shard, index)?
            .map(|(_, commitment)| commitment.is_empty_marker())
            .unwrap_or(false);
        if !already_filled {
            let marker = Commitment::empty_marker();
            let encoded = storage.encode_kv(self.shard, index, &[])?;
            storage.commit_blob(self.shard, index, encoded, marker)?;
        }
        self.cursor += 1;
        self.filled += 1;
        tokio::task::yield_now().await;
        Ok(self.is_complete())
    }

    /// Runs to completion or until `cancel` fires, whichever comes first.
    /// Returns `true` iff the pass completed.
    pub async fn run(
        &mut self,
        storage: &dyn StorageManager,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        while !self.is_complete() {
            if cancel.is_cancelled() {
                debug!(shard = %self.shard, filled = self.filled, to_fill = self.to_fill, "fill pass cancelled");
                return Ok(false);
            }
            self.step(storage).await?;
        }
        Ok(true)
    }
}

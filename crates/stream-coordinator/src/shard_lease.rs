//! The shard lease protocol: a per-shard handle for a reader loop, built on
//! top of [`StateStore`]'s shard-scoped operations. `StateStore` stays the single source of
//! truth; this module just saves every caller from threading `Version` and
//! [`ShardsLocation`] through every call of a shard's lifetime by hand.

use crate::error::StateStoreError;
use crate::model::{ChildShard, ShardDescriptor, Version};
use crate::state_store::{CheckpointOutcome, ShardsLocation, StateStore};
use std::sync::Arc;
use std::time::Duration;

/// A held, version-tracked lease on one shard. Holding one means this worker last won the
/// conditional lock or checkpoint write for `shard_id`; every method re-guards on the
/// version it last observed, so a lost race surfaces as `Ok(false)`/`Ok(None)`, never a
/// panic or a silent overwrite.
pub struct ShardLease {
    store: Arc<StateStore>,
    shard_id: String,
    location: ShardsLocation,
    version: Version,
}

impl ShardLease {
    /// Resolves `descriptor` (lazily creating its entry if needed), then attempts to lock
    /// it. Returns `Ok(None)` if the shard is already depleted or another worker holds the
    /// lease — both ordinary outcomes for a reader loop polling for work, not errors.
    pub async fn acquire(
        store: Arc<StateStore>,
        descriptor: &ShardDescriptor,
        lease_duration: Duration,
    ) -> Result<Option<ShardLease>, StateStoreError> {
        let (shard, doc) = store.get_shard_and_stream_state(descriptor).await?;
        if shard.depleted {
            return Ok(None);
        }

        let location = store.get_shards_data(&doc)?;
        let locked = store
            .lock_shard_lease(&descriptor.shard_id, lease_duration, shard.version, &location)
            .await?;
        if !locked {
            return Ok(None);
        }

        Ok(Some(ShardLease {
            store,
            shard_id: descriptor.shard_id.clone(),
            location,
            version: shard.version.bump(),
        }))
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Records a checkpoint. `Ok(false)` means the lease was lost to another worker (its
    /// lock or an earlier checkpoint raced ahead of this one); the caller should stop
    /// reading this shard rather than retry.
    pub async fn checkpoint(&mut self, sequence_number: &str) -> Result<bool, StateStoreError> {
        match self
            .store
            .store_shard_checkpoint(&self.shard_id, sequence_number, self.version, &self.location)
            .await?
        {
            CheckpointOutcome::Stored(new_version) => {
                self.version = new_version;
                Ok(true)
            }
            CheckpointOutcome::LostRace => Ok(false),
        }
    }

    /// Releases the lease early, e.g. on graceful shutdown. Consumes `self`: there is
    /// nothing useful left to do with a released lease.
    pub async fn release(self) -> Result<bool, StateStoreError> {
        let released = self
            .store
            .release_shard_lease(&self.shard_id, self.version, &self.location)
            .await?;
        Ok(released.is_some())
    }

    /// Marks this shard depleted and seeds its children, once the reader has consumed it
    /// to its end. Does not release the lease; callers typically follow this with
    /// [`Self::release`].
    pub async fn mark_depleted(&self, children: &[ChildShard]) -> Result<(), StateStoreError> {
        self.store
            .mark_shard_as_depleted(&self.shard_id, children, &self.location)
            .await
    }
}

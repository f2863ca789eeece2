//! The state store: the authoritative interface over the single
//! document this crate reads and writes. Every method here issues at most a handful of
//! conditional `KvClient` calls and interprets `ConditionalCheckFailed` per its own
//! documented policy — callers never see a bare conditional-check failure.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{KvError, StateStoreError};
use crate::kv::{Condition, DocumentKey, KvClient, UpdateRequest};
use crate::model::{
    ChildShard, ConsumerEntry, EnhancedEntry, ShardDescriptor, ShardEntry, StreamState, Version,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The `{shards, shardsPath}` pair `getShardsData` resolves to: which of the three
/// places in the document holds this worker's shard map, and where in the document that
/// map lives, as a dotted path prefix the caller threads into the shard-scoped operations
/// below. A `nameTable` has no counterpart here: [`crate::kv::KvClient`] implementations
/// own their own path-aliasing, so callers never see one.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardsLocation {
    pub shards: BTreeMap<String, ShardEntry>,
    pub path_prefix: String,
}

/// The result of a `storeShardCheckpoint` call: distinct
/// from a bare `bool` so callers can't mistake "lost the race" for "stored, here's your new
/// version to carry forward".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Stored(Version),
    LostRace,
}

/// The authoritative state store for one `(consumerGroup, streamName)` pair, scoped to one
/// consumer identity.
pub struct StateStore {
    kv: Arc<dyn KvClient>,
    config: Config,
    clock: Arc<dyn Clock>,
    started_on: DateTime<Utc>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvClient>, config: Config) -> StateStore {
        StateStore::with_clock(kv, config, Arc::new(SystemClock))
    }

    pub fn with_clock(kv: Arc<dyn KvClient>, config: Config, clock: Arc<dyn Clock>) -> StateStore {
        let started_on = clock.now();
        StateStore {
            kv,
            config,
            clock,
            started_on,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn document_key(&self) -> DocumentKey {
        DocumentKey {
            consumer_group: self.config.consumer_group.clone(),
            stream_name: self.config.stream_name.clone(),
        }
    }

    /// Establishes the document if absent, or resets it if it belongs to a different
    /// incarnation of the stream. Idempotent and safe to call concurrently: a
    /// `ConditionalCheckFailed` on the fresh-document `Put` means another worker already
    /// won the race, which is success from this caller's point of view.
    pub async fn start(&self) -> Result<(), StateStoreError> {
        let key = self.document_key();
        if let Some(existing) = self.kv.get(&key).await? {
            if existing.stream_created_on != self.config.stream_created_on {
                tracing::warn!(
                    consumer_group = %self.config.consumer_group,
                    stream_name = %self.config.stream_name,
                    "stream state has been reset: streamCreatedOn no longer matches the stored document"
                );
                self.kv.delete(&key).await?;
            }
        }

        let fresh = StreamState {
            consumer_group: self.config.consumer_group.clone(),
            stream_name: self.config.stream_name.clone(),
            stream_created_on: self.config.stream_created_on,
            version: Version::INITIAL,
            consumers: BTreeMap::new(),
            enhanced_consumers: BTreeMap::new(),
            shards: BTreeMap::new(),
        };

        match self
            .kv
            .put(
                &key,
                &fresh,
                Some(Condition::AttributeNotExists("streamName".to_string())),
            )
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    consumer_group = %self.config.consumer_group,
                    stream_name = %self.config.stream_name,
                    "initial state"
                );
                Ok(())
            }
            Err(KvError::ConditionalCheckFailed) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    /// Upserts this worker's `ConsumerEntry`, refreshing only the heartbeat if it already
    /// exists. Called by the heartbeat manager on every beat.
    pub async fn register_consumer(&self) -> Result<(), StateStoreError> {
        let key = self.document_key();
        let now = self.clock.now();
        let path = format!("consumers.{}", self.config.consumer_id);

        let entry = ConsumerEntry {
            app_name: self.config.app_name.clone(),
            host: self.config.host.clone(),
            pid: std::process::id(),
            started_on: self.started_on,
            heartbeat: now,
            is_active: false,
            is_standalone: !self.config.use_auto_shard_assignment,
            shards: (!self.config.use_auto_shard_assignment).then(BTreeMap::new),
        };
        let value = serde_json::to_value(&entry).map_err(KvError::terminal)?;

        let request = UpdateRequest::new()
            .set(path.clone(), value)
            .condition(Condition::AttributeNotExists(path));

        match self.kv.update(&key, request).await {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => {
                let heartbeat_path = format!("consumers.{}.heartbeat", self.config.consumer_id);
                let request = UpdateRequest::new()
                    .set(heartbeat_path, serde_json::to_value(now).map_err(KvError::terminal)?);
                self.kv.update(&key, request).await?;
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Sweeps consumers whose heartbeat is older than `heartbeat_failure_timeout` and
    /// releases any enhanced consumer bound to one of them.
    ///
    /// Each stale consumer's removal is guarded by the top-level `version` seen at the
    /// start of this call, so only the first one processed can actually succeed in a
    /// single sweep; the rest lose the conditional race to that first removal and are left
    /// for the next heartbeat cycle. This mirrors the document's single top-level version
    /// token: there is no way to bump it twice in one update without two round trips.
    pub async fn clear_old_consumers(
        &self,
        heartbeat_failure_timeout: Duration,
    ) -> Result<(), StateStoreError> {
        let key = self.document_key();
        let now = self.clock.now();
        let Some(doc) = self.kv.get(&key).await? else {
            return Ok(());
        };

        let goners: Vec<String> = doc
            .consumers
            .iter()
            .filter(|(id, consumer)| {
                id.as_str() != self.config.consumer_id
                    && now
                        .signed_duration_since(consumer.heartbeat)
                        .to_std()
                        .map(|age| age > heartbeat_failure_timeout)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &goners {
            let path = format!("consumers.{}", id);
            let request = UpdateRequest::new()
                .remove(path)
                .set(
                    "version",
                    serde_json::Value::String(doc.version.bump().as_str()),
                )
                .condition(Condition::FieldEquals(
                    "version".to_string(),
                    serde_json::Value::String(doc.version.as_str()),
                ));
            match self.kv.update(&key, request).await {
                Ok(()) => {}
                Err(KvError::ConditionalCheckFailed) => {
                    tracing::debug!(consumer_id = %id, "lost the race clearing a stale consumer, leaving it for the next sweep");
                }
                Err(other) => return Err(other.into()),
            }
        }

        for (name, entry) in &doc.enhanced_consumers {
            let is_stale_owner = entry.is_used_by.as_deref().map_or(false, |owner| {
                goners.iter().any(|g| g == owner) || !doc.consumers.contains_key(owner)
            });
            if !is_stale_owner {
                continue;
            }

            let used_by_path = format!("enhancedConsumers.{}.isUsedBy", name);
            let version_path = format!("enhancedConsumers.{}.version", name);
            let request = UpdateRequest::new()
                .set(used_by_path.clone(), serde_json::Value::Null)
                .set(
                    version_path.clone(),
                    serde_json::Value::String(entry.version.bump().as_str()),
                )
                .condition(Condition::And(vec![
                    Condition::FieldEquals(
                        used_by_path,
                        serde_json::to_value(&entry.is_used_by).map_err(KvError::terminal)?,
                    ),
                    Condition::FieldEquals(
                        version_path,
                        serde_json::Value::String(entry.version.as_str()),
                    ),
                ]));
            match self.kv.update(&key, request).await {
                Ok(()) => {}
                Err(KvError::ConditionalCheckFailed) => {
                    tracing::debug!(enhanced_consumer = %name, "lost the race releasing a stale enhanced consumer binding");
                }
                Err(other) => return Err(other.into()),
            }
        }

        Ok(())
    }

    /// Registers a server-side enhanced fan-out subscription by name, unbound.
    pub async fn register_enhanced_consumer(
        &self,
        name: &str,
        arn: &str,
    ) -> Result<(), StateStoreError> {
        let key = self.document_key();
        let path = format!("enhancedConsumers.{}", name);
        let entry = EnhancedEntry {
            arn: arn.to_string(),
            is_used_by: None,
            is_standalone: !self.config.use_auto_shard_assignment,
            version: Version::FIRST_ENTRY,
            shards: (!self.config.use_auto_shard_assignment).then(BTreeMap::new),
        };
        let value = serde_json::to_value(&entry).map_err(KvError::terminal)?;

        let request = UpdateRequest::new()
            .set(path.clone(), value)
            .condition(Condition::AttributeNotExists(path));
        match self.kv.update(&key, request).await {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    pub async fn deregister_enhanced_consumer(&self, name: &str) -> Result<(), StateStoreError> {
        let key = self.document_key();
        let path = format!("enhancedConsumers.{}", name);
        let request = UpdateRequest::new()
            .remove(path.clone())
            .condition(Condition::AttributeExists(path));
        match self.kv.update(&key, request).await {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    /// Returns this worker's bound enhanced-consumer ARN, claiming the first free entry if
    /// none is bound yet. Marks this worker active/inactive on `consumers[id]`
    /// to match.
    pub async fn get_assigned_enhanced_consumer(&self) -> Result<Option<String>, StateStoreError> {
        let key = self.document_key();
        let doc = self.kv.get(&key).await?.ok_or(StateStoreError::NotStarted)?;

        if let Some((_, entry)) = doc
            .enhanced_consumers
            .iter()
            .find(|(_, e)| e.is_used_by.as_deref() == Some(self.config.consumer_id.as_str()))
        {
            self.set_active(true).await?;
            return Ok(Some(entry.arn.clone()));
        }

        let Some((name, entry)) = doc
            .enhanced_consumers
            .iter()
            .find(|(_, e)| e.is_used_by.is_none())
        else {
            tracing::warn!("no free enhanced consumer available to bind");
            self.set_active(false).await?;
            return Ok(None);
        };

        let used_by_path = format!("enhancedConsumers.{}.isUsedBy", name);
        let version_path = format!("enhancedConsumers.{}.version", name);
        let mut request = UpdateRequest::new()
            .set(used_by_path.clone(), serde_json::json!(self.config.consumer_id))
            .set(
                version_path.clone(),
                serde_json::Value::String(entry.version.bump().as_str()),
            );
        if !self.config.use_auto_shard_assignment {
            request = request.set_if_not_exists(
                format!("enhancedConsumers.{}.shards", name),
                serde_json::json!({}),
            );
        }
        let request = request.condition(Condition::And(vec![
            Condition::FieldEquals(used_by_path, serde_json::Value::Null),
            Condition::FieldEquals(
                version_path,
                serde_json::Value::String(entry.version.as_str()),
            ),
        ]));

        match self.kv.update(&key, request).await {
            Ok(()) => {
                self.set_active(true).await?;
                Ok(Some(entry.arn.clone()))
            }
            Err(KvError::ConditionalCheckFailed) => {
                self.set_active(false).await?;
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn set_active(&self, active: bool) -> Result<(), StateStoreError> {
        let key = self.document_key();
        let path = format!("consumers.{}.isActive", self.config.consumer_id);
        let request = UpdateRequest::new().set(path, serde_json::json!(active));
        self.kv.update(&key, request).await?;
        Ok(())
    }

    /// Resolves which of the three places in the document holds this worker's shard map,
    /// dispatching on `(useAutoShardAssignment, useEnhancedFanOut)`.
    pub fn get_shards_data(&self, doc: &StreamState) -> Result<ShardsLocation, StateStoreError> {
        if self.config.use_auto_shard_assignment {
            return Ok(ShardsLocation {
                shards: doc.shards.clone(),
                path_prefix: "shards".to_string(),
            });
        }

        if self.config.use_enhanced_fan_out {
            let bound = doc
                .enhanced_consumers
                .iter()
                .find(|(_, e)| e.is_used_by.as_deref() == Some(self.config.consumer_id.as_str()));
            return match bound {
                Some((name, entry)) => Ok(ShardsLocation {
                    shards: entry.shards.clone().unwrap_or_default(),
                    path_prefix: format!("enhancedConsumers.{}.shards", name),
                }),
                None => Err(StateStoreError::NoEnhancedConsumerBound),
            };
        }

        let shards = doc
            .consumers
            .get(&self.config.consumer_id)
            .and_then(|c| c.shards.clone())
            .unwrap_or_default();
        Ok(ShardsLocation {
            shards,
            path_prefix: format!("consumers.{}.shards", self.config.consumer_id),
        })
    }

    /// Inserts a fresh shard entry if one doesn't already exist at `location`.
    /// `ConditionalCheckFailed` means another worker already created it; that's success.
    pub async fn ensure_shard_state_exists(
        &self,
        shard_id: &str,
        parent: Option<String>,
        location: &ShardsLocation,
    ) -> Result<(), StateStoreError> {
        let key = self.document_key();
        let path = format!("{}.{}", location.path_prefix, shard_id);
        let entry = ShardEntry::fresh(parent);
        let value = serde_json::to_value(&entry).map_err(KvError::terminal)?;

        let request = UpdateRequest::new()
            .set(path.clone(), value)
            .condition(Condition::AttributeNotExists(path));
        match self.kv.update(&key, request).await {
            Ok(()) => Ok(()),
            Err(KvError::ConditionalCheckFailed) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    /// Reads a shard's entry, lazily creating it via [`Self::ensure_shard_state_exists`] if
    /// it isn't there yet.
    pub async fn get_shard_and_stream_state(
        &self,
        descriptor: &ShardDescriptor,
    ) -> Result<(ShardEntry, StreamState), StateStoreError> {
        let key = self.document_key();
        let doc = self.kv.get(&key).await?.ok_or(StateStoreError::NotStarted)?;
        let location = self.get_shards_data(&doc)?;

        if let Some(shard) = location.shards.get(&descriptor.shard_id) {
            return Ok((shard.clone(), doc));
        }

        self.ensure_shard_state_exists(&descriptor.shard_id, descriptor.parent.clone(), &location)
            .await?;

        let doc = self.kv.get(&key).await?.ok_or(StateStoreError::NotStarted)?;
        let location = self.get_shards_data(&doc)?;
        let shard = location
            .shards
            .get(&descriptor.shard_id)
            .cloned()
            .ok_or_else(|| StateStoreError::UnknownShard(descriptor.shard_id.clone()))?;
        Ok((shard, doc))
    }

    /// Shards owned and actively leased by this worker right now: not depleted, and
    /// their lease hasn't expired.
    pub async fn get_owned_shards(&self) -> Result<BTreeMap<String, ShardEntry>, StateStoreError> {
        let key = self.document_key();
        let now = self.clock.now();
        let doc = self.kv.get(&key).await?.ok_or(StateStoreError::NotStarted)?;
        let location = self.get_shards_data(&doc)?;

        Ok(location
            .shards
            .into_iter()
            .filter(|(_, shard)| {
                shard.lease_owner.as_deref() == Some(self.config.consumer_id.as_str())
                    && !shard.depleted
                    && shard.lease_expiration.map(|exp| exp > now).unwrap_or(false)
            })
            .collect())
    }

    /// Attempts to claim or extend the lease on `shard_id`, guarded by `expected_version`.
    /// Returns `false`, not an error, if another worker already holds it.
    pub async fn lock_shard_lease(
        &self,
        shard_id: &str,
        lease_duration: Duration,
        expected_version: Version,
        location: &ShardsLocation,
    ) -> Result<bool, StateStoreError> {
        let key = self.document_key();
        let now = self.clock.now();
        let expiration = now
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| StateStoreError::Kv(KvError::terminal(e)))?;

        let owner_path = format!("{}.{}.leaseOwner", location.path_prefix, shard_id);
        let exp_path = format!("{}.{}.leaseExpiration", location.path_prefix, shard_id);
        let version_path = format!("{}.{}.version", location.path_prefix, shard_id);

        let request = UpdateRequest::new()
            .set(owner_path, serde_json::json!(self.config.consumer_id))
            .set(exp_path, serde_json::to_value(expiration).map_err(KvError::terminal)?)
            .set(
                version_path.clone(),
                serde_json::Value::String(expected_version.bump().as_str()),
            )
            .condition(Condition::FieldEquals(
                version_path,
                serde_json::Value::String(expected_version.as_str()),
            ));

        match self.kv.update(&key, request).await {
            Ok(()) => Ok(true),
            Err(KvError::ConditionalCheckFailed) => Ok(false),
            Err(other) => Err(other.into()),
        }
    }

    /// Releases a held lease, guarded by `expected_version`. Returns the new
    /// version on success, or `None` if the lease was already lost to another worker.
    pub async fn release_shard_lease(
        &self,
        shard_id: &str,
        expected_version: Version,
        location: &ShardsLocation,
    ) -> Result<Option<Version>, StateStoreError> {
        let key = self.document_key();
        let owner_path = format!("{}.{}.leaseOwner", location.path_prefix, shard_id);
        let exp_path = format!("{}.{}.leaseExpiration", location.path_prefix, shard_id);
        let version_path = format!("{}.{}.version", location.path_prefix, shard_id);
        let new_version = expected_version.bump();

        let request = UpdateRequest::new()
            .set(owner_path, serde_json::Value::Null)
            .set(exp_path, serde_json::Value::Null)
            .set(
                version_path.clone(),
                serde_json::Value::String(new_version.as_str()),
            )
            .condition(Condition::FieldEquals(
                version_path,
                serde_json::Value::String(expected_version.as_str()),
            ));

        match self.kv.update(&key, request).await {
            Ok(()) => Ok(Some(new_version)),
            Err(KvError::ConditionalCheckFailed) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    /// Records a checkpoint for a held lease, guarded by `expected_version`.
    pub async fn store_shard_checkpoint(
        &self,
        shard_id: &str,
        sequence_number: &str,
        expected_version: Version,
        location: &ShardsLocation,
    ) -> Result<CheckpointOutcome, StateStoreError> {
        if sequence_number.is_empty() {
            return Err(StateStoreError::EmptyCheckpoint);
        }

        let key = self.document_key();
        let checkpoint_path = format!("{}.{}.checkpoint", location.path_prefix, shard_id);
        let version_path = format!("{}.{}.version", location.path_prefix, shard_id);
        let new_version = expected_version.bump();

        let request = UpdateRequest::new()
            .set(checkpoint_path, serde_json::json!(sequence_number))
            .set(
                version_path.clone(),
                serde_json::Value::String(new_version.as_str()),
            )
            .condition(Condition::FieldEquals(
                version_path,
                serde_json::Value::String(expected_version.as_str()),
            ));

        match self.kv.update(&key, request).await {
            Ok(()) => Ok(CheckpointOutcome::Stored(new_version)),
            Err(KvError::ConditionalCheckFailed) => Ok(CheckpointOutcome::LostRace),
            Err(other) => Err(other.into()),
        }
    }

    /// Marks `shard_id` depleted and seeds its children: creates each child's entry first,
    /// then in one update marks the parent depleted and, only if the parent was never
    /// checkpointed, seeds each child's checkpoint with its starting sequence number so a
    /// reader that never touched the parent doesn't replay it. The final update is guarded
    /// on the parent's version observed just above; a concurrent mutation of the parent
    /// between that read and this write surfaces as `KvError::ConditionalCheckFailed`
    /// rather than silently clobbering whatever raced ahead of it.
    pub async fn mark_shard_as_depleted(
        &self,
        shard_id: &str,
        children: &[ChildShard],
        location: &ShardsLocation,
    ) -> Result<(), StateStoreError> {
        for child in children {
            self.ensure_shard_state_exists(&child.shard_id, Some(shard_id.to_string()), location)
                .await?;
        }

        let key = self.document_key();
        let doc = self.kv.get(&key).await?.ok_or(StateStoreError::NotStarted)?;
        let location = self.get_shards_data(&doc)?;
        let parent = location
            .shards
            .get(shard_id)
            .ok_or_else(|| StateStoreError::UnknownShard(shard_id.to_string()))?;

        let parent_depleted_path = format!("{}.{}.depleted", location.path_prefix, shard_id);
        let parent_version_path = format!("{}.{}.version", location.path_prefix, shard_id);
        let mut request = UpdateRequest::new()
            .set(parent_depleted_path, serde_json::json!(true))
            .set(
                parent_version_path.clone(),
                serde_json::Value::String(parent.version.bump().as_str()),
            );

        if parent.checkpoint.is_none() {
            for child in children {
                if let Some(child_entry) = location.shards.get(&child.shard_id) {
                    let checkpoint_path = format!("{}.{}.checkpoint", location.path_prefix, child.shard_id);
                    let version_path = format!("{}.{}.version", location.path_prefix, child.shard_id);
                    request = request
                        .set(checkpoint_path, serde_json::json!(child.starting_sequence_number))
                        .set(
                            version_path,
                            serde_json::Value::String(child_entry.version.bump().as_str()),
                        );
                }
            }
        }

        let request = request.condition(Condition::FieldEquals(
            parent_version_path,
            serde_json::Value::String(parent.version.as_str()),
        ));
        self.kv.update(&key, request).await?;
        Ok(())
    }
}

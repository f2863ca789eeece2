//! Concrete end-to-end scenarios against `FakeKvClient`. All versions start at
//! `"0000"`; consumer id `test-id`, group `test-group`, stream `test-stream`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stream_coordinator::config::BillingMode;
use stream_coordinator::kv::fake::FakeKvClient;
use stream_coordinator::kv::{DocumentKey, KvClient};
use stream_coordinator::model::{ChildShard, ShardDescriptor, ShardEntry, Version};
use stream_coordinator::{Config, StateStore};

fn t(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn document_key() -> DocumentKey {
    DocumentKey {
        consumer_group: "test-group".to_string(),
        stream_name: "test-stream".to_string(),
    }
}

fn config(stream_created_on: DateTime<Utc>) -> Config {
    Config::new(
        "test-group",
        "test-id",
        "test-stream",
        stream_created_on,
        "app",
        "host",
        true,
        false,
        Duration::from_secs(10),
        Duration::from_secs(30),
        Duration::from_secs(10),
        "table",
        vec![],
        BillingMode::OnDemand,
    )
    .unwrap()
}

#[tokio::test]
async fn s1_fresh_start_puts_empty_document() {
    let kv = Arc::new(FakeKvClient::new());
    let created_on = t("2019-01-01T00:00:00.000Z");
    let store = StateStore::new(kv.clone(), config(created_on));

    store.start().await.unwrap();

    let doc = kv.get(&document_key()).await.unwrap().unwrap();
    assert_eq!(doc.version, Version::INITIAL);
    assert_eq!(doc.stream_created_on, created_on);
    assert!(doc.consumers.is_empty());
    assert!(doc.enhanced_consumers.is_empty());
    assert!(doc.shards.is_empty());
}

#[tokio::test]
async fn s2_creation_time_mismatch_resets_document() {
    let kv = Arc::new(FakeKvClient::new());
    let old_created_on = t("2018-12-31T00:00:00.000Z");
    let new_created_on = t("2019-01-01T00:00:00.000Z");

    let seed_store = StateStore::new(kv.clone(), config(old_created_on));
    seed_store.start().await.unwrap();

    let store = StateStore::new(kv.clone(), config(new_created_on));
    store.start().await.unwrap();

    let doc = kv.get(&document_key()).await.unwrap().unwrap();
    assert_eq!(doc.stream_created_on, new_created_on);
    assert_eq!(doc.version, Version::INITIAL);
}

#[tokio::test]
async fn s3_clear_one_late_consumer_per_sweep() {
    use stream_coordinator::model::{ConsumerEntry, EnhancedEntry};

    let kv = Arc::new(FakeKvClient::new());
    let created_on = t("2024-01-01T00:00:00.000Z");
    let store = StateStore::new(kv.clone(), config(created_on));
    store.start().await.unwrap();

    let mut consumers = BTreeMap::new();
    consumers.insert(
        "consumer-1".to_string(),
        ConsumerEntry {
            app_name: "app".to_string(),
            host: "host".to_string(),
            pid: 1,
            started_on: created_on,
            heartbeat: Utc::now(),
            is_active: true,
            is_standalone: false,
            shards: None,
        },
    );
    consumers.insert(
        "consumer-2".to_string(),
        ConsumerEntry {
            app_name: "app".to_string(),
            host: "host".to_string(),
            pid: 2,
            started_on: created_on,
            heartbeat: t("2019-01-01T00:00:00.000Z"),
            is_active: true,
            is_standalone: false,
            shards: None,
        },
    );
    consumers.insert(
        "consumer-3".to_string(),
        ConsumerEntry {
            app_name: "app".to_string(),
            host: "host".to_string(),
            pid: 3,
            started_on: created_on,
            heartbeat: t("2020-01-01T00:00:00.000Z"),
            is_active: true,
            is_standalone: false,
            shards: None,
        },
    );
    let mut enhanced = BTreeMap::new();
    enhanced.insert(
        "enhanced-consumer-1".to_string(),
        EnhancedEntry {
            arn: "arn:enhanced-consumer-1".to_string(),
            is_used_by: Some("consumer-2".to_string()),
            is_standalone: false,
            version: Version::FIRST_ENTRY,
            shards: None,
        },
    );

    let mut doc = kv.get(&document_key()).await.unwrap().unwrap();
    doc.consumers = consumers;
    doc.enhanced_consumers = enhanced;
    kv.seed(document_key(), &doc);

    store
        .clear_old_consumers(Duration::from_millis(1000))
        .await
        .unwrap();

    let after = kv.get(&document_key()).await.unwrap().unwrap();
    assert!(!after.consumers.contains_key("consumer-2"));
    assert!(after.consumers.contains_key("consumer-1"));
    assert!(after.consumers.contains_key("consumer-3"));
    assert_eq!(after.version, Version::INITIAL.bump());

    let enhanced_entry = &after.enhanced_consumers["enhanced-consumer-1"];
    assert_eq!(enhanced_entry.is_used_by, None);
    assert_eq!(enhanced_entry.version, Version::FIRST_ENTRY.bump());
}

#[tokio::test]
async fn s3b_clears_binding_orphaned_by_an_earlier_sweep() {
    use stream_coordinator::model::EnhancedEntry;

    let kv = Arc::new(FakeKvClient::new());
    let created_on = t("2024-01-01T00:00:00.000Z");
    let store = StateStore::new(kv.clone(), config(created_on));
    store.start().await.unwrap();

    // "consumer-gone" never appears in `consumers` at all: an earlier sweep already
    // removed it, but left this binding behind because it lost the per-entry race that
    // time around. It must still be cleared by a later sweep even though it can never
    // reappear in this sweep's stale-consumer set.
    let mut enhanced = BTreeMap::new();
    enhanced.insert(
        "enhanced-consumer-1".to_string(),
        EnhancedEntry {
            arn: "arn:enhanced-consumer-1".to_string(),
            is_used_by: Some("consumer-gone".to_string()),
            is_standalone: false,
            version: Version::FIRST_ENTRY,
            shards: None,
        },
    );
    let mut doc = kv.get(&document_key()).await.unwrap().unwrap();
    doc.enhanced_consumers = enhanced;
    kv.seed(document_key(), &doc);

    store
        .clear_old_consumers(Duration::from_millis(1000))
        .await
        .unwrap();

    let after = kv.get(&document_key()).await.unwrap().unwrap();
    let enhanced_entry = &after.enhanced_consumers["enhanced-consumer-1"];
    assert_eq!(enhanced_entry.is_used_by, None);
    assert_eq!(enhanced_entry.version, Version::FIRST_ENTRY.bump());
}

#[tokio::test]
async fn s4_lock_then_release_cycle() {
    let kv = Arc::new(FakeKvClient::new());
    let created_on = t("2019-01-01T00:00:00.000Z");
    let store = StateStore::new(kv.clone(), config(created_on));
    store.start().await.unwrap();

    let mut shards = BTreeMap::new();
    shards.insert("shard-0001".to_string(), ShardEntry::fresh(None));
    let mut doc = kv.get(&document_key()).await.unwrap().unwrap();
    doc.shards = shards;
    kv.seed(document_key(), &doc);

    let location = store.get_shards_data(&doc).unwrap();

    let locked = store
        .lock_shard_lease(
            "shard-0001",
            Duration::from_secs(10),
            Version::FIRST_ENTRY,
            &location,
        )
        .await
        .unwrap();
    assert!(locked);

    let after_lock = kv.get(&document_key()).await.unwrap().unwrap();
    let shard = &after_lock.shards["shard-0001"];
    assert_eq!(shard.lease_owner.as_deref(), Some("test-id"));
    assert_eq!(shard.version, Version::FIRST_ENTRY.bump());

    let location = store.get_shards_data(&after_lock).unwrap();
    let released = store
        .release_shard_lease("shard-0001", shard.version, &location)
        .await
        .unwrap();
    assert_eq!(released, Some(shard.version.bump()));

    let after_release = kv.get(&document_key()).await.unwrap().unwrap();
    let shard = &after_release.shards["shard-0001"];
    assert_eq!(shard.lease_owner, None);
    assert_eq!(shard.version, Version::FIRST_ENTRY.bump().bump());
}

#[tokio::test]
async fn s5_depletion_propagates_starting_sequence() {
    let kv = Arc::new(FakeKvClient::new());
    let created_on = t("2024-01-01T00:00:00.000Z");
    let store = StateStore::new(kv.clone(), config(created_on));
    store.start().await.unwrap();

    let mut shards = BTreeMap::new();
    let mut parent = ShardEntry::fresh(None);
    parent.checkpoint = Some("1".to_string());
    shards.insert("shard-0000".to_string(), parent);
    let mut doc = kv.get(&document_key()).await.unwrap().unwrap();
    doc.shards = shards;
    kv.seed(document_key(), &doc);

    let location = store.get_shards_data(&doc).unwrap();
    let children = vec![ChildShard {
        shard_id: "shard-0001".to_string(),
        starting_sequence_number: "2".to_string(),
    }];
    store
        .mark_shard_as_depleted("shard-0000", &children, &location)
        .await
        .unwrap();

    let after = kv.get(&document_key()).await.unwrap().unwrap();
    assert!(after.shards["shard-0000"].depleted);
    // The parent already had a checkpoint, so the child's is left untouched (None) rather
    // than seeded with the starting sequence number.
    assert_eq!(after.shards["shard-0001"].checkpoint, None);
    assert_eq!(after.shards["shard-0001"].parent.as_deref(), Some("shard-0000"));
}

#[tokio::test]
async fn s5b_depletion_seeds_child_checkpoint_when_parent_has_none() {
    let kv = Arc::new(FakeKvClient::new());
    let created_on = t("2024-01-01T00:00:00.000Z");
    let store = StateStore::new(kv.clone(), config(created_on));
    store.start().await.unwrap();

    let mut shards = BTreeMap::new();
    shards.insert("shard-0000".to_string(), ShardEntry::fresh(None));
    let mut doc = kv.get(&document_key()).await.unwrap().unwrap();
    doc.shards = shards;
    kv.seed(document_key(), &doc);

    let location = store.get_shards_data(&doc).unwrap();
    let children = vec![ChildShard {
        shard_id: "shard-0001".to_string(),
        starting_sequence_number: "2".to_string(),
    }];
    store
        .mark_shard_as_depleted("shard-0000", &children, &location)
        .await
        .unwrap();

    let after = kv.get(&document_key()).await.unwrap().unwrap();
    assert_eq!(after.shards["shard-0001"].checkpoint.as_deref(), Some("2"));
}

#[tokio::test]
async fn s6_binds_first_free_enhanced_consumer() {
    use stream_coordinator::model::EnhancedEntry;

    let kv = Arc::new(FakeKvClient::new());
    let created_on = t("2024-01-01T00:00:00.000Z");
    let store = StateStore::new(kv.clone(), config(created_on));
    store.start().await.unwrap();
    // A worker registers its own heartbeat before it ever asks for an enhanced consumer;
    // `setActive` below assumes `consumers["test-id"]` already exists.
    store.register_consumer().await.unwrap();

    let mut enhanced = BTreeMap::new();
    enhanced.insert(
        "enhanced-consumer-0".to_string(),
        EnhancedEntry {
            arn: "arn:enhanced-consumer-0".to_string(),
            is_used_by: None,
            is_standalone: false,
            version: Version::INITIAL,
            shards: None,
        },
    );
    let mut doc = kv.get(&document_key()).await.unwrap().unwrap();
    doc.enhanced_consumers = enhanced;
    kv.seed(document_key(), &doc);

    let arn = store.get_assigned_enhanced_consumer().await.unwrap();
    assert_eq!(arn.as_deref(), Some("arn:enhanced-consumer-0"));

    let after = kv.get(&document_key()).await.unwrap().unwrap();
    let entry = &after.enhanced_consumers["enhanced-consumer-0"];
    assert_eq!(entry.is_used_by.as_deref(), Some("test-id"));
    assert_eq!(entry.version, Version::INITIAL.bump());
    assert!(after.consumers["test-id"].is_active);
}

#[tokio::test]
async fn shard_descriptor_resolution_lazily_creates_shard_state() {
    let kv = Arc::new(FakeKvClient::new());
    let created_on = t("2024-01-01T00:00:00.000Z");
    let store = StateStore::new(kv.clone(), config(created_on));
    store.start().await.unwrap();

    let descriptor = ShardDescriptor {
        shard_id: "shard-0001".to_string(),
        parent: None,
    };
    let (shard, _doc) = store.get_shard_and_stream_state(&descriptor).await.unwrap();
    assert_eq!(shard.version, Version::FIRST_ENTRY);
    assert_eq!(shard.parent, None);
    assert!(!shard.depleted);
}

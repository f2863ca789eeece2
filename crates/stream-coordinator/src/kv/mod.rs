//! The key/value client boundary.
//!
//! The state store never talks to DynamoDB directly. It only depends on [`KvClient`], a
//! trait deliberately narrower than a general expression builder: the core only ever
//! needs three condition shapes and three update operations, so that's all [`Condition`]
//! and [`UpdateOp`] expose. This keeps [`crate::state_store::StateStore`] testable against
//! [`fake::FakeKvClient`] with no network or credentials, and keeps the DynamoDB encoding
//! concern isolated to [`dynamo::DynamoKvClient`].

pub mod dynamo;
pub mod fake;
pub mod retry;

use crate::error::KvError;
use crate::model::StreamState;
use async_trait::async_trait;

/// Identifies the single logical document this crate ever reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub consumer_group: String,
    pub stream_name: String,
}

/// A condition guarding a `Put`, `Update`, or `Delete`. Composes via [`Condition::And`];
/// the core never needs `Or` or negation.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    AttributeNotExists(String),
    AttributeExists(String),
    /// The value at `path` equals the given JSON scalar (used both for `version == v`
    /// and for `isUsedBy == null`/`isUsedBy == <id>` guards).
    FieldEquals(String, serde_json::Value),
    And(Vec<Condition>),
}

/// One mutation within an [`UpdateRequest`]. `path` is a dotted field path, e.g.
/// `"shards.shard-0001.leaseOwner"`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(String, serde_json::Value),
    /// `SET path = if_not_exists(path, value)` — used only for `shards` map initialization
    /// on first bind of an enhanced consumer in standalone mode, via `getAssignedEnhancedConsumer`.
    SetIfNotExists(String, serde_json::Value),
    Remove(String),
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub ops: Vec<UpdateOp>,
    pub condition: Option<Condition>,
}

impl UpdateRequest {
    pub fn new() -> UpdateRequest {
        UpdateRequest::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.ops.push(UpdateOp::Set(path.into(), value.into()));
        self
    }

    pub fn set_if_not_exists(
        mut self,
        path: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.ops
            .push(UpdateOp::SetIfNotExists(path.into(), value.into()));
        self
    }

    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Remove(path.into()));
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// A single logical document, conditionally read/written. Implementations must treat
/// `Get`/`Put`/`Update`/`Delete` as the sole suspension points: everything between
/// two calls executes atomically from the caller's point of view, and no implementation
/// may assume a document it read is still current when it writes.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &DocumentKey) -> Result<Option<StreamState>, KvError>;

    async fn put(
        &self,
        key: &DocumentKey,
        item: &StreamState,
        condition: Option<Condition>,
    ) -> Result<(), KvError>;

    async fn update(&self, key: &DocumentKey, request: UpdateRequest) -> Result<(), KvError>;

    async fn delete(&self, key: &DocumentKey) -> Result<(), KvError>;
}

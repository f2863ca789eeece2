//! Error taxonomy. Three layers: the key/value client surfaces transient vs.
//! conditional-vs-terminal failures; the state store layers invariant violations and
//! configuration mistakes on top.

/// Errors surfaced by a [`crate::kv::KvClient`] implementation.
///
/// `Transient` is expected to be retried by [`crate::kv::RetryingKvClient`] and should
/// never reach the state store directly in production use; it's public so that a
/// `KvClient` impl and its tests can construct it.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Network blip, throttling, or any other fault expected to clear on retry.
    #[error("transient key/value store error")]
    Transient(#[source] anyhow::Error),

    /// The store's compare-and-swap guard did not hold. Not retried: every state-store
    /// operation has an explicit, documented policy for this outcome.
    #[error("conditional check failed")]
    ConditionalCheckFailed,

    /// Validation or permission failure. Never retried; the original error is preserved
    /// as the source so operators can see the underlying SDK diagnostic.
    #[error("terminal key/value store error")]
    Terminal(#[source] anyhow::Error),
}

impl KvError {
    pub fn transient(err: impl Into<anyhow::Error>) -> KvError {
        KvError::Transient(err.into())
    }

    pub fn terminal(err: impl Into<anyhow::Error>) -> KvError {
        KvError::Terminal(err.into())
    }

    pub fn is_conditional_check_failed(&self) -> bool {
        matches!(self, KvError::ConditionalCheckFailed)
    }
}

/// Errors surfaced by [`crate::state_store::StateStore`] and
/// [`crate::shard_lease`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error(transparent)]
    Kv(#[from] KvError),

    /// `storeShardCheckpoint` was called with a null or empty sequence number.
    #[error("checkpoint sequence number must not be empty")]
    EmptyCheckpoint,

    /// `useEnhancedFanOut` is set but no enhanced consumer is currently bound to this
    /// worker, so there's no `shards` mapping to resolve.
    #[error("enhanced fan-out is enabled but no enhanced consumer is bound to this worker")]
    NoEnhancedConsumerBound,

    /// A shard referenced by an operation doesn't exist in the document and the
    /// operation doesn't lazily create it (unlike `ensureShardStateExists`/`getShardAndStreamState`).
    #[error("shard '{0}' has no state in the document")]
    UnknownShard(String),

    /// An operation that assumes `start()` has already established the document was
    /// called against a document that doesn't exist yet.
    #[error("state store has not been started for this (consumerGroup, streamName)")]
    NotStarted,
}

/// Errors surfaced by [`crate::config::Config`] construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "heartbeat_failure_timeout ({timeout_ms}ms) must be at least 3x heartbeat_period ({period_ms}ms)"
    )]
    HeartbeatThresholdTooLow { timeout_ms: u64, period_ms: u64 },
}

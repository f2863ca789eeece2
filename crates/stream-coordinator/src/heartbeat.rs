//! Liveness manager: periodically clears stale consumers and re-registers this
//! worker's own heartbeat. An Idle/Running state machine — `start`/`stop` are idempotent,
//! and a recoverable failure on one beat is logged and never kills the loop.

use crate::state_store::StateStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Runs [`StateStore::clear_old_consumers`] then [`StateStore::register_consumer`] on a
/// fixed period, in the background, until stopped.
pub struct HeartbeatManager {
    store: Arc<StateStore>,
    running: AtomicBool,
    shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatManager {
    pub fn new(store: Arc<StateStore>) -> HeartbeatManager {
        HeartbeatManager {
            store,
            running: AtomicBool::new(false),
            shutdown: std::sync::Mutex::new(None),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Starts the background beat: one beat runs immediately, then on a steady period.
    /// A second call while already running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, mut rx) = oneshot::channel();
        *self.shutdown.lock().unwrap() = Some(tx);

        let store = Arc::clone(&self.store);
        let period = store.config().heartbeat_period();
        let handle = tokio::spawn(async move {
            beat(&store).await;
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; already beat above, so skip it.
            loop {
                tokio::select! {
                    _ = &mut rx => return,
                    _ = interval.tick() => beat(&store).await,
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stops the background beat and waits for the in-flight beat, if any, to finish. A
    /// second call while already stopped is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn beat(store: &StateStore) {
    if let Err(err) = store.clear_old_consumers(store.config().heartbeat_failure_timeout()).await {
        tracing::warn!(%err, "recoverable failure clearing old consumers, will retry next beat");
    }
    if let Err(err) = store.register_consumer().await {
        tracing::warn!(%err, "recoverable failure registering consumer heartbeat, will retry next beat");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{BillingMode, Config};
    use crate::kv::fake::FakeKvClient;
    use crate::kv::KvClient;
    use chrono::Utc;
    use std::time::Duration;

    fn test_store() -> (Arc<StateStore>, Arc<FakeKvClient>) {
        let kv = Arc::new(FakeKvClient::new());
        let config = Config::new(
            "group",
            "consumer-1",
            "stream",
            Utc::now(),
            "app",
            "host",
            true,
            false,
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_secs(10),
            "table",
            vec![],
            BillingMode::OnDemand,
        )
        .unwrap();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(StateStore::with_clock(
            Arc::clone(&kv) as Arc<dyn crate::kv::KvClient>,
            config,
            clock,
        ));
        (store, kv)
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_beats_on_a_period() {
        let (store, kv) = test_store();
        store.start().await.unwrap();
        let manager = HeartbeatManager::new(Arc::clone(&store));

        manager.start();
        manager.start(); // second call is a no-op, not a second loop
        assert!(manager.is_running());

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;

        let doc = kv
            .get(&crate::kv::DocumentKey {
                consumer_group: "group".to_string(),
                stream_name: "stream".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert!(doc.consumers.contains_key("consumer-1"));

        manager.stop().await;
        manager.stop().await; // second call is a no-op
        assert!(!manager.is_running());
    }
}

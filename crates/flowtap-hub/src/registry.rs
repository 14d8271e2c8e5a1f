use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use flowtap_core::ConnectionKey;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Result of one delivery attempt to an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    TransportGone,
}

/// One WebSocket observer and the queue feeding its writer task.
pub struct Observer {
    conn_id: String,
    key: ConnectionKey,
    sender: mpsc::Sender<Message>,
}

impl Observer {
    pub fn new(conn_id: String, key: ConnectionKey, sender: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id,
            key,
            sender,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Queues one frame for the observer's writer task. Anything that stops
    /// the queue from taking it means the transport is no longer usable and
    /// the observer should be dropped.
    pub fn deliver(&self, payload: String) -> DeliveryOutcome {
        match self.sender.try_send(Message::Text(payload)) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::TransportGone,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "observer_backpressure", conn_id = %self.conn_id);
                DeliveryOutcome::TransportGone
            }
        }
    }
}

/// Routing table from connection keys to live observers. Every observer is
/// stored under its own key and that key's reverse, so records written from
/// either end of the connection resolve to it.
pub struct ObserverRegistry {
    observers: RwLock<HashMap<ConnectionKey, Arc<Observer>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
        }
    }

    /// Stores the observer under both directions of the key. Returns false
    /// without touching the table when either slot is already taken: the
    /// first registrant keeps the connection and its poll loop.
    pub async fn register(&self, key: &ConnectionKey, observer: Arc<Observer>) -> bool {
        {
            let mut observers = self.observers.write().await;
            let reverse = key.reverse();
            if observers.contains_key(key) || observers.contains_key(&reverse) {
                return false;
            }
            observers.insert(key.clone(), observer.clone());
            observers.insert(reverse, observer.clone());
        }
        info!(
            event = "observer_registered",
            conn_id = %observer.conn_id,
            key = %key
        );
        true
    }

    pub async fn lookup(&self, key: &ConnectionKey) -> Option<Arc<Observer>> {
        self.observers.read().await.get(key).cloned()
    }

    pub async fn lookup_either_direction(&self, key: &ConnectionKey) -> Option<Arc<Observer>> {
        let observers = self.observers.read().await;
        observers
            .get(key)
            .or_else(|| observers.get(&key.reverse()))
            .cloned()
    }

    pub async fn is_registered(&self, key: &ConnectionKey) -> bool {
        self.observers.read().await.contains_key(key)
    }

    /// Removes both directions of the key, whichever direction is passed.
    pub async fn unregister(&self, key: &ConnectionKey) -> bool {
        let mut observers = self.observers.write().await;
        let removed_forward = observers.remove(key).is_some();
        let removed_reverse = observers.remove(&key.reverse()).is_some();
        removed_forward || removed_reverse
    }

    /// Teardown used by both the close handler and the failed-delivery
    /// path. Only the handle currently holding the registration may remove
    /// it; a release from an observer that never claimed the key, or was
    /// already replaced, is a no-op.
    pub async fn release(&self, observer: &Observer, reason: &str) -> bool {
        {
            let mut observers = self.observers.write().await;
            let held = observers
                .get(&observer.key)
                .map(|current| current.conn_id == observer.conn_id)
                .unwrap_or(false);
            if !held {
                return false;
            }
            observers.remove(&observer.key);
            observers.remove(&observer.key.reverse());
        }
        info!(
            event = "observer_released",
            conn_id = %observer.conn_id,
            key = %observer.key,
            reason = reason
        );
        true
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConnectionKey {
        ConnectionKey::new("10.0.0.1".to_string(), "10.0.0.2".to_string(), 5000, 80)
    }

    fn observer(conn_id: &str, key: &ConnectionKey) -> (Arc<Observer>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4);
        (
            Arc::new(Observer::new(conn_id.to_string(), key.clone(), tx)),
            rx,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_makes_both_directions_resolvable() {
        let registry = ObserverRegistry::new();
        let (obs, _rx) = observer("conn-1", &key());
        assert!(registry.register(&key(), obs).await);

        let forward = registry.lookup(&key()).await.expect("forward");
        let reverse = registry.lookup(&key().reverse()).await.expect("reverse");
        assert_eq!(forward.conn_id(), "conn-1");
        assert_eq!(forward.conn_id(), reverse.conn_id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_registration_is_refused_in_either_direction() {
        let registry = ObserverRegistry::new();
        let (first, _first_rx) = observer("conn-1", &key());
        let (forward, _forward_rx) = observer("conn-2", &key());
        let reverse_key = key().reverse();
        let (reverse, _reverse_rx) = observer("conn-3", &reverse_key);

        assert!(registry.register(&key(), first).await);
        assert!(!registry.register(&key(), forward).await);
        assert!(!registry.register(&reverse_key, reverse).await);
        assert_eq!(
            registry.lookup(&key()).await.expect("holder").conn_id(),
            "conn-1"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lookup_either_direction_accepts_the_reversed_key() {
        let registry = ObserverRegistry::new();
        let (obs, _rx) = observer("conn-1", &key());
        registry.register(&key(), obs).await;

        assert!(registry
            .lookup_either_direction(&key().reverse())
            .await
            .is_some());
        assert!(registry
            .lookup_either_direction(&ConnectionKey::new(
                "10.9.9.9".to_string(),
                "10.8.8.8".to_string(),
                1,
                2
            ))
            .await
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregister_clears_both_directions() {
        let registry = ObserverRegistry::new();
        let (obs, _rx) = observer("conn-1", &key());
        registry.register(&key(), obs).await;

        assert!(registry.unregister(&key().reverse()).await);
        assert!(!registry.is_registered(&key()).await);
        assert!(!registry.is_registered(&key().reverse()).await);
        assert!(!registry.unregister(&key()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_requires_the_current_holder() {
        let registry = ObserverRegistry::new();
        let (first, _first_rx) = observer("conn-1", &key());
        registry.register(&key(), first.clone()).await;

        let (stale, _stale_rx) = observer("conn-2", &key());
        assert!(!registry.release(&stale, "disconnect").await);
        assert!(registry.is_registered(&key()).await);

        assert!(registry.release(&first, "disconnect").await);
        assert!(!registry.is_registered(&key()).await);
        assert!(!registry.is_registered(&key().reverse()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivery_reports_transport_gone_when_the_receiver_is_dropped() {
        let (obs, rx) = observer("conn-1", &key());
        drop(rx);
        assert_eq!(obs.deliver("[]".to_string()), DeliveryOutcome::TransportGone);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivery_reports_transport_gone_on_a_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let obs = Observer::new("conn-1".to_string(), key(), tx);
        assert_eq!(obs.deliver("[1]".to_string()), DeliveryOutcome::Delivered);
        assert_eq!(obs.deliver("[2]".to_string()), DeliveryOutcome::TransportGone);
    }
}

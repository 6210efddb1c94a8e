//! Fan-out hub for connected front-end sessions.
//!
//! Each subscriber owns a bounded queue of serialized frames. A
//! broadcast serializes its payload once and attempts a non-blocking
//! enqueue into every queue; a full queue drops the frame for that
//! subscriber only. One slow consumer can therefore never stall the
//! producer or its peers. Frames delivered to any one subscriber keep
//! broadcast-call order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

/// Counters describing hub traffic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    /// Frames handed to the fan-out.
    pub broadcasts: u64,
    /// Per-subscriber enqueue failures.
    pub dropped: u64,
}

/// Identifier handed out at registration.
pub type SubscriberId = u64;

/// The subscriber set plus its traffic counters.
pub struct Hub {
    queue_capacity: usize,
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    stats: Mutex<HubStats>,
}

impl Hub {
    /// Create a hub whose subscriber queues hold `queue_capacity`
    /// frames.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stats: Mutex::new(HubStats::default()),
        }
    }

    /// Add a subscriber; the returned receiver is the subscriber's
    /// outbound queue and closes on [`Hub::unregister`].
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let total = {
            let mut subs = self.subscribers.write().unwrap();
            subs.insert(id, tx);
            subs.len()
        };
        tracing::info!(subscriber = id, total, "subscriber connected");
        (id, rx)
    }

    /// Remove a subscriber. Idempotent; dropping the stored sender
    /// closes the subscriber's queue.
    pub fn unregister(&self, id: SubscriberId) {
        let removed = self.subscribers.write().unwrap().remove(&id).is_some();
        if removed {
            let total = self.subscribers.read().unwrap().len();
            tracing::info!(subscriber = id, total, "subscriber disconnected");
        }
    }

    /// Serialize `payload` once and fan it out to every subscriber.
    ///
    /// Returns the number of queues that accepted the frame.
    pub fn broadcast<T: Serialize>(&self, kind: &str, payload: &T) -> usize {
        let frame = match serde_json::to_string(&json!({
            "type": kind,
            "data": payload,
            "time": Utc::now().timestamp(),
        })) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, kind, "failed to serialize broadcast frame");
                return 0;
            }
        };
        self.fan_out(frame)
    }

    fn fan_out(&self, frame: String) -> usize {
        let subs = self.subscribers.read().unwrap();
        let mut delivered = 0;
        let mut dropped = 0;
        for (id, tx) in subs.iter() {
            if tx.try_send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                dropped += 1;
                tracing::debug!(subscriber = id, "subscriber queue full, frame dropped");
            }
        }
        let mut stats = self.stats.lock().unwrap();
        stats.broadcasts += 1;
        stats.dropped += dropped;
        delivered
    }

    /// Current subscriber total.
    pub fn count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> HubStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Handle for producers feeding the dispatcher.
#[derive(Clone)]
pub struct HubSender {
    tx: mpsc::Sender<(String, serde_json::Value)>,
}

impl HubSender {
    /// Enqueue an event for dispatch. Never blocks; the event is
    /// dropped with a warning when the dispatcher is saturated.
    pub fn send<T: Serialize>(&self, kind: &str, payload: &T) {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, kind, "failed to serialize event");
                return;
            }
        };
        if self.tx.try_send((kind.to_string(), value)).is_err() {
            tracing::warn!(kind, "dispatcher input full, dropping event");
        }
    }
}

/// Spawn the dispatcher task: it drains a bounded input channel and
/// performs the fan-out for each event in arrival order. The task
/// finishes once every [`HubSender`] clone is dropped.
pub fn spawn_dispatcher(
    hub: std::sync::Arc<Hub>,
    input_capacity: usize,
) -> (HubSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<(String, serde_json::Value)>(input_capacity);
    let handle = tokio::spawn(async move {
        while let Some((kind, payload)) = rx.recv().await {
            hub.broadcast::<serde_json::Value>(&kind, &payload);
        }
        tracing::debug!("hub dispatcher finished");
    });
    (HubSender { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn slow_subscribers_drop_excess_frames() {
        let hub = Hub::new(2);
        let mut receivers: Vec<_> = (0..3).map(|_| hub.register().1).collect();

        for i in 0..5 {
            hub.broadcast("danmaku", &json!({ "seq": i }));
        }

        // Each queue holds only the first two frames.
        for rx in &mut receivers {
            for expected in 0..2 {
                let frame = rx.try_recv().expect("queued frame");
                let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(value["data"]["seq"], expected);
            }
            assert!(rx.try_recv().is_err());
        }

        let stats = hub.stats();
        assert_eq!(stats.broadcasts, 5);
        assert_eq!(stats.dropped, 9);
    }

    #[tokio::test]
    async fn frames_keep_broadcast_order() {
        let hub = Hub::new(8);
        let (_, mut rx) = hub.register();
        for i in 0..5 {
            hub.broadcast("danmaku", &json!({ "seq": i }));
        }
        for expected in 0..5 {
            let frame = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["data"]["seq"], expected);
        }
    }

    #[tokio::test]
    async fn unregister_closes_the_queue_and_is_idempotent() {
        let hub = Hub::new(2);
        let (id, mut rx) = hub.register();
        assert_eq!(hub.count(), 1);
        hub.unregister(id);
        hub.unregister(id);
        assert_eq!(hub.count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dispatcher_fans_out_in_arrival_order() {
        let hub = Arc::new(Hub::new(8));
        let (sender, handle) = spawn_dispatcher(hub.clone(), 16);
        let (_, mut rx) = hub.register();

        for i in 0..3 {
            sender.send("story", &json!({ "seq": i }));
        }
        drop(sender);
        handle.await.unwrap();

        for expected in 0..3 {
            let frame = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["data"]["seq"], expected);
        }
    }
}

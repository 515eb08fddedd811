//! Realtime fan-out of committed attendance events to dashboard listeners.
//!
//! Delivery is best effort. A listener whose send fails is pruned during the
//! same publish call; there is no separate health check and no redelivery.
//! Dashboards reconcile through the attendance query surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rollcall_core::SessionId;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one subscription within the registry.
pub type ListenerId = Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("listener disconnected")]
    Closed,
    #[error("listener queue full")]
    Full,
}

/// Event pushed to dashboards, serialised as a flat JSON record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttendanceEvent {
    AttendanceUpdate {
        student_name: String,
        student_id: String,
        check_in_time: DateTime<Utc>,
        confidence: f32,
    },
}

/// Outbound half of a listener's duplex channel.
///
/// `deliver` must not block: it is called with the registry lock held,
/// which is what keeps per-listener delivery in publish order.
pub trait EventSink: Send + Sync {
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError>;
}

impl EventSink for mpsc::Sender<String> {
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError> {
        self.try_send(payload.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl EventSink for mpsc::UnboundedSender<String> {
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError> {
        self.send(payload.to_string())
            .map_err(|_| DeliveryError::Closed)
    }
}

type Listeners = HashMap<ListenerId, Arc<dyn EventSink>>;

/// Session-scoped listener registry.
#[derive(Default)]
pub struct FanoutNotifier {
    sessions: Mutex<HashMap<SessionId, Listeners>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: SessionId, sink: Arc<dyn EventSink>) -> ListenerId {
        let id = Uuid::new_v4();
        let mut sessions = self.lock();
        sessions.entry(session_id).or_default().insert(id, sink);
        tracing::info!(
            session_id,
            listener = %id,
            listeners = sessions[&session_id].len(),
            "listener subscribed"
        );
        id
    }

    /// Subscribe a bounded channel and hand back its receiving end.
    pub fn subscribe_channel(
        &self,
        session_id: SessionId,
        capacity: usize,
    ) -> (ListenerId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.subscribe(session_id, Arc::new(tx)), rx)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, session_id: SessionId, listener: ListenerId) -> bool {
        let mut sessions = self.lock();
        let Some(listeners) = sessions.get_mut(&session_id) else {
            return false;
        };
        let removed = listeners.remove(&listener).is_some();
        if listeners.is_empty() {
            sessions.remove(&session_id);
        }
        if removed {
            tracing::info!(session_id, listener = %listener, "listener unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every listener of `session_id`, pruning those
    /// whose delivery fails. Returns the number of successful deliveries.
    pub fn publish(&self, session_id: SessionId, event: &AttendanceEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, session_id, "event serialisation failed");
                return 0;
            }
        };

        let mut sessions = self.lock();
        let Some(listeners) = sessions.get_mut(&session_id) else {
            tracing::trace!(session_id, "publish: no listeners");
            return 0;
        };

        let mut failed = Vec::new();
        let mut delivered = 0;
        for (id, sink) in listeners.iter() {
            match sink.deliver(&payload) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((*id, e)),
            }
        }

        for (id, e) in failed {
            listeners.remove(&id);
            tracing::warn!(session_id, listener = %id, error = %e, "pruned listener after failed delivery");
        }
        if listeners.is_empty() {
            sessions.remove(&session_id);
        }

        tracing::debug!(session_id, delivered, "event published");
        delivered
    }

    pub fn listener_count(&self, session_id: SessionId) -> usize {
        self.lock().get(&session_id).map_or(0, HashMap::len)
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Listeners>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> AttendanceEvent {
        AttendanceEvent::AttendanceUpdate {
            student_name: name.to_string(),
            student_id: "S1".to_string(),
            check_in_time: Utc::now(),
            confidence: 0.75,
        }
    }

    /// A sink whose peer has gone away.
    struct Broken;

    impl EventSink for Broken {
        fn deliver(&self, _payload: &str) -> Result<(), DeliveryError> {
            Err(DeliveryError::Closed)
        }
    }

    #[test]
    fn test_publish_without_listeners_is_noop() {
        let n = FanoutNotifier::new();
        assert_eq!(n.publish(7, &event("Ada")), 0);
        assert_eq!(n.session_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_session_listeners() {
        let n = FanoutNotifier::new();
        let (_, mut a) = n.subscribe_channel(1, 8);
        let (_, mut b) = n.subscribe_channel(1, 8);
        let (_, mut other) = n.subscribe_channel(2, 8);

        assert_eq!(n.publish(1, &event("Ada")), 2);

        let msg: serde_json::Value = serde_json::from_str(&a.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "attendance_update");
        assert_eq!(msg["student_name"], "Ada");
        assert_eq!(msg["student_id"], "S1");
        assert!(msg["check_in_time"].as_str().unwrap().ends_with('Z'));
        assert!((msg["confidence"].as_f64().unwrap() - 0.75).abs() < 1e-6);

        assert!(b.recv().await.is_some());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fifo_per_listener() {
        let n = FanoutNotifier::new();
        let (_, mut rx) = n.subscribe_channel(1, 8);
        for name in ["A", "B", "C"] {
            n.publish(1, &event(name));
        }
        for expected in ["A", "B", "C"] {
            let msg: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(msg["student_name"], expected);
        }
    }

    #[test]
    fn test_failed_listener_pruned_others_still_served() {
        let n = FanoutNotifier::new();
        let (_, mut healthy) = n.subscribe_channel(1, 8);
        n.subscribe(1, Arc::new(Broken));
        let (_, dropped) = n.subscribe_channel(1, 8);
        drop(dropped);
        assert_eq!(n.listener_count(1), 3);

        assert_eq!(n.publish(1, &event("Ada")), 1);
        assert_eq!(n.listener_count(1), 1);
        assert!(healthy.try_recv().is_ok());
    }

    #[test]
    fn test_full_queue_counts_as_failure() {
        let n = FanoutNotifier::new();
        let (_, _rx) = n.subscribe_channel(1, 1);
        assert_eq!(n.publish(1, &event("A")), 1);
        assert_eq!(n.publish(1, &event("B")), 0);
        assert_eq!(n.listener_count(1), 0);
        assert_eq!(n.session_count(), 0);
    }

    #[test]
    fn test_unsubscribe_drops_empty_session() {
        let n = FanoutNotifier::new();
        let (id, _rx) = n.subscribe_channel(3, 4);
        assert!(n.unsubscribe(3, id));
        assert!(!n.unsubscribe(3, id));
        assert_eq!(n.session_count(), 0);
    }

    #[test]
    fn test_unbounded_sink() {
        let n = FanoutNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        n.subscribe(5, Arc::new(tx));
        assert_eq!(n.publish(5, &event("Ada")), 1);
        assert!(rx.try_recv().is_ok());
    }
}

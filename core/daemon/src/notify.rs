//! Outbound wear notifications.

use iconwear_protocol::Notification;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

/// Receives notifications from the engine.
///
/// `publish` is called while the engine holds its state lock, so
/// implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: &Notification);
}

/// Fans notifications out to any number of channel subscribers.
///
/// Subscribers whose receiver has been dropped are pruned on the next publish.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Sender<Notification>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(subscribers) => subscribers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl NotificationSink for Broadcaster {
    fn publish(&self, notification: &Notification) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subscribers.len();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
        let dropped = before - subscribers.len();
        tracing::debug!(
            app_id = %notification.app_id(),
            notification = ?notification,
            subscribers = subscribers.len(),
            dropped,
            "Published wear notification"
        );
    }
}

//! WebSocketTracker (component E): per-session registry of client WebSocket
//! connections that have been upgraded and bound to this tunnel. Each entry
//! owns the sender half of the client socket and is responsible for closing
//! it exactly once.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::ws::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::protocol::RequestId;

pub struct TunneledWebSocket {
    pub to_client: mpsc::UnboundedSender<Message>,
    pub created_at: Instant,
}

#[derive(Default)]
pub struct WebSocketTracker {
    inner: Mutex<HashMap<RequestId, TunneledWebSocket>>,
}

impl WebSocketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: RequestId, socket: TunneledWebSocket) {
        self.inner.lock().insert(id, socket);
    }

    pub fn send(&self, id: RequestId, message: Message) -> bool {
        match self.inner.lock().get(&id) {
            Some(socket) => socket.to_client.send(message).is_ok(),
            None => false,
        }
    }

    /// Removes and returns the entry so the caller can close the underlying
    /// socket exactly once, outside the lock.
    pub fn remove(&self, id: RequestId) -> Option<TunneledWebSocket> {
        self.inner.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoked on session teardown: drains every tracked socket so the
    /// caller can close each underlying client connection exactly once.
    pub fn close_all(&self) -> Vec<(RequestId, TunneledWebSocket)> {
        self.inner.lock().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_send_remove_round_trip() {
        let tracker = WebSocketTracker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracker.add(
            1,
            TunneledWebSocket {
                to_client: tx,
                created_at: Instant::now(),
            },
        );
        assert!(tracker.send(1, Message::Text("hi".into())));
        assert_eq!(rx.try_recv().unwrap(), Message::Text("hi".into()));

        assert!(tracker.remove(1).is_some());
        assert!(!tracker.send(1, Message::Text("gone".into())));
    }

    #[test]
    fn close_all_drains_every_tracked_socket() {
        let tracker = WebSocketTracker::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        tracker.add(1, TunneledWebSocket { to_client: tx_a, created_at: Instant::now() });
        tracker.add(2, TunneledWebSocket { to_client: tx_b, created_at: Instant::now() });

        let drained = tracker.close_all();
        assert_eq!(drained.len(), 2);
        assert!(tracker.is_empty());
    }
}

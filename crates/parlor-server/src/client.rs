use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parlor_core::events::ServerEvent;
use parlor_core::ids::ConnectionId;
use parlor_core::outbox::{Outbox, Target};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::handlers::Inbound;

/// A live WebSocket connection as seen by the transport.
pub struct Client {
    tx: mpsc::Sender<String>,
    last_seen: AtomicU64,
}

impl Client {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            last_seen: AtomicU64::new(now_secs()),
        }
    }

    pub fn record_activity(&self) {
        self.last_seen.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_seen.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Serialize an event to its wire frame.
pub fn encode(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode event");
            None
        }
    }
}

/// Registry of all connected WebSocket clients.
pub struct ConnectionRegistry {
    clients: DashMap<ConnectionId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            client_timeout,
        }
    }

    /// Register a new client and return its id and outbound receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(Client::new(tx)));
        (id, rx)
    }

    /// Drop a client. Its writer drains what is queued and closes the socket.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn record_activity(&self, id: &ConnectionId) {
        if let Some(client) = self.clients.get(id) {
            client.record_activity();
        }
    }

    /// Queue a frame for one client. Never blocks; a client whose queue is
    /// full is evicted, since it has already missed state it cannot recover.
    pub fn send_to(&self, id: &ConnectionId, frame: String) -> bool {
        let outcome = match self.clients.get(id) {
            Some(client) => client.tx.try_send(frame),
            None => return false,
        };
        match outcome {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.evict_lagging(id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame for every client except `skip`, evicting any that lag.
    pub fn broadcast(&self, frame: &str, skip: Option<&ConnectionId>) -> usize {
        let mut sent = 0;
        let mut lagging = Vec::new();
        for entry in self.clients.iter() {
            if Some(entry.key()) == skip {
                continue;
            }
            match entry.value().tx.try_send(frame.to_owned()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => lagging.push(entry.key().clone()),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        // Shard locks are released once iteration ends.
        for id in &lagging {
            self.evict_lagging(id);
        }
        sent
    }

    fn evict_lagging(&self, id: &ConnectionId) {
        if self.unregister(id) {
            tracing::warn!(
                connection_id = %id,
                max_send_queue = self.max_send_queue,
                "send queue full, evicting connection"
            );
        }
    }

    /// Hand every delivery of a transition to its targets, in order.
    pub fn deliver(&self, outbox: Outbox) {
        for delivery in outbox {
            let Some(frame) = encode(&delivery.event) else {
                continue;
            };
            match &delivery.target {
                Target::Connection(id) => {
                    self.send_to(id, frame);
                }
                Target::All => {
                    self.broadcast(&frame, None);
                }
                Target::AllExcept(id) => {
                    self.broadcast(&frame, Some(id));
                }
            }
        }
    }

    /// Remove clients silent for longer than the client timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "reaped silent connection");
        }
        dead.len()
    }
}

/// Drive one socket: a writer forwarding queued frames plus the `getStatus`
/// heartbeat, and a reader feeding frames into the shared inbound channel.
/// Returns once either side finishes; the caller then runs the disconnect path.
pub async fn handle_ws_connection(
    socket: WebSocket,
    id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    inbound: mpsc::Sender<Inbound>,
    heartbeat: Duration,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = id.clone();
    let mut writer = tokio::spawn(async move {
        let status_frame = encode(&ServerEvent::GetStatus);
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(frame) => {
                            if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if let Some(frame) = &status_frame {
                        if ws_tx.send(WsMessage::Text(frame.clone().into())).await.is_err() {
                            return;
                        }
                        tracing::trace!(connection_id = %writer_id, "sent getStatus");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    let reader_id = id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    reader_registry.record_activity(&reader_id);
                    let frame = Inbound::Frame(reader_id.clone(), text.to_string());
                    if inbound.send(frame).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) | WsMessage::Ping(_) => {
                    reader_registry.record_activity(&reader_id);
                }
                WsMessage::Close(_) => break,
                WsMessage::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    registry.unregister(&id);
}

/// Periodically reap silent clients until `cancel` fires.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_clients();
                    if removed > 0 {
                        tracing::info!(removed, "dead client cleanup");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_core::events::CurrentSnapshot;

    fn registry(queue: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(queue, Duration::from_secs(45))
    }

    #[test]
    fn register_and_unregister() {
        let registry = registry(32);
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.count(), 2);

        assert!(registry.unregister(&a));
        assert!(!registry.unregister(&a));
        assert!(!registry.contains(&a));
        assert!(registry.contains(&b));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn send_to_specific_client() {
        let registry = registry(32);
        let (id, mut rx) = registry.register();
        assert!(registry.send_to(&id, "frame".into()));
        assert_eq!(rx.try_recv().unwrap(), "frame");
        assert!(!registry.send_to(&ConnectionId::new(), "frame".into()));
    }

    #[test]
    fn full_queue_evicts_lagging_client() {
        let registry = registry(2);
        let (id, mut rx) = registry.register();
        assert!(registry.send_to(&id, "1".into()));
        assert!(registry.send_to(&id, "2".into()));
        assert!(!registry.send_to(&id, "3".into()));
        assert!(!registry.contains(&id));

        // Already queued frames still drain before the channel closes.
        assert_eq!(rx.try_recv().unwrap(), "1");
        assert_eq!(rx.try_recv().unwrap(), "2");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn broadcast_evicts_only_the_slow_client() {
        let registry = registry(1);
        let (slow, _rx_slow) = registry.register();
        let (fast, mut rx_fast) = registry.register();

        assert_eq!(registry.broadcast("a", None), 2);
        assert_eq!(rx_fast.try_recv().unwrap(), "a");
        assert_eq!(registry.broadcast("b", None), 1);

        assert!(!registry.contains(&slow));
        assert!(registry.contains(&fast));
        assert_eq!(rx_fast.try_recv().unwrap(), "b");
    }

    #[test]
    fn broadcast_skips_excluded() {
        let registry = registry(32);
        let (a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();
        assert_eq!(registry.broadcast("hi", Some(&a)), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), "hi");
    }

    #[test]
    fn deliver_honours_targets_and_order() {
        let registry = registry(32);
        let (a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();

        let mut outbox = Outbox::new();
        outbox.to(&a, ServerEvent::UsernameSuccess);
        outbox.broadcast_except(&a, ServerEvent::AddUser("alice".into()));
        outbox.broadcast(ServerEvent::UpdateCurrentVideo(CurrentSnapshot {
            video: None,
            start_seconds: 0.0,
        }));
        registry.deliver(outbox);

        let a_frames: Vec<String> = std::iter::from_fn(|| rx_a.try_recv().ok()).collect();
        let b_frames: Vec<String> = std::iter::from_fn(|| rx_b.try_recv().ok()).collect();
        assert_eq!(a_frames.len(), 2);
        assert!(a_frames[0].contains("usernameSuccess"));
        assert!(a_frames[1].contains("updateCurrentVideo"));
        assert_eq!(b_frames.len(), 2);
        assert!(b_frames[0].contains("addUser"));
        assert!(b_frames[1].contains("updateCurrentVideo"));
    }

    #[test]
    fn cleanup_reaps_silent_clients() {
        let registry = registry(32);
        let (silent, _rx1) = registry.register();
        let (_active, _rx2) = registry.register();

        if let Some(client) = registry.clients.get(&silent) {
            client.last_seen.store(0, Ordering::Relaxed);
        }

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert!(!registry.contains(&silent));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn activity_keeps_client_alive() {
        let registry = registry(32);
        let (id, _rx) = registry.register();
        if let Some(client) = registry.clients.get(&id) {
            client.last_seen.store(0, Ordering::Relaxed);
        }
        registry.record_activity(&id);
        assert_eq!(registry.cleanup_dead_clients(), 0);
    }

    #[test]
    fn unregister_closes_receiver_after_drain() {
        let registry = registry(32);
        let (id, mut rx) = registry.register();
        registry.send_to(&id, "last words".into());
        registry.unregister(&id);
        assert_eq!(rx.try_recv().unwrap(), "last words");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}

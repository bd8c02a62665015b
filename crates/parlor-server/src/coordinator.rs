//! Serialized access to the room.
//!
//! Every handler locks the room, runs one synchronous transition, releases
//! the lock and only then hands the resulting deliveries to the transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parlor_core::events::ClientEvent;
use parlor_core::ids::{ConnectionId, ContentId};
use parlor_core::outbox::Outbox;
use parlor_core::room::{ConfirmationPoll, RoomState};
use parlor_core::{FormatterChain, RoomConfig, RoomError};
use parlor_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;

use crate::client::ConnectionRegistry;

/// Scheduling of the end-of-playback confirmation poll.
#[derive(Clone, Copy, Debug)]
pub struct AdvanceSchedule {
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for AdvanceSchedule {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

struct PendingAdvance {
    entry: ContentId,
    cancel: CancellationToken,
}

pub struct RoomCoordinator {
    room: Mutex<RoomState>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsRecorder>,
    schedule: AdvanceSchedule,
    pending: Mutex<Option<PendingAdvance>>,
    shutdown: CancellationToken,
}

impl RoomCoordinator {
    pub fn new(
        config: RoomConfig,
        formatter: FormatterChain,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<MetricsRecorder>,
        schedule: AdvanceSchedule,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        tracing::info!(
            capacity = config.capacity,
            advance_policy = %config.advance_policy,
            privilege_enabled = config.admin_secret.is_some(),
            "room created"
        );
        Arc::new(Self {
            room: Mutex::new(RoomState::new(config, formatter)),
            registry,
            metrics,
            schedule,
            pending: Mutex::new(None),
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Read-only access to the room under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&RoomState) -> R) -> R {
        f(&self.room.lock())
    }

    /// Admit a connection. Returns `false` when the room is full; the
    /// `roomFull` reply has already been queued and the caller must close.
    pub fn connect(&self, id: &ConnectionId) -> bool {
        let result = self.room.lock().connect(id);
        match result {
            Ok(outbox) => {
                tracing::info!(connection_id = %id, "connection admitted");
                self.after_transition(outbox);
                true
            }
            Err(err) => {
                self.reject(id, "connect", err);
                false
            }
        }
    }

    pub fn disconnect(&self, id: &ConnectionId) {
        let (outbox, username) = {
            let mut room = self.room.lock();
            let username = room.membership(id).and_then(|m| m.username.clone());
            (room.disconnect(id), username)
        };
        if let Some(username) = username {
            tracing::info!(connection_id = %id, username = %username, "user left");
        } else {
            tracing::debug!(connection_id = %id, "connection closed");
        }
        self.after_transition(outbox);
    }

    /// Apply one client event and deliver its consequences.
    pub fn handle(self: &Arc<Self>, id: &ConnectionId, event: ClientEvent) {
        let name = event.name();
        let started = Instant::now();
        self.metrics.counter_inc("room.events", &[("event", name)], 1);

        let result = self.room.lock().apply(id, event);
        self.metrics.histogram_observe(
            "room.handle_us",
            &[("event", name)],
            started.elapsed().as_micros() as f64,
        );

        match result {
            Ok(outbox) => {
                tracing::debug!(connection_id = %id, event = name, deliveries = outbox.len(), "event applied");
                self.after_transition(outbox);
                self.arm_advance_poll();
            }
            Err(err) => self.reject(id, name, err),
        }
    }

    /// Send a reply to a single connection outside any transition.
    pub fn reply(&self, id: &ConnectionId, event: parlor_core::ServerEvent) {
        let mut outbox = Outbox::new();
        outbox.to(id, event);
        self.registry.deliver(outbox);
    }

    fn reject(&self, id: &ConnectionId, event: &str, err: RoomError) {
        let kind = err.kind();
        self.metrics.counter_inc("room.rejections", &[("kind", kind)], 1);
        if err.is_authorization() {
            tracing::debug!(connection_id = %id, event, kind, "unauthorized request ignored");
        } else {
            tracing::info!(connection_id = %id, event, kind, error = %err, "request rejected");
        }
        if let Some(reply) = err.reply() {
            self.reply(id, reply);
        }
    }

    fn after_transition(&self, outbox: Outbox) {
        let (users, connections, pending) = {
            let room = self.room.lock();
            (
                room.registered_count(),
                room.connection_count(),
                room.pending_confirmation().cloned(),
            )
        };
        self.metrics.gauge_set("room.users", &[], users as f64);
        self.metrics.gauge_set("room.connections", &[], connections as f64);
        self.registry.deliver(outbox);

        // A poll whose entry is no longer pending has nothing left to do.
        let mut slot = self.pending.lock();
        if slot
            .as_ref()
            .is_some_and(|p| pending.as_ref() != Some(&p.entry))
        {
            if let Some(stale) = slot.take() {
                stale.cancel.cancel();
            }
        }
    }

    /// Start a confirmation poll if an advance is pending and none is running.
    fn arm_advance_poll(self: &Arc<Self>) {
        let Some(entry) = self.room.lock().pending_confirmation().cloned() else {
            return;
        };
        let cancel = {
            let mut slot = self.pending.lock();
            if slot.as_ref().is_some_and(|p| p.entry == entry) {
                return;
            }
            let cancel = self.shutdown.child_token();
            if let Some(previous) = slot.replace(PendingAdvance {
                entry: entry.clone(),
                cancel: cancel.clone(),
            }) {
                previous.cancel.cancel();
            }
            cancel
        };

        tracing::debug!(entry_id = %entry, "waiting for end-of-playback confirmations");
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_advance_poll(entry, cancel).await });
    }

    async fn run_advance_poll(self: Arc<Self>, entry: ContentId, cancel: CancellationToken) {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(self.schedule.poll_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => return,
            }

            let force = self
                .schedule
                .timeout
                .is_some_and(|timeout| started.elapsed() >= timeout);
            let outcome = self.room.lock().poll_confirmations(&entry, force);
            match outcome {
                ConfirmationPoll::Advanced(outbox) => {
                    if force {
                        tracing::info!(entry_id = %entry, "confirmation wait timed out, advancing");
                    } else {
                        tracing::info!(entry_id = %entry, "all users confirmed, advancing");
                    }
                    self.after_transition(outbox);
                    self.arm_advance_poll();
                    return;
                }
                ConfirmationPoll::Waiting { confirmed, required } => {
                    tracing::trace!(entry_id = %entry, confirmed, required, "still waiting");
                }
                ConfirmationPoll::Settled => {
                    self.clear_pending(&entry);
                    return;
                }
            }
        }
    }

    fn clear_pending(&self, entry: &ContentId) {
        let mut slot = self.pending.lock();
        if slot.as_ref().is_some_and(|p| &p.entry == entry) {
            *slot = None;
        }
    }

    /// Whether a confirmation poll is currently armed.
    pub fn advance_poll_armed(&self) -> bool {
        self.pending.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_core::entry::{EntryPayload, EntryRef};
    use parlor_core::events::{ChatPayload, PlaybackReport};
    use parlor_core::AdvancePolicy;
    use tokio::sync::mpsc;

    struct Harness {
        coordinator: Arc<RoomCoordinator>,
        registry: Arc<ConnectionRegistry>,
    }

    impl Harness {
        fn new(config: RoomConfig, schedule: AdvanceSchedule) -> Self {
            let registry = Arc::new(ConnectionRegistry::new(64, Duration::from_secs(45)));
            let coordinator = RoomCoordinator::new(
                config,
                FormatterChain::plain(),
                Arc::clone(&registry),
                Arc::new(MetricsRecorder::new()),
                schedule,
                CancellationToken::new(),
            );
            Self {
                coordinator,
                registry,
            }
        }

        fn connect(&self) -> (ConnectionId, mpsc::Receiver<String>) {
            let (id, rx) = self.registry.register();
            assert!(self.coordinator.connect(&id));
            (id, rx)
        }

        fn join(&self, name: &str) -> (ConnectionId, mpsc::Receiver<String>) {
            let (id, rx) = self.connect();
            self.coordinator
                .handle(&id, ClientEvent::UsernameRequested(name.into()));
            (id, rx)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| serde_json::from_str(&frame).unwrap())
            .collect()
    }

    fn names(frames: &[serde_json::Value]) -> Vec<&str> {
        frames.iter().filter_map(|f| f["event"].as_str()).collect()
    }

    fn payload(id: &str) -> EntryPayload {
        EntryPayload {
            id: id.into(),
            title: format!("Video {id}"),
            display: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn join_flow_delivers_snapshot_and_acks() {
        let h = Harness::new(RoomConfig::default(), AdvanceSchedule::default());
        let (_alice, mut rx_alice) = h.join("alice");
        let (_bob, mut rx_bob) = h.join("bob");

        assert_eq!(
            names(&drain(&mut rx_alice)),
            vec!["populateInitialData", "usernameSuccess", "addUser"]
        );
        let bob_frames = drain(&mut rx_bob);
        assert_eq!(names(&bob_frames), vec!["populateInitialData", "usernameSuccess"]);
        assert_eq!(bob_frames[0]["data"]["users"], serde_json::json!(["alice"]));
    }

    #[tokio::test]
    async fn duplicate_username_gets_error_only() {
        let h = Harness::new(RoomConfig::default(), AdvanceSchedule::default());
        let (_alice, mut rx_alice) = h.join("alice");
        let (other, mut rx_other) = h.connect();
        drain(&mut rx_alice);
        drain(&mut rx_other);

        h.coordinator
            .handle(&other, ClientEvent::UsernameRequested("ALICE".into()));
        assert_eq!(names(&drain(&mut rx_other)), vec!["usernameError"]);
        assert!(drain(&mut rx_alice).is_empty());
        assert_eq!(h.coordinator.inspect(|r| r.users().to_vec()), vec!["alice"]);
        assert_eq!(
            h.coordinator
                .metrics()
                .counter_get("room.rejections", &[("kind", "username_taken")]),
            1
        );
    }

    #[tokio::test]
    async fn full_room_reports_room_full() {
        let h = Harness::new(
            RoomConfig {
                capacity: 1,
                ..RoomConfig::default()
            },
            AdvanceSchedule::default(),
        );
        let _alice = h.join("alice");
        let (late, mut rx) = h.registry.register();
        assert!(!h.coordinator.connect(&late));
        assert_eq!(names(&drain(&mut rx)), vec!["roomFull"]);
    }

    #[tokio::test]
    async fn unauthorized_requests_are_silent() {
        let h = Harness::new(
            RoomConfig::default().with_admin_secret("s3cret"),
            AdvanceSchedule::default(),
        );
        let (alice, mut rx) = h.join("alice");
        drain(&mut rx);

        h.coordinator
            .handle(&alice, ClientEvent::AdminStatusRequested("nope".into()));
        h.coordinator
            .handle(&alice, ClientEvent::ThemeUpdated(Some("goth".into())));
        assert!(drain(&mut rx).is_empty());
        assert!(h.coordinator.inspect(|r| r.theme().is_none()));
    }

    #[tokio::test]
    async fn stale_playback_resyncs_reporter() {
        let h = Harness::new(RoomConfig::default(), AdvanceSchedule::default());
        let (alice, mut rx) = h.join("alice");
        h.coordinator
            .handle(&alice, ClientEvent::VideoAddedToQueue(payload("v1")));
        h.coordinator.handle(&alice, ClientEvent::GetCurrentVideo);
        drain(&mut rx);

        h.coordinator.handle(
            &alice,
            ClientEvent::CurrentVideoUpdated(PlaybackReport {
                entry: EntryRef::new("v1"),
                elapsed_seconds: 100.0,
            }),
        );
        let frames = drain(&mut rx);
        assert_eq!(names(&frames), vec!["updateCurrentVideo"]);
        assert_eq!(frames[0]["data"]["startSeconds"], 3.0);
    }

    #[tokio::test]
    async fn chat_is_broadcast_with_bound_name() {
        let h = Harness::new(RoomConfig::default(), AdvanceSchedule::default());
        let (alice, mut rx_alice) = h.join("alice");
        let (_bob, mut rx_bob) = h.join("bob");
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        h.coordinator.handle(
            &alice,
            ClientEvent::MessageSent(ChatPayload {
                message: "hello".into(),
            }),
        );
        for rx in [&mut rx_alice, &mut rx_bob] {
            let frames = drain(rx);
            assert_eq!(names(&frames), vec!["addMessage"]);
            assert_eq!(frames[0]["data"]["username"], "alice");
        }
    }

    #[tokio::test]
    async fn disconnect_broadcasts_removal_and_resets() {
        let h = Harness::new(RoomConfig::default(), AdvanceSchedule::default());
        let (alice, _rx_alice) = h.join("alice");
        let (bob, mut rx_bob) = h.join("bob");
        h.coordinator
            .handle(&alice, ClientEvent::VideoAddedToQueue(payload("v1")));
        drain(&mut rx_bob);

        h.coordinator.disconnect(&alice);
        assert_eq!(names(&drain(&mut rx_bob)), vec!["removeUser"]);
        h.coordinator.disconnect(&bob);
        assert!(h.coordinator.inspect(|r| r.queue().is_empty()));
    }

    #[tokio::test]
    async fn guests_are_resynced_when_room_resets() {
        let h = Harness::new(RoomConfig::default(), AdvanceSchedule::default());
        let (_guest, mut rx_guest) = h.connect();
        let (alice, _rx_alice) = h.join("alice");
        h.coordinator
            .handle(&alice, ClientEvent::VideoAddedToQueue(payload("v1")));
        drain(&mut rx_guest);

        h.coordinator.disconnect(&alice);
        let frames = drain(&mut rx_guest);
        assert_eq!(names(&frames), vec!["removeUser", "populateInitialData"]);
        assert_eq!(frames[1]["data"]["playlist"], serde_json::json!([]));
    }

    fn confirm_config() -> RoomConfig {
        RoomConfig {
            advance_policy: AdvancePolicy::AllConfirm,
            ..RoomConfig::default()
        }
    }

    async fn confirm_room(
        schedule: AdvanceSchedule,
    ) -> (Harness, ConnectionId, ConnectionId, mpsc::Receiver<String>) {
        let h = Harness::new(confirm_config(), schedule);
        let (alice, mut rx) = h.join("alice");
        let (bob, _rx_bob) = h.join("bob");
        h.coordinator
            .handle(&alice, ClientEvent::VideoAddedToQueue(payload("v1")));
        h.coordinator
            .handle(&alice, ClientEvent::VideoAddedToQueue(payload("v2")));
        h.coordinator.handle(&alice, ClientEvent::GetCurrentVideo);
        drain(&mut rx);
        (h, alice, bob, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn all_confirm_advances_on_last_confirmation() {
        let (h, alice, bob, mut rx) = confirm_room(AdvanceSchedule::default()).await;

        h.coordinator
            .handle(&alice, ClientEvent::VideoEnded(EntryRef::new("v1")));
        assert!(h.coordinator.advance_poll_armed());
        assert!(drain(&mut rx).is_empty());

        h.coordinator
            .handle(&bob, ClientEvent::VideoEnded(EntryRef::new("v1")));
        assert_eq!(names(&drain(&mut rx)), vec!["playNextVideo"]);
        assert!(!h.coordinator.advance_poll_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_advances_after_missing_user_leaves() {
        let (h, alice, bob, mut rx) = confirm_room(AdvanceSchedule::default()).await;

        h.coordinator
            .handle(&alice, ClientEvent::VideoEnded(EntryRef::new("v1")));
        h.coordinator.disconnect(&bob);
        drain(&mut rx);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(names(&drain(&mut rx)), vec!["playNextVideo"]);
        assert_eq!(
            h.coordinator
                .inspect(|r| r.current_id().map(|id| id.as_str().to_owned())),
            Some("v2".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_waits_indefinitely_without_timeout() {
        let (h, alice, _bob, mut rx) = confirm_room(AdvanceSchedule::default()).await;
        h.coordinator
            .handle(&alice, ClientEvent::VideoEnded(EntryRef::new("v1")));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(h.coordinator.advance_poll_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timeout_forces_advance() {
        let schedule = AdvanceSchedule {
            poll_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(5)),
        };
        let (h, alice, _bob, mut rx) = confirm_room(schedule).await;
        h.coordinator
            .handle(&alice, ClientEvent::VideoEnded(EntryRef::new("v1")));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(drain(&mut rx).is_empty());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(names(&drain(&mut rx)), vec!["playNextVideo"]);
        assert!(!h.coordinator.advance_poll_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_poll() {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::new(64, Duration::from_secs(45)));
        let coordinator = RoomCoordinator::new(
            confirm_config(),
            FormatterChain::plain(),
            Arc::clone(&registry),
            Arc::new(MetricsRecorder::new()),
            AdvanceSchedule {
                poll_interval: Duration::from_secs(1),
                timeout: Some(Duration::from_secs(2)),
            },
            shutdown.clone(),
        );
        let (alice, mut rx) = registry.register();
        coordinator.connect(&alice);
        coordinator.handle(&alice, ClientEvent::UsernameRequested("alice".into()));
        let (bob, _rx_bob) = registry.register();
        coordinator.connect(&bob);
        coordinator.handle(&bob, ClientEvent::UsernameRequested("bob".into()));
        coordinator.handle(&alice, ClientEvent::VideoAddedToQueue(payload("v1")));
        coordinator.handle(&alice, ClientEvent::GetCurrentVideo);
        coordinator.handle(&alice, ClientEvent::VideoEnded(EntryRef::new("v1")));
        drain(&mut rx);

        shutdown.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut rx).is_empty());
    }
}

//! Authoritative room state and every transition on it.
//!
//! `RoomState` is synchronous and owns no I/O. Each operation validates,
//! mutates and returns the [`Outbox`] of deliveries the transition
//! produced; rejections return a [`RoomError`] and leave state untouched.
//!
//! Selection is lazy: the playing entry stays at the head of the queue
//! until it is advanced past, and an empty room only starts playing once a
//! client asks for the current entry.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;

use crate::config::{AdvancePolicy, RoomConfig};
use crate::entry::{Entry, EntryPayload, EntryRef};
use crate::errors::RoomError;
use crate::events::{
    ChatMessage, ChatPayload, ClientEvent, CurrentSnapshot, InitialData, PlaybackReport,
    ServerEvent, VoteUpdate,
};
use crate::format::{FormatterChain, MessageFormatter};
use crate::ids::{ConnectionId, ContentId, MessageId};
use crate::outbox::Outbox;

/// Longest username accepted, in characters.
pub const MAX_USERNAME_LEN: usize = 32;
/// Longest chat message accepted, in characters.
pub const MAX_MESSAGE_LEN: usize = 2000;

/// What the room knows about one live connection.
#[derive(Clone, Debug)]
pub struct Membership {
    pub username: Option<String>,
    pub is_privileged: bool,
    pub connected_at: DateTime<Utc>,
}

impl Membership {
    fn guest() -> Self {
        Self {
            username: None,
            is_privileged: false,
            connected_at: Utc::now(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.username.is_some()
    }
}

/// The authoritative playback position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CurrentPlayback {
    pub entry: Option<Entry>,
    pub elapsed_seconds: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub up: u32,
    pub down: u32,
}

impl VoteTally {
    pub fn net(&self) -> i64 {
        i64::from(self.up) - i64::from(self.down)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    Up,
    Down,
}

/// Result of re-checking pending end-of-playback confirmations.
#[derive(Debug, PartialEq)]
pub enum ConfirmationPoll {
    /// Everyone still present confirmed (or the wait was forced).
    Advanced(Outbox),
    /// Still waiting on at least one registered user.
    Waiting { confirmed: usize, required: usize },
    /// Nothing is pending for that entry any more.
    Settled,
}

/// Everything that resets when the room drains.
#[derive(Debug, Default)]
struct RoomContent {
    users: Vec<String>,
    user_keys: HashSet<String>,
    queue: Vec<Entry>,
    history: Vec<Entry>,
    current: CurrentPlayback,
    theme: Option<String>,
    votes: VoteTally,
    karma: HashMap<String, i64>,
    messages: VecDeque<ChatMessage>,
    confirmations: HashSet<ConnectionId>,
}

/// Single room, single owner. Wrap it in one lock to share it.
#[derive(Debug)]
pub struct RoomState {
    config: RoomConfig,
    formatter: FormatterChain,
    connections: HashMap<ConnectionId, Membership>,
    content: RoomContent,
    resets: u64,
}

fn username_key(name: &str) -> String {
    name.to_lowercase()
}

/// Equality that does not short-circuit on the first differing byte.
fn secrets_match(expected: &[u8], given: &[u8]) -> bool {
    if expected.len() != given.len() {
        return false;
    }
    expected
        .iter()
        .zip(given)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

impl RoomState {
    pub fn new(config: RoomConfig, formatter: FormatterChain) -> Self {
        Self {
            config,
            formatter,
            connections: HashMap::new(),
            content: RoomContent::default(),
            resets: 0,
        }
    }

    // ── Read access ──

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn users(&self) -> &[String] {
        &self.content.users
    }

    pub fn registered_count(&self) -> usize {
        self.content.users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn membership(&self, id: &ConnectionId) -> Option<&Membership> {
        self.connections.get(id)
    }

    pub fn queue(&self) -> &[Entry] {
        &self.content.queue
    }

    pub fn history(&self) -> &[Entry] {
        &self.content.history
    }

    pub fn current(&self) -> &CurrentPlayback {
        &self.content.current
    }

    pub fn current_id(&self) -> Option<&ContentId> {
        self.content.current.entry.as_ref().map(|e| &e.id)
    }

    pub fn theme(&self) -> Option<&str> {
        self.content.theme.as_deref()
    }

    pub fn votes(&self) -> VoteTally {
        self.content.votes
    }

    pub fn karma(&self, username: &str) -> i64 {
        self.content.karma.get(username).copied().unwrap_or(0)
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.content.messages.iter()
    }

    /// How many times the room content has been wiped.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Position as replicated to clients, lag compensation included.
    pub fn current_snapshot(&self) -> CurrentSnapshot {
        let current = &self.content.current;
        let start_seconds = match current.entry {
            Some(_) => current.elapsed_seconds + self.config.lag_compensation_secs,
            None => 0.0,
        };
        CurrentSnapshot {
            video: current.entry.clone(),
            start_seconds,
        }
    }

    pub fn initial_data(&self) -> InitialData {
        InitialData {
            messages: self.content.messages.iter().cloned().collect(),
            playlist: self.content.queue.clone(),
            played_videos: self.content.history.clone(),
            users: self.content.users.clone(),
            theme: self.content.theme.clone(),
            current: self.current_snapshot(),
        }
    }

    /// Entry whose end is waiting on confirmations, if any.
    pub fn pending_confirmation(&self) -> Option<&ContentId> {
        if self.content.confirmations.is_empty() {
            None
        } else {
            self.current_id()
        }
    }

    // ── Dispatch ──

    /// Apply one inbound client event.
    pub fn apply(&mut self, id: &ConnectionId, event: ClientEvent) -> Result<Outbox, RoomError> {
        match event {
            ClientEvent::UsernameRequested(name) => self.register(id, &name),
            ClientEvent::GetCurrentVideo => self.request_current(id),
            ClientEvent::VideoAddedToQueue(payload) => self.enqueue(id, payload),
            ClientEvent::VideoRemovedFromQueue(entry) => self.dequeue(id, &entry),
            ClientEvent::CurrentVideoUpdated(report) => self.report_playback(id, &report),
            ClientEvent::MessageSent(payload) => self.send_message(id, &payload),
            ClientEvent::Upvote(entry) => self.vote(id, &entry, Vote::Up),
            ClientEvent::Downvote(entry) => self.vote(id, &entry, Vote::Down),
            ClientEvent::VideoEnded(entry) => self.video_ended(id, &entry),
            ClientEvent::VideoSkipped(entry) => self.skip(id, &entry),
            ClientEvent::AdminStatusRequested(secret) => self.request_privilege(id, &secret),
            ClientEvent::ThemeUpdated(theme) => self.update_theme(id, theme),
            ClientEvent::StatusSent(_) => {
                self.member(id)?;
                Ok(Outbox::new())
            }
        }
    }

    // ── Connection lifecycle ──

    /// Admit a new connection and send it the join snapshot.
    pub fn connect(&mut self, id: &ConnectionId) -> Result<Outbox, RoomError> {
        if self.registered_count() >= self.config.capacity {
            return Err(RoomError::RoomFull {
                capacity: self.config.capacity,
            });
        }
        if self.connections.is_empty() {
            self.reset();
        }
        self.connections.insert(id.clone(), Membership::guest());

        let mut outbox = Outbox::new();
        outbox.to(id, ServerEvent::PopulateInitialData(self.initial_data()));
        Ok(outbox)
    }

    /// Drop a connection. Safe to call for unknown or already removed ids.
    pub fn disconnect(&mut self, id: &ConnectionId) -> Outbox {
        let mut outbox = Outbox::new();
        let Some(membership) = self.connections.remove(id) else {
            return outbox;
        };
        let Some(username) = membership.username else {
            return outbox;
        };

        self.content.user_keys.remove(&username_key(&username));
        self.content.users.retain(|u| u != &username);
        self.content.confirmations.remove(id);
        outbox.broadcast_except(id, ServerEvent::RemoveUser(username));

        if self.content.users.is_empty() {
            self.reset();
            // Remaining guests still render the wiped content.
            if !self.connections.is_empty() {
                outbox.broadcast_except(id, ServerEvent::PopulateInitialData(self.initial_data()));
            }
        }
        outbox
    }

    /// Bind a username to a connection.
    pub fn register(&mut self, id: &ConnectionId, name: &str) -> Result<Outbox, RoomError> {
        if let Some(existing) = &self.member(id)?.username {
            return Err(RoomError::AlreadyRegistered(existing.clone()));
        }

        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_USERNAME_LEN {
            return Err(RoomError::InvalidUsername);
        }
        let key = username_key(name);
        if self.content.user_keys.contains(&key) {
            return Err(RoomError::UsernameTaken(name.to_owned()));
        }
        if self.registered_count() >= self.config.capacity {
            return Err(RoomError::RoomFull {
                capacity: self.config.capacity,
            });
        }

        if let Some(membership) = self.connections.get_mut(id) {
            membership.username = Some(name.to_owned());
        }
        self.content.user_keys.insert(key);
        self.content.users.push(name.to_owned());

        let mut outbox = Outbox::new();
        outbox.to(id, ServerEvent::UsernameSuccess);
        outbox.broadcast_except(id, ServerEvent::AddUser(name.to_owned()));
        Ok(outbox)
    }

    // ── Queue & playback ──

    /// Reply with the current entry, selecting the queue head if idle.
    pub fn request_current(&mut self, id: &ConnectionId) -> Result<Outbox, RoomError> {
        self.member(id)?;
        if self.content.current.entry.is_none() {
            self.select_head();
        }
        let mut outbox = Outbox::new();
        outbox.to(id, ServerEvent::UpdateCurrentVideo(self.current_snapshot()));
        Ok(outbox)
    }

    pub fn enqueue(&mut self, id: &ConnectionId, payload: EntryPayload) -> Result<Outbox, RoomError> {
        let submitter = self.registered_name(id)?;
        let entry = payload.into_entry(&submitter)?;
        if self.position(&entry.id).is_some() {
            return Err(RoomError::DuplicateEntry(entry.id));
        }

        self.content.queue.push(entry.clone());
        let mut outbox = Outbox::new();
        outbox.broadcast(ServerEvent::AddVideoToQueue(entry));
        Ok(outbox)
    }

    pub fn dequeue(&mut self, id: &ConnectionId, entry: &EntryRef) -> Result<Outbox, RoomError> {
        self.registered_name(id)?;
        let index = self
            .position(&entry.id)
            .ok_or_else(|| RoomError::UnknownEntry(entry.id.clone()))?;
        if self.current_id() == Some(&entry.id) {
            return Err(RoomError::EntryPlaying(entry.id.clone()));
        }

        let removed = self.content.queue.remove(index);
        let mut outbox = Outbox::new();
        outbox.broadcast(ServerEvent::RemoveVideoFromQueue(removed));
        Ok(outbox)
    }

    /// Accept a position report only when it is close to what we hold.
    pub fn report_playback(
        &mut self,
        id: &ConnectionId,
        report: &PlaybackReport,
    ) -> Result<Outbox, RoomError> {
        self.member(id)?;
        let elapsed = report.elapsed_seconds;
        if !elapsed.is_finite() || elapsed < 0.0 {
            return Err(RoomError::InvalidPayload(format!(
                "elapsedSeconds must be a non-negative number, got {elapsed}"
            )));
        }

        let stored = self.content.current.elapsed_seconds;
        match &self.content.current.entry {
            Some(entry) if entry.id == report.entry.id => {
                if (elapsed - stored).abs() <= self.config.playback_tolerance_secs {
                    self.content.current.elapsed_seconds = elapsed;
                    Ok(Outbox::new())
                } else {
                    Err(self.stale_playback(elapsed))
                }
            }
            Some(_) => Err(self.stale_playback(elapsed)),
            None => {
                let head_matches = self
                    .content
                    .queue
                    .first()
                    .is_some_and(|head| head.id == report.entry.id);
                if head_matches {
                    self.select_head();
                    self.content.current.elapsed_seconds = elapsed;
                    Ok(Outbox::new())
                } else {
                    Err(self.stale_playback(elapsed))
                }
            }
        }
    }

    /// A client reports the current entry finished playing.
    pub fn video_ended(&mut self, id: &ConnectionId, entry: &EntryRef) -> Result<Outbox, RoomError> {
        self.registered_name(id)?;
        self.ensure_advance_target(&entry.id)?;

        match self.config.advance_policy {
            AdvancePolicy::Immediate => Ok(self.advance()),
            AdvancePolicy::AllConfirm => {
                if self.content.current.entry.is_none() {
                    // Adopt the head so confirmations have something to refer to.
                    self.select_head();
                }
                self.content.confirmations.insert(id.clone());
                match self.poll_confirmations(&entry.id, false) {
                    ConfirmationPoll::Advanced(outbox) => Ok(outbox),
                    ConfirmationPoll::Waiting { .. } | ConfirmationPoll::Settled => {
                        Ok(Outbox::new())
                    }
                }
            }
        }
    }

    /// Re-check pending confirmations for `entry`. With `force`, advance
    /// regardless of who is still missing.
    pub fn poll_confirmations(&mut self, entry: &ContentId, force: bool) -> ConfirmationPoll {
        if self.pending_confirmation() != Some(entry) {
            return ConfirmationPoll::Settled;
        }
        let required = self.registered_count();
        let confirmed = self
            .content
            .confirmations
            .iter()
            .filter(|c| self.connections.get(*c).is_some_and(Membership::is_registered))
            .count();

        if force || confirmed >= required {
            ConfirmationPoll::Advanced(self.advance())
        } else {
            ConfirmationPoll::Waiting {
                confirmed,
                required,
            }
        }
    }

    /// Privileged forced advance.
    pub fn skip(&mut self, id: &ConnectionId, entry: &EntryRef) -> Result<Outbox, RoomError> {
        if !self.member(id)?.is_privileged {
            return Err(RoomError::Unauthorized("videoSkipped"));
        }
        self.ensure_advance_target(&entry.id)?;
        Ok(self.advance())
    }

    /// Vote on the current entry. Enough downvotes advance the room.
    pub fn vote(&mut self, id: &ConnectionId, entry: &EntryRef, vote: Vote) -> Result<Outbox, RoomError> {
        self.registered_name(id)?;
        let Some(current) = &self.content.current.entry else {
            return Err(RoomError::StaleEntry(entry.id.clone()));
        };
        if current.id != entry.id {
            return Err(RoomError::StaleEntry(entry.id.clone()));
        }
        let submitter = current.submitter.clone();

        let karma = self.content.karma.entry(submitter.clone()).or_insert(0);
        match vote {
            Vote::Up => {
                self.content.votes.up += 1;
                *karma += 1;
            }
            Vote::Down => {
                self.content.votes.down += 1;
                *karma -= 1;
            }
        }
        let karma = *karma;

        let mut outbox = Outbox::new();
        outbox.broadcast(ServerEvent::UpdateVotes(VoteUpdate {
            id: entry.id.clone(),
            up: self.content.votes.up,
            down: self.content.votes.down,
            submitter,
            karma,
        }));

        if vote == Vote::Down && self.content.votes.net() <= self.skip_threshold() {
            outbox.extend(self.advance());
        }
        Ok(outbox)
    }

    /// `-ceil(registered / 2)`: the net score at which the room skips.
    pub fn skip_threshold(&self) -> i64 {
        -(self.registered_count().div_ceil(2) as i64)
    }

    // ── Chat ──

    pub fn send_message(&mut self, id: &ConnectionId, payload: &ChatPayload) -> Result<Outbox, RoomError> {
        let username = self.registered_name(id)?;
        let text = payload.message.trim();
        if text.is_empty() {
            return Err(RoomError::InvalidPayload("message is empty".into()));
        }
        if text.chars().count() > MAX_MESSAGE_LEN {
            return Err(RoomError::InvalidPayload(format!(
                "message exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }

        let message = ChatMessage {
            id: MessageId::new(),
            username,
            message: self.formatter.format(text),
            timestamp: Utc::now(),
        };
        self.content.messages.push_back(message.clone());
        if let Some(limit) = self.config.message_history_limit {
            while self.content.messages.len() > limit {
                self.content.messages.pop_front();
            }
        }

        let mut outbox = Outbox::new();
        outbox.broadcast(ServerEvent::AddMessage(message));
        Ok(outbox)
    }

    // ── Privilege ──

    pub fn request_privilege(&mut self, id: &ConnectionId, secret: &str) -> Result<Outbox, RoomError> {
        self.member(id)?;
        let granted = self
            .config
            .admin_secret
            .as_ref()
            .is_some_and(|expected| secrets_match(expected.expose_secret().as_bytes(), secret.as_bytes()));
        if !granted {
            return Err(RoomError::Unauthorized("adminStatusRequested"));
        }

        if let Some(membership) = self.connections.get_mut(id) {
            membership.is_privileged = true;
        }
        let mut outbox = Outbox::new();
        outbox.to(id, ServerEvent::AdminStatusSuccess);
        Ok(outbox)
    }

    pub fn update_theme(&mut self, id: &ConnectionId, theme: Option<String>) -> Result<Outbox, RoomError> {
        if !self.member(id)?.is_privileged {
            return Err(RoomError::Unauthorized("themeUpdated"));
        }
        let theme = theme
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());
        self.content.theme.clone_from(&theme);

        let mut outbox = Outbox::new();
        outbox.broadcast(ServerEvent::UpdateTheme(theme));
        Ok(outbox)
    }

    // ── Internals ──

    fn member(&self, id: &ConnectionId) -> Result<&Membership, RoomError> {
        self.connections
            .get(id)
            .ok_or_else(|| RoomError::UnknownConnection(id.clone()))
    }

    fn registered_name(&self, id: &ConnectionId) -> Result<String, RoomError> {
        self.member(id)?
            .username
            .clone()
            .ok_or(RoomError::NotRegistered)
    }

    fn position(&self, id: &ContentId) -> Option<usize> {
        self.content.queue.iter().position(|e| &e.id == id)
    }

    /// Advances must name the playing entry, or the queue head when idle.
    /// Anything else is a late report for an entry already advanced past.
    fn ensure_advance_target(&self, id: &ContentId) -> Result<(), RoomError> {
        let target = match &self.content.current.entry {
            Some(current) => Some(&current.id),
            None => self.content.queue.first().map(|e| &e.id),
        };
        if target == Some(id) {
            Ok(())
        } else {
            Err(RoomError::StaleEntry(id.clone()))
        }
    }

    fn select_head(&mut self) {
        if let Some(head) = self.content.queue.first() {
            self.content.current = CurrentPlayback {
                entry: Some(head.clone()),
                elapsed_seconds: 0.0,
            };
            self.content.votes = VoteTally::default();
            self.content.confirmations.clear();
        }
    }

    /// Retire the current entry (or idle head) and promote the next one.
    fn advance(&mut self) -> Outbox {
        let mut outbox = Outbox::new();
        let finished = match self.content.current.entry.take() {
            Some(entry) => {
                if let Some(index) = self.position(&entry.id) {
                    self.content.queue.remove(index);
                }
                Some(entry)
            }
            None if !self.content.queue.is_empty() => Some(self.content.queue.remove(0)),
            None => None,
        };

        self.content.current = CurrentPlayback::default();
        self.content.votes = VoteTally::default();
        self.content.confirmations.clear();

        if let Some(entry) = finished {
            self.content.history.push(entry.clone());
            outbox.broadcast(ServerEvent::PlayNextVideo(entry));
        }
        self.select_head();
        outbox
    }

    fn stale_playback(&self, reported: f64) -> RoomError {
        RoomError::StalePlayback {
            reported,
            stored: self.content.current.elapsed_seconds,
            resync: Box::new(self.current_snapshot()),
        }
    }

    fn reset(&mut self) {
        self.content = RoomContent::default();
        self.resets += 1;
    }
}

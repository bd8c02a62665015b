use crate::events::{CurrentSnapshot, ProtocolRejection, QueueRejection, ServerEvent};
use crate::ids::{ConnectionId, ContentId};

/// Every way the room can turn down an inbound event.
///
/// Rejections never mutate room state and never reach connections other
/// than the originator. Some are answered with a client event
/// (see [`RoomError::reply`]), the rest are silent no-ops.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RoomError {
    // Admission
    #[error("room is full ({capacity} users)")]
    RoomFull { capacity: usize },

    // Validation: surfaced to the originating connection
    #[error("username already taken: {0}")]
    UsernameTaken(String),
    #[error("invalid username")]
    InvalidUsername,
    #[error("connection already registered as {0}")]
    AlreadyRegistered(String),
    #[error("entry already queued: {0}")]
    DuplicateEntry(ContentId),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Authorization: silent
    #[error("connection has no registered username")]
    NotRegistered,
    #[error("unauthorized {0}")]
    Unauthorized(&'static str),

    // Stale or unknown references: silent
    #[error("unknown entry: {0}")]
    UnknownEntry(ContentId),
    #[error("entry {0} is not the current entry")]
    StaleEntry(ContentId),
    #[error("entry {0} is playing and cannot be removed")]
    EntryPlaying(ContentId),
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    // Stale data: corrected by re-pushing authoritative state
    #[error("stale playback report: {reported}s against stored {stored}s")]
    StalePlayback {
        reported: f64,
        stored: f64,
        resync: Box<CurrentSnapshot>,
    },
}

impl RoomError {
    /// The event sent back to the originating connection, if any.
    pub fn reply(&self) -> Option<ServerEvent> {
        match self {
            Self::RoomFull { .. } => Some(ServerEvent::RoomFull),
            Self::UsernameTaken(_) | Self::InvalidUsername | Self::AlreadyRegistered(_) => {
                Some(ServerEvent::UsernameError)
            }
            Self::DuplicateEntry(id) => Some(ServerEvent::QueueError(QueueRejection {
                id: id.clone(),
                reason: "duplicate".into(),
            })),
            Self::InvalidPayload(reason) => Some(ServerEvent::ProtocolError(ProtocolRejection {
                reason: reason.clone(),
            })),
            Self::StalePlayback { resync, .. } => {
                Some(ServerEvent::UpdateCurrentVideo((**resync).clone()))
            }
            Self::NotRegistered
            | Self::Unauthorized(_)
            | Self::UnknownEntry(_)
            | Self::StaleEntry(_)
            | Self::EntryPlaying(_)
            | Self::UnknownConnection(_) => None,
        }
    }

    /// Authorization failures are deliberately invisible to the client.
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::NotRegistered | Self::Unauthorized(_))
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoomFull { .. } => "room_full",
            Self::UsernameTaken(_) => "username_taken",
            Self::InvalidUsername => "invalid_username",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::DuplicateEntry(_) => "duplicate_entry",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::NotRegistered => "not_registered",
            Self::Unauthorized(_) => "unauthorized",
            Self::UnknownEntry(_) => "unknown_entry",
            Self::StaleEntry(_) => "stale_entry",
            Self::EntryPlaying(_) => "entry_playing",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::StalePlayback { .. } => "stale_playback",
        }
    }
}

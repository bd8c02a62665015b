use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{Entry, EntryPayload, EntryRef};
use crate::ids::{ContentId, MessageId};

/// Events sent by clients.
///
/// Wire form is `{"event": "<name>", "data": <payload>}`; payload-less
/// events omit `data`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    UsernameRequested(String),
    GetCurrentVideo,
    VideoAddedToQueue(EntryPayload),
    VideoRemovedFromQueue(EntryRef),
    CurrentVideoUpdated(PlaybackReport),
    MessageSent(ChatPayload),
    Upvote(EntryRef),
    Downvote(EntryRef),
    VideoEnded(EntryRef),
    VideoSkipped(EntryRef),
    AdminStatusRequested(String),
    ThemeUpdated(Option<String>),
    #[serde(alias = "updateStatus")]
    StatusSent(Option<serde_json::Value>),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UsernameRequested(_) => "usernameRequested",
            Self::GetCurrentVideo => "getCurrentVideo",
            Self::VideoAddedToQueue(_) => "videoAddedToQueue",
            Self::VideoRemovedFromQueue(_) => "videoRemovedFromQueue",
            Self::CurrentVideoUpdated(_) => "currentVideoUpdated",
            Self::MessageSent(_) => "messageSent",
            Self::Upvote(_) => "upvote",
            Self::Downvote(_) => "downvote",
            Self::VideoEnded(_) => "videoEnded",
            Self::VideoSkipped(_) => "videoSkipped",
            Self::AdminStatusRequested(_) => "adminStatusRequested",
            Self::ThemeUpdated(_) => "themeUpdated",
            Self::StatusSent(_) => "statusSent",
        }
    }
}

/// Periodic position report from the client acting as playback authority.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackReport {
    pub entry: EntryRef,
    pub elapsed_seconds: f64,
}

/// Chat message as sent by a client. Any `username` in the payload is
/// ignored; the sender is the connection's registered name.
#[derive(Clone, Debug, Deserialize)]
pub struct ChatPayload {
    pub message: String,
}

/// Events sent to clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    RoomFull,
    PopulateInitialData(InitialData),
    UsernameError,
    UsernameSuccess,
    AddUser(String),
    RemoveUser(String),
    UpdateCurrentVideo(CurrentSnapshot),
    AddVideoToQueue(Entry),
    RemoveVideoFromQueue(Entry),
    QueueError(QueueRejection),
    AddMessage(ChatMessage),
    UpdateVotes(VoteUpdate),
    PlayNextVideo(Entry),
    AdminStatusSuccess,
    UpdateTheme(Option<String>),
    GetStatus,
    ProtocolError(ProtocolRejection),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomFull => "roomFull",
            Self::PopulateInitialData(_) => "populateInitialData",
            Self::UsernameError => "usernameError",
            Self::UsernameSuccess => "usernameSuccess",
            Self::AddUser(_) => "addUser",
            Self::RemoveUser(_) => "removeUser",
            Self::UpdateCurrentVideo(_) => "updateCurrentVideo",
            Self::AddVideoToQueue(_) => "addVideoToQueue",
            Self::RemoveVideoFromQueue(_) => "removeVideoFromQueue",
            Self::QueueError(_) => "queueError",
            Self::AddMessage(_) => "addMessage",
            Self::UpdateVotes(_) => "updateVotes",
            Self::PlayNextVideo(_) => "playNextVideo",
            Self::AdminStatusSuccess => "adminStatusSuccess",
            Self::UpdateTheme(_) => "updateTheme",
            Self::GetStatus => "getStatus",
            Self::ProtocolError(_) => "protocolError",
        }
    }
}

/// Snapshot of the playing entry. `start_seconds` already includes the
/// forward lag compensation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSnapshot {
    pub video: Option<Entry>,
    pub start_seconds: f64,
}

/// Everything a freshly admitted connection needs to render the room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialData {
    pub messages: Vec<ChatMessage>,
    pub playlist: Vec<Entry>,
    pub played_videos: Vec<Entry>,
    pub users: Vec<String>,
    pub theme: Option<String>,
    pub current: CurrentSnapshot,
}

/// A chat message after formatting and server-side stamping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteUpdate {
    pub id: ContentId,
    pub up: u32,
    pub down: u32,
    pub submitter: String,
    pub karma: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueRejection {
    pub id: ContentId,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRejection {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_payload_less_event() {
        let evt: ClientEvent = serde_json::from_str(r#"{"event":"getCurrentVideo"}"#).unwrap();
        assert!(matches!(evt, ClientEvent::GetCurrentVideo));
        assert_eq!(evt.name(), "getCurrentVideo");
    }

    #[test]
    fn parse_username_request() {
        let evt: ClientEvent =
            serde_json::from_str(r#"{"event":"usernameRequested","data":"alice"}"#).unwrap();
        match evt {
            ClientEvent::UsernameRequested(name) => assert_eq!(name, "alice"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_playback_report_camel_case() {
        let json = r#"{"event":"currentVideoUpdated","data":{"entry":{"id":"v1"},"elapsedSeconds":42.5}}"#;
        match serde_json::from_str::<ClientEvent>(json).unwrap() {
            ClientEvent::CurrentVideoUpdated(report) => {
                assert_eq!(report.entry.id.as_str(), "v1");
                assert!((report.elapsed_seconds - 42.5).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn update_status_is_an_alias() {
        let evt: ClientEvent = serde_json::from_str(r#"{"event":"updateStatus"}"#).unwrap();
        assert!(matches!(evt, ClientEvent::StatusSent(None)));
        let evt: ClientEvent =
            serde_json::from_str(r#"{"event":"statusSent","data":{"ok":true}}"#).unwrap();
        assert!(matches!(evt, ClientEvent::StatusSent(Some(_))));
    }

    #[test]
    fn theme_can_be_cleared() {
        let evt: ClientEvent =
            serde_json::from_str(r#"{"event":"themeUpdated","data":null}"#).unwrap();
        assert!(matches!(evt, ClientEvent::ThemeUpdated(None)));
    }

    #[test]
    fn chat_payload_ignores_claimed_username() {
        let json = r#"{"event":"messageSent","data":{"username":"mallory","message":"hi"}}"#;
        match serde_json::from_str::<ClientEvent>(json).unwrap() {
            ClientEvent::MessageSent(payload) => assert_eq!(payload.message, "hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"dropTables"}"#).is_err());
    }

    #[test]
    fn missing_required_payload_is_an_error() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"upvote"}"#).is_err());
    }

    #[test]
    fn payload_less_server_event_has_no_data() {
        let json = serde_json::to_value(ServerEvent::RoomFull).unwrap();
        assert_eq!(json, serde_json::json!({"event": "roomFull"}));
    }

    #[test]
    fn server_event_wire_shape() {
        let evt = ServerEvent::UpdateCurrentVideo(CurrentSnapshot {
            video: None,
            start_seconds: 3.0,
        });
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["event"], "updateCurrentVideo");
        assert_eq!(json["data"]["startSeconds"], 3.0);
        assert!(json["data"]["video"].is_null());
        assert_eq!(evt.name(), "updateCurrentVideo");
    }

    #[test]
    fn initial_data_uses_client_field_names() {
        let data = InitialData {
            messages: vec![],
            playlist: vec![],
            played_videos: vec![],
            users: vec!["alice".into()],
            theme: None,
            current: CurrentSnapshot {
                video: None,
                start_seconds: 0.0,
            },
        };
        let json = serde_json::to_value(ServerEvent::PopulateInitialData(data)).unwrap();
        assert!(json["data"]["playedVideos"].is_array());
        assert_eq!(json["data"]["users"][0], "alice");
    }
}

use serde::{Deserialize, Serialize};

use crate::errors::RoomError;
use crate::ids::ContentId;

/// Longest title accepted for a queue entry.
pub const MAX_TITLE_LEN: usize = 300;

/// A validated queue entry.
///
/// `display` carries opaque client metadata (thumbnails, channel name, ...)
/// that the room stores and replays but never inspects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: ContentId,
    pub submitter: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub display: serde_json::Value,
}

/// An entry as submitted by a client, before validation.
///
/// The submitter is not part of the payload: it is stamped from the
/// registered username of the submitting connection.
#[derive(Clone, Debug, Deserialize)]
pub struct EntryPayload {
    pub id: ContentId,
    pub title: String,
    #[serde(default)]
    pub display: serde_json::Value,
}

impl EntryPayload {
    pub fn into_entry(self, submitter: &str) -> Result<Entry, RoomError> {
        if self.id.is_blank() {
            return Err(RoomError::InvalidPayload("entry id is empty".into()));
        }
        let title = self.title.trim();
        if title.is_empty() {
            return Err(RoomError::InvalidPayload("entry title is empty".into()));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(RoomError::InvalidPayload(format!(
                "entry title exceeds {MAX_TITLE_LEN} characters"
            )));
        }
        Ok(Entry {
            id: self.id,
            submitter: submitter.to_owned(),
            title: title.to_owned(),
            display: self.display,
        })
    }
}

/// Reference to an entry by content id. Extra fields are ignored, so
/// clients may send back the full entry they received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryRef {
    pub id: ContentId,
}

impl EntryRef {
    pub fn new(id: impl Into<ContentId>) -> Self {
        Self { id: id.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str, title: &str) -> EntryPayload {
        EntryPayload {
            id: ContentId::new(id),
            title: title.into(),
            display: serde_json::Value::Null,
        }
    }

    #[test]
    fn valid_payload_stamps_submitter() {
        let entry = payload("v1", "  Never Gonna  ").into_entry("alice").unwrap();
        assert_eq!(entry.id.as_str(), "v1");
        assert_eq!(entry.submitter, "alice");
        assert_eq!(entry.title, "Never Gonna");
    }

    #[test]
    fn blank_id_rejected() {
        let err = payload("  ", "title").into_entry("alice").unwrap_err();
        assert!(matches!(err, RoomError::InvalidPayload(_)));
    }

    #[test]
    fn blank_title_rejected() {
        let err = payload("v1", "").into_entry("alice").unwrap_err();
        assert!(matches!(err, RoomError::InvalidPayload(_)));
    }

    #[test]
    fn oversized_title_rejected() {
        let long = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(payload("v1", &long).into_entry("alice").is_err());
    }

    #[test]
    fn payload_requires_id() {
        let res: Result<EntryPayload, _> = serde_json::from_str(r#"{"title":"no id"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn entry_ref_ignores_extra_fields() {
        let json = r#"{"id":"v9","submitter":"bob","title":"t","display":{"thumb":"x"}}"#;
        let r: EntryRef = serde_json::from_str(json).unwrap();
        assert_eq!(r, EntryRef::new("v9"));
    }

    #[test]
    fn null_display_is_omitted() {
        let entry = payload("v1", "t").into_entry("alice").unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("display").is_none());
    }
}

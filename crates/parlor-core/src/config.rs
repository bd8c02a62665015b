use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Maximum concurrent registered users in a room.
pub const DEFAULT_CAPACITY: usize = 20;
/// Accepted drift between consecutive playback reports.
pub const DEFAULT_PLAYBACK_TOLERANCE_SECS: f64 = 15.0;
/// Added to the stored position whenever it is replicated to a client.
pub const DEFAULT_LAG_COMPENSATION_SECS: f64 = 3.0;

/// How a natural end of playback turns into an advance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvancePolicy {
    /// The first valid `videoEnded` report advances the room.
    #[default]
    Immediate,
    /// Every registered user must report the end before the room advances.
    AllConfirm,
}

impl std::fmt::Display for AdvancePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => f.write_str("immediate"),
            Self::AllConfirm => f.write_str("all-confirm"),
        }
    }
}

/// Room behaviour knobs. Transport settings live in the server crate.
#[derive(Clone, Debug)]
pub struct RoomConfig {
    pub capacity: usize,
    /// Shared secret that grants privilege. `None` disables privilege.
    pub admin_secret: Option<SecretString>,
    pub playback_tolerance_secs: f64,
    pub lag_compensation_secs: f64,
    pub advance_policy: AdvancePolicy,
    /// Oldest chat messages are dropped beyond this many. `None` keeps all.
    pub message_history_limit: Option<usize>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            admin_secret: None,
            playback_tolerance_secs: DEFAULT_PLAYBACK_TOLERANCE_SECS,
            lag_compensation_secs: DEFAULT_LAG_COMPENSATION_SECS,
            advance_policy: AdvancePolicy::Immediate,
            message_history_limit: None,
        }
    }
}

impl RoomConfig {
    pub fn with_admin_secret(mut self, secret: impl Into<String>) -> Self {
        self.admin_secret = Some(SecretString::from(secret.into()));
        self
    }
}

pub mod config;
pub mod entry;
pub mod errors;
pub mod events;
pub mod format;
pub mod ids;
pub mod outbox;
pub mod room;

pub use config::{AdvancePolicy, RoomConfig};
pub use entry::{Entry, EntryPayload, EntryRef};
pub use errors::RoomError;
pub use events::{ClientEvent, CurrentSnapshot, InitialData, ServerEvent};
pub use format::{FormatterChain, MessageFormatter};
pub use ids::{ConnectionId, ContentId, MessageId};
pub use outbox::{Delivery, Outbox, Target};
pub use room::{ConfirmationPoll, RoomState, Vote};

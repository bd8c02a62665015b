use crate::events::ServerEvent;
use crate::ids::ConnectionId;

/// Who receives a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Connection(ConnectionId),
    All,
    AllExcept(ConnectionId),
}

impl Target {
    pub fn includes(&self, id: &ConnectionId) -> bool {
        match self {
            Self::Connection(target) => target == id,
            Self::All => true,
            Self::AllExcept(excluded) => excluded != id,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub target: Target,
    pub event: ServerEvent,
}

/// Deliveries produced by one state transition, in emission order.
///
/// Built while the room lock is held and handed to the transport after
/// it is released.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outbox {
    deliveries: Vec<Delivery>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to(&mut self, id: &ConnectionId, event: ServerEvent) {
        self.push(Target::Connection(id.clone()), event);
    }

    pub fn broadcast(&mut self, event: ServerEvent) {
        self.push(Target::All, event);
    }

    pub fn broadcast_except(&mut self, id: &ConnectionId, event: ServerEvent) {
        self.push(Target::AllExcept(id.clone()), event);
    }

    pub fn push(&mut self, target: Target, event: ServerEvent) {
        self.deliveries.push(Delivery { target, event });
    }

    pub fn extend(&mut self, other: Outbox) {
        self.deliveries.extend(other.deliveries);
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Delivery> {
        self.deliveries.iter()
    }

    /// Events a given connection would receive, in order.
    pub fn events_for(&self, id: &ConnectionId) -> Vec<&ServerEvent> {
        self.deliveries
            .iter()
            .filter(|d| d.target.includes(id))
            .map(|d| &d.event)
            .collect()
    }
}

impl IntoIterator for Outbox {
    type Item = Delivery;
    type IntoIter = std::vec::IntoIter<Delivery>;

    fn into_iter(self) -> Self::IntoIter {
        self.deliveries.into_iter()
    }
}

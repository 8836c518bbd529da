//! Application events fanned out to live clients.
//!
//! A `DomainEvent` is transient: produced by the change router, consumed by
//! the websocket hub, delivered at-most-once per connected client, never
//! stored or replayed.

use crate::User;
use serde_json::json;

/// The closed set of events pushed over the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// A user row appeared; carries the full current row.
    UserCreated { user: User },
    /// A user row changed; carries the full current row.
    UserUpdated { user: User },
    /// A user row disappeared; only the identifier survives.
    UserDeleted { user_id: i64 },
}

impl DomainEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::UserCreated { .. } => "user-created",
            DomainEvent::UserUpdated { .. } => "user-updated",
            DomainEvent::UserDeleted { .. } => "user-deleted",
        }
    }

    /// Serialized JSON payload for transport.
    pub fn payload(&self) -> serde_json::Result<String> {
        let value = match self {
            DomainEvent::UserCreated { user } | DomainEvent::UserUpdated { user } => {
                json!({ "user": user })
            }
            DomainEvent::UserDeleted { user_id } => json!({ "userId": user_id }),
        };
        serde_json::to_string(&value)
    }

    /// The user this event is about, for per-user room targeting.
    pub fn user_id(&self) -> i64 {
        match self {
            DomainEvent::UserCreated { user } | DomainEvent::UserUpdated { user } => user.id,
            DomainEvent::UserDeleted { user_id } => *user_id,
        }
    }
}

impl std::fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Room name for events targeted at a single user.
pub fn user_room(user_id: i64) -> String {
    format!("user-{user_id}")
}

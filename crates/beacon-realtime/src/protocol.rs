//! Wire types for the realtime channel.

use beacon_core::DomainEvent;
use serde::{Deserialize, Serialize};

/// Command sent by a client over its websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Join a named room.
    Join { room: String },
    /// Leave a named room.
    Leave { room: String },
}

/// Frame pushed to clients. The payload is string-encoded JSON, matching
/// the frontend contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    pub payload: String,
}

impl EventFrame {
    /// Serialize a domain event into its transport frame.
    pub fn from_event(event: &DomainEvent) -> serde_json::Result<Self> {
        Ok(Self {
            event: event.name().to_owned(),
            payload: event.payload()?,
        })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_command_decoding() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"action":"join","room":"user-42"}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Join {
                room: "user-42".into()
            }
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        let result = serde_json::from_str::<ClientCommand>(r#"{"action":"shout","room":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_event_frame_shape() {
        let event = DomainEvent::UserDeleted { user_id: 9 };
        let frame = EventFrame::from_event(&event).unwrap();
        assert_eq!(frame.event, "user-deleted");

        let encoded = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        // Payload is a string, not an inline object.
        assert!(value["payload"].is_string());
        let inner: serde_json::Value =
            serde_json::from_str(value["payload"].as_str().unwrap()).unwrap();
        assert_eq!(inner["userId"], 9);
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Message, MessageType, Participant};

/// Events pushed from the server over the hub connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// A new message was posted to a conversation
    ReceiveMessage { message: Message },

    /// An existing message was edited
    MessageEdited {
        message_id: Uuid,
        conversation_id: Uuid,
        content: String,
        edited_at: chrono::DateTime<chrono::Utc>,
    },

    /// A message was deleted
    MessageDeleted {
        message_id: Uuid,
        conversation_id: Uuid,
    },

    /// A user started or stopped typing
    UserTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        user_name: String,
        is_typing: bool,
    },

    /// Another participant read messages up to the given watermark
    MessagesRead {
        conversation_id: Uuid,
        reader_id: Uuid,
        read_up_to: chrono::DateTime<chrono::Utc>,
    },

    /// Server confirms a previously sent message reached its recipient
    MessageDelivered {
        message_id: Uuid,
        conversation_id: Uuid,
    },

    /// A send or edit failed server-side
    MessageError {
        message_id: Option<Uuid>,
        reason: String,
    },

    /// A user came online or went offline
    UserStatusChanged { user_id: Uuid, online: bool },

    /// A user joined a conversation
    UserJoinedConversation {
        conversation_id: Uuid,
        participant: Participant,
    },

    /// A user left a conversation
    UserLeftConversation {
        conversation_id: Uuid,
        user_id: Uuid,
    },
}

impl ServerEvent {
    /// Returns the conversation_id if this event is scoped to a specific
    /// conversation. Events that return `None` are session-global.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::ReceiveMessage { message } => Some(message.conversation_id),
            Self::MessageEdited { conversation_id, .. } => Some(*conversation_id),
            Self::MessageDeleted { conversation_id, .. } => Some(*conversation_id),
            Self::UserTyping { conversation_id, .. } => Some(*conversation_id),
            Self::MessagesRead { conversation_id, .. } => Some(*conversation_id),
            Self::MessageDelivered { conversation_id, .. } => Some(*conversation_id),
            Self::UserJoinedConversation { conversation_id, .. } => Some(*conversation_id),
            Self::UserLeftConversation { conversation_id, .. } => Some(*conversation_id),
            // MessageError and UserStatusChanged are global
            _ => None,
        }
    }
}

/// Operations invoked FROM client TO server over the hub connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Join a conversation room to receive its scoped events
    JoinConversation { conversation_id: Uuid },

    /// Leave a conversation room
    LeaveConversation { conversation_id: Uuid },

    /// Post a message; the ack carries the server-confirmed message
    SendMessage {
        conversation_id: Uuid,
        content: String,
        message_type: MessageType,
        reply_to: Option<Uuid>,
    },

    /// Edit a message in place
    EditMessage { message_id: Uuid, content: String },

    /// Delete a message
    DeleteMessage { message_id: Uuid },

    /// Mark a batch of messages as read
    MarkAsRead {
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    },

    /// Signal typing start/stop in a conversation
    SetTyping {
        conversation_id: Uuid,
        is_typing: bool,
    },
}

/// Server acknowledgement of an invoked command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Ack {
    /// Command applied, nothing to return
    Ok,
    /// SendMessage ack: the confirmed message with its server-assigned id
    Message(Box<Message>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The single decode point for inbound frames. Malformed payloads fail
/// loudly here instead of defaulting fields downstream.
pub fn decode_event(raw: &str) -> Result<ServerEvent, DecodeError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_unknown_event() {
        let raw = r#"{"type":"SomethingElse","data":{}}"#;
        assert!(decode_event(raw).is_err());
    }

    #[test]
    fn decode_rejects_missing_fields() {
        let raw = r#"{"type":"UserTyping","data":{"conversation_id":"not-a-uuid"}}"#;
        assert!(decode_event(raw).is_err());
    }

    #[test]
    fn typing_event_round_trips() {
        let event = ServerEvent::UserTyping {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            user_name: "ana".into(),
            is_typing: true,
        };
        let raw = serde_json::to_string(&event).unwrap();
        let decoded = decode_event(&raw).unwrap();
        assert_eq!(decoded.conversation_id(), event.conversation_id());
    }
}

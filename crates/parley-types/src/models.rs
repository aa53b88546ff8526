use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    File,
}

/// Client-side delivery status of a message.
///
/// `Pending` and `Failed` only ever exist locally: a pending entry carries a
/// client-generated temp id until the server ack swaps in the confirmed
/// message. Everything received off the wire is `Sent` or `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    #[default]
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub delivery: DeliveryState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    BuyerSeller,
    Support,
}

/// Product the conversation was opened about, if any (buyer/seller chats).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductContext {
    pub product_id: Uuid,
    pub title: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Participant>,
    pub last_message: Option<Message>,
    pub last_message_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_active: bool,
    pub conversation_type: ConversationType,
    pub product_context: Option<ProductContext>,
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

// -- Conversations --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub user_ids: Vec<Uuid>,
    pub product_id: Option<Uuid>,
}

// -- Messages --

/// One page of conversation history, newest-last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{ConversationId, MessageId, UserId};

/// A direct message between two marketplace users.
///
/// Persisted through the external message store; this subsystem only
/// creates it, stamps delivery/read times, and relays it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        sender_id: UserId,
        recipient_id: UserId,
        content: String,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id,
            recipient_id,
            content,
            created_at: Utc::now(),
            delivered_at: None,
            read_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Request to send a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub recipient_id: UserId,
    pub content: String,
}

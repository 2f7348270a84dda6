//! Notification models
//!
//! Records created when a recipient is offline at delivery time, plus
//! system announcements from the surrounding marketplace. Persisted
//! through the external notification store until read.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id::{MessageId, UserId};

/// Notification kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A direct message arrived while the recipient was offline
    Message,
    /// System announcement from administrators
    System,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "system" => Ok(Self::System),
            _ => Err(anyhow::anyhow!("Invalid notification kind: {s}")),
        }
    }
}

/// Notification record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub source_message_id: Option<MessageId>,
    pub title: String,
    pub body: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub read_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl NotificationRecord {
    /// Record for a message that could not be pushed (recipient offline).
    ///
    /// The id is derived from the message id, so a retried delivery job
    /// converges on the same record instead of inserting a second one.
    pub fn for_message(user_id: UserId, message_id: MessageId, sender_id: &UserId) -> Self {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, message_id.as_str().as_bytes());
        Self {
            id,
            user_id,
            kind: NotificationKind::Message,
            source_message_id: Some(message_id),
            title: "New message".to_string(),
            body: format!("You have a new message from {sender_id}"),
            created_at: chrono::Utc::now(),
            read_at: None,
        }
    }

    /// System announcement record
    pub fn system(user_id: UserId, title: String, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind: NotificationKind::System,
            source_message_id: None,
            title,
            body,
            created_at: chrono::Utc::now(),
            read_at: None,
        }
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_kind_roundtrip() {
        assert_eq!("message".parse::<NotificationKind>().unwrap(), NotificationKind::Message);
        assert_eq!("system".parse::<NotificationKind>().unwrap(), NotificationKind::System);
        assert!("bogus".parse::<NotificationKind>().is_err());
        assert_eq!(NotificationKind::Message.to_string(), "message");
    }

    #[test]
    fn test_for_message_links_source() {
        let n = NotificationRecord::for_message(
            UserId::from_string("bob".to_string()),
            MessageId::from_string("msg1".to_string()),
            &UserId::from_string("alice".to_string()),
        );
        assert_eq!(n.kind, NotificationKind::Message);
        assert_eq!(n.source_message_id.as_ref().unwrap().as_str(), "msg1");
        assert!(!n.is_read());
    }

    #[test]
    fn test_for_message_id_is_deterministic_per_message() {
        let bob = UserId::from_string("bob".to_string());
        let alice = UserId::from_string("alice".to_string());
        let msg = MessageId::from_string("msg1".to_string());

        let first = NotificationRecord::for_message(bob.clone(), msg.clone(), &alice);
        let again = NotificationRecord::for_message(bob.clone(), msg, &alice);
        assert_eq!(first.id, again.id);

        let other = NotificationRecord::for_message(
            bob,
            MessageId::from_string("msg2".to_string()),
            &alice,
        );
        assert_ne!(first.id, other.id);
    }
}

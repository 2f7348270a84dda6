use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cardhub_core::models::{
    CallSignal, ConversationId, Message, MessageId, NotificationRecord, UserId,
};

/// Events synchronized across server instances via the fanout bus
///
/// Every instance publishes its local events; instances reach users
/// connected elsewhere by routing on `recipient_id`. Presence events are
/// not user-routed; they feed each instance's merged presence view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutEvent {
    /// A user's presence on one instance flipped (0->1 or 1->0)
    PresenceChanged {
        user_id: UserId,
        instance_id: String,
        online: bool,
        timestamp: DateTime<Utc>,
    },

    /// A direct message pushed to an online recipient
    DirectMessage {
        recipient_id: UserId,
        message: Message,
        timestamp: DateTime<Utc>,
    },

    /// Read receipt relayed to a participant's connections
    MessageRead {
        recipient_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
        reader_id: UserId,
        timestamp: DateTime<Utc>,
    },

    /// Message deletion relayed to a participant's connections
    MessageDeleted {
        recipient_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },

    /// Ephemeral typing indicator; no persistence, no retry
    Typing {
        recipient_id: UserId,
        conversation_id: ConversationId,
        sender_id: UserId,
        active: bool,
        timestamp: DateTime<Utc>,
    },

    /// A freshly persisted notification pushed to live connections
    NotificationNew {
        recipient_id: UserId,
        notification: NotificationRecord,
        timestamp: DateTime<Utc>,
    },

    /// Call signaling frame (offer/answer/ICE/termination), payload opaque
    CallSignal {
        recipient_id: UserId,
        signal: CallSignal,
        timestamp: DateTime<Utc>,
    },
}

impl FanoutEvent {
    /// The user this event is routed to, if it is user-routed
    #[must_use]
    pub const fn recipient_id(&self) -> Option<&UserId> {
        match self {
            Self::DirectMessage { recipient_id, .. }
            | Self::MessageRead { recipient_id, .. }
            | Self::MessageDeleted { recipient_id, .. }
            | Self::Typing { recipient_id, .. }
            | Self::NotificationNew { recipient_id, .. }
            | Self::CallSignal { recipient_id, .. } => Some(recipient_id),
            Self::PresenceChanged { .. } => None,
        }
    }

    /// Get the timestamp of this event
    #[must_use]
    pub const fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::PresenceChanged { timestamp, .. }
            | Self::DirectMessage { timestamp, .. }
            | Self::MessageRead { timestamp, .. }
            | Self::MessageDeleted { timestamp, .. }
            | Self::Typing { timestamp, .. }
            | Self::NotificationNew { timestamp, .. }
            | Self::CallSignal { timestamp, .. } => timestamp,
        }
    }

    /// Get a short description of the event type
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::PresenceChanged { .. } => "presence_changed",
            Self::DirectMessage { .. } => "direct_message",
            Self::MessageRead { .. } => "message_read",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::Typing { .. } => "typing",
            Self::NotificationNew { .. } => "notification_new",
            Self::CallSignal { .. } => "call_signal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardhub_core::models::ConversationId;

    #[test]
    fn test_fanout_event_serialization() {
        let event = FanoutEvent::DirectMessage {
            recipient_id: UserId::from_string("bob".to_string()),
            message: Message::new(
                ConversationId::from_string("conv1".to_string()),
                UserId::from_string("alice".to_string()),
                UserId::from_string("bob".to_string()),
                "Hello!".to_string(),
            ),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("direct_message"));
        assert!(json.contains("Hello!"));

        let deserialized: FanoutEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "direct_message");
        assert_eq!(deserialized.recipient_id().unwrap().as_str(), "bob");
    }

    #[test]
    fn test_presence_event_is_not_user_routed() {
        let event = FanoutEvent::PresenceChanged {
            user_id: UserId::from_string("alice".to_string()),
            instance_id: "node1".to_string(),
            online: true,
            timestamp: Utc::now(),
        };

        assert!(event.recipient_id().is_none());
        assert_eq!(event.event_type(), "presence_changed");
    }
}

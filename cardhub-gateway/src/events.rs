//! Typed channel event taxonomy
//!
//! JSON frames exchanged over the per-client channel: `ClientEvent` for
//! inbound requests, `ServerEvent` for pushes and acknowledgments.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cardhub_core::models::{
    CallId, CallSession, CallSignal, CallType, ConversationId, EndReason, Message, MessageId,
    NotificationRecord, UserId,
};
use cardhub_cluster::FanoutEvent;

/// Inbound events from an authenticated client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Heartbeat; any frame refreshes liveness, this one exists for idle clients
    Ping,

    MessageNew {
        conversation_id: ConversationId,
        recipient_id: UserId,
        content: String,
    },
    MessageRead {
        message_id: MessageId,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    TypingStart {
        conversation_id: ConversationId,
        recipient_id: UserId,
    },
    TypingStop {
        conversation_id: ConversationId,
        recipient_id: UserId,
    },

    NotificationRead {
        notification_id: Uuid,
    },
    NotificationsReadAll,

    CallInitiate {
        callee_id: UserId,
        call_type: CallType,
        offer: String,
    },
    CallAnswer {
        call_id: CallId,
        answer: String,
    },
    CallReject {
        call_id: CallId,
    },
    CallEnd {
        call_id: CallId,
    },
    CallIceCandidate {
        call_id: CallId,
        candidate: String,
    },
    CallGetActive,

    PresenceSubscribe {
        user_ids: Vec<UserId>,
    },
    PresenceQuery {
        user_ids: Vec<UserId>,
    },
}

/// Outbound events pushed to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Pong,

    /// Synchronous acknowledgment of a send; the sender never waits on
    /// recipient delivery
    MessageAck {
        message_id: MessageId,
        conversation_id: ConversationId,
        created_at: chrono::DateTime<chrono::Utc>,
    },
    MessageNew {
        message: Message,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_id: MessageId,
        reader_id: UserId,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Typing {
        conversation_id: ConversationId,
        sender_id: UserId,
        active: bool,
    },

    NotificationNew {
        notification: NotificationRecord,
    },
    NotificationRead {
        notification_id: Uuid,
    },
    NotificationsReadAll {
        affected: usize,
    },

    /// Synchronous acknowledgment that the call is ringing
    CallRinging {
        call_id: CallId,
    },
    CallIncoming {
        call_id: CallId,
        caller_id: UserId,
        call_type: CallType,
        offer: String,
    },
    CallAnswered {
        call_id: CallId,
        answer: String,
    },
    CallIceCandidate {
        call_id: CallId,
        candidate: String,
    },
    CallEnded {
        call_id: CallId,
        reason: EndReason,
    },
    CallActive {
        session: Option<CallSession>,
    },

    Presence {
        user_id: UserId,
        online: bool,
    },

    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Map a core error onto a wire error frame
    pub fn from_error(err: &cardhub_core::Error) -> Self {
        use cardhub_core::Error;
        let code = match err {
            Error::Busy(_) => "busy",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::Authentication(_) => "unauthenticated",
            _ => "internal",
        };
        Self::error(code, err.to_string())
    }
}

/// Convert a fanout event into the client-facing frame.
///
/// Presence events return `None`: they feed the registry's merged view
/// and reach clients through their presence subscriptions instead.
pub fn server_event_from_fanout(event: FanoutEvent) -> Option<ServerEvent> {
    match event {
        FanoutEvent::PresenceChanged { .. } => None,
        FanoutEvent::DirectMessage { message, .. } => Some(ServerEvent::MessageNew { message }),
        FanoutEvent::MessageRead {
            conversation_id,
            message_id,
            reader_id,
            ..
        } => Some(ServerEvent::MessageRead {
            conversation_id,
            message_id,
            reader_id,
        }),
        FanoutEvent::MessageDeleted {
            conversation_id,
            message_id,
            ..
        } => Some(ServerEvent::MessageDeleted {
            conversation_id,
            message_id,
        }),
        FanoutEvent::Typing {
            conversation_id,
            sender_id,
            active,
            ..
        } => Some(ServerEvent::Typing {
            conversation_id,
            sender_id,
            active,
        }),
        FanoutEvent::NotificationNew { notification, .. } => {
            Some(ServerEvent::NotificationNew { notification })
        }
        FanoutEvent::CallSignal { signal, .. } => Some(match signal {
            CallSignal::Incoming {
                call_id,
                caller_id,
                call_type,
                offer,
            } => ServerEvent::CallIncoming {
                call_id,
                caller_id,
                call_type,
                offer,
            },
            CallSignal::Answered { call_id, answer } => {
                ServerEvent::CallAnswered { call_id, answer }
            }
            CallSignal::IceCandidate { call_id, candidate } => {
                ServerEvent::CallIceCandidate { call_id, candidate }
            }
            CallSignal::Ended { call_id, reason } => ServerEvent::CallEnded { call_id, reason },
        }),
    }
}

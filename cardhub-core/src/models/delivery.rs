//! Delivery job models
//!
//! Jobs move through `queued -> processing -> completed`, or on failure
//! `processing -> retrying -> queued` until the attempt cap, after which
//! they become `dead` and are retained for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{generate_id, MessageId, UserId};

/// Job kind, one worker pool per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Message,
    Notification,
    Email,
}

impl JobKind {
    pub const ALL: [Self; 3] = [Self::Message, Self::Notification, Self::Email];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Notification => "notification",
            Self::Email => "email",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Retrying,
    Completed,
    Dead,
}

/// A unit of deliverable work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DeliveryJob {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            id: generate_id(),
            kind,
            payload,
            attempt: 0,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            next_run_at: None,
            last_error: None,
        }
    }
}

/// Payload of a `message` job: deliver the referenced message to its
/// recipient. The online/offline path is decided at processing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageJobPayload {
    pub message_id: MessageId,
    pub recipient_id: UserId,
}

/// Payload of a `notification` job: push an already-persisted system
/// notification to the recipient's live connections, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJobPayload {
    pub notification_id: uuid::Uuid,
    pub recipient_id: UserId,
}

/// Payload of an `email` job: one transactional send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailJobPayload {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_starts_queued() {
        let job = DeliveryJob::new(JobKind::Email, serde_json::json!({"to": "x@example.com"}));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);
        assert!(job.next_run_at.is_none());
        assert_eq!(job.id.len(), 12);
    }

    #[test]
    fn test_job_kind_as_str() {
        assert_eq!(JobKind::Message.as_str(), "message");
        assert_eq!(JobKind::Notification.as_str(), "notification");
        assert_eq!(JobKind::Email.as_str(), "email");
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = MessageJobPayload {
            message_id: MessageId::from_string("msg1".to_string()),
            recipient_id: UserId::from_string("bob".to_string()),
        };
        let value = serde_json::to_value(&payload).unwrap();
        let back: MessageJobPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.message_id.as_str(), "msg1");
    }
}

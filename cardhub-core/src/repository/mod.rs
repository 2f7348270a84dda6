//! Collaborator interfaces for external persistence
//!
//! The surrounding marketplace owns the relational store; this subsystem
//! only consumes narrow create/read/update surfaces. Each trait has an
//! in-memory implementation (`memory`) used in tests and single-process
//! deployments; production deployments inject store-backed ones.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    Message, MessageId, NotificationKind, NotificationRecord, UserId,
};
use crate::Result;

pub use memory::{
    InMemoryMessageStore, InMemoryNotificationStore, InMemoryPreferenceStore,
    InMemoryUserDirectory,
};

/// Create/read/update surface for messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: &Message) -> Result<()>;

    async fn get(&self, id: &MessageId) -> Result<Message>;

    async fn mark_delivered(&self, id: &MessageId) -> Result<()>;

    /// Returns the updated message so read receipts can be relayed
    async fn mark_read(&self, id: &MessageId, reader: &UserId) -> Result<Message>;

    /// Soft delete; only the sender may delete
    async fn mark_deleted(&self, id: &MessageId, requester: &UserId) -> Result<Message>;
}

/// Create/read surface for notification records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Create-if-absent: inserting an id that already exists leaves the
    /// stored record untouched, so a retried delivery job cannot write
    /// a duplicate.
    async fn insert(&self, record: &NotificationRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<NotificationRecord>;

    async fn mark_read(&self, user_id: &UserId, id: Uuid) -> Result<()>;

    /// Returns how many records were affected
    async fn mark_all_read(&self, user_id: &UserId) -> Result<usize>;

    async fn unread_count(&self, user_id: &UserId) -> Result<usize>;
}

/// Per-notification-kind email opt-in lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn email_enabled(&self, user_id: &UserId, kind: NotificationKind) -> Result<bool>;

    /// Email address on file, if any
    async fn email_address(&self, user_id: &UserId) -> Result<Option<String>>;
}

/// Minimal user lookup for send-time validation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn exists(&self, user_id: &UserId) -> Result<bool>;
}

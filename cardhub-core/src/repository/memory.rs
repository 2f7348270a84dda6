//! In-memory reference implementations of the collaborator interfaces
//!
//! Backed by `parking_lot` maps. Used by tests and single-process
//! deployments; the traits are the seam for store-backed implementations.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{MessageStore, NotificationStore, PreferenceStore, UserDirectory};
use crate::models::{Message, MessageId, NotificationKind, NotificationRecord, UserId};
use crate::{Error, Result};

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<MessageId, Message>>,
}

impl InMemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, message: &Message) -> Result<()> {
        self.messages
            .write()
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Message> {
        self.messages
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Message {id} not found")))
    }

    async fn mark_delivered(&self, id: &MessageId) -> Result<()> {
        let mut messages = self.messages.write();
        let message = messages
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Message {id} not found")))?;
        if message.delivered_at.is_none() {
            message.delivered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_read(&self, id: &MessageId, reader: &UserId) -> Result<Message> {
        let mut messages = self.messages.write();
        let message = messages
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Message {id} not found")))?;
        if &message.recipient_id != reader {
            return Err(Error::InvalidInput(
                "Only the recipient can mark a message read".to_string(),
            ));
        }
        if message.read_at.is_none() {
            message.read_at = Some(Utc::now());
        }
        Ok(message.clone())
    }

    async fn mark_deleted(&self, id: &MessageId, requester: &UserId) -> Result<Message> {
        let mut messages = self.messages.write();
        let message = messages
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Message {id} not found")))?;
        if &message.sender_id != requester {
            return Err(Error::InvalidInput(
                "Only the sender can delete a message".to_string(),
            ));
        }
        if message.deleted_at.is_none() {
            message.deleted_at = Some(Utc::now());
        }
        Ok(message.clone())
    }
}

#[derive(Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<HashMap<Uuid, NotificationRecord>>,
}

impl InMemoryNotificationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records for a user, used by tests
    pub fn records_for(&self, user_id: &UserId) -> Vec<NotificationRecord> {
        self.records
            .read()
            .values()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, record: &NotificationRecord) -> Result<()> {
        self.records
            .write()
            .entry(record.id)
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<NotificationRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Notification {id} not found")))
    }

    async fn mark_read(&self, user_id: &UserId, id: Uuid) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&id)
            .filter(|r| &r.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("Notification {id} not found")))?;
        if record.read_at.is_none() {
            record.read_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &UserId) -> Result<usize> {
        let mut affected = 0;
        let mut records = self.records.write();
        for record in records.values_mut() {
            if &record.user_id == user_id && record.read_at.is_none() {
                record.read_at = Some(Utc::now());
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn unread_count(&self, user_id: &UserId) -> Result<usize> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| &r.user_id == user_id && r.read_at.is_none())
            .count())
    }
}

pub struct InMemoryPreferenceStore {
    /// (user, kind) pairs with email opt-in enabled
    email_opt_ins: RwLock<HashSet<(UserId, NotificationKind)>>,
    addresses: RwLock<HashMap<UserId, String>>,
}

impl InMemoryPreferenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            email_opt_ins: RwLock::new(HashSet::new()),
            addresses: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_email_enabled(&self, user_id: UserId, kind: NotificationKind, enabled: bool) {
        let mut opt_ins = self.email_opt_ins.write();
        if enabled {
            opt_ins.insert((user_id, kind));
        } else {
            opt_ins.remove(&(user_id, kind));
        }
    }

    pub fn set_email_address(&self, user_id: UserId, address: String) {
        self.addresses.write().insert(user_id, address);
    }
}

impl Default for InMemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn email_enabled(&self, user_id: &UserId, kind: NotificationKind) -> Result<bool> {
        Ok(self
            .email_opt_ins
            .read()
            .contains(&(user_id.clone(), kind)))
    }

    async fn email_address(&self, user_id: &UserId) -> Result<Option<String>> {
        Ok(self.addresses.read().get(user_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashSet<UserId>>,
}

impl InMemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, user_id: UserId) {
        self.users.write().insert(user_id);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn exists(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.users.read().contains(user_id))
    }
}

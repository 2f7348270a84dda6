//! Local per-user message hub
//!
//! Routes fanout events to this instance's live client connections. Each
//! connection gets its own unbounded channel, so delivery to a single
//! connection is FIFO; nothing is ordered across connections. Senders
//! whose receiver is gone are pruned on the next delivery.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cardhub_core::models::UserId;

use super::events::FanoutEvent;

pub type ConnectionId = String;

pub type MessageSender = mpsc::UnboundedSender<FanoutEvent>;

/// One subscribed client connection
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub sender: MessageSender,
}

#[derive(Clone)]
pub struct UserMessageHub {
    /// Subscribers per user
    users: Arc<DashMap<UserId, Vec<Subscriber>>>,
    /// Reverse index for cleanup by connection id
    connections: Arc<DashMap<ConnectionId, UserId>>,
}

impl UserMessageHub {
    pub fn new() -> Self {
        Self {
            users: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Attach a connection to its user's event feed; the returned
    /// receiver yields every event routed to that user.
    pub fn subscribe(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> mpsc::UnboundedReceiver<FanoutEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.users.entry(user_id.clone()).or_default().push(Subscriber {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
            sender: tx,
        });
        self.connections.insert(connection_id.clone(), user_id.clone());

        info!(user_id = %user_id, connection_id = %connection_id, "Client subscribed");
        rx
    }

    /// Detach a connection; the user entry disappears with its last one.
    pub fn unsubscribe(&self, connection_id: &str) {
        let Some((_, user_id)) = self.connections.remove(connection_id) else {
            warn!(connection_id = %connection_id, "Unsubscribe for unknown connection");
            return;
        };

        if let Some(mut subscribers) = self.users.get_mut(&user_id) {
            subscribers.retain(|sub| sub.connection_id != connection_id);
        }
        self.users.remove_if(&user_id, |_, subs| subs.is_empty());

        info!(user_id = %user_id, connection_id = %connection_id, "Client unsubscribed");
    }

    /// Deliver an event to every one of the user's local connections.
    /// Returns how many received it; connections whose receiver was
    /// dropped are removed along the way.
    pub fn send_to_user(&self, user_id: &UserId, event: FanoutEvent) -> usize {
        let mut dead: Vec<ConnectionId> = Vec::new();
        let mut delivered = 0;

        if let Some(mut subscribers) = self.users.get_mut(user_id) {
            subscribers.retain(|sub| match sub.sender.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    dead.push(sub.connection_id.clone());
                    false
                }
            });
        }

        if !dead.is_empty() {
            debug!(
                user_id = %user_id,
                pruned = dead.len(),
                "Pruned connections with dropped receivers"
            );
            for connection_id in dead {
                self.connections.remove(&connection_id);
            }
            self.users.remove_if(user_id, |_, subs| subs.is_empty());
        }

        delivered
    }

    pub fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.users.get(user_id).map_or(0, |subs| subs.len())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for UserMessageHub {
    fn default() -> Self {
        Self::new()
    }
}

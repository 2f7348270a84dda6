use dashmap::DashMap;
use std::sync::Arc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use cardhub_core::models::UserId;

use crate::error::{Error, Result};

/// Connection information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub user_id: UserId,
    pub instance_id: String,
    pub connected_at: Instant,
    pub last_seen: Instant,
}

impl ConnectionInfo {
    #[must_use]
    pub fn new(connection_id: String, user_id: UserId, instance_id: String) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            user_id,
            instance_id,
            connected_at: now,
            last_seen: now,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    #[must_use]
    pub fn idle_duration(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Connection limits configuration
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    /// Maximum connections per user
    pub max_per_user: usize,

    /// Maximum total connections
    pub max_total: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_per_user: 8,
            max_total: 10_000,
        }
    }
}

/// Presence transition produced by register/deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTransition {
    /// True when the user's open-connection count crossed 0 -> 1
    pub came_online: bool,
}

/// Result of removing a connection
#[derive(Debug, Clone)]
pub struct Departure {
    pub user_id: UserId,
    /// True when the user's open-connection count crossed 1 -> 0
    pub went_offline: bool,
}

/// Online/offline transition broadcast to interested parties
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
}

/// Connection registry with reference-counted presence
///
/// Presence is a counter, not a flag: each `register` increments the
/// user's open-connection count and each `deregister` decrements it; the
/// user goes offline only when the count reaches zero, so a second device
/// staying open never marks the user offline.
///
/// Each instance holds its own connections plus a merged view of remote
/// instances' presence, fed by `presence_changed` bus events. The merged
/// view is eventually consistent with bounded propagation delay; remote
/// claims go stale-pruned by the sweep.
#[derive(Clone)]
pub struct ConnectionRegistry {
    /// This instance's identifier, stamped into published presence events
    instance_id: String,

    /// All local connections by `connection_id`
    connections: Arc<DashMap<String, ConnectionInfo>>,

    /// Local connections by `user_id`
    user_connections: Arc<DashMap<UserId, Vec<String>>>,

    /// Remote presence claims: user -> (instance -> last update)
    remote_presence: Arc<DashMap<UserId, HashMap<String, Instant>>>,

    /// Connection limits
    limits: Arc<ConnectionLimits>,

    /// Status change broadcast (local and remote transitions merged)
    status_tx: broadcast::Sender<PresenceUpdate>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(instance_id: String, limits: ConnectionLimits) -> Self {
        let (status_tx, _) = broadcast::channel(1024);
        Self {
            instance_id,
            connections: Arc::new(DashMap::new()),
            user_connections: Arc::new(DashMap::new()),
            remote_presence: Arc::new(DashMap::new()),
            limits: Arc::new(limits),
            status_tx,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a new connection
    ///
    /// Returns whether this register brought the user online.
    pub fn register(&self, connection_id: String, user_id: UserId) -> Result<PresenceTransition> {
        if self.connections.len() >= self.limits.max_total {
            return Err(Error::AtCapacity(format!(
                "{} connections",
                self.limits.max_total
            )));
        }

        let came_online = {
            let mut user_conns = self.user_connections.entry(user_id.clone()).or_default();
            if user_conns.len() >= self.limits.max_per_user {
                return Err(Error::TooManyConnections(format!(
                    "max {} per user",
                    self.limits.max_per_user
                )));
            }
            let was_empty = user_conns.is_empty();
            user_conns.push(connection_id.clone());
            was_empty
        };

        self.connections.insert(
            connection_id.clone(),
            ConnectionInfo::new(
                connection_id.clone(),
                user_id.clone(),
                self.instance_id.clone(),
            ),
        );

        cardhub_core::metrics::record_connect(self.online_user_count() as i64);

        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            total_connections = self.connections.len(),
            came_online = came_online,
            "Connection registered"
        );

        // Only an overall offline->online transition is worth announcing
        if came_online && !self.has_remote_presence(&user_id) {
            let _ = self.status_tx.send(PresenceUpdate {
                user_id,
                online: true,
            });
        }

        Ok(PresenceTransition { came_online })
    }

    /// Deregister a connection
    ///
    /// Returns the departure, with `went_offline` set when this was the
    /// user's last local connection.
    pub fn deregister(&self, connection_id: &str) -> Option<Departure> {
        let (_, conn_info) = self.connections.remove(connection_id)?;

        let went_offline = {
            if let Some(mut user_conns) = self.user_connections.get_mut(&conn_info.user_id) {
                user_conns.retain(|id| id != connection_id);
                if user_conns.is_empty() {
                    drop(user_conns);
                    self.user_connections.remove(&conn_info.user_id);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        cardhub_core::metrics::record_disconnect(self.online_user_count() as i64);

        info!(
            connection_id = %connection_id,
            user_id = %conn_info.user_id,
            duration = ?conn_info.duration(),
            went_offline = went_offline,
            "Connection deregistered"
        );

        if went_offline && !self.has_remote_presence(&conn_info.user_id) {
            let _ = self.status_tx.send(PresenceUpdate {
                user_id: conn_info.user_id.clone(),
                online: false,
            });
        }

        Some(Departure {
            user_id: conn_info.user_id,
            went_offline,
        })
    }

    /// Record heartbeat/activity for a connection
    pub fn touch(&self, connection_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.last_seen = Instant::now();
        }
    }

    /// Whether the user has at least one open connection anywhere
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.local_connection_count(user_id) > 0 || self.has_remote_presence(user_id)
    }

    /// Local connection IDs for a user (this instance's partial view)
    #[must_use]
    pub fn resolve(&self, user_id: &UserId) -> Vec<String> {
        self.user_connections
            .get(user_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn local_connection_count(&self, user_id: &UserId) -> usize {
        self.user_connections
            .get(user_id)
            .map_or(0, |conns| conns.len())
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Users online from this instance's merged point of view
    #[must_use]
    pub fn online_user_count(&self) -> usize {
        let local = self.user_connections.len();
        let remote_only = self
            .remote_presence
            .iter()
            .filter(|entry| {
                !entry.value().is_empty() && !self.user_connections.contains_key(entry.key())
            })
            .count();
        local + remote_only
    }

    #[must_use]
    pub fn get_connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    /// Apply a remote instance's presence claim from the bus
    pub fn apply_remote(&self, user_id: &UserId, instance_id: &str, online: bool) {
        if instance_id == self.instance_id {
            return;
        }

        let was_online = self.is_online(user_id);

        if online {
            self.remote_presence
                .entry(user_id.clone())
                .or_default()
                .insert(instance_id.to_string(), Instant::now());
        } else if let Some(mut instances) = self.remote_presence.get_mut(user_id) {
            instances.remove(instance_id);
            if instances.is_empty() {
                drop(instances);
                self.remote_presence.remove(user_id);
            }
        }

        let now_online = self.is_online(user_id);
        if was_online != now_online {
            debug!(
                user_id = %user_id,
                instance_id = %instance_id,
                online = now_online,
                "Merged presence transition"
            );
            let _ = self.status_tx.send(PresenceUpdate {
                user_id: user_id.clone(),
                online: now_online,
            });
        }
    }

    /// Connections whose last heartbeat is older than `timeout`.
    ///
    /// The sweep force-deregisters these so abrupt network loss cannot
    /// leave a user stuck online forever.
    #[must_use]
    pub fn expired_connections(&self, timeout: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.idle_duration() > timeout {
                warn!(
                    connection_id = %conn.connection_id,
                    user_id = %conn.user_id,
                    idle_duration = ?conn.idle_duration(),
                    "Connection heartbeat timeout"
                );
                expired.push(conn.connection_id.clone());
            }
        }
        expired
    }

    /// Drop remote presence claims not refreshed within `max_age`
    pub fn prune_remote(&self, max_age: Duration) {
        let now = Instant::now();
        let mut stale_users = Vec::new();

        for mut entry in self.remote_presence.iter_mut() {
            entry
                .value_mut()
                .retain(|_, last_update| now.duration_since(*last_update) < max_age);
            if entry.value().is_empty() {
                stale_users.push(entry.key().clone());
            }
        }

        for user_id in stale_users {
            self.remote_presence.remove(&user_id);
            if !self.is_online(&user_id) {
                debug!(user_id = %user_id, "Pruned stale remote presence");
                let _ = self.status_tx.send(PresenceUpdate {
                    user_id,
                    online: false,
                });
            }
        }
    }

    /// Subscribe to merged online/offline transitions
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.status_tx.subscribe()
    }

    fn has_remote_presence(&self, user_id: &UserId) -> bool {
        self.remote_presence
            .get(user_id)
            .is_some_and(|instances| !instances.is_empty())
    }
}

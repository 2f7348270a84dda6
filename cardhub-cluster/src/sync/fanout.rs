//! Fanout bus facade
//!
//! Single entry point for event distribution: deduplication, local hub
//! dispatch, Redis publication for other instances, and the presence
//! sweep that heals stale connections and stale remote claims.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedup::{DedupKey, EventDeduplicator};
use super::events::FanoutEvent;
use super::hub::{ConnectionId, UserMessageHub};
use super::redis_pubsub::{PublishRequest, RedisPubSub};
use super::registry::ConnectionRegistry;
use cardhub_core::models::UserId;

/// Fanout configuration
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Redis connection URL; empty runs single-node
    pub redis_url: String,
    /// Deduplication window duration
    pub dedup_window: Duration,
    /// How often to clean up dedup entries
    pub cleanup_interval: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            dedup_window: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Sweep tunables (intervals, not guarantees)
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub sweep_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub remote_max_age: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            remote_max_age: Duration::from_secs(300),
        }
    }
}

/// Result of publishing an event
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// Number of local connections the event was pushed to
    pub local_sent: usize,
    /// Whether the event was queued for Redis publication
    pub redis_published: bool,
}

/// Cross-instance fanout bus
///
/// Any instance can reach a user connected to any other instance: events
/// go to local connections through the hub and to remote instances
/// through Redis Pub/Sub.
#[derive(Clone)]
pub struct FanoutBus {
    hub: Arc<UserMessageHub>,
    registry: Arc<ConnectionRegistry>,
    deduplicator: Arc<EventDeduplicator>,
    redis_publish_tx: Option<mpsc::Sender<PublishRequest>>,
    redis_pubsub: Option<Arc<RedisPubSub>>,
    cancel_token: CancellationToken,
}

impl FanoutBus {
    /// Create the bus, starting the Redis transport unless `redis_url`
    /// is empty (single-node mode).
    pub async fn new(
        config: FanoutConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, anyhow::Error> {
        let hub = Arc::new(UserMessageHub::new());
        let deduplicator = Arc::new(EventDeduplicator::new(
            config.dedup_window,
            config.cleanup_interval,
        ));

        let (redis_publish_tx, redis_pubsub) = if config.redis_url.is_empty() {
            warn!("Redis URL not provided, running fanout in single-node mode");
            (None, None)
        } else {
            let pubsub = Arc::new(RedisPubSub::new(
                &config.redis_url,
                hub.clone(),
                registry.clone(),
                registry.instance_id().to_string(),
                deduplicator.clone(),
            )?);

            let tx = pubsub.clone().start().await?;
            (Some(tx), Some(pubsub))
        };

        Ok(Self {
            hub,
            registry,
            deduplicator,
            redis_publish_tx,
            redis_pubsub,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Get the local hub (for subscriptions)
    #[must_use]
    pub const fn hub(&self) -> &Arc<UserMessageHub> {
        &self.hub
    }

    /// Get the connection registry
    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Distribute an event: local connections first, then Redis for the
    /// other instances. Duplicates inside the dedup window are dropped.
    pub fn publish(&self, event: FanoutEvent) -> PublishOutcome {
        let dedup_key = DedupKey::from_event(&event);
        if !self.deduplicator.should_process(&dedup_key) {
            debug!(
                event_type = %event.event_type(),
                "Duplicate event detected, skipping"
            );
            return PublishOutcome {
                local_sent: 0,
                redis_published: false,
            };
        }

        // Presence events skip the hub: the local registry already holds
        // this instance's own state, only remote instances need them
        let local_sent = match event.recipient_id().cloned() {
            Some(recipient_id) => self.hub.send_to_user(&recipient_id, event.clone()),
            None => 0,
        };

        let mut redis_published = false;
        if let Some(tx) = &self.redis_publish_tx {
            match tx.try_send(PublishRequest { event }) {
                Ok(()) => {
                    redis_published = true;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Redis publish channel full (capacity {}), dropping event",
                        RedisPubSub::PUBLISH_CHANNEL_CAPACITY
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!("Redis publish channel closed, cannot queue event");
                }
            }
        }

        PublishOutcome {
            local_sent,
            redis_published,
        }
    }

    /// Subscribe a connection to its user's events
    pub fn subscribe(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> mpsc::UnboundedReceiver<FanoutEvent> {
        self.hub.subscribe(user_id, connection_id)
    }

    /// Unsubscribe a connection
    pub fn unsubscribe(&self, connection_id: &str) {
        self.hub.unsubscribe(connection_id);
    }

    /// Announce a local presence transition to the other instances
    pub fn publish_presence(&self, user_id: UserId, online: bool) {
        self.publish(FanoutEvent::PresenceChanged {
            user_id,
            instance_id: self.registry.instance_id().to_string(),
            online,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Periodic sweep: force-deregister connections whose heartbeat went
    /// silent, prune stale remote presence claims. Both are self-healing
    /// paths, not errors.
    pub fn spawn_sweeper(&self, config: SweepConfig) {
        let bus = self.clone();
        let cancel = self.cancel_token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.sweep_interval);
            interval.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Presence sweeper cancelled");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                let expired = bus.registry.expired_connections(config.heartbeat_timeout);
                for connection_id in expired {
                    bus.hub.unsubscribe(&connection_id);
                    if let Some(departure) = bus.registry.deregister(&connection_id) {
                        info!(
                            connection_id = %connection_id,
                            user_id = %departure.user_id,
                            "Swept stale connection"
                        );
                        if departure.went_offline {
                            bus.publish_presence(departure.user_id, false);
                        }
                    }
                }

                bus.registry.prune_remote(config.remote_max_age);
            }
        });
    }

    /// Bus-level metrics
    #[must_use]
    pub fn metrics(&self) -> FanoutMetrics {
        FanoutMetrics {
            instance_id: self.registry.instance_id().to_string(),
            local_connections: self.hub.connection_count(),
            local_users: self.hub.user_count(),
            tracked_events: self.deduplicator.len(),
            redis_enabled: self.redis_publish_tx.is_some(),
        }
    }

    /// Gracefully shut down background tasks
    pub fn shutdown(&self) {
        info!("Shutting down FanoutBus");
        self.cancel_token.cancel();
        if let Some(ref pubsub) = self.redis_pubsub {
            pubsub.shutdown();
        }
        self.deduplicator.shutdown();
    }
}

/// Fanout metrics
#[derive(Debug, Clone)]
pub struct FanoutMetrics {
    pub instance_id: String,
    pub local_connections: usize,
    pub local_users: usize,
    pub tracked_events: usize,
    pub redis_enabled: bool,
}

//! Redis Pub/Sub transport for cross-instance event fanout
//!
//! Any instance can reach a user connected elsewhere: user-routed events
//! are published on `cardhub:user:{user_id}` and picked up by whichever
//! instance holds the user's connections; presence transitions are
//! published on `cardhub:presence` and merged into every instance's
//! registry view. Both the publisher and the subscriber are long-lived
//! tasks that reconnect with exponential backoff and stop through a
//! `CancellationToken`.

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedup::{DedupKey, EventDeduplicator};
use super::events::FanoutEvent;
use super::hub::UserMessageHub;
use super::registry::ConnectionRegistry;
use cardhub_core::models::UserId;

/// Channel carrying presence transitions between instances
const PRESENCE_CHANNEL: &str = "cardhub:presence";
/// Per-user channel prefix for user-routed events
const USER_CHANNEL_PREFIX: &str = "cardhub:user:";

/// Bound on individual Redis operations
const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff, doubling from floor to ceiling
struct Backoff {
    delay: Duration,
}

impl Backoff {
    const FLOOR: Duration = Duration::from_secs(1);
    const CEILING: Duration = Duration::from_secs(30);

    const fn new() -> Self {
        Self { delay: Self::FLOOR }
    }

    fn reset(&mut self) {
        self.delay = Self::FLOOR;
    }

    /// Sleep for the current delay, then double it up to the ceiling
    async fn wait(&mut self) {
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(Self::CEILING);
    }
}

/// Request to publish an event to the other instances
pub struct PublishRequest {
    pub event: FanoutEvent,
}

/// Envelope stamped with the publishing instance so each node can ignore
/// its own events coming back off the bus
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct EventEnvelope {
    node_id: String,
    event: FanoutEvent,
}

pub struct RedisPubSub {
    client: RedisClient,
    hub: Arc<UserMessageHub>,
    registry: Arc<ConnectionRegistry>,
    node_id: String,
    deduplicator: Arc<EventDeduplicator>,
    cancel: CancellationToken,
}

impl RedisPubSub {
    /// Queued-but-unpublished events above this are dropped with a
    /// warning (e.g. during a prolonged Redis outage).
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

    pub fn new(
        redis_url: &str,
        hub: Arc<UserMessageHub>,
        registry: Arc<ConnectionRegistry>,
        node_id: String,
        deduplicator: Arc<EventDeduplicator>,
    ) -> Result<Self> {
        let client = RedisClient::open(redis_url).context("Failed to create Redis client")?;
        Ok(Self {
            client,
            hub,
            registry,
            node_id,
            deduplicator,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the publisher and subscriber tasks; returns the sender the
    /// fanout bus feeds outgoing events into.
    pub async fn start(self: Arc<Self>) -> Result<mpsc::Sender<PublishRequest>> {
        let (publish_tx, publish_rx) =
            mpsc::channel::<PublishRequest>(Self::PUBLISH_CHANNEL_CAPACITY);

        let publisher = self.clone();
        tokio::spawn(async move { publisher.publisher_task(publish_rx).await });

        let subscriber = self;
        tokio::spawn(async move { subscriber.subscriber_task().await });

        Ok(publish_tx)
    }

    /// Cancel both background tasks
    pub fn shutdown(&self) {
        info!("Shutting down RedisPubSub transport");
        self.cancel.cancel();
    }

    /// Drain the publish channel onto Redis. A failed publish is carried
    /// across the reconnect so the event is not lost to a flaky link.
    async fn publisher_task(&self, mut rx: mpsc::Receiver<PublishRequest>) {
        let mut backoff = Backoff::new();
        let mut carried: Option<PublishRequest> = None;

        'reconnect: loop {
            let mut conn = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Redis publisher cancelled");
                    return;
                }
                conn = self.connect() => match conn {
                    Ok(conn) => {
                        backoff.reset();
                        info!("Redis publisher connected");
                        conn
                    }
                    Err(e) => {
                        error!(error = %e, "Redis publisher connect failed, backing off");
                        backoff.wait().await;
                        continue;
                    }
                },
            };

            loop {
                let req = match carried.take() {
                    Some(req) => req,
                    None => tokio::select! {
                        _ = self.cancel.cancelled() => {
                            info!("Redis publisher cancelled");
                            return;
                        }
                        req = rx.recv() => match req {
                            Some(req) => req,
                            None => {
                                warn!("Publish channel closed, publisher exiting");
                                return;
                            }
                        },
                    },
                };

                match self.publish_one(&mut conn, &req.event).await {
                    Ok(receivers) => {
                        debug!(
                            event_type = req.event.event_type(),
                            receivers = receivers,
                            "Event published"
                        );
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            event_type = req.event.event_type(),
                            "Publish failed, reconnecting with event carried over"
                        );
                        carried = Some(req);
                        backoff.wait().await;
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    /// Keep a pattern subscription alive, feeding received events into
    /// the local hub and registry.
    async fn subscriber_task(&self) {
        let mut backoff = Backoff::new();

        loop {
            if self.cancel.is_cancelled() {
                info!("Redis subscriber cancelled");
                return;
            }

            match self.run_subscription().await {
                // The stream ended after a healthy connection; retry
                // promptly since the server was reachable.
                Ok(()) => {
                    error!("Redis subscription stream ended, reconnecting");
                    backoff.reset();
                }
                Err(e) => {
                    error!(error = %e, "Redis subscriber connect failed, backing off");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Redis subscriber cancelled during backoff");
                    return;
                }
                _ = backoff.wait() => {}
            }
        }
    }

    /// One subscription lifetime: connect, psubscribe, pump messages
    /// until the stream ends. `Err` means the connect/subscribe itself
    /// failed; `Ok(())` means the established connection dropped.
    async fn run_subscription(&self) -> Result<()> {
        let mut pubsub = timeout(OP_TIMEOUT, self.client.get_async_pubsub())
            .await
            .context("Timed out opening Redis Pub/Sub connection")?
            .context("Failed to open Redis Pub/Sub connection")?;

        let user_pattern = format!("{USER_CHANNEL_PREFIX}*");
        let patterns = [user_pattern.as_str(), PRESENCE_CHANNEL];
        timeout(OP_TIMEOUT, pubsub.psubscribe(&patterns))
            .await
            .context("Timed out subscribing")?
            .context("Failed to subscribe")?;

        info!(
            node_id = %self.node_id,
            "Redis subscriber listening on user and presence channels"
        );

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Unreadable payload");
                    continue;
                }
            };

            let envelope: EventEnvelope = match serde_json::from_str(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Malformed event envelope");
                    continue;
                }
            };

            // Our own events were already dispatched locally
            if envelope.node_id != self.node_id {
                self.dispatch(&channel, envelope.event);
            }
        }

        Ok(())
    }

    /// Route one event received off the bus
    fn dispatch(&self, channel: &str, event: FanoutEvent) {
        if !self.deduplicator.should_process(&DedupKey::from_event(&event)) {
            debug!(
                channel = %channel,
                event_type = %event.event_type(),
                "Duplicate bus event dropped"
            );
            return;
        }

        if channel == PRESENCE_CHANNEL {
            match event {
                FanoutEvent::PresenceChanged {
                    ref user_id,
                    ref instance_id,
                    online,
                    ..
                } => self.registry.apply_remote(user_id, instance_id, online),
                other => {
                    warn!(
                        event_type = %other.event_type(),
                        "Non-presence event on the presence channel"
                    );
                }
            }
            return;
        }

        match channel.strip_prefix(USER_CHANNEL_PREFIX) {
            Some(user_id) => {
                let user_id = UserId::from_string(user_id.to_string());
                let delivered = self.hub.send_to_user(&user_id, event);
                debug!(
                    user_id = %user_id,
                    local_connections = delivered,
                    "Bus event forwarded to local connections"
                );
            }
            None => warn!(channel = %channel, "Event on unrecognized channel"),
        }
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        timeout(OP_TIMEOUT, self.client.get_multiplexed_async_connection())
            .await
            .context("Timed out opening Redis connection")?
            .context("Failed to open Redis connection")
    }

    async fn publish_one(
        &self,
        conn: &mut MultiplexedConnection,
        event: &FanoutEvent,
    ) -> Result<usize> {
        let channel = match event.recipient_id() {
            Some(user_id) => format!("{USER_CHANNEL_PREFIX}{user_id}"),
            None => PRESENCE_CHANNEL.to_string(),
        };

        let payload = serde_json::to_string(&EventEnvelope {
            node_id: self.node_id.clone(),
            event: event.clone(),
        })
        .context("Failed to serialize event envelope")?;

        let receivers: usize = timeout(OP_TIMEOUT, conn.publish(&channel, &payload))
            .await
            .context("Timed out publishing to Redis")?
            .context("Failed to publish to Redis")?;

        Ok(receivers)
    }
}

// Module: sync

pub mod dedup;
pub mod events;
pub mod fanout;
pub mod hub;
pub mod redis_pubsub;
pub mod registry;

pub use dedup::{DedupKey, EventDeduplicator};
pub use events::FanoutEvent;
pub use fanout::{FanoutBus, FanoutConfig, FanoutMetrics, PublishOutcome, SweepConfig};
pub use hub::{ConnectionId, MessageSender, Subscriber, UserMessageHub};
pub use redis_pubsub::{PublishRequest, RedisPubSub};
pub use registry::{
    ConnectionInfo, ConnectionLimits, ConnectionRegistry, Departure, PresenceTransition,
    PresenceUpdate,
};

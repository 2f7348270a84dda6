pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    ConnectionInfo, ConnectionLimits, ConnectionRegistry, EventDeduplicator, FanoutBus,
    FanoutConfig, FanoutEvent, PresenceUpdate, PublishOutcome, PublishRequest, RedisPubSub,
    SweepConfig, UserMessageHub,
};

//! Peer-to-peer call signaling
//!
//! Relays opaque offer/answer/ICE payloads between exactly two peers and
//! owns the session state machine. Media itself flows peer-to-peer once
//! signaling completes; this module never touches it.

pub mod coordinator;
pub mod reducer;
pub mod store;

pub use coordinator::{CallCoordinator, SignalSink};
pub use reducer::{reduce, CallEvent, Effect};
pub use store::{CallSessionStore, InMemoryCallSessionStore};

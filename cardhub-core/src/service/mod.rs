pub mod auth;
pub mod call;
pub mod delivery;
pub mod email;

pub use auth::TokenValidator;
pub use call::{CallCoordinator, CallSessionStore, InMemoryCallSessionStore, SignalSink};
pub use delivery::{DeliveryError, DeliveryHandler, DeliveryQueue, QueueConfig};
pub use email::{EmailError, Mailer, SmtpMailer};

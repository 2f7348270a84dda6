pub mod call;
pub mod delivery;
pub mod id;
pub mod message;
pub mod notification;

pub use call::{CallSession, CallSignal, CallState, CallType, EndReason};
pub use delivery::{DeliveryJob, JobKind, JobStatus};
pub use id::{generate_id, CallId, ConversationId, MessageId, UserId};
pub use message::Message;
pub use notification::{NotificationKind, NotificationRecord};

pub mod calls;
pub mod channel;
pub mod events;
pub mod http;
pub mod orchestrator;

pub use http::{create_router, AppState};
pub use orchestrator::MessageOrchestrator;

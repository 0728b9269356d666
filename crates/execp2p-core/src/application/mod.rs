//! Application layer: session orchestration, event bus, status snapshots.

pub mod events;
pub mod session;
pub mod status;

pub use events::{AppEvent, EventBus};
pub use session::{CreateRoomResult, Session};
pub use status::{NetworkStatus, SecuritySummary};

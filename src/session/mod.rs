//! Session lifecycle and live rotation
//!
//! Sessions, transition tokens and rotation queues are owned by
//! [`SessionManager`]. Nothing in here performs I/O.

mod clock;
mod manager;
mod models;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{GarbageReport, SessionManager};
pub use models::{
    generate_token, QueuedMessage, RejectReason, Rotation, Session, SessionStatus,
    TransitionToken, TOKEN_BYTES,
};

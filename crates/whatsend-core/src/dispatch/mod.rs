//! Campaign batch dispatch
//!
//! One dispatch per campaign at a time. Pending messages are sent in
//! fixed-size concurrent batches, paced by a throttle, with per-message
//! retries. Every status write is conditional on the row's current state.

pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod registry;
pub mod throttle;


pub use delivery::{DeliveryOutcome, MessageContent, RetryPolicy};
pub use dispatcher::CampaignDispatcher;
pub use error::{DeliveryFailure, DispatchError};
pub use events::{DispatchEvent, DispatchProgress};
pub use registry::{DispatchGuard, DispatchRegistry};
pub use throttle::BatchThrottle;

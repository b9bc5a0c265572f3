//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `MessageRouter`: decodes frames and fans data out by topic
//! - `ConnectionManager`: one endpoint's connection state machine
//! - `FeedRegistry`: shares managers between callers by endpoint

mod manager;
mod registry;
mod router;

pub use manager::{
    ConnectionManager, GiveUpCallback, ListenerId, ManagerConfig, ManagerStats, StateCallback,
    SubscriptionHandle,
};
pub use registry::{ConnectionHandle, FeedRegistry, FeedSnapshot};
pub use router::{MessageRouter, RouteOutcome, RouterStats};

pub mod admin;
pub mod config;
pub mod entitlement;
pub mod logging;
pub mod realtime;
pub mod store;
pub mod tracker;
pub mod version;

pub use config::TrackerConfig;
pub use entitlement::{Entitlement, EntitlementState, TickResult, Tier, format_remaining, tick};
pub use tracker::{EntitlementTracker, TrackerHandle};

//! Sync feature module
//!
//! Triggers runs, reports their progress and exposes the persisted outcomes.

pub mod queries;
pub mod routes;

pub use routes::sync_routes;

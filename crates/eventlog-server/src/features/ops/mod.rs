//! Operational endpoints

pub mod routes;

pub use routes::ops_routes;

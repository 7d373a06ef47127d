//! # HTTP Middleware
//!
//! Request logging and counter middleware for the ambient HTTP surface
//! (health, metrics, config). WebSocket traffic is logged by the connection
//! actors themselves; these layers only see the upgrade request.

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::RequestCounters;

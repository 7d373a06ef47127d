//! # HTTP Handlers
//!
//! The small REST surface next to the WebSocket endpoint: runtime
//! configuration inspection and updates.

pub mod config;

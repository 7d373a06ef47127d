//! # Device-Side Streaming
//!
//! The firmware-shaped half of the protocol: a capture ring that absorbs
//! microphone frames, and a streaming client that pushes them to the gateway
//! with reconnection and session resumption. The simulator binary drives
//! these against a running gateway.

pub mod capture;
pub mod client;

pub use capture::CaptureRing;
pub use client::{Backoff, ClientState, DeviceClientConfig, DeviceStreamingClient, TalkEvent};

//! # Gateway Core
//!
//! Session identity, the gateway-wide registry, and the per-connection
//! WebSocket actor that ties the streaming protocol to the audio pipeline.

pub mod registry;
pub mod session;
pub mod websocket;

pub use registry::{RegistryError, SessionRegistry};
pub use session::{DeviceCapabilities, SessionEntry, SessionPhase};
pub use websocket::{device_ws, DeviceSocket};

//! # Companion Device Backend
//!
//! Cloud gateway for a children's companion device. The device streams raw
//! PCM audio over a WebSocket; the gateway reassembles utterances, runs them
//! through an adaptive enhancement pipeline, hands the cleaned audio to the
//! external voice collaborators, and streams the synthesized reply back.
//!
//! ## Module Map:
//! - **config**: Layered application configuration (TOML + environment)
//! - **state**: Shared application state and cross-session metrics
//! - **error**: Error taxonomy and HTTP error responses
//! - **protocol**: Device ↔ gateway wire protocol (JSON control + binary PCM)
//! - **gateway**: WebSocket endpoint, session registry, session state machine
//! - **audio**: Audio frames and the utterance buffer assembler
//! - **enhancement**: Staged DSP pipeline with per-profile budgets
//! - **dispatch**: Response streaming back to the device (with barge-in)
//! - **collaborators**: External STT/emotion/response/TTS service seams
//! - **handlers**: REST handlers for runtime configuration
//! - **device**: Embedded-side streaming client and capture ring

pub mod audio;
pub mod collaborators;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod enhancement;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod protocol;
pub mod state;

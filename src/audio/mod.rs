//! # Audio Handling
//!
//! The utterance data model and the buffer assembler that turns ordered
//! (possibly gappy) frame streams into complete utterances.

pub mod assembler;
pub mod utterance;

pub use assembler::{AssemblerConfig, BufferAssembler, CompletionTrigger};
pub use utterance::{Utterance, UtteranceState};

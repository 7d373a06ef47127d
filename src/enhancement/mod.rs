//! # Audio Enhancement Pipeline
//!
//! Staged DSP processing applied to each reassembled utterance before it is
//! handed to the voice collaborators. Stages are selected per utterance by a
//! processing profile and run on a bounded worker pool so enhancement never
//! blocks a session's frame-receiving loop.

pub mod pipeline;
pub mod profile;
pub mod stages;
pub mod worker;

pub use pipeline::{EnhancementMetrics, EnhancementPipeline, EnhancementResult};
pub use profile::{ProcessingProfile, ProfileLevel, StageKind};
pub use worker::WorkerPool;

//! # Processing Profiles
//!
//! A profile selects which enhancement stages run on an utterance and how
//! long the whole chain is expected to take. The gateway picks the level per
//! utterance from the device's handshake preference; a device that asks for
//! nothing gets the medium profile.
//!
//! ## Levels:
//! - `low`: normalization only, for battery-constrained devices (soft budget 1s)
//! - `medium`: normalization, noise reduction, voice bandpass (soft budget 3s)
//! - `high`: full five-stage chain including HPSS and compression (soft budget 10s)
//!
//! Budgets are soft: overruns are logged, never enforced by discarding audio.

use crate::config::EnhancementConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier for one enhancement stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Normalization,
    NoiseReduction,
    VoiceBandFilter,
    HarmonicPercussive,
    Compression,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Normalization => "normalization",
            StageKind::NoiseReduction => "noise_reduction",
            StageKind::VoiceBandFilter => "voice_band_filter",
            StageKind::HarmonicPercussive => "harmonic_percussive",
            StageKind::Compression => "compression",
        }
    }
}

/// Enhancement depth requested for an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileLevel {
    Low,
    Medium,
    High,
}

impl Default for ProfileLevel {
    fn default() -> Self {
        ProfileLevel::Medium
    }
}

impl ProfileLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileLevel::Low => "low",
            ProfileLevel::Medium => "medium",
            ProfileLevel::High => "high",
        }
    }

    /// Parse a device's preferred profile string; unknown values fall back
    /// to the default rather than failing the handshake.
    pub fn from_preference(preference: Option<&str>) -> Self {
        match preference {
            Some("low") => ProfileLevel::Low,
            Some("medium") => ProfileLevel::Medium,
            Some("high") => ProfileLevel::High,
            _ => ProfileLevel::default(),
        }
    }
}

/// A resolved profile: the stage list, the soft time budget, and a snapshot
/// of the DSP tunables taken when the utterance entered the pipeline.
///
/// Snapshotting the tunables means a runtime config update never changes the
/// parameters of an utterance already in flight.
#[derive(Debug, Clone)]
pub struct ProcessingProfile {
    pub level: ProfileLevel,
    pub stages: Vec<StageKind>,
    pub soft_budget: Duration,
    pub params: EnhancementConfig,
    pub sample_rate: u32,
}

impl ProcessingProfile {
    pub fn new(level: ProfileLevel, params: &EnhancementConfig, sample_rate: u32) -> Self {
        let (stages, soft_budget) = match level {
            ProfileLevel::Low => (vec![StageKind::Normalization], Duration::from_secs(1)),
            ProfileLevel::Medium => (
                vec![
                    StageKind::Normalization,
                    StageKind::NoiseReduction,
                    StageKind::VoiceBandFilter,
                ],
                Duration::from_secs(3),
            ),
            ProfileLevel::High => (
                vec![
                    StageKind::Normalization,
                    StageKind::NoiseReduction,
                    StageKind::VoiceBandFilter,
                    StageKind::HarmonicPercussive,
                    StageKind::Compression,
                ],
                Duration::from_secs(10),
            ),
        };

        Self {
            level,
            stages,
            soft_budget,
            params: params.clone(),
            sample_rate,
        }
    }

    /// Expected share of the soft budget for a single stage. Used only for
    /// overrun warnings.
    pub fn per_stage_budget(&self) -> Duration {
        self.soft_budget / self.stages.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_profile_stage_counts() {
        let cfg = AppConfig::default();
        let low = ProcessingProfile::new(ProfileLevel::Low, &cfg.enhancement, 16000);
        let medium = ProcessingProfile::new(ProfileLevel::Medium, &cfg.enhancement, 16000);
        let high = ProcessingProfile::new(ProfileLevel::High, &cfg.enhancement, 16000);

        assert_eq!(low.stages.len(), 1);
        assert_eq!(medium.stages.len(), 3);
        assert_eq!(high.stages.len(), 5);
        assert_eq!(high.stages[0], StageKind::Normalization);
        assert_eq!(high.stages[4], StageKind::Compression);
    }

    #[test]
    fn test_preference_parsing() {
        assert_eq!(ProfileLevel::from_preference(Some("high")), ProfileLevel::High);
        assert_eq!(ProfileLevel::from_preference(Some("low")), ProfileLevel::Low);
        assert_eq!(
            ProfileLevel::from_preference(Some("turbo")),
            ProfileLevel::Medium
        );
        assert_eq!(ProfileLevel::from_preference(None), ProfileLevel::Medium);
    }
}

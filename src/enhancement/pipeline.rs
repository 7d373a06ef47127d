//! # Pipeline Runner
//!
//! Runs a profile's stage chain over one utterance and collects timing and
//! quality metrics. The runner never fails an utterance: a stage error makes
//! it fall back to the last successfully completed stage's output and stop
//! there, and a budget overrun is only logged.

use crate::audio::Utterance;
use crate::enhancement::profile::ProcessingProfile;
use crate::enhancement::stages::{build_stage, rms};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Analysis frame size for the SNR estimate (matches the stages).
const SNR_FRAME: usize = 256;

/// Quality and timing figures for one pipeline run.
#[derive(Debug, Clone)]
pub struct EnhancementMetrics {
    pub processing_time_ms: u64,
    pub input_rms: f32,
    pub output_rms: f32,
    /// Ratio of output SNR to input SNR; above 1.0 means the voiced content
    /// stands further above the noise floor than it did on input.
    pub rms_improvement: f32,
    /// Per-stage wall time in the order the stages ran
    pub stage_timings_ms: Vec<(String, u64)>,
}

/// Output of one pipeline run.
#[derive(Debug, Clone)]
pub struct EnhancementResult {
    pub utterance_id: Uuid,
    pub session_id: Uuid,
    pub samples: Vec<i16>,
    /// Names of the stages that completed, in run order
    pub steps_applied: Vec<String>,
    /// Name of the stage that failed, if the chain stopped early
    pub failed_stage: Option<String>,
    pub metrics: EnhancementMetrics,
}

/// Stage chain executor for a single profile.
pub struct EnhancementPipeline {
    profile: ProcessingProfile,
}

impl EnhancementPipeline {
    pub fn new(profile: ProcessingProfile) -> Self {
        Self { profile }
    }

    /// Run the full chain over a sealed utterance.
    ///
    /// ## Returns:
    /// Always a result; `failed_stage` records whether the chain was cut
    /// short. The audio in the result is the output of the last stage that
    /// completed (the raw input if the first stage failed).
    pub fn run(&self, utterance: &Utterance) -> EnhancementResult {
        let started = Instant::now();
        let input: Vec<f32> = utterance
            .samples
            .iter()
            .map(|&s| s as f32 / 32768.0)
            .collect();
        let input_rms = rms(&input);
        let input_snr = frame_snr(&input);

        let per_stage_budget = self.profile.per_stage_budget();
        let mut current = input;
        let mut steps_applied = Vec::with_capacity(self.profile.stages.len());
        let mut stage_timings_ms = Vec::with_capacity(self.profile.stages.len());
        let mut failed_stage = None;

        for kind in &self.profile.stages {
            let mut stage = build_stage(*kind, &self.profile);
            let stage_started = Instant::now();
            match stage.apply(&current) {
                Ok(output) => {
                    let elapsed = stage_started.elapsed();
                    if elapsed > per_stage_budget * 2 {
                        warn!(
                            utterance_id = %utterance.id,
                            stage = kind.name(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            budget_ms = per_stage_budget.as_millis() as u64,
                            "Enhancement stage exceeded twice its budget share"
                        );
                    }
                    stage_timings_ms.push((kind.name().to_string(), elapsed.as_millis() as u64));
                    steps_applied.push(kind.name().to_string());
                    current = output;
                }
                Err(e) => {
                    warn!(
                        utterance_id = %utterance.id,
                        stage = kind.name(),
                        error = %e,
                        "Enhancement stage failed, keeping last good output"
                    );
                    failed_stage = Some(kind.name().to_string());
                    break;
                }
            }
        }

        let output_rms = rms(&current);
        let output_snr = frame_snr(&current);
        let rms_improvement = if input_snr > 1e-9 {
            output_snr / input_snr
        } else {
            1.0
        };

        let samples: Vec<i16> = current
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
            .collect();

        let processing_time_ms = started.elapsed().as_millis() as u64;
        debug!(
            utterance_id = %utterance.id,
            profile = self.profile.level.as_str(),
            stages = steps_applied.len(),
            processing_time_ms,
            rms_improvement,
            "Enhancement pipeline finished"
        );

        EnhancementResult {
            utterance_id: utterance.id,
            session_id: utterance.session_id,
            samples,
            steps_applied,
            failed_stage,
            metrics: EnhancementMetrics {
                processing_time_ms,
                input_rms,
                output_rms,
                rms_improvement,
                stage_timings_ms,
            },
        }
    }
}

/// Frame-level SNR estimate: mean RMS of the loudest fifth of frames over
/// the mean RMS of the quietest fifth.
fn frame_snr(samples: &[f32]) -> f32 {
    let mut levels: Vec<f32> = samples.chunks(SNR_FRAME).map(rms).collect();
    if levels.len() < 2 {
        return 1.0;
    }
    levels.sort_unstable_by(f32::total_cmp);
    let fifth = (levels.len() / 5).max(1);
    let noise: f32 = levels[..fifth].iter().sum::<f32>() / fifth as f32;
    let signal: f32 = levels[levels.len() - fifth..].iter().sum::<f32>() / fifth as f32;
    signal / noise.max(1e-5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Utterance;
    use crate::config::AppConfig;
    use crate::enhancement::profile::{ProcessingProfile, ProfileLevel};

    /// 3s synthetic noisy utterance: pseudo-noise throughout, with voiced
    /// tone bursts in the middle second.
    fn noisy_utterance() -> Utterance {
        let mut samples = Vec::with_capacity(48000);
        let mut seed = 0x9e3779b97f4a7c15u64;
        for i in 0..48000usize {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let noise = ((seed >> 40) as f32 / 8388608.0 - 1.0) * 0.06;
            let voiced = if (16000..32000).contains(&i) {
                0.5 * (2.0 * std::f32::consts::PI * 280.0 * i as f32 / 16000.0).sin()
            } else {
                0.0
            };
            samples.push(((noise + voiced).clamp(-1.0, 1.0) * 32767.0) as i16);
        }
        let mut utt = Utterance::new(Uuid::new_v4());
        utt.samples = samples;
        utt.complete();
        utt
    }

    #[test]
    fn test_high_profile_runs_all_stages_and_improves_snr() {
        let cfg = AppConfig::default();
        let profile = ProcessingProfile::new(ProfileLevel::High, &cfg.enhancement, 16000);
        let pipeline = EnhancementPipeline::new(profile);

        let utt = noisy_utterance();
        let result = pipeline.run(&utt);

        assert_eq!(result.steps_applied.len(), 5);
        assert!(result.failed_stage.is_none());
        assert_eq!(result.samples.len(), utt.samples.len());
        assert!(result.metrics.rms_improvement > 1.0);
    }

    #[test]
    fn test_low_profile_normalizes_only() {
        let cfg = AppConfig::default();
        let profile = ProcessingProfile::new(ProfileLevel::Low, &cfg.enhancement, 16000);
        let pipeline = EnhancementPipeline::new(profile);

        let result = pipeline.run(&noisy_utterance());
        assert_eq!(result.steps_applied, vec!["normalization"]);
    }

    #[test]
    fn test_pipeline_is_deterministic() {
        let cfg = AppConfig::default();
        let profile = ProcessingProfile::new(ProfileLevel::High, &cfg.enhancement, 16000);
        let pipeline = EnhancementPipeline::new(profile);

        let utt = noisy_utterance();
        let a = pipeline.run(&utt);
        let b = pipeline.run(&utt);
        assert_eq!(a.samples, b.samples);
        assert_eq!(a.steps_applied, b.steps_applied);
    }

    #[test]
    fn test_empty_utterance_falls_back_without_failing() {
        let cfg = AppConfig::default();
        let profile = ProcessingProfile::new(ProfileLevel::High, &cfg.enhancement, 16000);
        let pipeline = EnhancementPipeline::new(profile);

        let mut utt = Utterance::new(Uuid::new_v4());
        utt.complete();
        let result = pipeline.run(&utt);

        assert!(result.steps_applied.is_empty());
        assert_eq!(result.failed_stage.as_deref(), Some("normalization"));
        assert!(result.samples.is_empty());
    }
}

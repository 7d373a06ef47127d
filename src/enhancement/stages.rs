//! # Enhancement Stages
//!
//! The individual DSP transforms the pipeline chains together. Every stage
//! is a pure function of its input and its snapshotted tunables: the same
//! samples with the same parameters always produce bit-identical output.
//!
//! ## Stage inventory:
//! 1. **Normalization**: scale the waveform so its peak sits at the target
//!    level. Idempotent: running it on already-normalized audio is a no-op.
//! 2. **Noise reduction**: estimate the noise floor from the quietest frames
//!    and subtract it proportionally, adapting as the floor drifts.
//! 3. **Voice band filter**: biquad high-pass and low-pass pair keeping only
//!    the speech band.
//! 4. **Harmonic/percussive separation**: moving-median split of the
//!    waveform; the transient residue is mixed back at a reduced gain.
//! 5. **Compression**: envelope-follower dynamic range compression above a
//!    threshold.
//!
//! All processing happens on f32 samples in [-1, 1]; the pipeline owns the
//! PCM conversion at the boundaries.

use crate::enhancement::profile::{ProcessingProfile, StageKind};

/// Analysis frame size for the frame-based stages (16 ms at 16 kHz).
const ANALYSIS_FRAME: usize = 256;

/// Minimum gain the noise reducer will apply, so quiet frames are attenuated
/// rather than gated to digital silence.
const NOISE_GAIN_FLOOR: f32 = 0.05;

/// Median window for harmonic/percussive separation (samples, odd).
const HPSS_WINDOW: usize = 31;

/// One enhancement transform.
///
/// ## Thread Safety:
/// Stages hold only copied parameters, never shared state, so a boxed stage
/// can be built on any worker without synchronization.
pub trait Stage: Send {
    fn kind(&self) -> StageKind;

    /// Transform `samples` into a new buffer. An error here makes the
    /// pipeline fall back to the stage's input; it never loses the utterance.
    fn apply(&mut self, samples: &[f32]) -> Result<Vec<f32>, String>;
}

/// Construct the stage a profile entry names, with tunables snapshotted from
/// the profile.
pub fn build_stage(kind: StageKind, profile: &ProcessingProfile) -> Box<dyn Stage> {
    let p = &profile.params;
    match kind {
        StageKind::Normalization => Box::new(Normalize {
            target_peak: p.target_peak,
        }),
        StageKind::NoiseReduction => Box::new(NoiseReduce {
            ratio: p.noise_reduction_ratio,
        }),
        StageKind::VoiceBandFilter => Box::new(VoiceBandFilter {
            low_hz: p.band_low_hz,
            high_hz: p.band_high_hz,
            sample_rate: profile.sample_rate,
        }),
        StageKind::HarmonicPercussive => Box::new(HarmonicPercussive {
            percussive_gain: p.percussive_gain,
        }),
        StageKind::Compression => Box::new(Compress {
            threshold: p.compression_threshold,
            ratio: p.compression_ratio,
            sample_rate: profile.sample_rate,
        }),
    }
}

/// Root-mean-square level of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

// ---------------------------------------------------------------------------
// Stage 1: peak normalization
// ---------------------------------------------------------------------------

struct Normalize {
    target_peak: f32,
}

impl Stage for Normalize {
    fn kind(&self) -> StageKind {
        StageKind::Normalization
    }

    fn apply(&mut self, samples: &[f32]) -> Result<Vec<f32>, String> {
        if samples.is_empty() {
            return Err("empty input".to_string());
        }
        let peak = peak(samples);
        // Silence has no peak to normalize; scaling it up would only amplify
        // quantization noise.
        if peak < 1e-6 {
            return Ok(samples.to_vec());
        }
        let scale = self.target_peak / peak;
        if (scale - 1.0).abs() < 1e-3 {
            // Already at target; exact no-op keeps the stage idempotent.
            return Ok(samples.to_vec());
        }
        Ok(samples.iter().map(|s| s * scale).collect())
    }
}

// ---------------------------------------------------------------------------
// Stage 2: adaptive noise floor subtraction
// ---------------------------------------------------------------------------

struct NoiseReduce {
    ratio: f32,
}

impl NoiseReduce {
    /// Initial floor estimate: mean RMS of the quietest tenth of frames.
    fn initial_floor(frame_levels: &[f32]) -> f32 {
        let mut sorted = frame_levels.to_vec();
        sorted.sort_unstable_by(f32::total_cmp);
        let quietest = (sorted.len() / 10).max(1);
        sorted[..quietest].iter().sum::<f32>() / quietest as f32
    }
}

impl Stage for NoiseReduce {
    fn kind(&self) -> StageKind {
        StageKind::NoiseReduction
    }

    fn apply(&mut self, samples: &[f32]) -> Result<Vec<f32>, String> {
        if samples.is_empty() {
            return Err("empty input".to_string());
        }

        let frame_levels: Vec<f32> = samples.chunks(ANALYSIS_FRAME).map(rms).collect();
        let mut floor = Self::initial_floor(&frame_levels);

        let mut out = Vec::with_capacity(samples.len());
        let mut prev_gain = 1.0f32;
        for (chunk, level) in samples.chunks(ANALYSIS_FRAME).zip(&frame_levels) {
            // Track a drifting floor from frames that look like pure noise
            if *level < floor * 1.5 {
                floor = 0.9 * floor + 0.1 * level;
            }

            let gain = if *level > 1e-6 {
                (1.0 - self.ratio * floor / level).clamp(NOISE_GAIN_FLOOR, 1.0)
            } else {
                NOISE_GAIN_FLOOR
            };

            // Ramp between frame gains so gain steps never click
            let n = chunk.len() as f32;
            for (i, s) in chunk.iter().enumerate() {
                let t = (i as f32 + 1.0) / n;
                out.push(s * (prev_gain + (gain - prev_gain) * t));
            }
            prev_gain = gain;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Stage 3: voice band filter
// ---------------------------------------------------------------------------

/// Direct-form-I biquad section with RBJ cookbook coefficients.
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    fn new(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    fn high_pass(cutoff_hz: f32, sample_rate: u32) -> Self {
        let (cos_w, alpha) = Self::prewarp(cutoff_hz, sample_rate);
        Self::new(
            (1.0 + cos_w) / 2.0,
            -(1.0 + cos_w),
            (1.0 + cos_w) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w,
            1.0 - alpha,
        )
    }

    fn low_pass(cutoff_hz: f32, sample_rate: u32) -> Self {
        let (cos_w, alpha) = Self::prewarp(cutoff_hz, sample_rate);
        Self::new(
            (1.0 - cos_w) / 2.0,
            1.0 - cos_w,
            (1.0 - cos_w) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w,
            1.0 - alpha,
        )
    }

    fn prewarp(cutoff_hz: f32, sample_rate: u32) -> (f32, f32) {
        let w0 = 2.0 * std::f32::consts::PI * cutoff_hz / sample_rate as f32;
        // alpha = sin(w0) / 2Q with Butterworth Q of 1/sqrt(2)
        (w0.cos(), w0.sin() * std::f32::consts::FRAC_1_SQRT_2)
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

struct VoiceBandFilter {
    low_hz: f32,
    high_hz: f32,
    sample_rate: u32,
}

impl Stage for VoiceBandFilter {
    fn kind(&self) -> StageKind {
        StageKind::VoiceBandFilter
    }

    fn apply(&mut self, samples: &[f32]) -> Result<Vec<f32>, String> {
        if samples.is_empty() {
            return Err("empty input".to_string());
        }
        let nyquist = self.sample_rate as f32 / 2.0;
        if self.high_hz >= nyquist {
            return Err(format!(
                "band edge {} Hz at or above Nyquist ({} Hz)",
                self.high_hz, nyquist
            ));
        }

        let mut hp = Biquad::high_pass(self.low_hz, self.sample_rate);
        let mut lp = Biquad::low_pass(self.high_hz, self.sample_rate);
        Ok(samples.iter().map(|&s| lp.process(hp.process(s))).collect())
    }
}

// ---------------------------------------------------------------------------
// Stage 4: harmonic/percussive separation
// ---------------------------------------------------------------------------

struct HarmonicPercussive {
    percussive_gain: f32,
}

impl Stage for HarmonicPercussive {
    fn kind(&self) -> StageKind {
        StageKind::HarmonicPercussive
    }

    fn apply(&mut self, samples: &[f32]) -> Result<Vec<f32>, String> {
        if samples.is_empty() {
            return Err("empty input".to_string());
        }

        let half = HPSS_WINDOW / 2;
        let mut window = [0.0f32; HPSS_WINDOW];
        let mut out = Vec::with_capacity(samples.len());

        for i in 0..samples.len() {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(samples.len());
            let slice = &samples[lo..hi];
            window[..slice.len()].copy_from_slice(slice);
            let w = &mut window[..slice.len()];
            w.sort_unstable_by(f32::total_cmp);

            // The moving median tracks the tonal contour; what it misses is
            // the transient (percussive) component.
            let harmonic = w[w.len() / 2];
            let percussive = samples[i] - harmonic;
            out.push(harmonic + self.percussive_gain * percussive);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Stage 5: dynamic range compression
// ---------------------------------------------------------------------------

struct Compress {
    threshold: f32,
    ratio: f32,
    sample_rate: u32,
}

impl Stage for Compress {
    fn kind(&self) -> StageKind {
        StageKind::Compression
    }

    fn apply(&mut self, samples: &[f32]) -> Result<Vec<f32>, String> {
        if samples.is_empty() {
            return Err("empty input".to_string());
        }
        if self.ratio < 1.0 {
            return Err(format!("compression ratio {} below 1:1", self.ratio));
        }

        // One-pole envelope follower: 5 ms attack, 50 ms release
        let fs = self.sample_rate as f32;
        let attack = (-1.0 / (fs * 0.005)).exp();
        let release = (-1.0 / (fs * 0.050)).exp();

        let mut env = 0.0f32;
        let mut out = Vec::with_capacity(samples.len());
        for &s in samples {
            let level = s.abs();
            let coeff = if level > env { attack } else { release };
            env = coeff * env + (1.0 - coeff) * level;

            let gain = if env > self.threshold {
                (self.threshold + (env - self.threshold) / self.ratio) / env
            } else {
                1.0
            };
            out.push(s * gain);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::enhancement::profile::{ProcessingProfile, ProfileLevel};

    fn profile() -> ProcessingProfile {
        let cfg = AppConfig::default();
        ProcessingProfile::new(ProfileLevel::High, &cfg.enhancement, 16000)
    }

    fn sine(freq: f32, seconds: f32, amplitude: f32) -> Vec<f32> {
        let n = (16000.0 * seconds) as usize;
        (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn test_normalization_hits_target_and_is_idempotent() {
        let p = profile();
        let mut stage = build_stage(StageKind::Normalization, &p);
        let input = sine(440.0, 0.5, 0.25);

        let once = stage.apply(&input).unwrap();
        assert!((peak(&once) - 0.8).abs() < 1e-3);

        let twice = stage.apply(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalization_leaves_silence_alone() {
        let p = profile();
        let mut stage = build_stage(StageKind::Normalization, &p);
        let silence = vec![0.0f32; 4096];
        assert_eq!(stage.apply(&silence).unwrap(), silence);
    }

    #[test]
    fn test_noise_reduction_attenuates_noise_more_than_speech() {
        let p = profile();
        let mut stage = build_stage(StageKind::NoiseReduction, &p);

        // 1s of low-level pseudo-noise followed by 1s of strong tone
        let mut input: Vec<f32> = Vec::new();
        let mut seed = 0x2545f4914f6cdd1du64;
        for _ in 0..16000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            input.push(((seed >> 40) as f32 / 8388608.0 - 1.0) * 0.05);
        }
        input.extend(sine(300.0, 1.0, 0.6));

        let out = stage.apply(&input).unwrap();
        let noise_before = rms(&input[..16000]);
        let noise_after = rms(&out[..16000]);
        let speech_before = rms(&input[16000..]);
        let speech_after = rms(&out[16000..]);

        assert!(noise_after < noise_before * 0.5);
        assert!(speech_after > speech_before * 0.8);
    }

    #[test]
    fn test_voice_band_filter_passes_speech_rejects_rumble() {
        let p = profile();
        let mut stage = build_stage(StageKind::VoiceBandFilter, &p);

        let speech_tone = sine(300.0, 1.0, 0.5);
        let rumble = sine(20.0, 1.0, 0.5);

        let speech_out = stage.apply(&speech_tone).unwrap();
        let mut stage2 = build_stage(StageKind::VoiceBandFilter, &p);
        let rumble_out = stage2.apply(&rumble).unwrap();

        assert!(rms(&speech_out) > rms(&speech_tone) * 0.7);
        assert!(rms(&rumble_out) < rms(&rumble) * 0.3);
    }

    #[test]
    fn test_hpss_suppresses_clicks() {
        let p = profile();
        let mut stage = build_stage(StageKind::HarmonicPercussive, &p);

        // Smooth tone with a single full-scale click in the middle
        let mut input = sine(200.0, 0.25, 0.3);
        let mid = input.len() / 2;
        input[mid] = 1.0;

        let out = stage.apply(&input).unwrap();
        assert!(out[mid].abs() < 0.5);
        // The tone itself survives
        assert!(rms(&out) > rms(&input) * 0.5);
    }

    #[test]
    fn test_compression_reduces_loud_sections() {
        let p = profile();
        let mut stage = build_stage(StageKind::Compression, &p);

        let loud = sine(300.0, 0.5, 0.9);
        let quiet = sine(300.0, 0.5, 0.1);

        let loud_out = stage.apply(&loud).unwrap();
        let mut stage2 = build_stage(StageKind::Compression, &p);
        let quiet_out = stage2.apply(&quiet).unwrap();

        assert!(rms(&loud_out) < rms(&loud) * 0.8);
        // Below threshold: untouched
        assert!((rms(&quiet_out) - rms(&quiet)).abs() < 0.01);
    }

    #[test]
    fn test_stages_reject_empty_input() {
        let p = profile();
        for kind in &p.stages {
            let mut stage = build_stage(*kind, &p);
            assert!(stage.apply(&[]).is_err(), "{} accepted empty input", kind.name());
        }
    }

    #[test]
    fn test_stages_are_deterministic() {
        let p = profile();
        let input = sine(250.0, 0.5, 0.4);
        for kind in &p.stages {
            let mut a = build_stage(*kind, &p);
            let mut b = build_stage(*kind, &p);
            assert_eq!(a.apply(&input).unwrap(), b.apply(&input).unwrap());
        }
    }
}

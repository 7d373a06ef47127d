//! # Audio Buffer Assembler
//!
//! Reassembles ordered binary frames into complete utterances. Streaming is
//! best-effort: when a sequence gap is detected the missing frames are padded
//! with silence and the utterance is flagged, never re-requested.
//!
//! ## Completion Triggers:
//! 1. An explicit `utterance_end` control frame
//! 2. A silence timeout (sustained near-zero amplitude, default 1.5s)
//! 3. A maximum-duration cutoff (default 30s) to bound memory use
//!
//! On completion the assembler hands the utterance out by value and drops its
//! working buffer, so memory is released as soon as enhancement takes over.

use crate::audio::utterance::Utterance;
use tracing::{debug, warn};
use uuid::Uuid;

/// Amplitude below which a sample counts as silence for the timeout
/// heuristic (~1% of full scale).
const SILENCE_AMPLITUDE: i16 = 330;

/// Assembler tuning, derived from the protocol and audio configuration.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub sample_rate: u32,
    /// Samples per device frame; gaps are padded in units of this
    pub frame_samples: usize,
    pub silence_timeout_ms: u64,
    pub max_utterance_ms: u64,
}

impl AssemblerConfig {
    fn silence_timeout_samples(&self) -> usize {
        (self.silence_timeout_ms as usize * self.sample_rate as usize) / 1000
    }

    fn max_utterance_samples(&self) -> usize {
        (self.max_utterance_ms as usize * self.sample_rate as usize) / 1000
    }
}

/// Why an utterance was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTrigger {
    /// Device sent `utterance_end`
    EndSignal,
    /// Sustained near-zero amplitude
    SilenceTimeout,
    /// Hit the maximum duration cutoff
    MaxDuration,
}

/// State for the utterance currently being captured.
struct ActiveCapture {
    utterance: Utterance,
    /// Sequence number expected next; None until the first frame arrives
    expected_sequence: Option<u64>,
    /// Trailing run of near-silent samples, for the silence timeout
    trailing_silence: usize,
}

/// Per-session frame reassembler.
///
/// Owned by the session's connection handler, so all access is sequential;
/// no internal locking is needed.
pub struct BufferAssembler {
    config: AssemblerConfig,
    session_id: Uuid,
    active: Option<ActiveCapture>,
}

impl BufferAssembler {
    pub fn new(session_id: Uuid, config: AssemblerConfig) -> Self {
        Self {
            config,
            session_id,
            active: None,
        }
    }

    /// Whether an utterance is currently being captured.
    pub fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the in-flight utterance, if any.
    pub fn current_utterance_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.utterance.id)
    }

    /// Begin a new utterance.
    ///
    /// Returns an error if one is already being captured: the protocol allows
    /// at most one active utterance per session, and a second concurrent
    /// start is a protocol violation the caller reports to the device.
    pub fn begin_utterance(&mut self) -> Result<Uuid, String> {
        if self.active.is_some() {
            return Err("an utterance is already being captured".to_string());
        }

        let utterance = Utterance::new(self.session_id);
        let id = utterance.id;
        self.active = Some(ActiveCapture {
            utterance,
            expected_sequence: None,
            trailing_silence: 0,
        });

        debug!(session_id = %self.session_id, utterance_id = %id, "utterance capture started");
        Ok(id)
    }

    /// Feed one decoded audio frame.
    ///
    /// Returns `Some((utterance, trigger))` when a completion trigger fired,
    /// `None` while capture continues.
    ///
    /// ## Edge Cases:
    /// - A frame with a stale or repeated sequence number is rejected
    ///   (sequence numbers are strictly increasing per session)
    /// - A gap of k frames is padded with k·frame_samples zeros and sets
    ///   `gap_detected`; processing continues
    pub fn push_frame(
        &mut self,
        sequence: u64,
        samples: &[i16],
    ) -> Result<Option<(Utterance, CompletionTrigger)>, String> {
        let capture = self
            .active
            .as_mut()
            .ok_or_else(|| "audio frame received outside an utterance".to_string())?;

        match capture.expected_sequence {
            None => {
                // First frame of the talk event establishes the base
                capture.expected_sequence = Some(sequence + 1);
            }
            Some(expected) => {
                if sequence < expected {
                    return Err(format!(
                        "stale sequence number {} (expected {})",
                        sequence, expected
                    ));
                }
                if sequence > expected {
                    let missing = (sequence - expected) as usize;
                    Self::pad_gap(&self.config, capture, missing);
                }
                capture.expected_sequence = Some(sequence + 1);
            }
        }

        Self::append_samples(capture, samples);

        // Silence timeout: sustained near-zero amplitude ends the utterance
        if capture.trailing_silence >= self.config.silence_timeout_samples()
            && capture.utterance.samples.len() > capture.trailing_silence
        {
            debug!(
                session_id = %self.session_id,
                utterance_id = %capture.utterance.id,
                "silence timeout reached"
            );
            return Ok(self
                .active
                .take()
                .map(|c| self.seal(c, CompletionTrigger::SilenceTimeout)));
        }

        // Maximum duration cutoff bounds memory per utterance
        if capture.utterance.samples.len() >= self.config.max_utterance_samples() {
            warn!(
                session_id = %self.session_id,
                utterance_id = %capture.utterance.id,
                "utterance hit the maximum duration cutoff"
            );
            return Ok(self
                .active
                .take()
                .map(|c| self.seal(c, CompletionTrigger::MaxDuration)));
        }

        Ok(None)
    }

    /// Handle the device's `utterance_end` control frame.
    ///
    /// `last_sequence` lets the assembler pad a trailing gap when the final
    /// frames were dropped on the way here.
    pub fn end_utterance(
        &mut self,
        last_sequence: Option<u64>,
    ) -> Result<(Utterance, CompletionTrigger), String> {
        let mut capture = self
            .active
            .take()
            .ok_or_else(|| "utterance_end without an active utterance".to_string())?;

        if let (Some(last), Some(expected)) = (last_sequence, capture.expected_sequence) {
            if last + 1 > expected {
                let missing = (last + 1 - expected) as usize;
                Self::pad_gap(&self.config, &mut capture, missing);
            }
        }

        Ok(self.seal(capture, CompletionTrigger::EndSignal))
    }

    /// Abandon the in-flight utterance (transport loss, session expiry).
    ///
    /// Returns the failed utterance for logging, or None if nothing was
    /// being captured.
    pub fn abort(&mut self) -> Option<Utterance> {
        self.active.take().map(|mut capture| {
            capture.utterance.fail();
            capture.utterance
        })
    }

    fn pad_gap(config: &AssemblerConfig, capture: &mut ActiveCapture, missing_frames: usize) {
        let pad = missing_frames * config.frame_samples;
        capture
            .utterance
            .samples
            .extend(std::iter::repeat(0i16).take(pad));
        capture.trailing_silence += pad;
        capture.utterance.gap_detected = true;
        warn!(
            utterance_id = %capture.utterance.id,
            missing_frames,
            padded_samples = pad,
            "sequence gap padded with silence"
        );
    }

    fn append_samples(capture: &mut ActiveCapture, samples: &[i16]) {
        for &sample in samples {
            if sample.abs() <= SILENCE_AMPLITUDE {
                capture.trailing_silence += 1;
            } else {
                capture.trailing_silence = 0;
            }
        }
        capture.utterance.samples.extend_from_slice(samples);
    }

    /// Seal a capture taken out of the assembler.
    fn seal(&self, mut capture: ActiveCapture, trigger: CompletionTrigger) -> (Utterance, CompletionTrigger) {
        capture.utterance.complete();
        debug!(
            session_id = %self.session_id,
            utterance_id = %capture.utterance.id,
            samples = capture.utterance.samples.len(),
            gap_detected = capture.utterance.gap_detected,
            ?trigger,
            "utterance sealed"
        );
        (capture.utterance, trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::utterance::UtteranceState;

    fn test_config() -> AssemblerConfig {
        AssemblerConfig {
            sample_rate: 16000,
            frame_samples: 1024,
            silence_timeout_ms: 1500,
            max_utterance_ms: 30_000,
        }
    }

    fn voiced_frame(len: usize) -> Vec<i16> {
        // Alternating loud samples so the silence detector never trips
        (0..len)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect()
    }

    /// Lossless reassembly: an in-order, gap-free sequence yields exactly the
    /// sum of the received payload lengths.
    #[test]
    fn test_lossless_reassembly() {
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), test_config());
        assembler.begin_utterance().unwrap();

        for seq in 0..5u64 {
            let done = assembler.push_frame(seq, &voiced_frame(1024)).unwrap();
            assert!(done.is_none());
        }

        let (utterance, trigger) = assembler.end_utterance(Some(4)).unwrap();
        assert_eq!(trigger, CompletionTrigger::EndSignal);
        assert_eq!(utterance.samples.len(), 5 * 1024);
        assert_eq!(utterance.state, UtteranceState::Complete);
        assert!(!utterance.gap_detected);
    }

    /// `utterance_end` with nothing in flight is an error, including right
    /// after a successful end has already drained the capture.
    #[test]
    fn test_end_without_active_utterance_is_rejected() {
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), test_config());
        assert!(assembler.end_utterance(None).is_err());

        assembler.begin_utterance().unwrap();
        assembler.push_frame(0, &voiced_frame(1024)).unwrap();
        assert!(assembler.end_utterance(Some(0)).is_ok());
        assert!(assembler.end_utterance(Some(0)).is_err());
    }

    /// A gap of k frames is padded with k·frame_samples zeros and flagged.
    #[test]
    fn test_gap_padding() {
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), test_config());
        assembler.begin_utterance().unwrap();

        assembler.push_frame(0, &voiced_frame(1024)).unwrap();
        assembler.push_frame(1, &voiced_frame(1024)).unwrap();
        // Frames 2, 3, 4 lost in transit
        assembler.push_frame(5, &voiced_frame(1024)).unwrap();

        let (utterance, _) = assembler.end_utterance(Some(5)).unwrap();
        assert!(utterance.gap_detected);
        assert_eq!(utterance.samples.len(), 6 * 1024);
        // The padded region is exactly zeros
        let padded = &utterance.samples[2 * 1024..5 * 1024];
        assert!(padded.iter().all(|&s| s == 0));
    }

    /// Trailing drop: `utterance_end` reports a last sequence beyond what
    /// arrived, and the tail is padded.
    #[test]
    fn test_trailing_gap_padded_on_end() {
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), test_config());
        assembler.begin_utterance().unwrap();
        assembler.push_frame(0, &voiced_frame(1024)).unwrap();

        let (utterance, _) = assembler.end_utterance(Some(2)).unwrap();
        assert!(utterance.gap_detected);
        assert_eq!(utterance.samples.len(), 3 * 1024);
    }

    /// Stale sequence numbers are rejected.
    #[test]
    fn test_stale_sequence_rejected() {
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), test_config());
        assembler.begin_utterance().unwrap();
        assembler.push_frame(3, &voiced_frame(1024)).unwrap();
        assert!(assembler.push_frame(3, &voiced_frame(1024)).is_err());
        assert!(assembler.push_frame(1, &voiced_frame(1024)).is_err());
    }

    /// Sustained near-zero amplitude seals the utterance.
    #[test]
    fn test_silence_timeout() {
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), test_config());
        assembler.begin_utterance().unwrap();
        assembler.push_frame(0, &voiced_frame(1024)).unwrap();

        // 1.5s at 16kHz is 24000 samples; feed silent frames until sealed
        let silent = vec![0i16; 1024];
        let mut sealed = None;
        for seq in 1..40u64 {
            if let Some(done) = assembler.push_frame(seq, &silent).unwrap() {
                sealed = Some(done);
                break;
            }
        }

        let (utterance, trigger) = sealed.expect("silence timeout should have sealed");
        assert_eq!(trigger, CompletionTrigger::SilenceTimeout);
        assert_eq!(utterance.state, UtteranceState::Complete);
    }

    /// The maximum duration cutoff bounds utterance length.
    #[test]
    fn test_max_duration_cutoff() {
        let mut config = test_config();
        config.max_utterance_ms = 1_000; // 16000 samples for a fast test
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), config);
        assembler.begin_utterance().unwrap();

        let mut sealed = None;
        for seq in 0..40u64 {
            if let Some(done) = assembler.push_frame(seq, &voiced_frame(1024)).unwrap() {
                sealed = Some(done);
                break;
            }
        }

        let (_, trigger) = sealed.expect("cutoff should have sealed");
        assert_eq!(trigger, CompletionTrigger::MaxDuration);
    }

    /// Only one active utterance per session.
    #[test]
    fn test_duplicate_start_rejected() {
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), test_config());
        assembler.begin_utterance().unwrap();
        assert!(assembler.begin_utterance().is_err());
    }

    /// Aborting marks the in-flight utterance failed.
    #[test]
    fn test_abort_marks_failed() {
        let mut assembler = BufferAssembler::new(Uuid::new_v4(), test_config());
        assembler.begin_utterance().unwrap();
        assembler.push_frame(0, &voiced_frame(1024)).unwrap();

        let failed = assembler.abort().expect("abort should return the utterance");
        assert_eq!(failed.state, UtteranceState::Failed);
        assert!(!assembler.is_capturing());
        assert!(assembler.abort().is_none());
    }
}

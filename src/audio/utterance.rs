//! # Utterance Model
//!
//! One complete captured speech unit, from talk-start to end-of-talk signal.
//! An utterance is created on the first audio frame of a talk event and
//! destroyed once its enhancement result is dispatched or it fails.
//!
//! ## Lifecycle:
//! capturing → complete → enhancing → enhanced
//!                 ↘ failed (from any state)

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Current state of an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceState {
    /// Frames are still arriving
    Capturing,
    /// Reassembly finished, waiting for the enhancement pool
    Complete,
    /// Running through the enhancement pipeline
    Enhancing,
    /// Enhancement finished, result dispatched downstream
    Enhanced,
    /// Abandoned: transport loss, expiry, or upstream failure
    Failed,
}

impl UtteranceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UtteranceState::Capturing => "capturing",
            UtteranceState::Complete => "complete",
            UtteranceState::Enhancing => "enhancing",
            UtteranceState::Enhanced => "enhanced",
            UtteranceState::Failed => "failed",
        }
    }
}

/// A reassembled (or still-capturing) utterance.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: Uuid,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Ordered PCM samples, gaps already zero-padded
    pub samples: Vec<i16>,
    pub state: UtteranceState,
    /// True when at least one sequence gap was padded during reassembly
    pub gap_detected: bool,
}

impl Utterance {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            started_at: Utc::now(),
            ended_at: None,
            samples: Vec::new(),
            state: UtteranceState::Capturing,
            gap_detected: false,
        }
    }

    /// Seal the utterance after its final frame.
    pub fn complete(&mut self) {
        self.state = UtteranceState::Complete;
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self) {
        self.state = UtteranceState::Failed;
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn duration_seconds(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utterance_lifecycle() {
        let mut utt = Utterance::new(Uuid::new_v4());
        assert_eq!(utt.state, UtteranceState::Capturing);
        assert!(utt.ended_at.is_none());

        utt.samples = vec![0i16; 16000];
        utt.complete();
        assert_eq!(utt.state, UtteranceState::Complete);
        assert!(utt.ended_at.is_some());
        assert!((utt.duration_seconds(16000) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fail_keeps_end_timestamp() {
        let mut utt = Utterance::new(Uuid::new_v4());
        utt.complete();
        let ended = utt.ended_at;
        utt.fail();
        assert_eq!(utt.state, UtteranceState::Failed);
        assert_eq!(utt.ended_at, ended);
    }
}

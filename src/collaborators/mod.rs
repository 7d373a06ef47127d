//! # Voice Collaborators
//!
//! Trait seams for the downstream services an enhanced utterance flows
//! through: speech-to-text, emotion analysis, response generation, and
//! text-to-speech, plus device authentication at handshake time.
//!
//! The gateway only ever talks to these traits. The bundled stubs are
//! deterministic stand-ins wired up by default so the full device round trip
//! works end to end without any external service.
//!
//! ## Failure policy:
//! Upstream errors get exactly one retry after a short backoff. If the retry
//! also fails, the caller reports `upstream_unavailable` to the device and
//! the utterance is marked failed; the session itself stays up.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Backoff before the single retry of a failed upstream call.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Transcription of an utterance.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

/// Detected emotional tone of an utterance.
#[derive(Debug, Clone)]
pub struct EmotionReading {
    pub primary: String,
    pub confidence: f32,
}

/// Synthesized reply audio, in the device's PCM format.
#[derive(Debug, Clone)]
pub struct ReplyAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> AppResult<Transcript>;
}

#[async_trait]
pub trait EmotionAnalyzer: Send + Sync {
    async fn analyze(&self, samples: &[i16], transcript: &str) -> AppResult<EmotionReading>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn respond(
        &self,
        device_id: &str,
        transcript: &Transcript,
        emotion: &EmotionReading,
    ) -> AppResult<String>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str, sample_rate: u32) -> AppResult<ReplyAudio>;
}

/// Validates device credentials during the handshake.
#[async_trait]
pub trait DeviceAuthenticator: Send + Sync {
    /// `Ok(false)` means the credentials were rejected; `Err` means the
    /// authority itself could not be reached.
    async fn authenticate(&self, device_id: &str, token: &str) -> AppResult<bool>;
}

/// Run an upstream call with the single-retry policy.
///
/// Only `AppError::Upstream` is retried; anything else is a caller bug or a
/// permanent condition where retrying cannot help.
pub async fn with_retry<T, F, Fut>(service: &str, mut call: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    match call().await {
        Ok(v) => Ok(v),
        Err(AppError::Upstream { message, .. }) => {
            warn!(service, error = %message, "Upstream call failed, retrying once");
            tokio::time::sleep(RETRY_BACKOFF).await;
            call().await
        }
        Err(e) => Err(e),
    }
}

/// The full set of collaborators a gateway instance is wired with.
#[derive(Clone)]
pub struct CollaboratorSet {
    pub stt: Arc<dyn SpeechToText>,
    pub emotion: Arc<dyn EmotionAnalyzer>,
    pub responder: Arc<dyn ResponseGenerator>,
    pub tts: Arc<dyn TextToSpeech>,
    pub authenticator: Arc<dyn DeviceAuthenticator>,
}

impl CollaboratorSet {
    /// Default wiring: the deterministic stubs.
    pub fn stubs() -> Self {
        Self {
            stt: Arc::new(StubSpeechToText),
            emotion: Arc::new(StubEmotionAnalyzer),
            responder: Arc::new(StubResponseGenerator),
            tts: Arc::new(StubTextToSpeech),
            authenticator: Arc::new(StubAuthenticator),
        }
    }

    /// Run one enhanced utterance through the whole collaborator chain and
    /// produce the reply audio to stream back.
    pub async fn run_voice_round(
        &self,
        device_id: &str,
        samples: &[i16],
        sample_rate: u32,
    ) -> AppResult<ReplyAudio> {
        let transcript =
            with_retry("speech_to_text", || self.stt.transcribe(samples, sample_rate)).await?;
        let emotion = with_retry("emotion_analyzer", || {
            self.emotion.analyze(samples, &transcript.text)
        })
        .await?;
        let reply_text = with_retry("response_generator", || {
            self.responder.respond(device_id, &transcript, &emotion)
        })
        .await?;
        with_retry("text_to_speech", || {
            self.tts.synthesize(&reply_text, sample_rate)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Deterministic stubs
// ---------------------------------------------------------------------------

fn mean_abs_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|s| (*s as f64).abs()).sum();
    (sum / samples.len() as f64 / 32768.0) as f32
}

pub struct StubSpeechToText;

#[async_trait]
impl SpeechToText for StubSpeechToText {
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> AppResult<Transcript> {
        if samples.is_empty() {
            return Err(AppError::ValidationError(
                "cannot transcribe an empty utterance".to_string(),
            ));
        }
        let seconds = samples.len() as f32 / sample_rate.max(1) as f32;
        let text = if seconds < 2.0 {
            "hello there"
        } else if seconds < 10.0 {
            "tell me a story please"
        } else {
            "once upon a time there was a little bear who lived in the woods"
        };
        Ok(Transcript {
            text: text.to_string(),
            confidence: (0.5 + mean_abs_level(samples)).min(0.99),
        })
    }
}

pub struct StubEmotionAnalyzer;

#[async_trait]
impl EmotionAnalyzer for StubEmotionAnalyzer {
    async fn analyze(&self, samples: &[i16], _transcript: &str) -> AppResult<EmotionReading> {
        let level = mean_abs_level(samples);
        let primary = if level > 0.3 {
            "excited"
        } else if level > 0.05 {
            "calm"
        } else {
            "quiet"
        };
        Ok(EmotionReading {
            primary: primary.to_string(),
            confidence: 0.7,
        })
    }
}

pub struct StubResponseGenerator;

#[async_trait]
impl ResponseGenerator for StubResponseGenerator {
    async fn respond(
        &self,
        _device_id: &str,
        transcript: &Transcript,
        emotion: &EmotionReading,
    ) -> AppResult<String> {
        Ok(format!(
            "You sound {}! You said: {}",
            emotion.primary, transcript.text
        ))
    }
}

pub struct StubTextToSpeech;

#[async_trait]
impl TextToSpeech for StubTextToSpeech {
    async fn synthesize(&self, text: &str, sample_rate: u32) -> AppResult<ReplyAudio> {
        if text.is_empty() {
            return Err(AppError::ValidationError(
                "cannot synthesize empty text".to_string(),
            ));
        }
        // One soft tone per word, pitch varied by word length
        let word_samples = (sample_rate as usize) / 5;
        let mut samples = Vec::new();
        for word in text.split_whitespace() {
            let freq = 220.0 + (word.len() % 8) as f32 * 55.0;
            for i in 0..word_samples {
                let t = i as f32 / sample_rate as f32;
                let fade = (1.0 - i as f32 / word_samples as f32).max(0.0);
                let s = 0.3 * fade * (2.0 * std::f32::consts::PI * freq * t).sin();
                samples.push((s * 32767.0) as i16);
            }
        }
        Ok(ReplyAudio {
            samples,
            sample_rate,
        })
    }
}

pub struct StubAuthenticator;

#[async_trait]
impl DeviceAuthenticator for StubAuthenticator {
    async fn authenticate(&self, _device_id: &str, token: &str) -> AppResult<bool> {
        Ok(!token.trim().is_empty())
    }
}

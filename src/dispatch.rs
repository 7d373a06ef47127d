//! # Response Dispatcher
//!
//! Streams synthesized reply audio back to a device in playback-buffer-sized
//! frames, paced at real time so the device's small buffer never overruns.
//!
//! ## Barge-in:
//! The dispatcher owns nothing but a cancellation flag. When the session
//! actor sees a new `utterance_start` mid-reply it flips the flag; the
//! dispatcher notices on its next frame boundary, so playback stops within
//! one frame interval. The closing `tts_audio_end` always goes out, with
//! `interrupted` set, so the device knows the reply was cut rather than
//! finished.

use crate::collaborators::ReplyAudio;
use crate::protocol::{encode_reply_frame, GatewayMessage};
use crate::state::GatewayMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// What the dispatcher emits; the session actor forwards these onto the
/// WebSocket as text and binary frames respectively.
#[derive(Debug)]
pub enum DispatchEvent {
    Control(GatewayMessage),
    Audio(Vec<u8>),
}

/// Cancellation handle for an in-flight reply.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    cancel: Arc<AtomicBool>,
}

impl DispatchHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Start streaming a reply. Events arrive on `sink`; the task ends after the
/// closing `tts_audio_end` is emitted.
pub fn start_dispatch(
    utterance_id: Uuid,
    reply: ReplyAudio,
    frame_samples: usize,
    sink: mpsc::UnboundedSender<DispatchEvent>,
    metrics: Arc<GatewayMetrics>,
) -> (DispatchHandle, JoinHandle<()>) {
    let cancel = Arc::new(AtomicBool::new(false));
    let handle = DispatchHandle {
        cancel: Arc::clone(&cancel),
    };

    let frame_samples = frame_samples.max(1);
    let frame_interval =
        Duration::from_micros(frame_samples as u64 * 1_000_000 / reply.sample_rate.max(1) as u64);

    let task = tokio::spawn(async move {
        let total_samples = reply.samples.len();
        let _ = sink.send(DispatchEvent::Control(GatewayMessage::TtsAudioStart {
            utterance_id,
            sample_rate: reply.sample_rate,
            frame_samples,
            total_samples,
        }));

        let mut frames_sent = 0usize;
        let mut interrupted = false;
        for chunk in reply.samples.chunks(frame_samples) {
            if cancel.load(Ordering::Relaxed) {
                interrupted = true;
                break;
            }
            if sink.send(DispatchEvent::Audio(encode_reply_frame(chunk))).is_err() {
                // Session actor is gone; nothing left to pace for
                interrupted = true;
                break;
            }
            frames_sent += 1;
            tokio::time::sleep(frame_interval).await;
        }

        if interrupted {
            GatewayMetrics::incr(&metrics.responses_barged_in);
        }
        let _ = sink.send(DispatchEvent::Control(GatewayMessage::TtsAudioEnd {
            utterance_id,
            frames_sent,
            interrupted,
        }));
        debug!(%utterance_id, frames_sent, interrupted, "Reply dispatch finished");
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(samples: usize, sample_rate: u32) -> ReplyAudio {
        ReplyAudio {
            samples: (0..samples).map(|i| (i % 100) as i16).collect(),
            sample_rate,
        }
    }

    async fn collect(
        mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
        task: JoinHandle<()>,
    ) -> Vec<DispatchEvent> {
        task.await.unwrap();
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_full_reply_is_framed_and_bracketed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(GatewayMetrics::default());
        let id = Uuid::new_v4();

        // High sample rate keeps the pacing interval tiny in tests
        let (_handle, task) = start_dispatch(id, reply(2500, 1_000_000), 1024, tx, metrics);
        let events = collect(rx, task).await;

        assert!(matches!(
            events.first(),
            Some(DispatchEvent::Control(GatewayMessage::TtsAudioStart { total_samples: 2500, .. }))
        ));
        let audio_frames: Vec<&Vec<u8>> = events
            .iter()
            .filter_map(|e| match e {
                DispatchEvent::Audio(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(audio_frames.len(), 3); // 1024 + 1024 + 452
        assert_eq!(audio_frames[0].len(), 2048);
        assert_eq!(audio_frames[2].len(), 452 * 2);

        match events.last() {
            Some(DispatchEvent::Control(GatewayMessage::TtsAudioEnd {
                frames_sent,
                interrupted,
                ..
            })) => {
                assert_eq!(*frames_sent, 3);
                assert!(!*interrupted);
            }
            other => panic!("expected tts_audio_end, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_within_a_frame() {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(GatewayMetrics::default());
        let id = Uuid::new_v4();

        // 16 kHz, 1024-sample frames: 64 ms per frame, 100 frames total
        let (handle, task) = start_dispatch(
            id,
            reply(1024 * 100, 16000),
            1024,
            tx,
            Arc::clone(&metrics),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let events = collect(rx, task).await;
        let audio_count = events
            .iter()
            .filter(|e| matches!(e, DispatchEvent::Audio(_)))
            .count();
        // Far fewer than the 100 frames of the full reply
        assert!(audio_count < 10, "sent {} frames after cancel", audio_count);

        match events.last() {
            Some(DispatchEvent::Control(GatewayMessage::TtsAudioEnd { interrupted, .. })) => {
                assert!(*interrupted);
            }
            other => panic!("expected tts_audio_end, got {:?}", other),
        }
        assert_eq!(GatewayMetrics::get(&metrics.responses_barged_in), 1);
    }
}

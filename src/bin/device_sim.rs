//! # Device Simulator
//!
//! Stands in for real hardware during development: connects to a running
//! gateway, performs the handshake, and streams a few synthetic talk events
//! (tone bursts with pseudo-noise, like a child speaking in a playroom),
//! then prints the round-trip counters.
//!
//! ## Environment:
//! - `GATEWAY_URL`: base URL (default `ws://127.0.0.1:8080`)
//! - `DEVICE_ID`: hardware identifier (default `bear-sim-01`)
//! - `AUTH_TOKEN`: credential presented at handshake (default `dev-token`)
//! - `SIM_UTTERANCES`: talk events to run (default 3)
//! - `SIM_PROFILE`: enhancement profile to request (default `high`)

use anyhow::Result;
use companion_device_backend::device::{
    CaptureRing, DeviceClientConfig, DeviceStreamingClient, TalkEvent,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SAMPLE_RATE: u32 = 16000;
const FRAME_SAMPLES: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "device_sim=info,companion_device_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let gateway_url =
        env::var("GATEWAY_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080".to_string());
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "bear-sim-01".to_string());
    let auth_token = env::var("AUTH_TOKEN").unwrap_or_else(|_| "dev-token".to_string());
    let profile = env::var("SIM_PROFILE").unwrap_or_else(|_| "high".to_string());
    let utterances: u32 = env::var("SIM_UTTERANCES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3);

    info!(
        gateway_url = %gateway_url,
        device_id = %device_id,
        utterances,
        "Starting device simulator"
    );

    let ring = Arc::new(CaptureRing::new(64));
    let client = DeviceStreamingClient::new(
        DeviceClientConfig {
            gateway_url,
            device_id,
            firmware_version: "sim-0.3.0".to_string(),
            auth_token,
            preferred_profile: Some(profile),
            sample_rate: SAMPLE_RATE,
            heartbeat_interval: Duration::from_secs(15),
            grace_window: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        },
        Arc::clone(&ring),
    );

    let (talk_tx, talk_rx) = mpsc::channel(8);
    let capture = tokio::spawn(capture_loop(ring, talk_tx, utterances));
    let stats = client.run(talk_rx).await?;
    capture.await?;

    info!(
        frames_sent = stats.frames_sent,
        acks = stats.acks_received,
        reply_frames = stats.reply_frames_received,
        errors = stats.errors_received,
        reconnects = stats.reconnects,
        "Simulation finished"
    );
    Ok(())
}

/// Produce `utterances` synthetic talk events, pacing frames at the capture
/// rate like real firmware would.
async fn capture_loop(ring: Arc<CaptureRing>, talk_tx: mpsc::Sender<TalkEvent>, utterances: u32) {
    let frame_interval =
        Duration::from_micros(FRAME_SAMPLES as u64 * 1_000_000 / SAMPLE_RATE as u64);
    let mut noise_seed = 0x853c49e6748fea9bu64;

    for n in 0..utterances {
        // Idle pause between talk events
        tokio::time::sleep(Duration::from_secs(2)).await;

        if talk_tx.send(TalkEvent::Start).await.is_err() {
            return;
        }

        // ~2 seconds of "speech": tone burst plus low-level noise
        let frames = (2 * SAMPLE_RATE as usize) / FRAME_SAMPLES;
        let freq = 220.0 + 40.0 * n as f32;
        for f in 0..frames {
            let frame: Vec<i16> = (0..FRAME_SAMPLES)
                .map(|i| {
                    noise_seed = noise_seed
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    let noise = ((noise_seed >> 40) as f32 / 8388608.0 - 1.0) * 0.03;
                    let t = (f * FRAME_SAMPLES + i) as f32 / SAMPLE_RATE as f32;
                    let tone = 0.4 * (2.0 * std::f32::consts::PI * freq * t).sin();
                    (((tone + noise).clamp(-1.0, 1.0)) * 32767.0) as i16
                })
                .collect();
            ring.push(frame);
            tokio::time::sleep(frame_interval).await;
        }

        if talk_tx.send(TalkEvent::End).await.is_err() {
            return;
        }

        // Leave room for the reply to stream back before the next event
        tokio::time::sleep(Duration::from_secs(6)).await;
    }

    let _ = talk_tx.send(TalkEvent::Shutdown).await;
}

//! # Device Streaming Client
//!
//! The device half of the streaming protocol, used by the simulator and by
//! integration rigs. Maintains one WebSocket to the gateway, performs the
//! metadata handshake, forwards captured frames with sequence numbers, and
//! reconnects with capped exponential backoff when the transport drops.
//!
//! ## Resumption:
//! The client remembers its session id and the moment it lost the
//! connection. When it reconnects inside the grace window it asks for the
//! old session back; past the window it starts clean.

use crate::device::capture::CaptureRing;
use crate::error::{AppError, AppResult};
use crate::protocol::{encode_audio_frame, DeviceMessage, GatewayMessage, HandshakeMetadata};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
    Reconnecting,
    Closed,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Handshaking => "handshaking",
            ClientState::Streaming => "streaming",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Closed => "closed",
        }
    }
}

/// Capped exponential backoff for reconnects.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: base · 2^n, capped.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u64 << self.attempt.min(30);
        let delay = self
            .base
            .checked_mul(factor as u32)
            .unwrap_or(self.cap)
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Resumption bookkeeping across reconnects.
#[derive(Debug, Clone, Default)]
struct ResumeState {
    session_id: Option<Uuid>,
    disconnected_at: Option<Instant>,
}

impl ResumeState {
    /// Session id to present at handshake, if still inside the grace window.
    fn resumable(&self, grace_window: Duration, now: Instant) -> Option<Uuid> {
        let lost = self.disconnected_at?;
        if now.duration_since(lost) < grace_window {
            self.session_id
        } else {
            None
        }
    }
}

/// A talk event from the device's button or wake-word detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkEvent {
    /// Push-to-talk pressed: start an utterance
    Start,
    /// Released: finish the utterance
    End,
    /// Shut the client down cleanly
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct DeviceClientConfig {
    /// Gateway base URL, e.g. `ws://127.0.0.1:8080`
    pub gateway_url: String,
    pub device_id: String,
    pub firmware_version: String,
    pub auth_token: String,
    pub preferred_profile: Option<String>,
    pub sample_rate: u32,
    pub heartbeat_interval: Duration,
    /// Mirrors the gateway's grace window; asking to resume after it would
    /// only earn a refusal
    pub grace_window: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl DeviceClientConfig {
    fn endpoint(&self) -> String {
        format!("{}/ws/device/{}", self.gateway_url, self.device_id)
    }
}

/// Counters the simulator prints on exit.
#[derive(Debug, Default, Clone)]
pub struct ClientStats {
    pub frames_sent: u64,
    pub acks_received: u64,
    pub reply_frames_received: u64,
    pub errors_received: u64,
    pub reconnects: u64,
}

pub struct DeviceStreamingClient {
    config: DeviceClientConfig,
    ring: Arc<CaptureRing>,
    state: ClientState,
    resume: ResumeState,
    sequence: u64,
    talking: bool,
    stats: ClientStats,
}

impl DeviceStreamingClient {
    pub fn new(config: DeviceClientConfig, ring: Arc<CaptureRing>) -> Self {
        Self {
            config,
            ring,
            state: ClientState::Disconnected,
            resume: ResumeState::default(),
            sequence: 0,
            talking: false,
            stats: ClientStats::default(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Run until `TalkEvent::Shutdown` arrives or the talk channel closes.
    pub async fn run(mut self, mut talk_rx: mpsc::Receiver<TalkEvent>) -> AppResult<ClientStats> {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_cap);

        loop {
            self.state = if self.stats.reconnects > 0 {
                ClientState::Reconnecting
            } else {
                ClientState::Connecting
            };

            let mut ws = match self.connect_and_handshake().await {
                Ok(ws) => ws,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        device_id = %self.config.device_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection attempt failed"
                    );
                    self.stats.reconnects += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            backoff.reset();
            self.state = ClientState::Streaming;

            match self.stream(&mut ws, &mut talk_rx).await {
                StreamOutcome::Shutdown => {
                    let _ = ws.close(None).await;
                    self.state = ClientState::Closed;
                    info!(device_id = %self.config.device_id, "Client shut down");
                    return Ok(self.stats);
                }
                StreamOutcome::TransportLost => {
                    self.resume.disconnected_at = Some(Instant::now());
                    self.talking = false;
                    self.stats.reconnects += 1;
                    info!(device_id = %self.config.device_id, "Transport lost, will reconnect");
                }
            }
        }
    }

    async fn connect_and_handshake(&mut self) -> AppResult<WsConnection> {
        let endpoint = self.config.endpoint();
        let (mut ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| AppError::Transport(format!("connect to {}: {}", endpoint, e)))?;

        self.state = ClientState::Handshaking;
        let metadata = DeviceMessage::Metadata(HandshakeMetadata {
            device_id: self.config.device_id.clone(),
            firmware_version: self.config.firmware_version.clone(),
            sample_rate: self.config.sample_rate,
            bit_depth: 16,
            preferred_profile: self.config.preferred_profile.clone(),
            resume_session_id: self
                .resume
                .resumable(self.config.grace_window, Instant::now()),
            auth_token: self.config.auth_token.clone(),
        });
        let json = serde_json::to_string(&metadata)?;
        ws.send(WsMessage::Text(json))
            .await
            .map_err(|e| AppError::Transport(format!("send metadata: {}", e)))?;

        // The gateway enforces its own handshake deadline; mirror it loosely
        let ready = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<GatewayMessage>(&text) {
                            Ok(GatewayMessage::SessionReady {
                                session_id,
                                resumed,
                                profile,
                                ..
                            }) => return Ok((session_id, resumed, profile)),
                            Ok(GatewayMessage::Error { code, message, .. }) => {
                                return Err(AppError::Protocol(format!("{}: {}", code, message)))
                            }
                            _ => {}
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        return Err(AppError::Transport(format!(
                            "closed during handshake: {:?}",
                            frame
                        )))
                    }
                    Err(e) => return Err(AppError::Transport(e.to_string())),
                    _ => {}
                }
            }
            Err(AppError::Transport("connection ended during handshake".to_string()))
        })
        .await
        .map_err(|_| AppError::Transport("handshake timed out".to_string()))??;

        let (session_id, resumed, profile) = ready;
        info!(
            device_id = %self.config.device_id,
            %session_id,
            resumed,
            profile = %profile,
            "Session ready"
        );
        self.resume.session_id = Some(session_id);
        self.resume.disconnected_at = None;
        if !resumed {
            self.sequence = 0;
        }
        Ok(ws)
    }

    async fn stream(
        &mut self,
        ws: &mut WsConnection,
        talk_rx: &mut mpsc::Receiver<TalkEvent>,
    ) -> StreamOutcome {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Drain cadence well under a frame duration so the ring stays shallow
        let mut drain = tokio::time::interval(Duration::from_millis(20));
        drain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // A connection that stops echoing heartbeats is dead even if the
        // socket never errors; three silent intervals force a reconnect.
        let silence_limit = self.config.heartbeat_interval * 3;
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                event = talk_rx.recv() => {
                    match event {
                        Some(TalkEvent::Start) => {
                            if self.send_control(ws, &DeviceMessage::UtteranceStart {
                                timestamp: unix_millis(),
                            }).await.is_err() {
                                return StreamOutcome::TransportLost;
                            }
                            self.talking = true;
                        }
                        Some(TalkEvent::End) => {
                            // Flush whatever capture produced before the release
                            if self.drain_ring(ws).await.is_err() {
                                return StreamOutcome::TransportLost;
                            }
                            let last = self.sequence.saturating_sub(1);
                            if self.send_control(ws, &DeviceMessage::UtteranceEnd {
                                last_sequence: last,
                            }).await.is_err() {
                                return StreamOutcome::TransportLost;
                            }
                            self.talking = false;
                        }
                        Some(TalkEvent::Shutdown) | None => return StreamOutcome::Shutdown,
                    }
                }
                _ = drain.tick() => {
                    if self.talking && self.drain_ring(ws).await.is_err() {
                        return StreamOutcome::TransportLost;
                    }
                }
                _ = heartbeat.tick() => {
                    if !self.talking && last_rx.elapsed() > silence_limit {
                        warn!(
                            device_id = %self.config.device_id,
                            silent_ms = last_rx.elapsed().as_millis() as u64,
                            "No traffic from gateway, treating connection as dead"
                        );
                        return StreamOutcome::TransportLost;
                    }
                    if !self.talking {
                        if self.send_control(ws, &DeviceMessage::Heartbeat {
                            timestamp: unix_millis(),
                        }).await.is_err() {
                            return StreamOutcome::TransportLost;
                        }
                    }
                }
                msg = ws.next() => {
                    last_rx = Instant::now();
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => self.handle_gateway_text(&text),
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            // Reply audio; a real device would feed its DAC here
                            self.stats.reply_frames_received += 1;
                            debug!(bytes = bytes.len(), "Reply audio frame");
                        }
                        Some(Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_))) => {}
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "Gateway closed the connection");
                            return StreamOutcome::TransportLost;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error");
                            return StreamOutcome::TransportLost;
                        }
                        None => return StreamOutcome::TransportLost,
                    }
                }
            }
        }
    }

    async fn drain_ring(&mut self, ws: &mut WsConnection) -> AppResult<()> {
        while let Some(frame) = self.ring.pop() {
            let encoded = encode_audio_frame(self.sequence, &frame);
            ws.send(WsMessage::Binary(encoded))
                .await
                .map_err(|e| AppError::Transport(format!("send audio frame: {}", e)))?;
            self.sequence += 1;
            self.stats.frames_sent += 1;
        }
        Ok(())
    }

    async fn send_control(&mut self, ws: &mut WsConnection, msg: &DeviceMessage) -> AppResult<()> {
        let json = serde_json::to_string(msg)?;
        ws.send(WsMessage::Text(json))
            .await
            .map_err(|e| AppError::Transport(format!("send control frame: {}", e)))
    }

    fn handle_gateway_text(&mut self, text: &str) {
        match serde_json::from_str::<GatewayMessage>(text) {
            Ok(GatewayMessage::Ack {
                utterance_id,
                sample_count,
                gap_detected,
            }) => {
                self.stats.acks_received += 1;
                info!(%utterance_id, sample_count, gap_detected, "Utterance acknowledged");
            }
            Ok(GatewayMessage::EnhancementSummary {
                utterance_id,
                steps_applied,
                processing_time_ms,
                rms_improvement,
            }) => {
                info!(
                    %utterance_id,
                    steps = steps_applied.len(),
                    processing_time_ms,
                    rms_improvement,
                    "Enhancement summary"
                );
            }
            Ok(GatewayMessage::TtsAudioStart { total_samples, .. }) => {
                debug!(total_samples, "Reply playback starting");
            }
            Ok(GatewayMessage::TtsAudioEnd {
                frames_sent,
                interrupted,
                ..
            }) => {
                info!(frames_sent, interrupted, "Reply playback finished");
            }
            Ok(GatewayMessage::Error { code, message, .. }) => {
                self.stats.errors_received += 1;
                warn!(code = %code, message = %message, "Gateway reported an error");
            }
            Ok(GatewayMessage::Heartbeat { .. }) | Ok(GatewayMessage::SessionReady { .. }) => {}
            Err(e) => warn!(error = %e, "Unparseable gateway frame"),
        }
    }
}

enum StreamOutcome {
    TransportLost,
    Shutdown,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_resume_only_inside_grace_window() {
        let id = Uuid::new_v4();
        let now = Instant::now();
        let resume = ResumeState {
            session_id: Some(id),
            disconnected_at: Some(now),
        };
        let grace = Duration::from_secs(60);

        assert_eq!(
            resume.resumable(grace, now + Duration::from_secs(59)),
            Some(id)
        );
        assert_eq!(resume.resumable(grace, now + Duration::from_secs(61)), None);
    }

    #[test]
    fn test_no_resume_without_prior_session() {
        let resume = ResumeState::default();
        assert_eq!(
            resume.resumable(Duration::from_secs(60), Instant::now()),
            None
        );
    }
}

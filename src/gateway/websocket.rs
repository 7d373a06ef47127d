//! # Device WebSocket Handler
//!
//! One actor per device connection, upgraded at `/ws/device/{device_id}`.
//! The actor owns the session's assembler and drives the whole utterance
//! round trip; everything slow (auth, enhancement, collaborators, reply
//! pacing) runs in spawned tasks that report back through actor messages.
//!
//! ## Connection lifecycle:
//! 1. **Handshake**: the first text frame must be `metadata` within the
//!    handshake timeout; credentials go to the authenticator, then the
//!    session is registered (or resumed inside its grace window)
//! 2. **Streaming**: `utterance_start`, binary frames, `utterance_end`;
//!    completion also fires on silence or the duration cutoff
//! 3. **Reply**: enhancement → collaborators → paced reply frames;
//!    `utterance_start` mid-reply is barge-in and cancels the dispatch
//! 4. **Disconnect**: the session parks in its grace window unless the close
//!    was deliberate (auth failure, capacity, repeated violations)
//!
//! ## Protocol discipline:
//! Malformed or out-of-place frames get an `error` text frame back. Three
//! strikes close the connection with the protocol-error close code.

use crate::audio::{AssemblerConfig, BufferAssembler, CompletionTrigger, Utterance};
use crate::collaborators::{with_retry, CollaboratorSet, ReplyAudio};
use crate::config::AppConfig;
use crate::dispatch::{start_dispatch, DispatchEvent, DispatchHandle};
use crate::enhancement::{ProcessingProfile, ProfileLevel, WorkerPool};
use crate::error::AppError;
use crate::gateway::registry::{RegistryError, SessionRegistry};
use crate::gateway::session::{DeviceCapabilities, SessionEntry, SessionPhase};
use crate::protocol::{decode_audio_frame, CloseCode, DeviceMessage, GatewayMessage, HandshakeMetadata};
use crate::state::{AppState, GatewayMetrics};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Protocol violations tolerated before the connection is closed.
const MAX_VIOLATIONS: u8 = 3;

/// WebSocket actor for one device connection.
pub struct DeviceSocket {
    /// Device id from the connection path; the handshake must match it
    device_id: String,
    config: AppConfig,
    metrics: Arc<GatewayMetrics>,
    registry: Arc<SessionRegistry>,
    pool: Arc<WorkerPool>,
    collaborators: CollaboratorSet,

    session: Option<Arc<SessionEntry>>,
    assembler: Option<BufferAssembler>,
    active_dispatch: Option<DispatchHandle>,

    last_heartbeat: Instant,
    handshaken: bool,
    /// Set while auth and registration are in flight, so a second metadata
    /// frame cannot start a parallel handshake
    handshake_pending: bool,
    violations: u8,
    /// Set when the gateway closes on purpose; suppresses the grace window
    deliberate_close: bool,
}

impl DeviceSocket {
    pub fn new(
        device_id: String,
        app_state: &AppState,
        registry: Arc<SessionRegistry>,
        pool: Arc<WorkerPool>,
        collaborators: CollaboratorSet,
    ) -> Self {
        Self {
            device_id,
            config: app_state.get_config(),
            metrics: Arc::clone(&app_state.metrics),
            registry,
            pool,
            collaborators,
            session: None,
            assembler: None,
            active_dispatch: None,
            last_heartbeat: Instant::now(),
            handshaken: false,
            handshake_pending: false,
            violations: 0,
            deliberate_close: false,
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &GatewayMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(device_id = %self.device_id, error = %e, "Failed to serialize gateway message"),
        }
    }

    fn send_error(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        error: &AppError,
        utterance_id: Option<Uuid>,
    ) {
        self.send_message(
            ctx,
            &GatewayMessage::Error {
                code: error.code().to_string(),
                message: error.to_string(),
                utterance_id,
            },
        );
    }

    /// Record a protocol violation; the third strike closes the connection.
    fn protocol_violation(&mut self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        self.violations += 1;
        warn!(
            device_id = %self.device_id,
            strikes = self.violations,
            message,
            "Protocol violation"
        );
        self.send_error(ctx, &AppError::Protocol(message.to_string()), None);

        if self.violations >= MAX_VIOLATIONS {
            self.close_with(ctx, CloseCode::ProtocolError);
        }
    }

    fn close_with(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: CloseCode) {
        info!(
            device_id = %self.device_id,
            code = code.code(),
            reason = code.reason(),
            "Closing device connection"
        );
        self.deliberate_close = true;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Other(code.code()),
            description: Some(code.reason().to_string()),
        }));
        ctx.stop();
    }

    /// Whether a metadata frame may start a handshake right now. False once
    /// the handshake completed, and also while one is still in flight: a
    /// second metadata frame during auth would register a second session and
    /// strand the first one in the registry.
    fn metadata_frame_allowed(&self) -> bool {
        !self.handshaken && !self.handshake_pending
    }

    /// Validate and kick off the handshake. Auth is delegated to the
    /// authenticator collaborator; the outcome comes back as an actor
    /// message so the stream handler is never blocked.
    fn handle_metadata(&mut self, meta: HandshakeMetadata, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.metadata_frame_allowed() {
            self.protocol_violation(ctx, "duplicate metadata frame");
            return;
        }
        if meta.device_id != self.device_id {
            self.send_error(
                ctx,
                &AppError::Protocol("metadata device_id does not match connection path".to_string()),
                None,
            );
            self.close_with(ctx, CloseCode::ProtocolError);
            return;
        }
        if meta.sample_rate != self.config.audio.sample_rate
            || meta.bit_depth != self.config.audio.bit_depth
        {
            self.send_error(
                ctx,
                &AppError::Protocol(format!(
                    "unsupported audio format {} Hz / {} bit",
                    meta.sample_rate, meta.bit_depth
                )),
                None,
            );
            self.close_with(ctx, CloseCode::ProtocolError);
            return;
        }

        self.handshake_pending = true;
        let authenticator = Arc::clone(&self.collaborators.authenticator);
        let registry = Arc::clone(&self.registry);
        let addr = ctx.address();
        tokio::spawn(async move {
            let authenticated = with_retry("authenticator", || {
                authenticator.authenticate(&meta.device_id, &meta.auth_token)
            })
            .await;

            match authenticated {
                Ok(true) => {}
                Ok(false) => {
                    info!(device_id = %meta.device_id, "Device credentials rejected");
                    addr.do_send(HandshakeOutcome(Err(CloseCode::AuthFailed)));
                    return;
                }
                Err(e) => {
                    error!(device_id = %meta.device_id, error = %e, "Authenticator unreachable");
                    addr.do_send(HandshakeOutcome(Err(CloseCode::AuthFailed)));
                    return;
                }
            }

            let profile = ProfileLevel::from_preference(meta.preferred_profile.as_deref());
            let capabilities = DeviceCapabilities {
                sample_rate: meta.sample_rate,
                bit_depth: meta.bit_depth,
            };

            // Resume inside the grace window when the device asks and the
            // identifier is still valid; otherwise fall through to a fresh
            // registration.
            if let Some(previous) = meta.resume_session_id {
                if let Some(entry) = registry.resume(previous, &meta.device_id) {
                    addr.do_send(HandshakeOutcome(Ok((entry, true))));
                    return;
                }
                debug!(device_id = %meta.device_id, %previous, "Resumption not possible, registering fresh session");
            }

            match registry.register(&meta.device_id, capabilities, profile) {
                Ok(entry) => addr.do_send(HandshakeOutcome(Ok((entry, false)))),
                Err(RegistryError::Overloaded) => {
                    addr.do_send(HandshakeOutcome(Err(CloseCode::ServerOverloaded)))
                }
            }
        });
    }

    fn handle_utterance_start(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.session.clone() else {
            self.protocol_violation(ctx, "utterance_start before handshake");
            return;
        };

        // A new talk event during reply playback is barge-in: the child's
        // voice always wins over the bear's.
        if let Some(dispatch) = self.active_dispatch.take() {
            info!(session_id = %session.session_id, "Barge-in, cancelling reply playback");
            dispatch.cancel();
        }

        if !session.transition_to(SessionPhase::Capturing) {
            self.protocol_violation(
                ctx,
                &format!("utterance_start not valid while {}", session.phase().as_str()),
            );
            return;
        }

        let begun = match self.assembler.as_mut() {
            Some(assembler) => assembler.begin_utterance(),
            None => Err("no assembler for session".to_string()),
        };
        match begun {
            Ok(utterance_id) => {
                session.touch();
                debug!(session_id = %session.session_id, %utterance_id, "Utterance capture started");
            }
            Err(e) => {
                session.transition_to(SessionPhase::Idle);
                self.protocol_violation(ctx, &e);
            }
        }
    }

    fn handle_audio_frame(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        if !self.handshaken {
            self.protocol_violation(ctx, "binary frame before handshake");
            return;
        }

        let frame = match decode_audio_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.protocol_violation(ctx, &format!("malformed audio frame: {}", e));
                return;
            }
        };

        let Some(assembler) = self.assembler.as_mut() else {
            self.protocol_violation(ctx, "audio frame before handshake");
            return;
        };

        GatewayMetrics::incr(&self.metrics.frames_received);
        if let Some(session) = &self.session {
            session.touch();
        }

        match assembler.push_frame(frame.sequence, &frame.samples) {
            Ok(Some((utterance, trigger))) => self.process_utterance(utterance, trigger, ctx),
            Ok(None) => {}
            Err(e) => {
                // Stale frames happen on reconnect races; drop them quietly
                debug!(device_id = %self.device_id, error = %e, "Audio frame dropped");
            }
        }
    }

    fn handle_utterance_end(&mut self, last_sequence: u64, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(assembler) = self.assembler.as_mut() else {
            self.protocol_violation(ctx, "utterance_end before handshake");
            return;
        };
        match assembler.end_utterance(Some(last_sequence)) {
            Ok((utterance, trigger)) => self.process_utterance(utterance, trigger, ctx),
            Err(e) => self.protocol_violation(ctx, &e),
        }
    }

    /// Hand a sealed utterance to the enhancement pool and, from there, the
    /// collaborator chain. The ack deliberately waits until the bounded
    /// queue accepts the job, so a saturated pool slows the device down.
    fn process_utterance(
        &mut self,
        utterance: Utterance,
        trigger: CompletionTrigger,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let Some(session) = self.session.clone() else {
            return;
        };

        GatewayMetrics::incr(&self.metrics.utterances_completed);
        if utterance.gap_detected {
            GatewayMetrics::incr(&self.metrics.utterances_with_gaps);
        }
        session.transition_to(SessionPhase::Assembling);
        session.transition_to(SessionPhase::Enhancing);

        info!(
            session_id = %session.session_id,
            utterance_id = %utterance.id,
            samples = utterance.samples.len(),
            gap_detected = utterance.gap_detected,
            ?trigger,
            "Utterance sealed, queueing for enhancement"
        );

        let profile = ProcessingProfile::new(
            session.profile,
            &self.config.enhancement,
            self.config.audio.sample_rate,
        );
        let pool = Arc::clone(&self.pool);
        let collaborators = self.collaborators.clone();
        let metrics = Arc::clone(&self.metrics);
        let device_id = self.device_id.clone();
        let sample_rate = self.config.audio.sample_rate;
        let addr = ctx.address();

        let utterance_id = utterance.id;
        let sample_count = utterance.samples.len();
        let gap_detected = utterance.gap_detected;

        tokio::spawn(async move {
            let result_rx = match pool.enqueue(utterance, profile).await {
                Ok(rx) => rx,
                Err(e) => {
                    error!(%utterance_id, error = %e, "Failed to queue utterance");
                    GatewayMetrics::incr(&metrics.utterances_failed);
                    addr.do_send(RoundFailed { utterance_id, error: e });
                    return;
                }
            };

            // Queued: the device may release its buffer now
            addr.do_send(SendGatewayMessage(GatewayMessage::Ack {
                utterance_id,
                sample_count,
                gap_detected,
            }));

            let enhanced = match result_rx.await {
                Ok(result) => result,
                Err(_) => {
                    error!(%utterance_id, "Enhancement worker dropped the job");
                    GatewayMetrics::incr(&metrics.utterances_failed);
                    addr.do_send(RoundFailed {
                        utterance_id,
                        error: AppError::Internal("enhancement did not complete".to_string()),
                    });
                    return;
                }
            };

            addr.do_send(SendGatewayMessage(GatewayMessage::EnhancementSummary {
                utterance_id,
                steps_applied: enhanced.steps_applied.clone(),
                processing_time_ms: enhanced.metrics.processing_time_ms,
                rms_improvement: enhanced.metrics.rms_improvement,
            }));

            match collaborators
                .run_voice_round(&device_id, &enhanced.samples, sample_rate)
                .await
            {
                Ok(reply) => addr.do_send(ReplyReady {
                    utterance_id,
                    reply,
                }),
                Err(e) => {
                    warn!(%utterance_id, error = %e, "Voice round failed");
                    GatewayMetrics::incr(&metrics.utterances_failed);
                    addr.do_send(RoundFailed {
                        utterance_id,
                        error: e,
                    });
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Actor messages from spawned tasks
// ---------------------------------------------------------------------------

/// Auth + registry outcome for the handshake.
#[derive(Message)]
#[rtype(result = "()")]
struct HandshakeOutcome(Result<(Arc<SessionEntry>, bool), CloseCode>);

/// A gateway text frame produced off-actor.
#[derive(Message)]
#[rtype(result = "()")]
struct SendGatewayMessage(GatewayMessage);

/// Reply audio is ready to stream back.
#[derive(Message)]
#[rtype(result = "()")]
struct ReplyReady {
    utterance_id: Uuid,
    reply: ReplyAudio,
}

/// The utterance round trip failed after it was sealed.
#[derive(Message)]
#[rtype(result = "()")]
struct RoundFailed {
    utterance_id: Uuid,
    error: AppError,
}

/// One event from the reply dispatcher.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(DispatchEvent);

impl Actor for DeviceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(device_id = %self.device_id, "Device connection opened");

        // The handshake clock starts at connect, not at first frame
        let handshake_timeout = self.config.protocol.handshake_timeout();
        ctx.run_later(handshake_timeout, |act, ctx| {
            if !act.handshaken {
                warn!(device_id = %act.device_id, "Handshake timeout");
                act.close_with(ctx, CloseCode::HandshakeTimeout);
            }
        });

        let interval = self.config.protocol.heartbeat_interval();
        let timeout = self.config.protocol.heartbeat_timeout();
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(device_id = %act.device_id, "Heartbeat timeout, dropping connection");
                ctx.stop();
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(dispatch) = self.active_dispatch.take() {
            dispatch.cancel();
        }

        let in_flight = self.assembler.as_mut().and_then(|a| a.abort()).map(|u| u.id);

        if let Some(session) = &self.session {
            if self.deliberate_close {
                self.registry.destroy(session.session_id);
                if in_flight.is_some() {
                    GatewayMetrics::incr(&self.metrics.utterances_failed);
                }
            } else {
                info!(
                    session_id = %session.session_id,
                    device_id = %self.device_id,
                    "Transport lost, session entering grace window"
                );
                self.registry.begin_grace(session.session_id, in_flight);
            }
        }
        info!(device_id = %self.device_id, "Device connection closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DeviceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<DeviceMessage>(&text) {
                    Ok(DeviceMessage::Metadata(meta)) => self.handle_metadata(meta, ctx),
                    Ok(DeviceMessage::UtteranceStart { .. }) => self.handle_utterance_start(ctx),
                    Ok(DeviceMessage::UtteranceEnd { last_sequence }) => {
                        self.handle_utterance_end(last_sequence, ctx)
                    }
                    Ok(DeviceMessage::Heartbeat { timestamp }) => {
                        self.send_message(ctx, &GatewayMessage::Heartbeat { timestamp });
                    }
                    Err(e) => {
                        self.protocol_violation(ctx, &format!("unparseable text frame: {}", e))
                    }
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio_frame(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(device_id = %self.device_id, ?reason, "Device closed the connection");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                self.protocol_violation(ctx, "continuation frames are not part of the protocol");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(device_id = %self.device_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<HandshakeOutcome> for DeviceSocket {
    type Result = ();

    fn handle(&mut self, msg: HandshakeOutcome, ctx: &mut Self::Context) {
        self.handshake_pending = false;
        match msg.0 {
            Ok((entry, resumed)) => {
                self.handshaken = true;
                self.last_heartbeat = Instant::now();
                self.assembler = Some(BufferAssembler::new(
                    entry.session_id,
                    AssemblerConfig {
                        sample_rate: self.config.audio.sample_rate,
                        frame_samples: self.config.audio.frame_samples,
                        silence_timeout_ms: self.config.protocol.silence_timeout_ms,
                        max_utterance_ms: self.config.protocol.max_utterance_ms,
                    },
                ));

                let ready = GatewayMessage::SessionReady {
                    session_id: entry.session_id,
                    resumed,
                    profile: entry.profile.as_str().to_string(),
                    heartbeat_interval_ms: self.config.protocol.heartbeat_interval_ms,
                };
                info!(
                    session_id = %entry.session_id,
                    device_id = %self.device_id,
                    resumed,
                    "Handshake complete"
                );
                self.session = Some(entry);
                self.send_message(ctx, &ready);
            }
            Err(code) => self.close_with(ctx, code),
        }
    }
}

impl Handler<SendGatewayMessage> for DeviceSocket {
    type Result = ();

    fn handle(&mut self, msg: SendGatewayMessage, ctx: &mut Self::Context) {
        self.send_message(ctx, &msg.0);
    }
}

impl Handler<ReplyReady> for DeviceSocket {
    type Result = ();

    fn handle(&mut self, msg: ReplyReady, ctx: &mut Self::Context) {
        let Some(session) = self.session.clone() else {
            return;
        };
        // The device may have barged in while the collaborators worked;
        // in that case it is already capturing again and the reply is stale.
        if session.phase() == SessionPhase::Capturing {
            debug!(utterance_id = %msg.utterance_id, "Discarding reply, device barged in");
            return;
        }
        session.transition_to(SessionPhase::AwaitingResponse);
        session.transition_to(SessionPhase::Responding);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle, _task) = start_dispatch(
            msg.utterance_id,
            msg.reply,
            self.config.protocol.playback_frame_samples,
            tx,
            Arc::clone(&self.metrics),
        );
        self.active_dispatch = Some(handle);

        let addr = ctx.address();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                addr.do_send(Outbound(event));
            }
        });
    }
}

impl Handler<Outbound> for DeviceSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg.0 {
            DispatchEvent::Control(message) => {
                let finished = matches!(message, GatewayMessage::TtsAudioEnd { .. });
                self.send_message(ctx, &message);
                if finished {
                    self.active_dispatch = None;
                    if let Some(session) = &self.session {
                        // After barge-in the session is already capturing;
                        // transition_to refuses the illegal move in that case.
                        session.transition_to(SessionPhase::Idle);
                    }
                }
            }
            DispatchEvent::Audio(bytes) => ctx.binary(bytes),
        }
    }
}

impl Handler<RoundFailed> for DeviceSocket {
    type Result = ();

    fn handle(&mut self, msg: RoundFailed, ctx: &mut Self::Context) {
        self.send_error(ctx, &msg.error, Some(msg.utterance_id));
        if let Some(session) = &self.session {
            session.transition_to(SessionPhase::Idle);
        }
    }
}

/// HTTP → WebSocket upgrade for `/ws/device/{device_id}`.
pub async fn device_ws(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
    registry: web::Data<Arc<SessionRegistry>>,
    pool: web::Data<Arc<WorkerPool>>,
    collaborators: web::Data<CollaboratorSet>,
) -> ActixResult<HttpResponse> {
    let device_id = path.into_inner();
    info!(
        device_id = %device_id,
        peer = ?req.connection_info().peer_addr(),
        "Device connection request"
    );

    let socket = DeviceSocket::new(
        device_id,
        app_state.get_ref(),
        registry.get_ref().clone(),
        pool.get_ref().clone(),
        collaborators.get_ref().clone(),
    );
    ws::start(socket, &req, stream)
}

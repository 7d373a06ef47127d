//! # Device ↔ Gateway Wire Protocol
//!
//! One WebSocket connection per device. Two frame kinds travel over it:
//!
//! - **Text frames**: JSON with a `type` discriminator, defined by the
//!   [`DeviceMessage`] and [`GatewayMessage`] enums below.
//! - **Binary frames**: an 8-byte little-endian sequence number followed by
//!   raw little-endian 16-bit PCM (mono, fixed sample rate). The sequence
//!   prefix is what lets the assembler detect drops end to end; audio
//!   streaming is best-effort and gaps are never retransmitted.
//!
//! ## Protocol Flow:
//! 1. Device connects to `/ws/device/{device_id}` and must send `metadata`
//!    within the handshake timeout
//! 2. Gateway replies `session_ready` (new or resumed session id)
//! 3. A talk event is `utterance_start`, binary frames, `utterance_end`
//! 4. Gateway acks the utterance once it is queued for enhancement
//! 5. The reply comes back as `tts_audio_start`, binary frames,
//!    `tts_audio_end`; a new `utterance_start` mid-reply is barge-in

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Size of the sequence-number prefix on every binary audio frame.
pub const FRAME_HEADER_BYTES: usize = 8;

/// Handshake metadata the device sends as its first text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeMetadata {
    /// Stable hardware identifier (the only device-identifying field we log)
    pub device_id: String,

    /// Firmware version string, for capability gating and fleet dashboards
    pub firmware_version: String,

    /// Capture sample rate the device will stream at
    pub sample_rate: u32,

    /// Bits per sample (16 for all current firmware)
    pub bit_depth: u8,

    /// Enhancement profile the device asks for, based on its own latency
    /// tolerance ("low" / "medium" / "high")
    #[serde(default)]
    pub preferred_profile: Option<String>,

    /// Set when reconnecting inside the grace window to resume the previous
    /// session under its original id
    #[serde(default)]
    pub resume_session_id: Option<Uuid>,

    /// Opaque credential, validated by the external authenticator
    pub auth_token: String,
}

/// Messages the device sends to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceMessage {
    /// Handshake; must be the first message on the connection
    #[serde(rename = "metadata")]
    Metadata(HandshakeMetadata),

    /// Talk trigger: the device is about to stream audio frames
    #[serde(rename = "utterance_start")]
    UtteranceStart {
        /// Device-side capture timestamp (ms since epoch)
        timestamp: u64,
    },

    /// Release / silence signal: the utterance is finished
    #[serde(rename = "utterance_end")]
    UtteranceEnd {
        /// Last sequence number the device sent for this utterance
        last_sequence: u64,
    },

    /// Idle keepalive
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: u64 },
}

/// Messages the gateway sends to the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayMessage {
    /// Handshake accepted
    #[serde(rename = "session_ready")]
    SessionReady {
        session_id: Uuid,
        /// True when the previous session was resumed inside its grace window
        resumed: bool,
        /// Profile the gateway settled on for this session
        profile: String,
        heartbeat_interval_ms: u64,
    },

    /// Heartbeat echo
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: u64 },

    /// The utterance was reassembled and queued for enhancement.
    ///
    /// Deliberately sent only after the utterance is accepted by the bounded
    /// worker queue: when the pool is saturated the ack is late, which is how
    /// backpressure reaches the device without discarding audio.
    #[serde(rename = "ack")]
    Ack {
        utterance_id: Uuid,
        sample_count: usize,
        gap_detected: bool,
    },

    /// Protocol or upstream error surfaced to the device
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        utterance_id: Option<Uuid>,
    },

    /// Reply audio follows as binary frames
    #[serde(rename = "tts_audio_start")]
    TtsAudioStart {
        utterance_id: Uuid,
        sample_rate: u32,
        frame_samples: usize,
        total_samples: usize,
    },

    /// Reply audio finished (or was cut short by barge-in)
    #[serde(rename = "tts_audio_end")]
    TtsAudioEnd {
        utterance_id: Uuid,
        frames_sent: usize,
        interrupted: bool,
    },

    /// Post-enhancement observability summary (steps applied, quality metrics)
    #[serde(rename = "enhancement_summary")]
    EnhancementSummary {
        utterance_id: Uuid,
        steps_applied: Vec<String>,
        processing_time_ms: u64,
        rms_improvement: f32,
    },
}

/// Device-visible close codes, mapped into the WebSocket private range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    AuthFailed,
    HandshakeTimeout,
    ServerOverloaded,
    ProtocolError,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::AuthFailed => 4001,
            CloseCode::HandshakeTimeout => 4002,
            CloseCode::ServerOverloaded => 4003,
            CloseCode::ProtocolError => 4007,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::AuthFailed => "auth_failed",
            CloseCode::HandshakeTimeout => "handshake_timeout",
            CloseCode::ServerOverloaded => "server_overloaded",
            CloseCode::ProtocolError => "protocol_error",
        }
    }
}

/// A decoded binary audio frame: sequence number plus PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryAudioFrame {
    pub sequence: u64,
    pub samples: Vec<i16>,
}

/// Encode a binary audio frame for the wire.
pub fn encode_audio_frame(sequence: u64, samples: &[i16]) -> Vec<u8> {
    let mut buf = vec![0u8; FRAME_HEADER_BYTES + samples.len() * 2];
    LittleEndian::write_u64(&mut buf[..FRAME_HEADER_BYTES], sequence);
    LittleEndian::write_i16_into(samples, &mut buf[FRAME_HEADER_BYTES..]);
    buf
}

/// Encode a reply audio frame streamed back to the device.
///
/// Reply frames carry no sequence prefix: they only ever travel gateway to
/// device over the ordered connection, bracketed by `tts_audio_start` and
/// `tts_audio_end`.
pub fn encode_reply_frame(samples: &[i16]) -> Vec<u8> {
    let mut buf = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut buf);
    buf
}

/// Decode a binary audio frame from the wire.
///
/// ## Errors:
/// Returns a description when the frame is shorter than its header or the
/// payload length is odd (16-bit samples must come in whole pairs). A frame
/// with a valid header and an empty payload is rejected too: the device never
/// sends empty frames, so one indicates a truncated write.
pub fn decode_audio_frame(data: &[u8]) -> Result<BinaryAudioFrame, String> {
    if data.len() < FRAME_HEADER_BYTES {
        return Err(format!(
            "frame too short: {} bytes, need at least {}",
            data.len(),
            FRAME_HEADER_BYTES
        ));
    }

    let payload = &data[FRAME_HEADER_BYTES..];
    if payload.is_empty() {
        return Err("frame has no audio payload".to_string());
    }
    if payload.len() % 2 != 0 {
        return Err("audio payload length must be even for 16-bit samples".to_string());
    }

    let sequence = LittleEndian::read_u64(&data[..FRAME_HEADER_BYTES]);
    let mut samples = vec![0i16; payload.len() / 2];
    LittleEndian::read_i16_into(payload, &mut samples);

    Ok(BinaryAudioFrame { sequence, samples })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_round_trip() {
        let samples: Vec<i16> = (0..1024).map(|i| (i as i16).wrapping_mul(31)).collect();
        let encoded = encode_audio_frame(42, &samples);
        assert_eq!(encoded.len(), FRAME_HEADER_BYTES + 2048);

        let decoded = decode_audio_frame(&encoded).unwrap();
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.samples, samples);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(decode_audio_frame(&[0u8; 4]).is_err());
        assert!(decode_audio_frame(&[0u8; FRAME_HEADER_BYTES]).is_err());
        assert!(decode_audio_frame(&[0u8; FRAME_HEADER_BYTES + 3]).is_err());
    }

    #[test]
    fn test_metadata_serialization() {
        let msg = DeviceMessage::Metadata(HandshakeMetadata {
            device_id: "bear-0042".to_string(),
            firmware_version: "2.4.1".to_string(),
            sample_rate: 16000,
            bit_depth: 16,
            preferred_profile: Some("high".to_string()),
            resume_session_id: None,
            auth_token: "token".to_string(),
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"metadata""#));

        match serde_json::from_str::<DeviceMessage>(&json).unwrap() {
            DeviceMessage::Metadata(meta) => {
                assert_eq!(meta.device_id, "bear-0042");
                assert_eq!(meta.sample_rate, 16000);
                assert_eq!(meta.preferred_profile.as_deref(), Some("high"));
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_gateway_error_frame() {
        let msg = GatewayMessage::Error {
            code: "protocol_error".to_string(),
            message: "duplicate utterance_start".to_string(),
            utterance_id: None,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("protocol_error"));
        assert!(!json.contains("utterance_id"));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseCode::AuthFailed.reason(), "auth_failed");
        assert_eq!(CloseCode::ProtocolError.code(), 4007);
    }
}

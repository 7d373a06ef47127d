//! # Session Model
//!
//! A session is the gateway-side identity of one device conversation. It
//! outlives the WebSocket connection: on transport loss the session parks in
//! a grace phase and can be re-attached by a reconnecting device.
//!
//! ## Phase machine:
//! idle → capturing → assembling → enhancing → awaiting_response → responding → idle
//!
//! Barge-in jumps responding straight back to capturing. Transport loss
//! parks any phase in grace; resumption returns to idle.

use crate::enhancement::ProfileLevel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::RwLock;
use std::time::Instant;
use uuid::Uuid;

/// Where a session currently is in the utterance round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Capturing,
    Assembling,
    Enhancing,
    AwaitingResponse,
    Responding,
    /// Disconnected, waiting for resumption or expiry
    Grace,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Capturing => "capturing",
            SessionPhase::Assembling => "assembling",
            SessionPhase::Enhancing => "enhancing",
            SessionPhase::AwaitingResponse => "awaiting_response",
            SessionPhase::Responding => "responding",
            SessionPhase::Grace => "grace",
        }
    }

    /// Whether `next` is a legal transition out of this phase.
    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        // Grace can be entered from anywhere (transport can drop at any time),
        // and any phase can be abandoned back to idle on failure.
        if next == Grace || next == Idle {
            return true;
        }
        matches!(
            (*self, next),
            (Idle, Capturing)
                | (Capturing, Assembling)
                | (Assembling, Enhancing)
                | (Enhancing, AwaitingResponse)
                | (AwaitingResponse, Responding)
                | (Responding, Capturing) // barge-in
        )
    }
}

/// Audio capabilities a device declared at handshake.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeviceCapabilities {
    pub sample_rate: u32,
    pub bit_depth: u8,
}

/// Shared per-session record held in the registry.
///
/// ## Thread Safety:
/// Exactly one connection actor writes a session at a time (the registry
/// enforces single attachment), so the `RwLock`s here are uncontended in
/// practice; readers are the health endpoint and the expiry sweeper.
#[derive(Debug)]
pub struct SessionEntry {
    pub session_id: Uuid,
    pub device_id: String,
    pub capabilities: DeviceCapabilities,
    pub profile: ProfileLevel,
    pub created_at: DateTime<Utc>,
    phase: RwLock<SessionPhase>,
    last_seen: RwLock<DateTime<Utc>>,
    /// Utterance in flight when the transport dropped, if any
    interrupted_utterance: RwLock<Option<Uuid>>,
    /// Set while in grace; cleared on resumption
    grace_deadline: RwLock<Option<Instant>>,
}

impl PartialEq for SessionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

impl Eq for SessionEntry {}

impl SessionEntry {
    pub fn new(device_id: String, capabilities: DeviceCapabilities, profile: ProfileLevel) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            device_id,
            capabilities,
            profile,
            created_at: Utc::now(),
            phase: RwLock::new(SessionPhase::Idle),
            last_seen: RwLock::new(Utc::now()),
            interrupted_utterance: RwLock::new(None),
            grace_deadline: RwLock::new(None),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`, logging nothing: the caller decides how to react to
    /// an illegal transition. Returns false and leaves the phase untouched
    /// if the transition is not allowed.
    pub fn transition_to(&self, next: SessionPhase) -> bool {
        let mut phase = self.phase.write().unwrap_or_else(|e| e.into_inner());
        if phase.can_transition_to(next) {
            *phase = next;
            true
        } else {
            false
        }
    }

    pub fn touch(&self) {
        *self.last_seen.write().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_interrupted_utterance(&self, id: Option<Uuid>) {
        *self
            .interrupted_utterance
            .write()
            .unwrap_or_else(|e| e.into_inner()) = id;
    }

    pub fn take_interrupted_utterance(&self) -> Option<Uuid> {
        self.interrupted_utterance
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Park the session: remember any in-flight utterance and start the
    /// grace clock.
    pub fn enter_grace(&self, deadline: Instant, in_flight: Option<Uuid>) {
        self.transition_to(SessionPhase::Grace);
        self.set_interrupted_utterance(in_flight);
        *self
            .grace_deadline
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(deadline);
    }

    /// Clear the grace clock on resumption; returns false if the deadline
    /// already passed (the caller must treat the session as gone).
    pub fn leave_grace(&self, now: Instant) -> bool {
        let mut deadline = self
            .grace_deadline
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match *deadline {
            Some(d) if now <= d => {
                *deadline = None;
                self.transition_to(SessionPhase::Idle);
                self.touch();
                true
            }
            _ => false,
        }
    }

    pub fn grace_expired(&self, now: Instant) -> bool {
        matches!(
            *self
                .grace_deadline
                .read()
                .unwrap_or_else(|e| e.into_inner()),
            Some(d) if now > d
        )
    }

    pub fn in_grace(&self) -> bool {
        self.grace_deadline
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry() -> SessionEntry {
        SessionEntry::new(
            "bear-01".to_string(),
            DeviceCapabilities {
                sample_rate: 16000,
                bit_depth: 16,
            },
            ProfileLevel::Medium,
        )
    }

    #[test]
    fn test_normal_round_trip_phases() {
        let s = entry();
        assert_eq!(s.phase(), SessionPhase::Idle);
        for next in [
            SessionPhase::Capturing,
            SessionPhase::Assembling,
            SessionPhase::Enhancing,
            SessionPhase::AwaitingResponse,
            SessionPhase::Responding,
            SessionPhase::Idle,
        ] {
            assert!(s.transition_to(next), "failed entering {:?}", next);
        }
    }

    #[test]
    fn test_barge_in_transition() {
        let s = entry();
        s.transition_to(SessionPhase::Capturing);
        s.transition_to(SessionPhase::Assembling);
        s.transition_to(SessionPhase::Enhancing);
        s.transition_to(SessionPhase::AwaitingResponse);
        s.transition_to(SessionPhase::Responding);
        assert!(s.transition_to(SessionPhase::Capturing));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let s = entry();
        assert!(!s.transition_to(SessionPhase::Responding));
        assert!(!s.transition_to(SessionPhase::Enhancing));
        assert_eq!(s.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_grace_round_trip() {
        let s = entry();
        let utt = Uuid::new_v4();
        let now = Instant::now();
        s.enter_grace(now + Duration::from_secs(60), Some(utt));
        assert_eq!(s.phase(), SessionPhase::Grace);
        assert!(s.in_grace());

        // Within the window
        assert!(s.leave_grace(now + Duration::from_secs(59)));
        assert_eq!(s.phase(), SessionPhase::Idle);
        assert!(!s.in_grace());
        assert_eq!(s.take_interrupted_utterance(), Some(utt));
    }

    #[test]
    fn test_grace_expiry() {
        let s = entry();
        let now = Instant::now();
        s.enter_grace(now + Duration::from_secs(60), None);
        assert!(!s.leave_grace(now + Duration::from_secs(61)));
        assert!(s.grace_expired(now + Duration::from_secs(61)));
    }
}

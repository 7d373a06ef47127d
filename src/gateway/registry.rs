//! # Session Registry
//!
//! Gateway-wide map of live and grace-parked sessions. Registration is
//! capacity-checked so an overloaded gateway turns new devices away at
//! handshake time instead of degrading every existing conversation.
//!
//! ## Concurrency:
//! `Arc<RwLock<HashMap>>` with short critical sections. Only the owning
//! connection actor mutates a session's phase; the registry lock protects
//! membership, not per-session state.

use crate::enhancement::ProfileLevel;
use crate::gateway::session::{DeviceCapabilities, SessionEntry};
use crate::state::GatewayMetrics;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// At the configured session cap
    Overloaded,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,
    max_sessions: usize,
    grace_window: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, grace_window: Duration, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            grace_window,
            metrics,
        }
    }

    /// Register a brand new session for a device.
    pub fn register(
        &self,
        device_id: &str,
        capabilities: DeviceCapabilities,
        profile: ProfileLevel,
    ) -> Result<Arc<SessionEntry>, RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.len() >= self.max_sessions {
            warn!(
                device_id,
                active = sessions.len(),
                cap = self.max_sessions,
                "Refusing session, gateway at capacity"
            );
            return Err(RegistryError::Overloaded);
        }

        let entry = Arc::new(SessionEntry::new(
            device_id.to_string(),
            capabilities,
            profile,
        ));
        sessions.insert(entry.session_id, Arc::clone(&entry));

        GatewayMetrics::incr(&self.metrics.sessions_created);
        GatewayMetrics::incr(&self.metrics.active_sessions);
        info!(
            session_id = %entry.session_id,
            device_id,
            profile = profile.as_str(),
            "Session registered"
        );
        Ok(entry)
    }

    /// Try to re-attach a device to a grace-parked session.
    ///
    /// ## Returns:
    /// The resumed entry, or `None` when the identifier is unknown, belongs
    /// to a different device, or its grace window already passed. In every
    /// `None` case the caller registers a fresh session instead.
    pub fn resume(&self, session_id: Uuid, device_id: &str) -> Option<Arc<SessionEntry>> {
        self.resume_at(session_id, device_id, Instant::now())
    }

    fn resume_at(
        &self,
        session_id: Uuid,
        device_id: &str,
        now: Instant,
    ) -> Option<Arc<SessionEntry>> {
        let entry = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.get(&session_id).cloned()
        }?;

        if entry.device_id != device_id {
            warn!(
                %session_id,
                claimed_by = device_id,
                owner = %entry.device_id,
                "Resumption refused, device mismatch"
            );
            return None;
        }

        if !entry.leave_grace(now) {
            debug!(%session_id, "Resumption refused, grace window passed");
            return None;
        }

        // An utterance cut off mid-capture is not recoverable: its frames
        // died with the old connection.
        if entry.take_interrupted_utterance().is_some() {
            GatewayMetrics::incr(&self.metrics.utterances_failed);
        }

        GatewayMetrics::incr(&self.metrics.sessions_resumed);
        info!(%session_id, device_id, "Session resumed inside grace window");
        Some(entry)
    }

    /// Park a session after its transport dropped.
    pub fn begin_grace(&self, session_id: Uuid, in_flight_utterance: Option<Uuid>) {
        let entry = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.get(&session_id).cloned()
        };
        if let Some(entry) = entry {
            entry.enter_grace(Instant::now() + self.grace_window, in_flight_utterance);
            debug!(%session_id, grace_ms = self.grace_window.as_millis() as u64, "Session parked for grace window");
        }
    }

    /// Remove a session immediately (deliberate close, auth failure).
    pub fn destroy(&self, session_id: Uuid) {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.remove(&session_id)
        };
        if removed.is_some() {
            self.metrics.decr_active_sessions();
            debug!(%session_id, "Session destroyed");
        }
    }

    /// Drop every session whose grace window has passed. Called periodically
    /// from the sweeper task.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    fn sweep_expired_at(&self, now: Instant) -> usize {
        let expired: Vec<Arc<SessionEntry>> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions
                .values()
                .filter(|e| e.grace_expired(now))
                .cloned()
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for entry in expired {
            // A resumption may have won the race since we looked
            if !entry.grace_expired(now) {
                continue;
            }
            if sessions.remove(&entry.session_id).is_some() {
                if entry.take_interrupted_utterance().is_some() {
                    GatewayMetrics::incr(&self.metrics.utterances_failed);
                }
                GatewayMetrics::incr(&self.metrics.sessions_expired);
                self.metrics.decr_active_sessions();
                info!(session_id = %entry.session_id, device_id = %entry.device_id, "Session expired after grace window");
                removed += 1;
            }
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities {
            sample_rate: 16000,
            bit_depth: 16,
        }
    }

    fn registry(max: usize, grace: Duration) -> (SessionRegistry, Arc<GatewayMetrics>) {
        let metrics = Arc::new(GatewayMetrics::default());
        (
            SessionRegistry::new(max, grace, Arc::clone(&metrics)),
            metrics,
        )
    }

    #[test]
    fn test_register_and_capacity() {
        let (reg, metrics) = registry(2, Duration::from_secs(60));
        reg.register("bear-01", caps(), ProfileLevel::Medium).unwrap();
        reg.register("bear-02", caps(), ProfileLevel::Low).unwrap();
        assert_eq!(
            reg.register("bear-03", caps(), ProfileLevel::Medium),
            Err(RegistryError::Overloaded)
        );
        assert_eq!(GatewayMetrics::get(&metrics.active_sessions), 2);
    }

    #[test]
    fn test_resume_within_grace_keeps_identity() {
        let (reg, metrics) = registry(10, Duration::from_secs(60));
        let entry = reg.register("bear-01", caps(), ProfileLevel::High).unwrap();
        let id = entry.session_id;

        reg.begin_grace(id, None);
        let resumed = reg.resume(id, "bear-01").unwrap();
        assert_eq!(resumed.session_id, id);
        assert_eq!(GatewayMetrics::get(&metrics.sessions_resumed), 1);
    }

    #[test]
    fn test_resume_refused_for_wrong_device() {
        let (reg, _) = registry(10, Duration::from_secs(60));
        let entry = reg.register("bear-01", caps(), ProfileLevel::Medium).unwrap();
        reg.begin_grace(entry.session_id, None);
        assert!(reg.resume(entry.session_id, "bear-02").is_none());
    }

    #[test]
    fn test_resume_refused_after_deadline() {
        let (reg, _) = registry(10, Duration::from_secs(60));
        let entry = reg.register("bear-01", caps(), ProfileLevel::Medium).unwrap();
        let id = entry.session_id;
        reg.begin_grace(id, None);

        // Just inside the window succeeds; just past it does not
        let now = Instant::now();
        assert!(reg
            .resume_at(id, "bear-01", now + Duration::from_secs(59))
            .is_some());
        reg.begin_grace(id, None);
        assert!(reg
            .resume_at(id, "bear-01", now + Duration::from_secs(125))
            .is_none());
    }

    #[test]
    fn test_sweep_marks_interrupted_utterance_failed() {
        let (reg, metrics) = registry(10, Duration::from_secs(60));
        let entry = reg.register("bear-01", caps(), ProfileLevel::Medium).unwrap();
        let id = entry.session_id;
        reg.begin_grace(id, Some(Uuid::new_v4()));

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(reg.sweep_expired_at(later), 1);
        assert_eq!(reg.active_count(), 0);
        assert_eq!(GatewayMetrics::get(&metrics.sessions_expired), 1);
        assert_eq!(GatewayMetrics::get(&metrics.utterances_failed), 1);
        assert_eq!(GatewayMetrics::get(&metrics.active_sessions), 0);

        // The identifier is gone for good
        assert!(reg.resume(id, "bear-01").is_none());
    }

    #[test]
    fn test_sweep_leaves_live_sessions_alone() {
        let (reg, _) = registry(10, Duration::from_secs(60));
        reg.register("bear-01", caps(), ProfileLevel::Medium).unwrap();
        assert_eq!(reg.sweep_expired(), 0);
        assert_eq!(reg.active_count(), 1);
    }
}

//! # Application State Management
//!
//! Shared state accessed by the HTTP handlers and every device connection
//! actor. Configuration sits behind an `Arc<RwLock<..>>` so it can be updated
//! at runtime; the cross-session metrics are plain atomic counters.
//!
//! ## Why atomics instead of a locked struct:
//! No lock in this process ever spans more than one session. Per-session
//! state is owned by its connection actor, and the only truly shared data,
//! the gateway-wide counters, is append-only. `AtomicU64` gives us that
//! without any contention between sessions.

use crate::config::AppConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all handlers and actors.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Gateway-wide counters (append-only, concurrency-safe)
    pub metrics: Arc<GatewayMetrics>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Cross-session counters for the health and metrics endpoints.
///
/// Every field is monotonically increasing except `active_sessions`, which is
/// incremented on connect and decremented on destroy.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Total HTTP requests processed since server start
    pub request_count: AtomicU64,

    /// Total HTTP errors since server start
    pub error_count: AtomicU64,

    /// Sessions currently registered (live or in grace)
    pub active_sessions: AtomicU64,

    /// Sessions created since start
    pub sessions_created: AtomicU64,

    /// Sessions resumed inside their grace window
    pub sessions_resumed: AtomicU64,

    /// Sessions destroyed after the grace window expired
    pub sessions_expired: AtomicU64,

    /// Audio frames routed to assemblers
    pub frames_received: AtomicU64,

    /// Utterances that completed reassembly
    pub utterances_completed: AtomicU64,

    /// Utterances that ended in a failed state
    pub utterances_failed: AtomicU64,

    /// Utterances reassembled with at least one sequence gap
    pub utterances_with_gaps: AtomicU64,

    /// Enhancement pipeline runs finished
    pub enhancements_completed: AtomicU64,

    /// Enhancement stages that failed and fell back
    pub enhancement_stage_failures: AtomicU64,

    /// Responses cut short by barge-in
    pub responses_barged_in: AtomicU64,
}

impl GatewayMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn decr_active_sessions(&self) {
        // Saturating: never underflow if a destroy races a crash recovery
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

impl AppState {
    /// Create a new AppState with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(GatewayMetrics::default()),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so other threads aren't blocked;
    /// `AppConfig` is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Update the configuration with validation.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        GatewayMetrics::incr(&self.metrics.request_count);
    }

    pub fn increment_error_count(&self) {
        GatewayMetrics::incr(&self.metrics.error_count);
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_state_counters() {
        let state = AppState::new(AppConfig::default());
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();
        assert_eq!(GatewayMetrics::get(&state.metrics.request_count), 2);
        assert_eq!(GatewayMetrics::get(&state.metrics.error_count), 1);
    }

    #[test]
    fn test_active_sessions_never_underflow() {
        let metrics = GatewayMetrics::default();
        metrics.decr_active_sessions();
        assert_eq!(GatewayMetrics::get(&metrics.active_sessions), 0);

        GatewayMetrics::incr(&metrics.active_sessions);
        metrics.decr_active_sessions();
        assert_eq!(GatewayMetrics::get(&metrics.active_sessions), 0);
    }

    #[test]
    fn test_config_update_validates() {
        let state = AppState::new(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        // Original config untouched
        assert_eq!(state.get_config().server.port, 8080);
    }
}

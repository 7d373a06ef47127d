//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! All protocol timeouts and DSP tunables live here rather than as constants
//! scattered through the code, so the same binary can be tuned per deployment.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, audio, protocol,
/// enhancement, performance) makes it easier to understand and maintain
/// as the application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub protocol: ProtocolConfig,
    pub enhancement: EnhancementConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio format expected from devices.
///
/// ## Fields:
/// - `sample_rate`: Samples per second (16000 for all current firmware)
/// - `bit_depth`: Bits per sample (16-bit signed PCM)
/// - `channels`: Channel count (mono)
/// - `frame_samples`: Samples per binary frame the device sends (1024)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub channels: u8,
    pub frame_samples: usize,
}

/// Streaming protocol timing parameters.
///
/// ## Fields:
/// - `handshake_timeout_ms`: Metadata handshake deadline after connect (5s)
/// - `heartbeat_interval_ms`: Ping cadence while a session is idle
/// - `heartbeat_timeout_ms`: Missed-heartbeat threshold before the connection
///   is considered dead
/// - `silence_timeout_ms`: Near-zero amplitude duration that ends an utterance (1.5s)
/// - `max_utterance_ms`: Hard utterance duration cutoff (30s)
/// - `grace_window_ms`: Post-disconnect window during which a session may
///   resume under its original identifier (60s)
/// - `playback_frame_samples`: Samples per response frame streamed back to the
///   device (sized to its playback buffer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub silence_timeout_ms: u64,
    pub max_utterance_ms: u64,
    pub grace_window_ms: u64,
    pub playback_frame_samples: usize,
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }
}

/// Tunable parameters for the enhancement pipeline stages.
///
/// Exact DSP constants are deployment tunables, not hard-coded values; the
/// defaults match what was validated against recorded playroom audio.
///
/// ## Fields:
/// - `target_peak`: Normalization target as a fraction of full scale
/// - `noise_reduction_ratio`: Proportional noise floor subtraction (0.0-1.0)
/// - `band_low_hz` / `band_high_hz`: Voice bandpass edges
/// - `percussive_gain`: Residual transient level after HPSS recombination
/// - `compression_ratio`: Dynamic range compression slope above threshold
/// - `compression_threshold`: Envelope level where compression engages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementConfig {
    pub target_peak: f32,
    pub noise_reduction_ratio: f32,
    pub band_low_hz: f32,
    pub band_high_hz: f32,
    pub percussive_gain: f32,
    pub compression_ratio: f32,
    pub compression_threshold: f32,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - Higher concurrent sessions: More devices, but requires more CPU/memory
/// - More enhancement workers: Lower queue latency, more CPU under load
/// - Larger pending queue: Absorbs bursts, but delays acks further
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub enhancement_workers: usize,
    pub pending_utterance_queue: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                bit_depth: 16,
                channels: 1,
                frame_samples: 1024,
            },
            protocol: ProtocolConfig {
                handshake_timeout_ms: 5_000,
                heartbeat_interval_ms: 15_000,
                heartbeat_timeout_ms: 45_000,
                silence_timeout_ms: 1_500,
                max_utterance_ms: 30_000,
                grace_window_ms: 60_000,
                playback_frame_samples: 1024,
            },
            enhancement: EnhancementConfig {
                target_peak: 0.8,
                noise_reduction_ratio: 0.8,
                band_low_hz: 80.0,
                band_high_hz: 6000.0,
                percussive_gain: 0.1,
                compression_ratio: 4.0,
                compression_threshold: 0.3,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 200,
                enhancement_workers: 4,
                pending_utterance_queue: 32,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_PROTOCOL_GRACE_WINDOW_MS=30000`: Shorter resumption window
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {} bits",
                self.audio.bit_depth
            ));
        }

        if self.audio.frame_samples == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if self.protocol.handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Handshake timeout must be greater than 0"));
        }

        if self.protocol.max_utterance_ms <= self.protocol.silence_timeout_ms {
            return Err(anyhow::anyhow!(
                "Max utterance duration must exceed the silence timeout"
            ));
        }

        if !(0.0..=1.0).contains(&self.enhancement.target_peak) {
            return Err(anyhow::anyhow!("Normalization target must be within [0, 1]"));
        }

        if !(0.0..=1.0).contains(&self.enhancement.noise_reduction_ratio) {
            return Err(anyhow::anyhow!("Noise reduction ratio must be within [0, 1]"));
        }

        if self.enhancement.band_low_hz >= self.enhancement.band_high_hz {
            return Err(anyhow::anyhow!("Voice band low edge must be below high edge"));
        }

        if self.enhancement.band_high_hz * 2.0 > self.audio.sample_rate as f32 {
            return Err(anyhow::anyhow!(
                "Voice band high edge exceeds Nyquist for {} Hz audio",
                self.audio.sample_rate
            ));
        }

        if self.enhancement.compression_ratio < 1.0 {
            return Err(anyhow::anyhow!("Compression ratio must be at least 1:1"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.enhancement_workers == 0 {
            return Err(anyhow::anyhow!("Enhancement worker count must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are touched. For example, sending
    /// `{"performance": {"enhancement_workers": 8}}` changes only the worker
    /// count. The merged configuration is re-validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(protocol) = partial.get("protocol") {
            if let Some(v) = protocol.get("silence_timeout_ms").and_then(|v| v.as_u64()) {
                self.protocol.silence_timeout_ms = v;
            }
            if let Some(v) = protocol.get("max_utterance_ms").and_then(|v| v.as_u64()) {
                self.protocol.max_utterance_ms = v;
            }
            if let Some(v) = protocol.get("grace_window_ms").and_then(|v| v.as_u64()) {
                self.protocol.grace_window_ms = v;
            }
            if let Some(v) = protocol
                .get("heartbeat_interval_ms")
                .and_then(|v| v.as_u64())
            {
                self.protocol.heartbeat_interval_ms = v;
            }
        }

        if let Some(enhancement) = partial.get("enhancement") {
            if let Some(v) = enhancement.get("target_peak").and_then(|v| v.as_f64()) {
                self.enhancement.target_peak = v as f32;
            }
            if let Some(v) = enhancement
                .get("noise_reduction_ratio")
                .and_then(|v| v.as_f64())
            {
                self.enhancement.noise_reduction_ratio = v as f32;
            }
            if let Some(v) = enhancement.get("compression_ratio").and_then(|v| v.as_f64()) {
                self.enhancement.compression_ratio = v as f32;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(v) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = v as usize;
            }
            if let Some(v) = performance
                .get("enhancement_workers")
                .and_then(|v| v.as_u64())
            {
                self.performance.enhancement_workers = v as usize;
            }
            if let Some(v) = performance
                .get("pending_utterance_queue")
                .and_then(|v| v.as_u64())
            {
                self.performance.pending_utterance_queue = v as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.protocol.grace_window_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.enhancement.band_high_hz = 9000.0; // above Nyquist at 16 kHz
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.protocol.max_utterance_ms = 1_000; // below the silence timeout
        assert!(config.validate().is_err());
    }

    /// Test that runtime configuration updates work correctly.
    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"enhancement_workers": 8}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.performance.enhancement_workers, 8);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
    }

    /// Updates that would make the configuration invalid are rejected.
    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"enhancement": {"noise_reduction_ratio": 3.5}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}

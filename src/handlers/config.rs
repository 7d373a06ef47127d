//! Runtime configuration endpoints.
//!
//! `GET /api/v1/config` returns the active configuration; `PUT` applies a
//! partial update. Changes affect new sessions and utterances only: anything
//! already in flight keeps the parameters it started with.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str).map_err(|e| {
        AppError::ValidationError(e.to_string())
    })?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

/// The config fields exposed over HTTP. Secrets never live in AppConfig, so
/// this is a full projection.
fn config_view(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "channels": config.audio.channels,
            "bit_depth": config.audio.bit_depth,
            "frame_samples": config.audio.frame_samples
        },
        "protocol": {
            "handshake_timeout_ms": config.protocol.handshake_timeout_ms,
            "heartbeat_interval_ms": config.protocol.heartbeat_interval_ms,
            "silence_timeout_ms": config.protocol.silence_timeout_ms,
            "max_utterance_ms": config.protocol.max_utterance_ms,
            "grace_window_ms": config.protocol.grace_window_ms,
            "playback_frame_samples": config.protocol.playback_frame_samples
        },
        "enhancement": {
            "target_peak": config.enhancement.target_peak,
            "noise_reduction_ratio": config.enhancement.noise_reduction_ratio,
            "band_low_hz": config.enhancement.band_low_hz,
            "band_high_hz": config.enhancement.band_high_hz,
            "percussive_gain": config.enhancement.percussive_gain,
            "compression_ratio": config.enhancement.compression_ratio,
            "compression_threshold": config.enhancement.compression_threshold
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "enhancement_workers": config.performance.enhancement_workers,
            "pending_utterance_queue": config.performance.pending_utterance_queue
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{body::to_bytes, http::StatusCode};

    #[actix_web::test]
    async fn test_get_config_projection() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let resp = get_config(state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["config"]["audio"]["sample_rate"], 16000);
        assert_eq!(value["config"]["protocol"]["grace_window_ms"], 60000);
    }

    #[actix_web::test]
    async fn test_update_config_partial() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let body = web::Json(serde_json::json!({
            "performance": { "enhancement_workers": 8 }
        }));

        let resp = update_config(state.clone(), body).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().performance.enhancement_workers, 8);
        // Untouched fields survive
        assert_eq!(state.get_config().audio.sample_rate, 16000);
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let body = web::Json(serde_json::json!({
            "enhancement": { "noise_reduction_ratio": 2.0 }
        }));
        assert!(update_config(state.clone(), body).await.is_err());
        // Config unchanged
        assert!((state.get_config().enhancement.noise_reduction_ratio - 0.8).abs() < 1e-6);
    }
}

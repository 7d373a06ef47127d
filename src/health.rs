//! # Health and Metrics Endpoints
//!
//! `/api/v1/health` for liveness probes and fleet dashboards,
//! `/api/v1/metrics` for the full counter dump. Both read only atomics and
//! the config lock, so they stay cheap under load.

use crate::state::{AppState, GatewayMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let metrics = &state.metrics;

    let active_sessions = GatewayMetrics::get(&metrics.active_sessions);
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        active_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };
    let load_status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": active_sessions,
            "max": config.performance.max_concurrent_sessions,
            "usage_percent": (session_usage * 100.0).round()
        },
        "memory": memory_info(),
        "system": {
            "status": load_status
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let m = &state.metrics;

    let request_count = GatewayMetrics::get(&m.request_count);
    let error_count = GatewayMetrics::get(&m.error_count);

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": request_count,
            "total_errors": error_count,
            "error_rate": if request_count > 0 {
                error_count as f64 / request_count as f64
            } else {
                0.0
            }
        },
        "sessions": {
            "active": GatewayMetrics::get(&m.active_sessions),
            "created": GatewayMetrics::get(&m.sessions_created),
            "resumed": GatewayMetrics::get(&m.sessions_resumed),
            "expired": GatewayMetrics::get(&m.sessions_expired),
            "max": config.performance.max_concurrent_sessions
        },
        "streaming": {
            "frames_received": GatewayMetrics::get(&m.frames_received),
            "utterances_completed": GatewayMetrics::get(&m.utterances_completed),
            "utterances_failed": GatewayMetrics::get(&m.utterances_failed),
            "utterances_with_gaps": GatewayMetrics::get(&m.utterances_with_gaps)
        },
        "enhancement": {
            "completed": GatewayMetrics::get(&m.enhancements_completed),
            "stage_failures": GatewayMetrics::get(&m.enhancement_stage_failures),
            "workers": config.performance.enhancement_workers,
            "queue_capacity": config.performance.pending_utterance_queue
        },
        "responses": {
            "barged_in": GatewayMetrics::get(&m.responses_barged_in)
        },
        "memory": memory_info()
    }))
}

fn memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{body::to_bytes, http::StatusCode};

    #[actix_web::test]
    async fn test_health_check_reports_healthy() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let resp = health_check(state).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["system"]["status"], "normal");
    }

    #[actix_web::test]
    async fn test_metrics_counters_flow_through() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        state.increment_request_count();
        GatewayMetrics::incr(&state.metrics.frames_received);
        GatewayMetrics::incr(&state.metrics.utterances_completed);

        let resp = detailed_metrics(state).await;
        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["http"]["total_requests"], 1);
        assert_eq!(value["streaming"]["frames_received"], 1);
        assert_eq!(value["streaming"]["utterances_completed"], 1);
    }
}

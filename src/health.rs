use crate::audiohook::registry::RegistryStats;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;
use std::sync::atomic::Ordering;

/// Liveness plus a capacity summary. Answers 503 while the registry drains so
/// load balancers stop routing new gateways here.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let sessions = state.registry.stats();

    let body = json!({
        "status": if sessions.draining { "draining" } else { "healthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": sessions.active_sessions
        },
        "memory": get_memory_info(),
        "system": get_system_status(&sessions)
    });

    if sessions.draining {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let sessions = state.registry.stats();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "audiohook": {
            "connections_total": state.counters.audiohook_connections.load(Ordering::Relaxed),
            "sessions": sessions
        },
        "loadtest": {
            "runs_total": state.counters.loadtest_runs.load(Ordering::Relaxed)
        },
        "memory": get_memory_info()
    }))
}

#[cfg(target_os = "linux")]
fn read_proc_memory() -> Option<(u64, u64)> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", process::id())).ok()?;
    let field = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };
    Some((field("VmRSS:"), field("VmSize:")))
}

#[cfg(not(target_os = "linux"))]
fn read_proc_memory() -> Option<(u64, u64)> {
    let _ = process::id();
    None
}

fn get_memory_info() -> serde_json::Value {
    match read_proc_memory() {
        Some((resident, virtual_size)) => json!({
            "resident_memory_bytes": resident,
            "virtual_memory_bytes": virtual_size,
            "available": true
        }),
        None => json!({
            "resident_memory_bytes": 0,
            "virtual_memory_bytes": 0,
            "available": false,
            "note": "Memory info not available on this platform"
        }),
    }
}

fn get_system_status(sessions: &RegistryStats) -> serde_json::Value {
    let session_usage = if sessions.max_sessions > 0 {
        sessions.active_sessions as f64 / sessions.max_sessions as f64
    } else {
        0.0
    };

    let status = if sessions.draining {
        "draining"
    } else if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": sessions.max_sessions,
        "current_sessions": sessions.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration after all sources were merged.
///
/// Configuration is fixed for the lifetime of the process; protocol constants
/// are never changed under live sessions.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port,
                "log_format": config.server.log_format
            },
            "protocol": config.protocol,
            "performance": {
                "max_concurrent_sessions": config.performance.max_concurrent_sessions,
                "shutdown_grace_ms": config.performance.shutdown_grace_ms
            },
            "loadtest": {
                "target": config.loadtest_target().unwrap_or("loopback"),
                "deadline_slack_ms": config.loadtest.deadline_slack_ms,
                "response_timeout_ms": config.loadtest.response_timeout_ms,
                "max_concurrency": config.loadtest.max_concurrency,
                "progress_interval_ms": config.loadtest.progress_interval_ms
            }
        }
    })))
}

//! Read-only view of live sessions, plus an operator close.

use crate::audiohook::message::CloseReason;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.registry.list();
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": state.registry.count(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let id = path.into_inner();
    state
        .registry
        .get(&id)
        .map(|summary| HttpResponse::Ok().json(summary))
        .ok_or_else(|| AppError::NotFound(format!("Session {} is not active", id)))
}

/// Ask a session to close. The connection runs the normal close handshake, so
/// the response only confirms the request was delivered.
pub async fn close_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let id = path.into_inner();
    if state.registry.is_draining() {
        return Err(AppError::ServiceUnavailable(
            "server is shutting down".to_string(),
        ));
    }
    if !state.registry.request_close(&id, CloseReason::End) {
        return Err(AppError::NotFound(format!("Session {} is not active", id)));
    }
    Ok(HttpResponse::Accepted().json(json!({
        "status": "closing",
        "session_id": id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audiohook::codec::RawFrame;
    use crate::audiohook::connection::run_server_connection;
    use crate::audiohook::transport::{self, Outgoing, TransportEvent};
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};

    fn app_routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/sessions", web::get().to(list_sessions))
            .route("/sessions/{id}", web::get().to(get_session))
            .route("/sessions/{id}", web::delete().to(close_session));
    }

    #[actix_web::test]
    async fn test_unknown_session_is_not_found() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(App::new().app_data(state).configure(app_routes)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/sessions/nope").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(&app, test::TestRequest::delete().uri("/sessions/nope").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    /// Test that an operator close reaches a live session and ends it with `end`.
    #[actix_web::test]
    async fn test_list_get_and_close_live_session() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let (session_end, mut socket) = transport::channel(&state.protocol);
        let task = actix_web::rt::spawn(run_server_connection(
            state.protocol.clone(),
            state.registry.clone(),
            session_end,
            None,
        ));

        socket
            .inbound
            .send(TransportEvent::Frame(RawFrame::text(
                r#"{"seq":0,"type":"open","sessionId":"call-7","media":[]}"#,
            )))
            .await
            .unwrap();
        assert!(matches!(socket.outbound.recv().await, Some(Outgoing::Frame(_))));
        while state.registry.get("call-7").is_none() {
            tokio::task::yield_now().await;
        }

        let app = test::init_service(App::new().app_data(state.clone()).configure(app_routes)).await;

        let req = test::TestRequest::get().uri("/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["sessionId"], "call-7");

        let req = test::TestRequest::get().uri("/sessions/call-7").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "open");

        let resp = test::call_service(&app, test::TestRequest::delete().uri("/sessions/call-7").to_request()).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        // The server now sends close{end}; answer it
        let Some(Outgoing::Frame(close)) = socket.outbound.recv().await else {
            panic!("expected a close frame");
        };
        let close: serde_json::Value = serde_json::from_slice(&close.payload).unwrap();
        assert_eq!(close["type"], "close");
        assert_eq!(close["reason"], "end");
        socket
            .inbound
            .send(TransportEvent::Frame(RawFrame::text(r#"{"seq":1,"type":"closed"}"#)))
            .await
            .unwrap();

        let summary = task.await.unwrap();
        assert_eq!(summary.close_reason, Some(CloseReason::End));
        assert!(state.registry.is_empty());
    }
}

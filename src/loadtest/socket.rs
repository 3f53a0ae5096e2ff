//! # Load-Test WebSocket Endpoint
//!
//! `/api/v1/loadtest/ws` runs one load test per connection.
//!
//! ## Message Flow:
//! - **Client → Server**: `{"type":"start","config":{...}}`, later optionally
//!   `{"type":"cancel"}`
//! - **Server → Client**: `started`, periodic `progress`, then one `result`
//!   carrying the report (or `error` for a bad request), then close
//!
//! Closing the socket mid-run cancels the run the same way `cancel` does.

use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::orchestrator::run_load_test;
use crate::loadtest::stats::{LoadTestReport, Progress};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Requests accepted from the load-test client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoadTestRequest {
    Start { config: LoadTestConfig },
    Cancel,
}

/// Events streamed back while a run is in progress.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoadTestEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        target: String,
        sessions: usize,
        concurrency: usize,
        /// Scripted length of one wave of sessions
        nominal_duration_ms: u64,
        deadline_ms: u64,
    },
    Progress(Progress),
    Result { report: LoadTestReport },
    Error { message: String },
}

pub struct LoadTestSocket {
    state: web::Data<AppState>,
    /// Set once a run has been started on this connection
    run: Option<CancellationToken>,
}

impl LoadTestSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self { state, run: None }
    }

    fn send_event(&self, event: &LoadTestEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(e) => warn!(error = %e, "Failed to serialize load-test event"),
        }
    }

    fn reject(&self, message: impl Into<String>, ctx: &mut ws::WebsocketContext<Self>) {
        self.send_event(&LoadTestEvent::Error { message: message.into() }, ctx);
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Policy,
            description: None,
        }));
        ctx.stop();
    }

    fn start_run(&mut self, config: LoadTestConfig, ctx: &mut ws::WebsocketContext<Self>) {
        let settings = &self.state.get_config().loadtest;
        if let Err(message) = config.validate(settings) {
            self.reject(message, ctx);
            return;
        }

        let options = self.state.loadtest_options();
        let cancel = CancellationToken::new();
        self.run = Some(cancel.clone());
        self.state.record_loadtest_run();

        self.send_event(
            &LoadTestEvent::Started {
                target: options.connector.describe(),
                sessions: config.total_sessions(),
                concurrency: config.concurrency,
                nominal_duration_ms: config.nominal_duration().as_millis() as u64,
                deadline_ms: config.deadline(options.deadline_slack).as_millis() as u64,
            },
            ctx,
        );

        let (event_tx, event_rx) = mpsc::channel(16);
        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        ctx.add_stream(ReceiverStream::new(event_rx));

        tokio::spawn(async move {
            let forward_tx = event_tx.clone();
            let forward = async move {
                while let Some(progress) = progress_rx.recv().await {
                    if forward_tx.send(LoadTestEvent::Progress(progress)).await.is_err() {
                        break;
                    }
                }
            };
            let (report, ()) = tokio::join!(run_load_test(config, options, cancel, Some(progress_tx)), forward);
            // The socket may be gone by now
            let _ = event_tx.send(LoadTestEvent::Result { report }).await;
        });
    }

    fn handle_request(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<LoadTestRequest>(text) {
            Ok(LoadTestRequest::Start { config }) => {
                if self.run.is_some() {
                    self.send_event(
                        &LoadTestEvent::Error { message: "a run is already in progress".to_string() },
                        ctx,
                    );
                } else {
                    self.start_run(config, ctx);
                }
            }
            Ok(LoadTestRequest::Cancel) => match &self.run {
                Some(cancel) => {
                    info!("Load test cancelled by client");
                    cancel.cancel();
                }
                None => self.reject("no run in progress", ctx),
            },
            Err(e) => {
                if self.run.is_some() {
                    self.send_event(&LoadTestEvent::Error { message: format!("invalid request: {}", e) }, ctx);
                } else {
                    self.reject(format!("invalid request: {}", e), ctx);
                }
            }
        }
    }
}

impl Actor for LoadTestSocket {
    type Context = ws::WebsocketContext<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(cancel) = &self.run {
            cancel.cancel();
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LoadTestSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_request(&text, ctx),
            Ok(ws::Message::Binary(_)) => self.reject("binary messages are not accepted", ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Close(_)) => ctx.stop(),
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "Load-test socket protocol error");
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<LoadTestEvent> for LoadTestSocket {
    fn handle(&mut self, event: LoadTestEvent, ctx: &mut Self::Context) {
        self.send_event(&event, ctx);
        if matches!(event, LoadTestEvent::Result { .. }) {
            ctx.close(Some(ws::CloseCode::Normal.into()));
            ctx.stop();
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

pub async fn loadtest_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "New load-test connection");
    ws::start(LoadTestSocket::new(app_state), &req, stream)
}

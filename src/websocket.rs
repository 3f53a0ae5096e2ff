//! # AudioHook WebSocket Endpoint
//!
//! Bridges actix websocket connections at `/api/v1/audiohook/ws` to the session
//! engine. The actor owns no protocol state: it forwards data frames into the
//! connection's transport channel and writes whatever the session task queues
//! back out.
//!
//! ## Per connection:
//! 1. **Upgrade**: the HTTP request is upgraded with a frame size limit derived
//!    from the configured payload limit
//! 2. **Session task**: `run_server_connection` is spawned on the runtime with
//!    the session end of a fresh transport channel
//! 3. **Inbound**: text/binary frames become [`TransportEvent::Frame`]; oversized
//!    frames become [`TransportEvent::Rejected`]
//! 4. **Outbound**: the session's queue is attached to the actor as a stream
//! 5. **Teardown**: a close from either side ends both the actor and the task
//!
//! ## Heartbeat:
//! Transport-level pings keep idle proxies from dropping the connection. They
//! are independent of the protocol's own `ping`/`pong` messages and of the
//! session inactivity timeout.

use crate::audiohook::codec::{FrameCodec, Opcode, RawFrame};
use crate::audiohook::connection::run_server_connection;
use crate::audiohook::message::CloseReason;
use crate::audiohook::transport::{self, Outgoing, TransportEvent};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytestring::ByteString;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// How often transport pings are sent.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// No transport traffic for this long means the peer is gone.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// One websocket connection, bridged to its session task.
pub struct AudioHookSocket {
    state: web::Data<AppState>,
    peer: Option<String>,
    /// Sender into the session task; `None` once the socket side has ended
    inbound: Option<mpsc::Sender<TransportEvent>>,
    last_heartbeat: Instant,
}

impl AudioHookSocket {
    pub fn new(state: web::Data<AppState>, peer: Option<String>) -> Self {
        Self {
            state,
            peer,
            inbound: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Forward an event to the session task without blocking the actor.
    fn forward(&mut self, event: TransportEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };
        match inbound.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // Dropping the sender ends the session as a transport failure
                warn!(peer = ?self.peer, "Inbound queue full, dropping connection");
                self.inbound = None;
                ctx.stop();
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = ?self.peer, "Session task already finished");
                self.inbound = None;
            }
        }
    }

    fn write_frame(&self, frame: RawFrame, ctx: &mut ws::WebsocketContext<Self>) {
        match frame.opcode {
            Opcode::Text => match ByteString::try_from(frame.payload) {
                Ok(text) => ctx.text(text),
                Err(e) => warn!(peer = ?self.peer, error = %e, "Dropping non UTF-8 control frame"),
            },
            Opcode::Binary => ctx.binary(frame.payload),
        }
    }
}

/// Translate one websocket stream item into a transport event.
///
/// Transport-level control frames (ping/pong/nop) yield `None`.
fn inbound_event(msg: Result<ws::Message, ws::ProtocolError>) -> Option<TransportEvent> {
    match msg {
        Ok(ws::Message::Text(text)) => Some(TransportEvent::Frame(RawFrame {
            opcode: Opcode::Text,
            payload: text.into_bytes(),
        })),
        Ok(ws::Message::Binary(data)) => Some(TransportEvent::Frame(RawFrame::binary(data))),
        Ok(ws::Message::Close(_)) => Some(TransportEvent::Closed),
        Ok(ws::Message::Continuation(_)) => Some(TransportEvent::Rejected(
            "fragmented messages are not supported".to_string(),
        )),
        Ok(ws::Message::Ping(_)) | Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => None,
        Err(ws::ProtocolError::Overflow) => Some(TransportEvent::Rejected(
            "frame exceeds the maximum payload size".to_string(),
        )),
        Err(err) => Some(TransportEvent::Failed(err.to_string())),
    }
}

/// Websocket close frame for the session's close reason.
fn close_frame(reason: Option<CloseReason>) -> ws::CloseReason {
    let code = match reason {
        Some(CloseReason::End) | Some(CloseReason::Timeout) => ws::CloseCode::Normal,
        Some(CloseReason::Shutdown) => ws::CloseCode::Away,
        Some(CloseReason::Error) | Some(CloseReason::Disconnect) | None => ws::CloseCode::Error,
    };
    ws::CloseReason {
        code,
        description: reason.and_then(|r| serde_json::to_value(r).ok()?.as_str().map(str::to_string)),
    }
}

impl Actor for AudioHookSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (session_end, socket_end) = transport::channel(&self.state.protocol);
        self.inbound = Some(socket_end.inbound);
        ctx.add_stream(ReceiverStream::new(socket_end.outbound));

        tokio::spawn(run_server_connection(
            self.state.protocol.clone(),
            self.state.registry.clone(),
            session_end,
            self.peer.clone(),
        ));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(peer = ?act.peer, "WebSocket heartbeat timeout, closing connection");
                act.forward(TransportEvent::Failed("heartbeat timeout".to_string()), ctx);
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        debug!(peer = ?self.peer, "AudioHook socket started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(inbound) = self.inbound.take() {
            // The session task treats a dropped sender the same way
            let _ = inbound.try_send(TransportEvent::Closed);
        }
        debug!(peer = ?self.peer, "AudioHook socket stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioHookSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();
        if let Ok(ws::Message::Ping(data)) = &msg {
            ctx.pong(data);
        }
        if let Some(event) = inbound_event(msg) {
            self.forward(event, ctx);
        }
    }

    /// Peer went away; let the session finish before stopping.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        if let Some(inbound) = self.inbound.take() {
            let _ = inbound.try_send(TransportEvent::Closed);
        }
    }
}

impl StreamHandler<Outgoing> for AudioHookSocket {
    fn handle(&mut self, item: Outgoing, ctx: &mut Self::Context) {
        match item {
            Outgoing::Frame(frame) => self.write_frame(frame, ctx),
            Outgoing::Close(reason) => {
                ctx.close(Some(close_frame(reason)));
                ctx.stop();
            }
        }
    }

    /// The session task is gone.
    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to an [`AudioHookSocket`]
/// actor. The frame size limit lets the transport reject oversized frames
/// before they are buffered in full.
pub async fn audiohook_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req.connection_info().peer_addr().map(str::to_string);
    info!(peer = ?peer, "New AudioHook connection");
    app_state.record_audiohook_connection();

    let max_frame = FrameCodec::new(app_state.protocol.max_payload_bytes).max_wire_frame();
    ws::WsResponseBuilder::new(AudioHookSocket::new(app_state, peer), &req, stream)
        .frame_size(max_frame)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audiohook::client::{ClientEvent, ClientSession};
    use crate::audiohook::message::{AudioEncoding, MediaFormat};
    use crate::config::{AppConfig, MAX_PAYLOAD_LIMIT};
    use crate::loadtest::client::{run_client, ClientScript};
    use crate::loadtest::config::LoadTestConfig;
    use crate::loadtest::connector::Connector;
    use crate::loadtest::stats::ClientOutcome;
    use actix_web::{App, HttpServer};
    use tokio_util::sync::CancellationToken;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn test_inbound_event_mapping() {
        assert_eq!(
            inbound_event(Ok(ws::Message::Text("{}".into()))),
            Some(TransportEvent::Frame(RawFrame::text("{}")))
        );
        assert_eq!(inbound_event(Ok(ws::Message::Close(None))), Some(TransportEvent::Closed));
        assert_eq!(inbound_event(Ok(ws::Message::Ping(Bytes::new()))), None);
        assert!(matches!(
            inbound_event(Err(ws::ProtocolError::Overflow)),
            Some(TransportEvent::Rejected(_))
        ));
    }

    #[test]
    fn test_close_frame_codes() {
        let frame = close_frame(Some(CloseReason::End));
        assert_eq!(frame.code, ws::CloseCode::Normal);
        assert_eq!(frame.description.as_deref(), Some("end"));
        assert_eq!(close_frame(Some(CloseReason::Shutdown)).code, ws::CloseCode::Away);
        assert_eq!(close_frame(None).code, ws::CloseCode::Error);
    }

    async fn start_server(state: web::Data<AppState>) -> (String, actix_web::dev::ServerHandle) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .route("/api/v1/audiohook/ws", web::get().to(audiohook_websocket))
        })
        .workers(1)
        .listen(listener)
        .unwrap()
        .run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (format!("ws://{}/api/v1/audiohook/ws", addr), handle)
    }

    /// Test that a full session works over a real websocket connection.
    #[actix_web::test]
    async fn test_session_over_websocket() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let registry = state.registry.clone();
        let mut summaries = registry.subscribe();

        let (url, handle) = start_server(state.clone()).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let mut client = ClientSession::new(MAX_PAYLOAD_LIMIT);

        async fn next_frame(
            socket: &mut tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        ) -> RawFrame {
            loop {
                match socket.next().await.unwrap().unwrap() {
                    Message::Text(text) => return RawFrame::text(text),
                    Message::Binary(data) => return RawFrame::binary(data),
                    _ => continue,
                }
            }
        }

        let open = client
            .open(None, vec![MediaFormat::new(AudioEncoding::Pcmu, 8000, 1)], Some(320))
            .unwrap();
        socket.send(Message::Text(String::from_utf8(open.payload.to_vec()).unwrap())).await.unwrap();
        let opened = client.on_frame(&next_frame(&mut socket).await).unwrap();
        assert!(matches!(opened, ClientEvent::Opened { max_frame_size: 320, .. }));

        for _ in 0..3 {
            let audio = client.audio(Bytes::from(vec![0xFF; 160])).unwrap();
            socket.send(Message::Binary(audio.payload.to_vec())).await.unwrap();
        }

        let close = client.close(CloseReason::End).unwrap();
        socket.send(Message::Text(String::from_utf8(close.payload.to_vec()).unwrap())).await.unwrap();
        let closed = client.on_frame(&next_frame(&mut socket).await).unwrap();
        assert!(matches!(closed, ClientEvent::Closed { .. }));

        let summary = summaries.recv().await.unwrap();
        assert_eq!(summary.position, 480);
        assert_eq!(summary.close_reason, Some(CloseReason::End));

        // The worker thread removes the entry right after publishing the summary
        for _ in 0..50 {
            if registry.is_empty() {
                break;
            }
            actix_web::rt::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());

        handle.stop(true).await;
    }

    /// Test that a scripted load-test client with a tiny frame size finishes
    /// over a real socket, including the websocket close.
    #[actix_web::test]
    async fn test_loadtest_client_over_websocket() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let mut summaries = state.registry.subscribe();
        let (url, handle) = start_server(state.clone()).await;

        let connector = Connector::WebSocket { url };
        let script = ClientScript::from_config(
            &LoadTestConfig { frame_count: 3, frame_size: 16, frame_interval_ms: 5, ..Default::default() },
            Duration::from_secs(5),
        );
        let outcome = run_client(&connector, &script, &CancellationToken::new()).await;
        let ClientOutcome::Completed(stats) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(stats.bytes_sent, 48);

        let summary = summaries.recv().await.unwrap();
        assert_eq!(summary.position, 48);
        assert_eq!(summary.close_reason, Some(CloseReason::End));

        handle.stop(true).await;
    }
}

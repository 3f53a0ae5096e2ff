//! One simulated media gateway: open → paced audio → close.

use crate::audiohook::client::{ClientEvent, ClientSession};
use crate::audiohook::message::{AudioEncoding, CloseReason, MediaFormat};
use crate::config::MAX_PAYLOAD_LIMIT;
use crate::error::{ErrorCode, ProtocolError};
use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::connector::{ClientConnection, Connector};
use crate::loadtest::stats::{ClientOutcome, ClientStats};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// µ-law silence
const FILL_BYTE: u8 = 0xFF;

/// Script every simulated client follows.
#[derive(Debug, Clone)]
pub struct ClientScript {
    pub media: MediaFormat,
    pub frame_count: u64,
    pub frame_size: usize,
    pub frame_interval: Duration,
    pub pause_every: Option<u64>,
    /// How long to wait for `opened` and `closed`
    pub response_timeout: Duration,
}

impl ClientScript {
    pub fn from_config(config: &LoadTestConfig, response_timeout: Duration) -> Self {
        Self {
            media: MediaFormat::new(AudioEncoding::Pcmu, 8000, 1),
            frame_count: config.frame_count,
            frame_size: config.frame_size,
            frame_interval: config.frame_interval(),
            pause_every: config.pause_every_frames.filter(|n| *n > 0),
            response_timeout,
        }
    }

    fn pauses_before(&self, frame_index: u64) -> bool {
        self.pause_every
            .map(|n| (frame_index + 1) % n == 0)
            .unwrap_or(false)
    }
}

/// Why a client stopped early, categorized for the report.
#[derive(Debug)]
struct Failure {
    code: ErrorCode,
    message: String,
}

impl From<ProtocolError> for Failure {
    fn from(err: ProtocolError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

enum Ending {
    Completed,
    Cancelled,
}

/// Run the script once. Never panics on protocol trouble; every problem becomes
/// a categorized outcome.
pub async fn run_client(connector: &Connector, script: &ClientScript, cancel: &CancellationToken) -> ClientOutcome {
    let started = Instant::now();
    let mut stats = ClientStats::default();

    let result = drive(connector, script, cancel, started, &mut stats).await;
    stats.duration = started.elapsed();

    match result {
        Ok(Ending::Completed) => ClientOutcome::Completed(stats),
        Ok(Ending::Cancelled) => ClientOutcome::Cancelled(stats),
        Err(failure) => {
            debug!(code = %failure.code, message = %failure.message, "Simulated client failed");
            ClientOutcome::Failed {
                code: failure.code,
                message: failure.message,
                stats,
            }
        }
    }
}

async fn drive(
    connector: &Connector,
    script: &ClientScript,
    cancel: &CancellationToken,
    started: Instant,
    stats: &mut ClientStats,
) -> Result<Ending, Failure> {
    let mut conn = connector.connect().await?;
    let mut session = ClientSession::new(MAX_PAYLOAD_LIMIT);

    conn.send(session.open(None, vec![script.media], Some(script.frame_size))?)
        .await?;
    let opened = timeout(script.response_timeout, next_event(&mut conn, &mut session))
        .await
        .map_err(|_| ProtocolError::Timeout("no opened received".to_string()))??;
    match opened {
        ClientEvent::Opened { session_id, .. } => {
            debug!(
                session_id = %session_id,
                media = ?session.media(),
                max_frame_size = session.max_frame_size(),
                "Simulated client opened"
            );
        }
        ClientEvent::Failed { code, message } => return Err(Failure { code, message }),
        other => {
            return Err(ProtocolError::ProtocolViolation(format!("expected opened, got {:?}", other)).into())
        }
    }
    stats.open_latency = Some(started.elapsed());

    // The server may grant less than was asked for
    let payload = Bytes::from(vec![FILL_BYTE; script.frame_size.min(session.max_frame_size())]);
    let mut pacing = interval(script.frame_interval.max(Duration::from_millis(1)));
    pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cancelled = false;
    let mut sent = 0u64;

    while sent < script.frame_count {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            event = next_event(&mut conn, &mut session) => {
                handle_unsolicited(event?, &mut conn, &mut session).await?;
            }
            _ = pacing.tick() => {
                let pause = script.pauses_before(sent);
                if pause {
                    conn.send(session.pause()?).await?;
                }
                conn.send(session.audio(payload.clone())?).await?;
                if pause {
                    conn.send(session.resume()?).await?;
                }
                sent += 1;
                stats.frames_sent += 1;
                stats.bytes_sent += payload.len() as u64;
            }
        }
    }

    conn.send(session.close(CloseReason::End)?).await?;
    let closing = async {
        loop {
            match next_event(&mut conn, &mut session).await? {
                ClientEvent::Closed { .. } => return Ok(()),
                ClientEvent::Failed { code, message } => return Err(Failure { code, message }),
                _ => continue,
            }
        }
    };
    timeout(script.response_timeout, closing)
        .await
        .map_err(|_| ProtocolError::Timeout("no closed received".to_string()))??;
    conn.close().await;

    Ok(if cancelled { Ending::Cancelled } else { Ending::Completed })
}

async fn next_event(conn: &mut ClientConnection, session: &mut ClientSession) -> Result<ClientEvent, ProtocolError> {
    match conn.recv().await? {
        Some(raw) => session.on_frame(&raw),
        None => Err(ProtocolError::TransportFailure(
            "server closed the connection".to_string(),
        )),
    }
}

/// Server messages arriving mid-stream; anything that ends the session is a failure.
async fn handle_unsolicited(
    event: ClientEvent,
    conn: &mut ClientConnection,
    session: &mut ClientSession,
) -> Result<(), Failure> {
    match event {
        ClientEvent::Failed { code, message } => Err(Failure { code, message }),
        ClientEvent::CloseRequested { reason } => {
            conn.send(session.closed()?).await?;
            conn.close().await;
            let code = match reason {
                Some(CloseReason::Timeout) => ErrorCode::Timeout,
                _ => ErrorCode::TransportFailure,
            };
            Err(Failure {
                code,
                message: format!("server closed the session: {:?}", reason),
            })
        }
        _ => Ok(()),
    }
}

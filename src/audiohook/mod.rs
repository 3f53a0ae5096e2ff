//! # AudioHook Protocol Engine
//!
//! Server side of the AudioHook streaming protocol: a media gateway opens a
//! session, streams sequenced audio frames, and both sides close with a
//! handshake.
//!
//! ## Key Components:
//! - **codec**: text frames ↔ control messages, binary frames ↔ audio frames
//! - **message**: control message types and media formats
//! - **session**: the per-connection state machine (pure, no I/O)
//! - **registry**: process-wide session tracking, capacity and shutdown
//! - **transport**: channel pair between a socket and its session task
//! - **connection**: the task that drives one session over a transport
//! - **client**: client-side mirror of the state machine, used by the load tester
//!
//! ## Lifecycle:
//! ```text
//! AwaitingOpen ──open──▶ Open ──close/timeout/shutdown──▶ Closing ──closed──▶ Closed
//!       │                  │                                 │
//!       └──────────────────┴──────── any error ──────────────┴──▶ Errored
//! ```
//!
//! The websocket route itself lives in `src/websocket.rs`.

pub mod client;
pub mod codec;
pub mod connection;
pub mod message;
pub mod registry;
pub mod session;
pub mod transport;

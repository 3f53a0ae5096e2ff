//! # Load Testing
//!
//! Simulates many concurrent media gateways against an AudioHook endpoint and
//! reports per-category outcomes and latency distributions.
//!
//! A run is started over the `/api/v1/loadtest/ws` websocket (see `socket`),
//! which streams progress snapshots and a final report back to the caller.

pub mod client;
pub mod config;
pub mod connector;
pub mod orchestrator;
pub mod socket;
pub mod stats;

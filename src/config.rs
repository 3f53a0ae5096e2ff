//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables with the `APP_` prefix (`__` separates nested keys,
//!   e.g. `APP_PROTOCOL__INACTIVITY_TIMEOUT_MS=5000`)
//! - Deployment overrides: `SERVERHOST`/`SERVERPORT`, and `HOST`/`PORT`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `SERVERHOST`/`SERVERPORT`, then `HOST`/`PORT`
//! 2. `APP_` environment variables
//! 3. config.toml
//! 4. Defaults
//!
//! ## Protocol constants
//! Reason codes live in `error.rs`; everything numeric that governs the wire
//! protocol (payload limit, inactivity window, close grace, queue sizes, media
//! formats) is configured here so it is never inferred at runtime.

use crate::audiohook::message::{AudioEncoding, MediaFormat};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Hard ceiling for audio payloads; negotiated limits never exceed it.
pub const MAX_PAYLOAD_LIMIT: usize = 65536;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub performance: PerformanceConfig,
    pub loadtest: LoadTestSettings,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host` / `port`: bind address (defaults match the deployment: 127.0.0.1:3000)
/// - `log_format`: "pretty" for development, "json" for production log shipping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// AudioHook protocol settings, one copy per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted audio payload in bytes (the frame header is extra)
    pub max_payload_bytes: usize,
    /// Close the session when no frame arrives for this long
    pub inactivity_timeout_ms: u64,
    /// How long a server-initiated close waits for the peer's `closed`
    pub close_grace_ms: u64,
    /// Bounded outbound queue between the session task and the socket
    pub outbound_queue_capacity: usize,
    /// Bounded inbound queue between the socket and the session task
    pub inbound_queue_capacity: usize,
    /// A queued send that cannot complete within this window closes the session
    pub send_timeout_ms: u64,
    /// Media formats the server accepts, in preference order
    pub supported_media: Vec<MediaFormat>,
}

/// Performance and capacity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    /// Grace period granted to in-flight sessions on shutdown
    pub shutdown_grace_ms: u64,
}

/// Server-side knobs for the load-test endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestSettings {
    /// Remote AudioHook endpoint; empty means in-process loopback
    pub target_url: String,
    /// Added to the scripted run length to form the default run deadline
    pub deadline_slack_ms: u64,
    /// How long a simulated client waits for `opened`/`closed`
    pub response_timeout_ms: u64,
    pub max_concurrency: usize,
    pub progress_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                log_format: LogFormat::Pretty,
            },
            protocol: ProtocolConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 10_000,
                shutdown_grace_ms: 10_000,
            },
            loadtest: LoadTestSettings {
                target_url: String::new(),
                deadline_slack_ms: 30_000,
                response_timeout_ms: 10_000,
                max_concurrency: 1_000,
                progress_interval_ms: 1_000,
            },
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: MAX_PAYLOAD_LIMIT,
            inactivity_timeout_ms: 30_000,
            close_grace_ms: 5_000,
            outbound_queue_capacity: 64,
            inbound_queue_capacity: 256,
            send_timeout_ms: 5_000,
            supported_media: vec![
                MediaFormat::new(AudioEncoding::Pcmu, 8000, 1),
                MediaFormat::new(AudioEncoding::L16, 16000, 1),
                MediaFormat::new(AudioEncoding::L16, 8000, 1),
            ],
        }
    }
}

impl ProtocolConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Grace is capped by the inactivity window so the close path is always the shorter one.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms.min(self.inactivity_timeout_ms))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__LOG_FORMAT=json`
    /// - `APP_PROTOCOL__CLOSE_GRACE_MS=2000`
    /// - `SERVERPORT=3000` / `SERVERHOST=0.0.0.0`
    /// - `APP_ENV=production` switches logs to JSON unless a format was set explicitly
    pub fn load() -> Result<Self> {
        let mut settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&AppConfig::default())?)
            .add_source(::config::File::with_name("config").required(false))
            .add_source(
                ::config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if env::var("APP_ENV").map(|v| v == "production").unwrap_or(false)
            && env::var("APP_SERVER__LOG_FORMAT").is_err()
        {
            settings = settings.set_override("server.log_format", "json")?;
        }

        // Deployment platforms set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(host) = env::var("SERVERHOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("SERVERPORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let protocol = &self.protocol;
        if protocol.max_payload_bytes == 0 || protocol.max_payload_bytes > MAX_PAYLOAD_LIMIT {
            return Err(anyhow::anyhow!(
                "max_payload_bytes must be between 1 and {}",
                MAX_PAYLOAD_LIMIT
            ));
        }
        if protocol.inactivity_timeout_ms == 0 || protocol.close_grace_ms == 0 {
            return Err(anyhow::anyhow!("Protocol timeouts must be greater than 0"));
        }
        if protocol.outbound_queue_capacity == 0 || protocol.inbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Session queues must hold at least one frame"));
        }
        if protocol.send_timeout_ms == 0 {
            return Err(anyhow::anyhow!("send_timeout_ms must be greater than 0"));
        }
        if protocol.supported_media.is_empty() {
            return Err(anyhow::anyhow!("At least one supported media format is required"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if self.loadtest.max_concurrency == 0 {
            return Err(anyhow::anyhow!("Load-test max_concurrency must be greater than 0"));
        }

        Ok(())
    }

    pub fn loadtest_target(&self) -> Option<&str> {
        let url = self.loadtest.target_url.trim();
        if url.is_empty() {
            None
        } else {
            Some(url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.protocol.max_payload_bytes, 65536);
        assert!(config.validate().is_ok());
        assert!(config.loadtest_target().is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.protocol.max_payload_bytes = MAX_PAYLOAD_LIMIT + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.protocol.supported_media.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_close_grace_never_exceeds_inactivity() {
        let mut protocol = ProtocolConfig::default();
        protocol.inactivity_timeout_ms = 1_000;
        protocol.close_grace_ms = 5_000;
        assert_eq!(protocol.close_grace(), Duration::from_millis(1_000));
    }
}

//! # Application State Management
//!
//! Shared state handed to every HTTP handler and websocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: loaded once at startup, read-only afterwards (`Arc<AppConfig>`)
//! - **registry**: the process-wide [`SessionRegistry`], injected into every
//!   AudioHook connection and into the loopback load-test connector
//! - **metrics**: HTTP request counters updated by the metrics middleware
//!
//! ## Rust Concepts:
//! - **Arc<T>**: many handlers share one value; cloning an `AppState` clones
//!   pointers, never the data behind them
//! - **RwLock<T>**: HTTP metrics are written on every request but read rarely,
//!   so a plain lock is enough; session state never goes through it

use crate::audiohook::registry::SessionRegistry;
use crate::config::{AppConfig, ProtocolConfig};
use crate::loadtest::connector::Connector;
use crate::loadtest::orchestrator::RunOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Protocol settings shared by every session
    pub protocol: Arc<ProtocolConfig>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub counters: Arc<ConnectionCounters>,
    pub start_time: Instant,
}

/// HTTP request metrics.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Websocket upgrade counters (lock-free; bumped from actor code).
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub audiohook_connections: AtomicU64,
    pub loadtest_runs: AtomicU64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.performance.max_concurrent_sessions)),
            protocol: Arc::new(config.protocol.clone()),
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            counters: Arc::new(ConnectionCounters::default()),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    /// Where load-test clients connect: the configured URL, or this server's
    /// own registry over an in-process loopback.
    pub fn loadtest_options(&self) -> RunOptions {
        let settings = &self.config.loadtest;
        let connector = match self.config.loadtest_target() {
            Some(url) => Connector::WebSocket { url: url.to_string() },
            None => Connector::Loopback {
                config: self.protocol.clone(),
                registry: self.registry.clone(),
            },
        };
        RunOptions {
            connector,
            response_timeout: Duration::from_millis(settings.response_timeout_ms),
            deadline_slack: Duration::from_millis(settings.deadline_slack_ms),
            progress_interval: Duration::from_millis(settings.progress_interval_ms),
        }
    }

    // A panic while holding the metrics lock must not take the metrics down with it
    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_audiohook_connection(&self) {
        self.counters.audiohook_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loadtest_run(&self) {
        self.counters.loadtest_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

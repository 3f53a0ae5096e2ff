//! Load-test run options, as sent in the `start` message.
//!
//! ```json
//! {"concurrency":50,"frameCount":10,"frameSize":320,"frameIntervalMs":20,"rampUpMs":500}
//! ```

use crate::config::{LoadTestSettings, MAX_PAYLOAD_LIMIT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestConfig {
    /// Simultaneous sessions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Audio frames per session
    #[serde(default = "default_frame_count")]
    pub frame_count: u64,
    /// Bytes per audio frame
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// Pacing between frames; 0 sends as fast as the transport allows
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Session starts are spread evenly over this window
    #[serde(default)]
    pub ramp_up_ms: u64,
    /// Total sessions to run; defaults to `concurrency`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<usize>,
    /// Hard deadline for the whole run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Wrap every Nth frame in pause/resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_every_frames: Option<u64>,
}

fn default_concurrency() -> usize {
    10
}

fn default_frame_count() -> u64 {
    50
}

// 20ms of 8kHz PCMU
fn default_frame_size() -> usize {
    160
}

fn default_frame_interval_ms() -> u64 {
    20
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            frame_count: default_frame_count(),
            frame_size: default_frame_size(),
            frame_interval_ms: default_frame_interval_ms(),
            ramp_up_ms: 0,
            sessions: None,
            deadline_ms: None,
            pause_every_frames: None,
        }
    }
}

impl LoadTestConfig {
    pub fn validate(&self, settings: &LoadTestSettings) -> Result<(), String> {
        if self.concurrency == 0 || self.concurrency > settings.max_concurrency {
            return Err(format!(
                "concurrency must be between 1 and {}",
                settings.max_concurrency
            ));
        }
        if self.frame_size == 0 || self.frame_size > MAX_PAYLOAD_LIMIT {
            return Err(format!("frameSize must be between 1 and {}", MAX_PAYLOAD_LIMIT));
        }
        if self.sessions == Some(0) {
            return Err("sessions must be greater than 0".to_string());
        }
        if self.deadline_ms == Some(0) {
            return Err("deadlineMs must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn total_sessions(&self) -> usize {
        self.sessions.unwrap_or(self.concurrency)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn ramp_up(&self) -> Duration {
        Duration::from_millis(self.ramp_up_ms)
    }

    /// Scripted length of one session: ramp-up plus the paced frames.
    pub fn nominal_duration(&self) -> Duration {
        self.ramp_up() + self.frame_interval() * self.frame_count.min(u32::MAX as u64) as u32
    }

    /// Explicit deadline, or the scripted length of all waves plus `slack`.
    pub fn deadline(&self, slack: Duration) -> Duration {
        if let Some(ms) = self.deadline_ms {
            return Duration::from_millis(ms);
        }
        let waves = self.total_sessions().div_ceil(self.concurrency.max(1)) as u32;
        self.ramp_up() + self.frame_interval() * (self.frame_count.min(u32::MAX as u64) as u32) * waves.max(1) + slack
    }

    /// When client `index` should start, spreading starts evenly over the ramp.
    pub fn start_offset(&self, index: usize) -> Duration {
        let total = self.total_sessions();
        if total <= 1 || self.ramp_up_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.ramp_up_ms * index as u64 / total as u64)
    }
}

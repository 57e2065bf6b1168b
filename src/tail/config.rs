// SPDX-License-Identifier: Apache-2.0

//! Configuration for the tailer.

use serde::Deserialize;
use std::time::Duration;

/// Configuration for a [`Tailer`](crate::tail::Tailer)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailerConfig {
    /// Size of the scratch buffer used for every read (bytes)
    pub buffer_size: usize,

    /// Maximum number of lines read from one file per poll, so a busy file cannot starve
    /// the others
    pub max_lines_per_poll: usize,

    /// How long the worker sleeps after a pass that read nothing (in milliseconds)
    pub idle_interval_ms: u64,

    /// Pause between redeliveries of a line the consumer rejected (in milliseconds).
    /// Zero retries immediately after yielding the thread.
    pub reject_backoff_ms: u64,

    /// Deliver a trailing line that has no newline yet as an unterminated segment
    pub emit_partial_lines: bool,
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_max_lines_per_poll() -> usize {
    1_000
}

fn default_idle_interval_ms() -> u64 {
    250
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_lines_per_poll: default_max_lines_per_poll(),
            idle_interval_ms: default_idle_interval_ms(),
            reject_backoff_ms: 0,
            emit_partial_lines: true,
        }
    }
}

impl TailerConfig {
    /// Get the idle interval as a Duration
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    /// Get the reject backoff as a Duration
    pub fn reject_backoff(&self) -> Duration {
        Duration::from_millis(self.reject_backoff_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("buffer_size must be positive".to_string());
        }

        if self.max_lines_per_poll == 0 {
            return Err("max_lines_per_poll must be positive".to_string());
        }

        Ok(())
    }
}

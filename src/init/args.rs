// SPDX-License-Identifier: Apache-2.0

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::tail::TailerConfig;

#[derive(Debug, Args, Clone)]
pub struct TailArgs {
    /// Comma-separated files to tail (e.g., "/var/log/app.log,/var/log/db.log")
    #[arg(
        long = "file",
        env = "TAILSHIP_FILES",
        value_delimiter = ',',
        required = true
    )]
    pub files: Vec<PathBuf>,

    /// Size of the read buffer in bytes. Longer lines are delivered in segments.
    #[arg(long, env = "TAILSHIP_BUFFER_SIZE", default_value = "65536")]
    pub buffer_size: usize,

    /// Maximum number of lines read from one file before moving on to the next
    #[arg(long, env = "TAILSHIP_MAX_LINES_PER_POLL", default_value = "1000")]
    pub max_lines_per_poll: usize,

    /// Time in milliseconds to sleep when no file had new lines
    #[arg(long, env = "TAILSHIP_IDLE_INTERVAL_MS", default_value = "250")]
    pub idle_interval_ms: u64,

    /// Time in milliseconds to wait before redelivering a rejected line
    #[arg(long, env = "TAILSHIP_REJECT_BACKOFF_MS", default_value = "0")]
    pub reject_backoff_ms: u64,

    /// Also deliver a trailing line before its newline has been written. Such a line is
    /// delivered again, whole, once completed.
    #[arg(long, env = "TAILSHIP_PARTIAL_LINES", default_value = "false")]
    pub partial_lines: bool,

    /// Maximum time in milliseconds shipped lines stay unflushed and unacknowledged while
    /// files keep growing
    #[arg(long, env = "TAILSHIP_FLUSH_INTERVAL_MS", default_value = "1000")]
    pub flush_interval_ms: u64,

    /// Maximum time in milliseconds to wait for the final drain on shutdown
    #[arg(long, env = "TAILSHIP_STOP_TIMEOUT_MS", default_value = "5000")]
    pub stop_timeout_ms: u64,
}

impl TailArgs {
    /// Build the tailer config from command line args
    pub fn build_config(&self) -> TailerConfig {
        TailerConfig {
            buffer_size: self.buffer_size,
            max_lines_per_poll: self.max_lines_per_poll,
            idle_interval_ms: self.idle_interval_ms,
            reject_backoff_ms: self.reject_backoff_ms,
            emit_partial_lines: self.partial_lines,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

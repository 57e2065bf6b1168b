// SPDX-License-Identifier: Apache-2.0

//! Crash-safe, at-least-once file tailing.
//!
//! Lines appended to the tailed files are handed to a [`LineConsumer`] one at a time. Read
//! progress is persisted next to each file only when the consumer acknowledges it, so after a
//! crash or restart tailing resumes from the last acknowledged position and nothing is lost
//! (lines may be delivered more than once).
//!
//! Features:
//! - Rotation by rename is followed: the rest of the old file is read before switching over
//! - Inode based file identity, with creation time as a fallback
//! - Per-file advisory lock on the state file so two tailers never share a file
//! - Consumer back-pressure: rejected lines are redelivered until accepted

pub mod config;
pub mod consumer;
pub mod error;
pub mod file_id;
pub mod monitored;
pub mod sink;
pub mod splitter;
pub mod state;
pub mod tailer;

pub use config::TailerConfig;
pub use consumer::{FileHandle, Line, LineConsumer, TailedFiles};
pub use error::{Error, Result};
pub use file_id::FileIdentity;
pub use monitored::{MonitoredFile, delete_state_file};
pub use sink::WriterSink;
pub use splitter::{LineSpan, LineSplitter};
pub use state::{StateFile, TailState, state_path_for};
pub use tailer::Tailer;

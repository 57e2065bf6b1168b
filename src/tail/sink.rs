// SPDX-License-Identifier: Apache-2.0

//! A [`LineConsumer`] that copies lines to any [`Write`].
//!
//! Progress is acknowledged only after a successful flush, so every line reported as
//! persisted has been handed to the writer's destination. Flushes happen whenever the tailer
//! goes idle, and at least every flush interval while files keep growing.
//!
//! Provisional tails are skipped, they come back whole once their newline is written. Segments
//! of lines longer than the read buffer are written back to back so the line is reassembled.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::tail::consumer::{FileHandle, Line, LineConsumer, TailedFiles};

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub struct WriterSink<W: Write + Send> {
    inner: Mutex<SinkInner<W>>,
    shutting_down: AtomicBool,
    flush_interval: Duration,
}

struct SinkInner<W> {
    writer: W,
    /// Files with lines written since the last flush
    dirty: BTreeSet<FileHandle>,
    /// Files that lost a line to a write error during shutdown
    failed: BTreeSet<FileHandle>,
    last_flush: Instant,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                writer,
                dirty: BTreeSet::new(),
                failed: BTreeSet::new(),
                last_flush: Instant::now(),
            }),
            shutting_down: AtomicBool::new(false),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    /// Longest time written lines stay unflushed and unacknowledged while files are busy.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn into_inner(self) -> W {
        let inner = match self.inner.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.writer
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner<W>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Flush, then ack every file written to since the previous flush. A failed flush
    /// rolls those files back instead.
    fn flush_and_ack(&self, files: &mut TailedFiles) {
        let mut inner = self.lock();
        let flushed = inner.writer.flush();
        inner.last_flush = Instant::now();
        let dirty = std::mem::take(&mut inner.dirty);
        let failed = std::mem::take(&mut inner.failed);
        drop(inner);

        if let Err(e) = &flushed {
            warn!(error = %e, files = dirty.len(), "Failed to flush output, rolling back");
        }

        for handle in dirty.iter().filter(|h| !failed.contains(h)) {
            let result = if flushed.is_ok() {
                files.ack(*handle)
            } else {
                files.nak(*handle)
            };
            if let Err(e) = result {
                warn!(file = %handle, error = %e, "Failed to update tail state");
            }
        }

        for handle in failed {
            if let Err(e) = files.nak(handle) {
                warn!(file = %handle, error = %e, "Failed to roll back tail state");
            }
        }
    }
}

impl<W: Write + Send> LineConsumer for WriterSink<W> {
    fn on_line_available(&self, line: &Line<'_>) -> bool {
        if line.provisional {
            return true;
        }

        let mut inner = self.lock();
        let written = write_line(&mut inner.writer, line);

        match written {
            Ok(()) => {
                inner.dirty.insert(line.file);
                true
            }
            Err(e) if self.shutting_down.load(Ordering::Acquire) => {
                warn!(
                    file = %line.file,
                    position = line.position,
                    error = %e,
                    "Dropping line during shutdown, it will be re-read on the next start"
                );
                inner.failed.insert(line.file);
                true
            }
            Err(e) => {
                debug!(file = %line.file, error = %e, "Failed to write line, will retry");
                false
            }
        }
    }

    fn on_idle(&self, files: &mut TailedFiles) {
        self.flush_and_ack(files);
    }

    fn on_poll_complete(&self, files: &mut TailedFiles, _lines: usize) {
        let due = self.lock().last_flush.elapsed() >= self.flush_interval;
        if due {
            self.flush_and_ack(files);
        }
    }

    fn on_shutdown_initiated(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    fn on_shutdown_complete(&self, files: &mut TailedFiles) {
        self.flush_and_ack(files);
    }
}

fn write_line<W: Write>(writer: &mut W, line: &Line<'_>) -> io::Result<()> {
    writer.write_all(line.content())?;
    if line.terminated {
        writer.write_all(b"\n")?;
    }
    Ok(())
}

// SPDX-License-Identifier: Apache-2.0

//! The contract between the tailer and whatever ships the lines.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::tail::error::Result;
use crate::tail::monitored::MonitoredFile;

/// Process-unique identifier of a tailed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(u64);

impl FileHandle {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A line handed to a [`LineConsumer`].
///
/// `bytes` holds the bytes of the current read; the line itself is
/// `bytes[offset..offset + length]`. The view is only valid for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct Line<'a> {
    /// File the line was read from
    pub file: FileHandle,
    /// Logical path of that file
    pub path: &'a Path,
    /// Scratch buffer holding the line
    pub bytes: &'a [u8],
    /// Start of the line within `bytes`
    pub offset: usize,
    /// Length of the line, newline excluded
    pub length: usize,
    /// False for a segment that has no newline (yet)
    pub terminated: bool,
    /// An unterminated tail at end of file. The same bytes are delivered again, as part of the
    /// whole line, once the line is completed.
    pub provisional: bool,
    /// Byte offset of the line start within the physical file
    pub position: u64,
}

impl<'a> Line<'a> {
    pub fn content(&self) -> &'a [u8] {
        &self.bytes[self.offset..self.offset + self.length]
    }
}

/// Receives lines and lifecycle events from a [`Tailer`](crate::tail::Tailer).
///
/// Everything except [`LineConsumer::on_shutdown_initiated`] is called from the tailer's
/// worker thread.
pub trait LineConsumer: Send + Sync {
    /// Called once per line. Returning `false` means "not accepted": the very same line is
    /// offered again until it is accepted, so this must be safe to call repeatedly.
    fn on_line_available(&self, line: &Line<'_>) -> bool;

    /// A full pass over all files produced no lines. A good moment to flush partial batches
    /// and acknowledge what was flushed.
    fn on_idle(&self, files: &mut TailedFiles) {
        let _ = files;
    }

    /// A full pass over all files read `lines` lines. Files that never go quiet are only
    /// acknowledged from here.
    fn on_poll_complete(&self, files: &mut TailedFiles, lines: usize) {
        let _ = (files, lines);
    }

    /// Called once from the thread calling [`Tailer::stop`](crate::tail::Tailer::stop).
    /// Must unblock anything that could keep `on_line_available` rejecting lines.
    fn on_shutdown_initiated(&self) {}

    /// Called once from the worker thread after the final drain pass.
    fn on_shutdown_complete(&self, files: &mut TailedFiles) {
        let _ = files;
    }
}

/// The files owned by a tailer worker, in registration order.
///
/// Consumers get mutable access during lifecycle callbacks to acknowledge (or reject)
/// delivered lines once they are durably handed off.
#[derive(Default)]
pub struct TailedFiles {
    files: Vec<MonitoredFile>,
}

impl TailedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn handles(&self) -> Vec<FileHandle> {
        self.files.iter().map(|f| f.handle()).collect()
    }

    pub fn get(&self, handle: FileHandle) -> Option<&MonitoredFile> {
        self.files.iter().find(|f| f.handle() == handle)
    }

    pub fn get_mut(&mut self, handle: FileHandle) -> Option<&mut MonitoredFile> {
        self.files.iter_mut().find(|f| f.handle() == handle)
    }

    /// Persist the current read position of a file.
    ///
    /// Acking a handle that is no longer tailed is a no-op.
    pub fn ack(&mut self, handle: FileHandle) -> Result<()> {
        match self.get_mut(handle) {
            Some(file) => file.ack(),
            None => {
                debug!(file = %handle, "Ack for file that is no longer tailed");
                Ok(())
            }
        }
    }

    /// Roll a file back to its last persisted position.
    pub fn nak(&mut self, handle: FileHandle) -> Result<()> {
        match self.get_mut(handle) {
            Some(file) => file.nak(),
            None => {
                debug!(file = %handle, "Nak for file that is no longer tailed");
                Ok(())
            }
        }
    }

    /// Ack every file, logging failures. Returns the number of files that failed.
    pub fn ack_all(&mut self) -> usize {
        let mut failed = 0;
        for file in &mut self.files {
            if let Err(e) = file.ack() {
                warn!(path = ?file.path(), error = %e, "Failed to persist tail state");
                failed += 1;
            }
        }
        failed
    }

    pub(crate) fn push(&mut self, file: MonitoredFile) {
        self.files.push(file);
    }

    pub(crate) fn remove(&mut self, handle: FileHandle) -> Option<MonitoredFile> {
        let idx = self.files.iter().position(|f| f.handle() == handle)?;
        Some(self.files.remove(idx))
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, MonitoredFile> {
        self.files.iter_mut()
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, MonitoredFile> {
        self.files.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_handles_are_unique() {
        let a = FileHandle::next();
        let b = FileHandle::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{}", a), format!("#{}", a.id()));
    }

    #[test]
    fn test_line_content() {
        let buf = b"xxhello\nyy";
        let line = Line {
            file: FileHandle(1),
            path: Path::new("/tmp/a.log"),
            bytes: buf,
            offset: 2,
            length: 5,
            terminated: true,
            provisional: false,
            position: 100,
        };
        assert_eq!(line.content(), b"hello");
    }

    #[test]
    fn test_ack_unknown_handle_is_noop() {
        let mut files = TailedFiles::new();
        assert!(files.is_empty());
        assert!(files.ack(FileHandle(u64::MAX)).is_ok());
        assert!(files.nak(FileHandle(u64::MAX)).is_ok());
        assert_eq!(files.ack_all(), 0);
    }
}

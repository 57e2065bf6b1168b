// SPDX-License-Identifier: Apache-2.0

//! A single tailed file.
//!
//! A `MonitoredFile` follows a logical path (e.g. `/var/log/app.log`) across rotations. It
//! keeps a read handle on the physical file currently backing that path, which after a
//! rename may live under a different name (e.g. `app.log.1`). Progress is only persisted when
//! the owner calls [`MonitoredFile::ack`], giving at-least-once delivery across restarts.
//!
//! Rotation handling:
//! - While reading, a file is only abandoned once it is fully read and the logical path now
//!   names a different file (inode, or creation time where inodes are unavailable), or the
//!   same file shrank below the read position (truncation).
//! - On restore, a persisted identity that no longer matches the logical path is searched for
//!   among the siblings, so the unread tail of a rotated file is shipped before the new file.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::tail::config::TailerConfig;
use crate::tail::consumer::{FileHandle, Line, LineConsumer};
use crate::tail::error::{Error, Result};
use crate::tail::file_id::FileIdentity;
use crate::tail::splitter::{LineSpan, LineSplitter};
use crate::tail::state::{STATE_FILE_SUFFIX, StateFile, TailState, state_path_for};

/// Number of polls a rotated file is searched for before falling back to the logical path.
const ROTATION_SEARCH_ATTEMPTS: u32 = 3;

/// The physical file currently being read
struct OpenFile {
    file: File,
    /// Path the file was opened under (for logging)
    path: PathBuf,
    identity: FileIdentity,
}

/// Persisted state whose file could not be found yet
struct Unresolved {
    state: TailState,
    attempts: u32,
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    lines: usize,
    progressed: bool,
}

pub struct MonitoredFile {
    handle: FileHandle,
    /// Logical path being tailed
    path: PathBuf,
    state_file: StateFile,
    reader: Option<OpenFile>,
    /// Offset of the first byte not yet consumed
    position: u64,
    /// Length of an unterminated tail at `position` that was already seen
    pending_partial: u64,
    /// The last delivery was a segment of a line longer than the buffer
    continuation: bool,
    unresolved: Option<Unresolved>,
    emit_partial_lines: bool,
    reject_backoff: Duration,
}

impl MonitoredFile {
    /// Start tailing `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &TailerConfig::default())
    }

    /// Start tailing `path`.
    ///
    /// Locks `<path>.state`, failing with [`Error::LockConflict`] if another tailer holds it,
    /// then resumes from the persisted state or starts at offset 0. A missing data file is not
    /// an error: polling is a no-op until it appears.
    pub fn open_with(path: impl AsRef<Path>, config: &TailerConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state_file = StateFile::lock(&path)?;

        let mut file = Self {
            handle: FileHandle::next(),
            path,
            state_file,
            reader: None,
            position: 0,
            pending_partial: 0,
            continuation: false,
            unresolved: None,
            emit_partial_lines: config.emit_partial_lines,
            reject_backoff: config.reject_backoff(),
        };
        file.load_state()?;

        debug!(
            file = %file.handle,
            path = ?file.path,
            position = file.position,
            open = file.is_open(),
            "Monitoring file"
        );
        Ok(file)
    }

    pub fn handle(&self) -> FileHandle {
        self.handle
    }

    /// The logical path being tailed
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state_path(&self) -> &Path {
        self.state_file.path()
    }

    /// Path of the physical file being read, if one is open
    pub fn current_path(&self) -> Option<&Path> {
        self.reader.as_ref().map(|r| r.path.as_path())
    }

    /// Offset of the first unconsumed byte in the physical file
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Read available lines and hand them to `consumer`.
    ///
    /// Reads at most `max_lines` terminated lines (blank lines count but are not delivered)
    /// and returns how many were read. A line the consumer rejects is offered again until it
    /// is accepted.
    pub fn poll<C>(&mut self, buffer: &mut [u8], consumer: &C, max_lines: usize) -> Result<usize>
    where
        C: LineConsumer + ?Sized,
    {
        let mut lines = 0;
        while lines < max_lines {
            if !self.prepare()? {
                break;
            }
            let outcome = self.read_chunk(buffer, consumer, max_lines - lines)?;
            lines += outcome.lines;
            if !outcome.progressed {
                break;
            }
        }
        Ok(lines)
    }

    /// Alias for [`MonitoredFile::poll`].
    pub fn tail<C>(&mut self, buffer: &mut [u8], consumer: &C, max_lines: usize) -> Result<usize>
    where
        C: LineConsumer + ?Sized,
    {
        self.poll(buffer, consumer, max_lines)
    }

    /// Persist the current read position.
    ///
    /// Only call this once every line delivered so far has been durably handed off.
    pub fn ack(&mut self) -> Result<()> {
        let Some(reader) = &self.reader else {
            debug!(path = ?self.path, "Nothing to acknowledge, file not opened yet");
            return Ok(());
        };
        let state = TailState::new(self.position, reader.identity);
        self.state_file.store(&state)
    }

    /// Discard progress since the last [`MonitoredFile::ack`] and rewind to the persisted
    /// position.
    pub fn nak(&mut self) -> Result<()> {
        self.pending_partial = 0;
        let current = FileIdentity::lookup(&self.path)?;
        match self.state_file.load(current) {
            Ok(Some(state)) => self.restore(state),
            Ok(None) => self.open_logical_from_start(),
            Err(Error::StateCorrupt { path, reason }) => {
                warn!(state_file = ?path, reason = %reason, "Tail state is corrupt, rewinding to the beginning");
                self.open_logical_from_start()
            }
            Err(e) => Err(e),
        }
    }

    /// Release the data handle and the state file lock.
    ///
    /// The data handle is always dropped and the unlock is always attempted; the first
    /// failure is returned. Dropping a `MonitoredFile` without calling this also releases the
    /// lock, as the lock is bound to the state file handle.
    pub fn close(self) -> Result<()> {
        let Self {
            path,
            state_file,
            reader,
            ..
        } = self;
        drop(reader);
        state_file.release()?;
        debug!(path = ?path, "Closed monitored file");
        Ok(())
    }

    fn load_state(&mut self) -> Result<()> {
        let current = FileIdentity::lookup(&self.path)?;
        match self.state_file.load(current) {
            Ok(Some(state)) => self.restore(state),
            Ok(None) => self.open_logical_from_start(),
            Err(Error::StateCorrupt { path, reason }) => {
                warn!(state_file = ?path, reason = %reason, "Tail state is corrupt, starting from the beginning");
                self.open_logical_from_start()
            }
            Err(e) => Err(e),
        }
    }

    fn restore(&mut self, state: TailState) -> Result<()> {
        self.unresolved = None;
        if let Some(current) = FileIdentity::lookup(&self.path)? {
            if state.identity().same_file(&current) {
                let file = File::open(&self.path)?;
                let len = file.metadata()?.len();
                if state.position > len {
                    warn!(
                        path = ?self.path,
                        position = state.position,
                        size = len,
                        "File is shorter than the persisted position, reading from the beginning"
                    );
                    return self.install(file, self.path.clone(), 0, true);
                }
                return self.install(file, self.path.clone(), state.position, false);
            }
        }
        self.resolve_rotated(state, 0)
    }

    fn resolve_rotated(&mut self, state: TailState, attempts: u32) -> Result<()> {
        match find_rotated(&self.path, &state.identity())? {
            Some(rotated) => {
                let file = File::open(&rotated)?;
                let len = file.metadata()?.len();
                if len > state.position {
                    info!(
                        path = ?self.path,
                        rotated = ?rotated,
                        position = state.position,
                        "Resuming rotated file"
                    );
                    self.install(file, rotated, state.position, false)
                } else {
                    if len < state.position {
                        warn!(
                            rotated = ?rotated,
                            position = state.position,
                            size = len,
                            "Rotated file is shorter than the persisted position"
                        );
                    }
                    debug!(rotated = ?rotated, "Rotated file already fully read");
                    self.open_logical_from_start()
                }
            }
            None => {
                let attempts = attempts + 1;
                if attempts >= ROTATION_SEARCH_ATTEMPTS {
                    warn!(
                        path = ?self.path,
                        identity = %state.identity(),
                        attempts,
                        "Rotated file not found, reading the current file from the beginning"
                    );
                    return self.open_logical_from_start();
                }
                debug!(
                    error = %Error::RotationUnresolved { path: self.path.clone() },
                    attempts,
                    "Will retry on next poll"
                );
                self.reader = None;
                self.pending_partial = 0;
                self.unresolved = Some(Unresolved { state, attempts });
                Ok(())
            }
        }
    }

    fn open_logical_from_start(&mut self) -> Result<()> {
        self.unresolved = None;
        match File::open(&self.path) {
            Ok(file) => self.install(file, self.path.clone(), 0, true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.reader = None;
                self.position = 0;
                self.pending_partial = 0;
                self.continuation = false;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn install(&mut self, file: File, path: PathBuf, position: u64, persist: bool) -> Result<()> {
        let identity = FileIdentity::from_file(&file)?;
        debug!(
            path = ?path,
            identity = %identity,
            position,
            "Opened file for reading"
        );
        self.reader = Some(OpenFile {
            file,
            path,
            identity,
        });
        self.position = position;
        self.pending_partial = 0;
        self.continuation = false;
        self.unresolved = None;
        if persist {
            self.ack()?;
        }
        Ok(())
    }

    /// Make sure a handle with unread bytes is open. Returns false when there is nothing to
    /// read right now.
    fn prepare(&mut self) -> Result<bool> {
        if self.reader.is_none() {
            match self.unresolved.take() {
                Some(u) => self.resolve_rotated(u.state, u.attempts)?,
                None => self.open_logical_from_start()?,
            }
        }
        if self.reader.is_none() {
            return Ok(false);
        }
        if !self.is_fully_read()? {
            return Ok(true);
        }
        if self.check_rotation()? {
            return Ok(!self.is_fully_read()?);
        }
        Ok(false)
    }

    fn is_fully_read(&self) -> Result<bool> {
        let Some(reader) = &self.reader else {
            return Ok(true);
        };
        let size = reader.file.metadata()?.len();
        Ok(self.position + self.pending_partial >= size)
    }

    /// Switch handles if the logical path was rotated or truncated. Only meaningful once the
    /// current handle is fully read.
    fn check_rotation(&mut self) -> Result<bool> {
        let Some(reader) = &self.reader else {
            return Ok(false);
        };
        let Some(current) = FileIdentity::lookup(&self.path)? else {
            return Ok(false);
        };

        if !reader.identity.same_file(&current) {
            let file = match File::open(&self.path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            info!(
                path = ?self.path,
                from = %reader.identity,
                to = %current,
                "File rotated, switching to the new file"
            );
            // Not persisted: lines of the old file may still be unacknowledged
            self.install(file, self.path.clone(), 0, false)?;
            return Ok(true);
        }

        let size = reader.file.metadata()?.len();
        if size < self.position {
            warn!(
                path = ?self.path,
                position = self.position,
                size,
                "File truncated, reading from the beginning"
            );
            self.position = 0;
            self.pending_partial = 0;
            self.ack()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn read_chunk<C>(
        &mut self,
        buffer: &mut [u8],
        consumer: &C,
        max_lines: usize,
    ) -> Result<ChunkOutcome>
    where
        C: LineConsumer + ?Sized,
    {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(ChunkOutcome::default());
        };
        reader.file.seek(SeekFrom::Start(self.position))?;
        let read = read_full(&mut reader.file, buffer)?;
        if read == 0 {
            return Ok(ChunkOutcome::default());
        }

        let base = self.position;
        let full = read == buffer.len();
        let chunk: &[u8] = &buffer[..read];

        let mut lines = 0;
        let mut consumed = 0usize;
        let mut partial = None;
        for span in LineSplitter::new(chunk, max_lines) {
            if span.terminated {
                // An empty line closing a long line is delivered so the consumer sees it end
                if span.length > 0 || self.continuation {
                    self.deliver(consumer, chunk, base, span, false);
                }
                self.continuation = false;
                consumed = span.end();
                lines += 1;
            } else {
                partial = Some(span);
            }
        }

        let mut progressed = consumed > 0;
        if consumed > 0 {
            self.position += consumed as u64;
            self.pending_partial = 0;
        }

        if let Some(span) = partial {
            if full && consumed == 0 {
                // A line longer than the whole buffer: ship it in buffer-sized pieces
                self.deliver(consumer, chunk, base, span, false);
                self.position += span.consumed as u64;
                self.pending_partial = 0;
                self.continuation = true;
                progressed = true;
            } else if !full && span.length as u64 != self.pending_partial {
                // Unterminated tail at EOF: offered once, re-scanned whole once completed
                if self.emit_partial_lines {
                    self.deliver(consumer, chunk, base, span, true);
                }
                self.pending_partial = span.length as u64;
                progressed = true;
            }
        }

        Ok(ChunkOutcome { lines, progressed })
    }

    fn deliver<C>(
        &self,
        consumer: &C,
        chunk: &[u8],
        base: u64,
        span: LineSpan,
        provisional: bool,
    ) where
        C: LineConsumer + ?Sized,
    {
        let line = Line {
            file: self.handle,
            path: &self.path,
            bytes: chunk,
            offset: span.offset,
            length: span.length,
            terminated: span.terminated,
            provisional,
            position: base + span.offset as u64,
        };

        let mut rejections: u64 = 0;
        while !consumer.on_line_available(&line) {
            rejections += 1;
            if rejections == 1 {
                debug!(
                    path = ?self.path,
                    position = line.position,
                    "Line rejected by consumer, retrying"
                );
            }
            if self.reject_backoff.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(self.reject_backoff);
            }
        }
    }
}

impl std::fmt::Debug for MonitoredFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredFile")
            .field("handle", &self.handle)
            .field("path", &self.path)
            .field("current_path", &self.current_path())
            .field("position", &self.position)
            .finish()
    }
}

/// Remove the state file belonging to `tailed`.
pub fn delete_state_file(tailed: &Path) -> io::Result<()> {
    match fs::remove_file(state_path_for(tailed)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Search the directory of `tailed` for the one regular file with the given identity.
fn find_rotated(tailed: &Path, identity: &FileIdentity) -> Result<Option<PathBuf>> {
    let dir = match tailed.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        if entry
            .file_name()
            .to_string_lossy()
            .ends_with(STATE_FILE_SUFFIX)
        {
            continue;
        }
        // DirEntry metadata does not follow symlinks, so links never alias their target
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let candidate = FileIdentity::from_metadata(&metadata);
        let matches = match identity.inode() {
            Some(ino) => candidate.inode() == Some(ino),
            None => candidate.creation_time() == identity.creation_time(),
        };
        if matches {
            found.push(entry.path());
        }
    }

    if found.len() > 1 {
        warn!(
            path = ?tailed,
            candidates = ?found,
            "Several files match the persisted identity, cannot pick one"
        );
        return Ok(None);
    }
    Ok(found.pop())
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

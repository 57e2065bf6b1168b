// SPDX-License-Identifier: Apache-2.0

//! Durable tail progress.
//!
//! Each tailed file has a sibling `<file>.state` holding a flat key/value record:
//!
//! ```text
//! # tail state for /var/log/app.log
//! position=1024
//! creationTime=1700000000000
//! inode=1234567
//! ```
//!
//! The state file is held open and exclusively locked for as long as the file is tailed.
//! It is rewritten in place: a write-then-rename would swap out the inode the lock lives on.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::tail::error::{Error, Result};
use crate::tail::file_id::FileIdentity;

pub const STATE_FILE_SUFFIX: &str = ".state";

const KEY_POSITION: &str = "position";
const KEY_CREATION_TIME: &str = "creationTime";
const KEY_INODE: &str = "inode";
const NO_INODE: i64 = -1;

/// Persisted read progress for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailState {
    /// Byte offset into the physical file
    pub position: u64,
    /// Creation time of the physical file (epoch millis)
    pub creation_time: i64,
    /// Inode of the physical file, if the platform has one
    pub inode: Option<u64>,
}

impl TailState {
    pub fn new(position: u64, identity: FileIdentity) -> Self {
        Self {
            position,
            creation_time: identity.creation_time(),
            inode: identity.inode(),
        }
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity::new(self.inode, self.creation_time)
    }

    /// Render the record in its on-disk form.
    pub fn encode(&self, tailed: &Path) -> String {
        // Inodes beyond the signed range are stored as unsupported; creation time decides then
        let inode = self
            .inode
            .and_then(|i| i64::try_from(i).ok())
            .unwrap_or(NO_INODE);
        format!(
            "# tail state for {}\n{}={}\n{}={}\n{}={}\n",
            tailed.display(),
            KEY_POSITION,
            self.position,
            KEY_CREATION_TIME,
            self.creation_time,
            KEY_INODE,
            inode
        )
    }

    /// Parse an on-disk record.
    ///
    /// Returns `Ok(None)` for a record without any keys. Keys missing from an otherwise
    /// valid record take their value from `current`, the identity of the file at the tailed
    /// path (or a zero position).
    pub fn decode(
        text: &str,
        current: Option<FileIdentity>,
    ) -> std::result::Result<Option<Self>, String> {
        let mut position = None;
        let mut creation_time = None;
        let mut inode = None;
        let mut seen_any = false;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .or_else(|| line.split_once(':'))
                .ok_or_else(|| format!("line {}: expected key=value, got {:?}", lineno + 1, raw))?;
            let (key, value) = (key.trim(), value.trim());
            seen_any = true;
            match key {
                KEY_POSITION => {
                    position = Some(value.parse::<u64>().map_err(|e| {
                        format!("line {}: invalid {}: {}", lineno + 1, KEY_POSITION, e)
                    })?)
                }
                KEY_CREATION_TIME => {
                    creation_time = Some(value.parse::<i64>().map_err(|e| {
                        format!("line {}: invalid {}: {}", lineno + 1, KEY_CREATION_TIME, e)
                    })?)
                }
                KEY_INODE => {
                    let raw_inode = value.parse::<i64>().map_err(|e| {
                        format!("line {}: invalid {}: {}", lineno + 1, KEY_INODE, e)
                    })?;
                    inode = Some(u64::try_from(raw_inode).ok());
                }
                other => debug!(key = other, "Ignoring unknown state key"),
            }
        }

        if !seen_any {
            return Ok(None);
        }

        Ok(Some(Self {
            position: position.unwrap_or(0),
            creation_time: creation_time
                .or_else(|| current.map(|c| c.creation_time()))
                .unwrap_or(0),
            inode: inode.unwrap_or_else(|| current.and_then(|c| c.inode())),
        }))
    }
}

/// Path of the state file belonging to `tailed`.
pub fn state_path_for(tailed: &Path) -> PathBuf {
    let mut s = tailed.as_os_str().to_os_string();
    s.push(STATE_FILE_SUFFIX);
    PathBuf::from(s)
}

/// An open, exclusively locked state file.
pub struct StateFile {
    path: PathBuf,
    tailed: PathBuf,
    file: File,
}

impl StateFile {
    /// Open (creating if needed) and lock the state file for `tailed`.
    ///
    /// Fails with [`Error::LockConflict`] when another tailer, in this process or another,
    /// already holds the lock.
    pub fn lock(tailed: &Path) -> Result<Self> {
        let path = state_path_for(tailed);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind()
                || e.kind() == io::ErrorKind::WouldBlock
            {
                return Err(Error::LockConflict { path });
            }
            return Err(e.into());
        }

        Ok(Self {
            path,
            tailed: tailed.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted state through the locked handle.
    ///
    /// `Ok(None)` when nothing has been persisted yet, [`Error::StateCorrupt`] when the
    /// content cannot be parsed.
    pub fn load(&mut self, current: Option<FileIdentity>) -> Result<Option<TailState>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        self.file.read_to_end(&mut raw)?;

        let text = String::from_utf8(raw).map_err(|e| Error::StateCorrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        TailState::decode(&text, current).map_err(|reason| Error::StateCorrupt {
            path: self.path.clone(),
            reason,
        })
    }

    /// Truncate and rewrite the state under the held lock.
    pub fn store(&mut self, state: &TailState) -> Result<()> {
        let encoded = state.encode(&self.tailed);
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(encoded.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush and unlock. Both steps are attempted; the first failure is returned.
    pub fn release(self) -> io::Result<()> {
        let synced = self.file.sync_all();
        let unlocked = FileExt::unlock(&self.file);
        synced.and(unlocked)
    }
}

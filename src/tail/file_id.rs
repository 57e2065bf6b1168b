// SPDX-License-Identifier: Apache-2.0

//! Platform-independent file identity based on inode (Unix) with a creation-time fallback.
//!
//! The inode stays stable when a file is renamed, which is what lets a tailer follow a log
//! file through rotation. Platforms without inodes fall back to the file's birth time.

use std::fs::{File, Metadata};
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Identity of a physical file, independent of the name it currently has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Inode number, `None` where the platform has no such concept
    inode: Option<u64>,
    /// Creation time in milliseconds since the epoch, 0 when unknown
    creation_time: i64,
}

impl FileIdentity {
    /// Create a FileIdentity from raw values.
    /// Used for loading persisted state.
    pub fn new(inode: Option<u64>, creation_time: i64) -> Self {
        Self {
            inode,
            creation_time,
        }
    }

    /// Create a FileIdentity from an open file handle.
    pub fn from_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }

    /// Create a FileIdentity from the metadata at a path.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_metadata(&std::fs::metadata(path)?))
    }

    /// Like [`FileIdentity::from_path`], but a missing file is `Ok(None)`.
    pub fn lookup(path: impl AsRef<Path>) -> io::Result<Option<Self>> {
        match Self::from_path(path) {
            Ok(id) => Ok(Some(id)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            inode: inode_of(metadata),
            creation_time: creation_millis(metadata),
        }
    }

    pub fn inode(&self) -> Option<u64> {
        self.inode
    }

    pub fn creation_time(&self) -> i64 {
        self.creation_time
    }

    /// Whether both identities refer to the same physical file.
    ///
    /// Inodes win when both sides have one; otherwise the creation time decides.
    pub fn same_file(&self, other: &FileIdentity) -> bool {
        match (self.inode, other.inode) {
            (Some(a), Some(b)) => a == b,
            _ => self.creation_time == other.creation_time,
        }
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inode {
            Some(ino) => write!(f, "ino:{}", ino),
            None => write!(f, "ctime:{}", self.creation_time),
        }
    }
}

#[cfg(unix)]
fn inode_of(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;

    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode_of(_metadata: &Metadata) -> Option<u64> {
    None
}

fn creation_millis(metadata: &Metadata) -> i64 {
    // Not every filesystem reports a birth time (older Linux kernels, some FUSE mounts)
    metadata
        .created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    #[test]
    fn test_identity_same_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"test content").unwrap();
        file.flush().unwrap();

        let id1 = FileIdentity::from_path(file.path()).unwrap();
        let id2 = FileIdentity::from_file(&file.reopen().unwrap()).unwrap();

        assert_eq!(id1, id2);
        assert!(id1.same_file(&id2));
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_different_files() {
        let file1 = NamedTempFile::new().unwrap();
        let file2 = NamedTempFile::new().unwrap();

        let id1 = FileIdentity::from_path(file1.path()).unwrap();
        let id2 = FileIdentity::from_path(file2.path()).unwrap();

        assert!(!id1.same_file(&id2));
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_stable_across_rename_and_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\n").unwrap();
        let before = FileIdentity::from_path(&path).unwrap();

        let rotated = dir.path().join("app.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&rotated)
            .unwrap();
        f.write_all(b"two\n").unwrap();

        let after = FileIdentity::from_path(&rotated).unwrap();
        assert!(before.same_file(&after));
    }

    #[test]
    fn test_lookup_missing_file() {
        let dir = tempdir().unwrap();
        assert!(
            FileIdentity::lookup(dir.path().join("missing.log"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_creation_time_fallback_without_inode() {
        let a = FileIdentity::new(None, 1_000);
        let b = FileIdentity::new(Some(7), 1_000);
        let c = FileIdentity::new(None, 2_000);

        assert!(a.same_file(&b));
        assert!(!a.same_file(&c));
        // Inodes take precedence over a matching creation time
        assert!(!FileIdentity::new(Some(1), 5).same_file(&FileIdentity::new(Some(2), 5)));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(FileIdentity::new(Some(456), 0).to_string(), "ino:456");
        assert_eq!(FileIdentity::new(None, 99).to_string(), "ctime:99");
    }
}

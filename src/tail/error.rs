// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is locked by another tailer: {}", path.display())]
    LockConflict { path: PathBuf },

    #[error("state file {} is corrupt: {reason}", path.display())]
    StateCorrupt { path: PathBuf, reason: String },

    #[error("rotated file for {} could not be located", path.display())]
    RotationUnresolved { path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("tailer has been stopped")]
    Stopped,

    #[error("tailer worker already started")]
    AlreadyStarted,

    #[error("failed to spawn tailer worker: {0}")]
    WorkerSpawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

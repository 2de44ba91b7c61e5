//! Error types for the change watcher.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watcher already started")]
    AlreadyStarted,

    #[error("watcher has terminated")]
    Terminated,

    #[error("cannot watch {path}: no parent directory or file name", path = path.display())]
    InvalidPath { path: PathBuf },

    #[error("filesystem watch failed: {0}")]
    Notify(#[from] notify::Error),
}

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors returned by [`StyleFileAccessor`] operations.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("style '{id}' not found")]
    NotFound { id: String },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Read/write access to the single style file served to the browser.
///
/// Every call goes straight to the filesystem: nothing is cached, so a read
/// always reflects the latest content on disk, including writes made by
/// other programs. No in-process lock is taken; each save is one
/// `std::fs::write` call that replaces the whole file.
#[derive(Debug, Clone)]
pub struct StyleFileAccessor {
    path: PathBuf,
    id: String,
}

impl StyleFileAccessor {
    /// Create an accessor for `path`, which should already be absolute.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = style_id(&path);
        Self { path, id }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifier the browser uses to address the file.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifiers of all served styles. Always exactly one; no I/O.
    pub fn list(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    /// Read the full file content.
    pub fn read(&self, id: &str) -> Result<Vec<u8>, AccessError> {
        self.check_id(id)?;
        std::fs::read(&self.path).map_err(|source| AccessError::Read {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the file content with `contents`.
    pub fn save(&self, id: &str, contents: &[u8]) -> Result<(), AccessError> {
        self.check_id(id)?;
        std::fs::write(&self.path, contents).map_err(|source| AccessError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn check_id(&self, id: &str) -> Result<(), AccessError> {
        if id == self.id {
            Ok(())
        } else {
            Err(AccessError::NotFound { id: id.to_string() })
        }
    }
}

/// Derive the style identifier from a path: the file name without its
/// extension (`/tmp/style.json` -> `style`).
pub fn style_id(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

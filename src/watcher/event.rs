use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind};

use super::WatchError;

/// Content-free signal: the watched file may have changed, re-fetch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent;

/// Lifecycle of a [`super::ChangeWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Configured with a path, no filesystem watch registered yet.
    Idle,
    /// Filesystem watch registered, waiting for events.
    Watching,
    /// Delivering a change event to the current subscribers.
    Broadcasting,
    /// Filesystem watch released. Terminal.
    Terminated,
}

/// A file name inside a directory whose events concern the watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    dir: PathBuf,
    name: OsString,
}

/// Where the watched file lives on disk.
///
/// Holds the configured path and, when it is a symlink, the file it points
/// to: writes through the link land in the target's directory, while
/// replacing the link itself shows up in the configured directory.
/// Directories are canonicalized so event paths reported in canonical form
/// still match.
#[derive(Debug, Clone)]
pub struct WatchTargets {
    targets: Vec<Target>,
}

impl WatchTargets {
    pub fn resolve(path: &Path) -> Result<Self, WatchError> {
        let configured = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => Target {
                dir: canonical_dir(dir),
                name: name.to_os_string(),
            },
            _ => {
                return Err(WatchError::InvalidPath {
                    path: path.to_path_buf(),
                });
            }
        };

        let mut targets = vec![configured];
        if let Ok(real) = std::fs::canonicalize(path) {
            if let (Some(dir), Some(name)) = (real.parent(), real.file_name()) {
                let resolved = Target {
                    dir: dir.to_path_buf(),
                    name: name.to_os_string(),
                };
                if !targets.contains(&resolved) {
                    targets.push(resolved);
                }
            }
        }
        Ok(Self { targets })
    }

    /// Directories to register with the OS watcher, without duplicates.
    pub fn dirs(&self) -> Vec<&Path> {
        let mut dirs: Vec<&Path> = Vec::new();
        for target in &self.targets {
            if !dirs.contains(&target.dir.as_path()) {
                dirs.push(&target.dir);
            }
        }
        dirs
    }

    /// Whether `path` names the watched file (or its symlink target).
    pub fn matches(&self, path: &Path) -> bool {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return false;
        };
        let candidates: Vec<&Target> = self
            .targets
            .iter()
            .filter(|t| t.name.as_os_str() == name)
            .collect();
        if candidates.is_empty() {
            return false;
        }
        if candidates.iter().any(|t| t.dir.as_path() == dir) {
            return true;
        }
        let dir = canonical_dir(dir);
        candidates.iter().any(|t| t.dir == dir)
    }
}

fn canonical_dir(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
}

/// Decide whether a raw notify event concerns the watched file's content.
///
/// Events for sibling files in the watched directories are dropped. Access
/// and metadata-only events are ignored; writes, creations (rename-over-write
/// lands as a create) and renames are all triggers. Several raw events for
/// one logical save each produce a `ChangeEvent`; no coalescing happens here.
pub fn classify_event(event: &notify::Event, targets: &WatchTargets) -> Option<ChangeEvent> {
    if !is_content_event(&event.kind) {
        return None;
    }
    event
        .paths
        .iter()
        .any(|p| targets.matches(p))
        .then_some(ChangeEvent)
}

fn is_content_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Any | EventKind::Other => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        EventKind::Access(_) | EventKind::Remove(_) => false,
    }
}

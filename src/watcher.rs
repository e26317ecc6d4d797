//! Cross-process read notification: a filesystem-change watcher that tells a
//! read-mode `FileManager` when another process has appended to the file.
//!
//! Linux-only by design (§1 non-goals exclude cross-platform notification);
//! built on `notify`, the same crate family used for file-tailing elsewhere
//! in this corpus.

use std::path::Path;
use std::sync::mpsc::{channel, Receiver};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};
use tracing::{error, trace};

use crate::error::{Error, Result};

/// Watches the parent directory of a single file and reports modify events
/// for that file. Mirrors the directory-watch-then-filter pattern used for
/// robust file tailing: watching the file itself misses events on some
/// editors/filesystems that replace rather than append, but frozenDB only
/// cares about growth of one append-only file, so a direct modify filter on
/// its name is sufficient.
pub struct Watcher {
    _inner: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    file_name: std::ffi::OsString,
}

impl Watcher {
    pub fn new(path: &Path) -> Result<Self> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::invalid_input("watch path has no file name"))?
            .to_owned();

        let (tx, rx) = channel();
        let config = notify::Config::default().with_compare_contents(false);
        let mut inner: RecommendedWatcher = RecommendedWatcher::new(tx, config)
            .map_err(|e| Error::with_cause(crate::error::ErrorKind::PathError, "failed to start file watcher", e))?;
        inner
            .watch(parent, RecursiveMode::NonRecursive)
            .map_err(|e| Error::with_cause(crate::error::ErrorKind::PathError, "failed to watch directory", e))?;

        Ok(Self { _inner: inner, rx, file_name })
    }

    /// Drain pending events, returning `true` if the watched file grew.
    /// Never blocks. A watcher-internal error is surfaced to the caller,
    /// who tombstones the dependent finder; the watcher itself stops being
    /// useful after that point.
    pub fn poll_growth(&self) -> Result<bool> {
        let mut grew = false;
        loop {
            match self.rx.try_recv() {
                Ok(Ok(event)) => {
                    if self.concerns_watched_file(&event) && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        trace!(?event, "watcher observed file event");
                        grew = true;
                    }
                }
                Ok(Err(e)) => {
                    error!(error = %e, "file watcher reported an error");
                    return Err(Error::with_cause(crate::error::ErrorKind::ReadError, "file watcher error", e));
                }
                Err(std::sync::mpsc::TryRecvError::Empty) => break,
                Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                    return Err(Error::new(crate::error::ErrorKind::ReadError, "file watcher channel disconnected"))
                }
            }
        }
        Ok(grew)
    }

    fn concerns_watched_file(&self, event: &Event) -> bool {
        event.paths.iter().any(|p| p.file_name() == Some(self.file_name.as_os_str()))
    }
}

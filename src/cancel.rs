//! Cancel-file watcher.
//!
//! Batch and serve runs accept a file-based cancel: touching
//! `.kiln-cancel` in the project root unwinds every queue back to Idle
//! and returns control to the caller. The watcher debounces filesystem
//! events so editors that write twice do not double-fire.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};

/// Name of the cancel file inside the project root.
pub const CANCEL_FILENAME: &str = ".kiln-cancel";

/// Watches the project root for the cancel file.
pub struct CancelWatcher {
    rx: Receiver<DebounceEventResult>,
    _debouncer: Debouncer<RecommendedWatcher>,
    path: PathBuf,
    seen: Cell<bool>,
}

impl CancelWatcher {
    /// Start watching `root`. A stale cancel file left by a previous run
    /// is removed first so it cannot cancel the new session.
    pub fn watch(root: &Path) -> notify::Result<Self> {
        let path = root.join(CANCEL_FILENAME);
        let _ = std::fs::remove_file(&path);

        let (tx, rx) = channel();
        let mut debouncer = new_debouncer(Duration::from_millis(100), tx)?;
        debouncer.watcher().watch(root, RecursiveMode::NonRecursive)?;
        Ok(Self { rx, _debouncer: debouncer, path, seen: Cell::new(false) })
    }

    /// Whether a cancel has been requested. Latches once true.
    pub fn requested(&self) -> bool {
        if self.seen.get() {
            return true;
        }
        while let Ok(result) = self.rx.try_recv() {
            if let Ok(events) = result {
                for event in events {
                    if event.path == self.path && self.path.exists() {
                        self.seen.set(true);
                    }
                }
            }
        }
        self.seen.get()
    }

    /// Consume the cancel file after handling it.
    pub fn acknowledge(&self) {
        let _ = std::fs::remove_file(&self.path);
        self.seen.set(false);
    }
}

impl std::fmt::Debug for CancelWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelWatcher")
            .field("path", &self.path)
            .field("seen", &self.seen.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn wait_for(watcher: &CancelWatcher) -> bool {
        for _ in 0..100 {
            if watcher.requested() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_cancel_file_triggers_watcher() {
        let temp = TempDir::new().unwrap();
        let watcher = CancelWatcher::watch(temp.path()).unwrap();
        assert!(!watcher.requested());

        fs::write(temp.path().join(CANCEL_FILENAME), "").unwrap();
        assert!(wait_for(&watcher));
        // latched
        assert!(watcher.requested());
    }

    #[test]
    fn test_stale_cancel_file_is_cleared_at_start() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(CANCEL_FILENAME), "").unwrap();

        let watcher = CancelWatcher::watch(temp.path()).unwrap();
        assert!(!temp.path().join(CANCEL_FILENAME).exists());
        assert!(!watcher.requested());
    }

    #[test]
    fn test_unrelated_files_do_not_cancel() {
        let temp = TempDir::new().unwrap();
        let watcher = CancelWatcher::watch(temp.path()).unwrap();

        fs::write(temp.path().join("other.txt"), "").unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(!watcher.requested());
    }

    #[test]
    fn test_acknowledge_resets() {
        let temp = TempDir::new().unwrap();
        let watcher = CancelWatcher::watch(temp.path()).unwrap();
        fs::write(temp.path().join(CANCEL_FILENAME), "").unwrap();
        assert!(wait_for(&watcher));

        watcher.acknowledge();
        assert!(!temp.path().join(CANCEL_FILENAME).exists());
        assert!(!watcher.requested());
    }
}

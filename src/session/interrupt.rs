use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// exit status after an interrupt
pub const INTERRUPTED_EXIT: i32 = 130;

/// temporary paths to remove if the process is interrupted
///
/// cheap to clone; every clone shares the same set.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next: AtomicU64,
    paths: Mutex<BTreeMap<u64, PathBuf>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// track `path` until the returned guard is dropped
    pub fn register(&self, path: impl Into<PathBuf>) -> CleanupGuard {
        let id = self.inner.next.fetch_add(1, Ordering::Relaxed);
        let path = path.into();
        debug!(path = %path.display(), "registered for cleanup");
        if let Ok(mut paths) = self.inner.paths.lock() {
            paths.insert(id, path);
        }
        CleanupGuard {
            registry: self.clone(),
            id,
        }
    }

    /// paths currently registered
    pub fn pending(&self) -> Vec<PathBuf> {
        self.inner
            .paths
            .lock()
            .map(|paths| paths.values().cloned().collect())
            .unwrap_or_default()
    }

    /// remove every registered path from disk
    pub fn cleanup(&self) {
        let paths: Vec<PathBuf> = match self.inner.paths.lock() {
            Ok(mut paths) => std::mem::take(&mut *paths).into_values().collect(),
            Err(_) => return,
        };
        for path in paths {
            remove_path(&path);
        }
    }

    /// route SIGINT/SIGTERM to a watcher thread that cleans up and exits
    ///
    /// must run before any other thread is spawned so they inherit the mask.
    pub fn install_handler(&self) -> Result<()> {
        let mut signals = SigSet::empty();
        signals.add(Signal::SIGINT);
        signals.add(Signal::SIGTERM);
        signals.thread_block().map_err(|e| Error::Io {
            path: PathBuf::from("<signal mask>"),
            source: std::io::Error::from(e),
        })?;

        let registry = self.clone();
        thread::Builder::new()
            .name("pvr-interrupt".into())
            .spawn(move || {
                if let Ok(signal) = signals.wait() {
                    warn!(signal = ?signal, "interrupted, removing temporary files");
                    registry.cleanup();
                    std::process::exit(INTERRUPTED_EXIT);
                }
            })
            .map_err(|e| Error::Io {
                path: PathBuf::from("<interrupt thread>"),
                source: e,
            })?;
        Ok(())
    }
}

fn remove_path(path: &Path) {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "cleanup failed");
    }
}

/// keeps a path registered for cleanup while alive
pub struct CleanupGuard {
    registry: CleanupRegistry,
    id: u64,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Ok(mut paths) = self.registry.inner.paths.lock() {
            paths.remove(&self.id);
        }
    }
}

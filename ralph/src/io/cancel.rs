//! Operator cancellation: an in-process flag plus an optional `STOP` file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation token polled by the loop and by running child processes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also trips when `path` exists.
    pub fn with_stop_file(path: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::default(),
            stop_file: Some(path.into()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.stop_file {
            Some(path) if path.exists() => {
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub fn stop_file(&self) -> Option<&Path> {
        self.stop_file.as_deref()
    }
}

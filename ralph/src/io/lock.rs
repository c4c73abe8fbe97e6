//! Per-project run lock.
//!
//! The lock file holds the owner's pid. A lock whose owner is gone (killed by
//! a signal, say, before `Drop` ran) is stale and is taken over.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Exclusive lock held for the lifetime of one loop run. Removed on drop.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
}

impl ProjectLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        match Self::try_create(path)? {
            Some(lock) => Ok(lock),
            None => {
                if let Some(pid) = holder(path)? {
                    return Err(anyhow!(
                        "project is already running (pid {pid} holds {})",
                        path.display()
                    ));
                }
                warn!(path = %path.display(), "removing stale project lock");
                remove_lock(path)?;
                Self::try_create(path)?.ok_or_else(|| {
                    anyhow!(
                        "project is already running (lock {} was taken concurrently)",
                        path.display()
                    )
                })
            }
        }
    }

    /// `None` when the lock file already exists.
    fn try_create(path: &Path) -> Result<Option<Self>> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("create lock {}", path.display()));
            }
        };
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("write lock {}", path.display()))?;
        debug!(path = %path.display(), "project lock acquired");
        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release project lock");
        }
    }
}

/// Pid of the live process holding the lock at `path`, if any.
///
/// A lock without a readable pid is reported as held by pid 0 rather than
/// guessed stale.
pub fn holder(path: &Path) -> Result<Option<u32>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read lock {}", path.display())),
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        warn!(path = %path.display(), "lock file has no pid");
        return Ok(Some(0));
    };
    Ok(is_alive(pid).then_some(pid))
}

fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn remove_lock(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove stale lock {}", path.display())),
    }
}

/// Remove the lock at `path` if its owner is gone. True when none is held.
pub fn clear_if_stale(path: &Path) -> Result<bool> {
    if holder(path)?.is_some() {
        return Ok(false);
    }
    if path.exists() {
        warn!(path = %path.display(), "removing stale project lock");
        remove_lock(path)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait true");
        pid
    }

    #[test]
    fn second_acquire_fails_until_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");
        let lock = ProjectLock::acquire(&path).expect("first");
        let err = ProjectLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert_eq!(holder(&path).expect("holder"), Some(std::process::id()));
        drop(lock);
        assert!(!path.exists());
        ProjectLock::acquire(&path).expect("after release");
    }

    #[test]
    fn lock_of_exited_process_is_taken_over() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");
        fs::write(&path, format!("{}\n", exited_pid())).expect("stale lock");
        assert_eq!(holder(&path).expect("holder"), None);

        let lock = ProjectLock::acquire(&path).expect("take over");
        assert_eq!(
            fs::read_to_string(&path).expect("read").trim(),
            std::process::id().to_string()
        );
        drop(lock);
    }

    #[test]
    fn unreadable_lock_is_treated_as_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");
        fs::write(&path, "garbage").expect("lock");
        assert_eq!(holder(&path).expect("holder"), Some(0));
        assert!(ProjectLock::acquire(&path).is_err());
        assert!(!clear_if_stale(&path).expect("clear"));
        assert!(path.exists());
    }

    #[test]
    fn clear_if_stale_removes_dead_owner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");
        assert!(clear_if_stale(&path).expect("absent"));
        fs::write(&path, format!("{}\n", exited_pid())).expect("stale lock");
        assert!(clear_if_stale(&path).expect("stale"));
        assert!(!path.exists());
    }
}

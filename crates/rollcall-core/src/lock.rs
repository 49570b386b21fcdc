//! Cross-process training lock.
//!
//! An exclusive `flock` on a file next to the status snapshot. The kernel
//! drops it when the holder exits, so a held lock always means a live run.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Held for the duration of one training run; released on drop.
pub struct TrainingLock {
    _file: Flock<File>,
}

impl TrainingLock {
    /// Take the lock without blocking. `Ok(None)` means another run holds it.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => Ok(Some(Self { _file: file })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(errno.into()),
        }
    }
}

/// Lock file guarding runs that publish to `status_path`.
pub fn lock_path_for(status_path: &Path) -> PathBuf {
    let mut name = status_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "train_status".into());
    name.push(".lock");
    status_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_next_to_status() {
        assert_eq!(
            lock_path_for(Path::new("/srv/rollcall/train_status.json")),
            PathBuf::from("/srv/rollcall/train_status.json.lock")
        );
    }

    #[test]
    fn test_second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train_status.json.lock");

        let first = TrainingLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(TrainingLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(TrainingLock::try_acquire(&path).unwrap().is_some());
    }
}

/// Single-instance lock
///
/// A non-blocking exclusive flock on a well-known file. The lock is released
/// when the guard drops or the process dies.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("another roleback run holds {path}")]
    AlreadyRunning { path: PathBuf },

    #[error("flock on {path} failed: {errno}")]
    Flock { path: PathBuf, errno: Errno },
}

pub struct InstanceLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(LockError::AlreadyRunning {
                    path: path.to_path_buf(),
                })
            }
            Err((_, errno)) => {
                return Err(LockError::Flock {
                    path: path.to_path_buf(),
                    errno,
                })
            }
        };

        // pid is informational only
        let _ = lock.set_len(0);
        let _ = writeln!(*lock, "{}", std::process::id());

        tracing::debug!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

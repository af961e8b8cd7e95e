//! Store-wide critical section.
//!
//! Two layers: a process-wide mutex serializes workers inside this process,
//! and an exclusive `flock` on a lock file in the store directory
//! serializes separate tuner processes sharing the same directory. Both are
//! released when the guard drops.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{TuneError, TuneResult};

/// Name of the lock file created inside the store directory.
pub const LOCK_FILE_NAME: &str = ".gllm-block-tuner.lock";

static STORE_MUTEX: Mutex<()> = Mutex::new(());

/// Held for the duration of one load-merge-write cycle.
#[derive(Debug)]
pub struct StoreLock {
    // dropped in declaration order: file lock first, then the mutex
    _file: FileLock,
    _guard: MutexGuard<'static, ()>,
}

impl StoreLock {
    /// Block until both the in-process and the cross-process lock are held.
    pub fn acquire(dir: &Path) -> TuneResult<Self> {
        // tables are only replaced by rename, so poisoning leaves nothing torn
        let guard = STORE_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = FileLock::exclusive(&dir.join(LOCK_FILE_NAME))?;
        Ok(StoreLock {
            _file: file,
            _guard: guard,
        })
    }
}

#[derive(Debug)]
struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    fn exclusive(path: &Path) -> TuneResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| TuneError::storage(path, e))?;
        lock_exclusive(&file).map_err(|e| TuneError::storage(path, e))?;
        log::trace!("acquired store lock {}", path.display());
        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = unlock(&self.file) {
            log::warn!("failed to release store lock {}: {e}", self.path.display());
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        // SAFETY: fd is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

// Without flock only the in-process mutex applies.
#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> std::io::Result<()> {
    Ok(())
}

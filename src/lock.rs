//! Advisory lock guarding writes to the index store.
//!
//! Uses flock() on a `<index file>.lock` sibling so that two server processes
//! pointed at the same artifacts never interleave a save. Within one process
//! the index manager already serializes rebuilds.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// A held store lock that releases on drop
pub struct StoreLock {
    #[allow(dead_code)]
    file: File,
}

impl StoreLock {
    /// Acquire the lock for the store whose index artifact lives at `index_path`,
    /// blocking until it is available.
    pub fn acquire(index_path: &Path) -> io::Result<Self> {
        let file = Self::open(index_path)?;
        Self::lock_exclusive(&file)?;
        Ok(StoreLock { file })
    }

    /// Acquire the lock without waiting.
    /// Fails with `WouldBlock` when another holder has it.
    #[cfg(test)]
    pub fn try_acquire(index_path: &Path) -> io::Result<Self> {
        let file = Self::open(index_path)?;
        Self::try_lock_exclusive(&file)?;
        Ok(StoreLock { file })
    }

    /// Path of the lock file for a given index artifact.
    pub fn lock_path(index_path: &Path) -> PathBuf {
        let mut name = index_path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        index_path.with_file_name(name)
    }

    fn open(index_path: &Path) -> io::Result<File> {
        let lock_path = Self::lock_path(index_path);
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
    }

    #[cfg(all(unix, test))]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "Index store is being written by another process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    // no advisory locking off unix
    #[cfg(all(not(unix), test))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for StoreLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

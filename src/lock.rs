//! Per-place advisory locking.
//!
//! A pipeline run holds an exclusive flock() on `<place dir>/.lock` for its
//! whole duration. A second run against the same place fails fast instead of
//! racing the first one on artifact writes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = ".lock";

/// A held place lock that releases on drop
pub struct PlaceLock {
    #[allow(dead_code)]
    file: File,
}

impl PlaceLock {
    /// Attempt to acquire the lock for the place directory without blocking.
    pub fn try_acquire(place_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(place_dir)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(place_dir.join(LOCK_FILE_NAME))?;

        Self::try_lock_exclusive(&file)?;

        Ok(PlaceLock { file })
    }

    #[cfg(unix)]
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
                    "place is locked by another run",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // no advisory locking outside unix
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for PlaceLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("places/p1");

        let lock1 = PlaceLock::try_acquire(&dir);
        assert!(lock1.is_ok(), "First lock should succeed");

        let lock2 = PlaceLock::try_acquire(&dir);
        assert!(matches!(lock2, Err(ref e) if e.kind() == io::ErrorKind::WouldBlock));

        drop(lock1);

        let lock3 = PlaceLock::try_acquire(&dir);
        assert!(lock3.is_ok(), "Lock should succeed after release");
    }

    #[test]
    fn test_places_lock_independently() {
        let tmp = tempfile::tempdir().unwrap();

        let _a = PlaceLock::try_acquire(&tmp.path().join("a")).unwrap();
        let b = PlaceLock::try_acquire(&tmp.path().join("b"));
        assert!(b.is_ok());
    }
}

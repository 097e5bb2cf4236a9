use crate::{Error, Result};
use std::{fs::File, path::Path};

const LOCK_FILE: &str = "lock";

/// Holds an advisory exclusive lock on the log directory for the lifetime of
/// the database, so that two instances never interleave appends to the same
/// log files.
#[derive(Debug)]
pub(crate) struct DirectoryLock {
    _file: File,
}

impl DirectoryLock {
    /// Locks `dir`, creating the lock file inside it if needed.
    ///
    /// Fails with [`Error::DatabaseAlreadyOpen`] when another database
    /// instance, in this process or any other, holds the lock.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if sys::try_lock_exclusive(&file)? {
            Ok(Self { _file: file })
        } else {
            Err(Error::DatabaseAlreadyOpen)
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::{fs::File, os::fd::AsRawFd};

    /// Returns `false` if the lock is held elsewhere.
    pub fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
        match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
            0 => Ok(true),
            _ => {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EWOULDBLOCK) => Ok(false),
                    _ => Err(err),
                }
            }
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::{fs::File, os::windows::io::AsRawHandle};
    use windows_sys::Win32::{
        Foundation::{ERROR_LOCK_VIOLATION, HANDLE},
        Storage::FileSystem::{LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY},
    };

    /// Returns `false` if the lock is held elsewhere.
    pub fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
        let mut overlapped = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            LockFileEx(
                file.as_raw_handle() as HANDLE,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };
        if ret != 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == ERROR_LOCK_VIOLATION as i32 => Ok(false),
            _ => Err(err),
        }
    }
}

#[cfg(not(any(unix, windows)))]
compile_error!("unsupported platform");

#[cfg(test)]
mod tests {
    use super::DirectoryLock;
    use crate::Error;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_rejected() {
        let dir = tempdir().unwrap();
        {
            let _lock = DirectoryLock::acquire(dir.path()).unwrap();
            assert!(matches!(
                DirectoryLock::acquire(dir.path()),
                Err(Error::DatabaseAlreadyOpen)
            ));
        }
        DirectoryLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn existing_lock_file_is_reused() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("lock")).unwrap();
        {
            let _lock = DirectoryLock::acquire(dir.path()).unwrap();
            assert!(matches!(
                DirectoryLock::acquire(dir.path()),
                Err(Error::DatabaseAlreadyOpen)
            ));
        }
        DirectoryLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn readonly_lock_file_surfaces_the_io_error() {
        // Permission checks don't apply to root.
        #[cfg(unix)]
        if unsafe { libc::geteuid() } == 0 {
            return;
        }

        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("lock")).unwrap();

        let mut permissions = file.metadata().unwrap().permissions();
        permissions.set_readonly(true);
        file.set_permissions(permissions).unwrap();

        let err = DirectoryLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied
        ));
    }
}

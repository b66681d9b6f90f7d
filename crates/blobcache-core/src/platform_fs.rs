//! Platform-specific filesystem primitives
//!
//! Two concerns live here: advisory whole-file locks (single-writer
//! exclusion across processes) and durable sync (only used when
//! `Config::durable_writes` is on). Both map to the strongest primitive each
//! platform offers.

use std::fs::File;
use std::io;

/// Try to take an exclusive advisory lock on `file` without blocking.
///
/// Returns `Ok(false)` when another process already holds the lock. The lock
/// is tied to the open descriptor and evaporates when the descriptor closes,
/// so the caller must keep `file` alive for as long as exclusion is needed.
pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: flock is a POSIX call on a descriptor we obtained from a
        // live File reference, so it is guaranteed to be open.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        Err(err)
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};

        let handle = file.as_raw_handle();
        // SAFETY: LockFileEx operates on a valid file handle; the zeroed
        // OVERLAPPED selects a lock anchored at offset 0.
        let result = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            LockFileEx(
                handle as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if result != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(winapi::shared::winerror::ERROR_LOCK_VIOLATION as i32) {
            return Ok(false);
        }
        Err(err)
    }

    #[cfg(not(any(unix, windows)))]
    {
        // No advisory locking on this platform; single-writer exclusion is
        // the caller's problem.
        let _ = file;
        Ok(true)
    }
}

/// Release an advisory lock taken by [`try_lock_exclusive`].
///
/// Closing the descriptor releases the lock too; this exists so `close` can
/// unlock in its documented order rather than as a drop side effect.
pub fn unlock(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: see try_lock_exclusive.
        let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::UnlockFile;

        let handle = file.as_raw_handle();
        // SAFETY: UnlockFile mirrors the LockFileEx range above.
        let result = unsafe { UnlockFile(handle as *mut _, 0, 0, u32::MAX, u32::MAX) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = file;
        Ok(())
    }
}

/// Force file contents to persistent storage.
///
/// Linux gets fdatasync (data without metadata timestamps); Apple platforms
/// need F_FULLFSYNC because plain fsync there stops at the drive's volatile
/// cache; everything else uses the stdlib's best mapping.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync is a POSIX call on an open descriptor.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl(F_FULLFSYNC) is a macOS call on an open descriptor.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        file.sync_data()
    }
}

//! Inter-process write lock on the database file.
//!
//! One exclusive whole-file lock serializes writers across processes;
//! readers never take it. POSIX record locks are per (process, inode) and
//! vanish when any descriptor of the file closes, so the guard owns its own
//! duplicated handle and keeps it open for exactly the lock's lifetime.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, TabulaError};

const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Held for the duration of a write transaction; releases on drop.
pub struct WriteLockGuard {
    file: File,
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        if let Err(err) = sys::unlock(&self.file) {
            debug!(%err, "failed to release write lock");
        }
    }
}

/// Take the exclusive write lock, waiting at most `timeout` (forever when
/// `None`). Expiry yields `LockTimeout` without acquiring anything.
pub fn acquire_write_lock(
    file: &File,
    path: &Path,
    timeout: Option<Duration>,
) -> Result<WriteLockGuard> {
    let handle = file.try_clone()?;
    match timeout {
        None => {
            sys::lock(&handle, true)?;
            Ok(WriteLockGuard { file: handle })
        }
        Some(limit) => {
            let deadline = Instant::now() + limit;
            loop {
                if sys::lock(&handle, false)? {
                    return Ok(WriteLockGuard { file: handle });
                }
                if Instant::now() >= deadline {
                    debug!(?limit, path = %path.display(), "write lock wait expired");
                    return Err(TabulaError::LockTimeout {
                        path: PathBuf::from(path),
                    });
                }
                std::thread::sleep(RETRY_INTERVAL);
            }
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use crate::error::Result;

    fn flock_cmd(file: &File, l_type: i32, blocking: bool) -> io::Result<bool> {
        let mut fl = libc::flock {
            l_type: l_type as i16,
            l_whence: libc::SEEK_SET as i16,
            l_start: 0,
            l_len: 0, // whole file
            l_pid: 0,
        };
        let cmd = if blocking {
            libc::F_SETLKW
        } else {
            libc::F_SETLK
        };
        loop {
            let res = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut fl) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) if blocking => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if !blocking => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn lock(file: &File, blocking: bool) -> Result<bool> {
        Ok(flock_cmd(file, libc::F_WRLCK, blocking)?)
    }

    pub fn unlock(file: &File) -> Result<()> {
        flock_cmd(file, libc::F_UNLCK, false)?;
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    use crate::error::Result;

    pub fn lock(file: &File, blocking: bool) -> Result<bool> {
        let mut overlapped: OVERLAPPED = unsafe { zeroed() };
        let mut flags = LOCKFILE_EXCLUSIVE_LOCK;
        if !blocking {
            flags |= LOCKFILE_FAIL_IMMEDIATELY;
        }
        let ok = unsafe {
            LockFileEx(
                file.as_raw_handle() as _,
                flags,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if !blocking && err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            return Ok(false);
        }
        Err(err.into())
    }

    pub fn unlock(file: &File) -> Result<()> {
        let mut overlapped: OVERLAPPED = unsafe { zeroed() };
        let ok = unsafe {
            UnlockFileEx(
                file.as_raw_handle() as _,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

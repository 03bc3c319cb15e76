// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX process-shared synchronization primitives, initialized in place
// inside a caller-provided shared-memory region. Both sides of a fork see
// the same object bytes, so everything is created with PROCESS_SHARED
// attributes and addressed through raw pointers into the mapping.

use std::io;

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by `libc` on all platforms.
// On macOS robust mutexes are not available and are not used.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Mutex — pthread_mutex_t placed in the shared region
// ---------------------------------------------------------------------------

/// Backing storage for an in-region mutex. Embedded in `repr(C)` control
/// headers so both processes agree on its offset.
pub(crate) type MutexStorage = libc::pthread_mutex_t;

/// Initialize a process-shared (and, off macOS, robust) mutex at `mtx`.
///
/// # Safety
/// `mtx` must point into a live `MAP_SHARED` mapping with room for a
/// `pthread_mutex_t`, and no other thread or process may be using it yet.
pub(crate) unsafe fn mutex_init_pshared(mtx: *mut MutexStorage) -> io::Result<()> {
    std::ptr::write_bytes(mtx, 0, 1);

    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_mutexattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(io::Error::from_raw_os_error(eno));
    }

    #[cfg(not(target_os = "macos"))]
    {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }
    }

    eno = libc::pthread_mutex_init(mtx, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Lock the mutex (blocking). Handles `EOWNERDEAD` from a robust mutex by
/// marking the state consistent and proceeding, matching the behaviour a
/// surviving process wants after its peer died mid-critical-section.
///
/// # Safety
/// `mtx` must point to a mutex initialized with [`mutex_init_pshared`].
pub(crate) unsafe fn mutex_lock(mtx: *mut MutexStorage) -> io::Result<()> {
    let eno = libc::pthread_mutex_lock(mtx);
    match eno {
        0 => Ok(()),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            let eno2 = pthread_mutex_consistent(mtx);
            if eno2 != 0 {
                return Err(io::Error::from_raw_os_error(eno2));
            }
            Ok(())
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// `mtx` must be locked by the calling thread.
pub(crate) unsafe fn mutex_unlock(mtx: *mut MutexStorage) -> io::Result<()> {
    let eno = libc::pthread_mutex_unlock(mtx);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// # Safety
/// `mtx` must be unlocked and no other process may still be attached.
pub(crate) unsafe fn mutex_destroy(mtx: *mut MutexStorage) {
    libc::pthread_mutex_destroy(mtx);
}

// ---------------------------------------------------------------------------
// Counting semaphore — sem_t in the shared region.
// macOS never implemented unnamed semaphores (sem_init returns ENOSYS), so
// there the semaphore is emulated with a process-shared mutex + condvar +
// counter occupying the same slot.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
pub(crate) type SemStorage = libc::sem_t;

#[cfg(target_os = "macos")]
#[repr(C)]
pub(crate) struct SemStorage {
    lock: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    count: i32,
}

#[cfg(not(target_os = "macos"))]
mod sem_impl {
    use std::io;

    use super::SemStorage;

    /// # Safety
    /// `sem` must point into a live shared mapping, unused so far.
    pub(crate) unsafe fn sem_init_pshared(sem: *mut SemStorage, value: u32) -> io::Result<()> {
        if libc::sem_init(sem, 1, value as libc::c_uint) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocking wait, retried on `EINTR`.
    ///
    /// # Safety
    /// `sem` must point to a semaphore initialized with [`sem_init_pshared`].
    pub(crate) unsafe fn sem_wait(sem: *mut SemStorage) -> io::Result<()> {
        loop {
            if libc::sem_wait(sem) == 0 {
                return Ok(());
            }
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(e);
        }
    }

    /// # Safety
    /// `sem` must point to an initialized semaphore.
    pub(crate) unsafe fn sem_post(sem: *mut SemStorage) -> io::Result<()> {
        if libc::sem_post(sem) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    /// No waiter may still be blocked on `sem`.
    pub(crate) unsafe fn sem_destroy(sem: *mut SemStorage) {
        libc::sem_destroy(sem);
    }
}

#[cfg(target_os = "macos")]
mod sem_impl {
    use std::io;

    use super::SemStorage;

    pub(crate) unsafe fn sem_init_pshared(sem: *mut SemStorage, value: u32) -> io::Result<()> {
        super::mutex_init_pshared(&mut (*sem).lock)?;

        std::ptr::write_bytes(&mut (*sem).cond as *mut libc::pthread_cond_t, 0, 1);
        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_condattr_init(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_condattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }
        eno = libc::pthread_cond_init(&mut (*sem).cond, &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }

        (*sem).count = value as i32;
        Ok(())
    }

    pub(crate) unsafe fn sem_wait(sem: *mut SemStorage) -> io::Result<()> {
        super::mutex_lock(&mut (*sem).lock)?;
        while (*sem).count == 0 {
            let eno = libc::pthread_cond_wait(&mut (*sem).cond, &mut (*sem).lock);
            if eno != 0 {
                let _ = super::mutex_unlock(&mut (*sem).lock);
                return Err(io::Error::from_raw_os_error(eno));
            }
        }
        (*sem).count -= 1;
        super::mutex_unlock(&mut (*sem).lock)
    }

    pub(crate) unsafe fn sem_post(sem: *mut SemStorage) -> io::Result<()> {
        super::mutex_lock(&mut (*sem).lock)?;
        (*sem).count += 1;
        let eno = libc::pthread_cond_signal(&mut (*sem).cond);
        super::mutex_unlock(&mut (*sem).lock)?;
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    pub(crate) unsafe fn sem_destroy(sem: *mut SemStorage) {
        libc::pthread_cond_destroy(&mut (*sem).cond);
        super::mutex_destroy(&mut (*sem).lock);
    }
}

pub(crate) use sem_impl::{sem_destroy, sem_init_pshared, sem_post, sem_wait};

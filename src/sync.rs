// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Opaque handles to the synchronization primitives embedded in a queue's
// control header. These are never ordinary in-process locks: the backing
// storage lives inside the shared segment, the handle is just a typed
// pointer to it, and either side of the fork may construct one over the
// same bytes.

use crate::error::Result;
use crate::platform;

// ---------------------------------------------------------------------------
// SharedMutex
// ---------------------------------------------------------------------------

/// A process-shared mutex living at a fixed offset inside the shared region.
///
/// The side that owns the queue calls [`SharedMutex::init_at`] exactly once;
/// every other user (including the peer process) attaches with
/// [`SharedMutex::at`]. Teardown is explicit via [`SharedMutex::destroy`],
/// from the owning side only.
#[derive(Debug)]
pub struct SharedMutex {
    ptr: *mut platform::MutexStorage,
}

// Safety: the storage is process-shared by construction; the handle itself
// is just a pointer and all operations go through pthread.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Bytes of backing storage a mutex occupies in the region.
    pub const SIZE: usize = std::mem::size_of::<platform::MutexStorage>();

    /// Initialize the mutex storage at `ptr` and return a handle to it.
    ///
    /// # Safety
    /// `ptr` must point to [`SharedMutex::SIZE`] bytes on an 8-byte boundary
    /// in a live `MAP_SHARED` mapping that no one else is using yet.
    pub unsafe fn init_at(ptr: *mut u8) -> Result<Self> {
        let ptr = ptr as *mut platform::MutexStorage;
        platform::posix::mutex_init_pshared(ptr)?;
        Ok(Self { ptr })
    }

    /// Attach to an already-initialized mutex at `ptr`.
    ///
    /// # Safety
    /// The owning side must have completed [`SharedMutex::init_at`] on the
    /// same bytes before this handle is used.
    pub unsafe fn at(ptr: *mut u8) -> Self {
        Self {
            ptr: ptr as *mut platform::MutexStorage,
        }
    }

    /// Lock, returning a guard that unlocks on drop.
    pub fn lock(&self) -> Result<SharedMutexGuard<'_>> {
        unsafe { platform::posix::mutex_lock(self.ptr)? };
        Ok(SharedMutexGuard { mtx: self })
    }

    fn unlock(&self) {
        // An unlock failure here would mean the mutex bytes are gone or
        // corrupt; there is nothing useful a guard drop can do about it.
        let _ = unsafe { platform::posix::mutex_unlock(self.ptr) };
    }

    /// Destroy the underlying pthread object.
    ///
    /// # Safety
    /// Must be called at most once, unlocked, from the owning side, after
    /// the peer process has detached.
    pub unsafe fn destroy(&self) {
        platform::posix::mutex_destroy(self.ptr);
    }
}

/// RAII lock guard for a [`SharedMutex`]. Unlocks when dropped.
pub struct SharedMutexGuard<'a> {
    mtx: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mtx.unlock();
    }
}

// ---------------------------------------------------------------------------
// SharedSemaphore
// ---------------------------------------------------------------------------

/// A process-shared counting semaphore living inside the shared region.
/// The conduit creates its queue semaphores at value 0: the count tracks
/// the number of framed records a consumer has not yet been woken for.
#[derive(Debug)]
pub struct SharedSemaphore {
    ptr: *mut platform::SemStorage,
}

unsafe impl Send for SharedSemaphore {}
unsafe impl Sync for SharedSemaphore {}

impl SharedSemaphore {
    /// Bytes of backing storage a semaphore occupies in the region.
    pub const SIZE: usize = std::mem::size_of::<platform::SemStorage>();

    /// Initialize the semaphore storage at `ptr` with `value`.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::init_at`].
    pub unsafe fn init_at(ptr: *mut u8, value: u32) -> Result<Self> {
        let ptr = ptr as *mut platform::SemStorage;
        platform::posix::sem_init_pshared(ptr, value)?;
        Ok(Self { ptr })
    }

    /// Attach to an already-initialized semaphore at `ptr`.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::at`].
    pub unsafe fn at(ptr: *mut u8) -> Self {
        Self {
            ptr: ptr as *mut platform::SemStorage,
        }
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) -> Result<()> {
        unsafe { platform::posix::sem_wait(self.ptr)? };
        Ok(())
    }

    /// Increment the count, waking one waiter.
    pub fn post(&self) -> Result<()> {
        unsafe { platform::posix::sem_post(self.ptr)? };
        Ok(())
    }

    /// Destroy the underlying object.
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::destroy`].
    pub unsafe fn destroy(&self) {
        platform::posix::sem_destroy(self.ptr);
    }
}

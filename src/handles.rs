// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request-handle tracking table: handle → ref for every request the parent
// has forwarded but the child has not yet answered. The table reuses the
// parent→child queue's mutex as its lock, so a handle's registration (at
// REQ enqueue) happens-before its removal (at RSP/RELEASE dispatch).

use std::cell::UnsafeCell;
use std::collections::HashMap;

use crate::error::{ConduitError, Result};
use crate::sync::SharedMutexGuard;

/// Concurrent mapping `handle (u64) → ref (u64)`.
///
/// Not internally locked: every method takes a [`SharedMutexGuard`] witness,
/// which callers obtain from the parent→child queue. The map itself lives in
/// parent-process memory only; the child never reads it, and correlation
/// state must survive the child, not the parent.
pub struct HandleTable {
    map: UnsafeCell<HashMap<u64, u64>>,
}

// Safety: the inner map is only reached through methods that demand a
// guard of the (single) queue mutex, serializing all access.
unsafe impl Send for HandleTable {}
unsafe impl Sync for HandleTable {}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            map: UnsafeCell::new(HashMap::new()),
        }
    }

    /// Register a handle. Duplicate handles overwrite the stored ref.
    pub fn insert(&self, _lock: &SharedMutexGuard<'_>, handle: u64, handle_ref: u64) -> Result<()> {
        let map = unsafe { &mut *self.map.get() };
        map.try_reserve(1).map_err(|_| ConduitError::OutOfMemory)?;
        map.insert(handle, handle_ref);
        Ok(())
    }

    /// Remove a handle, returning the stored ref, or 0 if it was not
    /// present.
    pub fn remove(&self, _lock: &SharedMutexGuard<'_>, handle: u64) -> u64 {
        let map = unsafe { &mut *self.map.get() };
        map.remove(&handle).unwrap_or(0)
    }

    /// Remove every entry, invoking `f` with each handle. Used when the
    /// child process has died and all outstanding requests must be failed.
    pub fn drain(&self, _lock: &SharedMutexGuard<'_>, mut f: impl FnMut(u64)) {
        let map = unsafe { &mut *self.map.get() };
        for (handle, _) in map.drain() {
            f(handle);
        }
    }

    /// Number of outstanding handles.
    pub fn len(&self, _lock: &SharedMutexGuard<'_>) -> usize {
        unsafe { &*self.map.get() }.len()
    }

    pub fn is_empty(&self, lock: &SharedMutexGuard<'_>) -> bool {
        self.len(lock) == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

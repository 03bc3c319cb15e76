// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory segment (owning, collaborator side) and the borrowed region
// view the conduit itself holds. The conduit never owns the bytes: the
// segment is created by whoever assembles the node, must survive a consumer
// crash, and is torn down by its creator.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::{ConduitError, Result};

/// Upper bound for POSIX shm object names, including the leading '/'.
/// macOS enforces PSHMNAMLEN (31); elsewhere the practical limit is 255.
#[cfg(target_os = "macos")]
const SHM_NAME_MAX: usize = 31;
#[cfg(not(target_os = "macos"))]
const SHM_NAME_MAX: usize = 255;

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Derive a POSIX-safe shm object name: prepend '/', and when the result
/// would exceed the platform limit, keep a prefix for debuggability and
/// append the FNV-1a hash of the full name.
fn make_shm_name(name: &str) -> String {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    if full.len() <= SHM_NAME_MAX {
        return full;
    }
    // '/' + prefix + '_' + 16 hex digits
    let keep = SHM_NAME_MAX.saturating_sub(1 + 1 + 16);
    let hash = fnv1a_64(full.as_bytes());
    format!("/{}_{hash:016x}", &full[1..1 + keep])
}

// ---------------------------------------------------------------------------
// ShmSegment — owning named POSIX shared memory
// ---------------------------------------------------------------------------

/// Open mode for shared-memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively — fail if it already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A named, owning shared-memory segment (`shm_open` + `mmap(MAP_SHARED)`).
///
/// This is the collaborator that supplies the conduit's byte region: the
/// parent process creates it before forking, the child opens it by name.
/// `Drop` unmaps the local view but never unlinks; the region must outlive
/// any single attached process.
pub struct ShmSegment {
    mem: *mut u8,
    size: usize,
    name: String,
}

// Safety: the mapping is MAP_SHARED by design; concurrent access discipline
// is the responsibility of the primitives placed inside it.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Acquire a named segment of `size` bytes.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> Result<Self> {
        if name.is_empty() || size == 0 {
            return Err(ConduitError::InvalidPara);
        }

        let posix_name = make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes()).map_err(|_| ConduitError::InvalidPara)?;

        let perms: libc::mode_t = 0o666;

        // For CreateOrOpen, try exclusive create first so ftruncate only runs
        // on an object we actually created; truncating an existing object can
        // zero live contents on some platforms before failing.
        let (fd, created) = match mode {
            ShmOpenMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error().into());
                }
                (f, true)
            }
            ShmOpenMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error().into());
                }
                (f, false)
            }
            ShmOpenMode::CreateOrOpen => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e.into());
                    }
                    let f2 = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f2 == -1 {
                        return Err(io::Error::last_os_error().into());
                    }
                    (f2, false)
                }
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        if created {
            let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err.into());
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            name: posix_name,
        })
    }

    /// Mutable pointer to the start of the mapped bytes.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The POSIX object name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrowed view of the whole segment.
    pub fn region(&self) -> ShmRegion {
        unsafe { ShmRegion::from_raw(self.mem, self.size) }
    }

    /// Remove the backing object. The mapping stays valid until drop.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Remove a named segment without an open handle.
    pub fn clear_storage(name: &str) {
        let posix_name = make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        }
    }
}

// ---------------------------------------------------------------------------
// ShmRegion — non-owning view
// ---------------------------------------------------------------------------

/// A non-owning view of shared bytes: base pointer plus length.
///
/// The conduit holds one of these per queue; dropping it never unmaps
/// anything. Constructed from a [`ShmSegment`] or, for regions mapped by
/// other means, via [`ShmRegion::from_raw`].
#[derive(Clone, Copy, Debug)]
pub struct ShmRegion {
    base: *mut u8,
    size: usize,
}

// Safety: a region is just an address range into a MAP_SHARED mapping.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Wrap raw mapped bytes.
    ///
    /// # Safety
    /// `base..base+size` must stay mapped and writable for as long as any
    /// queue built over this region is alive.
    pub unsafe fn from_raw(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// A sub-view. Panics if the range falls outside the region.
    pub fn slice(&self, offset: usize, len: usize) -> ShmRegion {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.size),
            "slice {offset}+{len} out of region of {} bytes",
            self.size
        );
        ShmRegion {
            base: unsafe { self.base.add(offset) },
            size: len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_name_prepends_slash() {
        assert_eq!(make_shm_name("conduit"), "/conduit");
        assert_eq!(make_shm_name("/conduit"), "/conduit");
    }

    #[test]
    fn shm_name_shortens_long_names() {
        let long = "x".repeat(SHM_NAME_MAX * 2);
        let name = make_shm_name(&long);
        assert!(name.len() <= SHM_NAME_MAX);
        assert!(name.starts_with("/x"));
    }
}

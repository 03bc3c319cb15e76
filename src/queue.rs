// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Byte-addressed ring buffer over a borrowed shared-memory region.
//
// Layout: a repr(C) control header at the region base (cursor fields,
// bounded display name, process-shared mutex and semaphore), then the
// payload bytes starting at the next 8-byte boundary. Each record is an
// 8-byte frame header followed by the head and body payloads, both padded
// to a multiple of 8. Payloads may straddle the physical wrap point; the
// frame header never does: it is written either wholly before the wrap or
// at offset 0.
//
// Any number of producers may push (they serialize on the mutex); exactly
// one consumer pops, enforced by the endpoint spawning one consumer thread
// per queue. Posting the semaphore while the queue is empty is the shutdown
// wake: the consumer observes `items == 0` after waking and exits.

use std::ptr;

use log::trace;

use crate::buffer::{ContBuf, QItemBuf};
use crate::ceil8;
use crate::error::{ConduitError, Result};
use crate::handles::HandleTable;
use crate::msg::FrameType;
use crate::platform;
use crate::shm::ShmRegion;
use crate::sync::{SharedMutex, SharedMutexGuard, SharedSemaphore};

/// Bytes of the per-record frame header.
const FRAME_HDR_LEN: usize = 8;

/// Bounded display label stored in the control header.
const QUEUE_NAME_LEN: usize = 32;

/// A queue whose payload area would not exceed this is useless.
const MIN_BUF_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// Control header
// ---------------------------------------------------------------------------

/// Control fields at the region base. Both processes map the same bytes, so
/// every field must sit at a fixed offset: repr(C), no process-local state.
#[repr(C)]
struct QueueHeader {
    /// Next read offset, 0 ≤ head ≤ total.
    head: u32,
    /// Next write offset, 0 ≤ tail ≤ total.
    tail: u32,
    /// Payload capacity in bytes.
    total: u32,
    /// Free payload bytes.
    avail: u32,
    /// Framed records currently in flight.
    items: u32,
    name: [u8; QUEUE_NAME_LEN],
    mutex: platform::MutexStorage,
    sem: platform::SemStorage,
}

// ---------------------------------------------------------------------------
// PoppedFrame
// ---------------------------------------------------------------------------

/// One record popped off a queue. Ownership of both buffers transfers to
/// the consumer; they are released when the frame goes out of scope.
#[derive(Debug)]
pub struct PoppedFrame {
    pub head: QItemBuf,
    pub body: ContBuf,
    /// Raw frame-type byte as read off the wire.
    pub ftype: u8,
}

impl PoppedFrame {
    /// The decoded frame type, or `None` for a byte no producer of this
    /// crate ever writes.
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.ftype)
    }
}

// ---------------------------------------------------------------------------
// ProcQueue
// ---------------------------------------------------------------------------

/// A fixed-size framed byte queue in shared memory.
#[derive(Debug)]
pub struct ProcQueue {
    hdr: *mut QueueHeader,
    buf: *mut u8,
    mutex: SharedMutex,
    sem: SharedSemaphore,
}

// Safety: all mutable state lives in the shared region and is only touched
// under the in-region mutex; the handle struct itself is pointers.
unsafe impl Send for ProcQueue {}
unsafe impl Sync for ProcQueue {}

impl ProcQueue {
    /// Initialize a queue over `region` and become its owning side.
    ///
    /// Only the owner initializes the synchronization primitives; the peer
    /// process attaches to a queue that is already live via
    /// [`ProcQueue::attach`].
    pub fn init(region: ShmRegion, name: &str) -> Result<ProcQueue> {
        let (hdr, buf, total) = Self::carve(region)?;
        unsafe {
            let mutex = SharedMutex::init_at(ptr::addr_of_mut!((*hdr).mutex) as *mut u8)?;
            let sem = SharedSemaphore::init_at(ptr::addr_of_mut!((*hdr).sem) as *mut u8, 0)?;

            let mut label = [0u8; QUEUE_NAME_LEN];
            let n = name.len().min(QUEUE_NAME_LEN - 1);
            label[..n].copy_from_slice(&name.as_bytes()[..n]);
            (*hdr).name = label;

            (*hdr).head = 0;
            (*hdr).tail = 0;
            (*hdr).total = total;
            (*hdr).avail = total;
            (*hdr).items = 0;

            Ok(ProcQueue {
                hdr,
                buf,
                mutex,
                sem,
            })
        }
    }

    /// Attach to a queue the owning side has already initialized.
    ///
    /// # Safety
    /// The owner must have completed [`ProcQueue::init`] over the same
    /// bytes before any operation on the returned queue.
    pub unsafe fn attach(region: ShmRegion) -> Result<ProcQueue> {
        let (hdr, buf, _total) = Self::carve(region)?;
        let mutex = SharedMutex::at(ptr::addr_of_mut!((*hdr).mutex) as *mut u8);
        let sem = SharedSemaphore::at(ptr::addr_of_mut!((*hdr).sem) as *mut u8);
        Ok(ProcQueue {
            hdr,
            buf,
            mutex,
            sem,
        })
    }

    fn carve(region: ShmRegion) -> Result<(*mut QueueHeader, *mut u8, u32)> {
        let hdr_len = ceil8(std::mem::size_of::<QueueHeader>());
        let size = region.size();
        if size <= hdr_len + MIN_BUF_LEN {
            return Err(ConduitError::OutOfMemory);
        }
        debug_assert_eq!(region.base() as usize % 8, 0);
        let hdr = region.base() as *mut QueueHeader;
        let buf = unsafe { region.base().add(hdr_len) };
        Ok((hdr, buf, (size - hdr_len) as u32))
    }

    /// The queue's display label.
    pub fn name(&self) -> String {
        let bytes = unsafe { &(*self.hdr).name };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    /// Payload capacity in bytes.
    pub fn total(&self) -> u32 {
        unsafe { (*self.hdr).total }
    }

    /// Records currently in flight.
    pub fn items(&self) -> Result<u32> {
        let _g = self.lock()?;
        Ok(unsafe { (*self.hdr).items })
    }

    /// Free payload bytes.
    pub fn avail(&self) -> Result<u32> {
        let _g = self.lock()?;
        Ok(unsafe { (*self.hdr).avail })
    }

    /// Lock the queue mutex. Also guards the endpoint's handle table, which
    /// reuses this lock on the parent→child queue.
    pub(crate) fn lock(&self) -> Result<SharedMutexGuard<'_>> {
        self.mutex.lock()
    }

    /// Post the semaphore without enqueuing: the shutdown wake. A consumer
    /// that finds the queue empty after this exits its loop.
    pub fn post_wake(&self) -> Result<()> {
        self.sem.post()
    }

    /// Destroy the in-region primitives.
    ///
    /// # Safety
    /// Owning side only, once, after both consumers and the peer process
    /// are gone.
    pub unsafe fn destroy(&self) {
        self.mutex.destroy();
        self.sem.destroy();
    }

    // --- raw copies ---------------------------------------------------------

    #[inline]
    unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        ptr::copy_nonoverlapping(src.as_ptr(), self.buf.add(offset), src.len());
    }

    #[inline]
    unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        ptr::copy_nonoverlapping(self.buf.add(offset), dst.as_mut_ptr(), dst.len());
    }

    unsafe fn write_frame_header(&self, at: usize, raw_head_len: u16, ftype: FrameType, raw_body_len: u32) {
        let p = self.buf.add(at);
        ptr::copy_nonoverlapping(raw_head_len.to_le_bytes().as_ptr(), p, 2);
        *p.add(2) = ftype as u8;
        // Reserved byte: writers zero it so future extensions stay clean.
        *p.add(3) = 0;
        ptr::copy_nonoverlapping(raw_body_len.to_le_bytes().as_ptr(), p.add(4), 4);
    }

    unsafe fn read_frame_header(&self, at: usize) -> (u16, u8, u32) {
        let p = self.buf.add(at);
        let mut hl = [0u8; 2];
        let mut bl = [0u8; 4];
        ptr::copy_nonoverlapping(p, hl.as_mut_ptr(), 2);
        let ftype = *p.add(2);
        ptr::copy_nonoverlapping(p.add(4), bl.as_mut_ptr(), 4);
        (u16::from_le_bytes(hl), ftype, u32::from_le_bytes(bl))
    }

    // --- enqueue ------------------------------------------------------------

    /// Enqueue one frame. Non-blocking on full: returns `OutOfShmMem`
    /// immediately and lets the caller decide on retry and backoff.
    ///
    /// For a `Req` frame with a nonzero `handle`, the `(handle, handle_ref)`
    /// pair is inserted into `table` inside the same critical section, so
    /// the registration is visible before the frame is.
    pub fn push(
        &self,
        head: &[u8],
        body: &[u8],
        ftype: FrameType,
        handle: u64,
        handle_ref: u64,
        table: Option<&HandleTable>,
    ) -> Result<()> {
        if head.is_empty() || head.len() > u16::MAX as usize || body.len() > u32::MAX as usize {
            return Err(ConduitError::InvalidPara);
        }
        let head_len = ceil8(head.len());
        let body_len = ceil8(body.len());
        let frame_len = FRAME_HDR_LEN + head_len + body_len;

        let guard = self.lock()?;
        let hdr = self.hdr;
        let (pos, items) = unsafe {
            if frame_len > (*hdr).avail as usize {
                return Err(ConduitError::OutOfShmMem);
            }

            if handle != 0 && ftype == FrameType::Req {
                if let Some(table) = table {
                    table.insert(&guard, handle, handle_ref)?;
                }
            }

            let total = (*hdr).total as usize;
            let tail = (*hdr).tail as usize;
            let rd = (*hdr).head as usize;

            let hdr_at = if tail + FRAME_HDR_LEN <= total { tail } else { 0 };
            self.write_frame_header(hdr_at, head.len() as u16, ftype, body.len() as u32);

            let new_tail = if tail < rd {
                // Free space is contiguous between tail and the read cursor.
                self.copy_in(tail + 8, head);
                self.copy_in(tail + 8 + head_len, body);
                tail + 8 + head_len + body_len
            } else {
                let remain = total - tail;
                if remain == 0 {
                    // Already past the wrap: header went to 0.
                    self.copy_in(8, head);
                    self.copy_in(8 + head_len, body);
                    8 + head_len + body_len
                } else if remain == 8 {
                    // Header fills the last slot; both payloads wrap.
                    self.copy_in(0, head);
                    self.copy_in(head_len, body);
                    head_len + body_len
                } else if remain < 8 + head_len {
                    // Head payload straddles the wrap.
                    let first = remain - 8;
                    self.copy_in(tail + 8, &head[..first]);
                    self.copy_in(0, &head[first..]);
                    self.copy_in(head_len - first, body);
                    head_len - first + body_len
                } else if remain < 8 + head_len + body_len {
                    // Body payload straddles the wrap.
                    let first = remain - 8 - head_len;
                    self.copy_in(tail + 8, head);
                    self.copy_in(tail + 8 + head_len, &body[..first]);
                    self.copy_in(0, &body[first..]);
                    body_len - first
                } else {
                    self.copy_in(tail + 8, head);
                    self.copy_in(tail + 8 + head_len, body);
                    tail + 8 + head_len + body_len
                }
            };

            (*hdr).tail = new_tail as u32;
            (*hdr).avail -= frame_len as u32;
            (*hdr).items += 1;
            (tail, (*hdr).items)
        };
        drop(guard);
        self.sem.post()?;

        trace!(
            "queue:{}, push msg at pos:{pos} ftype:{:?} remain:{items} handle:{handle:#x} ref:{handle_ref} head:{} body:{}",
            self.name(),
            ftype,
            head.len(),
            body.len(),
        );
        Ok(())
    }

    // --- dequeue ------------------------------------------------------------

    /// Dequeue one frame, blocking on the semaphore.
    ///
    /// Returns `Ok(None)` for the shutdown wake (woken with `items == 0`).
    /// On allocation failure the semaphore is re-posted so the frame stays
    /// available, and the caller is expected to sleep briefly and retry.
    pub fn pop(&self) -> Result<Option<PoppedFrame>> {
        self.sem.wait()?;

        let guard = self.lock()?;
        let hdr = self.hdr;
        unsafe {
            if (*hdr).items == 0 {
                // Shutdown wake, or a spurious re-post from a failed
                // allocation that another pass already serviced.
                return Ok(None);
            }

            let total = (*hdr).total as usize;
            let rd = (*hdr).head as usize;
            let tail = (*hdr).tail as usize;

            let hdr_at = if rd + FRAME_HDR_LEN <= total { rd } else { 0 };
            let (raw_head_len, ftype, raw_body_len) = self.read_frame_header(hdr_at);
            let head_len = ceil8(raw_head_len as usize);
            let body_len = ceil8(raw_body_len as usize);

            let mut head_buf = match QItemBuf::alloc(head_len) {
                Ok(b) => b,
                Err(e) => {
                    drop(guard);
                    let _ = self.sem.post();
                    return Err(e);
                }
            };
            let mut body_buf = match ContBuf::alloc(body_len) {
                Ok(b) => b,
                Err(e) => {
                    drop(head_buf);
                    drop(guard);
                    let _ = self.sem.post();
                    return Err(e);
                }
            };

            // Copy out the padded lengths, mirroring the enqueue cases; the
            // buffers are truncated to the raw lengths afterwards.
            let new_rd = if rd < tail {
                self.copy_out(rd + 8, head_buf.data_mut());
                self.copy_out(rd + 8 + head_len, body_buf.data_mut());
                rd + 8 + head_len + body_len
            } else {
                let remain = total - rd;
                if remain == 0 {
                    self.copy_out(8, head_buf.data_mut());
                    self.copy_out(8 + head_len, body_buf.data_mut());
                    8 + head_len + body_len
                } else if remain == 8 {
                    self.copy_out(0, head_buf.data_mut());
                    self.copy_out(head_len, body_buf.data_mut());
                    head_len + body_len
                } else if remain < 8 + head_len {
                    let first = remain - 8;
                    self.copy_out(rd + 8, &mut head_buf.data_mut()[..first]);
                    self.copy_out(0, &mut head_buf.data_mut()[first..]);
                    self.copy_out(head_len - first, body_buf.data_mut());
                    head_len - first + body_len
                } else if remain < 8 + head_len + body_len {
                    let first = remain - 8 - head_len;
                    self.copy_out(rd + 8, head_buf.data_mut());
                    self.copy_out(rd + 8 + head_len, &mut body_buf.data_mut()[..first]);
                    self.copy_out(0, &mut body_buf.data_mut()[first..]);
                    body_len - first
                } else {
                    self.copy_out(rd + 8, head_buf.data_mut());
                    self.copy_out(rd + 8 + head_len, body_buf.data_mut());
                    rd + 8 + head_len + body_len
                }
            };

            (*hdr).head = new_rd as u32;
            (*hdr).avail += (FRAME_HDR_LEN + head_len + body_len) as u32;
            (*hdr).items -= 1;
            let items = (*hdr).items;
            drop(guard);

            head_buf.truncate(raw_head_len as usize);
            body_buf.truncate(raw_body_len as usize);

            trace!(
                "queue:{}, pop msg at pos:{rd} ftype:{ftype} remain:{items} head:{raw_head_len} body:{raw_body_len}",
                self.name(),
            );
            Ok(Some(PoppedFrame {
                head: head_buf,
                body: body_buf,
                ftype,
            }))
        }
    }
}

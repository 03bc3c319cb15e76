// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The per-node process endpoint: two queues carved out of one shared
// region (parent→child and child→parent), the handle table, and one
// consumer thread per live queue. The RPC layer sits above as a pair of
// trait seams: a dispatcher the parent loop calls back into, and a node
// handler the child loop delivers requests to.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::ceil8;
use crate::error::{ConduitError, Result};
use crate::handles::HandleTable;
use crate::msg::{FrameType, NodeMsg, RpcMsg, NODE_OFFLINE};
use crate::queue::{PoppedFrame, ProcQueue};
use crate::shm::ShmRegion;

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Callbacks into the RPC runtime that owns the live client connections.
/// Invoked by the parent dispatch loop and by child-death handling.
pub trait RpcDispatcher: Send + Sync {
    /// Deliver a response (or an offline notification) to the client
    /// channel identified by `msg.handle`.
    fn send_response(&self, msg: RpcMsg);

    /// Register the message's handle for broken-link notification.
    fn register_broken_link(&self, msg: RpcMsg);

    /// Release a client channel.
    fn release_handle(&self, handle: u64, code: i32);
}

/// The node's message handler, invoked by the child dispatch loop for each
/// inbound request.
pub trait NodeHandler: Send + Sync {
    /// Process one request. On failure, return the response code; any
    /// response payload left in `msg.rsp` is folded into the synthesized
    /// response.
    fn process(&self, msg: &mut NodeMsg) -> std::result::Result<(), i32>;
}

// ---------------------------------------------------------------------------
// ProcSide
// ---------------------------------------------------------------------------

/// Which half of the conduit this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcSide {
    /// The dispatcher process: owns queue initialization, consumes the
    /// child→parent queue.
    Parent,
    /// A worker process: attaches to live queues, consumes the
    /// parent→child queue.
    Child,
    /// Both loops in one process (single-process mode for testing).
    Both,
}

impl ProcSide {
    fn in_parent(self) -> bool {
        matches!(self, ProcSide::Parent | ProcSide::Both)
    }

    fn in_child(self) -> bool {
        matches!(self, ProcSide::Child | ProcSide::Both)
    }

    /// The side that initializes and later destroys the queue primitives.
    /// `Both` has no separate parent process, so it owns them itself.
    fn owns_queues(self) -> bool {
        self.in_parent()
    }
}

// ---------------------------------------------------------------------------
// ProcEndpoint
// ---------------------------------------------------------------------------

/// Construction parameters for a [`ProcEndpoint`].
pub struct ProcConfig {
    /// Node name, used for queue labels, thread names and log lines.
    pub name: String,
    pub side: ProcSide,
    /// The shared byte region, at least two minimal queues big. The
    /// endpoint borrows it; creation and teardown stay with the caller.
    pub region: ShmRegion,
    pub dispatcher: Arc<dyn RpcDispatcher>,
    pub handler: Arc<dyn NodeHandler>,
}

struct ProcInner {
    name: String,
    /// Parent → child.
    cqueue: ProcQueue,
    /// Child → parent.
    pqueue: ProcQueue,
    handles: HandleTable,
    dispatcher: Arc<dyn RpcDispatcher>,
    handler: Arc<dyn NodeHandler>,
}

/// A node's process endpoint. Created at node start, cleaned up at node
/// stop; the shared region itself belongs to whoever created it.
pub struct ProcEndpoint {
    inner: Arc<ProcInner>,
    side: ProcSide,
    /// Consumer of the parent→child queue (runs in the child process).
    cthread: Option<JoinHandle<()>>,
    /// Consumer of the child→parent queue (runs in the parent process).
    pthread: Option<JoinHandle<()>>,
    cleaned: bool,
}

impl ProcEndpoint {
    /// Carve the region into the two queues and set up the endpoint.
    ///
    /// The region is split in half, both slices rounded to 8-byte
    /// boundaries; if the rounded second slice would overrun the region it
    /// gives up 8 bytes. The owning side initializes the queue primitives,
    /// the child side attaches to them.
    pub fn init(cfg: ProcConfig) -> Result<ProcEndpoint> {
        let size = cfg.region.size();
        let csize = ceil8(size / 2);
        let pstart = csize;
        if pstart >= size {
            return Err(ConduitError::OutOfMemory);
        }
        let mut psize = ceil8(size - pstart);
        if pstart + psize > size {
            psize -= 8;
        }

        let cregion = cfg.region.slice(0, csize);
        let pregion = cfg.region.slice(pstart, psize);

        let cname = format!("{}-cq", cfg.name);
        let pname = format!("{}-pq", cfg.name);

        let (cqueue, pqueue) = if cfg.side.owns_queues() {
            let cqueue = ProcQueue::init(cregion, &cname)?;
            let pqueue = match ProcQueue::init(pregion, &pname) {
                Ok(q) => q,
                Err(e) => {
                    // Partial init: tear the first queue back down.
                    unsafe { cqueue.destroy() };
                    return Err(e);
                }
            };
            (cqueue, pqueue)
        } else {
            unsafe { (ProcQueue::attach(cregion)?, ProcQueue::attach(pregion)?) }
        };

        debug!(
            "node:{}, proc endpoint initialized, cqueue:{csize} pqueue:{psize}",
            cfg.name
        );

        Ok(ProcEndpoint {
            inner: Arc::new(ProcInner {
                name: cfg.name,
                cqueue,
                pqueue,
                handles: HandleTable::new(),
                dispatcher: cfg.dispatcher,
                handler: cfg.handler,
            }),
            side: cfg.side,
            cthread: None,
            pthread: None,
            cleaned: false,
        })
    }

    /// Spawn the consumer threads for this side.
    pub fn run(&mut self) -> Result<()> {
        if self.side.in_parent() && self.pthread.is_none() {
            let inner = Arc::clone(&self.inner);
            let t = thread::Builder::new()
                .name(format!("{}-pqueue", self.inner.name))
                .spawn(move || consume_parent_queue(inner))?;
            debug!(
                "node:{}, thread created to consume parent queue",
                self.inner.name
            );
            self.pthread = Some(t);
        }

        if self.side.in_child() && self.cthread.is_none() {
            let inner = Arc::clone(&self.inner);
            let t = thread::Builder::new()
                .name(format!("{}-cqueue", self.inner.name))
                .spawn(move || consume_child_queue(inner))?;
            debug!(
                "node:{}, thread created to consume child queue",
                self.inner.name
            );
            self.cthread = Some(t);
        }

        Ok(())
    }

    /// Stop the consumer threads: post the semaphore of the queue each one
    /// waits on (the shutdown wake), then join.
    pub fn stop(&mut self) {
        if let Some(t) = self.pthread.take() {
            debug!("node:{}, joining parent-queue consumer", self.inner.name);
            let _ = self.inner.pqueue.post_wake();
            let _ = t.join();
        }

        if let Some(t) = self.cthread.take() {
            debug!("node:{}, joining child-queue consumer", self.inner.name);
            let _ = self.inner.cqueue.post_wake();
            let _ = t.join();
        }
    }

    /// Stop consumers and release endpoint-owned resources. The owning side
    /// destroys the in-region primitives; the bytes stay with the region's
    /// creator.
    pub fn cleanup(&mut self) {
        debug!("node:{}, cleaning up proc endpoint", self.inner.name);
        self.stop();
        if !self.cleaned {
            self.cleaned = true;
            if self.side.owns_queues() {
                unsafe {
                    self.inner.cqueue.destroy();
                    self.inner.pqueue.destroy();
                }
            }
        }
        debug!("node:{}, proc endpoint cleaned up", self.inner.name);
    }

    /// Enqueue a frame on the parent→child queue. For `Req` frames with a
    /// nonzero handle, registers `(handle, handle_ref)` in the handle table
    /// before the frame becomes visible. Non-blocking on full.
    pub fn put_to_child_queue(
        &self,
        head: &[u8],
        body: &[u8],
        handle: u64,
        handle_ref: u64,
        ftype: FrameType,
    ) -> Result<()> {
        self.inner
            .cqueue
            .push(head, body, ftype, handle, handle_ref, Some(&self.inner.handles))
    }

    /// Enqueue a frame on the child→parent queue, retrying with linear
    /// backoff while the queue is full. Responses are never dropped.
    pub fn put_to_parent_queue(&self, head: &[u8], body: &[u8], ftype: FrameType) -> Result<()> {
        self.inner.put_to_parent_queue(head, body, ftype)
    }

    /// Remove a handle from the handle table, returning the registered ref
    /// or 0 if the handle is no longer (or was never) ours.
    pub fn remove_rpc_handle(&self, handle: u64) -> Result<u64> {
        self.inner.remove_rpc_handle(handle)
    }

    /// Fail every outstanding handle after child-process death: each one
    /// receives a response with code [`NODE_OFFLINE`], and the table is
    /// left empty.
    pub fn close_rpc_handles(&self) -> Result<()> {
        let guard = self.inner.cqueue.lock()?;
        self.inner.handles.drain(&guard, |handle| {
            error!(
                "node:{}, child process died, sending offline rsp to handle:{handle:#x}",
                self.inner.name
            );
            self.inner.dispatcher.send_response(RpcMsg {
                handle,
                code: NODE_OFFLINE,
                ..Default::default()
            });
        });
        Ok(())
    }

    /// Number of outstanding request handles.
    pub fn rpc_handle_count(&self) -> Result<usize> {
        let guard = self.inner.cqueue.lock()?;
        Ok(self.inner.handles.len(&guard))
    }
}

impl Drop for ProcEndpoint {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl ProcInner {
    fn put_to_parent_queue(&self, head: &[u8], body: &[u8], ftype: FrameType) -> Result<()> {
        let mut retry: u64 = 0;
        loop {
            match self.pqueue.push(head, body, ftype, 0, 0, None) {
                Ok(()) => return Ok(()),
                Err(ConduitError::OutOfShmMem) => {
                    retry += 1;
                    warn!(
                        "node:{}, failed to put msg to parent queue, no space, retry:{retry}",
                        self.name
                    );
                    thread::sleep(Duration::from_millis(retry));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn remove_rpc_handle(&self, handle: u64) -> Result<u64> {
        let guard = self.cqueue.lock()?;
        Ok(self.handles.remove(&guard, handle))
    }
}

// ---------------------------------------------------------------------------
// Child dispatch loop — consumes the parent→child queue
// ---------------------------------------------------------------------------

fn consume_child_queue(inner: Arc<ProcInner>) {
    debug!("node:{}, start to consume from child queue", inner.name);
    loop {
        let frame = match inner.cqueue.pop() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(
                    "node:{}, no msg in child queue, exiting consumer",
                    inner.name
                );
                break;
            }
            Err(e) => {
                error!(
                    "node:{}, failed to pop msg from child queue since {e}",
                    inner.name
                );
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        };

        let PoppedFrame { head, body, ftype } = frame;
        if FrameType::from_u8(ftype) != Some(FrameType::Req) {
            // A well-formed producer never puts non-REQ frames here.
            error!(
                "node:{}, msg from child queue has invalid ftype:{ftype}",
                inner.name
            );
            continue;
        }

        let rpc = match RpcMsg::decode_head(head.data()) {
            Ok(msg) => msg,
            Err(_) => {
                error!(
                    "node:{}, req from child queue has undecodable head",
                    inner.name
                );
                continue;
            }
        };

        trace!(
            "node:{}, req from child queue, handle:{:#x}",
            inner.name,
            rpc.handle
        );
        let mut msg = NodeMsg { rpc, rsp: None };
        msg.rpc.cont = Some(body);

        if let Err(code) = inner.handler.process(&mut msg) {
            error!(
                "node:{}, failed to process msg, code:{code:#x}, put rsp into parent queue",
                inner.name
            );
            let rsp = RpcMsg {
                handle: msg.rpc.handle,
                ahandle: msg.rpc.ahandle,
                ref_id: msg.rpc.ref_id,
                code,
                cont: msg.rsp.take(),
            };
            let rsp_head = rsp.encode_head();
            if let Err(e) = inner.put_to_parent_queue(&rsp_head, rsp.cont_bytes(), FrameType::Rsp) {
                error!(
                    "node:{}, failed to put rsp into parent queue since {e}",
                    inner.name
                );
            }
        }
        // head, body and any response payload drop here, before the next pop.
    }
}

// ---------------------------------------------------------------------------
// Parent dispatch loop — consumes the child→parent queue
// ---------------------------------------------------------------------------

fn consume_parent_queue(inner: Arc<ProcInner>) {
    debug!("node:{}, start to consume from parent queue", inner.name);
    loop {
        let frame = match inner.pqueue.pop() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(
                    "node:{}, no msg in parent queue, exiting consumer",
                    inner.name
                );
                break;
            }
            Err(e) => {
                error!(
                    "node:{}, failed to pop msg from parent queue since {e}",
                    inner.name
                );
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        };

        let PoppedFrame { head, body, ftype } = frame;
        let ftype = match FrameType::from_u8(ftype) {
            Some(t) => t,
            None => {
                error!(
                    "node:{}, msg from parent queue has invalid ftype:{ftype}",
                    inner.name
                );
                continue;
            }
        };

        let msg = match RpcMsg::decode_head(head.data()) {
            Ok(msg) => msg,
            Err(_) => {
                error!(
                    "node:{}, {ftype:?} msg from parent queue has undecodable head",
                    inner.name
                );
                continue;
            }
        };

        match ftype {
            FrameType::Rsp => {
                trace!(
                    "node:{}, rsp from parent queue, code:{:#x} handle:{:#x}",
                    inner.name,
                    msg.code,
                    msg.handle
                );
                let mut msg = msg;
                msg.cont = Some(body);
                if let Err(e) = inner.remove_rpc_handle(msg.handle) {
                    error!(
                        "node:{}, failed to remove rpc handle since {e}",
                        inner.name
                    );
                }
                inner.dispatcher.send_response(msg);
            }
            FrameType::Regist => {
                trace!(
                    "node:{}, regist msg from parent queue, handle:{:#x}",
                    inner.name,
                    msg.handle
                );
                inner.dispatcher.register_broken_link(msg);
                // body dropped: registration carries no payload upward.
            }
            FrameType::Release => {
                trace!(
                    "node:{}, release msg from parent queue, handle:{:#x}",
                    inner.name,
                    msg.handle
                );
                if let Err(e) = inner.remove_rpc_handle(msg.handle) {
                    error!(
                        "node:{}, failed to remove rpc handle since {e}",
                        inner.name
                    );
                }
                inner.dispatcher.release_handle(msg.handle, msg.code);
            }
            FrameType::Req => {
                error!(
                    "node:{}, msg from parent queue has invalid ftype:{:?}",
                    inner.name, ftype
                );
            }
        }
        // head buffer drops at end of iteration.
    }
}

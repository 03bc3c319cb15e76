// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory RPC conduit between a dispatcher (parent) process and its
// worker node (child) processes. A pair of byte-addressed ring buffers in a
// shared segment carries framed requests and responses across the process
// boundary; a handle table keeps per-request correlation alive so responses,
// broken-link registrations and handle releases can be routed back to the
// RPC layer owning the client connection.

mod error;
pub use error::{ConduitError, Result};

mod platform;

mod sync;
pub use sync::{SharedMutex, SharedMutexGuard, SharedSemaphore};

mod shm;
pub use shm::{ShmOpenMode, ShmRegion, ShmSegment};

mod buffer;
pub use buffer::{ContBuf, QItemBuf};

mod msg;
pub use msg::{FrameType, NodeMsg, RpcMsg, NODE_OFFLINE};

mod queue;
pub use queue::{PoppedFrame, ProcQueue};

mod handles;
pub use handles::HandleTable;

mod endpoint;
pub use endpoint::{NodeHandler, ProcConfig, ProcEndpoint, ProcSide, RpcDispatcher};

/// Round `n` up to the next multiple of 8. Frame headers, padded payloads
/// and queue slice boundaries all live on 8-byte boundaries.
pub(crate) const fn ceil8(n: usize) -> usize {
    (n + 7) & !7
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error model for the conduit. OS primitive failures keep their errno via
// the wrapped `io::Error`; the remaining kinds are the conduit's own.

use std::io;

use thiserror::Error;

/// Errors surfaced by the conduit core.
#[derive(Debug, Error)]
pub enum ConduitError {
    /// Bad enqueue arguments (empty head, oversized lengths).
    #[error("invalid message parameters")]
    InvalidPara,

    /// The shared-memory queue has no room for the frame, or a woken
    /// consumer found the queue logically empty.
    #[error("out of shared-memory queue space")]
    OutOfShmMem,

    /// Allocation failure inside dequeue or the handle table.
    #[error("out of memory")]
    OutOfMemory,

    /// An OS primitive (mutex, semaphore, thread create, shm) failed.
    #[error("system error: {0}")]
    Sys(#[from] io::Error),

    /// The worker process owning the request's handle has exited.
    #[error("worker node is offline")]
    NodeOffline,
}

impl ConduitError {
    /// Stable numeric code for embedding in a response message's `code`
    /// field. These values travel to RPC clients and must not change.
    pub fn rpc_code(&self) -> i32 {
        match self {
            ConduitError::InvalidPara => 0x0101,
            ConduitError::OutOfShmMem => 0x0102,
            ConduitError::OutOfMemory => 0x0103,
            ConduitError::Sys(_) => 0x0104,
            ConduitError::NodeOffline => 0x0108,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConduitError>;

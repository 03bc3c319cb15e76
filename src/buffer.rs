// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Owned byte buffers for frames popped off a queue. Head and body travel
// through *different* allocator contracts: the head buffer stays inside the
// node, while the body is handed off to the RPC layer, which releases it on
// its own schedule. Two distinct types keep that hand-off visible in
// signatures; each one frees through its own `Drop`.

use crate::error::{ConduitError, Result};

fn alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| ConduitError::OutOfMemory)?;
    v.resize(len, 0);
    Ok(v)
}

// ---------------------------------------------------------------------------
// QItemBuf — queue-item (head) buffers
// ---------------------------------------------------------------------------

/// The head buffer of a popped frame. Owned by the dispatch loop that popped
/// it and released when it goes out of scope.
#[derive(Clone, PartialEq, Eq)]
pub struct QItemBuf {
    data: Vec<u8>,
}

impl QItemBuf {
    /// Fallible allocation; queue consumers must survive allocation failure.
    pub(crate) fn alloc(len: usize) -> Result<Self> {
        Ok(Self {
            data: alloc_zeroed(len)?,
        })
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Drop the padding tail after copy-out, keeping the raw length.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl std::fmt::Debug for QItemBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QItemBuf")
            .field("len", &self.data.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ContBuf — RPC continuation (body) buffers
// ---------------------------------------------------------------------------

/// An RPC payload buffer. Once attached to a message it belongs to the RPC
/// layer and is released by whoever consumes the message.
#[derive(Clone, PartialEq, Eq)]
pub struct ContBuf {
    data: Vec<u8>,
}

impl ContBuf {
    pub(crate) fn alloc(len: usize) -> Result<Self> {
        Ok(Self {
            data: alloc_zeroed(len)?,
        })
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for ContBuf {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl std::fmt::Debug for ContBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContBuf")
            .field("len", &self.data.len())
            .finish()
    }
}

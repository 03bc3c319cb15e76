// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// OS backends for the process-shared primitives living inside the shared
// segment. POSIX only: the conduit's mutex and semaphore sit at fixed
// offsets in a borrowed byte region, a layout Win32 kernel objects cannot
// express.

#[cfg(unix)]
pub(crate) mod posix;

#[cfg(unix)]
pub(crate) use posix::{MutexStorage, SemStorage};

// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Process-wide performance counters.
//!
//! The counters are only meaningful when reset and read between operations; concurrent
//! operations on other threads are counted too.

use std::sync::atomic::{AtomicU64, Ordering};

static SWAP_COUNT: AtomicU64 = AtomicU64::new(0);
static READ_COUNT: AtomicU64 = AtomicU64::new(0);
static WRITE_COUNT: AtomicU64 = AtomicU64::new(0);

/// A point-in-time copy of the performance counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Oblivious compare-and-swap operations executed.
    pub swaps: u64,
    /// Blocks read from databases.
    pub reads: u64,
    /// Blocks written to databases.
    pub writes: u64,
}

impl Counters {
    /// Returns the counts accumulated between `earlier` and `self`.
    pub fn since(&self, earlier: &Counters) -> Counters {
        Counters {
            swaps: self.swaps.wrapping_sub(earlier.swaps),
            reads: self.reads.wrapping_sub(earlier.reads),
            writes: self.writes.wrapping_sub(earlier.writes),
        }
    }
}

/// Returns the current counter values.
pub fn snapshot() -> Counters {
    Counters {
        swaps: SWAP_COUNT.load(Ordering::Relaxed),
        reads: READ_COUNT.load(Ordering::Relaxed),
        writes: WRITE_COUNT.load(Ordering::Relaxed),
    }
}

/// Sets every counter to zero.
pub fn reset() {
    SWAP_COUNT.store(0, Ordering::Relaxed);
    READ_COUNT.store(0, Ordering::Relaxed);
    WRITE_COUNT.store(0, Ordering::Relaxed);
}

pub(crate) fn record_swaps(count: u64) {
    SWAP_COUNT.fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_reads(count: u64) {
    READ_COUNT.fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_writes(count: u64) {
    WRITE_COUNT.fetch_add(count, Ordering::Relaxed);
}

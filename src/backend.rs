// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Storage contexts from which ORAM trees, position maps and sort scratch space are allocated.

use crate::{
    database::{AccessEvent, Database, SimpleDatabase, TracingDatabase},
    Address, OramBlock,
};
use std::{cell::RefCell, mem::size_of, rc::Rc};
use thiserror::Error;

/// Failures reported by a [`StorageBackend`] or by one of its databases.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend cannot satisfy an allocation request.
    #[error("Backend out of space: requested {requested} bytes, {available} available.")]
    OutOfSpace {
        /// Bytes requested by the allocation.
        requested: u64,
        /// Bytes still available in the backend.
        available: u64,
    },
    /// A block address outside the allocation was read or written.
    #[error("Block address {address} out of range for an allocation of {capacity} blocks.")]
    AddressOutOfRange {
        /// The offending block address.
        address: Address,
        /// The number of blocks in the allocation.
        capacity: Address,
    },
}

/// An explicit storage context. Every object that needs untrusted storage is handed a backend
/// at construction and allocates its databases from it.
pub trait StorageBackend: std::fmt::Debug {
    /// The database type handed out by this backend.
    type Allocation<V: OramBlock>: Database<V>;

    /// Allocates a database of `capacity` default-initialized blocks.
    fn allocate<V: OramBlock>(
        &mut self,
        capacity: Address,
    ) -> Result<Self::Allocation<V>, BackendError>;

    /// Returns the space held by `database` to the backend.
    fn release<V: OramBlock>(&mut self, database: Self::Allocation<V>)
        -> Result<(), BackendError>;
}

fn allocation_bytes<V>(capacity: Address) -> u64 {
    // `usize` always fits in `u64` on supported targets.
    capacity.saturating_mul(size_of::<V>() as u64)
}

/// A backend holding every allocation in process memory, up to a byte limit.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    limit_bytes: u64,
    allocated_bytes: u64,
}

impl MemoryBackend {
    /// Returns a backend that refuses allocations beyond `limit_bytes` in total.
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit_bytes,
            allocated_bytes: 0,
        }
    }

    /// Returns a backend with no allocation limit.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    /// Returns the number of bytes currently allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    fn reserve(&mut self, requested: u64) -> Result<(), BackendError> {
        let available = self.limit_bytes - self.allocated_bytes;
        if requested > available {
            return Err(BackendError::OutOfSpace {
                requested,
                available,
            });
        }
        self.allocated_bytes += requested;
        Ok(())
    }

    fn unreserve(&mut self, released: u64) {
        self.allocated_bytes = self.allocated_bytes.saturating_sub(released);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl StorageBackend for MemoryBackend {
    type Allocation<V: OramBlock> = SimpleDatabase<V>;

    fn allocate<V: OramBlock>(
        &mut self,
        capacity: Address,
    ) -> Result<SimpleDatabase<V>, BackendError> {
        let requested = allocation_bytes::<V>(capacity);
        self.reserve(requested)?;
        log::debug!(
            "MemoryBackend::allocate({} blocks, {} bytes)",
            capacity,
            requested
        );
        Ok(SimpleDatabase::with_capacity(capacity))
    }

    fn release<V: OramBlock>(&mut self, database: SimpleDatabase<V>) -> Result<(), BackendError> {
        self.unreserve(allocation_bytes::<V>(database.len()));
        Ok(())
    }
}

/// A backend that records the address of every block access made through its databases.
///
/// Two executions of an oblivious algorithm over inputs of the same size and with the same
/// randomness must produce identical traces.
#[derive(Debug, Clone)]
pub struct TracingBackend {
    memory: MemoryBackend,
    trace: Rc<RefCell<Vec<AccessEvent>>>,
    next_handle: u64,
}

impl TracingBackend {
    /// Returns an unbounded tracing backend with an empty trace.
    pub fn new() -> Self {
        Self {
            memory: MemoryBackend::unbounded(),
            trace: Rc::new(RefCell::new(Vec::new())),
            next_handle: 0,
        }
    }

    /// Returns a copy of the accesses recorded so far.
    pub fn trace(&self) -> Vec<AccessEvent> {
        self.trace.borrow().clone()
    }

    /// Returns the number of accesses recorded so far.
    pub fn trace_len(&self) -> usize {
        self.trace.borrow().len()
    }

    /// Discards the accesses recorded so far.
    pub fn clear_trace(&mut self) {
        self.trace.borrow_mut().clear();
    }
}

impl Default for TracingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for TracingBackend {
    type Allocation<V: OramBlock> = TracingDatabase<V>;

    fn allocate<V: OramBlock>(
        &mut self,
        capacity: Address,
    ) -> Result<TracingDatabase<V>, BackendError> {
        let data = self.memory.allocate::<V>(capacity)?;
        let handle = self.next_handle;
        self.next_handle += 1;
        Ok(TracingDatabase::new_traced(data, handle, Rc::clone(&self.trace)))
    }

    fn release<V: OramBlock>(&mut self, database: TracingDatabase<V>) -> Result<(), BackendError> {
        self.memory.release(database.into_inner())
    }
}

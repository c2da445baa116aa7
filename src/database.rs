// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Memory abstractions for oblivious algorithms.

use crate::{backend::BackendError, counters, Address, ObliviousError, Oram, OramBlock};
use rand::{CryptoRng, RngCore};
use std::{cell::RefCell, rc::Rc};

/// A fixed-capacity sequence of blocks in untrusted storage.
///
/// Every block read or write may be observed by an adversary. Oblivious algorithms in this
/// crate only touch a database through this trait.
pub trait Database<V: OramBlock>
where
    Self: Sized + std::fmt::Debug,
{
    /// Returns a new `Database` filled with default values.
    fn new(number_of_addresses: Address) -> Result<Self, ObliviousError>;
    /// Returns the number of values stored by `self`.
    fn capacity(&self) -> Result<Address, ObliviousError>;
    /// Reads the value stored at `index`.
    fn read_db(&mut self, index: Address) -> Result<V, ObliviousError>;
    /// Writes the value stored at `index`. Returns the value previously stored there.
    fn write_db(&mut self, index: Address, value: V) -> Result<V, ObliviousError>;

    /// Reads `out.len()` consecutive values starting at `start`.
    fn read_range(&mut self, start: Address, out: &mut [V]) -> Result<(), ObliviousError> {
        let mut index = start;
        for slot in out.iter_mut() {
            *slot = self.read_db(index)?;
            index += 1;
        }
        Ok(())
    }

    /// Writes `values` to consecutive addresses starting at `start`.
    fn write_range(&mut self, start: Address, values: &[V]) -> Result<(), ObliviousError> {
        let mut index = start;
        for value in values {
            self.write_db(index, *value)?;
            index += 1;
        }
        Ok(())
    }
}

/// A simple Database that stores its data as a Vec.
#[derive(Debug)]
pub struct SimpleDatabase<V>(Vec<V>);

impl<V: OramBlock> SimpleDatabase<V> {
    pub(crate) fn with_capacity(number_of_addresses: Address) -> Self {
        // Allocations larger than the address space fail inside `Vec`.
        Self(vec![V::default(); number_of_addresses as usize])
    }

    /// Returns the number of blocks held.
    pub fn len(&self) -> Address {
        self.0.len() as Address
    }

    /// Returns `true` if the database holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the stored blocks, bypassing access accounting.
    pub fn as_slice(&self) -> &[V] {
        &self.0
    }

    /// Consumes the database and returns its blocks.
    pub fn into_inner(self) -> Vec<V> {
        self.0
    }

    fn out_of_range(&self, index: Address) -> ObliviousError {
        BackendError::AddressOutOfRange {
            address: index,
            capacity: self.len(),
        }
        .into()
    }
}

impl<V> From<Vec<V>> for SimpleDatabase<V> {
    fn from(values: Vec<V>) -> Self {
        Self(values)
    }
}

impl<V: OramBlock> Database<V> for SimpleDatabase<V> {
    fn new(number_of_addresses: Address) -> Result<Self, ObliviousError> {
        Ok(Self(vec![V::default(); number_of_addresses.try_into()?]))
    }

    fn capacity(&self) -> Result<Address, ObliviousError> {
        Ok(self.0.len().try_into()?)
    }

    fn read_db(&mut self, index: Address) -> Result<V, ObliviousError> {
        let slot: usize = index.try_into()?;
        let value = *self.0.get(slot).ok_or_else(|| self.out_of_range(index))?;
        counters::record_reads(1);
        Ok(value)
    }

    fn write_db(&mut self, index: Address, value: V) -> Result<V, ObliviousError> {
        let slot: usize = index.try_into()?;
        if slot >= self.0.len() {
            return Err(self.out_of_range(index));
        }
        counters::record_writes(1);
        Ok(std::mem::replace(&mut self.0[slot], value))
    }
}

/// A Database that counts reads and writes.
#[derive(Debug)]
pub struct CountAccessesDatabase<V> {
    data: SimpleDatabase<V>,
    /// `reads[i]` tracks the total number of reads made to index `i`.
    pub reads: Vec<u64>,
    /// `writes[i]` tracks the total number of writes made to index `i`.
    pub writes: Vec<u64>,
}

impl<V> CountAccessesDatabase<V> {
    /// Returns the total number of reads to the database.
    pub fn get_read_count(&self) -> u64 {
        self.reads.iter().sum()
    }

    /// Returns the total number of writes to the database.
    pub fn get_write_count(&self) -> u64 {
        self.writes.iter().sum()
    }

    /// Zeroes the per-address counters.
    pub fn reset_counts(&mut self) {
        self.reads.iter_mut().for_each(|r| *r = 0);
        self.writes.iter_mut().for_each(|w| *w = 0);
    }
}

impl<V: OramBlock> Database<V> for CountAccessesDatabase<V> {
    fn new(number_of_addresses: Address) -> Result<Self, ObliviousError> {
        Ok(Self {
            data: Database::new(number_of_addresses)?,
            reads: vec![0u64; number_of_addresses.try_into()?],
            writes: vec![0u64; number_of_addresses.try_into()?],
        })
    }

    fn read_db(&mut self, index: Address) -> Result<V, ObliviousError> {
        log::debug!("Physical read -- {}", index);
        let value = self.data.read_db(index)?;
        self.reads[usize::try_from(index)?] += 1;
        Ok(value)
    }

    fn write_db(&mut self, index: Address, value: V) -> Result<V, ObliviousError> {
        log::debug!("Physical write -- {}", index);
        let previous = self.data.write_db(index, value)?;
        self.writes[usize::try_from(index)?] += 1;
        Ok(previous)
    }

    fn capacity(&self) -> Result<Address, ObliviousError> {
        self.data.capacity()
    }
}

/// Whether a recorded access was a read or a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// A block read.
    Read,
    /// A block write.
    Write,
}

/// One block access observed by a [`TracingDatabase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccessEvent {
    /// The allocation the access was made to.
    pub handle: u64,
    /// The block address within the allocation.
    pub address: Address,
    /// Read or write.
    pub kind: AccessKind,
}

/// A Database that appends every access to a trace shared with the backend that allocated it.
#[derive(Debug)]
pub struct TracingDatabase<V> {
    data: SimpleDatabase<V>,
    handle: u64,
    trace: Rc<RefCell<Vec<AccessEvent>>>,
}

impl<V> TracingDatabase<V> {
    pub(crate) fn new_traced(
        data: SimpleDatabase<V>,
        handle: u64,
        trace: Rc<RefCell<Vec<AccessEvent>>>,
    ) -> Self {
        Self {
            data,
            handle,
            trace,
        }
    }

    /// Consumes the database and returns the untraced storage.
    pub fn into_inner(self) -> SimpleDatabase<V> {
        self.data
    }

    fn record(&self, address: Address, kind: AccessKind) {
        self.trace.borrow_mut().push(AccessEvent {
            handle: self.handle,
            address,
            kind,
        });
    }
}

impl<V: OramBlock> Database<V> for TracingDatabase<V> {
    // A standalone tracing database keeps its trace to itself.
    fn new(number_of_addresses: Address) -> Result<Self, ObliviousError> {
        Ok(Self::new_traced(
            Database::new(number_of_addresses)?,
            0,
            Rc::new(RefCell::new(Vec::new())),
        ))
    }

    fn capacity(&self) -> Result<Address, ObliviousError> {
        self.data.capacity()
    }

    fn read_db(&mut self, index: Address) -> Result<V, ObliviousError> {
        self.record(index, AccessKind::Read);
        self.data.read_db(index)
    }

    fn write_db(&mut self, index: Address, value: V) -> Result<V, ObliviousError> {
        self.record(index, AccessKind::Write);
        self.data.write_db(index, value)
    }
}

/// A database viewed as a (non-oblivious) ORAM, used as a reference in tests and benchmarks.
#[derive(Debug)]
pub struct DatabaseOram<D, V> {
    /// The wrapped database.
    pub database: D,
    _value: std::marker::PhantomData<V>,
}

impl<V: OramBlock, D: Database<V>> DatabaseOram<D, V> {
    /// Returns a new database of `block_capacity` default values viewed as an ORAM.
    pub fn new(block_capacity: Address) -> Result<Self, ObliviousError> {
        Ok(Self {
            database: D::new(block_capacity)?,
            _value: std::marker::PhantomData,
        })
    }
}

// Lets the same correctness tests run against plain databases and against ORAMs.
impl<V: OramBlock, D: Database<V>> Oram for DatabaseOram<D, V> {
    type V = V;

    fn block_capacity(&self) -> Result<Address, ObliviousError> {
        self.database.capacity()
    }

    fn access<R: RngCore + CryptoRng, F: Fn(&V) -> V>(
        &mut self,
        index: Address,
        callback: F,
        _: &mut R,
    ) -> Result<V, ObliviousError> {
        let value = self.database.read_db(index)?;
        self.database.write_db(index, callback(&value))?;
        Ok(value)
    }
}

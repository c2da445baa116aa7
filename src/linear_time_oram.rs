// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A simple linear-time implementation of Oblivious RAM.

use crate::{
    backend::{MemoryBackend, StorageBackend},
    database::Database,
    Address, ObliviousError, Oram, OramBlock,
};
use rand::{CryptoRng, RngCore};
use subtle::{ConditionallySelectable, ConstantTimeEq, ConstantTimeLess};

/// A simple ORAM that, for each access, ensures obliviousness by making a complete pass over the database,
/// reading and writing each memory location.
#[derive(Debug)]
pub struct LinearTimeOram<V: OramBlock, S: StorageBackend = MemoryBackend> {
    /// The memory of the ORAM (public for benchmarking).
    pub physical_memory: S::Allocation<V>,
}

impl<V: OramBlock, S: StorageBackend> LinearTimeOram<V, S> {
    /// Returns a new `LinearTimeOram` of `block_capacity` default values, allocated from `backend`.
    pub fn new(block_capacity: Address, backend: &mut S) -> Result<Self, ObliviousError> {
        log::info!("LinearTimeOram::new(capacity = {})", block_capacity);
        let physical_memory = backend.allocate(block_capacity)?;
        Ok(Self { physical_memory })
    }

    /// Gives the memory of the ORAM back to `backend`.
    pub fn release(self, backend: &mut S) -> Result<(), ObliviousError> {
        Ok(backend.release(self.physical_memory)?)
    }
}

impl<V: OramBlock, S: StorageBackend> Oram for LinearTimeOram<V, S> {
    type V = V;

    fn access<R: RngCore + CryptoRng, F: Fn(&V) -> V>(
        &mut self,
        index: Address,
        callback: F,
        _: &mut R,
    ) -> Result<V, ObliviousError> {
        let capacity = self.block_capacity()?;
        let index_in_bounds: bool = index.ct_lt(&capacity).into();

        // This operation is not constant-time, but only leaks whether the ORAM index is well-formed or not.
        if !index_in_bounds {
            return Err(ObliviousError::AddressOutOfBoundsError {
                attempted: index,
                capacity,
            });
        }

        // This is a dummy value which will always be overwritten.
        let mut result = V::default();

        for i in 0..capacity {
            let mut entry = self.physical_memory.read_db(i)?;
            let is_requested_index = i.ct_eq(&index);

            result.conditional_assign(&entry, is_requested_index);
            let potential_new_value = callback(&entry);
            entry.conditional_assign(&potential_new_value, is_requested_index);

            self.physical_memory.write_db(i, entry)?;
        }
        Ok(result)
    }

    fn block_capacity(&self) -> Result<Address, ObliviousError> {
        self.physical_memory.capacity()
    }
}

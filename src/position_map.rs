// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A recursive Path ORAM position map data structure.

use crate::{
    backend::StorageBackend,
    bucket::PositionBlock,
    linear_time_oram::LinearTimeOram,
    path_oram::PathOram,
    utils::TreeIndex,
    Address, BlockSize, BucketSize, ObliviousError, Oram, RecursionCutoff, StashSize,
};
use rand::{CryptoRng, RngCore};
use subtle::{ConditionallySelectable, ConstantTimeEq};

/// A recursive Path ORAM position map data structure. `AB` is the number of positions stored in each ORAM block.
///
/// Positions are initially 0, which no leaf can equal; the Path ORAM treats such an address as never written.
#[derive(Debug)]
pub enum PositionMap<const AB: BlockSize, const Z: BucketSize, S: StorageBackend> {
    /// A simple, linear-time ORAM of position blocks.
    Base(LinearTimeOram<PositionBlock<AB>, S>),
    /// A Path ORAM of position blocks, whose own position map is again a `PositionMap`.
    Recursive(Box<PathOram<PositionBlock<AB>, Z, AB, S>>),
}

impl<const AB: BlockSize, const Z: BucketSize, S: StorageBackend> PositionMap<AB, Z, S> {
    /// Returns a position map for `number_of_addresses` addresses, allocated from `backend`.
    ///
    /// Below `recursion_cutoff` position blocks the map is a linear scanning ORAM.
    pub fn new(
        number_of_addresses: Address,
        backend: &mut S,
        overflow_size: StashSize,
        recursion_cutoff: RecursionCutoff,
    ) -> Result<Self, ObliviousError> {
        log::debug!(
            "PositionMap::new(AB = {}, Z = {}, C = {})",
            AB,
            Z,
            number_of_addresses
        );

        if (AB < 2) | (!AB.is_power_of_two()) {
            return Err(ObliviousError::InvalidConfigurationError(
                "positions per block must be a power of two and at least 2",
            ));
        }

        let ab_address: Address = AB.try_into()?;
        let number_of_blocks = number_of_addresses.div_ceil(ab_address);

        if number_of_blocks <= recursion_cutoff {
            Ok(Self::Base(LinearTimeOram::new(number_of_blocks, backend)?))
        } else {
            let block_capacity = number_of_blocks.next_power_of_two().max(2);
            Ok(Self::Recursive(Box::new(PathOram::new_with_parameters(
                block_capacity,
                backend,
                overflow_size,
                recursion_cutoff,
            )?)))
        }
    }

    /// Gives every level of the map back to `backend`.
    pub fn release(self, backend: &mut S) -> Result<(), ObliviousError> {
        match self {
            PositionMap::Base(linear) => linear.release(backend),
            PositionMap::Recursive(inner) => inner.release(backend),
        }
    }

    /// The number of Path ORAM levels below this map.
    pub(crate) fn recursion_height(&self) -> usize {
        match self {
            PositionMap::Base(_) => 0,
            PositionMap::Recursive(inner) => 1 + inner.recursion_height(),
        }
    }

    fn address_of_block(address: Address) -> Address {
        address >> AB.ilog2()
    }

    fn address_within_block(address: Address) -> Result<usize, ObliviousError> {
        let mask: Address = (AB - 1).try_into()?;
        Ok((address & mask).try_into()?)
    }
}

impl<const AB: BlockSize, const Z: BucketSize, S: StorageBackend> Oram for PositionMap<AB, Z, S> {
    type V = TreeIndex;

    fn block_capacity(&self) -> Result<Address, ObliviousError> {
        let ab_address: Address = AB.try_into()?;
        match self {
            PositionMap::Base(linear_oram) => Ok(linear_oram.block_capacity()? * ab_address),
            PositionMap::Recursive(block_oram) => Ok(block_oram.block_capacity()? * ab_address),
        }
    }

    // Overriding the default method for logging purposes.
    fn read<R: RngCore + CryptoRng>(
        &mut self,
        index: Address,
        rng: &mut R,
    ) -> Result<TreeIndex, ObliviousError> {
        log::debug!(
            "Level {} position map read: {}",
            self.recursion_height(),
            index
        );
        let callback = |x: &TreeIndex| *x;
        self.access(index, callback, rng)
    }

    // Overriding the default method for logging purposes.
    fn write<R: RngCore + CryptoRng>(
        &mut self,
        index: Address,
        new_value: TreeIndex,
        rng: &mut R,
    ) -> Result<TreeIndex, ObliviousError> {
        log::debug!(
            "Level {} position map write: {}",
            self.recursion_height(),
            index
        );
        let callback = |_: &TreeIndex| new_value;
        self.access(index, callback, rng)
    }

    fn access<R: RngCore + CryptoRng, F: Fn(&TreeIndex) -> TreeIndex>(
        &mut self,
        address: Address,
        callback: F,
        rng: &mut R,
    ) -> Result<TreeIndex, ObliviousError> {
        // (1) Split the address into the address of its position block and an offset within that block.
        let address_of_block = Self::address_of_block(address);
        let address_within_block = Self::address_within_block(address)?;

        // (2) Access the block, updating only the position of interest.
        let block_callback = |block: &PositionBlock<AB>| {
            let mut result: PositionBlock<AB> = *block;
            for i in 0..block.data.len() {
                let index_matches = i.ct_eq(&address_within_block);
                let position_to_write = callback(&block.data[i]);
                result.data[i].conditional_assign(&position_to_write, index_matches);
            }
            result
        };

        let block = match self {
            PositionMap::Base(linear_oram) => {
                linear_oram.access(address_of_block, block_callback, rng)?
            }
            PositionMap::Recursive(block_oram) => {
                block_oram.access(address_of_block, block_callback, rng)?
            }
        };

        // (3) Extract the old position without indexing by the secret offset.
        let mut result = TreeIndex::default();
        for i in 0..block.data.len() {
            let index_matches = i.ct_eq(&address_within_block);
            result.conditional_assign(&block.data[i], index_matches);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::MemoryBackend, test_utils::*};

    #[test]
    fn small_maps_are_linear() {
        let mut backend = MemoryBackend::default();
        let map = PositionMap::<8, 4, _>::new(64, &mut backend, 40, 16).unwrap();
        assert_eq!(map.recursion_height(), 0);
        assert_eq!(map.block_capacity().unwrap(), 64);
    }

    #[test]
    fn large_maps_recurse() {
        let mut backend = MemoryBackend::default();
        // 1024 addresses in 128 blocks of 8 recurse into a Path ORAM of 128 blocks,
        // whose own map of 16 blocks is linear.
        let map = PositionMap::<8, 4, _>::new(1024, &mut backend, 40, 16).unwrap();
        assert_eq!(map.recursion_height(), 1);
        assert_eq!(map.block_capacity().unwrap(), 1024);
    }

    #[test]
    fn positions_start_unassigned_and_persist() {
        let mut rng = test_rng();
        let mut backend = MemoryBackend::default();
        let mut map = PositionMap::<4, 4, _>::new(256, &mut backend, 40, 4).unwrap();
        assert!(map.recursion_height() > 0);

        for address in 0..256 {
            assert_eq!(map.write(address, address + 1000, &mut rng).unwrap(), 0);
        }
        for address in (0..256).rev() {
            assert_eq!(map.read(address, &mut rng).unwrap(), address + 1000);
        }
    }

    #[test]
    fn invalid_block_size_is_rejected() {
        let mut backend = MemoryBackend::default();
        assert!(matches!(
            PositionMap::<3, 4, _>::new(64, &mut backend, 40, 16),
            Err(ObliviousError::InvalidConfigurationError(_))
        ));
    }
}

// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of Path ORAM.

use crate::{
    backend::{MemoryBackend, StorageBackend},
    bucket::{Bucket, PathOramBlock},
    linear_time_oram::LinearTimeOram,
    position_map::PositionMap,
    stash::ObliviousStash,
    utils::{CompleteBinaryTreeIndex, TreeHeight, TreeIndex},
    Address, BlockSize, BucketSize, ObliviousError, Oram, OramBlock, RecursionCutoff, StashSize,
};
use rand::{CryptoRng, RngCore};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeLess};

/// The default cutoff size in blocks
/// below which `PathOram` uses a linear position map instead of a recursive one.
pub const DEFAULT_RECURSION_CUTOFF: RecursionCutoff = 1 << 14;

/// The parameter "Z" from the Path ORAM literature that sets the number of blocks per bucket; typical values are 3 or 4.
/// Here we adopt the more conservative setting of 4.
pub const DEFAULT_BLOCKS_PER_BUCKET: BucketSize = 4;

/// The default number of positions stored per position block.
pub const DEFAULT_POSITIONS_PER_BLOCK: BlockSize = 8;

/// The default number of overflow blocks that the Path ORAM stash (and recursive stashes) can store.
pub const DEFAULT_STASH_OVERFLOW_SIZE: StashSize = 40;

const LINEAR_TIME_ORAM_CUTOFF: RecursionCutoff = 1 << 10;

/// The tree and stash of a Path ORAM, addressed by explicit leaf positions.
///
/// Position bookkeeping is left to the owner: [`PathOram`] keeps positions in a [`PositionMap`],
/// while the oblivious map keeps them in the nodes that point to each block.
#[derive(Debug)]
pub(crate) struct PathOramTree<V: OramBlock, const Z: BucketSize, S: StorageBackend> {
    /// The untrusted memory holding the buckets; index 0 is unused and the root is at index 1.
    physical_memory: S::Allocation<Bucket<V, Z>>,
    stash: ObliviousStash<V>,
    height: TreeHeight,
}

impl<V: OramBlock, const Z: BucketSize, S: StorageBackend> PathOramTree<V, Z, S> {
    /// Allocates a tree of `number_of_buckets` buckets, which must be a power of two and at least 2.
    pub fn new(
        number_of_buckets: Address,
        overflow_size: StashSize,
        backend: &mut S,
    ) -> Result<Self, ObliviousError> {
        if !number_of_buckets.is_power_of_two() | (number_of_buckets <= 1) {
            return Err(ObliviousError::InvalidConfigurationError(
                "the number of buckets must be a power of two and at least 2",
            ));
        }

        if Z <= 1 {
            return Err(ObliviousError::InvalidConfigurationError(
                "buckets must hold at least 2 blocks",
            ));
        }

        let height: TreeHeight = (number_of_buckets.ilog2() - 1).into();
        let path_size = u64::try_from(Z)? * (height + 1);

        Ok(Self {
            physical_memory: backend.allocate(number_of_buckets)?,
            stash: ObliviousStash::new(path_size, overflow_size)?,
            height,
        })
    }

    /// Gives the buckets back to `backend`. Blocks still in the stash are dropped.
    pub fn release(self, backend: &mut S) -> Result<(), ObliviousError> {
        Ok(backend.release(self.physical_memory)?)
    }

    pub fn height(&self) -> TreeHeight {
        self.height
    }

    pub fn random_leaf<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<TreeIndex, ObliviousError> {
        Ok(TreeIndex::random_leaf(self.height, rng)?)
    }

    /// Reads the path to `position`, applies `callback` to the block at `address` and moves it to
    /// `new_position`, then evicts along the same path. Returns the previous value.
    pub fn access_on_path<F: Fn(&V) -> V>(
        &mut self,
        address: Address,
        position: TreeIndex,
        new_position: TreeIndex,
        callback: F,
    ) -> Result<V, ObliviousError> {
        debug_assert!(position.is_leaf(self.height));

        self.stash
            .read_from_path(&mut self.physical_memory, position)?;

        // Scan the stash for the target block, read its value into `result`,
        // and overwrite its position (and possibly its value).
        let result = self.stash.access(address, new_position, callback);

        // Evict blocks from the stash into the path that was just read,
        // replacing them with dummy blocks.
        self.stash
            .write_to_path(&mut self.physical_memory, position)?;

        Ok(result)
    }

    /// Reads the path to `position` and removes the block at `address`, if present.
    /// The returned `Choice` is set if the block was found.
    pub fn remove_on_path(
        &mut self,
        address: Address,
        position: TreeIndex,
    ) -> Result<(V, Choice), ObliviousError> {
        debug_assert!(position.is_leaf(self.height));

        self.stash
            .read_from_path(&mut self.physical_memory, position)?;
        let result = self.stash.take(address);
        self.stash
            .write_to_path(&mut self.physical_memory, position)?;

        Ok(result)
    }

    /// Inserts `value` at `address` with leaf `position` if `real` is set, and evicts along the
    /// path to `position` in either case. The address must not already be stored.
    pub fn insert_on_path(
        &mut self,
        address: Address,
        position: TreeIndex,
        value: V,
        real: Choice,
    ) -> Result<(), ObliviousError> {
        debug_assert!(position.is_leaf(self.height));

        self.stash
            .read_from_path(&mut self.physical_memory, position)?;
        self.stash.insert(
            PathOramBlock {
                value,
                address,
                position,
            },
            real,
        );
        self.stash
            .write_to_path(&mut self.physical_memory, position)
    }

    #[cfg(test)]
    pub fn stash_occupancy(&self) -> StashSize {
        self.stash.occupancy()
    }
}

/// A doubly oblivious Path ORAM.
///
/// ## Parameters
///
/// - Block type `V`: the type of elements stored by the ORAM.
/// - Bucket size `Z`: the number of blocks per Path ORAM bucket.
///     Must be at least 2. Typical values are 3, 4, or 5.
///     Along with the overflow size, this value affects the probability
///     of stash overflow (see below) and should be set with care.
/// - Positions per block `AB`:
///     The number of positions stored in each block of the recursive position map ORAM.
///     Must be a power of two and must be at least 2 (otherwise the recursion will not terminate).
///     Otherwise, can be freely tuned for performance.
/// - Storage backend `S`: where the tree and every level of the position map are allocated.
/// - Recursion cutoff: the maximum number of position blocks that will be stored in a linear scanning ORAM.
///     Above this value, the position map is itself a Path ORAM.
/// - Overflow size: The number of blocks that the stash can store between ORAM accesses without overflowing.
///
/// ## Security
///
/// Every access reads and writes exactly one root-to-leaf path of a uniformly random leaf,
/// and the stash is processed with data-independent control flow.
///
/// If more than `overflow_size` blocks remain in the stash after an eviction, the access fails with
/// a `StashOverflowError` and the ORAM must be discarded. With Z = 4, experiments from the
/// [original Path ORAM paper](https://eprint.iacr.org/2013/280.pdf) indicate that the probability
/// of overflow is independent of the number N of blocks stored, and that setting SO = 40 is enough
/// to reduce this probability to below 2^{-50} (Figure 3).
///
/// Addresses are initialized lazily: a never-written address has position 0 in the position map,
/// and reading it returns `V::default()`.
#[derive(Debug)]
pub struct PathOram<
    V: OramBlock,
    const Z: BucketSize,
    const AB: BlockSize,
    S: StorageBackend = MemoryBackend,
> {
    tree: PathOramTree<V, Z, S>,
    /// The Path ORAM position map.
    position_map: PositionMap<AB, Z, S>,
    block_capacity: Address,
}

impl<V: OramBlock, const Z: BucketSize, const AB: BlockSize, S: StorageBackend>
    PathOram<V, Z, AB, S>
{
    /// Returns a new `PathOram` mapping addresses `0 <= address < block_capacity` to default `V` values,
    /// with a stash overflow size of `overflow_size` blocks, and a recursion cutoff of `recursion_cutoff`.
    /// (See [`PathOram`]) for a description of these parameters).
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` in the following cases.
    ///
    /// - `block_capacity` is 0, 1, or is not a power of two.
    /// - `AB` is 0, 1, or is not a power of two.
    /// - `Z` is 0 or 1.
    /// - `recursion_cutoff` is 0.
    ///
    /// Returns a `BackendError` if `backend` cannot hold the tree or the position map.
    pub fn new_with_parameters(
        block_capacity: Address,
        backend: &mut S,
        overflow_size: StashSize,
        recursion_cutoff: RecursionCutoff,
    ) -> Result<Self, ObliviousError> {
        log::info!("PathOram::new(capacity = {})", block_capacity);

        if recursion_cutoff == 0 {
            return Err(ObliviousError::InvalidConfigurationError(
                "the recursion cutoff must be positive",
            ));
        }

        // The tree holds `block_capacity` buckets, so there are `block_capacity / 2` leaves,
        // which the original Path ORAM paper's experiments found sufficient to keep the stash small.
        let tree = PathOramTree::new(block_capacity, overflow_size, backend)?;
        let position_map =
            match PositionMap::new(block_capacity, backend, overflow_size, recursion_cutoff) {
                Ok(position_map) => position_map,
                Err(e) => {
                    tree.release(backend)?;
                    return Err(e);
                }
            };

        Ok(Self {
            tree,
            position_map,
            block_capacity,
        })
    }

    /// Returns a new `PathOram` with the default stash overflow size and recursion cutoff.
    pub fn new(block_capacity: Address, backend: &mut S) -> Result<Self, ObliviousError> {
        Self::new_with_parameters(
            block_capacity,
            backend,
            DEFAULT_STASH_OVERFLOW_SIZE,
            DEFAULT_RECURSION_CUTOFF,
        )
    }

    /// Gives the tree and every level of the position map back to `backend`, which must be the
    /// backend they were allocated from.
    pub fn release(self, backend: &mut S) -> Result<(), ObliviousError> {
        self.tree.release(backend)?;
        self.position_map.release(backend)
    }

    pub(crate) fn recursion_height(&self) -> usize {
        self.position_map.recursion_height()
    }

    #[cfg(test)]
    pub(crate) fn stash_occupancy(&self) -> StashSize {
        self.tree.stash_occupancy()
    }
}

impl<V: OramBlock, const Z: BucketSize, const AB: BlockSize, S: StorageBackend> Oram
    for PathOram<V, Z, AB, S>
{
    type V = V;

    fn access<R: RngCore + CryptoRng, F: Fn(&V) -> V>(
        &mut self,
        address: Address,
        callback: F,
        rng: &mut R,
    ) -> Result<V, ObliviousError> {
        // This operation is not constant-time, but only leaks whether the ORAM index is well-formed or not.
        if !bool::from(address.ct_lt(&self.block_capacity)) {
            return Err(ObliviousError::AddressOutOfBoundsError {
                attempted: address,
                capacity: self.block_capacity,
            });
        }

        // Get the position of the target block (with address `address`),
        // and update that block's position map entry to a fresh random position.
        let new_position = self.tree.random_leaf(rng)?;
        let old_position = self.position_map.write(address, new_position, rng)?;

        // A block that was never written is on no path; read a random one instead.
        let unassigned_position = self.tree.random_leaf(rng)?;
        let position = TreeIndex::conditional_select(
            &old_position,
            &unassigned_position,
            old_position.ct_eq(&0),
        );

        self.tree
            .access_on_path(address, position, new_position, callback)
    }

    fn block_capacity(&self) -> Result<Address, ObliviousError> {
        Ok(self.block_capacity)
    }
}

/// An `Oram` suitable for most use cases, with reasonable default choices of parameters.
#[derive(Debug)]
pub struct DefaultOram<V: OramBlock, S: StorageBackend = MemoryBackend>(DefaultOramBackend<V, S>);

#[derive(Debug)]
enum DefaultOramBackend<V: OramBlock, S: StorageBackend> {
    Path(PathOram<V, DEFAULT_BLOCKS_PER_BUCKET, DEFAULT_POSITIONS_PER_BLOCK, S>),
    Linear(LinearTimeOram<V, S>),
}

impl<V: OramBlock, S: StorageBackend> Oram for DefaultOram<V, S> {
    type V = V;

    fn block_capacity(&self) -> Result<Address, ObliviousError> {
        match &self.0 {
            DefaultOramBackend::Path(p) => p.block_capacity(),
            DefaultOramBackend::Linear(l) => l.block_capacity(),
        }
    }

    fn access<R: RngCore + CryptoRng, F: Fn(&Self::V) -> Self::V>(
        &mut self,
        index: Address,
        callback: F,
        rng: &mut R,
    ) -> Result<Self::V, ObliviousError> {
        match &mut self.0 {
            DefaultOramBackend::Path(p) => p.access(index, callback, rng),
            DefaultOramBackend::Linear(l) => l.access(index, callback, rng),
        }
    }
}

impl<V: OramBlock, S: StorageBackend> DefaultOram<V, S> {
    /// Returns a new ORAM mapping addresses `0 <= address < block_capacity` to default `V` values.
    ///
    /// # Errors
    ///
    /// If `block_capacity` is large enough to need a Path ORAM but is not a power of two,
    /// returns an `InvalidConfigurationError`.
    pub fn new(block_capacity: Address, backend: &mut S) -> Result<Self, ObliviousError> {
        if block_capacity < LINEAR_TIME_ORAM_CUTOFF {
            Ok(Self(DefaultOramBackend::Linear(LinearTimeOram::new(
                block_capacity,
                backend,
            )?)))
        } else {
            Ok(Self(DefaultOramBackend::Path(PathOram::new(
                block_capacity,
                backend,
            )?)))
        }
    }

    /// Gives the storage of the ORAM back to `backend`.
    pub fn release(self, backend: &mut S) -> Result<(), ObliviousError> {
        match self.0 {
            DefaultOramBackend::Path(p) => p.release(backend),
            DefaultOramBackend::Linear(l) => l.release(backend),
        }
    }
}

// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM stash.

use crate::{
    bucket::{Bucket, PathOramBlock},
    database::Database,
    utils::{apply_network_by_keys, bitonic_network, CompleteBinaryTreeIndex, Comparator, TreeIndex},
    Address, BucketSize, ObliviousError, OramBlock, StashSize,
};

use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeGreater};

const OVERFLOW_ASSIGNMENT: TreeIndex = TreeIndex::MAX - 1;
const DUMMY_ASSIGNMENT: TreeIndex = TreeIndex::MAX;

#[derive(Debug)]
/// A fixed-size, obliviously accessed Path ORAM stash data structure implemented using oblivious sorting.
///
/// The stash is laid out as a path region of `path_size` blocks, which receives the buckets of
/// the path being accessed, followed by `overflow_size` blocks holding blocks that could not be
/// evicted, followed by one reserved block used to insert blocks that are not yet in the ORAM.
pub(crate) struct ObliviousStash<V: OramBlock> {
    blocks: Vec<PathOramBlock<V>>,
    path_size: StashSize,
    overflow_size: StashSize,
    eviction_network: Vec<Comparator>,
}

impl<V: OramBlock> ObliviousStash<V> {
    pub fn new(path_size: StashSize, overflow_size: StashSize) -> Result<Self, ObliviousError> {
        let num_stash_blocks: usize = (path_size + overflow_size + 1).try_into()?;

        Ok(Self {
            blocks: vec![PathOramBlock::<V>::dummy(); num_stash_blocks],
            path_size,
            overflow_size,
            eviction_network: bitonic_network(num_stash_blocks),
        })
    }

    fn reserved_block_index(&self) -> usize {
        self.blocks.len() - 1
    }

    pub fn read_from_path<const Z: BucketSize, T: Database<Bucket<V, Z>>>(
        &mut self,
        physical_memory: &mut T,
        position: TreeIndex,
    ) -> Result<(), ObliviousError> {
        let height = position.ct_depth();

        for depth in (0..=height).rev() {
            let bucket = physical_memory.read_db(position.ct_node_on_path(depth, height))?;
            let first_slot = Z * usize::try_from(depth)?;
            self.blocks[first_slot..first_slot + Z].copy_from_slice(&bucket.blocks);
        }

        Ok(())
    }

    /// Evicts as many blocks as possible into the path ending at `position`,
    /// and writes every bucket on that path.
    ///
    /// # Errors
    ///
    /// Returns a `StashOverflowError` if more than `overflow_size` blocks remain in the stash.
    /// The stash must then be discarded.
    pub fn write_to_path<const Z: BucketSize, T: Database<Bucket<V, Z>>>(
        &mut self,
        physical_memory: &mut T,
        position: TreeIndex,
    ) -> Result<(), ObliviousError> {
        let height = position.ct_depth();
        let mut level_assignments = vec![DUMMY_ASSIGNMENT; self.blocks.len()];
        let mut level_counts = vec![0u64; usize::try_from(height)? + 1];
        let bucket_size = u64::try_from(Z)?;
        let mut overflow_count = 0u64;

        // Assign all non-dummy blocks in the stash to either the path or the overflow.
        for (i, block) in self.blocks.iter().enumerate() {
            // If `block` is a dummy, the rest of this loop iteration will be a no-op, and the values don't matter.
            let block_is_dummy = block.ct_is_dummy();

            // Set up valid but meaningless input to the computation in case `block` is a dummy.
            let an_arbitrary_leaf: TreeIndex = 1 << height;
            let block_position =
                TreeIndex::conditional_select(&block.position, &an_arbitrary_leaf, block_is_dummy);
            let deepest_level = block_position
                .ct_common_ancestor_of_two_leaves(position)
                .ct_depth();

            // Scan the path from leaf to root, assigning the block to the deepest non-full bucket it may occupy.
            let mut assigned = Choice::from(0);
            for (level, count) in level_counts.iter_mut().enumerate().rev() {
                let level_u64 = u64::try_from(level)?;
                let level_bucket_full = count.ct_eq(&bucket_size);
                let level_on_block_path = !level_u64.ct_gt(&deepest_level);

                let should_assign =
                    level_on_block_path & !level_bucket_full & !block_is_dummy & !assigned;
                assigned |= should_assign;

                count.conditional_assign(&(*count + 1), should_assign);
                level_assignments[i].conditional_assign(&level_u64, should_assign);
            }

            let overflowed = !assigned & !block_is_dummy;
            level_assignments[i].conditional_assign(&OVERFLOW_ASSIGNMENT, overflowed);
            overflow_count.conditional_assign(&(overflow_count + 1), overflowed);
        }

        // This branch only reveals that the ORAM has failed.
        if overflow_count > self.overflow_size {
            log::warn!(
                "Stash overflow: {} blocks remain after eviction, capacity {}.",
                overflow_count,
                self.overflow_size
            );
            return Err(ObliviousError::StashOverflowError {
                capacity: self.overflow_size,
            });
        }

        // Assign dummy blocks to the remaining non-full buckets until all buckets are full.
        // The reserved block is skipped so that it is still a dummy after sorting.
        let reserved = self.reserved_block_index();
        for (i, block) in self.blocks.iter().enumerate().take(reserved) {
            let block_free = block.ct_is_dummy();

            let mut assigned: Choice = 0.into();
            for (level, count) in level_counts.iter_mut().enumerate() {
                let full = count.ct_eq(&bucket_size);
                let no_op = assigned | full | !block_free;

                level_assignments[i].conditional_assign(&(u64::try_from(level)?), !no_op);
                count.conditional_assign(&(*count + 1), !no_op);
                assigned |= !no_op;
            }
        }

        apply_network_by_keys(
            &mut self.blocks,
            &mut level_assignments,
            &self.eviction_network,
        );

        // Write the first Z * (height + 1) blocks into slots in the tree.
        for depth in 0..=height {
            let mut new_bucket: Bucket<V, Z> = Bucket::default();
            let first_slot = usize::try_from(depth)? * Z;
            new_bucket
                .blocks
                .copy_from_slice(&self.blocks[first_slot..first_slot + Z]);

            physical_memory.write_db(position.ct_node_on_path(depth, height), new_bucket)?;
        }

        Ok(())
    }

    /// Scans the stash for the block stored at `address`, moves it to `new_position` and
    /// replaces its value `v` with `callback(v)`. Returns `v`.
    ///
    /// If no such block exists, a block holding `callback(V::default())` is created in the reserved slot.
    pub fn access<F: Fn(&V) -> V>(
        &mut self,
        address: Address,
        new_position: TreeIndex,
        value_callback: F,
    ) -> V {
        let mut result: V = V::default();
        let mut found: Choice = 0.into();

        // Iterate over stash, updating the block with address `address` if one exists.
        for block in &mut self.blocks {
            let is_requested_index = block.ct_holds(address);
            found |= is_requested_index;

            // Read current value of target block into `result`.
            result.conditional_assign(&block.value, is_requested_index);
            // Write new position into target block.
            block
                .position
                .conditional_assign(&new_position, is_requested_index);
            // If a write, write new value into target block.
            let value_to_write = value_callback(&result);
            block
                .value
                .conditional_assign(&value_to_write, is_requested_index);
        }

        let inserted = PathOramBlock {
            value: value_callback(&result),
            address,
            position: new_position,
        };
        let reserved = self.reserved_block_index();
        self.blocks[reserved].conditional_assign(&inserted, !found);

        result
    }

    /// Removes the block stored at `address` from the stash, if present, returning its value.
    pub fn take(&mut self, address: Address) -> (V, Choice) {
        let mut result = V::default();
        let mut found: Choice = 0.into();
        let dummy = PathOramBlock::<V>::dummy();

        for block in &mut self.blocks {
            let is_requested_index = block.ct_holds(address);
            found |= is_requested_index;
            result.conditional_assign(&block.value, is_requested_index);
            block.conditional_assign(&dummy, is_requested_index);
        }

        (result, found)
    }

    /// Places `block` in the reserved slot if `real` is set.
    /// The block must not already be in the stash.
    pub fn insert(&mut self, block: PathOramBlock<V>, real: Choice) {
        let reserved = self.reserved_block_index();
        self.blocks[reserved].conditional_assign(&block, real);
    }

    #[cfg(test)]
    pub fn occupancy(&self) -> StashSize {
        let mut result = 0;
        for block in self.blocks.iter().skip(self.path_size as usize) {
            if !block.is_dummy() {
                result += 1;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SimpleDatabase;

    type TestBucket = Bucket<u64, 2>;

    fn real_blocks(bucket: &TestBucket) -> Vec<(Address, u64)> {
        bucket
            .blocks
            .iter()
            .filter(|block| !block.is_dummy())
            .map(|block| (block.address, block.value))
            .collect()
    }

    // A tree of height 2 has buckets 1..8 and leaves 4..8.
    fn empty_tree() -> SimpleDatabase<TestBucket> {
        Database::new(8).unwrap()
    }

    #[test]
    fn inserted_blocks_are_evicted_as_deep_as_possible() {
        let mut tree = empty_tree();
        let mut stash = ObliviousStash::<u64>::new(6, 2).unwrap();

        stash.read_from_path(&mut tree, 5).unwrap();
        assert_eq!(stash.access(9, 5, |_| 90), 0);
        stash.write_to_path(&mut tree, 5).unwrap();

        assert_eq!(stash.occupancy(), 0);
        assert_eq!(real_blocks(&tree.read_db(5).unwrap()), vec![(9, 90)]);
    }

    #[test]
    fn blocks_on_other_paths_meet_at_common_ancestor() {
        let mut tree = empty_tree();
        let mut stash = ObliviousStash::<u64>::new(6, 2).unwrap();

        // Block 1 lives on leaf 7, but is inserted while accessing leaf 4: only the root is shared.
        stash.read_from_path(&mut tree, 4).unwrap();
        stash.access(1, 7, |_| 10);
        stash.write_to_path(&mut tree, 4).unwrap();
        assert_eq!(tree.read_db(1).unwrap().occupancy(), 1);

        // Reading leaf 7 brings it back, and eviction pushes it down to the leaf.
        stash.read_from_path(&mut tree, 7).unwrap();
        assert_eq!(stash.access(1, 7, |v| v + 1), 10);
        stash.write_to_path(&mut tree, 7).unwrap();
        assert_eq!(tree.read_db(1).unwrap().occupancy(), 0);
        assert_eq!(real_blocks(&tree.read_db(7).unwrap()), vec![(1, 11)]);
    }

    #[test]
    fn take_and_insert() {
        let mut tree = empty_tree();
        let mut stash = ObliviousStash::<u64>::new(6, 2).unwrap();

        stash.read_from_path(&mut tree, 6).unwrap();
        stash.insert(
            PathOramBlock {
                value: 33,
                address: 3,
                position: 6,
            },
            Choice::from(1),
        );
        stash.insert(
            PathOramBlock {
                value: 44,
                address: 4,
                position: 6,
            },
            Choice::from(0),
        );
        stash.write_to_path(&mut tree, 6).unwrap();

        stash.read_from_path(&mut tree, 6).unwrap();
        let (value, found) = stash.take(3);
        assert!(bool::from(found));
        assert_eq!(value, 33);
        let (_, found) = stash.take(4);
        assert!(!bool::from(found));
        stash.write_to_path(&mut tree, 6).unwrap();
        assert_eq!(tree.read_db(6).unwrap().occupancy(), 0);
    }

    #[test]
    fn overflow_is_an_error() {
        let mut tree = empty_tree();
        let mut stash = ObliviousStash::<u64>::new(6, 0).unwrap();

        // Six blocks mapped to leaf 4 fill the leaf, its parent and the root.
        for (address, position) in [(1, 4), (2, 4), (3, 4), (4, 4), (5, 4), (6, 4)] {
            stash.read_from_path(&mut tree, 4).unwrap();
            stash.access(address, position, |_| address);
            stash.write_to_path(&mut tree, 4).unwrap();
        }
        // Every bucket on the path to leaf 4 is full, so a seventh block cannot be evicted.
        stash.read_from_path(&mut tree, 4).unwrap();
        stash.access(7, 4, |_| 7);
        assert!(matches!(
            stash.write_to_path(&mut tree, 4),
            Err(ObliviousError::StashOverflowError { capacity: 0 })
        ));
    }
}

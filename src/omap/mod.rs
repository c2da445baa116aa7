// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious map from `u64` keys to values, stored as an AVL tree in a Path ORAM tree.

mod avl;
mod node;

use crate::{
    backend::{MemoryBackend, StorageBackend},
    database::Database,
    path_oram::{PathOramTree, DEFAULT_BLOCKS_PER_BUCKET, DEFAULT_STASH_OVERFLOW_SIZE},
    sort::{oblivious_sort, SortConfig},
    Address, ObliviousError, OramBlock,
};
use avl::{relink_path, Slot};
use node::{ChildRef, MapEntry, Node};
use rand::{CryptoRng, RngCore};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeLess};

/// Returns the largest possible height of an AVL tree with `capacity` nodes, plus one.
fn walk_length(capacity: u64) -> usize {
    let bound = 1.4405 * (capacity as f64 + 2.0).log2() - 0.3277;
    bound.floor() as usize + 1
}

// The number of buckets of the tree backing a map of `capacity` keys.
fn number_of_buckets(capacity: u64) -> Result<Address, ObliviousError> {
    if capacity == 0 {
        return Err(ObliviousError::InvalidConfigurationError(
            "an oblivious map needs a positive capacity",
        ));
    }
    capacity
        .checked_add(1)
        .and_then(u64::checked_next_power_of_two)
        .map(|buckets| buckets.max(2))
        .ok_or(ObliviousError::InvalidConfigurationError(
            "oblivious map capacity too large",
        ))
}

/// An oblivious map with `u64` keys.
///
/// Every operation makes the same sequence of Path ORAM tree accesses, whatever the key and
/// whatever the contents of the map: `H` accesses that each remove one node of the search path,
/// followed by `H + 1` accesses that write the path back to fresh random leaves. `H` depends
/// only on the capacity. Child pointers carry the leaf of the child, so no position map is needed.
///
/// Erased keys leave a tombstone that keeps occupying one of the `capacity` node slots.
/// An error other than `MapCapacityError` leaves the map unusable.
#[derive(Debug)]
pub struct ObliviousMap<V: OramBlock, S: StorageBackend = MemoryBackend> {
    tree: PathOramTree<Node<V>, DEFAULT_BLOCKS_PER_BUCKET, S>,
    root: ChildRef,
    capacity: u64,
    walk_length: usize,
    /// Nodes written so far, tombstones included. Node addresses are `1..=node_count`.
    node_count: u64,
    len: u64,
}

// What an operation does to the node holding its key, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Update {
    Read,
    Write,
    Erase,
}

impl<V: OramBlock, S: StorageBackend> ObliviousMap<V, S> {
    /// Returns an empty map able to hold `capacity` keys, allocating its storage from `backend`.
    ///
    /// # Errors
    ///
    /// `InvalidConfigurationError` if `capacity` is 0 or too large for a tree to be sized, and
    /// `BackendError` if `backend` is too small.
    pub fn new(capacity: u64, backend: &mut S) -> Result<Self, ObliviousError> {
        let number_of_buckets = number_of_buckets(capacity)?;
        let walk_length = walk_length(capacity);
        log::info!(
            "ObliviousMap::new(capacity = {}, buckets = {}, walk length = {})",
            capacity,
            number_of_buckets,
            walk_length
        );

        Ok(Self {
            tree: PathOramTree::new(number_of_buckets, DEFAULT_STASH_OVERFLOW_SIZE, backend)?,
            root: ChildRef::default(),
            capacity,
            walk_length,
            node_count: 0,
            len: 0,
        })
    }

    /// Builds a map holding `entries`, sorting them obliviously with `config` and scratch space
    /// from `backend`. Each node is written with a single tree access.
    ///
    /// The map's tree is only allocated once the entries are known to be valid. On any error,
    /// everything allocated from `backend` has been given back.
    ///
    /// # Errors
    ///
    /// `MapCapacityError` if there are more than `capacity` entries, `DuplicateKeyError` if two
    /// entries share a key, and any error of the sort.
    pub fn from_entries<R: RngCore + CryptoRng>(
        capacity: u64,
        entries: &[(u64, V)],
        backend: &mut S,
        config: &SortConfig,
        rng: &mut R,
    ) -> Result<Self, ObliviousError>
    where
        V: Send,
    {
        let count = u64::try_from(entries.len())?;
        number_of_buckets(capacity)?;
        if count > capacity {
            return Err(ObliviousError::MapCapacityError { capacity });
        }

        let mut scratch = backend.allocate::<MapEntry<V>>(count)?;
        let sorted = sort_entries(&mut scratch, entries, backend, config, rng);
        backend.release(scratch)?;
        let sorted = sorted?;

        let mut duplicate = Choice::from(0);
        for pair in sorted.windows(2) {
            duplicate |= pair[0].key.ct_eq(&pair[1].key);
        }
        if bool::from(duplicate) {
            return Err(ObliviousError::DuplicateKeyError);
        }

        let mut map = Self::new(capacity, backend)?;
        match map.build_subtree(&sorted, 0, rng) {
            Ok(root) => map.root = root,
            Err(e) => {
                map.release(backend)?;
                return Err(e);
            }
        }
        map.node_count = count;
        map.len = count;
        Ok(map)
    }

    /// Gives the storage of the map back to `backend`, which must be the backend it was
    /// allocated from.
    pub fn release(self, backend: &mut S) -> Result<(), ObliviousError> {
        log::debug!("ObliviousMap::release(capacity = {})", self.capacity);
        self.tree.release(backend)
    }

    // Writes the balanced subtree over `entries`, whose first entry has index `offset`, and
    // returns a pointer to its root. The root is the midpoint; the node at index `i` gets address
    // `i + 1`.
    fn build_subtree<R: RngCore + CryptoRng>(
        &mut self,
        entries: &[MapEntry<V>],
        offset: u64,
        rng: &mut R,
    ) -> Result<ChildRef, ObliviousError> {
        if entries.is_empty() {
            return Ok(ChildRef::default());
        }
        let middle = entries.len() / 2;
        let middle_offset = offset + u64::try_from(middle)?;
        let left = self.build_subtree(&entries[..middle], offset, rng)?;
        let right = self.build_subtree(&entries[middle + 1..], middle_offset + 1, rng)?;

        let mut node = Node::leaf(entries[middle].key, entries[middle].value);
        node.left = left;
        node.right = right;
        let address = middle_offset + 1;
        let position = self.tree.random_leaf(rng)?;
        self.tree.insert_on_path(address, position, node, Choice::from(1))?;
        Ok(ChildRef {
            address,
            position,
            height: node.height(),
        })
    }

    /// Obliviously looks up `key`.
    pub fn get<R: RngCore + CryptoRng>(
        &mut self,
        key: u64,
        rng: &mut R,
    ) -> Result<Option<V>, ObliviousError> {
        self.operate(key, V::default(), Update::Read, rng)
    }

    /// Obliviously maps `key` to `value`, returning the previous value.
    ///
    /// # Errors
    ///
    /// `MapCapacityError` if `key` is new and `capacity` keys have already been inserted
    /// (erased keys included). The map is left unchanged in that case.
    pub fn insert<R: RngCore + CryptoRng>(
        &mut self,
        key: u64,
        value: V,
        rng: &mut R,
    ) -> Result<Option<V>, ObliviousError> {
        self.operate(key, value, Update::Write, rng)
    }

    /// Obliviously removes `key`, returning its value.
    pub fn erase<R: RngCore + CryptoRng>(
        &mut self,
        key: u64,
        rng: &mut R,
    ) -> Result<Option<V>, ObliviousError> {
        self.operate(key, V::default(), Update::Erase, rng)
    }

    /// The number of keys in the map.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the map holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of keys the map was built to hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    // The tree accesses depend only on `walk_length`; `update` selects which constant-time
    // edits are applied to the cached path.
    fn operate<R: RngCore + CryptoRng>(
        &mut self,
        key: u64,
        value: V,
        update: Update,
        rng: &mut R,
    ) -> Result<Option<V>, ObliviousError> {
        let mut slots = vec![Slot::<V>::empty(); self.walk_length + 1];
        for slot in slots.iter_mut() {
            slot.position = self.tree.random_leaf(rng)?;
        }

        // Walk down the search path, removing each node from the tree.
        let mut next = self.root;
        let mut searching = Choice::from(1);
        let mut found = Choice::from(0);
        let mut found_at = vec![Choice::from(0); slots.len()];
        for (slot, hit_here) in slots
            .iter_mut()
            .zip(found_at.iter_mut())
            .take(self.walk_length)
        {
            let real = searching & !next.ct_is_null();
            let dummy_position = self.tree.random_leaf(rng)?;
            let address = Address::conditional_select(&0, &next.address, real);
            let position = u64::conditional_select(&dummy_position, &next.position, real);
            let (node, present) = self.tree.remove_on_path(address, position)?;
            debug_assert_eq!(bool::from(present), bool::from(real));

            slot.node = node;
            slot.address = address;
            slot.real = real;

            *hit_here = real & node.key.ct_eq(&key);
            found |= *hit_here;
            let go_left = key.ct_lt(&node.key);
            next = ChildRef::conditional_select(&node.right, &node.left, go_left);
            searching = real & !*hit_here;
        }

        // Read the matching node and apply the update to it.
        let mut previous = V::default();
        let mut was_live = Choice::from(0);
        let write = Choice::from(u8::from(update == Update::Write));
        let erase = Choice::from(u8::from(update == Update::Erase));
        for (slot, hit) in slots.iter_mut().zip(found_at.iter()) {
            previous.conditional_assign(&slot.node.value, *hit);
            was_live.conditional_assign(&!slot.node.ct_is_deleted(), *hit);
            slot.node.value.conditional_assign(&value, *hit & write);
            slot.node.deleted.conditional_assign(&0, *hit & write);
            slot.node.deleted.conditional_assign(&1, *hit & erase);
        }

        // A new key goes in the first slot past the end of the search path.
        let full = self.node_count.ct_eq(&self.capacity);
        let attach = write & !found & !full;
        let new_address = self.node_count + 1;
        let mut depth = 0u64;
        for slot in &slots {
            depth += u64::from(slot.real.unwrap_u8());
        }
        for (index, slot) in (0u64..).zip(slots.iter_mut()) {
            let here = attach & index.ct_eq(&depth);
            slot.node.conditional_assign(&Node::leaf(key, value), here);
            slot.address.conditional_assign(&new_address, here);
            slot.real |= here;
        }

        let new_root = relink_path(&mut slots, attach);
        self.root.conditional_assign(&new_root, slots[0].real);

        for slot in &slots {
            self.tree
                .insert_on_path(slot.address, slot.position, slot.node, slot.real)?;
        }

        // Only the outcome of the operation is revealed from here on.
        let attached = bool::from(attach);
        let was_live = bool::from(was_live);
        if attached {
            self.node_count += 1;
        }
        match update {
            Update::Write if attached || (bool::from(found) && !was_live) => self.len += 1,
            Update::Erase if was_live => self.len -= 1,
            _ => {}
        }
        if update == Update::Write && !bool::from(found) && bool::from(full) {
            log::warn!("ObliviousMap full: {} keys", self.capacity);
            return Err(ObliviousError::MapCapacityError {
                capacity: self.capacity,
            });
        }
        Ok(was_live.then_some(previous))
    }

    #[cfg(test)]
    fn height(&self) -> u64 {
        self.root.height
    }
}

fn sort_entries<V, D, S, R>(
    scratch: &mut D,
    entries: &[(u64, V)],
    backend: &mut S,
    config: &SortConfig,
    rng: &mut R,
) -> Result<Vec<MapEntry<V>>, ObliviousError>
where
    V: OramBlock + Send,
    D: Database<MapEntry<V>>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    let mut sorted: Vec<MapEntry<V>> = entries
        .iter()
        .map(|&(key, value)| MapEntry { key, value })
        .collect();
    scratch.write_range(0, &sorted)?;
    oblivious_sort(scratch, backend, config, rng)?;
    scratch.read_range(0, &mut sorted)?;
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::TracingBackend,
        sort::SortAlgorithm,
        test_utils::{init_logger, test_rng},
    };
    use rand::{seq::SliceRandom, Rng};

    #[test]
    fn walk_lengths() {
        assert_eq!(walk_length(1), 2);
        assert_eq!(walk_length(7), 5);
        assert_eq!(walk_length(1000), 15);
    }

    #[test]
    fn insert_then_get_in_order() {
        init_logger();
        let mut rng = test_rng();
        let mut map = ObliviousMap::<u64>::new(1000, &mut MemoryBackend::default()).unwrap();
        for key in 0..1000 {
            assert_eq!(map.insert(key, key * 10, &mut rng).unwrap(), None);
        }
        assert_eq!(map.len(), 1000);
        // An AVL tree of 1000 nodes is at most 14 levels deep.
        assert!(map.height() <= 14, "{}", map.height());
        for key in 0..1000 {
            assert_eq!(map.get(key, &mut rng).unwrap(), Some(key * 10));
        }
        for key in 1000..1010 {
            assert_eq!(map.get(key, &mut rng).unwrap(), None);
        }
    }

    #[test]
    fn random_operations_match_a_btree_map() {
        let mut rng = test_rng();
        let mut map = ObliviousMap::<u64>::new(300, &mut MemoryBackend::default()).unwrap();
        let mut expected = std::collections::BTreeMap::new();
        let mut keys: Vec<u64> = (0..300).map(|k| k * 7 + 3).collect();
        keys.shuffle(&mut rng);

        for &key in &keys {
            assert_eq!(map.insert(key, key, &mut rng).unwrap(), None);
            expected.insert(key, key);
        }
        for _ in 0..600 {
            let key = keys[rng.gen_range(0..keys.len())];
            match rng.gen_range(0..3) {
                0 => {
                    let value = rng.gen::<u64>();
                    assert_eq!(
                        map.insert(key, value, &mut rng).unwrap(),
                        expected.insert(key, value)
                    );
                }
                1 => assert_eq!(map.erase(key, &mut rng).unwrap(), expected.remove(&key)),
                _ => assert_eq!(map.get(key, &mut rng).unwrap(), expected.get(&key).copied()),
            }
            assert_eq!(map.len(), expected.len() as u64);
        }
        for &key in &keys {
            assert_eq!(map.get(key, &mut rng).unwrap(), expected.get(&key).copied());
        }
    }

    #[test]
    fn erased_keys_are_not_found() {
        let mut rng = test_rng();
        let mut map = ObliviousMap::<u64>::new(16, &mut MemoryBackend::default()).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.erase(4, &mut rng).unwrap(), None);
        assert_eq!(map.get(4, &mut rng).unwrap(), None);

        map.insert(4, 40, &mut rng).unwrap();
        map.insert(5, 50, &mut rng).unwrap();
        assert_eq!(map.insert(4, 41, &mut rng).unwrap(), Some(40));
        assert_eq!(map.erase(4, &mut rng).unwrap(), Some(41));
        assert_eq!(map.get(4, &mut rng).unwrap(), None);
        assert_eq!(map.erase(4, &mut rng).unwrap(), None);
        assert_eq!(map.len(), 1);

        assert_eq!(map.insert(4, 42, &mut rng).unwrap(), None);
        assert_eq!(map.get(4, &mut rng).unwrap(), Some(42));
        assert_eq!(map.get(5, &mut rng).unwrap(), Some(50));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn full_map_rejects_new_keys() {
        let mut rng = test_rng();
        let mut map = ObliviousMap::<u64>::new(4, &mut MemoryBackend::default()).unwrap();
        for key in 0..4 {
            map.insert(key, key, &mut rng).unwrap();
        }
        map.erase(0, &mut rng).unwrap();
        assert!(matches!(
            map.insert(9, 9, &mut rng),
            Err(ObliviousError::MapCapacityError { capacity: 4 })
        ));
        // Existing keys, erased ones included, can still be written.
        assert_eq!(map.insert(0, 5, &mut rng).unwrap(), None);
        assert_eq!(map.insert(3, 6, &mut rng).unwrap(), Some(3));
        for (key, value) in [(0, 5), (1, 1), (2, 2), (3, 6)] {
            assert_eq!(map.get(key, &mut rng).unwrap(), Some(value));
        }
        assert_eq!(map.get(9, &mut rng).unwrap(), None);
        assert!(ObliviousMap::<u64>::new(0, &mut MemoryBackend::default()).is_err());
    }

    #[test]
    fn bulk_construction() {
        let mut rng = test_rng();
        let mut entries: Vec<(u64, u64)> = (0..500).map(|k| (k * 3, k)).collect();
        entries.shuffle(&mut rng);
        let config = SortConfig::default().with_algorithm(SortAlgorithm::Bitonic);
        let mut backend = MemoryBackend::default();
        let mut map =
            ObliviousMap::from_entries(600, &entries, &mut backend, &config, &mut rng).unwrap();
        assert_eq!(map.len(), 500);
        assert!(map.height() <= 9);
        for (key, value) in &entries {
            assert_eq!(map.get(*key, &mut rng).unwrap(), Some(*value));
        }
        assert_eq!(map.get(1, &mut rng).unwrap(), None);

        // The map keeps working after bulk construction.
        for key in 0..100 {
            map.insert(3 * key + 1, key, &mut rng).unwrap();
        }
        assert_eq!(map.len(), 600);
        assert_eq!(map.get(298, &mut rng).unwrap(), Some(99));
        assert_eq!(map.get(300, &mut rng).unwrap(), Some(100));

        map.release(&mut backend).unwrap();
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn bulk_construction_errors() {
        let mut rng = test_rng();
        let config = SortConfig::default().with_bucket_capacity(16);
        let mut backend = MemoryBackend::default();
        let duplicated = [(1, 1u64), (2, 2), (1, 3)];
        let result = ObliviousMap::from_entries(8, &duplicated, &mut backend, &config, &mut rng);
        assert!(matches!(result, Err(ObliviousError::DuplicateKeyError)));
        assert_eq!(backend.allocated_bytes(), 0);

        let too_many = [(1, 1u64), (2, 2), (3, 3)];
        let result = ObliviousMap::from_entries(2, &too_many, &mut backend, &config, &mut rng);
        assert!(matches!(
            result,
            Err(ObliviousError::MapCapacityError { capacity: 2 })
        ));
        assert_eq!(backend.allocated_bytes(), 0);

        // A bounded backend can hold one map of capacity 8 at a time.
        let mut backend = MemoryBackend::default();
        ObliviousMap::<u64>::new(8, &mut backend)
            .unwrap()
            .release(&mut backend)
            .unwrap();
        assert_eq!(backend.allocated_bytes(), 0);
        let mut backend = MemoryBackend::new(6000);
        for _ in 0..3 {
            let result =
                ObliviousMap::from_entries(8, &duplicated, &mut backend, &config, &mut rng);
            assert!(matches!(result, Err(ObliviousError::DuplicateKeyError)));
            let map = ObliviousMap::<u64>::new(8, &mut backend).unwrap();
            map.release(&mut backend).unwrap();
        }
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn oversized_capacities_are_rejected() {
        let mut rng = test_rng();
        let mut backend = MemoryBackend::default();
        for capacity in [u64::MAX, u64::MAX - 1, (1 << 63) + 1] {
            assert!(matches!(
                ObliviousMap::<u64>::new(capacity, &mut backend),
                Err(ObliviousError::InvalidConfigurationError(_))
            ));
            let result = ObliviousMap::<u64>::from_entries(
                capacity,
                &[(1, 1)],
                &mut backend,
                &SortConfig::default(),
                &mut rng,
            );
            assert!(matches!(
                result,
                Err(ObliviousError::InvalidConfigurationError(_))
            ));
        }
        assert_eq!(walk_length(u64::MAX), 92);
        assert_eq!(backend.allocated_bytes(), 0);
    }

    // Every operation costs the same number of path reads and writes, hit or miss.
    #[test]
    fn access_counts_do_not_depend_on_operations() {
        let mut rng = test_rng();
        let mut backend = TracingBackend::new();
        let mut map = ObliviousMap::<u64, TracingBackend>::new(64, &mut backend).unwrap();
        let walk = map.walk_length;
        let path_length = 7; // 128 buckets
        let expected = (2 * walk + 1) * 2 * path_length;

        let mut counts = Vec::new();
        for key in [5, 9, 5, 1, 200] {
            backend.clear_trace();
            map.insert(key, key, &mut rng).unwrap();
            counts.push(backend.trace_len());
            backend.clear_trace();
            map.get(key + 1, &mut rng).unwrap();
            counts.push(backend.trace_len());
            backend.clear_trace();
            map.erase(key, &mut rng).unwrap();
            counts.push(backend.trace_len());
        }
        assert!(counts.iter().all(|count| *count == expected), "{counts:?}");
    }
}

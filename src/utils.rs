// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Utilities: complete binary tree indexing and data-independent comparator networks.

use crate::counters;
use rand::{CryptoRng, Rng, RngCore};

use subtle::{Choice, ConditionallySelectable, ConstantTimeLess};

use std::num::TryFromIntError;

pub(crate) type TreeIndex = u64;
pub(crate) type TreeHeight = u64;

pub(crate) trait CompleteBinaryTreeIndex
where
    Self: Sized,
{
    fn ct_node_on_path(&self, depth: TreeHeight, height: TreeHeight) -> Self;
    fn ct_common_ancestor_of_two_leaves(&self, other: Self) -> Self;
    fn random_leaf<R: RngCore + CryptoRng>(
        tree_height: TreeHeight,
        rng: &mut R,
    ) -> Result<Self, TryFromIntError>;
    fn ct_depth(&self) -> TreeHeight;
    fn is_leaf(&self, height: TreeHeight) -> bool;
}

impl CompleteBinaryTreeIndex for TreeIndex {
    // A TreeIndex can have any nonzero value.
    fn ct_node_on_path(&self, depth: TreeHeight, height: TreeHeight) -> Self {
        // We maintain the invariant that all TreeIndex values are nonzero.
        debug_assert_ne!(*self, 0);
        // We only call this method when the receiver is a leaf.
        debug_assert!(self.is_leaf(height));

        let shift = height - depth;
        self >> shift
    }

    // Both receiver and argument must be leaves of the same tree.
    fn ct_common_ancestor_of_two_leaves(&self, other: Self) -> Self {
        let differing_bits = 64 - u64::from((self ^ other).leading_zeros());
        self >> differing_bits
    }

    fn random_leaf<R: RngCore + CryptoRng>(
        tree_height: TreeHeight,
        rng: &mut R,
    ) -> Result<Self, TryFromIntError> {
        let tree_height: u32 = tree_height.try_into()?;
        let result = 2u64.pow(tree_height) + rng.gen_range(0..2u64.pow(tree_height));
        // The value we've just generated is at least the first summand, which is at least 1.
        debug_assert_ne!(result, 0);
        Ok(result)
    }

    fn ct_depth(&self) -> TreeHeight {
        // We maintain the invariant that all TreeIndex values are nonzero.
        debug_assert_ne!(*self, 0);

        let leading_zeroes: u64 = self.leading_zeros().into();
        let index_bitlength = 64;
        index_bitlength - leading_zeroes - 1
    }

    fn is_leaf(&self, height: TreeHeight) -> bool {
        // We maintain the invariant that all TreeIndex values are nonzero.
        debug_assert_ne!(*self, 0);

        self.ct_depth() == height
    }
}

/// `a >= b`, in constant time.
pub(crate) fn ct_ge(a: u64, b: u64) -> Choice {
    !a.ct_lt(&b)
}

/// Converts a `Choice` to 0 or 1.
pub(crate) fn ct_to_u64(choice: Choice) -> u64 {
    u64::conditional_select(&0, &1, choice)
}

/// Obliviously swaps `items[low]` and `items[high]` if `choice` is set. Requires `low < high`.
pub(crate) fn conditional_swap_at<T: ConditionallySelectable>(
    items: &mut [T],
    low: usize,
    high: usize,
    choice: Choice,
) {
    let (head, tail) = items.split_at_mut(high);
    T::conditional_swap(&mut head[low], &mut tail[0], choice);
}

/// One compare-exchange of a sorting network.
///
/// After the comparator runs, `items[low] <= items[high]` if `ascending`, and
/// `items[low] >= items[high]` otherwise. Always `low < high`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Comparator {
    pub low: usize,
    pub high: usize,
    pub ascending: bool,
}

impl Comparator {
    pub(crate) fn ascending(low: usize, high: usize) -> Self {
        Self {
            low,
            high,
            ascending: true,
        }
    }

    /// Whether this comparator swaps, given the strict order `lt` on the two items.
    pub(crate) fn ct_should_swap<T, F: Fn(&T, &T) -> Choice>(
        &self,
        low: &T,
        high: &T,
        lt: &F,
    ) -> Choice {
        if self.ascending {
            lt(high, low)
        } else {
            lt(low, high)
        }
    }
}

/// Visits the comparators of a bitonic sorting network on `n` items, for any `n`.
/// The network is due to Hans Werner Lang and described
/// [here](https://hwlang.de/algorithmen/sortieren/bitonic/oddn.htm).
pub(crate) fn for_each_bitonic_comparator<E, F: FnMut(Comparator) -> Result<(), E>>(
    n: usize,
    visit: &mut F,
) -> Result<(), E> {
    helper_bitonic_sort(0, n, true, visit)
}

fn helper_bitonic_sort<E, F: FnMut(Comparator) -> Result<(), E>>(
    lo: usize,
    n: usize,
    ascending: bool,
    visit: &mut F,
) -> Result<(), E> {
    if n > 1 {
        let m = n / 2;
        helper_bitonic_sort(lo, m, !ascending, visit)?;
        helper_bitonic_sort(lo + m, n - m, ascending, visit)?;
        helper_bitonic_merge(lo, n, ascending, visit)?;
    }
    Ok(())
}

fn helper_bitonic_merge<E, F: FnMut(Comparator) -> Result<(), E>>(
    lo: usize,
    n: usize,
    ascending: bool,
    visit: &mut F,
) -> Result<(), E> {
    if n > 1 {
        let m = n.next_power_of_two() >> 1;
        for i in lo..(lo + n - m) {
            visit(Comparator {
                low: i,
                high: i + m,
                ascending,
            })?;
        }
        helper_bitonic_merge(lo, m, ascending, visit)?;
        helper_bitonic_merge(lo + m, n - m, ascending, visit)?;
    }
    Ok(())
}

/// Returns the comparators of a bitonic sorting network on `n` items.
pub(crate) fn bitonic_network(n: usize) -> Vec<Comparator> {
    let mut network = Vec::new();
    let _ = for_each_bitonic_comparator(n, &mut |c| -> Result<(), ()> {
        network.push(c);
        Ok(())
    });
    network
}

/// Returns the last stage of the bitonic network on `n` items: it sorts any input whose first
/// `n / 2` items descend and whose remaining items ascend, with `O(n log n)` comparators.
pub(crate) fn bitonic_merge_network(n: usize) -> Vec<Comparator> {
    let mut network = Vec::new();
    let _ = helper_bitonic_merge(0, n, true, &mut |c| -> Result<(), ()> {
        network.push(c);
        Ok(())
    });
    network
}

/// Returns Batcher's merge-exchange sorting network on `n` items (Knuth, TAOCP vol. 3,
/// algorithm 5.2.2M), grouped into rounds. Comparators within a round touch disjoint items.
pub(crate) fn merge_exchange_rounds(n: usize) -> Vec<Vec<Comparator>> {
    let mut rounds = Vec::new();
    if n < 2 {
        return rounds;
    }
    let t = usize::BITS - (n - 1).leading_zeros();
    let mut p = 1usize << (t - 1);
    while p > 0 {
        let mut q = 1usize << (t - 1);
        let mut r = 0;
        let mut d = p;
        loop {
            let round: Vec<Comparator> = (0..(n - d))
                .filter(|i| i & p == r)
                .map(|i| Comparator::ascending(i, i + d))
                .collect();
            if !round.is_empty() {
                rounds.push(round);
            }
            if q == p {
                break;
            }
            d = q - p;
            q >>= 1;
            r = p;
        }
        p >>= 1;
    }
    rounds
}

/// Returns Batcher's merge-exchange sorting network on `n` items as a flat comparator list.
pub(crate) fn merge_exchange_network(n: usize) -> Vec<Comparator> {
    merge_exchange_rounds(n).into_iter().flatten().collect()
}

/// Obliviously applies `network` to `items` under the strict order `lt`.
pub(crate) fn apply_network_by<T: ConditionallySelectable, F: Fn(&T, &T) -> Choice>(
    items: &mut [T],
    network: &[Comparator],
    lt: F,
) {
    for comparator in network {
        let (head, tail) = items.split_at_mut(comparator.high);
        let low = &mut head[comparator.low];
        let high = &mut tail[0];
        let swap = comparator.ct_should_swap(&*low, &*high, &lt);
        T::conditional_swap(low, high, swap);
    }
    counters::record_swaps(network.len() as u64);
}

/// Obliviously applies `network` to `items`, ordering by `keys` and permuting `keys` alongside.
/// Assumes that `keys.len() == items.len()`.
pub(crate) fn apply_network_by_keys<
    T: ConditionallySelectable,
    K: ConditionallySelectable + ConstantTimeLess,
>(
    items: &mut [T],
    keys: &mut [K],
    network: &[Comparator],
) {
    debug_assert_eq!(items.len(), keys.len());
    let lt = |a: &K, b: &K| a.ct_lt(b);
    for comparator in network {
        let swap = comparator.ct_should_swap(&keys[comparator.low], &keys[comparator.high], &lt);
        conditional_swap_at(items, comparator.low, comparator.high, swap);
        conditional_swap_at(keys, comparator.low, comparator.high, swap);
    }
    counters::record_swaps(network.len() as u64);
}

/// Sorts `items` in ascending order of `keys`, obliviously and in constant time.
/// Assumes that `keys.len() == items.len()`.
pub(crate) fn bitonic_sort_by_keys<
    T: ConditionallySelectable,
    K: ConditionallySelectable + ConstantTimeLess,
>(
    items: &mut [T],
    keys: &mut [K],
) {
    apply_network_by_keys(items, keys, &bitonic_network(items.len()));
}

/// Sorts `items` in ascending order under `lt`, obliviously and in constant time.
pub(crate) fn bitonic_sort_by<T: ConditionallySelectable, F: Fn(&T, &T) -> Choice>(
    items: &mut [T],
    lt: F,
) {
    apply_network_by(items, &bitonic_network(items.len()), lt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
    use static_assertions::const_assert_eq;
    use std::mem::size_of;

    #[test]
    fn check_size_of_tree_index() {
        const_assert_eq!(size_of::<TreeIndex>(), 8);
    }

    #[test]
    fn common_ancestor_of_leaves() {
        // Leaves of a tree of height 3 are 8..16.
        assert_eq!(8u64.ct_common_ancestor_of_two_leaves(8), 8);
        assert_eq!(8u64.ct_common_ancestor_of_two_leaves(9), 4);
        assert_eq!(8u64.ct_common_ancestor_of_two_leaves(11), 2);
        assert_eq!(8u64.ct_common_ancestor_of_two_leaves(15), 1);
        assert_eq!(13u64.ct_common_ancestor_of_two_leaves(12), 6);
        assert_eq!(13u64.ct_node_on_path(1, 3), 3);
        assert_eq!(13u64.ct_node_on_path(3, 3), 13);
    }

    #[test]
    fn random_leaves_are_leaves() {
        let mut rng = StdRng::seed_from_u64(0);
        for height in 0..10 {
            for _ in 0..32 {
                let leaf = TreeIndex::random_leaf(height, &mut rng).unwrap();
                assert!(leaf.is_leaf(height));
            }
        }
    }

    fn check_network_sorts_all_zero_one_inputs(n: usize, network: &[Comparator]) {
        for pattern in 0u32..(1 << n) {
            let mut items: Vec<u64> = (0..n).map(|i| u64::from((pattern >> i) & 1)).collect();
            apply_network_by(&mut items, network, |a, b| a.ct_lt(b));
            assert!(items.windows(2).all(|w| w[0] <= w[1]), "n = {n}, {pattern:b}");
        }
    }

    #[test]
    fn networks_sort_zero_one_inputs() {
        for n in 0..=11 {
            check_network_sorts_all_zero_one_inputs(n, &bitonic_network(n));
            check_network_sorts_all_zero_one_inputs(n, &merge_exchange_network(n));
        }
    }

    #[test]
    fn bitonic_merge_sorts_two_sorted_runs() {
        for n in 0..=12 {
            let network = bitonic_merge_network(n);
            for pattern in 0u32..(1 << n) {
                let mut items: Vec<u64> = (0..n).map(|i| u64::from((pattern >> i) & 1)).collect();
                items[..n / 2].sort_unstable_by(|a, b| b.cmp(a));
                items[n / 2..].sort_unstable();
                apply_network_by(&mut items, &network, |a, b| a.ct_lt(b));
                assert!(items.windows(2).all(|w| w[0] <= w[1]), "n = {n}, {pattern:b}");
            }
        }

        let mut rng = StdRng::seed_from_u64(2);
        for n in [64usize, 100, 129] {
            let mut items: Vec<u64> = (0..n).map(|_| rng.gen_range(0..50)).collect();
            let mut expected = items.clone();
            expected.sort_unstable();
            items[..n / 2].sort_unstable_by(|a, b| b.cmp(a));
            items[n / 2..].sort_unstable();
            apply_network_by(&mut items, &bitonic_merge_network(n), |a, b| a.ct_lt(b));
            assert_eq!(items, expected);
            assert!(bitonic_merge_network(n).len() * 2 < bitonic_network(n).len());
        }
    }

    #[test]
    fn merge_exchange_rounds_are_disjoint() {
        for n in [2, 3, 7, 16, 33, 100] {
            for round in merge_exchange_rounds(n) {
                let mut touched = vec![false; n];
                for c in round {
                    assert!(c.low < c.high && c.high < n);
                    assert!(!touched[c.low] && !touched[c.high]);
                    touched[c.low] = true;
                    touched[c.high] = true;
                }
            }
        }
    }

    #[test]
    fn test_bitonic_sort() {
        let mut rng = StdRng::seed_from_u64(0);
        for n in [1usize, 2, 5, 100, 128, 300] {
            let mut keys: Vec<u64> = (0..n as u64).collect();
            keys.shuffle(&mut rng);
            let mut items: Vec<u64> = keys.iter().map(|k| k + 2 * n as u64).collect();

            bitonic_sort_by_keys(&mut items, &mut keys);
            for i in 0..n {
                assert_eq!(keys[i], i as u64);
                assert_eq!(items[i], keys[i] + 2 * n as u64);
            }
        }
    }

    #[test]
    fn test_bitonic_sort_by_with_duplicates() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut items: Vec<u64> = (0..257).map(|_| rng.gen_range(0..10)).collect();
        let mut expected = items.clone();
        expected.sort_unstable();
        bitonic_sort_by(&mut items, |a, b| a.ct_lt(b));
        assert_eq!(items, expected);
    }
}

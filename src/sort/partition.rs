// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Oblivious two-way partitioning: moving the elements that satisfy a predicate to the back.

use crate::{
    counters,
    utils::{
        apply_network_by, bitonic_network, conditional_swap_at, ct_ge, ct_to_u64,
        merge_exchange_network,
    },
};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// The strategy used to partition elements. All strategies produce a valid partition with a
/// data-independent access pattern; they differ in cost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartitionMethod {
    /// Batcher's odd-even merge-exchange network on the 1-bit marks.
    EvenOdd,
    /// Order-preserving compaction in O(n log n) swaps
    /// ([Sasy, Johnson and Goldberg](https://eprint.iacr.org/2022/1333.pdf)).
    #[default]
    OrCompact,
    /// Goodrich's order-preserving compaction by distance bits
    /// ([Goodrich](https://arxiv.org/pdf/1103.5102)).
    Goodrich,
    /// A bitonic network on the 1-bit marks.
    Bitonic,
}

impl PartitionMethod {
    /// Whether this method moves elements by compaction. Compaction keeps the order of the
    /// front run.
    pub fn is_compaction(&self) -> bool {
        matches!(self, PartitionMethod::OrCompact | PartitionMethod::Goodrich)
    }
}

/// An element together with the destination chosen for it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Marked<T> {
    pub item: T,
    pub mark: u64,
}

impl<T: ConditionallySelectable> ConditionallySelectable for Marked<T> {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        Self {
            item: T::conditional_select(&a.item, &b.item, choice),
            mark: u64::conditional_select(&a.mark, &b.mark, choice),
        }
    }
}

/// Obliviously reorders `items` so that every element for which `goes_last` is unset precedes
/// every element for which it is set.
pub(crate) fn partition_in_place<T, F>(items: &mut [T], goes_last: F, method: PartitionMethod)
where
    T: ConditionallySelectable,
    F: Fn(&T) -> Choice,
{
    let lt = |a: &T, b: &T| !goes_last(a) & goes_last(b);
    match method {
        PartitionMethod::EvenOdd => {
            apply_network_by(items, &merge_exchange_network(items.len()), lt)
        }
        PartitionMethod::Bitonic => apply_network_by(items, &bitonic_network(items.len()), lt),
        PartitionMethod::OrCompact => {
            let prefix_sum = prefix_sum_of_kept(items, &goes_last);
            or_compact(items, &prefix_sum);
        }
        PartitionMethod::Goodrich => goodrich_compact(items, &goes_last),
    }
}

// `result[i]` is the number of kept elements among the first `i`.
fn prefix_sum_of_kept<T, F: Fn(&T) -> Choice>(items: &[T], goes_last: &F) -> Vec<u64> {
    let mut result = vec![0u64; items.len() + 1];
    for (i, item) in items.iter().enumerate() {
        result[i + 1] = result[i] + ct_to_u64(!goes_last(item));
    }
    result
}

fn largest_power_of_two_at_most(n: usize) -> usize {
    1 << n.ilog2()
}

fn or_compact<T: ConditionallySelectable>(items: &mut [T], prefix_sum: &[u64]) {
    debug_assert_eq!(items.len() + 1, prefix_sum.len());
    let n = items.len();
    if n <= 1 {
        return;
    }

    let n1 = largest_power_of_two_at_most(n);
    let n2 = n - n1;

    if n2 == 0 {
        or_compact_with_offset(items, prefix_sum, 0);
        return;
    }

    let kept_in_head = prefix_sum[n2] - prefix_sum[0];
    let n1_u64 = n1 as u64;
    or_compact(&mut items[..n2], &prefix_sum[..n2 + 1]);
    or_compact_with_offset(
        &mut items[n2..],
        &prefix_sum[n2..],
        (n1_u64 - n2 as u64 + kept_in_head) & (n1_u64 - 1),
    );

    for i in 0..n2 {
        conditional_swap_at(items, i, i + n1, ct_ge(i as u64, kept_in_head));
    }
    counters::record_swaps(n2 as u64);
}

// Compacts `items`, whose length is a power of two, so that the kept run starts at `offset`
// and wraps around.
fn or_compact_with_offset<T: ConditionallySelectable>(
    items: &mut [T],
    prefix_sum: &[u64],
    offset: u64,
) {
    debug_assert_eq!(items.len() + 1, prefix_sum.len());
    let n = items.len();
    let half = n / 2;
    let kept_in_left = prefix_sum[half] - prefix_sum[0];

    if n == 2 {
        let right_kept = prefix_sum[2] - prefix_sum[1];
        let left_dropped = kept_in_left ^ 1;
        let swap = !((left_dropped & right_kept).ct_eq(&offset));
        conditional_swap_at(items, 0, 1, swap);
        counters::record_swaps(1);
        return;
    }

    let half_u64 = half as u64;
    let offset_left = offset & (half_u64 - 1);
    let offset_right = (offset + kept_in_left) & (half_u64 - 1);
    or_compact_with_offset(&mut items[..half], &prefix_sum[..half + 1], offset_left);
    or_compact_with_offset(&mut items[half..], &prefix_sum[half..], offset_right);

    let s = ct_ge(offset_left + kept_in_left, half_u64) ^ ct_ge(offset, half_u64);
    for i in 0..half {
        let swap = s ^ ct_ge(i as u64, offset_right);
        conditional_swap_at(items, i, i + half, swap);
    }
    counters::record_swaps(half as u64);
}

fn goodrich_compact<T, F>(items: &mut [T], goes_last: &F)
where
    T: ConditionallySelectable,
    F: Fn(&T) -> Choice,
{
    let n = items.len();
    if n <= 1 {
        return;
    }

    // The distance each kept element must travel towards the front, 0 for the others.
    let mut distance = vec![0u64; n];
    let mut dropped = 0u64;
    for (i, item) in items.iter().enumerate() {
        let drop = goes_last(item);
        dropped.conditional_assign(&(dropped + 1), drop);
        distance[i].conditional_assign(&dropped, !drop);
    }

    let rounds = n.next_power_of_two().trailing_zeros();
    for round in 0..rounds {
        let step = 1usize << round;
        for low in 0..(n - step) {
            let high = low + step;
            let moves = Choice::from(((distance[high] >> round) & 1) as u8);
            conditional_swap_at(items, low, high, moves);
            let remaining = distance[high].wrapping_sub(step as u64);
            distance[low].conditional_assign(&remaining, moves);
            distance[high].conditional_assign(&0, moves);
        }
        counters::record_swaps((n - step) as u64);
    }
}

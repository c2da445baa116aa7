// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Merge-split: routing the elements of `way` buckets into `way` buckets by tag.

use super::{
    interleave::interleave,
    partition::{partition_in_place, Marked, PartitionMethod},
    tagged::TaggedElement,
};
use crate::{utils::ct_to_u64, ObliviousError, OramBlock};
use subtle::{
    Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeGreater, ConstantTimeLess,
};

/// The largest supported fan-out of a merge-split.
pub const MAX_WAY: usize = 64;

/// Routes the `way * Z` elements of `items`, viewed as `way` buckets of `Z` elements each, so that
/// bucket `d` receives exactly the real elements `e` with `selector(e.tag) == d`, padded with
/// dummies to `Z` elements.
///
/// Every element is visited and every comparison is made, whatever the tags; the sequence of
/// swaps depends only on `way`, `Z` and `method`.
///
/// # Errors
///
/// - `InvalidConfigurationError` if `way` is not in `2..=64` or does not divide `items.len()`.
/// - `InvalidInputError` if `selector` returns a destination of `way` or more for a real element.
/// - `BucketOverflowError` if some destination would receive more than `Z` real elements.
///   `items` is left unchanged.
pub fn merge_split_k_way<T: OramBlock, F: Fn(u64) -> u64>(
    items: &mut [TaggedElement<T>],
    way: usize,
    selector: F,
    method: PartitionMethod,
) -> Result<(), ObliviousError> {
    if !(2..=MAX_WAY).contains(&way) || items.is_empty() || items.len() % way != 0 {
        return Err(ObliviousError::InvalidConfigurationError(
            "merge-split needs 2 to 64 non-empty buckets of equal size",
        ));
    }
    let bucket_capacity = items.len() / way;
    let capacity = u64::try_from(bucket_capacity)?;
    let way_u64 = u64::try_from(way)?;

    // Choose a destination for every real element, counting the load of each destination.
    let mut marked: Vec<Marked<TaggedElement<T>>> = Vec::with_capacity(items.len());
    let mut loads = vec![0u64; way];
    let mut all_valid = Choice::from(1);
    for item in items.iter() {
        let real = !item.ct_is_dummy();
        let mark = selector(item.tag);
        all_valid &= mark.ct_lt(&way_u64) | !real;
        for (destination, load) in (0u64..).zip(loads.iter_mut()) {
            let hit = destination.ct_eq(&mark) & real;
            load.conditional_assign(&(*load + 1), hit);
        }
        marked.push(Marked { item: *item, mark });
    }

    let mut overflow = Choice::from(0);
    for load in &loads {
        overflow |= load.ct_gt(&capacity);
    }

    // These branches reveal only that the call has failed.
    if !bool::from(all_valid) {
        return Err(ObliviousError::InvalidInputError(
            "selector returned a destination out of range",
        ));
    }
    if bool::from(overflow) {
        log::warn!(
            "Merge-split overflow: a destination received more than {} real elements.",
            bucket_capacity
        );
        return Err(ObliviousError::BucketOverflowError {
            capacity: bucket_capacity,
        });
    }

    // Send each dummy to the first destination that is not yet full, so that every destination
    // receives exactly `bucket_capacity` elements.
    for element in marked.iter_mut() {
        let is_dummy = element.item.ct_is_dummy();
        let mut assigned = Choice::from(0);
        for (destination, load) in (0u64..).zip(loads.iter_mut()) {
            let take = is_dummy & !assigned & load.ct_lt(&capacity);
            element.mark.conditional_assign(&destination, take);
            load.conditional_assign(&(*load + 1), take);
            assigned |= take;
        }
    }

    group_by_mark(&mut marked, way, bucket_capacity, method)?;

    for (item, element) in items.iter_mut().zip(marked) {
        *item = element.item;
    }
    Ok(())
}

// Rearranges `marked`, in which every mark below `way` occurs exactly `bucket_capacity` times,
// into runs of increasing mark.
fn group_by_mark<T: ConditionallySelectable>(
    marked: &mut [Marked<T>],
    way: usize,
    bucket_capacity: usize,
    method: PartitionMethod,
) -> Result<(), ObliviousError> {
    if way == 2 {
        partition_in_place(marked, |e| e.mark.ct_eq(&1), method);
    } else if method.is_compaction() {
        // Peel off one destination at a time.
        for destination in 0..(way - 1) {
            let mark = u64::try_from(destination)?;
            partition_in_place(
                &mut marked[destination * bucket_capacity..],
                |e| !e.mark.ct_eq(&mark),
                method,
            );
        }
    } else {
        let mut marks: Vec<u64> = marked.iter().map(|e| e.mark).collect();
        interleave(marked, &mut marks, u64::try_from(way)?)?;
    }
    Ok(())
}

/// Splits `2Z` elements in place: those whose tag has no bit of `bit_mask` set are routed to the
/// first `Z` slots and the others to the last `Z` slots, each half padded with dummies.
///
/// # Errors
///
/// As for [`merge_split_k_way`] with `way = 2`.
pub fn merge_split_in_place<T: OramBlock>(
    items: &mut [TaggedElement<T>],
    bit_mask: u64,
    method: PartitionMethod,
) -> Result<(), ObliviousError> {
    merge_split_k_way(
        items,
        2,
        |tag| ct_to_u64(!(tag & bit_mask).ct_eq(&0)),
        method,
    )
}

/// Merge-splits two buckets of `Z` elements each: afterwards `left` holds the real elements whose
/// tag has no bit of `bit_mask` set and `right` holds the others.
///
/// # Errors
///
/// `InvalidConfigurationError` if the buckets differ in size, and otherwise as for
/// [`merge_split_in_place`].
pub fn merge_split_two_way<T: OramBlock>(
    left: &mut [TaggedElement<T>],
    right: &mut [TaggedElement<T>],
    bit_mask: u64,
    method: PartitionMethod,
) -> Result<(), ObliviousError> {
    if left.len() != right.len() {
        return Err(ObliviousError::InvalidConfigurationError(
            "merge-split needs buckets of equal size",
        ));
    }
    let mut items = Vec::with_capacity(2 * left.len());
    items.extend_from_slice(left);
    items.extend_from_slice(right);

    merge_split_in_place(&mut items, bit_mask, method)?;

    let (first, second) = items.split_at(left.len());
    left.copy_from_slice(first);
    right.copy_from_slice(second);
    Ok(())
}

// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Stable oblivious grouping of elements into runs by mark.

use crate::{utils::bitonic_sort_by_keys, ObliviousError};
use subtle::{Choice, ConditionallySelectable, ConstantTimeLess};

const INDEX_BITS: u32 = 32;

/// The largest number of runs: every mark must fit above the index in a `u64` key.
pub const MAX_RUNS: u64 = 1 << (u64::BITS - INDEX_BITS);

/// Stably reorders `items` into `k` contiguous runs, the elements marked 0 first, then those
/// marked 1, and so on. `marks` is permuted alongside `items`.
///
/// Every element is touched regardless of its mark: the grouping is a sorting network on the
/// composite key `(mark, original index)`.
///
/// # Errors
///
/// - `InvalidInputError` if `marks` and `items` have different lengths, if `k` exceeds
///   [`MAX_RUNS`], or if a mark is at least `k`.
/// - `InvalidConfigurationError` if there are `2^32` elements or more.
pub fn interleave<T: ConditionallySelectable>(
    items: &mut [T],
    marks: &mut [u64],
    k: u64,
) -> Result<(), ObliviousError> {
    if items.len() != marks.len() {
        return Err(ObliviousError::InvalidInputError(
            "interleave needs one mark per element",
        ));
    }
    if k > MAX_RUNS {
        return Err(ObliviousError::InvalidInputError(
            "interleave supports at most 2^32 runs",
        ));
    }
    if u64::try_from(items.len())? >= 1 << INDEX_BITS {
        return Err(ObliviousError::InvalidConfigurationError(
            "interleave supports fewer than 2^32 elements",
        ));
    }

    let mut all_valid = Choice::from(1);
    for mark in marks.iter() {
        all_valid &= mark.ct_lt(&k);
    }
    // Reveals only that the input was malformed.
    if !bool::from(all_valid) {
        return Err(ObliviousError::InvalidInputError("mark out of range"));
    }

    let mut keys: Vec<u64> = marks
        .iter()
        .enumerate()
        .map(|(index, mark)| (mark << INDEX_BITS) | index as u64)
        .collect();
    bitonic_sort_by_keys(items, &mut keys);

    for (mark, key) in marks.iter_mut().zip(keys) {
        *mark = key >> INDEX_BITS;
    }
    Ok(())
}

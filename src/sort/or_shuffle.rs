// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Recursive shuffling by order-preserving compaction.

use super::{
    partition::{partition_in_place, Marked, PartitionMethod},
    static_sort::{sorting_network, MAX_STATIC_SORT_SIZE},
};
use crate::{
    database::Database,
    utils::{apply_network_by_keys, ct_to_u64},
    ObliviousError, OramBlock,
};
use rand::{CryptoRng, Rng, RngCore};
use subtle::{ConstantTimeEq, ConstantTimeLess};

/// Shuffles `data` in local memory, which must hold all of it.
pub(crate) fn or_shuffle<T, D, R>(
    data: &mut D,
    memory_budget: usize,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock,
    D: Database<T>,
    R: RngCore + CryptoRng,
{
    let n = usize::try_from(data.capacity()?)?;
    if n > memory_budget {
        return Err(ObliviousError::InvalidConfigurationError(
            "OrShuffle needs the whole input to fit in the memory budget",
        ));
    }
    let mut items = vec![T::default(); n];
    data.read_range(0, &mut items)?;
    shuffle_in_memory(&mut items, rng)?;
    data.write_range(0, &items)
}

fn shuffle_in_memory<T: OramBlock, R: RngCore + CryptoRng>(
    items: &mut [T],
    rng: &mut R,
) -> Result<(), ObliviousError> {
    let n = items.len();
    if n <= MAX_STATIC_SORT_SIZE {
        let mut keys: Vec<u64> = (0..n).map(|_| rng.gen()).collect();
        apply_network_by_keys(items, &mut keys, &sorting_network(n));
        return Ok(());
    }

    // Mark a uniformly random subset of exactly n / 2 elements by sequential sampling.
    let half = n / 2;
    let mut needed = u64::try_from(half)?;
    let mut remaining = u64::try_from(n)?;
    let mut marked: Vec<Marked<T>> = Vec::with_capacity(n);
    for item in items.iter() {
        let chosen = rng.gen_range(0..remaining).ct_lt(&needed);
        needed -= ct_to_u64(chosen);
        remaining -= 1;
        marked.push(Marked {
            item: *item,
            mark: ct_to_u64(chosen),
        });
    }

    partition_in_place(&mut marked, |e| !e.mark.ct_eq(&1), PartitionMethod::OrCompact);
    for (item, element) in items.iter_mut().zip(marked) {
        *item = element.item;
    }

    let (front, back) = items.split_at_mut(half);
    shuffle_in_memory(front, rng)?;
    shuffle_in_memory(back, rng)
}

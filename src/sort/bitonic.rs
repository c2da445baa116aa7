// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Element-level bitonic sorting and shuffling directly on a database.

use super::tagged::{ct_lt_by_tag, SortKey, TaggedElement};
use crate::{
    backend::StorageBackend,
    counters,
    database::Database,
    utils::{for_each_bitonic_comparator, Comparator},
    Address, ObliviousError, OramBlock,
};
use rand::{CryptoRng, Rng, RngCore};
use subtle::{Choice, ConditionallySelectable, ConstantTimeLess};

// Each comparator reads its two elements and writes both back, swapped or not.
fn apply_bitonic_network<V, D, F>(database: &mut D, lt: F) -> Result<(), ObliviousError>
where
    V: OramBlock,
    D: Database<V>,
    F: Fn(&V, &V) -> Choice,
{
    let n = usize::try_from(database.capacity()?)?;
    for_each_bitonic_comparator(n, &mut |comparator: Comparator| {
        let low_address = Address::try_from(comparator.low)?;
        let high_address = Address::try_from(comparator.high)?;
        let mut low = database.read_db(low_address)?;
        let mut high = database.read_db(high_address)?;
        let swap = comparator.ct_should_swap(&low, &high, &lt);
        V::conditional_swap(&mut low, &mut high, swap);
        database.write_db(low_address, low)?;
        database.write_db(high_address, high)?;
        counters::record_swaps(1);
        Ok::<(), ObliviousError>(())
    })
}

/// Sorts `data` by key with a bitonic network applied element by element.
pub(crate) fn bitonic_sort<T, D>(data: &mut D) -> Result<(), ObliviousError>
where
    T: OramBlock + SortKey,
    D: Database<T>,
{
    apply_bitonic_network(data, |a: &T, b: &T| a.sort_key().ct_lt(&b.sort_key()))
}

/// Shuffles `data` by tagging every element with random bits in scratch storage and sorting
/// by tag.
pub(crate) fn bitonic_shuffle<T, D, S, R>(
    data: &mut D,
    backend: &mut S,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock,
    D: Database<T>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    let n = data.capacity()?;
    let mut scratch = backend.allocate::<TaggedElement<T>>(n)?;
    let result = shuffle_through(data, &mut scratch, rng);
    backend.release(scratch)?;
    result
}

fn shuffle_through<T, D, B, R>(
    data: &mut D,
    scratch: &mut B,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock,
    D: Database<T>,
    B: Database<TaggedElement<T>>,
    R: RngCore + CryptoRng,
{
    let n = data.capacity()?;
    for address in 0..n {
        let payload = data.read_db(address)?;
        scratch.write_db(address, TaggedElement::real(payload, rng.gen()))?;
    }
    apply_bitonic_network(scratch, ct_lt_by_tag)?;
    for address in 0..n {
        let element = scratch.read_db(address)?;
        data.write_db(address, element.payload)?;
    }
    Ok(())
}

// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Bucket-oblivious sorting and shuffling through a butterfly network of merge-splits.

use super::{
    merge_split::merge_split_k_way,
    params::BucketLayout,
    partition::PartitionMethod,
    plan::{NetworkPlan, Pass},
    static_sort::sorting_network,
    tagged::{ct_lt_by_key, ct_lt_by_tag, SortKey, TaggedElement},
};
use crate::{
    backend::StorageBackend,
    database::Database,
    utils::{apply_network_by, bitonic_merge_network, merge_exchange_rounds},
    Address, ObliviousError, OramBlock,
};
use rand::{CryptoRng, Rng, RngCore};
use rayon::prelude::*;

/// Randomly permutes `data`: every element is routed to a uniformly random bucket, and each
/// bucket is then permuted locally.
pub(crate) fn butterfly_shuffle<T, D, S, R>(
    data: &mut D,
    backend: &mut S,
    plan: &NetworkPlan,
    method: PartitionMethod,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock + Send,
    D: Database<T>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    with_scratch(backend, &plan.layout, |scratch| {
        route(data, scratch, plan, method, rng)?;
        finish_shuffle(data, scratch, &plan.layout, rng)
    })
}

/// Sorts `data` by key: the routed buckets are sorted locally and then merged by a
/// merge-exchange network whose comparators act on whole buckets.
pub(crate) fn butterfly_sort<T, D, S, R>(
    data: &mut D,
    backend: &mut S,
    plan: &NetworkPlan,
    method: PartitionMethod,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock + SortKey + Send,
    D: Database<T>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    with_scratch(backend, &plan.layout, |scratch| {
        route(data, scratch, plan, method, rng)?;
        finish_sort(data, scratch, &plan.layout)
    })
}

// Runs `f` on a scratch database of one slot per bucket element, which is released afterwards
// even if `f` fails.
fn with_scratch<T, S, F>(
    backend: &mut S,
    layout: &BucketLayout,
    f: F,
) -> Result<(), ObliviousError>
where
    T: OramBlock,
    S: StorageBackend,
    F: FnOnce(&mut S::Allocation<TaggedElement<T>>) -> Result<(), ObliviousError>,
{
    let slots = Address::try_from(layout.slot_count())?;
    let mut scratch = backend.allocate::<TaggedElement<T>>(slots)?;
    let result = f(&mut scratch);
    backend.release(scratch)?;
    result
}

fn bucket_start(bucket: usize, layout: &BucketLayout) -> Result<Address, ObliviousError> {
    Ok(Address::try_from(bucket * layout.bucket_capacity)?)
}

// Copies `data` into the buckets with uniformly random tags and runs every level of the network.
// Afterwards bucket `b` holds exactly the elements tagged `b`.
fn route<T, D, B, R>(
    data: &mut D,
    scratch: &mut B,
    plan: &NetworkPlan,
    method: PartitionMethod,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock + Send,
    D: Database<T>,
    B: Database<TaggedElement<T>>,
    R: RngCore + CryptoRng,
{
    let layout = &plan.layout;
    let n = data.capacity()?;
    let initial_load = usize::try_from(layout.initial_load()?)?;
    let bucket_count = u64::try_from(layout.bucket_count)?;

    let mut bucket = vec![TaggedElement::dummy(); layout.bucket_capacity];
    let mut next: Address = 0;
    for index in 0..layout.bucket_count {
        for (slot, element) in bucket.iter_mut().enumerate() {
            *element = if slot < initial_load && next < n {
                let payload = data.read_db(next)?;
                next += 1;
                TaggedElement::real(payload, rng.gen_range(0..bucket_count))
            } else {
                TaggedElement::dummy()
            };
        }
        scratch.write_range(bucket_start(index, layout)?, &bucket)?;
    }

    for pass in &plan.passes {
        run_pass(scratch, plan, pass, method)?;
    }
    Ok(())
}

fn run_pass<T, B>(
    scratch: &mut B,
    plan: &NetworkPlan,
    pass: &Pass,
    method: PartitionMethod,
) -> Result<(), ObliviousError>
where
    T: OramBlock + Send,
    B: Database<TaggedElement<T>>,
{
    let layout = &plan.layout;
    let z = layout.bucket_capacity;
    let task_len = plan.buckets_per_task(pass) * z;
    let task_count = plan.task_count(pass);
    log::debug!(
        "Butterfly pass: levels {}..{}, {} tasks of {} elements.",
        pass.first_level,
        pass.first_level + pass.levels,
        task_count,
        task_len
    );

    let mut first_task = 0;
    while first_task < task_count {
        let batch = plan.tasks_per_batch.min(task_count - first_task);
        let mut buffer = vec![TaggedElement::dummy(); batch * task_len];

        for (offset, task) in buffer.chunks_mut(task_len).enumerate() {
            for (local, bucket) in task.chunks_mut(z).enumerate() {
                let index = plan.bucket_of(pass, first_task + offset, local);
                scratch.read_range(bucket_start(index, layout)?, bucket)?;
            }
        }

        let apply = |task: &mut [TaggedElement<T>]| apply_levels(task, layout, pass, method);
        if plan.parallel {
            buffer.par_chunks_mut(task_len).try_for_each(apply)?;
        } else {
            buffer.chunks_mut(task_len).try_for_each(apply)?;
        }

        for (offset, task) in buffer.chunks(task_len).enumerate() {
            for (local, bucket) in task.chunks(z).enumerate() {
                let index = plan.bucket_of(pass, first_task + offset, local);
                scratch.write_range(bucket_start(index, layout)?, bucket)?;
            }
        }
        first_task += batch;
    }
    Ok(())
}

// Applies the levels of `pass` to the buckets of one task, held contiguously in `task`.
fn apply_levels<T: OramBlock>(
    task: &mut [TaggedElement<T>],
    layout: &BucketLayout,
    pass: &Pass,
    method: PartitionMethod,
) -> Result<(), ObliviousError> {
    let way = layout.way;
    let z = layout.bucket_capacity;
    let buckets = task.len() / z;
    let mut group = vec![TaggedElement::dummy(); way * z];

    for local_level in 0..pass.levels {
        let level = pass.first_level + local_level;
        let stride = way.pow(local_level);
        let member = |outer: usize, digit: usize, inner: usize| {
            (outer * stride * way + digit * stride + inner) * z
        };

        for outer in 0..buckets / (stride * way) {
            for inner in 0..stride {
                for (digit, slot) in group.chunks_mut(z).enumerate() {
                    let start = member(outer, digit, inner);
                    slot.copy_from_slice(&task[start..start + z]);
                }
                merge_split_k_way(&mut group, way, |tag| layout.digit(tag, level), method)?;
                for (digit, slot) in group.chunks(z).enumerate() {
                    let start = member(outer, digit, inner);
                    task[start..start + z].copy_from_slice(slot);
                }
            }
        }
    }
    Ok(())
}

fn finish_shuffle<T, D, B, R>(
    data: &mut D,
    scratch: &mut B,
    layout: &BucketLayout,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock,
    D: Database<T>,
    B: Database<TaggedElement<T>>,
    R: RngCore + CryptoRng,
{
    let network = sorting_network(layout.bucket_capacity);
    let mut bucket = vec![TaggedElement::dummy(); layout.bucket_capacity];
    let mut next: Address = 0;
    for index in 0..layout.bucket_count {
        scratch.read_range(bucket_start(index, layout)?, &mut bucket)?;
        for element in bucket.iter_mut() {
            element.tag = rng.gen();
        }
        apply_network_by(&mut bucket, &network, ct_lt_by_tag);

        // The bucket loads depend only on the routing tags.
        for element in bucket.iter().take_while(|e| !e.is_dummy()) {
            data.write_db(next, element.payload)?;
            next += 1;
        }
    }
    debug_assert_eq!(next, data.capacity()?);
    Ok(())
}

// Sorts every bucket, then runs a merge-exchange network over the buckets in which each
// comparator merges two sorted buckets. A comparator costs `4Z` block accesses and a bitonic
// merge of `O(Z log Z)` compare-exchanges; with `B` buckets there are `O(B log^2 B)` of them, so
// this phase dominates the I/O of sort mode.
fn finish_sort<T, D, B>(
    data: &mut D,
    scratch: &mut B,
    layout: &BucketLayout,
) -> Result<(), ObliviousError>
where
    T: OramBlock + SortKey,
    D: Database<T>,
    B: Database<TaggedElement<T>>,
{
    let z = layout.bucket_capacity;

    let network = sorting_network(z);
    let mut bucket = vec![TaggedElement::dummy(); z];
    for index in 0..layout.bucket_count {
        let start = bucket_start(index, layout)?;
        scratch.read_range(start, &mut bucket)?;
        apply_network_by(&mut bucket, &network, ct_lt_by_key);
        scratch.write_range(start, &bucket)?;
    }

    // Merging two sorted buckets and splitting the result in halves is a comparator on sorted
    // runs, so any sorting network over the buckets sorts the whole array. Reversing the lower
    // bucket makes the pair bitonic.
    let network = bitonic_merge_network(2 * z);
    let mut pair = vec![TaggedElement::dummy(); 2 * z];
    for round in merge_exchange_rounds(layout.bucket_count) {
        for comparator in round {
            let low = bucket_start(comparator.low, layout)?;
            let high = bucket_start(comparator.high, layout)?;
            scratch.read_range(low, &mut pair[..z])?;
            scratch.read_range(high, &mut pair[z..])?;
            pair[..z].reverse();
            apply_network_by(&mut pair, &network, ct_lt_by_key);
            scratch.write_range(low, &pair[..z])?;
            scratch.write_range(high, &pair[z..])?;
        }
    }

    // Dummies sort last, so the first `n` slots hold every real element.
    for address in 0..data.capacity()? {
        let element = scratch.read_db(address)?;
        data.write_db(address, element.payload)?;
    }
    Ok(())
}

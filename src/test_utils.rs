// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities for the ORAM, sorting and map tests of this crate.

use crate::{
    database::{Database, SimpleDatabase},
    Address, Oram, OramBlock,
};
use rand::{
    distributions::{Distribution, Standard},
    rngs::StdRng,
    Rng, SeedableRng,
};
use simplelog::{Config, WriteLogger};
use std::sync::Once;

static INIT: Once = Once::new();

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

/// A deterministic RNG, so that failures can be reproduced.
pub(crate) fn test_rng() -> StdRng {
    StdRng::seed_from_u64(0)
}

/// Tests the correctness of `oram` on a workload of random reads and writes.
pub(crate) fn test_correctness_random_workload<T: Oram>(mut oram: T, num_operations: u32)
where
    Standard: Distribution<T::V>,
{
    init_logger();
    let mut rng = test_rng();

    let capacity = oram.block_capacity().unwrap();
    let mut mirror_array = vec![T::V::default(); capacity as usize];

    for _ in 0..num_operations {
        let random_index = rng.gen_range(0..capacity);
        let random_block_value = rng.gen::<T::V>();

        if rng.gen::<bool>() {
            assert_eq!(
                oram.read(random_index, &mut rng).unwrap(),
                mirror_array[random_index as usize]
            );
        } else {
            let previous = oram
                .write(random_index, random_block_value, &mut rng)
                .unwrap();
            assert_eq!(previous, mirror_array[random_index as usize]);
            mirror_array[random_index as usize] = random_block_value;
        }
    }

    for index in 0..capacity {
        assert_eq!(
            oram.read(index, &mut rng).unwrap(),
            mirror_array[index as usize],
            "{index}"
        )
    }
}

/// Tests the correctness of `oram` on repeated passes of sequential accesses 0, 1, ..., `capacity`.
pub(crate) fn test_correctness_linear_workload<T: Oram>(mut oram: T, num_operations: u32)
where
    Standard: Distribution<T::V>,
{
    init_logger();
    let mut rng = test_rng();

    let capacity = oram.block_capacity().unwrap();
    let mut mirror_array = vec![T::V::default(); capacity as usize];
    let num_passes = u64::from(num_operations) / capacity;

    for _ in 0..num_passes {
        for index in 0..capacity {
            let random_block_value = rng.gen::<T::V>();

            if rng.gen::<bool>() {
                assert_eq!(
                    oram.read(index, &mut rng).unwrap(),
                    mirror_array[index as usize]
                );
            } else {
                oram.write(index, random_block_value, &mut rng).unwrap();
                mirror_array[index as usize] = random_block_value;
            }
        }
    }

    for index in 0..capacity {
        assert_eq!(
            oram.read(index, &mut rng).unwrap(),
            mirror_array[index as usize],
            "{index}"
        )
    }
}

/// Loads `values` into a fresh in-memory database.
pub(crate) fn database_from<V: OramBlock>(values: &[V]) -> SimpleDatabase<V> {
    SimpleDatabase::from(values.to_vec())
}

/// Reads the full contents of `database`.
pub(crate) fn contents<V: OramBlock, D: Database<V>>(database: &mut D) -> Vec<V> {
    let capacity = database.capacity().unwrap();
    (0..capacity)
        .map(|index: Address| database.read_db(index).unwrap())
        .collect()
}

/// `n` random values drawn from a small range, so that duplicates occur.
pub(crate) fn values_with_duplicates(n: usize, rng: &mut StdRng) -> Vec<u64> {
    (0..n).map(|_| rng.gen_range(0..(n as u64 / 2 + 1))).collect()
}

/// Whether `actual` is a rearrangement of `expected`.
pub(crate) fn is_permutation_of<V: Ord + Clone>(actual: &[V], expected: &[V]) -> bool {
    let mut actual = actual.to_vec();
    let mut expected = expected.to_vec();
    actual.sort();
    expected.sort();
    actual == expected
}

macro_rules! create_correctness_test_block_value {
    ($function_name:ident, $oram_type: ident, $constructor: expr, $block_size: expr, $block_capacity:expr, $iterations_to_test: expr) => {
        paste::paste! {
            #[test]
            fn [<$function_name _ $oram_type:snake _ $block_capacity _ $block_size _ $iterations_to_test>]() {
                let oram: $oram_type<$block_size> = ($constructor)($block_capacity).unwrap();
                $function_name(oram, $iterations_to_test);
            }
        }
    };
}

macro_rules! create_correctness_tests_for_workload_and_oram_type {
    ($function_name: ident, $oram_type: ident, $constructor: expr) => {
        create_correctness_test_block_value!($function_name, $oram_type, $constructor, 2, 2, 10);
        create_correctness_test_block_value!($function_name, $oram_type, $constructor, 4, 8, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $constructor, 2, 8, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $constructor, 8, 8, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $constructor, 4, 16, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $constructor, 4, 32, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $constructor, 16, 64, 100);
        create_correctness_test_block_value!($function_name, $oram_type, $constructor, 2, 8, 1000);
    };
}

/// Instantiates the linear and random workloads for `$oram_type`, an alias generic over the
/// block size only, built by calling `$constructor` with a block capacity.
macro_rules! create_correctness_tests_for_oram_type {
    ($oram_type: ident, $constructor: expr) => {
        create_correctness_tests_for_workload_and_oram_type!(
            test_correctness_linear_workload,
            $oram_type,
            $constructor
        );
        create_correctness_tests_for_workload_and_oram_type!(
            test_correctness_random_workload,
            $oram_type,
            $constructor
        );
    };
}

pub(crate) use create_correctness_test_block_value;
pub(crate) use create_correctness_tests_for_oram_type;
pub(crate) use create_correctness_tests_for_workload_and_oram_type;

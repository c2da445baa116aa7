// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Oblivious sorting and shuffling of the elements of a [`Database`].
//!
//! Every algorithm here touches a sequence of database and scratch addresses that depends only
//! on the number of elements, the configuration and the random coins, never on the elements.
//! The bucket algorithms route elements through a butterfly network of merge-splits over buckets
//! of `Z` elements; they differ in fan-out and in how many levels are applied per pass over
//! storage.

pub mod interleave;
pub mod merge_split;
pub mod params;
pub mod partition;
pub mod static_sort;
pub mod tagged;

mod bitonic;
mod butterfly;
mod or_shuffle;
mod plan;

pub use interleave::{interleave, MAX_RUNS};
pub use merge_split::{merge_split_in_place, merge_split_k_way, merge_split_two_way};
pub use params::{recommended_bucket_capacity, BucketLayout};
pub use partition::PartitionMethod;
pub use static_sort::{sort_small_by, StaticSort};
pub use tagged::{SortKey, TaggedElement};

use crate::{backend::StorageBackend, database::Database, ObliviousError, OramBlock};
use duplicate::duplicate_item;
use plan::{MergeSchedule, NetworkPlan};
use rand::{CryptoRng, RngCore};

/// The available sorting and shuffling algorithms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortAlgorithm {
    /// An element-level bitonic network run directly against the database.
    Bitonic,
    /// Recursive halving by compaction, entirely in local memory. Shuffle only.
    OrShuffle,
    /// A two-way butterfly applying one level per pass.
    NaiveBucket,
    /// A two-way butterfly whose levels are batched by recursive halving.
    CaBucket,
    /// A two-way butterfly applying as many levels per pass as fit in memory.
    MinIo,
    /// A `way`-way butterfly applying as many levels per pass as fit in memory.
    #[default]
    KWayButterfly,
    /// The `KWayButterfly` schedule with the tasks of each pass run on the rayon thread pool.
    DistriO,
}

impl SortAlgorithm {
    // The fan-out, schedule and parallelism of a butterfly algorithm.
    fn butterfly(&self, way: usize) -> Option<(usize, MergeSchedule, bool)> {
        match self {
            SortAlgorithm::Bitonic | SortAlgorithm::OrShuffle => None,
            SortAlgorithm::NaiveBucket => Some((2, MergeSchedule::Naive, false)),
            SortAlgorithm::CaBucket => Some((2, MergeSchedule::CacheAware, false)),
            SortAlgorithm::MinIo => Some((2, MergeSchedule::Greedy, false)),
            SortAlgorithm::KWayButterfly => Some((way, MergeSchedule::Greedy, false)),
            SortAlgorithm::DistriO => Some((way, MergeSchedule::Greedy, true)),
        }
    }
}

/// Whether elements are ordered by key or randomly permuted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortMode {
    /// Order the elements by ascending [`SortKey`].
    Sort,
    /// Apply a uniformly random permutation.
    Shuffle,
}

/// Parameters of a sort or shuffle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortConfig {
    /// The algorithm to run.
    pub algorithm: SortAlgorithm,
    /// Elements per bucket. Derived from `security_bits` when `None`.
    pub bucket_capacity: Option<usize>,
    /// The fan-out of `KWayButterfly` and `DistriO`: a power of two between 2 and 64.
    pub way: usize,
    /// The number of elements that may be held in local memory at once.
    pub memory_budget: usize,
    /// The partitioning strategy inside merge-splits.
    pub partition_method: PartitionMethod,
    /// The bucket overflow probability is at most `2^-security_bits`.
    pub security_bits: u32,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            algorithm: SortAlgorithm::default(),
            bucket_capacity: None,
            way: 4,
            memory_budget: 1 << 16,
            partition_method: PartitionMethod::default(),
            security_bits: 40,
        }
    }
}

impl SortConfig {
    /// Returns `self` with `algorithm` replaced.
    pub fn with_algorithm(self, algorithm: SortAlgorithm) -> Self {
        Self { algorithm, ..self }
    }

    /// Returns `self` with a fixed bucket capacity.
    pub fn with_bucket_capacity(self, bucket_capacity: usize) -> Self {
        Self {
            bucket_capacity: Some(bucket_capacity),
            ..self
        }
    }

    /// Returns `self` with `way` replaced.
    pub fn with_way(self, way: usize) -> Self {
        Self { way, ..self }
    }

    /// Returns `self` with `memory_budget` replaced.
    pub fn with_memory_budget(self, memory_budget: usize) -> Self {
        Self {
            memory_budget,
            ..self
        }
    }

    /// Returns `self` with `partition_method` replaced.
    pub fn with_partition_method(self, partition_method: PartitionMethod) -> Self {
        Self {
            partition_method,
            ..self
        }
    }

    /// Returns `self` with `security_bits` replaced.
    pub fn with_security_bits(self, security_bits: u32) -> Self {
        Self {
            security_bits,
            ..self
        }
    }

    fn validate(&self, mode: SortMode) -> Result<(), ObliviousError> {
        if self.algorithm == SortAlgorithm::OrShuffle && mode == SortMode::Sort {
            return Err(ObliviousError::InvalidConfigurationError(
                "OrShuffle can only shuffle",
            ));
        }
        if self.memory_budget == 0 {
            return Err(ObliviousError::InvalidConfigurationError(
                "the memory budget must be positive",
            ));
        }
        if let Some((way, _, _)) = self.algorithm.butterfly(self.way) {
            // Checks the fan-out and bucket capacity before any storage is touched.
            BucketLayout::new(0, self.bucket_capacity.unwrap_or(2), way)?;
        }
        Ok(())
    }

    fn plan(&self, n: u64) -> Result<Option<NetworkPlan>, ObliviousError> {
        let Some((way, schedule, parallel)) = self.algorithm.butterfly(self.way) else {
            return Ok(None);
        };
        let bucket_capacity = match self.bucket_capacity {
            Some(bucket_capacity) => bucket_capacity,
            None => {
                let bucket_capacity = recommended_bucket_capacity(n, self.security_bits);
                log::info!(
                    "Bucket capacity {} for {} elements at {} bits of security.",
                    bucket_capacity,
                    n,
                    self.security_bits
                );
                bucket_capacity
            }
        };
        let layout = BucketLayout::new(n, bucket_capacity, way)?;
        Ok(Some(NetworkPlan::new(
            layout,
            schedule,
            self.memory_budget,
            parallel,
        )?))
    }
}

/// Sorts `data` by ascending key with the algorithm chosen in `config`. Scratch storage is
/// allocated from `backend` and released before returning.
///
/// # Errors
///
/// `InvalidConfigurationError` for an inconsistent `config`, `BucketOverflowError` if a bucket
/// overflows, and any error of `backend` or `data`. After a `BucketOverflowError` the contents
/// of `data` are unspecified.
pub fn oblivious_sort<T, D, S, R>(
    data: &mut D,
    backend: &mut S,
    config: &SortConfig,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock + SortKey + Send,
    D: Database<T>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    config.validate(SortMode::Sort)?;
    let n = data.capacity()?;
    log::info!("Oblivious sort of {} elements with {:?}.", n, config.algorithm);
    if n <= 1 {
        return Ok(());
    }
    match config.plan(n)? {
        Some(plan) => {
            butterfly::butterfly_sort(data, backend, &plan, config.partition_method, rng)
        }
        None => bitonic::bitonic_sort(data),
    }
}

/// Applies a uniformly random permutation to `data` with the algorithm chosen in `config`.
///
/// # Errors
///
/// As for [`oblivious_sort`]. `OrShuffle` also requires the whole input to fit in the memory
/// budget.
pub fn oblivious_shuffle<T, D, S, R>(
    data: &mut D,
    backend: &mut S,
    config: &SortConfig,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock + Send,
    D: Database<T>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    config.validate(SortMode::Shuffle)?;
    let n = data.capacity()?;
    log::info!("Oblivious shuffle of {} elements with {:?}.", n, config.algorithm);
    if n <= 1 {
        return Ok(());
    }
    match config.plan(n)? {
        Some(plan) => {
            butterfly::butterfly_shuffle(data, backend, &plan, config.partition_method, rng)
        }
        None if config.algorithm == SortAlgorithm::OrShuffle => {
            or_shuffle::or_shuffle(data, config.memory_budget, rng)
        }
        None => bitonic::bitonic_shuffle(data, backend, rng),
    }
}

/// Sorts or shuffles `data` according to `mode`.
pub fn run<T, D, S, R>(
    data: &mut D,
    backend: &mut S,
    config: &SortConfig,
    mode: SortMode,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock + SortKey + Send,
    D: Database<T>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    match mode {
        SortMode::Sort => oblivious_sort(data, backend, config, rng),
        SortMode::Shuffle => oblivious_shuffle(data, backend, config, rng),
    }
}

#[duplicate_item(
    name                   algorithm                        description;
    [bitonic_sort]         [SortAlgorithm::Bitonic]         ["Sorts `data` with an element-level bitonic network."];
    [naive_bucket_sort]    [SortAlgorithm::NaiveBucket]     ["Sorts `data` with a two-way butterfly, one level per pass."];
    [ca_bucket_sort]       [SortAlgorithm::CaBucket]        ["Sorts `data` with a cache-aware two-way butterfly."];
    [min_io_sort]          [SortAlgorithm::MinIo]           ["Sorts `data` with a greedily batched two-way butterfly."];
    [kway_butterfly_sort]  [SortAlgorithm::KWayButterfly]   ["Sorts `data` with a `config.way`-way butterfly."];
    [distri_o_sort]        [SortAlgorithm::DistriO]         ["Sorts `data` with a parallel `config.way`-way butterfly."];
)]
#[doc = description]
pub fn name<T, D, S, R>(
    data: &mut D,
    backend: &mut S,
    config: &SortConfig,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock + SortKey + Send,
    D: Database<T>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    oblivious_sort(data, backend, &config.with_algorithm(algorithm), rng)
}

#[duplicate_item(
    name                      algorithm                       description;
    [bitonic_shuffle]         [SortAlgorithm::Bitonic]        ["Shuffles `data` by sorting on random tags."];
    [or_shuffle]              [SortAlgorithm::OrShuffle]      ["Shuffles `data` in memory by recursive compaction."];
    [kway_butterfly_shuffle]  [SortAlgorithm::KWayButterfly]  ["Shuffles `data` with a `config.way`-way butterfly."];
)]
#[doc = description]
pub fn name<T, D, S, R>(
    data: &mut D,
    backend: &mut S,
    config: &SortConfig,
    rng: &mut R,
) -> Result<(), ObliviousError>
where
    T: OramBlock + Send,
    D: Database<T>,
    S: StorageBackend,
    R: RngCore + CryptoRng,
{
    oblivious_shuffle(data, backend, &config.with_algorithm(algorithm), rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{MemoryBackend, TracingBackend},
        database::SimpleDatabase,
        test_utils::{
            contents, database_from, init_logger, is_permutation_of, test_rng,
            values_with_duplicates,
        },
    };
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    type EntryPoint = fn(
        &mut SimpleDatabase<u64>,
        &mut MemoryBackend,
        &SortConfig,
        &mut StdRng,
    ) -> Result<(), ObliviousError>;

    const ALGORITHMS: [SortAlgorithm; 7] = [
        SortAlgorithm::Bitonic,
        SortAlgorithm::OrShuffle,
        SortAlgorithm::NaiveBucket,
        SortAlgorithm::CaBucket,
        SortAlgorithm::MinIo,
        SortAlgorithm::KWayButterfly,
        SortAlgorithm::DistriO,
    ];

    fn small_config(algorithm: SortAlgorithm) -> SortConfig {
        SortConfig::default()
            .with_algorithm(algorithm)
            .with_bucket_capacity(64)
            .with_memory_budget(1 << 12)
    }

    #[test]
    fn sorts_are_ordered_permutations() {
        init_logger();
        let mut rng = test_rng();
        for algorithm in ALGORITHMS {
            if algorithm == SortAlgorithm::OrShuffle {
                continue;
            }
            for n in [0, 1, 2, 100, 333] {
                let input = values_with_duplicates(n, &mut rng);
                let mut data = database_from(&input);
                let mut backend = MemoryBackend::default();
                oblivious_sort(&mut data, &mut backend, &small_config(algorithm), &mut rng)
                    .unwrap();
                let mut expected = input.clone();
                expected.sort();
                assert_eq!(contents(&mut data), expected, "{algorithm:?} {n}");
                assert_eq!(backend.allocated_bytes(), 0);
            }
        }
    }

    #[test]
    fn shuffles_are_permutations() {
        let mut rng = test_rng();
        for algorithm in ALGORITHMS {
            for n in [0u64, 1, 2, 100, 333] {
                let input: Vec<u64> = (0..n).collect();
                let mut data = database_from(&input);
                let config = small_config(algorithm);
                run(&mut data, &mut MemoryBackend::default(), &config, SortMode::Shuffle, &mut rng)
                    .unwrap();
                assert!(is_permutation_of(&contents(&mut data), &input), "{algorithm:?}");
            }
        }
    }

    #[test]
    fn named_entry_points() {
        let mut rng = test_rng();
        let config = SortConfig::default().with_bucket_capacity(32).with_way(8);
        let input = values_with_duplicates(200, &mut rng);
        let mut expected = input.clone();
        expected.sort();

        let sorts: [EntryPoint; 6] = [
            bitonic_sort,
            naive_bucket_sort,
            ca_bucket_sort,
            min_io_sort,
            kway_butterfly_sort,
            distri_o_sort,
        ];
        for sort in sorts {
            let mut data = database_from(&input);
            sort(&mut data, &mut MemoryBackend::default(), &config, &mut rng).unwrap();
            assert_eq!(contents(&mut data), expected);
        }

        let shuffles: [EntryPoint; 3] = [bitonic_shuffle, or_shuffle, kway_butterfly_shuffle];
        for shuffle in shuffles {
            let mut data = database_from(&input);
            shuffle(&mut data, &mut MemoryBackend::default(), &config, &mut rng).unwrap();
            assert!(is_permutation_of(&contents(&mut data), &input));
        }
    }

    #[test]
    fn default_bucket_capacity_sorts() {
        let mut rng = test_rng();
        let input = values_with_duplicates(1000, &mut rng);
        let mut data = database_from(&input);
        oblivious_sort(
            &mut data,
            &mut MemoryBackend::default(),
            &SortConfig::default(),
            &mut rng,
        )
        .unwrap();
        let mut expected = input.clone();
        expected.sort();
        assert_eq!(contents(&mut data), expected);
    }

    fn chi_square(counts: &HashMap<Vec<u64>, u64>, cells: u64, trials: u64) -> f64 {
        let expected = trials as f64 / cells as f64;
        let observed: f64 = counts
            .values()
            .map(|count| (*count as f64 - expected).powi(2) / expected)
            .sum();
        let empty_cells = cells - counts.len() as u64;
        observed + empty_cells as f64 * expected
    }

    // All 24 permutations of 4 elements, 2000 trials: 23 degrees of freedom.
    #[test]
    fn shuffles_of_four_are_uniform() {
        let mut rng = test_rng();
        let trials = 2000;
        for config in [
            small_config(SortAlgorithm::KWayButterfly)
                .with_bucket_capacity(8)
                .with_way(2),
            small_config(SortAlgorithm::KWayButterfly)
                .with_bucket_capacity(2)
                .with_way(4),
            small_config(SortAlgorithm::Bitonic),
            small_config(SortAlgorithm::OrShuffle),
        ] {
            let mut counts = HashMap::new();
            for _ in 0..trials {
                let mut data = database_from(&[0u64, 1, 2, 3]);
                let result =
                    oblivious_shuffle(&mut data, &mut MemoryBackend::default(), &config, &mut rng);
                match result {
                    Ok(()) => *counts.entry(contents(&mut data)).or_insert(0) += 1,
                    // Four elements in buckets of two may overflow; skipping such runs
                    // conditions on the routing tags only.
                    Err(ObliviousError::BucketOverflowError { .. }) => {}
                    Err(e) => panic!("{e}"),
                }
            }
            let total: u64 = counts.values().sum();
            let statistic = chi_square(&counts, 24, total);
            assert!(statistic < 50.0, "{config:?}: {statistic}");
        }
    }

    // The positions of the first two of 16 elements under the recursive shuffle: 240 cells.
    #[test]
    fn or_shuffle_is_uniform() {
        let mut rng = test_rng();
        let trials = 4000;
        let config = small_config(SortAlgorithm::OrShuffle);
        let input: Vec<u64> = (0..16).collect();
        let mut counts = HashMap::new();
        for _ in 0..trials {
            let mut data = database_from(&input);
            oblivious_shuffle(&mut data, &mut MemoryBackend::default(), &config, &mut rng)
                .unwrap();
            let output = contents(&mut data);
            let position = |x: u64| output.iter().position(|y| *y == x).unwrap() as u64;
            *counts.entry(vec![position(0), position(1)]).or_insert(0) += 1;
        }
        let statistic = chi_square(&counts, 240, trials);
        assert!(statistic < 350.0, "{statistic}");
    }

    #[test]
    fn traces_do_not_depend_on_keys() {
        for algorithm in ALGORITHMS {
            for mode in [SortMode::Sort, SortMode::Shuffle] {
                if algorithm == SortAlgorithm::OrShuffle && mode == SortMode::Sort {
                    continue;
                }
                let mut traces = Vec::new();
                for values in [vec![7u64; 150], (0..150).rev().collect()] {
                    let mut backend = TracingBackend::new();
                    let mut data = backend.allocate::<u64>(150).unwrap();
                    data.write_range(0, &values).unwrap();
                    backend.clear_trace();
                    let config = small_config(algorithm).with_bucket_capacity(32);
                    run(&mut data, &mut backend, &config, mode, &mut test_rng()).unwrap();
                    traces.push(backend.trace());
                }
                assert!(!traces[0].is_empty(), "{algorithm:?} {mode:?}");
                assert_eq!(traces[0], traces[1], "{algorithm:?} {mode:?}");
            }
        }
    }

    #[test]
    fn tiny_buckets_overflow() {
        let mut rng = test_rng();
        let input: Vec<u64> = (0..256).collect();
        let mut data = database_from(&input);
        let mut backend = MemoryBackend::default();
        let config = small_config(SortAlgorithm::MinIo).with_bucket_capacity(2);
        assert!(matches!(
            oblivious_sort(&mut data, &mut backend, &config, &mut rng),
            Err(ObliviousError::BucketOverflowError { capacity: 2 })
        ));
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let mut rng = test_rng();
        let mut data = database_from(&[3u64, 1, 2]);
        let mut backend = MemoryBackend::default();
        for config in [
            SortConfig::default().with_algorithm(SortAlgorithm::OrShuffle),
            SortConfig::default().with_way(3),
            SortConfig::default().with_way(128),
            SortConfig::default().with_bucket_capacity(1),
            SortConfig::default().with_memory_budget(0),
            SortConfig::default()
                .with_bucket_capacity(64)
                .with_memory_budget(100),
        ] {
            assert!(
                matches!(
                    oblivious_sort(&mut data, &mut backend, &config, &mut rng),
                    Err(ObliviousError::InvalidConfigurationError(_))
                ),
                "{config:?}"
            );
        }
        assert!(matches!(
            or_shuffle(
                &mut data,
                &mut backend,
                &SortConfig::default().with_memory_budget(2),
                &mut rng
            ),
            Err(ObliviousError::InvalidConfigurationError(_))
        ));
        assert_eq!(contents(&mut data), vec![3, 1, 2]);
    }
}

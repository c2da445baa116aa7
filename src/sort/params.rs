// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Bucket capacity sizing and the bucket layout of the butterfly network.

use super::merge_split::MAX_WAY;
use crate::ObliviousError;

/// Returns a bucket capacity `Z` such that, when `n` elements are routed through a butterfly
/// network whose buckets start half full, some bucket overflows with probability at most
/// `2^-security_bits`.
///
/// Each bucket receives `μ = Z / 2` elements in expectation at every level, and a
/// multiplicative Chernoff bound gives `P[X >= 2μ] <= e^(-μ/3)`. A union bound over at most
/// `64 n` (bucket, level) pairs is met by `μ = ⌈3 (λ ln 2 + ln(64 n))⌉`.
pub fn recommended_bucket_capacity(n: u64, security_bits: u32) -> usize {
    let events = 64.0 * (n.max(1) as f64);
    let mu = (3.0 * (f64::from(security_bits) * std::f64::consts::LN_2 + events.ln())).ceil();
    2 * (mu as usize)
}

/// The shape of a butterfly network: `bucket_count = way^levels` buckets of `bucket_capacity`
/// elements each, large enough to hold `n` elements at half load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketLayout {
    /// The number of real elements.
    pub n: u64,
    /// Elements per bucket, real and dummy.
    pub bucket_capacity: usize,
    /// The fan-out of each merge-split.
    pub way: usize,
    /// The number of merge-split levels.
    pub levels: u32,
    /// The number of buckets.
    pub bucket_count: usize,
}

impl BucketLayout {
    /// Returns the smallest layout with `way`-way merge-splits that holds `n` elements in buckets
    /// of `bucket_capacity` elements, each starting at most half full. There is always at least
    /// one level.
    ///
    /// # Errors
    ///
    /// `InvalidConfigurationError` if `way` is not a power of two in `2..=64`, or if
    /// `bucket_capacity` is less than 2.
    pub fn new(n: u64, bucket_capacity: usize, way: usize) -> Result<Self, ObliviousError> {
        if !way.is_power_of_two() || !(2..=MAX_WAY).contains(&way) {
            return Err(ObliviousError::InvalidConfigurationError(
                "the butterfly fan-out must be a power of two between 2 and 64",
            ));
        }
        if bucket_capacity < 2 {
            return Err(ObliviousError::InvalidConfigurationError(
                "buckets must hold at least 2 elements",
            ));
        }

        let half = u64::try_from(bucket_capacity / 2)?;
        let mut levels = 1;
        let mut bucket_count = way;
        while u64::try_from(bucket_count)?.saturating_mul(half) < n {
            bucket_count = bucket_count
                .checked_mul(way)
                .ok_or(ObliviousError::InvalidConfigurationError(
                    "too many buckets",
                ))?;
            levels += 1;
        }

        Ok(Self {
            n,
            bucket_capacity,
            way,
            levels,
            bucket_count,
        })
    }

    /// The number of bits of a tag consumed by each level.
    pub fn bits_per_level(&self) -> u32 {
        self.way.ilog2()
    }

    /// The total number of element slots.
    pub fn slot_count(&self) -> usize {
        self.bucket_count * self.bucket_capacity
    }

    /// The number of real elements initially placed in each bucket.
    pub fn initial_load(&self) -> Result<u64, ObliviousError> {
        Ok(self.n.div_ceil(u64::try_from(self.bucket_count)?))
    }

    /// The destination digit that `tag` selects at `level`.
    pub fn digit(&self, tag: u64, level: u32) -> u64 {
        let bits = self.bits_per_level();
        (tag >> (level * bits)) & ((1 << bits) - 1)
    }
}

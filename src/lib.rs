// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Oblivious external-memory data structures.
//!
//! This crate contains three layers whose storage access patterns are independent of the data
//! they process:
//!
//! - [`sort`]: oblivious sorting and shuffling of element sequences held in a [`Database`],
//!   built from merge-split networks over fixed-capacity buckets.
//! - [`PathOram`]: a doubly oblivious Path ORAM client with a recursive position map.
//! - [`ObliviousMap`]: an oblivious AVL search tree whose nodes live in a Path ORAM tree.
//!
//! All storage is obtained from an explicit [`StorageBackend`] handle.
//!
//! ## Minimal example
//!
//! ```
//! use oblivious_em::{MemoryBackend, ObliviousMap};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let mut backend = MemoryBackend::default();
//! let mut map = ObliviousMap::<u64>::new(64, &mut backend)?;
//! map.insert(7, 700, &mut rng)?;
//! assert_eq!(map.get(7, &mut rng)?, Some(700));
//! assert_eq!(map.get(8, &mut rng)?, None);
//! # Ok::<(), oblivious_em::ObliviousError>(())
//! ```

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use rand::{CryptoRng, RngCore};
use std::num::TryFromIntError;
use subtle::ConditionallySelectable;
use thiserror::Error;

pub mod backend;
pub mod block_value;
pub mod bucket;
pub mod counters;
pub mod database;
pub mod linear_time_oram;
pub mod omap;
pub mod path_oram;
pub mod position_map;
pub mod sort;
mod stash;
mod utils;

#[cfg(test)]
mod test_utils;

pub use crate::backend::{BackendError, MemoryBackend, StorageBackend, TracingBackend};
pub use crate::block_value::BlockValue;
pub use crate::database::{AccessEvent, AccessKind, Database, SimpleDatabase};
pub use crate::omap::ObliviousMap;
pub use crate::path_oram::{DefaultOram, PathOram};
pub use crate::sort::{
    oblivious_shuffle, oblivious_sort, PartitionMethod, SortAlgorithm, SortConfig, SortKey,
    SortMode, TaggedElement,
};

/// The numeric type used to specify the size of an ORAM block in bytes.
pub type BlockSize = usize;
/// The numeric type used to specify the size of an ORAM in blocks, and to index into the ORAM.
pub type Address = u64;
/// The numeric type used to specify the size of an ORAM bucket in blocks.
pub type BucketSize = usize;
/// Numeric type used to represent the size of a Path ORAM stash in blocks.
pub type StashSize = u64;
/// Numeric type used to represent the cutoff below which a position map stops recursing.
pub type RecursionCutoff = u64;

/// A "trait alias" for values that can be stored obliviously.
pub trait OramBlock:
    Copy + Clone + std::fmt::Debug + Default + PartialEq + ConditionallySelectable
{
}

/// Errors raised by the storage layer.
///
/// Configuration faults (`StashOverflowError`, `BucketOverflowError`) are fatal: the object that
/// raised them is left in an unspecified state and must be discarded.
#[derive(Error, Debug)]
pub enum ObliviousError {
    /// Errors arising from conversions between integer types.
    #[error("Arithmetic error encountered.")]
    IntegerConversionError(#[from] TryFromIntError),

    /// An attempt was made to access an address outside the declared capacity.
    #[error("Attempted to access address {attempted} of an object with capacity {capacity}.")]
    AddressOutOfBoundsError {
        /// The offending address.
        attempted: Address,
        /// The capacity of the accessed object.
        capacity: Address,
    },

    /// The parameters supplied at construction or call time are inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfigurationError(&'static str),

    /// A caller-supplied input is malformed.
    #[error("Invalid input: {0}")]
    InvalidInputError(&'static str),

    /// A Path ORAM stash held more blocks than its overflow region after eviction.
    #[error("Stash overflow: more than {capacity} blocks could not be evicted.")]
    StashOverflowError {
        /// The configured stash overflow size.
        capacity: StashSize,
    },

    /// A merge-split would have placed more than `capacity` real elements in one bucket.
    #[error("Bucket overflow: a bucket received more than {capacity} real elements.")]
    BucketOverflowError {
        /// The configured bucket capacity.
        capacity: usize,
    },

    /// An oblivious map is full.
    #[error("Map capacity of {capacity} entries exceeded.")]
    MapCapacityError {
        /// The capacity declared at construction.
        capacity: u64,
    },

    /// Bulk construction of an oblivious map received the same key twice.
    #[error("Duplicate key in bulk construction input.")]
    DuplicateKeyError,

    /// The storage backend failed.
    #[error(transparent)]
    BackendError(#[from] BackendError),
}

/// Represents an oblivious RAM (ORAM) mapping addresses of type `Address` to values of type `V: OramBlock`.
pub trait Oram
where
    Self: Sized,
{
    /// The type of the values stored by this `Oram`.
    type V: OramBlock;

    /// Returns the capacity in blocks of this ORAM.
    fn block_capacity(&self) -> Result<Address, ObliviousError>;

    /// Performs a (oblivious) ORAM access.
    /// Returns the value `v` previously stored at `index`, and writes `callback(v)` to `index`.
    ///
    /// For updating a block in place, using `access` is likely to be about twice as efficient
    /// as performing a `read` followed by a `write`.
    fn access<R: RngCore + CryptoRng, F: Fn(&Self::V) -> Self::V>(
        &mut self,
        index: Address,
        callback: F,
        rng: &mut R,
    ) -> Result<Self::V, ObliviousError>;

    /// Obliviously reads the value stored at `index`.
    fn read<R: RngCore + CryptoRng>(
        &mut self,
        index: Address,
        rng: &mut R,
    ) -> Result<Self::V, ObliviousError> {
        log::debug!("ORAM read: {}", index);
        let callback = |x: &Self::V| *x;
        self.access(index, callback, rng)
    }

    /// Obliviously writes the value stored at `index`. Returns the value previously stored at `index`.
    fn write<R: RngCore + CryptoRng>(
        &mut self,
        index: Address,
        new_value: Self::V,
        rng: &mut R,
    ) -> Result<Self::V, ObliviousError> {
        log::debug!("ORAM write: {}", index);
        let callback = |_: &Self::V| new_value;
        self.access(index, callback, rng)
    }
}

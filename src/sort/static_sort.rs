// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Fixed-size sorting networks computed at compile time.

use crate::{
    counters,
    utils::{apply_network_by, apply_network_by_keys, bitonic_network, Comparator},
};
use subtle::{Choice, ConditionallySelectable, ConstantTimeLess};

/// The largest input size with a compile-time network.
pub const MAX_STATIC_SORT_SIZE: usize = 8;

// Bose-Nelson needs 19 comparators for 8 items.
const MAX_COMPARATORS: usize = 32;

/// A comparator network stored inline, so that it can be built in a `const` context.
#[derive(Clone, Copy, Debug)]
pub struct Network {
    pairs: [(u8, u8); MAX_COMPARATORS],
    len: usize,
}

impl Network {
    const EMPTY: Self = Self {
        pairs: [(0, 0); MAX_COMPARATORS],
        len: 0,
    };

    const fn push(mut self, low: usize, high: usize) -> Self {
        self.pairs[self.len] = (low as u8, high as u8);
        self.len += 1;
        self
    }

    /// The number of comparators in the network.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the network has no comparators.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The comparators of the network, in execution order.
    pub(crate) fn comparators(&self) -> impl Iterator<Item = Comparator> + '_ {
        self.pairs[..self.len]
            .iter()
            .map(|&(low, high)| Comparator::ascending(low.into(), high.into()))
    }
}

const fn bose_nelson_merge(
    network: Network,
    start1: usize,
    size1: usize,
    start2: usize,
    size2: usize,
) -> Network {
    if size1 == 0 || size2 == 0 {
        network
    } else if size1 == 1 && size2 == 1 {
        network.push(start1, start2)
    } else if size1 == 1 && size2 == 2 {
        network.push(start1, start2 + 1).push(start1, start2)
    } else if size1 == 2 && size2 == 1 {
        network.push(start1, start2).push(start1 + 1, start2)
    } else {
        let s1 = size1 / 2;
        let s2 = if size1 % 2 == 0 {
            (size2 + 1) / 2
        } else {
            size2 / 2
        };
        let network = bose_nelson_merge(network, start1, s1, start2, s2);
        let network = bose_nelson_merge(network, start1 + s1, size1 - s1, start2 + s2, size2 - s2);
        bose_nelson_merge(network, start1 + s1, size1 - s1, start2, s2)
    }
}

const fn bose_nelson_sort(network: Network, start: usize, size: usize) -> Network {
    if size <= 1 {
        return network;
    }
    let half = size / 2;
    let network = bose_nelson_sort(network, start, half);
    let network = bose_nelson_sort(network, start + half, size - half);
    bose_nelson_merge(network, start, half, start + half, size - half)
}

/// Returns the Bose-Nelson sorting network on `n <= 8` items.
pub const fn bose_nelson(n: usize) -> Network {
    assert!(n <= MAX_STATIC_SORT_SIZE);
    bose_nelson_sort(Network::EMPTY, 0, n)
}

const NETWORKS: [Network; MAX_STATIC_SORT_SIZE + 1] = [
    bose_nelson(0),
    bose_nelson(1),
    bose_nelson(2),
    bose_nelson(3),
    bose_nelson(4),
    bose_nelson(5),
    bose_nelson(6),
    bose_nelson(7),
    bose_nelson(8),
];

/// An oblivious sorting network for arrays of `N <= 8` elements. Every comparator is executed.
#[derive(Debug)]
pub struct StaticSort<const N: usize>;

impl<const N: usize> StaticSort<N> {
    /// The network, fixed at compile time.
    pub const NETWORK: Network = bose_nelson(N);

    /// Sorts `items` in ascending order under the strict order `lt`.
    pub fn sort_by<T: ConditionallySelectable, F: Fn(&T, &T) -> Choice>(items: &mut [T; N], lt: F) {
        let network = Self::NETWORK;
        for comparator in network.comparators() {
            let swap =
                comparator.ct_should_swap(&items[comparator.low], &items[comparator.high], &lt);
            let (head, tail) = items.split_at_mut(comparator.high);
            T::conditional_swap(&mut head[comparator.low], &mut tail[0], swap);
        }
        counters::record_swaps(network.len() as u64);
    }

    /// Sorts `items` in ascending order of `keys`, permuting `keys` alongside.
    pub fn sort_by_keys<T: ConditionallySelectable, K: ConditionallySelectable + ConstantTimeLess>(
        items: &mut [T; N],
        keys: &mut [K; N],
    ) {
        let network: Vec<Comparator> = Self::NETWORK.comparators().collect();
        apply_network_by_keys(items, keys, &network);
    }
}

/// Returns a sorting network on `n` items: the compile-time network when `n <= 8`, and a
/// bitonic network otherwise.
pub(crate) fn sorting_network(n: usize) -> Vec<Comparator> {
    match NETWORKS.get(n) {
        Some(network) => network.comparators().collect(),
        None => bitonic_network(n),
    }
}

/// Sorts a slice of any length in ascending order under `lt`, using the compile-time network
/// for its length when there is one.
pub fn sort_small_by<T: ConditionallySelectable, F: Fn(&T, &T) -> Choice>(items: &mut [T], lt: F) {
    apply_network_by(items, &sorting_network(items.len()), lt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    fn lt(a: &u64, b: &u64) -> Choice {
        a.ct_lt(b)
    }

    #[test]
    fn network_sizes() {
        assert!(StaticSort::<0>::NETWORK.is_empty());
        assert_eq!(StaticSort::<2>::NETWORK.len(), 1);
        assert_eq!(StaticSort::<4>::NETWORK.len(), 5);
        assert_eq!(StaticSort::<8>::NETWORK.len(), 19);
    }

    #[test]
    fn small_networks_sort_all_zero_one_inputs() {
        for n in 0..=MAX_STATIC_SORT_SIZE {
            let network = sorting_network(n);
            for bits in 0u32..(1 << n) {
                let mut items: Vec<u64> = (0..n).map(|i| u64::from((bits >> i) & 1)).collect();
                apply_network_by(&mut items, &network, lt);
                assert!(items.windows(2).all(|w| w[0] <= w[1]), "{n} {bits}");
            }
        }
    }

    #[test]
    fn static_sort_by() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut items: [u64; 7] = [5, 3, 9, 1, 1, 0, 7];
        for _ in 0..20 {
            items.shuffle(&mut rng);
            StaticSort::<7>::sort_by(&mut items, lt);
            assert_eq!(items, [0, 1, 1, 3, 5, 7, 9]);
        }
    }

    #[test]
    fn static_sort_by_keys() {
        let mut items = [b'c', b'a', b'd', b'b'];
        let mut keys = [30u64, 10, 40, 20];
        StaticSort::<4>::sort_by_keys(&mut items, &mut keys);
        assert_eq!(&items, b"abcd");
        assert_eq!(keys, [10, 20, 30, 40]);
    }

    #[test]
    fn sort_small_by_falls_back_to_bitonic() {
        let mut items: Vec<u64> = (0..20).rev().collect();
        sort_small_by(&mut items, lt);
        assert_eq!(items, (0..20).collect::<Vec<_>>());
    }
}

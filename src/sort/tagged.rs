// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Tagged elements: payloads padded with dummies so that buckets have a fixed size.

use crate::OramBlock;
use duplicate::duplicate_item;
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeLess};

/// Values with a 64-bit key under which they can be sorted obliviously.
pub trait SortKey {
    /// The key of this value. Values are sorted in ascending key order.
    fn sort_key(&self) -> u64;
}

#[duplicate_item(int_type; [u8]; [u16]; [u32]; [u64])]
impl SortKey for int_type {
    fn sort_key(&self) -> u64 {
        u64::from(*self)
    }
}

/// A payload together with a tag and a dummy flag.
///
/// The tag routes the element through merge-split networks; in shuffles it holds random bits.
/// Dummy elements sort after every real element, whatever their tag or key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaggedElement<T> {
    /// The caller's value. Meaningless for dummies.
    pub payload: T,
    /// The routing tag.
    pub tag: u64,
    dummy: u8,
}

impl<T: OramBlock> TaggedElement<T> {
    /// Wraps a real `payload` with `tag`.
    pub fn real(payload: T, tag: u64) -> Self {
        Self {
            payload,
            tag,
            dummy: 0,
        }
    }

    /// Returns a dummy element.
    pub fn dummy() -> Self {
        Self {
            payload: T::default(),
            tag: 0,
            dummy: 1,
        }
    }

    /// Whether `self` is padding.
    pub fn ct_is_dummy(&self) -> Choice {
        self.dummy.ct_eq(&1)
    }

    /// Whether `self` is padding. Not constant-time.
    pub fn is_dummy(&self) -> bool {
        self.dummy == 1
    }

    pub(crate) fn set_dummy(&mut self, choice: Choice) {
        self.dummy.conditional_assign(&1, choice);
    }
}

impl<T: OramBlock> Default for TaggedElement<T> {
    fn default() -> Self {
        Self::dummy()
    }
}

impl<T: ConditionallySelectable> ConditionallySelectable for TaggedElement<T> {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        Self {
            payload: T::conditional_select(&a.payload, &b.payload, choice),
            tag: u64::conditional_select(&a.tag, &b.tag, choice),
            dummy: u8::conditional_select(&a.dummy, &b.dummy, choice),
        }
    }
}

impl<T: OramBlock> OramBlock for TaggedElement<T> {}

// (dummy, x) < (dummy', x'), lexicographically.
fn ct_lt_with_dummies(a_dummy: u8, a: u64, b_dummy: u8, b: u64) -> Choice {
    a_dummy.ct_lt(&b_dummy) | (a_dummy.ct_eq(&b_dummy) & a.ct_lt(&b))
}

/// Orders real elements by key, then dummies.
pub(crate) fn ct_lt_by_key<T: OramBlock + SortKey>(
    a: &TaggedElement<T>,
    b: &TaggedElement<T>,
) -> Choice {
    ct_lt_with_dummies(a.dummy, a.payload.sort_key(), b.dummy, b.payload.sort_key())
}

/// Orders real elements by tag, then dummies.
pub(crate) fn ct_lt_by_tag<T: OramBlock>(a: &TaggedElement<T>, b: &TaggedElement<T>) -> Choice {
    ct_lt_with_dummies(a.dummy, a.tag, b.dummy, b.tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummies_sort_last() {
        let real = TaggedElement::real(u64::MAX, u64::MAX);
        let dummy = TaggedElement::<u64>::dummy();
        assert!(bool::from(ct_lt_by_key(&real, &dummy)));
        assert!(!bool::from(ct_lt_by_key(&dummy, &real)));
        assert!(bool::from(ct_lt_by_tag(&real, &dummy)));
        assert!(!bool::from(ct_lt_by_tag(&dummy, &dummy)));
    }

    #[test]
    fn reals_compare_by_key_or_tag() {
        let a = TaggedElement::real(3u32, 9);
        let b = TaggedElement::real(5u32, 1);
        assert!(bool::from(ct_lt_by_key(&a, &b)));
        assert!(bool::from(ct_lt_by_tag(&b, &a)));
    }

    #[test]
    fn select_and_set_dummy() {
        let a = TaggedElement::real(3u32, 9);
        let b = TaggedElement::dummy();
        assert_eq!(TaggedElement::conditional_select(&a, &b, 1.into()), b);
        let mut c = a;
        c.set_dummy(0.into());
        assert!(!c.is_dummy());
        c.set_dummy(1.into());
        assert!(c.is_dummy());
        assert_eq!(TaggedElement::<u32>::default(), b);
    }
}

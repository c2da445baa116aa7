// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Search tree nodes stored as ORAM blocks.

use crate::{sort::SortKey, utils::TreeIndex, Address, OramBlock};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeGreater};

/// A pointer to a subtree: the ORAM address and leaf position of its root, and its height.
/// Address 0 is the empty subtree, of height 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ChildRef {
    pub address: Address,
    pub position: TreeIndex,
    pub height: u64,
}

impl ChildRef {
    pub fn ct_is_null(&self) -> Choice {
        self.address.ct_eq(&0)
    }
}

impl ConditionallySelectable for ChildRef {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        Self {
            address: Address::conditional_select(&a.address, &b.address, choice),
            position: TreeIndex::conditional_select(&a.position, &b.position, choice),
            height: u64::conditional_select(&a.height, &b.height, choice),
        }
    }
}

/// A search tree node. Erased keys keep their node, marked `deleted`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Node<V> {
    pub key: u64,
    pub value: V,
    pub left: ChildRef,
    pub right: ChildRef,
    pub deleted: u8,
}

impl<V: OramBlock> Node<V> {
    pub fn leaf(key: u64, value: V) -> Self {
        Self {
            key,
            value,
            ..Self::default()
        }
    }

    pub fn ct_is_deleted(&self) -> Choice {
        self.deleted.ct_eq(&1)
    }

    pub fn height(&self) -> u64 {
        let left_taller = self.left.height.ct_gt(&self.right.height);
        1 + u64::conditional_select(&self.right.height, &self.left.height, left_taller)
    }

    /// Whether the left subtree is at least two levels taller than the right one.
    pub fn ct_left_heavy(&self) -> Choice {
        self.left.height.ct_gt(&(self.right.height + 1))
    }

    pub fn ct_right_heavy(&self) -> Choice {
        self.right.height.ct_gt(&(self.left.height + 1))
    }
}

impl<V: ConditionallySelectable> ConditionallySelectable for Node<V> {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        Self {
            key: u64::conditional_select(&a.key, &b.key, choice),
            value: V::conditional_select(&a.value, &b.value, choice),
            left: ChildRef::conditional_select(&a.left, &b.left, choice),
            right: ChildRef::conditional_select(&a.right, &b.right, choice),
            deleted: u8::conditional_select(&a.deleted, &b.deleted, choice),
        }
    }
}

impl<V: OramBlock> OramBlock for Node<V> {}

/// A key-value pair, sorted by key during bulk construction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct MapEntry<V> {
    pub key: u64,
    pub value: V,
}

impl<V: ConditionallySelectable> ConditionallySelectable for MapEntry<V> {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        Self {
            key: u64::conditional_select(&a.key, &b.key, choice),
            value: V::conditional_select(&a.value, &b.value, choice),
        }
    }
}

impl<V: OramBlock> OramBlock for MapEntry<V> {}

impl<V> SortKey for MapEntry<V> {
    fn sort_key(&self) -> u64 {
        self.key
    }
}

// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Relinking and rebalancing a cached root-to-node path of an AVL tree.

use super::node::{ChildRef, Node};
use crate::{utils::TreeIndex, Address, OramBlock};
use subtle::{Choice, ConditionallySelectable, ConstantTimeGreater, ConstantTimeLess};

/// A node removed from the ORAM tree during a walk, with the leaf it will be written back to.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot<V> {
    pub node: Node<V>,
    pub address: Address,
    pub position: TreeIndex,
    pub real: Choice,
}

impl<V: OramBlock> Slot<V> {
    pub fn empty() -> Self {
        Self {
            node: Node::default(),
            address: 0,
            position: 0,
            real: Choice::from(0),
        }
    }

    // A pointer to this slot's node, as it will be after write-back.
    fn reference_to(&self, node: &Node<V>) -> ChildRef {
        ChildRef {
            address: self.address,
            position: self.position,
            height: node.height(),
        }
    }
}

/// Points every real slot of `slots` at the slot below it, where the real slots form a prefix
/// and each is the parent of the next. When `rebalance` is set, the lowest unbalanced node is
/// rotated. Returns the pointer to the new root of the path, meaningful if `slots[0]` is real.
///
/// Every slot is processed and every rotation candidate is computed, whatever the flags.
pub(crate) fn relink_path<V: OramBlock>(slots: &mut [Slot<V>], rebalance: Choice) -> ChildRef {
    let mut carry = ChildRef::default();
    let mut carry_key = 0u64;
    for index in (0..slots.len()).rev() {
        let real = slots[index].real;
        let has_child = match slots.get(index + 1) {
            Some(child) => child.real,
            None => Choice::from(0),
        };

        let node = &mut slots[index].node;
        let child_is_left = carry_key.ct_lt(&node.key);
        node.left.conditional_assign(&carry, has_child & child_is_left);
        node.right.conditional_assign(&carry, has_child & !child_is_left);

        let (subtree, subtree_key) = rotate_at(slots, index, rebalance & has_child);
        carry.conditional_assign(&subtree, real);
        carry_key.conditional_assign(&subtree_key, real);
    }
    carry
}

// Rotates the subtree rooted at `slots[index]` if it is unbalanced and `enabled` is set, using
// the next two slots as its child and grandchild. Returns the pointer to the subtree's root and
// the root's key.
fn rotate_at<V: OramBlock>(
    slots: &mut [Slot<V>],
    index: usize,
    enabled: Choice,
) -> (ChildRef, u64) {
    let z = slots[index];
    let mut root = z.reference_to(&z.node);
    let mut root_key = z.node.key;
    if index + 1 >= slots.len() {
        return (root, root_key);
    }
    let y = slots[index + 1];
    let x = slots.get(index + 2).copied().unwrap_or_else(Slot::empty);

    let left_heavy = enabled & z.node.ct_left_heavy();
    let right_heavy = enabled & z.node.ct_right_heavy();
    let y_left_taller = y.node.left.height.ct_gt(&y.node.right.height);
    let y_right_taller = y.node.right.height.ct_gt(&y.node.left.height);
    let left_left = left_heavy & !y_right_taller;
    let left_right = left_heavy & y_right_taller;
    let right_right = right_heavy & !y_left_taller;
    let right_left = right_heavy & y_left_taller;

    let mut new_z = z.node;
    let mut new_y = y.node;
    let mut new_x = x.node;

    // Right rotation at z.
    {
        let mut z1 = z.node;
        z1.left = y.node.right;
        let mut y1 = y.node;
        y1.right = z.reference_to(&z1);
        new_z.conditional_assign(&z1, left_left);
        new_y.conditional_assign(&y1, left_left);
        root.conditional_assign(&y.reference_to(&y1), left_left);
        root_key.conditional_assign(&y.node.key, left_left);
    }
    // Left rotation at z.
    {
        let mut z1 = z.node;
        z1.right = y.node.left;
        let mut y1 = y.node;
        y1.left = z.reference_to(&z1);
        new_z.conditional_assign(&z1, right_right);
        new_y.conditional_assign(&y1, right_right);
        root.conditional_assign(&y.reference_to(&y1), right_right);
        root_key.conditional_assign(&y.node.key, right_right);
    }
    // Left rotation at y, then right rotation at z.
    {
        let mut y1 = y.node;
        y1.right = x.node.left;
        let mut z1 = z.node;
        z1.left = x.node.right;
        let mut x1 = x.node;
        x1.left = y.reference_to(&y1);
        x1.right = z.reference_to(&z1);
        new_z.conditional_assign(&z1, left_right);
        new_y.conditional_assign(&y1, left_right);
        new_x.conditional_assign(&x1, left_right);
        root.conditional_assign(&x.reference_to(&x1), left_right);
        root_key.conditional_assign(&x.node.key, left_right);
    }
    // Right rotation at y, then left rotation at z.
    {
        let mut y1 = y.node;
        y1.left = x.node.right;
        let mut z1 = z.node;
        z1.right = x.node.left;
        let mut x1 = x.node;
        x1.right = y.reference_to(&y1);
        x1.left = z.reference_to(&z1);
        new_z.conditional_assign(&z1, right_left);
        new_y.conditional_assign(&y1, right_left);
        new_x.conditional_assign(&x1, right_left);
        root.conditional_assign(&x.reference_to(&x1), right_left);
        root_key.conditional_assign(&x.node.key, right_left);
    }

    slots[index].node = new_z;
    slots[index + 1].node = new_y;
    if let Some(slot) = slots.get_mut(index + 2) {
        slot.node = new_x;
    }
    (root, root_key)
}

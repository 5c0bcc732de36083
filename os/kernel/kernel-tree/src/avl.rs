use core::cmp::Ordering;

use crate::TreeError;
use crate::arena::{Arena, Handle};

/// Reference to a tree node. Stale once the node is removed or its content
/// moves during a removal.
pub type NodeId = Handle;

struct Node<K, V> {
    key: K,
    value: V,
    left: Option<u32>,
    right: Option<u32>,
    height: i32,
}

/// Height-balanced binary search tree with unique keys.
///
/// Nodes live in an [`Arena`]; links are plain slot indices. Lookups hand out
/// [`NodeId`]s that stay valid until the next removal touching that node.
pub struct AvlTree<K, V> {
    nodes: Arena<Node<K, V>>,
    root: Option<u32>,
}

impl<K: Ord + Copy, V> Default for AvlTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Copy, V> AvlTree<K, V> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Arena::new(),
            root: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Height of the tree; zero when empty.
    #[must_use]
    pub fn height(&self) -> i32 {
        self.height_of(self.root)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
    }

    /// Insert a new key.
    ///
    /// # Errors
    /// - [`TreeError::DuplicateKey`] if `key` is present; the tree is unchanged.
    /// - [`TreeError::OutOfMemory`] if no node can be allocated.
    pub fn insert(&mut self, key: K, value: V) -> Result<NodeId, TreeError> {
        if self.find_exact(&key).is_some() {
            return Err(TreeError::DuplicateKey);
        }

        let id = self.nodes.insert(Node {
            key,
            value,
            left: None,
            right: None,
            height: 1,
        })?;
        self.root = Some(self.attach(self.root, id.index()));
        Ok(id)
    }

    /// Remove the node `id` refers to.
    pub fn remove(&mut self, id: NodeId) -> Option<(K, V)> {
        let key = *self.key(id)?;
        self.remove_key(&key)
    }

    /// Remove the node holding `key`.
    ///
    /// If the node has two children, its in-order successor's entry moves into
    /// it and the successor's slot is freed. Ids to either node go stale.
    pub fn remove_key(&mut self, key: &K) -> Option<(K, V)> {
        let root = self.root?;
        self.find_exact(key)?;
        let (root, entry) = self.detach(root, key);
        self.root = root;
        Some(entry)
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<(&K, &V)> {
        self.nodes.get(id).map(|n| (&n.key, &n.value))
    }

    #[must_use]
    pub fn key(&self, id: NodeId) -> Option<&K> {
        self.nodes.get(id).map(|n| &n.key)
    }

    #[must_use]
    pub fn value(&self, id: NodeId) -> Option<&V> {
        self.nodes.get(id).map(|n| &n.value)
    }

    /// Mutable access to a value. Keys are immutable since they fix the node's position.
    pub fn value_mut(&mut self, id: NodeId) -> Option<&mut V> {
        self.nodes.get_mut(id).map(|n| &mut n.value)
    }

    #[must_use]
    pub fn find_exact(&self, key: &K) -> Option<NodeId> {
        let mut cursor = self.root;
        while let Some(i) = cursor {
            let node = self.nodes.at(i);
            cursor = match key.cmp(&node.key) {
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
                Ordering::Equal => return Some(self.nodes.handle_at(i)),
            };
        }
        None
    }

    /// Node with the smallest key `>= key`.
    #[must_use]
    pub fn find_greater_or_equal(&self, key: &K) -> Option<NodeId> {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(i) = cursor {
            let node = self.nodes.at(i);
            if node.key >= *key {
                best = Some(i);
                cursor = node.left;
            } else {
                cursor = node.right;
            }
        }
        best.map(|i| self.nodes.handle_at(i))
    }

    /// Node with the largest key `< key`.
    #[must_use]
    pub fn find_less(&self, key: &K) -> Option<NodeId> {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(i) = cursor {
            let node = self.nodes.at(i);
            if node.key < *key {
                best = Some(i);
                cursor = node.right;
            } else {
                cursor = node.left;
            }
        }
        best.map(|i| self.nodes.handle_at(i))
    }

    /// Node with the smallest key.
    #[must_use]
    pub fn first(&self) -> Option<NodeId> {
        let mut cursor = self.root?;
        while let Some(left) = self.nodes.at(cursor).left {
            cursor = left;
        }
        Some(self.nodes.handle_at(cursor))
    }

    /// In-order iteration.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            next: self.first().map(Handle::index),
        }
    }

    /// Assert ordering, stored heights, the balance factor and the node count.
    ///
    /// # Panics
    /// If any of them is violated.
    pub fn check_invariants(&self) {
        let (_, count) = self.check_subtree(self.root, None, None);
        assert_eq!(count, self.len(), "node count does not match arena length");
    }

    fn check_subtree(&self, link: Option<u32>, low: Option<K>, high: Option<K>) -> (i32, usize) {
        let Some(i) = link else {
            return (0, 0);
        };
        let node = self.nodes.at(i);
        if let Some(low) = low {
            assert!(node.key > low, "in-order keys must be strictly increasing");
        }
        if let Some(high) = high {
            assert!(node.key < high, "in-order keys must be strictly increasing");
        }
        let (lh, lc) = self.check_subtree(node.left, low, Some(node.key));
        let (rh, rc) = self.check_subtree(node.right, Some(node.key), high);
        assert!((lh - rh).abs() <= 1, "subtree heights differ by more than one");
        assert_eq!(node.height, 1 + lh.max(rh), "stale height");
        (node.height, lc + rc + 1)
    }

    fn find_greater(&self, key: &K) -> Option<u32> {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(i) = cursor {
            let node = self.nodes.at(i);
            if node.key > *key {
                best = Some(i);
                cursor = node.left;
            } else {
                cursor = node.right;
            }
        }
        best
    }

    fn height_of(&self, link: Option<u32>) -> i32 {
        link.map_or(0, |i| self.nodes.at(i).height)
    }

    fn update_height(&mut self, i: u32) {
        let node = self.nodes.at(i);
        let height = 1 + self.height_of(node.left).max(self.height_of(node.right));
        self.nodes.at_mut(i).height = height;
    }

    fn balance_of(&self, i: u32) -> i32 {
        let node = self.nodes.at(i);
        self.height_of(node.left) - self.height_of(node.right)
    }

    fn rotate_right(&mut self, i: u32) -> u32 {
        let Some(pivot) = self.nodes.at(i).left else {
            unreachable!("right rotation without a left child");
        };
        self.nodes.at_mut(i).left = self.nodes.at(pivot).right;
        self.nodes.at_mut(pivot).right = Some(i);
        self.update_height(i);
        self.update_height(pivot);
        pivot
    }

    fn rotate_left(&mut self, i: u32) -> u32 {
        let Some(pivot) = self.nodes.at(i).right else {
            unreachable!("left rotation without a right child");
        };
        self.nodes.at_mut(i).right = self.nodes.at(pivot).left;
        self.nodes.at_mut(pivot).left = Some(i);
        self.update_height(i);
        self.update_height(pivot);
        pivot
    }

    /// Recompute the height of `i` and restore balance; returns the new subtree root.
    fn rebalance(&mut self, i: u32) -> u32 {
        self.update_height(i);
        let balance = self.balance_of(i);

        if balance > 1 {
            if let Some(left) = self.nodes.at(i).left
                && self.balance_of(left) < 0
            {
                let rotated = self.rotate_left(left);
                self.nodes.at_mut(i).left = Some(rotated);
            }
            return self.rotate_right(i);
        }

        if balance < -1 {
            if let Some(right) = self.nodes.at(i).right
                && self.balance_of(right) > 0
            {
                let rotated = self.rotate_right(right);
                self.nodes.at_mut(i).right = Some(rotated);
            }
            return self.rotate_left(i);
        }

        i
    }

    fn attach(&mut self, at: Option<u32>, new: u32) -> u32 {
        let Some(i) = at else {
            return new;
        };
        if self.nodes.at(new).key < self.nodes.at(i).key {
            let left = self.attach(self.nodes.at(i).left, new);
            self.nodes.at_mut(i).left = Some(left);
        } else {
            let right = self.attach(self.nodes.at(i).right, new);
            self.nodes.at_mut(i).right = Some(right);
        }
        self.rebalance(i)
    }

    /// Remove `key` from the subtree at `i`. The key must be present.
    fn detach(&mut self, i: u32, key: &K) -> (Option<u32>, (K, V)) {
        let node = self.nodes.at(i);
        match key.cmp(&node.key) {
            Ordering::Less => {
                let Some(left) = node.left else {
                    unreachable!("detached key is not in the tree");
                };
                let (left, entry) = self.detach(left, key);
                self.nodes.at_mut(i).left = left;
                (Some(self.rebalance(i)), entry)
            }
            Ordering::Greater => {
                let Some(right) = node.right else {
                    unreachable!("detached key is not in the tree");
                };
                let (right, entry) = self.detach(right, key);
                self.nodes.at_mut(i).right = right;
                (Some(self.rebalance(i)), entry)
            }
            Ordering::Equal => match (node.left, node.right) {
                (Some(_), Some(right)) => {
                    let (right, successor) = self.detach_min(right);
                    let successor = self.nodes.remove_at(successor);
                    let target = self.nodes.at_mut(i);
                    target.right = right;
                    let key = core::mem::replace(&mut target.key, successor.key);
                    let value = core::mem::replace(&mut target.value, successor.value);
                    self.nodes.retag(i);
                    (Some(self.rebalance(i)), (key, value))
                }
                (left, right) => {
                    let removed = self.nodes.remove_at(i);
                    (left.or(right), (removed.key, removed.value))
                }
            },
        }
    }

    /// Unlink the minimum of the subtree at `i`; returns the new subtree root
    /// and the still-allocated slot of the minimum.
    fn detach_min(&mut self, i: u32) -> (Option<u32>, u32) {
        match self.nodes.at(i).left {
            None => (self.nodes.at(i).right, i),
            Some(left) => {
                let (left, min) = self.detach_min(left);
                self.nodes.at_mut(i).left = left;
                (Some(self.rebalance(i)), min)
            }
        }
    }
}

/// In-order iterator over `(key, value)` pairs.
pub struct Iter<'a, K, V> {
    tree: &'a AvlTree<K, V>,
    next: Option<u32>,
}

impl<'a, K: Ord + Copy, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next?;
        let node = self.tree.nodes.at(i);
        self.next = self.tree.find_greater(&node.key);
        Some((&node.key, &node.value))
    }
}

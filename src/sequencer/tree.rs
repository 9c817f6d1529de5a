//! Arena-backed AVL tree keyed by an integer level index.
//!
//! [`BalancedIndexTree`] stores its nodes in a flat `Vec` and links them with
//! `u32` slot indices, so parent back-references are plain handles rather
//! than aliased pointers. Removed slots go on a free list and are reused by
//! later inserts.
//!
//! Heights count nodes: a leaf has height 1 and an empty subtree height 0.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

const NIL: u32 = u32::MAX;

/// Stable handle to a node of a [`BalancedIndexTree`].
///
/// A handle stays valid until the node's key is removed; after that the
/// slot may be reused for another key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Raw slot index.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
struct Node<T> {
    key: i64,
    height: u32,
    left: u32,
    right: u32,
    parent: u32,
    /// `None` marks a free slot.
    value: Option<T>,
}

/// A self-balancing binary search tree of `T` values keyed by `i64`.
///
/// Inserting an existing key is a no-op that returns the existing node.
/// All operations are O(log n); walking the whole tree with
/// [`next`](Self::next) is amortised O(1) per step.
#[derive(Debug, Clone)]
pub struct BalancedIndexTree<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    root: u32,
    len: usize,
}

impl<T> Default for BalancedIndexTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BalancedIndexTree<T> {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    /// Creates an empty tree with room for `capacity` nodes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    /// Number of keys in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes every node and forgets all handles.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = NIL;
        self.len = 0;
    }

    // ─── lookup ────────────────────────────────────────────────────────────

    /// Handle of the node holding `key`.
    #[must_use]
    pub fn find(&self, key: i64) -> Option<NodeId> {
        let mut cur = self.root;
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            cur = match key.cmp(&node.key) {
                std::cmp::Ordering::Less => node.left,
                std::cmp::Ordering::Greater => node.right,
                std::cmp::Ordering::Equal => return Some(NodeId(cur)),
            };
        }
        None
    }

    /// Value stored under `key`.
    #[must_use]
    pub fn get(&self, key: i64) -> Option<&T> {
        self.find(key).and_then(|id| self.value(id))
    }

    /// Mutable value stored under `key`.
    pub fn get_mut(&mut self, key: i64) -> Option<&mut T> {
        let id = self.find(key)?;
        self.value_mut(id)
    }

    /// Key and value of the node behind `id`.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<(i64, &T)> {
        let node = self.nodes.get(id.0 as usize)?;
        node.value.as_ref().map(|v| (node.key, v))
    }

    /// Value of the node behind `id`.
    #[must_use]
    pub fn value(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(id.0 as usize)?.value.as_ref()
    }

    /// Mutable value of the node behind `id`.
    pub fn value_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id.0 as usize)?.value.as_mut()
    }

    /// Key of the node behind `id`.
    #[must_use]
    pub fn key(&self, id: NodeId) -> Option<i64> {
        self.node(id).map(|(k, _)| k)
    }

    /// Height of the node holding `key` (a leaf has height 1).
    #[must_use]
    pub fn height(&self, key: i64) -> Option<u32> {
        self.find(key).map(|id| self.nodes[id.0 as usize].height)
    }

    /// Handle of the smallest key.
    #[must_use]
    pub fn first(&self) -> Option<NodeId> {
        (self.root != NIL).then(|| NodeId(self.min_from(self.root)))
    }

    /// Handle of the largest key.
    #[must_use]
    pub fn last(&self) -> Option<NodeId> {
        (self.root != NIL).then(|| NodeId(self.max_from(self.root)))
    }

    /// In-order successor of `id`.
    #[must_use]
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?;
        let node = &self.nodes[id.0 as usize];
        if node.right != NIL {
            return Some(NodeId(self.min_from(node.right)));
        }
        let mut child = id.0;
        let mut parent = node.parent;
        while parent != NIL && self.nodes[parent as usize].right == child {
            child = parent;
            parent = self.nodes[parent as usize].parent;
        }
        (parent != NIL).then_some(NodeId(parent))
    }

    /// In-order predecessor of `id`.
    #[must_use]
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?;
        let node = &self.nodes[id.0 as usize];
        if node.left != NIL {
            return Some(NodeId(self.max_from(node.left)));
        }
        let mut child = id.0;
        let mut parent = node.parent;
        while parent != NIL && self.nodes[parent as usize].left == child {
            child = parent;
            parent = self.nodes[parent as usize].parent;
        }
        (parent != NIL).then_some(NodeId(parent))
    }

    /// Ascending iterator over `(key, &value)`.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            tree: self,
            cursor: self.first(),
            ascending: true,
        }
    }

    /// Descending iterator over `(key, &value)`.
    pub fn iter_rev(&self) -> Iter<'_, T> {
        Iter {
            tree: self,
            cursor: self.last(),
            ascending: false,
        }
    }

    /// Ascending list of keys.
    #[must_use]
    pub fn keys(&self) -> Vec<i64> {
        self.iter().map(|(k, _)| k).collect()
    }

    // ─── mutation ──────────────────────────────────────────────────────────

    /// Inserts `value` under `key` and returns its handle.
    ///
    /// If `key` is already present the tree is left unchanged, `value` is
    /// dropped and the existing node's handle is returned.
    pub fn insert(&mut self, key: i64, value: T) -> NodeId {
        let mut parent = NIL;
        let mut cur = self.root;
        let mut go_left = false;
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            parent = cur;
            match key.cmp(&node.key) {
                std::cmp::Ordering::Less => {
                    go_left = true;
                    cur = node.left;
                }
                std::cmp::Ordering::Greater => {
                    go_left = false;
                    cur = node.right;
                }
                std::cmp::Ordering::Equal => return NodeId(cur),
            }
        }

        let id = self.alloc(key, value, parent);
        if parent == NIL {
            self.root = id;
        } else if go_left {
            self.nodes[parent as usize].left = id;
        } else {
            self.nodes[parent as usize].right = id;
        }
        self.len += 1;
        self.rebalance_from(parent);
        NodeId(id)
    }

    /// Removes `key` and returns its value.
    ///
    /// A node with two children is replaced by its in-order successor,
    /// which keeps its own handle; rebalancing starts at the splice point.
    pub fn remove(&mut self, key: i64) -> Option<T> {
        let z = self.find(key)?.0;
        let (z_left, z_right, z_parent) = {
            let n = &self.nodes[z as usize];
            (n.left, n.right, n.parent)
        };

        let rebalance_start = if z_left == NIL || z_right == NIL {
            let child = if z_left != NIL { z_left } else { z_right };
            self.transplant(z, child);
            z_parent
        } else {
            let y = self.min_from(z_right);
            let start = if self.nodes[y as usize].parent != z {
                let y_parent = self.nodes[y as usize].parent;
                let y_right = self.nodes[y as usize].right;
                self.transplant(y, y_right);
                self.nodes[y as usize].right = z_right;
                self.nodes[z_right as usize].parent = y;
                y_parent
            } else {
                y
            };
            self.transplant(z, y);
            self.nodes[y as usize].left = z_left;
            self.nodes[z_left as usize].parent = y;
            self.nodes[y as usize].height = self.nodes[z as usize].height;
            start
        };

        let value = self.release(z);
        self.len -= 1;
        self.rebalance_from(rebalance_start);
        value
    }

    /// Checks ordering, parent links, heights and the AVL balance factor of
    /// every node.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        fn check<T>(tree: &BalancedIndexTree<T>, n: u32, lo: Option<i64>, hi: Option<i64>) -> Option<u32> {
            if n == NIL {
                return Some(0);
            }
            let node = &tree.nodes[n as usize];
            node.value.as_ref()?;
            if lo.is_some_and(|lo| node.key <= lo) || hi.is_some_and(|hi| node.key >= hi) {
                return None;
            }
            for child in [node.left, node.right] {
                if child != NIL && tree.nodes[child as usize].parent != n {
                    return None;
                }
            }
            let lh = check(tree, node.left, lo, Some(node.key))?;
            let rh = check(tree, node.right, Some(node.key), hi)?;
            let height = lh.max(rh) + 1;
            (lh.abs_diff(rh) <= 1 && node.height == height).then_some(height)
        }
        let root_ok = self.root == NIL || self.nodes[self.root as usize].parent == NIL;
        root_ok && check(self, self.root, None, None).is_some() && self.iter().count() == self.len
    }

    // ─── internals ─────────────────────────────────────────────────────────

    fn alloc(&mut self, key: i64, value: T, parent: u32) -> u32 {
        let node = Node {
            key,
            height: 1,
            left: NIL,
            right: NIL,
            parent,
            value: Some(value),
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn release(&mut self, slot: u32) -> Option<T> {
        let node = &mut self.nodes[slot as usize];
        node.left = NIL;
        node.right = NIL;
        node.parent = NIL;
        node.height = 0;
        self.free.push(slot);
        node.value.take()
    }

    #[inline]
    fn h(&self, n: u32) -> u32 {
        if n == NIL { 0 } else { self.nodes[n as usize].height }
    }

    #[inline]
    fn balance(&self, n: u32) -> i64 {
        let node = &self.nodes[n as usize];
        i64::from(self.h(node.left)) - i64::from(self.h(node.right))
    }

    #[inline]
    fn update_height(&mut self, n: u32) {
        let (l, r) = {
            let node = &self.nodes[n as usize];
            (node.left, node.right)
        };
        self.nodes[n as usize].height = self.h(l).max(self.h(r)) + 1;
    }

    fn min_from(&self, mut n: u32) -> u32 {
        while self.nodes[n as usize].left != NIL {
            n = self.nodes[n as usize].left;
        }
        n
    }

    fn max_from(&self, mut n: u32) -> u32 {
        while self.nodes[n as usize].right != NIL {
            n = self.nodes[n as usize].right;
        }
        n
    }

    /// Point `old`'s parent (or the root) at `new`.
    fn replace_child(&mut self, parent: u32, old: u32, new: u32) {
        if parent == NIL {
            self.root = new;
        } else if self.nodes[parent as usize].left == old {
            self.nodes[parent as usize].left = new;
        } else {
            self.nodes[parent as usize].right = new;
        }
    }

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: u32, v: u32) {
        let parent = self.nodes[u as usize].parent;
        self.replace_child(parent, u, v);
        if v != NIL {
            self.nodes[v as usize].parent = parent;
        }
    }

    fn rotate_left(&mut self, x: u32) -> u32 {
        let y = self.nodes[x as usize].right;
        let y_left = self.nodes[y as usize].left;
        let x_parent = self.nodes[x as usize].parent;

        self.nodes[x as usize].right = y_left;
        if y_left != NIL {
            self.nodes[y_left as usize].parent = x;
        }
        self.nodes[y as usize].parent = x_parent;
        self.replace_child(x_parent, x, y);
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;

        self.update_height(x);
        self.update_height(y);
        y
    }

    fn rotate_right(&mut self, x: u32) -> u32 {
        let y = self.nodes[x as usize].left;
        let y_right = self.nodes[y as usize].right;
        let x_parent = self.nodes[x as usize].parent;

        self.nodes[x as usize].left = y_right;
        if y_right != NIL {
            self.nodes[y_right as usize].parent = x;
        }
        self.nodes[y as usize].parent = x_parent;
        self.replace_child(x_parent, x, y);
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;

        self.update_height(x);
        self.update_height(y);
        y
    }

    /// Restore the balance factor at `n`; returns the new subtree root.
    fn rebalance(&mut self, n: u32) -> u32 {
        self.update_height(n);
        let balance = self.balance(n);
        if balance > 1 {
            let left = self.nodes[n as usize].left;
            if self.balance(left) < 0 {
                self.rotate_left(left);
            }
            self.rotate_right(n)
        } else if balance < -1 {
            let right = self.nodes[n as usize].right;
            if self.balance(right) > 0 {
                self.rotate_right(right);
            }
            self.rotate_left(n)
        } else {
            n
        }
    }

    fn rebalance_from(&mut self, mut n: u32) {
        while n != NIL {
            let subtree_root = self.rebalance(n);
            n = self.nodes[subtree_root as usize].parent;
        }
    }
}

/// Ordered iterator over a [`BalancedIndexTree`].
pub struct Iter<'a, T> {
    tree: &'a BalancedIndexTree<T>,
    cursor: Option<NodeId>,
    ascending: bool,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (i64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        self.cursor = if self.ascending {
            self.tree.next(id)
        } else {
            self.tree.prev(id)
        };
        self.tree.node(id)
    }
}

impl<'a, T> IntoIterator for &'a BalancedIndexTree<T> {
    type Item = (i64, &'a T);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// Serialized as an ascending sequence of `(key, value)` pairs; the shape is
// rebuilt by insertion on load.
impl<T: Serialize> Serialize for BalancedIndexTree<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for BalancedIndexTree<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(i64, T)>::deserialize(deserializer)?;
        let mut tree = Self::with_capacity(pairs.len());
        for (key, value) in pairs {
            tree.insert(key, value);
        }
        Ok(tree)
    }
}

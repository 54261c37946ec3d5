//! Splay-tree index of disjoint half-open ranges.
//!
//! Keyed by range start. A lookup address compares "less" than a node when it
//! lies below the node's start, "greater" when it lies at or past the node's
//! end, and "equal" when the node covers it. Because stored ranges never
//! overlap this ordering is total over the stored nodes.
//!
//! Splaying is top-down (Sleator and Tarjan), so lookups mutate the tree and
//! callers must hold exclusive access even for reads. Hot objects in a loop
//! stay at or near the root.

use std::cmp::Ordering;

use crate::error::IndexError;
use crate::node_arena::{NIL, NodeArena};
use crate::page_supplier::PageSupplier;
use crate::region::MemoryRegion;

#[derive(Clone, Copy)]
struct Node<T: Copy> {
    region: MemoryRegion,
    value: T,
    left: u32,
    right: u32,
}

/// Ordered set of non-overlapping regions with attached metadata.
pub struct IntervalIndex<T: Copy> {
    nodes: NodeArena<Node<T>>,
    root: u32,
}

impl<T: Copy> IntervalIndex<T> {
    /// Empty index backed by the process-wide page supplier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: NodeArena::new(),
            root: NIL,
        }
    }

    /// Empty index drawing node pages from `supplier`.
    #[must_use]
    pub fn with_supplier(supplier: &'static PageSupplier) -> Self {
        Self {
            nodes: NodeArena::with_supplier(supplier),
            root: NIL,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// Insert `region`. Fails if it overlaps a stored range.
    pub fn insert(&mut self, region: MemoryRegion, value: T) -> Result<(), IndexError> {
        if let Some((existing, _)) = self.first_overlapping(region) {
            return Err(IndexError::Overlap {
                requested: region,
                existing,
            });
        }

        let node = self.nodes.alloc(Node {
            region,
            value,
            left: NIL,
            right: NIL,
        });
        let root = self.root;
        if root != NIL {
            // first_overlapping splayed around region.begin(), so the root is
            // the in-order neighbour of the new node.
            if region.begin() < self.node(root).region.begin() {
                let left = self.node(root).left;
                self.node_mut(node).left = left;
                self.node_mut(node).right = root;
                self.node_mut(root).left = NIL;
            } else {
                let right = self.node(root).right;
                self.node_mut(node).right = right;
                self.node_mut(node).left = root;
                self.node_mut(root).right = NIL;
            }
        }
        self.root = node;
        Ok(())
    }

    /// Find the range covering `addr`.
    pub fn lookup(&mut self, addr: usize) -> Option<(MemoryRegion, T)> {
        self.splay(addr);
        let root = self.root;
        if root == NIL {
            return None;
        }
        let node = self.node(root);
        node.region.contains(addr).then_some((node.region, node.value))
    }

    /// Lowest stored range that overlaps `region`, if any.
    pub fn first_overlapping(&mut self, region: MemoryRegion) -> Option<(MemoryRegion, T)> {
        self.splay(region.begin());
        let root = self.root;
        if root == NIL {
            return None;
        }
        let node = *self.node(root);
        if node.region.contains(region.begin()) {
            return Some((node.region, node.value));
        }
        // No stored range covers region.begin(); the only candidate is the
        // in-order successor of that address.
        let succ = if node.region.begin() > region.begin() {
            root
        } else {
            self.min_of(node.right)
        };
        if succ == NIL {
            return None;
        }
        let succ = self.node(succ);
        succ.region
            .overlaps(region)
            .then_some((succ.region, succ.value))
    }

    /// Remove exactly `region`.
    ///
    /// Removing a range that is absent, or that only partially matches a
    /// stored range, is an error and leaves the index unchanged.
    pub fn remove(&mut self, region: MemoryRegion) -> Result<T, IndexError> {
        self.splay(region.begin());
        let root = self.root;
        if root == NIL || !self.node(root).region.contains(region.begin()) {
            return Err(IndexError::NotFound {
                addr: region.begin(),
            });
        }
        let existing = self.node(root).region;
        if existing != region {
            return Err(IndexError::RangeMismatch {
                requested: region,
                existing,
            });
        }
        Ok(self.unlink_root().1)
    }

    /// Remove the range whose start is exactly `base`.
    pub fn remove_at(&mut self, base: usize) -> Result<(MemoryRegion, T), IndexError> {
        self.splay(base);
        let root = self.root;
        if root == NIL || !self.node(root).region.contains(base) {
            return Err(IndexError::NotFound { addr: base });
        }
        let existing = self.node(root).region;
        if existing.begin() != base {
            return Err(IndexError::NotBase {
                addr: base,
                existing,
            });
        }
        Ok(self.unlink_root())
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = NIL;
    }

    /// In-order traversal. Does not splay.
    pub fn iter(&self) -> Iter<'_, T> {
        let mut iter = Iter {
            index: self,
            stack: Vec::new(),
        };
        iter.push_left(self.root);
        iter
    }

    fn node(&self, idx: u32) -> &Node<T> {
        self.nodes.get(idx)
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node<T> {
        self.nodes.get_mut(idx)
    }

    fn compare(&self, idx: u32, addr: usize) -> Ordering {
        let region = self.node(idx).region;
        if addr < region.begin() {
            Ordering::Less
        } else if addr >= region.end() {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    fn min_of(&self, mut idx: u32) -> u32 {
        if idx == NIL {
            return NIL;
        }
        while self.node(idx).left != NIL {
            idx = self.node(idx).left;
        }
        idx
    }

    fn splay(&mut self, addr: usize) {
        self.root = self.splay_subtree(self.root, addr);
    }

    /// Top-down splay of the subtree rooted at `t` around `addr`. Returns the
    /// new subtree root: the node covering `addr`, or the last node visited
    /// on the search path.
    fn splay_subtree(&mut self, mut t: u32, addr: usize) -> u32 {
        if t == NIL {
            return NIL;
        }
        // Nodes greater than addr collect in the right tree, lesser ones in
        // the left tree. Heads are the first nodes linked; tails are where
        // the next node attaches.
        let (mut left_head, mut left_tail) = (NIL, NIL);
        let (mut right_head, mut right_tail) = (NIL, NIL);

        loop {
            match self.compare(t, addr) {
                Ordering::Less => {
                    let mut child = self.node(t).left;
                    if child == NIL {
                        break;
                    }
                    if self.compare(child, addr) == Ordering::Less {
                        // zig-zig: rotate right
                        let inner = self.node(child).right;
                        self.node_mut(t).left = inner;
                        self.node_mut(child).right = t;
                        t = child;
                        child = self.node(t).left;
                        if child == NIL {
                            break;
                        }
                    }
                    if right_tail == NIL {
                        right_head = t;
                    } else {
                        self.node_mut(right_tail).left = t;
                    }
                    right_tail = t;
                    t = child;
                }
                Ordering::Greater => {
                    let mut child = self.node(t).right;
                    if child == NIL {
                        break;
                    }
                    if self.compare(child, addr) == Ordering::Greater {
                        // zag-zag: rotate left
                        let inner = self.node(child).left;
                        self.node_mut(t).right = inner;
                        self.node_mut(child).left = t;
                        t = child;
                        child = self.node(t).right;
                        if child == NIL {
                            break;
                        }
                    }
                    if left_tail == NIL {
                        left_head = t;
                    } else {
                        self.node_mut(left_tail).right = t;
                    }
                    left_tail = t;
                    t = child;
                }
                Ordering::Equal => break,
            }
        }

        if left_tail != NIL {
            let inner = self.node(t).left;
            self.node_mut(left_tail).right = inner;
            self.node_mut(t).left = left_head;
        }
        if right_tail != NIL {
            let inner = self.node(t).right;
            self.node_mut(right_tail).left = inner;
            self.node_mut(t).right = right_head;
        }
        t
    }

    fn unlink_root(&mut self) -> (MemoryRegion, T) {
        let root = self.root;
        let Node {
            region,
            value,
            left,
            right,
        } = *self.node(root);
        self.root = if left == NIL {
            right
        } else {
            // Every key in the left subtree is below region.begin(), so
            // splaying for it brings the maximum up with no right child.
            let top = self.splay_subtree(left, region.begin());
            self.node_mut(top).right = right;
            top
        };
        self.nodes.free(root);
        (region, value)
    }
}

impl<T: Copy> Default for IntervalIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-order iterator over an [`IntervalIndex`].
pub struct Iter<'a, T: Copy> {
    index: &'a IntervalIndex<T>,
    stack: Vec<u32>,
}

impl<T: Copy> Iter<'_, T> {
    fn push_left(&mut self, mut idx: u32) {
        while idx != NIL {
            self.stack.push(idx);
            idx = self.index.node(idx).left;
        }
    }
}

impl<T: Copy> Iterator for Iter<'_, T> {
    type Item = (MemoryRegion, T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.stack.pop()?;
        let node = *self.index.node(idx);
        self.push_left(node.right);
        Some((node.region, node.value))
    }
}

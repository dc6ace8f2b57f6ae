//! The free-interval index.
//!
//! Free intervals live in a red-black tree keyed by start address. Nodes are
//! stored in a `Vec`-backed arena and refer to each other by `NodeId`, with
//! `None` standing in for the black sentinel leaf. Vacated slots are recycled
//! by later insertions.
//!
//! The tree never overlaps two intervals: every interval it is handed comes
//! from a fresh arena chunk, the remainder of a split, or a freed allocation,
//! and intervals are removed by their exact start address.

use alloc::vec::Vec;
use core::iter::FusedIterator;

use crate::InvariantViolation;

/// A contiguous range of free bytes, `[start, start + size)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FreeInterval {
    /// The first address of the interval.
    pub start: u64,
    /// The length of the interval in bytes.
    pub size: u64,
}

impl FreeInterval {
    /// Create a new interval.
    #[inline]
    pub const fn new(start: u64, size: u64) -> Self {
        FreeInterval { start, size }
    }

    /// One past the last address of the interval.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Clone, Debug)]
struct Node {
    interval: FreeInterval,
    color: Color,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

/// A red-black tree of free intervals, ordered by start address.
#[derive(Clone, Debug, Default)]
pub struct FreeTree {
    nodes: Vec<Node>,
    vacant: Vec<NodeId>,
    root: Option<NodeId>,
    len: usize,
}

impl FreeTree {
    /// Create a new, empty tree.
    #[inline]
    pub const fn new() -> Self {
        FreeTree {
            nodes: Vec::new(),
            vacant: Vec::new(),
            root: None,
            len: 0,
        }
    }

    /// The number of free intervals in the tree.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree holds no free intervals.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove every interval, keeping the node arena's capacity.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.vacant.clear();
        self.root = None;
        self.len = 0;
    }

    /// The sum of the sizes of all free intervals.
    pub fn free_bytes(&self) -> u64 {
        self.iter().map(|i| i.size).sum()
    }

    /// Get the interval starting exactly at `start`, if any.
    pub fn get(&self, start: u64) -> Option<FreeInterval> {
        self.find(start).map(|id| self.node(id).interval)
    }

    /// Iterate over the free intervals in ascending address order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            next: self.root.map(|r| self.minimum(r)),
            remaining: self.len,
        }
    }

    /// Collect the free intervals in ascending address order.
    pub fn inorder(&self) -> Vec<FreeInterval> {
        self.iter().collect()
    }

    /// Insert the interval `[start, start + size)`.
    ///
    /// The caller must not insert an interval that overlaps one already in
    /// the tree.
    pub fn insert(&mut self, start: u64, size: u64) {
        let id = self.alloc_node(FreeInterval::new(start, size));

        let mut parent = None;
        let mut cursor = self.root;
        while let Some(c) = cursor {
            parent = Some(c);
            cursor = if start < self.node(c).interval.start {
                self.left(c)
            } else {
                self.right(c)
            };
        }

        self.node_mut(id).parent = parent;
        match parent {
            None => self.root = Some(id),
            Some(p) if start < self.node(p).interval.start => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }
        self.len += 1;

        self.insert_fixup(id);
        debug_assert!(self.is_black(self.root));
    }

    /// Remove the interval starting exactly at `start`.
    ///
    /// Returns the removed interval, or `None` (leaving the tree untouched)
    /// if no interval starts there.
    pub fn delete(&mut self, start: u64) -> Option<FreeInterval> {
        let id = self.find(start)?;
        let interval = self.remove_node(id);
        debug_assert!(self.is_black(self.root));
        Some(interval)
    }

    /// Find a free interval at least `size` bytes long.
    ///
    /// This walks a single root-to-leaf path: a node that is large enough is
    /// returned immediately, otherwise the walk continues right when the node
    /// is too small and left otherwise. It can miss a fitting interval that is
    /// off that path; callers fall back to growing the arena.
    pub fn search_for_fit(&self, size: u64) -> Option<FreeInterval> {
        let mut cursor = self.root;
        while let Some(id) = cursor {
            let node = self.node(id);
            if node.interval.size >= size {
                return Some(node.interval);
            }
            cursor = if node.interval.size < size {
                node.right
            } else {
                node.left
            };
        }
        None
    }

    /// Check the red-black invariants, the ordering of keys, parent links
    /// and the cached length.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let Some(root) = self.root else {
            return if self.len == 0 {
                Ok(())
            } else {
                Err(InvariantViolation::LengthMismatch {
                    expected: self.len,
                    actual: 0,
                })
            };
        };

        if self.is_red(root) {
            return Err(InvariantViolation::RedRoot);
        }
        if self.parent(root).is_some() {
            return Err(InvariantViolation::BrokenParentLink {
                start: self.node(root).interval.start,
            });
        }

        let mut count = 0;
        self.validate_subtree(root, &mut count)?;
        if count != self.len {
            return Err(InvariantViolation::LengthMismatch {
                expected: self.len,
                actual: count,
            });
        }

        let mut prev: Option<FreeInterval> = None;
        for interval in self.iter() {
            if let Some(prev) = prev {
                if prev.start >= interval.start {
                    return Err(InvariantViolation::OutOfOrder {
                        start: interval.start,
                    });
                }
                if prev.end() > interval.start {
                    return Err(InvariantViolation::OverlappingIntervals {
                        first: prev.start,
                        second: interval.start,
                    });
                }
            }
            prev = Some(interval);
        }

        Ok(())
    }

    /// Returns the black-height of the subtree rooted at `id`, not counting
    /// the sentinel leaves.
    fn validate_subtree(
        &self,
        id: NodeId,
        count: &mut usize,
    ) -> Result<usize, InvariantViolation> {
        *count += 1;
        let node = self.node(id);
        let start = node.interval.start;

        let mut heights = [0; 2];
        for (height, child) in heights.iter_mut().zip([node.left, node.right]) {
            let Some(child) = child else { continue };
            if self.parent(child) != Some(id) {
                return Err(InvariantViolation::BrokenParentLink {
                    start: self.node(child).interval.start,
                });
            }
            if node.color == Color::Red && self.is_red(child) {
                return Err(InvariantViolation::RedRedEdge {
                    start: self.node(child).interval.start,
                });
            }
            *height = self.validate_subtree(child, count)?;
        }

        if heights[0] != heights[1] {
            return Err(InvariantViolation::BlackHeightMismatch { start });
        }
        Ok(heights[0] + usize::from(node.color == Color::Black))
    }

    fn alloc_node(&mut self, interval: FreeInterval) -> NodeId {
        let node = Node {
            interval,
            color: Color::Red,
            parent: None,
            left: None,
            right: None,
        };
        match self.vacant.pop() {
            Some(id) => {
                self.nodes[id.0] = node;
                id
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    #[inline]
    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    #[inline]
    fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    #[inline]
    fn left(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).left
    }

    #[inline]
    fn right(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).right
    }

    #[inline]
    fn is_red(&self, id: NodeId) -> bool {
        self.node(id).color == Color::Red
    }

    /// Sentinel leaves are black.
    #[inline]
    fn is_black(&self, id: Option<NodeId>) -> bool {
        id.map_or(true, |id| !self.is_red(id))
    }

    #[inline]
    fn set_color(&mut self, id: NodeId, color: Color) {
        self.node_mut(id).color = color;
    }

    fn find(&self, start: u64) -> Option<NodeId> {
        let mut cursor = self.root;
        while let Some(id) = cursor {
            let key = self.node(id).interval.start;
            if start == key {
                return Some(id);
            }
            cursor = if start < key {
                self.left(id)
            } else {
                self.right(id)
            };
        }
        None
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(left) = self.left(id) {
            id = left;
        }
        id
    }

    fn successor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(right) = self.right(id) {
            return Some(self.minimum(right));
        }
        let mut child = id;
        let mut parent = self.parent(id);
        while let Some(p) = parent {
            if self.right(p) != Some(child) {
                break;
            }
            child = p;
            parent = self.parent(p);
        }
        parent
    }

    /// Point `parent`'s link to `old` (or the root, when `parent` is `None`)
    /// at `new` instead.
    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) if self.left(p) == Some(old) => self.node_mut(p).left = new,
            Some(p) => self.node_mut(p).right = new,
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let y = self
            .right(x)
            .expect("left rotation requires a right child");

        let y_left = self.left(y);
        self.node_mut(x).right = y_left;
        if let Some(b) = y_left {
            self.node_mut(b).parent = Some(x);
        }

        let x_parent = self.parent(x);
        self.node_mut(y).parent = x_parent;
        self.replace_child(x_parent, x, Some(y));

        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let y = self
            .left(x)
            .expect("right rotation requires a left child");

        let y_right = self.right(y);
        self.node_mut(x).left = y_right;
        if let Some(b) = y_right {
            self.node_mut(b).parent = Some(x);
        }

        let x_parent = self.parent(x);
        self.node_mut(y).parent = x_parent;
        self.replace_child(x_parent, x, Some(y));

        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while let Some(parent) = self.parent(z) {
            if !self.is_red(parent) {
                break;
            }
            // A red node is never the root, so a grandparent exists.
            let grandparent = self
                .parent(parent)
                .expect("red parent should have a parent of its own");

            if self.left(grandparent) == Some(parent) {
                let red_uncle = self.right(grandparent).filter(|&u| self.is_red(u));
                if let Some(uncle) = red_uncle {
                    self.set_color(parent, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    z = grandparent;
                } else {
                    if self.right(parent) == Some(z) {
                        z = parent;
                        self.rotate_left(z);
                    }
                    let parent = self.parent(z).expect("rotation keeps a parent above z");
                    let grandparent = self
                        .parent(parent)
                        .expect("rotation keeps a grandparent above z");
                    self.set_color(parent, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    self.rotate_right(grandparent);
                }
            } else {
                let red_uncle = self.left(grandparent).filter(|&u| self.is_red(u));
                if let Some(uncle) = red_uncle {
                    self.set_color(parent, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    z = grandparent;
                } else {
                    if self.left(parent) == Some(z) {
                        z = parent;
                        self.rotate_right(z);
                    }
                    let parent = self.parent(z).expect("rotation keeps a parent above z");
                    let grandparent = self
                        .parent(parent)
                        .expect("rotation keeps a grandparent above z");
                    self.set_color(parent, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    self.rotate_left(grandparent);
                }
            }
        }

        if let Some(root) = self.root {
            self.set_color(root, Color::Black);
        }
    }

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: NodeId, v: Option<NodeId>) {
        let u_parent = self.parent(u);
        self.replace_child(u_parent, u, v);
        if let Some(v) = v {
            self.node_mut(v).parent = u_parent;
        }
    }

    fn remove_node(&mut self, z: NodeId) -> FreeInterval {
        let mut removed_color = self.node(z).color;
        let x;
        let x_parent;

        match (self.left(z), self.right(z)) {
            (None, right) => {
                x = right;
                x_parent = self.parent(z);
                self.transplant(z, right);
            }
            (left, None) => {
                x = left;
                x_parent = self.parent(z);
                self.transplant(z, left);
            }
            (Some(z_left), Some(z_right)) => {
                // Splice in the in-order successor.
                let y = self.minimum(z_right);
                removed_color = self.node(y).color;
                x = self.right(y);

                if self.parent(y) == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.parent(y);
                    self.transplant(y, x);
                    self.node_mut(y).right = Some(z_right);
                    self.node_mut(z_right).parent = Some(y);
                }

                self.transplant(z, Some(y));
                self.node_mut(y).left = Some(z_left);
                self.node_mut(z_left).parent = Some(y);
                let z_color = self.node(z).color;
                self.set_color(y, z_color);
            }
        }

        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        let interval = self.node(z).interval;
        let node = self.node_mut(z);
        node.parent = None;
        node.left = None;
        node.right = None;
        self.vacant.push(z);
        self.len -= 1;
        interval
    }

    /// Restore the black-height after removing a black node. `x` carries the
    /// extra black and may be a sentinel leaf, so its parent is tracked
    /// separately.
    fn delete_fixup(&mut self, mut x: Option<NodeId>, mut parent: Option<NodeId>) {
        while x != self.root && self.is_black(x) {
            let Some(p) = parent else { break };

            if self.left(p) == x {
                let mut w = self
                    .right(p)
                    .expect("doubly-black node should have a sibling");
                if self.is_red(w) {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_left(p);
                    w = self.right(p).expect("rotation keeps a sibling");
                }

                if self.is_black(self.left(w)) && self.is_black(self.right(w)) {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    parent = self.parent(p);
                } else {
                    if self.is_black(self.right(w)) {
                        if let Some(wl) = self.left(w) {
                            self.set_color(wl, Color::Black);
                        }
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(p).expect("rotation keeps a sibling");
                    }
                    let p_color = self.node(p).color;
                    self.set_color(w, p_color);
                    self.set_color(p, Color::Black);
                    if let Some(wr) = self.right(w) {
                        self.set_color(wr, Color::Black);
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let mut w = self
                    .left(p)
                    .expect("doubly-black node should have a sibling");
                if self.is_red(w) {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_right(p);
                    w = self.left(p).expect("rotation keeps a sibling");
                }

                if self.is_black(self.left(w)) && self.is_black(self.right(w)) {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    parent = self.parent(p);
                } else {
                    if self.is_black(self.left(w)) {
                        if let Some(wr) = self.right(w) {
                            self.set_color(wr, Color::Black);
                        }
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(p).expect("rotation keeps a sibling");
                    }
                    let p_color = self.node(p).color;
                    self.set_color(w, p_color);
                    self.set_color(p, Color::Black);
                    if let Some(wl) = self.left(w) {
                        self.set_color(wl, Color::Black);
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }

        if let Some(x) = x {
            self.set_color(x, Color::Black);
        }
    }
}

impl FromIterator<FreeInterval> for FreeTree {
    fn from_iter<I: IntoIterator<Item = FreeInterval>>(iter: I) -> Self {
        let mut tree = FreeTree::new();
        tree.extend(iter);
        tree
    }
}

impl Extend<FreeInterval> for FreeTree {
    fn extend<I: IntoIterator<Item = FreeInterval>>(&mut self, iter: I) {
        for interval in iter {
            self.insert(interval.start, interval.size);
        }
    }
}

impl<'a> IntoIterator for &'a FreeTree {
    type Item = FreeInterval;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// An in-order iterator over a [`FreeTree`]'s intervals.
#[derive(Clone, Debug)]
pub struct Iter<'a> {
    tree: &'a FreeTree,
    next: Option<NodeId>,
    remaining: usize,
}

impl Iterator for Iter<'_> {
    type Item = FreeInterval;

    fn next(&mut self) -> Option<FreeInterval> {
        let id = self.next?;
        self.next = self.tree.successor(id);
        self.remaining -= 1;
        Some(self.tree.node(id).interval)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl FusedIterator for Iter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// A deterministic shuffle of `0..n`, for `n` coprime with the stride.
    fn scrambled(n: u64) -> impl Iterator<Item = u64> {
        (0..n).map(move |i| (i * 7919) % n)
    }

    fn starts(tree: &FreeTree) -> Vec<u64> {
        tree.iter().map(|i| i.start).collect()
    }

    #[test]
    fn empty_tree() {
        let tree = FreeTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.search_for_fit(0), None);
        assert!(tree.inorder().is_empty());
        tree.validate().unwrap();
    }

    #[test]
    fn insert_keeps_invariants() {
        let mut tree = FreeTree::new();
        for (i, k) in scrambled(1000).enumerate() {
            tree.insert(k * 16, 16);
            assert_eq!(tree.len(), i + 1);
            tree.validate().unwrap();
        }
        let expected: Vec<u64> = (0..1000).map(|k| k * 16).collect();
        assert_eq!(starts(&tree), expected);
    }

    #[test]
    fn ascending_and_descending_inserts_stay_balanced() {
        let mut ascending = FreeTree::new();
        let mut descending = FreeTree::new();
        for k in 0..512 {
            ascending.insert(k * 8, 8);
            descending.insert((511 - k) * 8, 8);
        }
        ascending.validate().unwrap();
        descending.validate().unwrap();
        assert_eq!(starts(&ascending), starts(&descending));
    }

    #[test]
    fn delete_keeps_invariants() {
        let mut tree: FreeTree = (0..997).map(|k| FreeInterval::new(k * 4, 4)).collect();
        tree.validate().unwrap();

        for (i, k) in scrambled(997).enumerate() {
            assert_eq!(tree.delete(k * 4), Some(FreeInterval::new(k * 4, 4)));
            assert_eq!(tree.len(), 997 - i - 1);
            assert_eq!(tree.get(k * 4), None);
            tree.validate().unwrap();
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn delete_missing_key_is_a_no_op() {
        let mut tree: FreeTree = [FreeInterval::new(0, 10), FreeInterval::new(20, 10)]
            .into_iter()
            .collect();
        assert_eq!(tree.delete(10), None);
        assert_eq!(tree.delete(21), None);
        assert_eq!(tree.len(), 2);
        tree.validate().unwrap();
    }

    #[test]
    fn interleaved_inserts_and_deletes_reuse_slots() {
        let mut tree = FreeTree::new();
        for round in 0..4 {
            for k in scrambled(101) {
                tree.insert(k * 100 + round, 1);
            }
            for k in scrambled(101).filter(|k| k % 3 != 0) {
                assert!(tree.delete(k * 100 + round).is_some());
            }
            tree.validate().unwrap();
        }
        assert_eq!(tree.len(), 4 * 34);
        assert!(tree.nodes.len() <= 101 + 3 * 34);
    }

    #[test]
    fn search_returns_root_when_it_fits() {
        let tree: FreeTree = [
            FreeInterval::new(0, 64),
            FreeInterval::new(100, 32),
            FreeInterval::new(200, 128),
        ]
        .into_iter()
        .collect();
        // Root is the middle key.
        assert_eq!(tree.search_for_fit(16), Some(FreeInterval::new(100, 32)));
        assert_eq!(tree.search_for_fit(32), Some(FreeInterval::new(100, 32)));
    }

    #[test]
    fn search_descends_right_past_small_nodes() {
        let tree: FreeTree = [
            FreeInterval::new(0, 64),
            FreeInterval::new(100, 32),
            FreeInterval::new(200, 128),
        ]
        .into_iter()
        .collect();
        assert_eq!(tree.search_for_fit(100), Some(FreeInterval::new(200, 128)));
    }

    #[test]
    fn search_can_miss_a_fit_off_the_path() {
        // The only interval large enough sits left of a too-small root.
        let tree: FreeTree = [
            FreeInterval::new(0, 64),
            FreeInterval::new(100, 32),
            FreeInterval::new(200, 16),
        ]
        .into_iter()
        .collect();
        assert_eq!(tree.search_for_fit(48), None);
        assert!(tree.iter().any(|i| i.size >= 48));
    }

    #[test]
    fn inorder_matches_iter() {
        let mut tree = FreeTree::new();
        for k in scrambled(61) {
            tree.insert(k * 10, 5);
        }
        assert_eq!(tree.inorder(), tree.iter().collect::<Vec<_>>());
        assert_eq!(tree.iter().len(), 61);
        assert_eq!(tree.free_bytes(), 61 * 5);
    }

    #[test]
    fn validate_reports_overlap() {
        let tree: FreeTree = vec![FreeInterval::new(0, 10), FreeInterval::new(5, 10)]
            .into_iter()
            .collect();
        assert_eq!(
            tree.validate(),
            Err(InvariantViolation::OverlappingIntervals {
                first: 0,
                second: 5
            })
        );
    }

    #[test]
    fn validate_reports_red_root() {
        let mut tree = FreeTree::new();
        tree.insert(0, 1);
        let root = tree.root.unwrap();
        tree.set_color(root, Color::Red);
        assert_eq!(tree.validate(), Err(InvariantViolation::RedRoot));
    }

    #[test]
    fn validate_reports_black_height_mismatch() {
        let mut tree = FreeTree::new();
        tree.insert(10, 1);
        tree.insert(5, 1);
        tree.insert(15, 1);
        let left = tree.left(tree.root.unwrap()).unwrap();
        tree.set_color(left, Color::Black);
        assert_eq!(
            tree.validate(),
            Err(InvariantViolation::BlackHeightMismatch { start: 10 })
        );
    }

    #[test]
    fn clear_empties_the_tree() {
        let mut tree: FreeTree = (0..10).map(|k| FreeInterval::new(k, 1)).collect();
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.iter().next(), None);
        tree.validate().unwrap();
    }
}

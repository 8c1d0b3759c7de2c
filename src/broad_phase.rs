//! Broadphase: Incremental Dynamic AABB Tree
//!
//! A self-balancing binary tree of fat AABBs producing candidate overlapping
//! body pairs in amortized sub-quadratic time.
//!
//! - **Incremental**: O(log n) insert/remove/update, no per-step rebuild.
//! - **Fat AABBs**: proxies are grown by a margin so slowly moving bodies do
//!   not reinsert every step.
//! - **Balanced**: AVL-style rotations keep queries O(log n).
//! - **`optimize()`**: optional full median-split rebuild for query locality
//!   after bulk insertion.
//!
//! Leaves carry raw body slot indices; handle validation happens a level up.

use crate::aabb::Aabb;
use crate::math::RVec3;

/// Null node sentinel.
pub const NULL_NODE: u32 = u32::MAX;

/// Default proxy fattening margin (m).
const FAT_MARGIN: f64 = 0.1;

#[derive(Clone, Debug)]
struct Node {
    aabb: Aabb,
    parent: u32,
    left: u32,
    right: u32,
    height: i32,
    body_index: u32,
}

impl Node {
    fn leaf(aabb: Aabb, body_index: u32) -> Self {
        Self { aabb, parent: NULL_NODE, left: NULL_NODE, right: NULL_NODE, height: 0, body_index }
    }

    fn internal() -> Self {
        Self {
            aabb: Aabb::invalid(),
            parent: NULL_NODE,
            left: NULL_NODE,
            right: NULL_NODE,
            height: 0,
            body_index: u32::MAX,
        }
    }

    #[inline]
    fn is_leaf(&self) -> bool {
        self.left == NULL_NODE
    }
}

/// Dynamic AABB tree over body proxies.
pub struct BroadPhase {
    nodes: Vec<Node>,
    free_list: Vec<u32>,
    root: u32,
    /// Proxy fattening margin
    pub margin: f64,
    /// body slot index -> proxy node, NULL_NODE when absent
    proxy_by_body: Vec<u32>,
}

impl BroadPhase {
    /// Create an empty broadphase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_list: Vec::new(),
            root: NULL_NODE,
            margin: FAT_MARGIN,
            proxy_by_body: Vec::new(),
        }
    }

    /// Number of tracked proxies.
    #[must_use]
    pub fn proxy_count(&self) -> usize {
        self.proxy_by_body.iter().filter(|&&p| p != NULL_NODE).count()
    }

    /// Tree height, 0 when empty.
    #[must_use]
    pub fn height(&self) -> i32 {
        if self.root == NULL_NODE {
            0
        } else {
            self.nodes[self.root as usize].height
        }
    }

    /// Insert a proxy for `body_index`.
    pub fn add_body(&mut self, body_index: u32, aabb: Aabb) {
        if self.proxy_by_body.len() <= body_index as usize {
            self.proxy_by_body.resize(body_index as usize + 1, NULL_NODE);
        }
        debug_assert_eq!(self.proxy_by_body[body_index as usize], NULL_NODE);

        let node = self.alloc_node();
        self.nodes[node as usize] = Node::leaf(aabb.grown(self.margin), body_index);
        self.insert_leaf(node);
        self.proxy_by_body[body_index as usize] = node;
    }

    /// Remove the proxy for `body_index`.
    pub fn remove_body(&mut self, body_index: u32) {
        let Some(&proxy) = self.proxy_by_body.get(body_index as usize) else { return };
        if proxy == NULL_NODE {
            return;
        }
        self.remove_leaf(proxy);
        self.free_node(proxy);
        self.proxy_by_body[body_index as usize] = NULL_NODE;
    }

    /// Update a proxy's AABB. Returns true if the leaf was reinserted (the
    /// tight box escaped its fat box).
    pub fn update_body(&mut self, body_index: u32, aabb: Aabb) -> bool {
        let Some(&proxy) = self.proxy_by_body.get(body_index as usize) else { return false };
        if proxy == NULL_NODE {
            return false;
        }

        if self.nodes[proxy as usize].aabb.contains(&aabb) {
            return false;
        }

        self.remove_leaf(proxy);
        self.nodes[proxy as usize].aabb = aabb.grown(self.margin);
        self.insert_leaf(proxy);
        true
    }

    /// Fat AABB currently stored for a body, if tracked.
    #[must_use]
    pub fn body_aabb(&self, body_index: u32) -> Option<Aabb> {
        let proxy = *self.proxy_by_body.get(body_index as usize)?;
        (proxy != NULL_NODE).then(|| self.nodes[proxy as usize].aabb)
    }

    /// Visit every body whose fat AABB overlaps `aabb`.
    pub fn query_aabb<F: FnMut(u32)>(&self, aabb: &Aabb, mut visitor: F) {
        if self.root == NULL_NODE {
            return;
        }
        let mut stack = Vec::with_capacity(64);
        stack.push(self.root);

        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            if !node.aabb.intersects(aabb) {
                continue;
            }
            if node.is_leaf() {
                visitor(node.body_index);
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }

    /// Visit every body whose fat AABB is stabbed by the ray segment
    /// `origin + t * direction`, `t` in `[0, max_t]`. Unordered.
    pub fn cast_ray<F: FnMut(u32)>(
        &self,
        origin: RVec3,
        direction: RVec3,
        max_t: f64,
        mut visitor: F,
    ) {
        if self.root == NULL_NODE {
            return;
        }
        let mut stack = Vec::with_capacity(64);
        stack.push(self.root);

        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            if node.aabb.ray_intersect(origin, direction, max_t).is_none() {
                continue;
            }
            if node.is_leaf() {
                visitor(node.body_index);
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }

    /// Candidate pairs for a set of moving bodies.
    ///
    /// For each body in `active` (sorted slot indices), the tree is queried
    /// with its fat AABB. An active-active pair is emitted once (smaller index
    /// first); an active-inactive pair is always emitted from the active side.
    /// Output is sorted and deduplicated, so it is deterministic regardless of
    /// traversal order.
    #[must_use]
    pub fn collect_pairs(&self, active: &[u32], is_active: impl Fn(u32) -> bool) -> Vec<(u32, u32)> {
        let mut pairs = Vec::new();

        for &a in active {
            let Some(&proxy) = self.proxy_by_body.get(a as usize) else { continue };
            if proxy == NULL_NODE {
                continue;
            }
            let aabb = self.nodes[proxy as usize].aabb;
            self.query_aabb(&aabb, |b| {
                if b == a {
                    return;
                }
                if is_active(b) {
                    if a < b {
                        pairs.push((a, b));
                    }
                } else {
                    pairs.push((a.min(b), a.max(b)));
                }
            });
        }

        pairs.sort_unstable();
        pairs.dedup();
        pairs
    }

    /// Rebuild the whole tree with a median split over leaf centers.
    ///
    /// Incremental insertion order can leave the tree poorly shaped after bulk
    /// loading; one rebuild restores query locality.
    pub fn optimize(&mut self) {
        let mut leaves: Vec<(Aabb, u32)> = Vec::new();
        for (body, &proxy) in self.proxy_by_body.iter().enumerate() {
            if proxy != NULL_NODE {
                leaves.push((self.nodes[proxy as usize].aabb, body as u32));
            }
        }

        self.nodes.clear();
        self.free_list.clear();
        self.root = NULL_NODE;
        for p in &mut self.proxy_by_body {
            *p = NULL_NODE;
        }

        if leaves.is_empty() {
            return;
        }
        let count = leaves.len();
        self.root = self.build_recursive(&mut leaves, 0, count);
    }

    // =========== Internal methods ===========

    fn build_recursive(&mut self, leaves: &mut [(Aabb, u32)], start: usize, end: usize) -> u32 {
        debug_assert!(end > start);
        if end - start == 1 {
            let (aabb, body) = leaves[start];
            let node = self.alloc_node();
            self.nodes[node as usize] = Node::leaf(aabb, body);
            self.proxy_by_body[body as usize] = node;
            return node;
        }

        // Split on the longest axis of the centroid bounds.
        let mut bounds = Aabb::invalid();
        for (aabb, _) in &leaves[start..end] {
            let c = aabb.center();
            bounds = bounds.union(&Aabb::new(c, c));
        }
        let extent = bounds.max - bounds.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };

        leaves[start..end].sort_by(|(a, _), (b, _)| {
            a.center()[axis].partial_cmp(&b.center()[axis]).unwrap_or(core::cmp::Ordering::Equal)
        });

        let mid = start + (end - start) / 2;
        let left = self.build_recursive(leaves, start, mid);
        let right = self.build_recursive(leaves, mid, end);

        let node = self.alloc_node();
        self.nodes[node as usize] = Node::internal();
        self.nodes[node as usize].left = left;
        self.nodes[node as usize].right = right;
        self.nodes[left as usize].parent = node;
        self.nodes[right as usize].parent = node;
        self.refresh(node);
        node
    }

    fn alloc_node(&mut self) -> u32 {
        if let Some(id) = self.free_list.pop() {
            id
        } else {
            let id = self.nodes.len() as u32;
            self.nodes.push(Node::internal());
            id
        }
    }

    fn free_node(&mut self, id: u32) {
        self.nodes[id as usize] = Node::internal();
        self.nodes[id as usize].height = -1;
        self.free_list.push(id);
    }

    /// Recompute an internal node's box and height from its children.
    fn refresh(&mut self, id: u32) {
        let left = self.nodes[id as usize].left;
        let right = self.nodes[id as usize].right;
        if left == NULL_NODE || right == NULL_NODE {
            return;
        }
        let (lh, rh) = (self.nodes[left as usize].height, self.nodes[right as usize].height);
        self.nodes[id as usize].height = 1 + lh.max(rh);
        self.nodes[id as usize].aabb =
            self.nodes[left as usize].aabb.union(&self.nodes[right as usize].aabb);
    }

    fn insert_leaf(&mut self, leaf: u32) {
        if self.root == NULL_NODE {
            self.root = leaf;
            self.nodes[leaf as usize].parent = NULL_NODE;
            return;
        }

        // Descend to the best sibling by the surface area heuristic.
        let leaf_aabb = self.nodes[leaf as usize].aabb;
        let mut sibling = self.root;
        while !self.nodes[sibling as usize].is_leaf() {
            let left = self.nodes[sibling as usize].left;
            let right = self.nodes[sibling as usize].right;

            let area = self.nodes[sibling as usize].aabb.surface_area();
            let combined_area = leaf_aabb.union(&self.nodes[sibling as usize].aabb).surface_area();

            let cost_here = 2.0 * combined_area;
            let inheritance = 2.0 * (combined_area - area);
            let cost_left = self.descend_cost(left, &leaf_aabb, inheritance);
            let cost_right = self.descend_cost(right, &leaf_aabb, inheritance);

            if cost_here < cost_left && cost_here < cost_right {
                break;
            }
            sibling = if cost_left < cost_right { left } else { right };
        }

        // Splice a new parent above the chosen sibling.
        let old_parent = self.nodes[sibling as usize].parent;
        let new_parent = self.alloc_node();
        self.nodes[new_parent as usize] = Node::internal();
        self.nodes[new_parent as usize].parent = old_parent;

        if old_parent != NULL_NODE {
            if self.nodes[old_parent as usize].left == sibling {
                self.nodes[old_parent as usize].left = new_parent;
            } else {
                self.nodes[old_parent as usize].right = new_parent;
            }
        } else {
            self.root = new_parent;
        }

        self.nodes[new_parent as usize].left = sibling;
        self.nodes[new_parent as usize].right = leaf;
        self.nodes[sibling as usize].parent = new_parent;
        self.nodes[leaf as usize].parent = new_parent;

        self.fix_upwards(new_parent);
    }

    fn descend_cost(&self, child: u32, leaf_aabb: &Aabb, inheritance: f64) -> f64 {
        let combined = leaf_aabb.union(&self.nodes[child as usize].aabb);
        if self.nodes[child as usize].is_leaf() {
            combined.surface_area() + inheritance
        } else {
            let old_area = self.nodes[child as usize].aabb.surface_area();
            (combined.surface_area() - old_area) + inheritance
        }
    }

    fn remove_leaf(&mut self, leaf: u32) {
        if leaf == self.root {
            self.root = NULL_NODE;
            return;
        }

        let parent = self.nodes[leaf as usize].parent;
        let grandparent = self.nodes[parent as usize].parent;
        let sibling = if self.nodes[parent as usize].left == leaf {
            self.nodes[parent as usize].right
        } else {
            self.nodes[parent as usize].left
        };

        if grandparent != NULL_NODE {
            if self.nodes[grandparent as usize].left == parent {
                self.nodes[grandparent as usize].left = sibling;
            } else {
                self.nodes[grandparent as usize].right = sibling;
            }
            self.nodes[sibling as usize].parent = grandparent;
            self.free_node(parent);
            self.fix_upwards(grandparent);
        } else {
            self.root = sibling;
            self.nodes[sibling as usize].parent = NULL_NODE;
            self.free_node(parent);
        }
    }

    fn fix_upwards(&mut self, start: u32) {
        let mut id = start;
        while id != NULL_NODE {
            id = self.balance(id);
            self.refresh(id);
            id = self.nodes[id as usize].parent;
        }
    }

    /// Rebalance one node, returning the subtree's (possibly new) root.
    fn balance(&mut self, a: u32) -> u32 {
        if self.nodes[a as usize].is_leaf() || self.nodes[a as usize].height < 2 {
            return a;
        }

        let left = self.nodes[a as usize].left;
        let right = self.nodes[a as usize].right;
        let factor = self.nodes[right as usize].height - self.nodes[left as usize].height;

        if factor > 1 {
            self.rotate_up(a, right)
        } else if factor < -1 {
            self.rotate_up(a, left)
        } else {
            a
        }
    }

    /// Lift child `c` above its parent `a`. The taller grandchild stays under
    /// `c`; the shorter one takes `c`'s old slot under `a`.
    fn rotate_up(&mut self, a: u32, c: u32) -> u32 {
        let f = self.nodes[c as usize].left;
        let g = self.nodes[c as usize].right;

        let grandparent = self.nodes[a as usize].parent;
        self.nodes[c as usize].parent = grandparent;
        if grandparent != NULL_NODE {
            if self.nodes[grandparent as usize].left == a {
                self.nodes[grandparent as usize].left = c;
            } else {
                self.nodes[grandparent as usize].right = c;
            }
        } else {
            self.root = c;
        }

        let (keep, demote) = if self.nodes[f as usize].height >= self.nodes[g as usize].height {
            (f, g)
        } else {
            (g, f)
        };

        self.nodes[c as usize].left = a;
        self.nodes[c as usize].right = keep;
        self.nodes[a as usize].parent = c;
        self.nodes[keep as usize].parent = c;

        if self.nodes[a as usize].left == c {
            self.nodes[a as usize].left = demote;
        } else {
            self.nodes[a as usize].right = demote;
        }
        self.nodes[demote as usize].parent = a;

        self.refresh(a);
        self.refresh(c);
        c
    }
}

impl Default for BroadPhase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_aabb(x: f64, y: f64, z: f64) -> Aabb {
        Aabb::from_center_half(RVec3::new(x, y, z), RVec3::splat(0.5))
    }

    #[test]
    fn test_insert_and_query() {
        let mut bp = BroadPhase::new();
        bp.add_body(0, unit_aabb(0.0, 0.0, 0.0));
        bp.add_body(1, unit_aabb(10.0, 10.0, 10.0));
        bp.add_body(2, unit_aabb(20.0, 20.0, 20.0));
        assert_eq!(bp.proxy_count(), 3);

        let mut hits = Vec::new();
        bp.query_aabb(&unit_aabb(0.2, 0.0, 0.0), |b| hits.push(b));
        assert!(hits.contains(&0));
        assert!(!hits.contains(&2));
    }

    #[test]
    fn test_remove() {
        let mut bp = BroadPhase::new();
        bp.add_body(0, unit_aabb(0.0, 0.0, 0.0));
        bp.add_body(1, unit_aabb(5.0, 5.0, 5.0));
        bp.remove_body(0);
        assert_eq!(bp.proxy_count(), 1);

        let mut hits = Vec::new();
        bp.query_aabb(&unit_aabb(0.0, 0.0, 0.0), |b| hits.push(b));
        assert!(hits.is_empty());
    }

    #[test]
    fn test_update_within_fat_box_is_free() {
        let mut bp = BroadPhase::new();
        bp.add_body(0, unit_aabb(0.0, 0.0, 0.0));
        // Moves much smaller than the margin stay inside the fat box.
        assert!(!bp.update_body(0, unit_aabb(0.01, 0.0, 0.0)));
        // A large move forces a reinsert.
        assert!(bp.update_body(0, unit_aabb(50.0, 0.0, 0.0)));

        let mut hits = Vec::new();
        bp.query_aabb(&unit_aabb(50.0, 0.0, 0.0), |b| hits.push(b));
        assert_eq!(hits, vec![0]);
    }

    #[test]
    fn test_collect_pairs_dedups_active_pairs() {
        let mut bp = BroadPhase::new();
        bp.add_body(0, unit_aabb(0.0, 0.0, 0.0));
        bp.add_body(1, unit_aabb(0.4, 0.0, 0.0));
        bp.add_body(2, unit_aabb(100.0, 0.0, 0.0));

        let pairs = bp.collect_pairs(&[0, 1, 2], |_| true);
        assert_eq!(pairs, vec![(0, 1)]);
    }

    #[test]
    fn test_collect_pairs_includes_inactive_partner() {
        let mut bp = BroadPhase::new();
        bp.add_body(0, unit_aabb(0.0, 0.0, 0.0));
        bp.add_body(1, unit_aabb(0.4, 0.0, 0.0));

        // Body 1 sleeping/static: only body 0 is queried, pair still found.
        let pairs = bp.collect_pairs(&[0], |b| b == 0);
        assert_eq!(pairs, vec![(0, 1)]);
    }

    #[test]
    fn test_tree_stays_balanced() {
        let mut bp = BroadPhase::new();
        for i in 0..256 {
            bp.add_body(i, unit_aabb(f64::from(i) * 3.0, 0.0, 0.0));
        }
        assert_eq!(bp.proxy_count(), 256);
        assert!(bp.height() < 24, "height = {}", bp.height());
    }

    #[test]
    fn test_optimize_preserves_content() {
        let mut bp = BroadPhase::new();
        for i in 0..64 {
            bp.add_body(i, unit_aabb(f64::from(i) * 2.5, 0.0, 0.0));
        }
        let before = bp.proxy_count();
        bp.optimize();
        assert_eq!(bp.proxy_count(), before);

        let mut hits = Vec::new();
        bp.query_aabb(&unit_aabb(25.0, 0.0, 0.0), |b| hits.push(b));
        assert!(hits.contains(&10), "hits = {hits:?}");
    }

    #[test]
    fn test_ray_visits_hit_candidates() {
        let mut bp = BroadPhase::new();
        bp.add_body(0, unit_aabb(5.0, 0.0, 0.0));
        bp.add_body(1, unit_aabb(5.0, 10.0, 0.0));

        let mut hits = Vec::new();
        bp.cast_ray(RVec3::new(0.0, 0.0, 0.0), RVec3::new(10.0, 0.0, 0.0), 1.0, |b| hits.push(b));
        assert!(hits.contains(&0));
        assert!(!hits.contains(&1));
    }
}

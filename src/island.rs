//! Island Builder and Large-Island Splitter
//!
//! Islands are maximal sets of active dynamic bodies connected by contacts or
//! constraints, rebuilt from scratch each step via union-find over the
//! constraint graph. They are purely a scheduling artifact: each island is
//! solved independently, so islands are the unit of parallel work.
//!
//! Oversized islands can be split into batches of constraints that share no
//! bodies (greedy graph coloring). Batches run in sequence within one
//! iteration, so no hard coupling is broken, but each batch's constraints are
//! mutually independent.

/// Union-find over body slot indices with path halving and union by rank.
pub struct IslandBuilder {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl IslandBuilder {
    /// Builder sized for `num_slots` body slots.
    #[must_use]
    pub fn new(num_slots: usize) -> Self {
        Self { parent: (0..num_slots as u32).collect(), rank: vec![0; num_slots] }
    }

    /// Reset for a new step over `num_slots` slots.
    pub fn reset(&mut self, num_slots: usize) {
        self.parent.clear();
        self.parent.extend(0..num_slots as u32);
        self.rank.clear();
        self.rank.resize(num_slots, 0);
    }

    /// Find the root of `x` with path halving.
    pub fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            self.parent[x as usize] = self.parent[self.parent[x as usize] as usize];
            x = self.parent[x as usize];
        }
        x
    }

    /// Join the sets containing `a` and `b`.
    pub fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra as usize].cmp(&self.rank[rb as usize]) {
            core::cmp::Ordering::Less => self.parent[ra as usize] = rb,
            core::cmp::Ordering::Greater => self.parent[rb as usize] = ra,
            core::cmp::Ordering::Equal => {
                self.parent[rb as usize] = ra;
                self.rank[ra as usize] += 1;
            }
        }
    }
}

/// One island: bodies plus the contact/joint work assigned to it.
#[derive(Clone, Debug, Default)]
pub struct Island {
    /// Body slot indices in this island (sorted ascending)
    pub bodies: Vec<u32>,
    /// Indices into the step's prepared contact-constraint list
    pub contacts: Vec<u32>,
    /// Indices into the step's prepared joint list
    pub joints: Vec<u32>,
    /// Indices into the step's vehicle list
    pub vehicles: Vec<u32>,
}

/// Assign each active body to an island by its union-find root.
///
/// Returns the islands (bodies sorted, islands ordered by their smallest body
/// index — deterministic) and a map from body slot to island index.
pub fn build_islands(
    builder: &mut IslandBuilder,
    active_bodies: &[u32],
) -> (Vec<Island>, Vec<Option<u32>>) {
    let slot_count = builder.parent.len();
    let mut island_of_root: Vec<Option<u32>> = vec![None; slot_count];
    let mut islands: Vec<Island> = Vec::new();
    let mut island_of_body: Vec<Option<u32>> = vec![None; slot_count];

    // `active_bodies` is sorted, so islands come out ordered by smallest
    // member and each island's body list is ascending.
    for &body in active_bodies {
        let root = builder.find(body);
        let island_idx = match island_of_root[root as usize] {
            Some(idx) => idx,
            None => {
                let idx = islands.len() as u32;
                island_of_root[root as usize] = Some(idx);
                islands.push(Island::default());
                idx
            }
        };
        islands[island_idx as usize].bodies.push(body);
        island_of_body[body as usize] = Some(island_idx);
    }

    (islands, island_of_body)
}

/// Split one island's constraints into batches that share no bodies.
///
/// `edges[i]` is the pair of island-local body indices constraint `i` touches
/// (`None` for a static/kinematic side). Greedy first-fit coloring in input
/// order, so the result is deterministic.
#[must_use]
pub fn split_batches(edges: &[(Option<u32>, Option<u32>)], num_bodies: usize) -> Vec<Vec<u32>> {
    const MAX_COLORS: usize = 64;

    let mut batches: Vec<Vec<u32>> = Vec::new();
    let mut body_colors: Vec<u64> = vec![0; num_bodies];

    for (i, &(a, b)) in edges.iter().enumerate() {
        let used = a.map_or(0, |x| body_colors[x as usize])
            | b.map_or(0, |x| body_colors[x as usize]);
        let color = (!used).trailing_zeros() as usize;
        let color = color.min(MAX_COLORS - 1);

        while batches.len() <= color {
            batches.push(Vec::new());
        }
        batches[color].push(i as u32);

        let bit = 1u64 << color;
        if let Some(x) = a {
            body_colors[x as usize] |= bit;
        }
        if let Some(x) = b {
            body_colors[x as usize] |= bit;
        }
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_find() {
        let mut b = IslandBuilder::new(5);
        b.union(0, 1);
        b.union(2, 3);
        assert_eq!(b.find(0), b.find(1));
        assert_ne!(b.find(0), b.find(2));
        assert_eq!(b.find(2), b.find(3));
    }

    #[test]
    fn test_build_islands_partitions() {
        let mut b = IslandBuilder::new(5);
        b.union(0, 1);
        b.union(2, 3);
        let (islands, island_of_body) = build_islands(&mut b, &[0, 1, 2, 3, 4]);
        assert_eq!(islands.len(), 3);
        let total: usize = islands.iter().map(|i| i.bodies.len()).sum();
        assert_eq!(total, 5);
        assert_eq!(island_of_body[0], island_of_body[1]);
        assert_ne!(island_of_body[0], island_of_body[4]);
    }

    #[test]
    fn test_islands_deterministic_order() {
        let mut b = IslandBuilder::new(6);
        b.union(4, 5);
        b.union(0, 2);
        let (islands, _) = build_islands(&mut b, &[0, 2, 4, 5]);
        // First island contains the smallest body index.
        assert_eq!(islands[0].bodies, vec![0, 2]);
        assert_eq!(islands[1].bodies, vec![4, 5]);
    }

    #[test]
    fn test_inactive_bodies_excluded() {
        let mut b = IslandBuilder::new(4);
        b.union(0, 1);
        let (islands, island_of_body) = build_islands(&mut b, &[0, 1]);
        assert_eq!(islands.len(), 1);
        assert_eq!(island_of_body[3], None);
    }

    #[test]
    fn test_split_batches_no_shared_bodies() {
        // A chain 0-1, 1-2, 2-3: adjacent constraints share a body.
        let edges = vec![
            (Some(0), Some(1)),
            (Some(1), Some(2)),
            (Some(2), Some(3)),
        ];
        let batches = split_batches(&edges, 4);
        for batch in &batches {
            let mut seen = std::collections::HashSet::new();
            for &ci in batch {
                let (a, b) = edges[ci as usize];
                for body in [a, b].into_iter().flatten() {
                    assert!(seen.insert(body), "batch shares body {body}");
                }
            }
        }
        // Chain colors alternate: two batches.
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_split_batches_static_sides_do_not_conflict() {
        // Constraints against the world (None) never conflict with each other.
        let edges = vec![(Some(0), None), (Some(1), None), (Some(2), None)];
        let batches = split_batches(&edges, 3);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }
}

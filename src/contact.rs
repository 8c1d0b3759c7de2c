//! Persistent Contact Manifolds with Warm Starting
//!
//! Manifolds survive across steps for stable stacking and fast solver
//! convergence. A new contact point is matched to a cached one by nearest
//! local-space position on body A under the configured tolerance (forward
//! linear scan, first minimum wins — deterministic for identical inputs);
//! matched points keep their accumulated impulses, which the solver applies
//! as the warm-start seed next step.
//!
//! Manifold lifetime is bounded by broadphase overlap: a manifold not touched
//! this step is discarded in `end_step`.

use std::collections::HashMap;

use crate::body::BodyId;
use crate::math::Vec3;
use crate::shape::SubShapeId;

/// Maximum contact points per manifold.
pub const MAX_MANIFOLD_POINTS: usize = 4;

/// Canonical body pair key (smaller slot index first).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BodyPairKey {
    /// Body with the smaller slot index
    pub first: BodyId,
    /// Body with the larger slot index
    pub second: BodyId,
}

impl BodyPairKey {
    /// Build a canonical key. Returns the key and `true` when the inputs were
    /// swapped (the caller must flip its normal accordingly).
    #[must_use]
    pub fn new(a: BodyId, b: BodyId) -> (Self, bool) {
        if a.index() <= b.index() {
            (Self { first: a, second: b }, false)
        } else {
            (Self { first: b, second: a }, true)
        }
    }
}

/// Cache key: body pair plus the sub-shape pair that produced the manifold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ManifoldKey {
    /// Canonical body pair
    pub pair: BodyPairKey,
    /// Sub-shape on the first body
    pub sub_first: SubShapeId,
    /// Sub-shape on the second body
    pub sub_second: SubShapeId,
}

/// One cached contact point.
#[derive(Clone, Copy, Debug)]
pub struct CachedContactPoint {
    /// Contact point in the first body's local space
    pub local_first: Vec3,
    /// Contact point in the second body's local space
    pub local_second: Vec3,
    /// Contact position relative to the first body's world position
    pub rel_position: Vec3,
    /// Signed penetration (positive = overlapping)
    pub penetration: f32,
    /// Accumulated normal impulse (warm start seed)
    pub lambda_n: f32,
    /// Accumulated tangent impulse along t1
    pub lambda_t1: f32,
    /// Accumulated tangent impulse along t2
    pub lambda_t2: f32,
    /// Steps this point has persisted
    pub age: u32,
    /// Whether the point was produced or matched this step
    refreshed: bool,
}

impl CachedContactPoint {
    fn new(local_first: Vec3, local_second: Vec3, rel_position: Vec3, penetration: f32) -> Self {
        Self {
            local_first,
            local_second,
            rel_position,
            penetration,
            lambda_n: 0.0,
            lambda_t1: 0.0,
            lambda_t2: 0.0,
            age: 0,
            refreshed: true,
        }
    }
}

/// Persistent manifold: up to four points between one sub-shape pair.
#[derive(Clone, Debug)]
pub struct ContactManifold {
    /// Cache key
    pub key: ManifoldKey,
    /// Active points
    pub points: Vec<CachedContactPoint>,
    /// World-space normal, first body toward second
    pub normal: Vec3,
    /// Combined friction for the pair
    pub friction: f32,
    /// Combined restitution for the pair
    pub restitution: f32,
    /// True when the manifold was refreshed this step
    touched: bool,
}

impl ContactManifold {
    fn new(key: ManifoldKey, friction: f32, restitution: f32) -> Self {
        Self {
            key,
            points: Vec::with_capacity(MAX_MANIFOLD_POINTS),
            normal: Vec3::ZERO,
            friction,
            restitution,
            touched: true,
        }
    }

    /// Number of active points.
    #[inline]
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Add a point or refresh a cached one, preserving accumulated impulses.
    ///
    /// Matching rule: nearest cached point by squared local-space distance on
    /// the first body, accepted under `tolerance_sq`.
    pub fn add_or_update(
        &mut self,
        local_first: Vec3,
        local_second: Vec3,
        rel_position: Vec3,
        penetration: f32,
        tolerance_sq: f32,
    ) {
        let mut best: Option<usize> = None;
        let mut best_dist_sq = tolerance_sq;
        for (i, existing) in self.points.iter().enumerate() {
            let dist_sq = (existing.local_first - local_first).length_squared();
            if dist_sq < best_dist_sq {
                best_dist_sq = dist_sq;
                best = Some(i);
            }
        }

        if let Some(idx) = best {
            let prev = self.points[idx];
            self.points[idx] =
                CachedContactPoint::new(local_first, local_second, rel_position, penetration);
            self.points[idx].lambda_n = prev.lambda_n;
            self.points[idx].lambda_t1 = prev.lambda_t1;
            self.points[idx].lambda_t2 = prev.lambda_t2;
            self.points[idx].age = prev.age + 1;
        } else if self.points.len() < MAX_MANIFOLD_POINTS {
            self.points.push(CachedContactPoint::new(
                local_first,
                local_second,
                rel_position,
                penetration,
            ));
        } else {
            // Full: replace the shallowest point if the new one is deeper.
            let (shallowest, depth) = self
                .points
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.penetration.total_cmp(&b.penetration))
                .map(|(i, p)| (i, p.penetration))
                .expect("manifold is full");
            if penetration > depth {
                self.points[shallowest] =
                    CachedContactPoint::new(local_first, local_second, rel_position, penetration);
            }
        }
    }

    /// Drop cached points that were not refreshed this step.
    fn prune_unrefreshed(&mut self) {
        self.points.retain(|p| p.refreshed);
    }
}

/// Flags raised when a cache capacity is hit during a step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheSaturation {
    /// Manifold storage was full; some manifolds were dropped
    pub manifold_cache_full: bool,
    /// Body-pair tracking was full; some pairs were dropped
    pub body_pair_cache_full: bool,
}

/// Cross-step manifold cache for the whole world.
pub struct ContactCache {
    manifolds: Vec<ContactManifold>,
    index: HashMap<ManifoldKey, usize>,
    max_manifolds: usize,
    /// Saturation flags for the current step
    pub saturation: CacheSaturation,
}

impl ContactCache {
    /// Create a cache bounded by `max_manifolds` (the body-pair capacity).
    #[must_use]
    pub fn new(max_manifolds: usize) -> Self {
        Self {
            manifolds: Vec::new(),
            index: HashMap::new(),
            max_manifolds,
            saturation: CacheSaturation::default(),
        }
    }

    /// Number of live manifolds.
    #[inline]
    #[must_use]
    pub fn manifold_count(&self) -> usize {
        self.manifolds.len()
    }

    /// Total cached points.
    #[must_use]
    pub fn total_contact_points(&self) -> usize {
        self.manifolds.iter().map(ContactManifold::point_count).sum()
    }

    /// Mark all manifolds untouched and clear saturation (step start).
    pub fn begin_step(&mut self) {
        for m in &mut self.manifolds {
            m.touched = false;
            for p in &mut m.points {
                p.refreshed = false;
            }
        }
        self.saturation = CacheSaturation::default();
    }

    /// Find or create the manifold for a key. `None` (plus a raised flag) when
    /// the cache is full — the contact is dropped for this step, simulation
    /// continues.
    pub fn get_or_create(
        &mut self,
        key: ManifoldKey,
        normal: Vec3,
        friction: f32,
        restitution: f32,
    ) -> Option<&mut ContactManifold> {
        if let Some(&idx) = self.index.get(&key) {
            let m = &mut self.manifolds[idx];
            m.touched = true;
            m.normal = normal;
            m.friction = friction;
            m.restitution = restitution;
            return Some(m);
        }

        if self.manifolds.len() >= self.max_manifolds {
            self.saturation.manifold_cache_full = true;
            self.saturation.body_pair_cache_full = true;
            return None;
        }

        let idx = self.manifolds.len();
        let mut m = ContactManifold::new(key, friction, restitution);
        m.normal = normal;
        self.manifolds.push(m);
        self.index.insert(key, idx);
        Some(&mut self.manifolds[idx])
    }

    /// Read-only lookup.
    #[must_use]
    pub fn find(&self, key: &ManifoldKey) -> Option<&ContactManifold> {
        self.index.get(key).map(|&idx| &self.manifolds[idx])
    }

    /// Drop manifolds for pairs that stopped overlapping and stale points
    /// inside surviving manifolds (step end).
    pub fn end_step(&mut self) {
        self.end_step_with(|_| false);
    }

    /// Like [`end_step`](Self::end_step), but `keep_untouched` can preserve
    /// manifolds that were not refreshed this step. Used to freeze the contact
    /// state of sleeping islands: those pairs are skipped by the narrowphase,
    /// yet their manifolds must survive so waking one body can wake the whole
    /// island and warm starting resumes seamlessly.
    pub fn end_step_with<F: Fn(&ManifoldKey) -> bool>(&mut self, keep_untouched: F) {
        self.manifolds.retain_mut(|m| {
            if !m.touched {
                return keep_untouched(&m.key) && !m.points.is_empty();
            }
            m.prune_unrefreshed();
            !m.points.is_empty()
        });

        self.index.clear();
        for (idx, m) in self.manifolds.iter().enumerate() {
            self.index.insert(m.key, idx);
        }
    }

    /// Drop every manifold referencing a body (called on body removal).
    pub fn remove_body(&mut self, body: BodyId) {
        self.manifolds
            .retain(|m| m.key.pair.first != body && m.key.pair.second != body);
        self.index.clear();
        for (idx, m) in self.manifolds.iter().enumerate() {
            self.index.insert(m.key, idx);
        }
    }

    /// Iterate manifolds in insertion order (deterministic).
    pub fn iter(&self) -> impl Iterator<Item = &ContactManifold> {
        self.manifolds.iter()
    }

    /// Mutable manifold access by key, for writing back solver impulses.
    pub fn get_mut(&mut self, key: &ManifoldKey) -> Option<&mut ContactManifold> {
        self.index.get(key).map(|&idx| &mut self.manifolds[idx])
    }

    /// Clear everything.
    pub fn clear(&mut self) {
        self.manifolds.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(a: u32, b: u32) -> ManifoldKey {
        let (pair, _) = BodyPairKey::new(BodyId::new(a, 0), BodyId::new(b, 0));
        ManifoldKey { pair, sub_first: 0, sub_second: 0 }
    }

    const TOL_SQ: f32 = 1.0e-4;

    #[test]
    fn test_pair_key_canonical() {
        let (k1, swapped1) = BodyPairKey::new(BodyId::new(3, 0), BodyId::new(7, 0));
        let (k2, swapped2) = BodyPairKey::new(BodyId::new(7, 0), BodyId::new(3, 0));
        assert_eq!(k1, k2);
        assert!(!swapped1);
        assert!(swapped2);
        assert_eq!(k1.first.index(), 3);
    }

    #[test]
    fn test_point_matching_preserves_impulses() {
        let mut cache = ContactCache::new(16);
        cache.begin_step();
        {
            let m = cache.get_or_create(key(0, 1), Vec3::Y, 0.3, 0.0).unwrap();
            m.add_or_update(Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, 0.01, TOL_SQ);
            m.points[0].lambda_n = 5.0;
            m.points[0].lambda_t1 = 1.0;
        }
        cache.end_step();

        cache.begin_step();
        {
            let m = cache.get_or_create(key(0, 1), Vec3::Y, 0.3, 0.0).unwrap();
            // Same point within tolerance: impulses must survive.
            m.add_or_update(Vec3::new(0.005, 0.0, 0.0), Vec3::ZERO, Vec3::ZERO, 0.02, TOL_SQ);
            assert_eq!(m.point_count(), 1);
            assert_eq!(m.points[0].lambda_n, 5.0);
            assert_eq!(m.points[0].lambda_t1, 1.0);
            assert_eq!(m.points[0].age, 1);
        }
    }

    #[test]
    fn test_point_outside_tolerance_is_new() {
        let mut cache = ContactCache::new(16);
        cache.begin_step();
        let m = cache.get_or_create(key(0, 1), Vec3::Y, 0.3, 0.0).unwrap();
        m.add_or_update(Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, 0.01, TOL_SQ);
        m.points[0].lambda_n = 5.0;
        m.add_or_update(Vec3::new(0.5, 0.0, 0.0), Vec3::ZERO, Vec3::ZERO, 0.01, TOL_SQ);
        assert_eq!(m.point_count(), 2);
        assert_eq!(m.points[1].lambda_n, 0.0);
    }

    #[test]
    fn test_manifold_caps_at_four_points() {
        let mut cache = ContactCache::new(16);
        cache.begin_step();
        let m = cache.get_or_create(key(0, 1), Vec3::Y, 0.3, 0.0).unwrap();
        for i in 0..6 {
            m.add_or_update(
                Vec3::new(i as f32, 0.0, 0.0),
                Vec3::ZERO,
                Vec3::ZERO,
                0.01 * (i as f32 + 1.0),
                TOL_SQ,
            );
        }
        assert!(m.point_count() <= MAX_MANIFOLD_POINTS);
        // The deepest point must have survived.
        assert!(m.points.iter().any(|p| (p.penetration - 0.06).abs() < 1e-6));
    }

    #[test]
    fn test_untouched_manifold_expires() {
        let mut cache = ContactCache::new(16);
        cache.begin_step();
        let m = cache.get_or_create(key(0, 1), Vec3::Y, 0.3, 0.0).unwrap();
        m.add_or_update(Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, 0.01, TOL_SQ);
        cache.end_step();
        assert_eq!(cache.manifold_count(), 1);

        // Pair not refreshed: the manifold dies the step overlap stops.
        cache.begin_step();
        cache.end_step();
        assert_eq!(cache.manifold_count(), 0);
    }

    #[test]
    fn test_capacity_saturation_flag() {
        let mut cache = ContactCache::new(1);
        cache.begin_step();
        assert!(cache.get_or_create(key(0, 1), Vec3::Y, 0.3, 0.0).is_some());
        assert!(cache.get_or_create(key(0, 2), Vec3::Y, 0.3, 0.0).is_none());
        assert!(cache.saturation.manifold_cache_full);

        // Existing manifolds stay reachable even at capacity.
        assert!(cache.get_or_create(key(0, 1), Vec3::Y, 0.3, 0.0).is_some());
    }

    #[test]
    fn test_remove_body_drops_manifolds() {
        let mut cache = ContactCache::new(16);
        cache.begin_step();
        let m = cache.get_or_create(key(0, 1), Vec3::Y, 0.3, 0.0).unwrap();
        m.add_or_update(Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, 0.01, TOL_SQ);
        let m = cache.get_or_create(key(2, 3), Vec3::Y, 0.3, 0.0).unwrap();
        m.add_or_update(Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, 0.01, TOL_SQ);

        cache.remove_body(BodyId::new(1, 0));
        assert_eq!(cache.manifold_count(), 1);
        assert!(cache.find(&key(2, 3)).is_some());
    }
}

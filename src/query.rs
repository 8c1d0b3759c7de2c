//! World Queries
//!
//! Ray casts (single / any / all), point containment, shape overlap and shape
//! casts against all bodies in the world. Every query is parameterized by a
//! [`QueryFilter`] and follows the same two-stage flow as simulation: the
//! broadphase streams unsorted candidates, the narrowphase tests them
//! exactly.
//!
//! "All hits" variants return a lazy iterator the caller drains — no
//! registered callbacks. When sorted output is requested, hits are ordered by
//! ascending fraction with ties broken by body slot order (stable for
//! identical inputs).

use crate::body::BodyId;
use crate::filter::QueryFilter;
use crate::math::{Quat, RVec3, Vec3};
use crate::narrow_phase::{self, CollideSettings, RayCastSettings};
use crate::shape::{Shape, SubShapeId};
use crate::world::PhysicsSystem;

/// A ray segment: `origin + t * direction` for `t` in `[0, 1]`.
///
/// The direction carries the length; hit fractions are reported along it.
#[derive(Clone, Copy, Debug)]
pub struct RayCast {
    /// Start point
    pub origin: RVec3,
    /// Full displacement of the segment
    pub direction: RVec3,
}

impl RayCast {
    /// Ray from `origin` along `direction`.
    #[must_use]
    pub fn new(origin: RVec3, direction: RVec3) -> Self {
        Self { origin, direction }
    }

    /// Point at fraction `t`.
    #[must_use]
    pub fn at(&self, t: f32) -> RVec3 {
        self.origin + self.direction * f64::from(t)
    }
}

/// One ray hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    /// Body that was hit
    pub body: BodyId,
    /// Fraction along the ray direction
    pub fraction: f32,
    /// Sub-shape hit (compound child index, 0 otherwise)
    pub sub_shape: SubShapeId,
}

/// One point-containment hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointHit {
    /// Body containing the point
    pub body: BodyId,
}

/// One shape-overlap hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverlapHit {
    /// Overlapping body
    pub body: BodyId,
    /// Sub-shape of the overlapping body
    pub sub_shape: SubShapeId,
}

/// One shape-cast hit.
#[derive(Clone, Copy, Debug)]
pub struct ShapeCastHit {
    /// Body that was hit
    pub body: BodyId,
    /// Fraction along the displacement at first contact
    pub fraction: f32,
    /// World contact point
    pub point: RVec3,
    /// Contact normal, pointing from the cast shape toward the body
    pub normal: Vec3,
    /// Sub-shape hit
    pub sub_shape: SubShapeId,
}

/// Lazy stream of ray hits: candidates come from the broadphase up front, the
/// exact per-body test runs as the iterator is advanced. Finite, restartable
/// by calling the query again.
pub struct RayHits<'a> {
    system: &'a PhysicsSystem,
    ray: RayCast,
    settings: RayCastSettings,
    filter: QueryFilter,
    candidates: Vec<u32>,
    cursor: usize,
}

impl Iterator for RayHits<'_> {
    type Item = RayHit;

    fn next(&mut self) -> Option<RayHit> {
        while self.cursor < self.candidates.len() {
            let index = self.candidates[self.cursor];
            self.cursor += 1;
            if let Some(hit) = self.system.ray_test_body(index, &self.ray, &self.settings, &self.filter)
            {
                return Some(hit);
            }
        }
        None
    }
}

impl RayHits<'_> {
    /// Drain into a vector sorted by ascending fraction (ties keep body slot
    /// order, which is the candidate order).
    #[must_use]
    pub fn sorted(self) -> Vec<RayHit> {
        let mut hits: Vec<RayHit> = self.collect();
        hits.sort_by(|a, b| {
            a.fraction
                .total_cmp(&b.fraction)
                .then_with(|| a.body.index().cmp(&b.body.index()))
        });
        hits
    }
}

/// Lazy stream of point-containment hits.
pub struct PointHits<'a> {
    system: &'a PhysicsSystem,
    point: RVec3,
    filter: QueryFilter,
    candidates: Vec<u32>,
    cursor: usize,
}

impl Iterator for PointHits<'_> {
    type Item = PointHit;

    fn next(&mut self) -> Option<PointHit> {
        while self.cursor < self.candidates.len() {
            let index = self.candidates[self.cursor];
            self.cursor += 1;
            if let Some(hit) = self.system.point_test_body(index, self.point, &self.filter) {
                return Some(hit);
            }
        }
        None
    }
}

impl PhysicsSystem {
    /// Closest ray hit, if any.
    #[must_use]
    pub fn cast_ray(
        &self,
        ray: RayCast,
        settings: &RayCastSettings,
        filter: &QueryFilter,
    ) -> Option<RayHit> {
        let mut best: Option<RayHit> = None;
        for index in self.ray_candidates(&ray) {
            if let Some(hit) = self.ray_test_body(index, &ray, settings, filter) {
                if best.is_none_or(|b| hit.fraction < b.fraction) {
                    best = Some(hit);
                }
            }
        }
        best
    }

    /// True when the ray hits anything (early-out, no ordering guarantee).
    #[must_use]
    pub fn cast_ray_any(
        &self,
        ray: RayCast,
        settings: &RayCastSettings,
        filter: &QueryFilter,
    ) -> bool {
        self.ray_candidates(&ray)
            .into_iter()
            .any(|index| self.ray_test_body(index, &ray, settings, filter).is_some())
    }

    /// All ray hits as a lazy iterator (unsorted; use [`RayHits::sorted`] for
    /// fraction order).
    #[must_use]
    pub fn cast_ray_all(
        &self,
        ray: RayCast,
        settings: &RayCastSettings,
        filter: &QueryFilter,
    ) -> RayHits<'_> {
        RayHits {
            system: self,
            ray,
            settings: *settings,
            filter: *filter,
            candidates: self.ray_candidates(&ray),
            cursor: 0,
        }
    }

    /// All bodies containing a world point, as a lazy iterator.
    #[must_use]
    pub fn collide_point(&self, point: RVec3, filter: &QueryFilter) -> PointHits<'_> {
        let mut candidates = Vec::new();
        let probe = crate::aabb::Aabb::from_center_half(point, RVec3::splat(1.0e-6));
        self.broad_phase.query_aabb(&probe, |index| candidates.push(index));
        candidates.sort_unstable();
        PointHits { system: self, point, filter: *filter, candidates, cursor: 0 }
    }

    /// All bodies whose shapes overlap the given shape at a pose.
    #[must_use]
    pub fn collide_shape(
        &self,
        shape: &Shape,
        rotation: Quat,
        position: RVec3,
        filter: &QueryFilter,
    ) -> Vec<OverlapHit> {
        let aabb = shape.world_aabb(position, rotation);
        let mut candidates = Vec::new();
        self.broad_phase.query_aabb(&aabb, |index| candidates.push(index));
        candidates.sort_unstable();

        let collide = CollideSettings {
            speculative_distance: 0.0,
            tolerance: self.solver_settings.manifold_tolerance_sq.sqrt(),
            active_edge_cos_threshold: self.solver_settings.active_edge_cos_threshold,
        };

        let mut hits = Vec::new();
        for index in candidates {
            let Some((body_id, body)) = self.query_body(index, filter) else { continue };
            let offset = (body.position - position).as_vec3();
            for manifold in narrow_phase::collide_shapes(
                shape, rotation, &body.shape, body.rotation, offset, &collide,
            ) {
                if manifold.points.iter().any(|p| p.penetration >= 0.0) {
                    hits.push(OverlapHit { body: body_id, sub_shape: manifold.sub_shape_b });
                }
            }
        }
        hits.dedup();
        hits
    }

    /// Closest hit sweeping a shape along a displacement.
    ///
    /// `exclude` skips specific bodies (a character's inner body, a vehicle's
    /// own chassis).
    #[must_use]
    pub fn cast_shape(
        &self,
        shape: &Shape,
        rotation: Quat,
        position: RVec3,
        displacement: Vec3,
        filter: &QueryFilter,
        exclude: &[BodyId],
    ) -> Option<ShapeCastHit> {
        let swept = shape
            .world_aabb(position, rotation)
            .extended_by(displacement.as_dvec3())
            .grown(f64::from(self.solver_settings.speculative_contact_distance));
        let mut candidates = Vec::new();
        self.broad_phase.query_aabb(&swept, |index| candidates.push(index));
        candidates.sort_unstable();

        let collide = CollideSettings {
            speculative_distance: self.solver_settings.speculative_contact_distance,
            tolerance: 1.0e-4,
            active_edge_cos_threshold: self.solver_settings.active_edge_cos_threshold,
        };

        let mut best: Option<ShapeCastHit> = None;
        for index in candidates {
            let Some((body_id, body)) = self.query_body(index, filter) else { continue };
            if exclude.contains(&body_id) {
                continue;
            }
            let offset = (body.position - position).as_vec3();
            if let Some(hit) = narrow_phase::cast_shape_vs_shape(
                shape,
                rotation,
                Vec3::ZERO,
                displacement,
                &body.shape,
                body.rotation,
                offset,
                &collide,
            ) {
                if best.as_ref().is_none_or(|b| hit.fraction < b.fraction) {
                    best = Some(ShapeCastHit {
                        body: body_id,
                        fraction: hit.fraction,
                        point: position + hit.point.as_dvec3(),
                        normal: hit.normal,
                        sub_shape: hit.sub_shape,
                    });
                }
            }
        }
        best
    }

    /// All shape-cast hits, sorted by ascending fraction.
    #[must_use]
    pub fn cast_shape_all(
        &self,
        shape: &Shape,
        rotation: Quat,
        position: RVec3,
        displacement: Vec3,
        filter: &QueryFilter,
    ) -> Vec<ShapeCastHit> {
        let swept = shape
            .world_aabb(position, rotation)
            .extended_by(displacement.as_dvec3())
            .grown(f64::from(self.solver_settings.speculative_contact_distance));
        let mut candidates = Vec::new();
        self.broad_phase.query_aabb(&swept, |index| candidates.push(index));
        candidates.sort_unstable();

        let collide = CollideSettings {
            speculative_distance: self.solver_settings.speculative_contact_distance,
            tolerance: 1.0e-4,
            active_edge_cos_threshold: self.solver_settings.active_edge_cos_threshold,
        };

        let mut hits = Vec::new();
        for index in candidates {
            let Some((body_id, body)) = self.query_body(index, filter) else { continue };
            let offset = (body.position - position).as_vec3();
            if let Some(hit) = narrow_phase::cast_shape_vs_shape(
                shape,
                rotation,
                Vec3::ZERO,
                displacement,
                &body.shape,
                body.rotation,
                offset,
                &collide,
            ) {
                hits.push(ShapeCastHit {
                    body: body_id,
                    fraction: hit.fraction,
                    point: position + hit.point.as_dvec3(),
                    normal: hit.normal,
                    sub_shape: hit.sub_shape,
                });
            }
        }
        hits.sort_by(|a, b| {
            a.fraction
                .total_cmp(&b.fraction)
                .then_with(|| a.body.index().cmp(&b.body.index()))
        });
        hits
    }

    // =========== Internal helpers ===========

    /// Broadphase candidates for a ray, in body slot order.
    fn ray_candidates(&self, ray: &RayCast) -> Vec<u32> {
        let mut candidates = Vec::new();
        self.broad_phase
            .cast_ray(ray.origin, ray.direction, 1.0, |index| candidates.push(index));
        candidates.sort_unstable();
        candidates
    }

    /// Filter and fetch a body for a query.
    fn query_body(&self, index: u32, filter: &QueryFilter) -> Option<(BodyId, &crate::body::Body)> {
        let id = self.bodies.id_for_index(index)?;
        let body = self.bodies.get_by_index(index)?;
        filter.matches(&body.filter, body.object_layer).then_some((id, body))
    }

    /// Exact ray test against one body.
    fn ray_test_body(
        &self,
        index: u32,
        ray: &RayCast,
        settings: &RayCastSettings,
        filter: &QueryFilter,
    ) -> Option<RayHit> {
        let (id, body) = self.query_body(index, filter)?;
        let origin = (ray.origin - body.position).as_vec3();
        let direction = ray.direction.as_vec3();
        let (fraction, sub_shape) =
            narrow_phase::ray_shape(&body.shape, body.rotation, Vec3::ZERO, origin, direction, settings)?;
        Some(RayHit { body: id, fraction, sub_shape })
    }

    /// Exact point test against one body.
    fn point_test_body(&self, index: u32, point: RVec3, filter: &QueryFilter) -> Option<PointHit> {
        let (id, body) = self.query_body(index, filter)?;
        let p = (point - body.position).as_vec3();
        narrow_phase::point_in_shape(&body.shape, body.rotation, Vec3::ZERO, p)
            .then_some(PointHit { body: id })
    }
}

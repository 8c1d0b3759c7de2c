//! Narrowphase Collision Dispatcher
//!
//! Exact geometric tests between shape pairs, dispatched on the pair's kind
//! combination with a single match. Produces contact manifolds with a
//! consistent normal direction (first body toward second) and signed
//! penetration (positive = overlapping; small negative values are speculative
//! contacts within the configured margin).
//!
//! The workhorses:
//!
//! - Analytic tests for the sphere/capsule family and box/box (SAT with
//!   reference-face clipping, the case that matters for stable stacking).
//! - GJK closest-point for separated convex pairs, EPA for penetrating ones.
//! - Compound recursion with stable sub-shape attribution.
//! - Ray and shape casts against single shapes, shared by the world queries,
//!   continuous collision and the character controller.
//!
//! All math here is f32 in a frame centered on body A's position; the f64
//! world position only enters when building that frame.

use crate::math::{Quat, Vec3};
use crate::shape::{Shape, SubShapeId};

/// Tolerances handed down from the world settings.
#[derive(Clone, Copy, Debug)]
pub struct CollideSettings {
    /// Contacts are generated when shapes are within this distance.
    pub speculative_distance: f32,
    /// Convergence/degeneracy threshold for the iterative algorithms.
    pub tolerance: f32,
    /// Cosine threshold for the active-edge test: an edge-edge separating
    /// axis this close to a face axis is treated as the face contact.
    pub active_edge_cos_threshold: f32,
}

impl Default for CollideSettings {
    fn default() -> Self {
        Self {
            speculative_distance: 0.02,
            tolerance: 1.0e-4,
            active_edge_cos_threshold: 0.996_195,
        }
    }
}

/// One contact point, positioned relative to body A's origin.
#[derive(Clone, Copy, Debug)]
pub struct ManifoldPoint {
    /// Contact position relative to body A's world position
    pub position: Vec3,
    /// Signed penetration; positive = overlapping
    pub penetration: f32,
}

/// Contact manifold for one (sub-)shape pair.
#[derive(Clone, Debug)]
pub struct PairManifold {
    /// World-space normal, pointing from A toward B
    pub normal: Vec3,
    /// Up to four contact points after reduction
    pub points: Vec<ManifoldPoint>,
    /// Sub-shape of A that produced the manifold
    pub sub_shape_a: SubShapeId,
    /// Sub-shape of B that produced the manifold
    pub sub_shape_b: SubShapeId,
}

/// A convex shape at a pose in the shared A-relative frame.
#[derive(Clone, Copy)]
pub(crate) struct ConvexPose<'a> {
    pub shape: &'a Shape,
    pub rotation: Quat,
    pub translation: Vec3,
}

impl ConvexPose<'_> {
    /// Support point in the shared frame.
    #[inline]
    pub fn support(&self, direction: Vec3) -> Vec3 {
        let local_dir = self.rotation.inverse() * direction;
        self.translation + self.rotation * self.shape.support(local_dir)
    }
}

// ============================================================================
// GJK: closest points and overlap detection
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct SupportPoint {
    /// Minkowski difference point (a - b)
    w: Vec3,
    /// Witness on A
    p_a: Vec3,
    /// Witness on B
    p_b: Vec3,
}

fn minkowski_support(a: &ConvexPose<'_>, b: &ConvexPose<'_>, direction: Vec3) -> SupportPoint {
    let p_a = a.support(direction);
    let p_b = b.support(-direction);
    SupportPoint { w: p_a - p_b, p_a, p_b }
}

/// Result of a closest-point GJK run.
pub(crate) enum GjkStatus {
    /// Shapes are separated by `distance` along `normal` (A toward B).
    Separated {
        distance: f32,
        point_a: Vec3,
        point_b: Vec3,
        normal: Vec3,
    },
    /// Shapes overlap; `simplex` encloses the origin (up to 4 points).
    Overlapping(Vec<(Vec3, Vec3, Vec3)>),
}

/// Closest point to the origin on a simplex, with barycentric witness
/// interpolation. Reduces the simplex to the supporting feature. Returns
/// `None` when the origin is enclosed (tetrahedron case).
fn closest_on_simplex(simplex: &mut Vec<SupportPoint>) -> Option<(Vec3, Vec3, Vec3)> {
    match simplex.len() {
        1 => {
            let s = simplex[0];
            Some((s.w, s.p_a, s.p_b))
        }
        2 => {
            let (a, b) = (simplex[0], simplex[1]);
            let ab = b.w - a.w;
            let denom = ab.length_squared();
            let t = if denom > 0.0 { (-a.w.dot(ab) / denom).clamp(0.0, 1.0) } else { 0.0 };
            if t <= 0.0 {
                simplex.truncate(1);
                return Some((a.w, a.p_a, a.p_b));
            }
            if t >= 1.0 {
                simplex.swap(0, 1);
                simplex.truncate(1);
                return Some((b.w, b.p_a, b.p_b));
            }
            Some((a.w.lerp(b.w, t), a.p_a.lerp(b.p_a, t), a.p_b.lerp(b.p_b, t)))
        }
        3 => {
            let (a, b, c) = (simplex[0], simplex[1], simplex[2]);
            let (u, v, w, feature) = closest_on_triangle(a.w, b.w, c.w);
            match feature {
                TriFeature::VertexA => *simplex = vec![a],
                TriFeature::VertexB => *simplex = vec![b],
                TriFeature::VertexC => *simplex = vec![c],
                TriFeature::EdgeAb => *simplex = vec![a, b],
                TriFeature::EdgeAc => *simplex = vec![a, c],
                TriFeature::EdgeBc => *simplex = vec![b, c],
                TriFeature::Face => {}
            }
            Some((
                u * a.w + v * b.w + w * c.w,
                u * a.p_a + v * b.p_a + w * c.p_a,
                u * a.p_b + v * b.p_b + w * c.p_b,
            ))
        }
        4 => {
            let (a, b, c, d) = (simplex[0], simplex[1], simplex[2], simplex[3]);

            // Signed volume orientation so face normals point outward.
            let faces = [
                [a, b, c, d],
                [a, c, d, b],
                [a, d, b, c],
                [b, d, c, a],
            ];

            let mut best: Option<(f32, Vec<SupportPoint>, (Vec3, Vec3, Vec3))> = None;
            let mut outside_any = false;
            for [p, q, r, opposite] in faces {
                let n = (q.w - p.w).cross(r.w - p.w);
                let n = if n.dot(opposite.w - p.w) > 0.0 { -n } else { n };
                // Origin outside this face?
                if n.dot(-p.w) > 0.0 {
                    outside_any = true;
                    let mut tri = vec![p, q, r];
                    if let Some(closest) = closest_on_simplex(&mut tri) {
                        let dist_sq = closest.0.length_squared();
                        if best.as_ref().is_none_or(|(d, _, _)| dist_sq < *d) {
                            best = Some((dist_sq, tri, closest));
                        }
                    }
                }
            }

            if !outside_any {
                // Origin enclosed.
                return None;
            }
            let (_, reduced, closest) = best.expect("at least one outside face");
            *simplex = reduced;
            Some(closest)
        }
        _ => Some((Vec3::ZERO, Vec3::ZERO, Vec3::ZERO)),
    }
}

enum TriFeature {
    VertexA,
    VertexB,
    VertexC,
    EdgeAb,
    EdgeAc,
    EdgeBc,
    Face,
}

/// Barycentric coordinates of the origin's closest point on triangle (a, b, c)
/// and the supporting feature. Ericson-style region tests.
fn closest_on_triangle(a: Vec3, b: Vec3, c: Vec3) -> (f32, f32, f32, TriFeature) {
    let ab = b - a;
    let ac = c - a;
    let ap = -a;

    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return (1.0, 0.0, 0.0, TriFeature::VertexA);
    }

    let bp = -b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return (0.0, 1.0, 0.0, TriFeature::VertexB);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let t = d1 / (d1 - d3);
        return (1.0 - t, t, 0.0, TriFeature::EdgeAb);
    }

    let cp = -c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return (0.0, 0.0, 1.0, TriFeature::VertexC);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let t = d2 / (d2 - d6);
        return (1.0 - t, 0.0, t, TriFeature::EdgeAc);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let t = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return (0.0, 1.0 - t, t, TriFeature::EdgeBc);
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    (1.0 - v - w, v, w, TriFeature::Face)
}

/// Closest-point GJK between two convex poses.
pub(crate) fn gjk_closest(
    a: &ConvexPose<'_>,
    b: &ConvexPose<'_>,
    tolerance: f32,
) -> GjkStatus {
    const MAX_ITERATIONS: usize = 64;

    let mut direction = b.translation - a.translation;
    if direction.length_squared() < 1.0e-12 {
        direction = Vec3::X;
    }

    let mut simplex = vec![minkowski_support(a, b, -direction)];
    let tol_sq = (tolerance * tolerance).max(1.0e-12);

    for _ in 0..MAX_ITERATIONS {
        let Some((v, p_a, p_b)) = closest_on_simplex(&mut simplex) else {
            return GjkStatus::Overlapping(
                simplex.iter().map(|s| (s.w, s.p_a, s.p_b)).collect(),
            );
        };

        let dist_sq = v.length_squared();
        if dist_sq < tol_sq {
            return GjkStatus::Overlapping(
                simplex.iter().map(|s| (s.w, s.p_a, s.p_b)).collect(),
            );
        }

        let new = minkowski_support(a, b, -v);

        // No progress toward the origin: the current witness is the answer.
        if dist_sq - new.w.dot(v) <= tolerance * dist_sq.sqrt() {
            let distance = dist_sq.sqrt();
            return GjkStatus::Separated {
                distance,
                point_a: p_a,
                point_b: p_b,
                normal: -v / distance,
            };
        }

        if simplex.iter().any(|s| (s.w - new.w).length_squared() < 1.0e-12) {
            let distance = dist_sq.sqrt();
            return GjkStatus::Separated {
                distance,
                point_a: p_a,
                point_b: p_b,
                normal: -v / distance,
            };
        }

        simplex.push(new);
    }

    // Iteration cap: report the best separation seen.
    let (v, p_a, p_b) = closest_on_simplex(&mut simplex).unwrap_or((Vec3::X, Vec3::ZERO, Vec3::ZERO));
    let distance = v.length().max(1.0e-6);
    GjkStatus::Separated { distance, point_a: p_a, point_b: p_b, normal: -v / distance }
}

// ============================================================================
// EPA: penetration depth for overlapping pairs
// ============================================================================

#[derive(Clone, Copy)]
struct EpaFace {
    indices: [usize; 3],
    normal: Vec3,
    distance: f32,
}

fn epa_add_face(faces: &mut Vec<EpaFace>, vertices: &[SupportPoint], i: usize, j: usize, k: usize) {
    let a = vertices[i].w;
    let ab = vertices[j].w - a;
    let ac = vertices[k].w - a;
    let n = ab.cross(ac);
    if n.length_squared() < 1.0e-12 {
        return;
    }
    let n = n.normalize();
    let d = a.dot(n);
    let (normal, distance) = if d < 0.0 { (-n, -d) } else { (n, d) };
    faces.push(EpaFace { indices: [i, j, k], normal, distance });
}

/// Penetration result: depth, normal (A toward B) and a contact point on each
/// body.
pub(crate) struct Penetration {
    pub depth: f32,
    pub normal: Vec3,
    pub point_a: Vec3,
    pub point_b: Vec3,
}

/// Expanding polytope algorithm on the Minkowski difference, starting from a
/// GJK termination simplex (blown up to a tetrahedron when degenerate).
pub(crate) fn epa(
    a: &ConvexPose<'_>,
    b: &ConvexPose<'_>,
    simplex: &[(Vec3, Vec3, Vec3)],
    tolerance: f32,
) -> Option<Penetration> {
    const MAX_ITERATIONS: usize = 64;

    let mut vertices: Vec<SupportPoint> =
        simplex.iter().map(|&(w, p_a, p_b)| SupportPoint { w, p_a, p_b }).collect();

    // Blow a sub-tetrahedron simplex up to a full one.
    let axes = [Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z];
    let mut axis_iter = axes.iter();
    while vertices.len() < 4 {
        let &dir = axis_iter.next()?;
        let candidate = minkowski_support(a, b, dir);
        if vertices.iter().all(|v| (v.w - candidate.w).length_squared() > 1.0e-10) {
            vertices.push(candidate);
        }
    }
    // Reject a degenerate (flat) tetrahedron.
    {
        let (v0, v1, v2, v3) = (vertices[0].w, vertices[1].w, vertices[2].w, vertices[3].w);
        if ((v1 - v0).cross(v2 - v0)).dot(v3 - v0).abs() < 1.0e-10 {
            // Try once more with a perturbed direction.
            let candidate = minkowski_support(a, b, Vec3::new(0.577, 0.577, 0.577));
            vertices[3] = candidate;
            let v3 = vertices[3].w;
            if ((v1 - v0).cross(v2 - v0)).dot(v3 - v0).abs() < 1.0e-10 {
                return None;
            }
        }
    }

    let mut faces = Vec::with_capacity(64);
    epa_add_face(&mut faces, &vertices, 0, 1, 2);
    epa_add_face(&mut faces, &vertices, 0, 3, 1);
    epa_add_face(&mut faces, &vertices, 0, 2, 3);
    epa_add_face(&mut faces, &vertices, 1, 3, 2);
    if faces.is_empty() {
        return None;
    }

    for _ in 0..MAX_ITERATIONS {
        let closest = faces
            .iter()
            .copied()
            .min_by(|x, y| x.distance.total_cmp(&y.distance))?;

        let support = minkowski_support(a, b, closest.normal);
        let support_dist = support.w.dot(closest.normal);

        if support_dist - closest.distance < tolerance {
            // Converged: interpolate witness points on the closest face.
            let [i, j, k] = closest.indices;
            let proj = closest.normal * closest.distance;
            let (u, v, w, _) =
                closest_on_triangle(vertices[i].w - proj, vertices[j].w - proj, vertices[k].w - proj);
            let point_a = u * vertices[i].p_a + v * vertices[j].p_a + w * vertices[k].p_a;
            let point_b = u * vertices[i].p_b + v * vertices[j].p_b + w * vertices[k].p_b;
            return Some(Penetration {
                depth: closest.distance,
                // The outward face normal of the difference is the direction
                // that pushes B out of A, i.e. the A -> B contact normal.
                normal: closest.normal,
                point_a,
                point_b,
            });
        }

        let new_idx = vertices.len();
        vertices.push(support);

        // Remove faces visible from the new vertex, tracking the horizon.
        let mut horizon: Vec<(usize, usize)> = Vec::new();
        faces.retain(|face| {
            let v0 = vertices[face.indices[0]].w;
            if face.normal.dot(support.w - v0) > 0.0 {
                for e in 0..3 {
                    let edge = (face.indices[e], face.indices[(e + 1) % 3]);
                    if let Some(pos) = horizon.iter().position(|&h| h == (edge.1, edge.0)) {
                        horizon.remove(pos);
                    } else {
                        horizon.push(edge);
                    }
                }
                false
            } else {
                true
            }
        });

        for (i, j) in horizon {
            epa_add_face(&mut faces, &vertices, i, j, new_idx);
        }
        if faces.is_empty() {
            return None;
        }
    }

    None
}

// ============================================================================
// Pair dispatch
// ============================================================================

/// Collide two shapes. `rot_*` are world rotations; `offset_ab` is
/// `position_b - position_a` narrowed to f32 (the shared frame is centered on
/// body A). Returns zero or more manifolds (compounds produce one per
/// touching child pair).
pub fn collide_shapes(
    shape_a: &Shape,
    rot_a: Quat,
    shape_b: &Shape,
    rot_b: Quat,
    offset_ab: Vec3,
    settings: &CollideSettings,
) -> Vec<PairManifold> {
    let mut manifolds = Vec::new();
    collide_recursive(
        shape_a, rot_a, Vec3::ZERO, 0,
        shape_b, rot_b, offset_ab, 0,
        settings, &mut manifolds,
    );
    manifolds
}

#[allow(clippy::too_many_arguments)]
fn collide_recursive(
    shape_a: &Shape,
    rot_a: Quat,
    trans_a: Vec3,
    sub_a: SubShapeId,
    shape_b: &Shape,
    rot_b: Quat,
    trans_b: Vec3,
    sub_b: SubShapeId,
    settings: &CollideSettings,
    out: &mut Vec<PairManifold>,
) {
    match (shape_a, shape_b) {
        (Shape::Compound { children }, _) => {
            for (i, child) in children.iter().enumerate() {
                collide_recursive(
                    &child.shape,
                    rot_a * child.local_rotation,
                    trans_a + rot_a * child.local_position,
                    i as SubShapeId,
                    shape_b, rot_b, trans_b, sub_b,
                    settings, out,
                );
            }
        }
        (_, Shape::Compound { children }) => {
            for (i, child) in children.iter().enumerate() {
                collide_recursive(
                    shape_a, rot_a, trans_a, sub_a,
                    &child.shape,
                    rot_b * child.local_rotation,
                    trans_b + rot_b * child.local_position,
                    i as SubShapeId,
                    settings, out,
                );
            }
        }
        _ => {
            if let Some(mut m) = collide_leaf_pair(
                shape_a, rot_a, trans_a, shape_b, rot_b, trans_b, settings,
            ) {
                m.sub_shape_a = sub_a;
                m.sub_shape_b = sub_b;
                out.push(m);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn collide_leaf_pair(
    shape_a: &Shape,
    rot_a: Quat,
    trans_a: Vec3,
    shape_b: &Shape,
    rot_b: Quat,
    trans_b: Vec3,
    settings: &CollideSettings,
) -> Option<PairManifold> {
    match (shape_a, shape_b) {
        // Two planes never produce contacts (static-static geometry).
        (Shape::Plane { .. }, Shape::Plane { .. }) => None,
        // Planes only collide as the static side; flip so the plane is A.
        (_, Shape::Plane { .. }) => {
            let flipped = collide_leaf_pair(
                shape_b, rot_b, trans_b, shape_a, rot_a, trans_a, settings,
            )?;
            Some(flip_manifold(flipped))
        }
        (Shape::Plane { normal, distance, .. }, convex) => {
            collide_plane_convex(*normal, *distance, rot_a, trans_a, convex, rot_b, trans_b, settings)
        }
        (Shape::Sphere { radius: ra }, Shape::Sphere { radius: rb }) => {
            collide_sphere_sphere(trans_a, *ra, trans_b, *rb, settings)
        }
        (Shape::Sphere { radius }, Shape::Capsule { half_height, radius: rc }) => {
            let (p0, p1) = capsule_segment(rot_b, trans_b, *half_height);
            collide_sphere_segment(trans_a, *radius, p0, p1, *rc, settings)
        }
        (Shape::Capsule { half_height, radius: rc }, Shape::Sphere { radius }) => {
            let (p0, p1) = capsule_segment(rot_a, trans_a, *half_height);
            let m = collide_sphere_segment(trans_b, *radius, p0, p1, *rc, settings)?;
            Some(flip_manifold(m))
        }
        (
            Shape::Capsule { half_height: ha, radius: ra },
            Shape::Capsule { half_height: hb, radius: rb },
        ) => {
            let (a0, a1) = capsule_segment(rot_a, trans_a, *ha);
            let (b0, b1) = capsule_segment(rot_b, trans_b, *hb);
            collide_segment_segment(a0, a1, *ra, b0, b1, *rb, settings)
        }
        (Shape::Box { half_extents: hea, .. }, Shape::Box { half_extents: heb, .. }) => {
            collide_box_box(*hea, rot_a, trans_a, *heb, rot_b, trans_b, settings)
        }
        // Everything convex falls through to GJK/EPA.
        _ => {
            let a = ConvexPose { shape: shape_a, rotation: rot_a, translation: trans_a };
            let b = ConvexPose { shape: shape_b, rotation: rot_b, translation: trans_b };
            collide_convex_convex(&a, &b, settings)
        }
    }
}

fn flip_manifold(mut m: PairManifold) -> PairManifold {
    m.normal = -m.normal;
    core::mem::swap(&mut m.sub_shape_a, &mut m.sub_shape_b);
    m
}

fn capsule_segment(rot: Quat, trans: Vec3, half_height: f32) -> (Vec3, Vec3) {
    let axis = rot * Vec3::Y;
    (trans - axis * half_height, trans + axis * half_height)
}

fn collide_sphere_sphere(
    center_a: Vec3,
    ra: f32,
    center_b: Vec3,
    rb: f32,
    settings: &CollideSettings,
) -> Option<PairManifold> {
    let d = center_b - center_a;
    let dist = d.length();
    let penetration = ra + rb - dist;
    if penetration < -settings.speculative_distance {
        return None;
    }

    // Coincident centers: degenerate, fall back to an arbitrary axis.
    let normal = if dist > 1.0e-6 { d / dist } else { Vec3::Y };
    let position = center_a + normal * (ra - penetration * 0.5);
    Some(PairManifold {
        normal,
        points: vec![ManifoldPoint { position, penetration }],
        sub_shape_a: 0,
        sub_shape_b: 0,
    })
}

fn collide_sphere_segment(
    center: Vec3,
    radius: f32,
    seg0: Vec3,
    seg1: Vec3,
    seg_radius: f32,
    settings: &CollideSettings,
) -> Option<PairManifold> {
    let closest = closest_point_on_segment(center, seg0, seg1);
    collide_sphere_sphere(center, radius, closest, seg_radius, settings)
}

fn collide_segment_segment(
    a0: Vec3,
    a1: Vec3,
    ra: f32,
    b0: Vec3,
    b1: Vec3,
    rb: f32,
    settings: &CollideSettings,
) -> Option<PairManifold> {
    let (pa, pb) = closest_points_on_segments(a0, a1, b0, b1);
    collide_sphere_sphere(pa, ra, pb, rb, settings)
}

fn closest_point_on_segment(p: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let ab = b - a;
    let denom = ab.length_squared();
    if denom < 1.0e-12 {
        return a;
    }
    let t = ((p - a).dot(ab) / denom).clamp(0.0, 1.0);
    a + ab * t
}

fn closest_points_on_segments(p1: Vec3, q1: Vec3, p2: Vec3, q2: Vec3) -> (Vec3, Vec3) {
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.length_squared();
    let e = d2.length_squared();
    let f = d2.dot(r);

    let (mut s, mut t);
    if a <= 1.0e-12 && e <= 1.0e-12 {
        return (p1, p2);
    }
    if a <= 1.0e-12 {
        s = 0.0;
        t = (f / e).clamp(0.0, 1.0);
    } else {
        let c = d1.dot(r);
        if e <= 1.0e-12 {
            t = 0.0;
            s = (-c / a).clamp(0.0, 1.0);
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            s = if denom > 1.0e-12 { ((b * f - c * e) / denom).clamp(0.0, 1.0) } else { 0.0 };
            t = (b * s + f) / e;
            if t < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            }
        }
    }
    (p1 + d1 * s, p2 + d2 * t)
}

/// Plane (in A's slot) against a convex shape.
#[allow(clippy::too_many_arguments)]
fn collide_plane_convex(
    local_normal: Vec3,
    local_distance: f32,
    rot_a: Quat,
    trans_a: Vec3,
    convex: &Shape,
    rot_b: Quat,
    trans_b: Vec3,
    settings: &CollideSettings,
) -> Option<PairManifold> {
    let n = rot_a * local_normal; // plane normal in shared frame
    let plane_d = trans_a.dot(n) + local_distance;

    // Candidate deepest points of the convex against the plane.
    let mut candidates: Vec<Vec3> = Vec::new();
    match convex {
        Shape::Sphere { radius } => {
            candidates.push(trans_b - n * *radius);
        }
        Shape::Capsule { half_height, radius } => {
            let (p0, p1) = capsule_segment(rot_b, trans_b, *half_height);
            candidates.push(p0 - n * *radius);
            candidates.push(p1 - n * *radius);
        }
        Shape::Box { half_extents, .. } => {
            for sx in [-1.0f32, 1.0] {
                for sy in [-1.0f32, 1.0] {
                    for sz in [-1.0f32, 1.0] {
                        let corner = Vec3::new(
                            sx * half_extents.x,
                            sy * half_extents.y,
                            sz * half_extents.z,
                        );
                        candidates.push(trans_b + rot_b * corner);
                    }
                }
            }
        }
        Shape::ConvexHull { points, .. } => {
            for &p in points {
                candidates.push(trans_b + rot_b * p);
            }
        }
        _ => {
            let pose = ConvexPose { shape: convex, rotation: rot_b, translation: trans_b };
            candidates.push(pose.support(-n));
        }
    }

    let mut points: Vec<ManifoldPoint> = candidates
        .into_iter()
        .filter_map(|p| {
            let penetration = plane_d - p.dot(n);
            (penetration >= -settings.speculative_distance)
                .then_some(ManifoldPoint { position: p + n * (penetration * 0.5), penetration })
        })
        .collect();

    if points.is_empty() {
        return None;
    }
    reduce_points(&mut points);
    // Normal from plane (A) toward the convex (B).
    Some(PairManifold { normal: n, points, sub_shape_a: 0, sub_shape_b: 0 })
}

/// General convex pair via GJK (separated) or EPA (penetrating). Produces a
/// single contact point; the persistent manifold cache accumulates more
/// across steps.
fn collide_convex_convex(
    a: &ConvexPose<'_>,
    b: &ConvexPose<'_>,
    settings: &CollideSettings,
) -> Option<PairManifold> {
    match gjk_closest(a, b, settings.tolerance) {
        GjkStatus::Separated { distance, point_a, point_b, normal } => {
            if distance > settings.speculative_distance {
                return None;
            }
            let position = (point_a + point_b) * 0.5;
            Some(PairManifold {
                normal,
                points: vec![ManifoldPoint { position, penetration: -distance }],
                sub_shape_a: 0,
                sub_shape_b: 0,
            })
        }
        GjkStatus::Overlapping(simplex) => {
            let pen = epa(a, b, &simplex, settings.tolerance)?;
            let position = (pen.point_a + pen.point_b) * 0.5;
            Some(PairManifold {
                normal: pen.normal,
                points: vec![ManifoldPoint { position, penetration: pen.depth }],
                sub_shape_a: 0,
                sub_shape_b: 0,
            })
        }
    }
}

// ============================================================================
// Box vs box: SAT with reference-face clipping
// ============================================================================

fn collide_box_box(
    half_a: Vec3,
    rot_a: Quat,
    trans_a: Vec3,
    half_b: Vec3,
    rot_b: Quat,
    trans_b: Vec3,
    settings: &CollideSettings,
) -> Option<PairManifold> {
    let axes_a = [rot_a * Vec3::X, rot_a * Vec3::Y, rot_a * Vec3::Z];
    let axes_b = [rot_b * Vec3::X, rot_b * Vec3::Y, rot_b * Vec3::Z];
    let d = trans_b - trans_a;

    let project = |axis: Vec3| -> f32 {
        // Separation along axis: |d.axis| - (extent_a + extent_b)
        let ea = half_a.x * axes_a[0].dot(axis).abs()
            + half_a.y * axes_a[1].dot(axis).abs()
            + half_a.z * axes_a[2].dot(axis).abs();
        let eb = half_b.x * axes_b[0].dot(axis).abs()
            + half_b.y * axes_b[1].dot(axis).abs()
            + half_b.z * axes_b[2].dot(axis).abs();
        d.dot(axis).abs() - (ea + eb)
    };

    // Face axes first; bias keeps face contacts preferred over edge-edge for
    // coherence.
    let mut best_face: Option<(f32, Vec3, bool)> = None; // (separation, axis, a_is_reference)
    for &axis in &axes_a {
        let sep = project(axis);
        if sep > settings.speculative_distance {
            return None;
        }
        if best_face.as_ref().is_none_or(|(s, _, _)| sep > *s) {
            best_face = Some((sep, axis, true));
        }
    }
    for &axis in &axes_b {
        let sep = project(axis);
        if sep > settings.speculative_distance {
            return None;
        }
        if best_face.as_ref().is_none_or(|(s, _, _)| sep > *s) {
            best_face = Some((sep, axis, false));
        }
    }

    let mut best_edge: Option<(f32, Vec3)> = None;
    for &ax_a in &axes_a {
        for &ax_b in &axes_b {
            let axis = ax_a.cross(ax_b);
            if axis.length_squared() < 1.0e-8 {
                continue;
            }
            let axis = axis.normalize();
            let sep = project(axis);
            if sep > settings.speculative_distance {
                return None;
            }
            if best_edge.as_ref().is_none_or(|(s, _)| sep > *s) {
                best_edge = Some((sep, axis));
            }
        }
    }

    let (face_sep, face_axis, a_is_ref) = best_face?;

    // Edge contact only when clearly better than the best face, and only for
    // genuinely active edges: an edge axis nearly parallel to the face axis
    // is the same feature seen twice, so the face manifold wins.
    const EDGE_BIAS: f32 = 0.01;
    if let Some((edge_sep, edge_axis)) = best_edge {
        if edge_sep > face_sep + EDGE_BIAS
            && edge_axis.dot(face_axis).abs() < settings.active_edge_cos_threshold
        {
            let mut normal = edge_axis;
            if normal.dot(d) < 0.0 {
                normal = -normal;
            }
            // Single point from the supporting edges' closest points.
            let pa = support_on_box(half_a, &axes_a, trans_a, normal);
            let pb = support_on_box(half_b, &axes_b, trans_b, -normal);
            let penetration = -edge_sep;
            let position = (pa + pb) * 0.5;
            return Some(PairManifold {
                normal,
                points: vec![ManifoldPoint { position, penetration }],
                sub_shape_a: 0,
                sub_shape_b: 0,
            });
        }
    }

    // Face contact: clip the incident face of the other box against the
    // reference face's side planes.
    let mut normal = face_axis;
    if normal.dot(d) < 0.0 {
        normal = -normal;
    }
    // Normal now points A -> B.

    let (ref_half, ref_axes, ref_center, inc_half, inc_axes, inc_center, ref_normal) = if a_is_ref {
        (half_a, axes_a, trans_a, half_b, axes_b, trans_b, normal)
    } else {
        (half_b, axes_b, trans_b, half_a, axes_a, trans_a, -normal)
    };

    // Incident face: the face of the incident box whose outward normal most
    // opposes the reference normal.
    let mut inc_axis_idx = 0;
    let mut inc_sign = 1.0;
    let mut best = f32::INFINITY;
    for (i, &axis) in inc_axes.iter().enumerate() {
        for sign in [-1.0f32, 1.0] {
            let dot = (axis * sign).dot(ref_normal);
            if dot < best {
                best = dot;
                inc_axis_idx = i;
                inc_sign = sign;
            }
        }
    }

    let inc_normal = inc_axes[inc_axis_idx] * inc_sign;
    let (u_idx, v_idx) = match inc_axis_idx {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    let inc_face_center = inc_center + inc_normal * inc_half[inc_axis_idx];
    let inc_u = inc_axes[u_idx] * inc_half[u_idx];
    let inc_v = inc_axes[v_idx] * inc_half[v_idx];
    let mut poly: Vec<Vec3> = vec![
        inc_face_center + inc_u + inc_v,
        inc_face_center + inc_u - inc_v,
        inc_face_center - inc_u - inc_v,
        inc_face_center - inc_u + inc_v,
    ];

    // Reference face data.
    let ref_axis_idx = ref_axes
        .iter()
        .enumerate()
        .max_by(|(_, x), (_, y)| x.dot(ref_normal).abs().total_cmp(&y.dot(ref_normal).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let ref_sign = if ref_axes[ref_axis_idx].dot(ref_normal) >= 0.0 { 1.0 } else { -1.0 };
    let ref_face_center = ref_center + ref_axes[ref_axis_idx] * (ref_sign * ref_half[ref_axis_idx]);
    let (ru, rv) = match ref_axis_idx {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };

    // Clip against the four side planes of the reference face.
    for &(axis_idx, sign) in
        &[(ru, 1.0f32), (ru, -1.0), (rv, 1.0), (rv, -1.0)]
    {
        let plane_n = ref_axes[axis_idx] * sign;
        let plane_d = ref_center.dot(plane_n) + ref_half[axis_idx];
        poly = clip_polygon(&poly, plane_n, plane_d);
        if poly.is_empty() {
            return None;
        }
    }

    // Keep points at or below the reference face (within the margin).
    let face_plane_n = ref_axes[ref_axis_idx] * ref_sign;
    let face_plane_d = ref_face_center.dot(face_plane_n);
    let mut points: Vec<ManifoldPoint> = poly
        .into_iter()
        .filter_map(|p| {
            let depth = face_plane_d - p.dot(face_plane_n);
            (depth >= -settings.speculative_distance).then_some(ManifoldPoint {
                position: p + face_plane_n * (depth * 0.5),
                penetration: depth,
            })
        })
        .collect();

    if points.is_empty() {
        return None;
    }
    reduce_points(&mut points);
    Some(PairManifold { normal, points, sub_shape_a: 0, sub_shape_b: 0 })
}

fn support_on_box(half: Vec3, axes: &[Vec3; 3], center: Vec3, dir: Vec3) -> Vec3 {
    center
        + axes[0] * half.x.copysign(axes[0].dot(dir))
        + axes[1] * half.y.copysign(axes[1].dot(dir))
        + axes[2] * half.z.copysign(axes[2].dot(dir))
}

/// Sutherland-Hodgman clip of a polygon against the half-space
/// `p . n <= d`.
fn clip_polygon(poly: &[Vec3], n: Vec3, d: f32) -> Vec<Vec3> {
    let mut out = Vec::with_capacity(poly.len() + 2);
    for i in 0..poly.len() {
        let current = poly[i];
        let next = poly[(i + 1) % poly.len()];
        let dc = current.dot(n) - d;
        let dn = next.dot(n) - d;

        if dc <= 0.0 {
            out.push(current);
        }
        if (dc < 0.0 && dn > 0.0) || (dc > 0.0 && dn < 0.0) {
            let t = dc / (dc - dn);
            out.push(current.lerp(next, t));
        }
    }
    out
}

/// Reduce a point set to at most four: deepest point, furthest from it, then
/// twice the point maximizing spanned area.
fn reduce_points(points: &mut Vec<ManifoldPoint>) {
    if points.len() <= 4 {
        return;
    }

    let mut kept: Vec<ManifoldPoint> = Vec::with_capacity(4);

    let deepest = points
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.penetration.total_cmp(&b.penetration))
        .map(|(i, _)| i)
        .unwrap_or(0);
    kept.push(points[deepest]);

    let furthest = points
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            (a.position - kept[0].position)
                .length_squared()
                .total_cmp(&(b.position - kept[0].position).length_squared())
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    kept.push(points[furthest]);

    for _ in 0..2 {
        let (a, b) = (kept[0].position, kept[1].position);
        let best = points
            .iter()
            .enumerate()
            .max_by(|(_, p), (_, q)| {
                let pa = (p.position - a).cross(p.position - b).length_squared();
                let qa = (q.position - a).cross(q.position - b).length_squared();
                pa.total_cmp(&qa)
            })
            .map(|(i, _)| i);
        if let Some(i) = best {
            if !kept.iter().any(|k| (k.position - points[i].position).length_squared() < 1.0e-10) {
                kept.push(points[i]);
            }
        }
    }

    *points = kept;
}

// ============================================================================
// Ray casts against single shapes
// ============================================================================

/// Settings for ray casts.
#[derive(Clone, Copy, Debug)]
pub struct RayCastSettings {
    /// Report fraction 0 for rays starting inside a convex shape.
    pub treat_convex_as_solid: bool,
}

impl Default for RayCastSettings {
    fn default() -> Self {
        Self { treat_convex_as_solid: true }
    }
}

/// Cast a ray segment `origin + t * direction`, `t` in `[0, 1]`, against a
/// shape at a pose in the shared frame. Returns the hit fraction and the
/// sub-shape hit.
pub fn ray_shape(
    shape: &Shape,
    rotation: Quat,
    translation: Vec3,
    origin: Vec3,
    direction: Vec3,
    settings: &RayCastSettings,
) -> Option<(f32, SubShapeId)> {
    match shape {
        Shape::Compound { children } => {
            let mut best: Option<(f32, SubShapeId)> = None;
            for (i, child) in children.iter().enumerate() {
                if let Some((t, _)) = ray_shape(
                    &child.shape,
                    rotation * child.local_rotation,
                    translation + rotation * child.local_position,
                    origin,
                    direction,
                    settings,
                ) {
                    if best.is_none_or(|(bt, _)| t < bt) {
                        best = Some((t, i as SubShapeId));
                    }
                }
            }
            best
        }
        _ => {
            // Transform the ray to shape-local space.
            let inv = rotation.inverse();
            let o = inv * (origin - translation);
            let d = inv * direction;
            ray_local(shape, o, d, settings).map(|t| (t, 0))
        }
    }
}

fn ray_local(shape: &Shape, o: Vec3, d: Vec3, settings: &RayCastSettings) -> Option<f32> {
    match shape {
        Shape::Sphere { radius } => ray_sphere_local(o, d, *radius, settings),
        Shape::Box { half_extents, .. } => ray_box_local(o, d, *half_extents, settings),
        Shape::Capsule { half_height, radius } => {
            ray_capsule_local(o, d, *half_height, *radius, settings)
        }
        Shape::Cylinder { half_height, radius } => {
            ray_cylinder_local(o, d, *half_height, *radius, settings)
        }
        Shape::Plane { normal, distance, .. } => {
            let denom = d.dot(*normal);
            let side = o.dot(*normal) - distance;
            if side <= 0.0 {
                // Behind or on the plane: solid half-space.
                return settings.treat_convex_as_solid.then_some(0.0);
            }
            if denom >= -1.0e-12 {
                return None;
            }
            let t = -side / denom;
            (0.0..=1.0).contains(&t).then_some(t)
        }
        Shape::ConvexHull { .. } => ray_convex_march(shape, o, d, settings),
        Shape::Compound { .. } => unreachable!("compounds handled by ray_shape"),
    }
}

fn ray_sphere_local(o: Vec3, d: Vec3, radius: f32, settings: &RayCastSettings) -> Option<f32> {
    let c = o.length_squared() - radius * radius;
    if c <= 0.0 {
        return settings.treat_convex_as_solid.then_some(0.0);
    }
    let a = d.length_squared();
    if a < 1.0e-12 {
        return None;
    }
    let b = o.dot(d);
    if b > 0.0 {
        return None;
    }
    let disc = b * b - a * c;
    if disc < 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()) / a;
    (0.0..=1.0).contains(&t).then_some(t)
}

fn ray_box_local(o: Vec3, d: Vec3, half: Vec3, settings: &RayCastSettings) -> Option<f32> {
    let inside = o.x.abs() <= half.x && o.y.abs() <= half.y && o.z.abs() <= half.z;
    if inside {
        return settings.treat_convex_as_solid.then_some(0.0);
    }

    let mut t_min = 0.0f32;
    let mut t_max = 1.0f32;
    for axis in 0..3 {
        let (oa, da, ha) = (o[axis], d[axis], half[axis]);
        if da.abs() < 1.0e-12 {
            if oa.abs() > ha {
                return None;
            }
        } else {
            let inv = 1.0 / da;
            let mut t0 = (-ha - oa) * inv;
            let mut t1 = (ha - oa) * inv;
            if t0 > t1 {
                core::mem::swap(&mut t0, &mut t1);
            }
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }
    }
    Some(t_min)
}

fn ray_capsule_local(
    o: Vec3,
    d: Vec3,
    half_height: f32,
    radius: f32,
    settings: &RayCastSettings,
) -> Option<f32> {
    // Inside test against the segment.
    let clamped = Vec3::new(0.0, o.y.clamp(-half_height, half_height), 0.0);
    if (o - clamped).length_squared() <= radius * radius {
        return settings.treat_convex_as_solid.then_some(0.0);
    }

    let mut best: Option<f32> = None;
    // Infinite cylinder in XZ.
    let a = d.x * d.x + d.z * d.z;
    if a > 1.0e-12 {
        let b = o.x * d.x + o.z * d.z;
        let c = o.x * o.x + o.z * o.z - radius * radius;
        let disc = b * b - a * c;
        if disc >= 0.0 {
            let t = (-b - disc.sqrt()) / a;
            if (0.0..=1.0).contains(&t) {
                let y = o.y + t * d.y;
                if y.abs() <= half_height {
                    best = Some(t);
                }
            }
        }
    }
    // Cap spheres.
    for cap_y in [half_height, -half_height] {
        let oc = o - Vec3::new(0.0, cap_y, 0.0);
        let a = d.length_squared();
        if a < 1.0e-12 {
            continue;
        }
        let b = oc.dot(d);
        let c = oc.length_squared() - radius * radius;
        let disc = b * b - a * c;
        if disc >= 0.0 {
            let t = (-b - disc.sqrt()) / a;
            if (0.0..=1.0).contains(&t) && best.is_none_or(|bt| t < bt) {
                best = Some(t);
            }
        }
    }
    best
}

fn ray_cylinder_local(
    o: Vec3,
    d: Vec3,
    half_height: f32,
    radius: f32,
    settings: &RayCastSettings,
) -> Option<f32> {
    let inside =
        o.y.abs() <= half_height && (o.x * o.x + o.z * o.z) <= radius * radius;
    if inside {
        return settings.treat_convex_as_solid.then_some(0.0);
    }

    let mut best: Option<f32> = None;
    let a = d.x * d.x + d.z * d.z;
    if a > 1.0e-12 {
        let b = o.x * d.x + o.z * d.z;
        let c = o.x * o.x + o.z * o.z - radius * radius;
        let disc = b * b - a * c;
        if disc >= 0.0 {
            let t = (-b - disc.sqrt()) / a;
            if (0.0..=1.0).contains(&t) && (o.y + t * d.y).abs() <= half_height {
                best = Some(t);
            }
        }
    }
    // End caps.
    if d.y.abs() > 1.0e-12 {
        for cap_y in [half_height, -half_height] {
            let t = (cap_y - o.y) / d.y;
            if (0.0..=1.0).contains(&t) {
                let x = o.x + t * d.x;
                let z = o.z + t * d.z;
                if x * x + z * z <= radius * radius && best.is_none_or(|bt| t < bt) {
                    best = Some(t);
                }
            }
        }
    }
    best
}

/// Conservative-advancement point cast against an arbitrary convex shape.
fn ray_convex_march(shape: &Shape, o: Vec3, d: Vec3, settings: &RayCastSettings) -> Option<f32> {
    const MAX_STEPS: usize = 32;
    let point_shape = Shape::Sphere { radius: 0.0 };
    let target = ConvexPose { shape, rotation: Quat::IDENTITY, translation: Vec3::ZERO };

    let mut t = 0.0f32;
    for _ in 0..MAX_STEPS {
        let probe = ConvexPose {
            shape: &point_shape,
            rotation: Quat::IDENTITY,
            translation: o + d * t,
        };
        match gjk_closest(&probe, &target, 1.0e-5) {
            GjkStatus::Overlapping(_) => {
                if t == 0.0 {
                    return settings.treat_convex_as_solid.then_some(0.0);
                }
                return Some(t);
            }
            GjkStatus::Separated { distance, normal, .. } => {
                if distance < 1.0e-4 {
                    return Some(t);
                }
                let closing = d.dot(normal);
                if closing <= 1.0e-9 {
                    return None;
                }
                t += distance / closing;
                if t > 1.0 {
                    return None;
                }
            }
        }
    }
    None
}

// ============================================================================
// Shape cast (conservative advancement)
// ============================================================================

/// Result of a shape cast in the shared frame.
#[derive(Clone, Copy, Debug)]
pub struct ShapeCastHit {
    /// Fraction along the displacement at first contact
    pub fraction: f32,
    /// Contact point in the shared frame
    pub point: Vec3,
    /// Contact normal, pointing from the cast shape toward the hit shape
    pub normal: Vec3,
    /// Sub-shape of the hit shape
    pub sub_shape: SubShapeId,
}

/// Sweep `shape_a` from its pose along `displacement` against `shape_b`.
/// Returns the first time of impact within the displacement.
#[allow(clippy::too_many_arguments)]
pub fn cast_shape_vs_shape(
    shape_a: &Shape,
    rot_a: Quat,
    trans_a: Vec3,
    displacement: Vec3,
    shape_b: &Shape,
    rot_b: Quat,
    trans_b: Vec3,
    settings: &CollideSettings,
) -> Option<ShapeCastHit> {
    // Compounds sweep each child.
    if let Shape::Compound { children } = shape_b {
        let mut best: Option<ShapeCastHit> = None;
        for (i, child) in children.iter().enumerate() {
            if let Some(mut hit) = cast_shape_vs_shape(
                shape_a,
                rot_a,
                trans_a,
                displacement,
                &child.shape,
                rot_b * child.local_rotation,
                trans_b + rot_b * child.local_position,
                settings,
            ) {
                hit.sub_shape = i as SubShapeId;
                if best.is_none_or(|b| hit.fraction < b.fraction) {
                    best = Some(hit);
                }
            }
        }
        return best;
    }
    if let Shape::Compound { children } = shape_a {
        let mut best: Option<ShapeCastHit> = None;
        for child in children {
            if let Some(hit) = cast_shape_vs_shape(
                &child.shape,
                rot_a * child.local_rotation,
                trans_a + rot_a * child.local_position,
                displacement,
                shape_b,
                rot_b,
                trans_b,
                settings,
            ) {
                if best.is_none_or(|b| hit.fraction < b.fraction) {
                    best = Some(hit);
                }
            }
        }
        return best;
    }
    // Planes: cast against the half-space analytically.
    if let Shape::Plane { normal, distance, .. } = shape_b {
        let n = rot_b * *normal;
        let plane_d = trans_b.dot(n) + distance;
        let a_pose = ConvexPose { shape: shape_a, rotation: rot_a, translation: trans_a };
        let deepest = a_pose.support(-n);
        let side = deepest.dot(n) - plane_d;
        if side <= 0.0 {
            return Some(ShapeCastHit { fraction: 0.0, point: deepest, normal: -n, sub_shape: 0 });
        }
        let closing = -displacement.dot(n);
        if closing <= 1.0e-9 {
            return None;
        }
        let t = side / closing;
        if t > 1.0 {
            return None;
        }
        return Some(ShapeCastHit {
            fraction: t,
            point: deepest + displacement * t,
            normal: -n,
            sub_shape: 0,
        });
    }

    const MAX_STEPS: usize = 32;
    let b_pose = ConvexPose { shape: shape_b, rotation: rot_b, translation: trans_b };

    let mut t = 0.0f32;
    let mut last_normal = Vec3::ZERO;
    let mut last_point = Vec3::ZERO;
    for _ in 0..MAX_STEPS {
        let a_pose = ConvexPose {
            shape: shape_a,
            rotation: rot_a,
            translation: trans_a + displacement * t,
        };
        match gjk_closest(&a_pose, &b_pose, settings.tolerance) {
            GjkStatus::Overlapping(simplex) => {
                if t == 0.0 {
                    // Started in contact; resolve a normal via EPA.
                    let pen = epa(&a_pose, &b_pose, &simplex, settings.tolerance)?;
                    return Some(ShapeCastHit {
                        fraction: 0.0,
                        point: (pen.point_a + pen.point_b) * 0.5,
                        normal: pen.normal,
                        sub_shape: 0,
                    });
                }
                return Some(ShapeCastHit {
                    fraction: t,
                    point: last_point,
                    normal: last_normal,
                    sub_shape: 0,
                });
            }
            GjkStatus::Separated { distance, point_a, point_b, normal } => {
                last_normal = normal;
                last_point = (point_a + point_b) * 0.5;
                if distance < settings.tolerance.max(1.0e-4) {
                    return Some(ShapeCastHit {
                        fraction: t,
                        point: last_point,
                        normal,
                        sub_shape: 0,
                    });
                }
                let closing = displacement.dot(normal);
                if closing <= 1.0e-9 {
                    return None;
                }
                t += distance / closing;
                if t > 1.0 {
                    return None;
                }
            }
        }
    }
    None
}

/// Point containment against a shape at a pose in the shared frame.
pub fn point_in_shape(shape: &Shape, rotation: Quat, translation: Vec3, point: Vec3) -> bool {
    match shape {
        Shape::Compound { children } => children.iter().enumerate().any(|(_, child)| {
            point_in_shape(
                &child.shape,
                rotation * child.local_rotation,
                translation + rotation * child.local_position,
                point,
            )
        }),
        Shape::Plane { normal, distance, .. } => {
            let inv = rotation.inverse();
            let p = inv * (point - translation);
            p.dot(*normal) - distance <= 0.0
        }
        _ => {
            let inv = rotation.inverse();
            let p = inv * (point - translation);
            match shape {
                Shape::Sphere { radius } => p.length_squared() <= radius * radius,
                Shape::Box { half_extents, .. } => {
                    p.x.abs() <= half_extents.x
                        && p.y.abs() <= half_extents.y
                        && p.z.abs() <= half_extents.z
                }
                Shape::Capsule { half_height, radius } => {
                    let clamped = Vec3::new(0.0, p.y.clamp(-half_height, *half_height), 0.0);
                    (p - clamped).length_squared() <= radius * radius
                }
                Shape::Cylinder { half_height, radius } => {
                    p.y.abs() <= *half_height && p.x * p.x + p.z * p.z <= radius * radius
                }
                Shape::ConvexHull { .. } => {
                    let probe_shape = Shape::Sphere { radius: 0.0 };
                    let probe = ConvexPose {
                        shape: &probe_shape,
                        rotation: Quat::IDENTITY,
                        translation: p,
                    };
                    let hull =
                        ConvexPose { shape, rotation: Quat::IDENTITY, translation: Vec3::ZERO };
                    matches!(gjk_closest(&probe, &hull, 1.0e-5), GjkStatus::Overlapping(_))
                }
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn settings() -> CollideSettings {
        CollideSettings::default()
    }

    #[test]
    fn test_sphere_sphere_overlap() {
        let a = Shape::Sphere { radius: 1.0 };
        let b = Shape::Sphere { radius: 1.0 };
        let manifolds = collide_shapes(
            &a, Quat::IDENTITY, &b, Quat::IDENTITY, Vec3::new(1.5, 0.0, 0.0), &settings(),
        );
        assert_eq!(manifolds.len(), 1);
        let m = &manifolds[0];
        assert_relative_eq!(m.normal.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(m.points[0].penetration, 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_sphere_sphere_separated_beyond_margin() {
        let a = Shape::Sphere { radius: 1.0 };
        let b = Shape::Sphere { radius: 1.0 };
        let manifolds = collide_shapes(
            &a, Quat::IDENTITY, &b, Quat::IDENTITY, Vec3::new(3.0, 0.0, 0.0), &settings(),
        );
        assert!(manifolds.is_empty());
    }

    #[test]
    fn test_box_box_stacking_manifold() {
        let a = Shape::Box { half_extents: Vec3::splat(0.5), convex_radius: 0.0 };
        let b = Shape::Box { half_extents: Vec3::splat(0.5), convex_radius: 0.0 };
        // B rests on top of A with a little overlap.
        let manifolds = collide_shapes(
            &a, Quat::IDENTITY, &b, Quat::IDENTITY, Vec3::new(0.0, 0.95, 0.0), &settings(),
        );
        assert_eq!(manifolds.len(), 1);
        let m = &manifolds[0];
        assert!(m.normal.y > 0.99, "normal = {:?}", m.normal);
        assert_eq!(m.points.len(), 4, "stacked boxes should give a 4-point manifold");
        for p in &m.points {
            assert_relative_eq!(p.penetration, 0.05, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_plane_box_contact() {
        let plane = Shape::Plane { normal: Vec3::Y, distance: 0.0, half_extent: 100.0 };
        let b = Shape::Box { half_extents: Vec3::splat(0.5), convex_radius: 0.0 };
        let manifolds = collide_shapes(
            &plane, Quat::IDENTITY, &b, Quat::IDENTITY, Vec3::new(0.0, 0.45, 0.0), &settings(),
        );
        assert_eq!(manifolds.len(), 1);
        let m = &manifolds[0];
        assert!(m.normal.y > 0.99);
        assert_eq!(m.points.len(), 4);
        for p in &m.points {
            assert_relative_eq!(p.penetration, 0.05, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_plane_convex_flipped_when_second() {
        let plane = Shape::Plane { normal: Vec3::Y, distance: 0.0, half_extent: 100.0 };
        let sphere = Shape::Sphere { radius: 1.0 };
        // Sphere is A, plane is B: normal must point from sphere toward plane.
        let manifolds = collide_shapes(
            &sphere, Quat::IDENTITY, &plane, Quat::IDENTITY, Vec3::new(0.0, -0.9, 0.0), &settings(),
        );
        assert_eq!(manifolds.len(), 1);
        assert!(manifolds[0].normal.y < -0.99, "normal = {:?}", manifolds[0].normal);
    }

    #[test]
    fn test_gjk_epa_cylinder_box() {
        let cyl = Shape::Cylinder { half_height: 1.0, radius: 0.5 };
        let b = Shape::Box { half_extents: Vec3::splat(0.5), convex_radius: 0.0 };
        let manifolds = collide_shapes(
            &cyl, Quat::IDENTITY, &b, Quat::IDENTITY, Vec3::new(0.9, 0.0, 0.0), &settings(),
        );
        assert_eq!(manifolds.len(), 1);
        let m = &manifolds[0];
        assert!(m.normal.x > 0.9, "normal = {:?}", m.normal);
        assert!(m.points[0].penetration > 0.0);
    }

    #[test]
    fn test_speculative_contact_has_negative_penetration() {
        let a = Shape::Sphere { radius: 1.0 };
        let b = Shape::Sphere { radius: 1.0 };
        let manifolds = collide_shapes(
            &a, Quat::IDENTITY, &b, Quat::IDENTITY, Vec3::new(2.01, 0.0, 0.0), &settings(),
        );
        assert_eq!(manifolds.len(), 1);
        assert!(manifolds[0].points[0].penetration < 0.0);
    }

    #[test]
    fn test_compound_sub_shape_attribution() {
        let compound = Shape::compound(vec![
            crate::shape::CompoundChild {
                local_position: Vec3::new(-2.0, 0.0, 0.0),
                local_rotation: Quat::IDENTITY,
                shape: Shape::sphere(0.5),
            },
            crate::shape::CompoundChild {
                local_position: Vec3::new(2.0, 0.0, 0.0),
                local_rotation: Quat::IDENTITY,
                shape: Shape::sphere(0.5),
            },
        ]);
        let sphere = Shape::Sphere { radius: 0.5 };
        // Touch only the second child.
        let manifolds = collide_shapes(
            &compound, Quat::IDENTITY, &sphere, Quat::IDENTITY, Vec3::new(2.9, 0.0, 0.0),
            &settings(),
        );
        assert_eq!(manifolds.len(), 1);
        assert_eq!(manifolds[0].sub_shape_a, 1);
    }

    #[test]
    fn test_ray_sphere_fraction() {
        let sphere = Shape::Sphere { radius: 1.0 };
        // From x=-5 toward +x, 10 units long: surface at x=-1 -> t = 0.4.
        let hit = ray_shape(
            &sphere,
            Quat::IDENTITY,
            Vec3::ZERO,
            Vec3::new(-5.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            &RayCastSettings::default(),
        );
        let (t, _) = hit.expect("should hit");
        assert_relative_eq!(t, 0.4, epsilon = 1e-5);
    }

    #[test]
    fn test_ray_sphere_miss_with_offset() {
        let sphere = Shape::Sphere { radius: 1.0 };
        let hit = ray_shape(
            &sphere,
            Quat::IDENTITY,
            Vec3::ZERO,
            Vec3::new(-5.0, 1.5, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            &RayCastSettings::default(),
        );
        assert!(hit.is_none());
    }

    #[test]
    fn test_ray_inside_solid_reports_zero() {
        let sphere = Shape::Sphere { radius: 1.0 };
        let hit = ray_shape(
            &sphere,
            Quat::IDENTITY,
            Vec3::ZERO,
            Vec3::ZERO,
            Vec3::new(10.0, 0.0, 0.0),
            &RayCastSettings::default(),
        );
        assert_eq!(hit, Some((0.0, 0)));

        let hit = ray_shape(
            &sphere,
            Quat::IDENTITY,
            Vec3::ZERO,
            Vec3::ZERO,
            Vec3::new(10.0, 0.0, 0.0),
            &RayCastSettings { treat_convex_as_solid: false },
        );
        assert!(hit.is_none());
    }

    #[test]
    fn test_ray_rotated_box() {
        let b = Shape::Box { half_extents: Vec3::new(2.0, 0.5, 0.5), convex_radius: 0.0 };
        let rot = Quat::from_axis_angle(Vec3::Z, core::f32::consts::FRAC_PI_2);
        // Long axis now vertical; a ray down the Y axis from above must hit at
        // y = 2.
        let hit = ray_shape(
            &b,
            rot,
            Vec3::ZERO,
            Vec3::new(0.0, 5.0, 0.0),
            Vec3::new(0.0, -10.0, 0.0),
            &RayCastSettings::default(),
        );
        let (t, _) = hit.expect("should hit");
        assert_relative_eq!(t, 0.3, epsilon = 1e-4);
    }

    #[test]
    fn test_ray_convex_hull() {
        // A tetrahedron-ish hull around the origin.
        let hull = Shape::ConvexHull {
            points: vec![
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(-1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(0.0, -1.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0),
                Vec3::new(0.0, 0.0, -1.0),
            ],
            convex_radius: 0.0,
        };
        let hit = ray_shape(
            &hull,
            Quat::IDENTITY,
            Vec3::ZERO,
            Vec3::new(-5.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            &RayCastSettings::default(),
        );
        let (t, _) = hit.expect("should hit octahedron");
        assert_relative_eq!(t, 0.4, epsilon = 2e-3);
    }

    #[test]
    fn test_cast_sphere_against_box() {
        let moving = Shape::Sphere { radius: 0.5 };
        let target = Shape::Box { half_extents: Vec3::splat(0.5), convex_radius: 0.0 };
        // Sphere starts at x=-3 and moves +5x toward a unit box at origin.
        // Surfaces meet when the center is at x=-1 -> fraction 0.4.
        let hit = cast_shape_vs_shape(
            &moving,
            Quat::IDENTITY,
            Vec3::new(-3.0, 0.0, 0.0),
            Vec3::new(5.0, 0.0, 0.0),
            &target,
            Quat::IDENTITY,
            Vec3::ZERO,
            &settings(),
        );
        let hit = hit.expect("should hit");
        assert_relative_eq!(hit.fraction, 0.4, epsilon = 5e-3);
        assert!(hit.normal.x > 0.9, "normal = {:?}", hit.normal);
    }

    #[test]
    fn test_cast_miss_moving_away() {
        let moving = Shape::Sphere { radius: 0.5 };
        let target = Shape::Sphere { radius: 0.5 };
        let hit = cast_shape_vs_shape(
            &moving,
            Quat::IDENTITY,
            Vec3::new(-3.0, 0.0, 0.0),
            Vec3::new(-5.0, 0.0, 0.0),
            &target,
            Quat::IDENTITY,
            Vec3::ZERO,
            &settings(),
        );
        assert!(hit.is_none());
    }

    #[test]
    fn test_point_in_shape() {
        let b = Shape::Box { half_extents: Vec3::splat(1.0), convex_radius: 0.0 };
        assert!(point_in_shape(&b, Quat::IDENTITY, Vec3::ZERO, Vec3::new(0.5, 0.5, 0.5)));
        assert!(!point_in_shape(&b, Quat::IDENTITY, Vec3::ZERO, Vec3::new(1.5, 0.0, 0.0)));

        let capsule = Shape::Capsule { half_height: 1.0, radius: 0.5 };
        assert!(point_in_shape(&capsule, Quat::IDENTITY, Vec3::ZERO, Vec3::new(0.0, 1.3, 0.0)));
        assert!(!point_in_shape(&capsule, Quat::IDENTITY, Vec3::ZERO, Vec3::new(0.0, 1.6, 0.0)));
    }

    #[test]
    fn test_reduce_points_keeps_deepest() {
        let mut points: Vec<ManifoldPoint> = (0..8)
            .map(|i| ManifoldPoint {
                position: Vec3::new(i as f32, 0.0, (i % 3) as f32),
                penetration: 0.01 * i as f32,
            })
            .collect();
        reduce_points(&mut points);
        assert!(points.len() <= 4);
        assert!(points.iter().any(|p| (p.penetration - 0.07).abs() < 1e-6));
    }
}

//! Sequential-Impulse Contact & Constraint Solver
//!
//! Two phases per collision step, both iterative with fixed counts:
//!
//! 1. **Velocity iterations** — resolve penetrating velocity along contact
//!    normals (with restitution above the configured threshold) and apply
//!    friction bounded by a cone approximation (`|t| <= mu * n`).
//! 2. **Position iterations** — pseudo-impulses correcting residual
//!    penetration beyond the slop, applied straight to the poses.
//!
//! Warm starting seeds each contact with the previous step's accumulated
//! impulses from the manifold cache. Within an island, constraints are solved
//! in discovery/creation order, so results are reproducible for a fixed
//! thread count; islands never share bodies, so cross-island scheduling order
//! cannot change results.
//!
//! Solving operates on [`SolverBody`] working copies laid out contiguously
//! per island, which is what lets islands run on worker threads without locks.

use crate::body::Body;
use crate::config::SolverSettings;
use crate::constraint::{Constraint, ConstraintId, PreparedJoint};
use crate::contact::{ContactManifold, ManifoldKey};
use crate::math::{
    integrate_rotation, inverse_inertia_world, is_finite_vec3, tangent_frame, Mat3, Quat, RVec3,
    Vec3,
};
use crate::vehicle::VehicleRun;

/// Working copy of a body's dynamic state for one solve.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SolverBody {
    pub position: RVec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub inv_mass: f32,
    pub inv_inertia_world: Mat3,
    pub linear_dof_mask: Vec3,
    pub angular_dof_mask: Vec3,
    pub body_index: u32,
}

impl SolverBody {
    /// Snapshot a body's state.
    pub(crate) fn from_body(body: &Body, body_index: u32) -> Self {
        Self {
            position: body.position,
            rotation: body.rotation,
            linear_velocity: body.linear_velocity,
            angular_velocity: body.angular_velocity,
            inv_mass: body.inv_mass(),
            inv_inertia_world: inverse_inertia_world(body.inv_inertia_local(), body.rotation),
            linear_dof_mask: body.allowed_dofs.linear_mask(),
            angular_dof_mask: body.allowed_dofs.angular_mask(),
            body_index,
        }
    }

    /// Write the solved state back, guarding against non-finite values
    /// escaping into the store.
    pub(crate) fn write_back(&self, body: &mut Body) {
        debug_assert!(
            is_finite_vec3(self.linear_velocity) && is_finite_vec3(self.angular_velocity),
            "solver produced non-finite velocities for body {}",
            self.body_index
        );
        if !is_finite_vec3(self.linear_velocity) || !is_finite_vec3(self.angular_velocity) {
            log::error!(
                "non-finite velocity on body slot {}; zeroing to preserve the world",
                self.body_index
            );
            body.linear_velocity = Vec3::ZERO;
            body.angular_velocity = Vec3::ZERO;
            return;
        }
        body.position = self.position;
        body.rotation = self.rotation;
        body.linear_velocity = self.linear_velocity;
        body.angular_velocity = self.angular_velocity;
    }

    /// Velocity of a point at offset `r` from the center of mass.
    #[inline]
    pub(crate) fn velocity_at(&self, r: Vec3) -> Vec3 {
        self.linear_velocity + self.angular_velocity.cross(r)
    }

    #[cfg(test)]
    pub(crate) fn test_dynamic(position: RVec3, mass: f32) -> Self {
        // Unit-sphere inertia for a body of the given mass.
        let inertia = 0.4 * mass;
        Self {
            position,
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            inv_mass: 1.0 / mass,
            inv_inertia_world: Mat3::from_diagonal(Vec3::splat(1.0 / inertia)),
            linear_dof_mask: Vec3::ONE,
            angular_dof_mask: Vec3::ONE,
            body_index: 0,
        }
    }
}

/// One side of a prepared constraint: a body in the island slice, or an
/// inline snapshot of a static/kinematic body (zero inverse mass, so applied
/// impulses are no-ops, but its velocity still enters the relative terms).
#[derive(Clone, Copy, Debug)]
pub(crate) enum BodyRef {
    /// Island-local index into the island's body slice
    Island(u32),
    /// Inline copy of a non-simulated body
    Fixed(SolverBody),
}

impl BodyRef {
    /// Island-local index when dynamic.
    pub(crate) fn island_index(&self) -> Option<u32> {
        match self {
            BodyRef::Island(i) => Some(*i),
            BodyRef::Fixed(_) => None,
        }
    }
}

/// Disjoint mutable access to two island bodies.
fn two_mut(bodies: &mut [SolverBody], i: usize, j: usize) -> (&mut SolverBody, &mut SolverBody) {
    debug_assert_ne!(i, j, "a constraint cannot reference the same body twice");
    if i < j {
        let (left, right) = bodies.split_at_mut(j);
        (&mut left[i], &mut right[0])
    } else {
        let (left, right) = bodies.split_at_mut(i);
        (&mut right[0], &mut left[j])
    }
}

/// Resolve both sides of a constraint to mutable bodies, materializing fixed
/// sides in scratch space.
macro_rules! resolve_pair {
    ($bodies:expr, $a:expr, $b:expr, $scratch_a:ident, $scratch_b:ident) => {{
        match ($a, $b) {
            (BodyRef::Island(i), BodyRef::Island(j)) => two_mut($bodies, i as usize, j as usize),
            (BodyRef::Island(i), BodyRef::Fixed(sb)) => {
                $scratch_b = sb;
                (&mut $bodies[i as usize], &mut $scratch_b)
            }
            (BodyRef::Fixed(sa), BodyRef::Island(j)) => {
                $scratch_a = sa;
                (&mut $scratch_a, &mut $bodies[j as usize])
            }
            (BodyRef::Fixed(sa), BodyRef::Fixed(sb)) => {
                $scratch_a = sa;
                $scratch_b = sb;
                (&mut $scratch_a, &mut $scratch_b)
            }
        }
    }};
}

// ============================================================================
// Contact constraints
// ============================================================================

/// Per-point solver state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ContactPoint {
    /// Anchor offset from A's center of mass (world orientation)
    pub r_a: Vec3,
    /// Anchor offset from B's center of mass
    pub r_b: Vec3,
    /// Effective mass along the normal
    pub normal_mass: f32,
    /// Effective mass along each tangent
    pub tangent_mass: [f32; 2],
    /// Restitution target velocity (>= 0, outgoing)
    pub restitution_bias: f32,
    /// Separation allowance for speculative contacts (>= 0)
    pub speculative_allowance: f32,
    /// `penetration + (p_b0 - p_a0) . n`, for recomputing penetration during
    /// position iterations
    pub position_rest: f32,
    /// Signed penetration at prepare time
    pub penetration: f32,
    /// Accumulated normal impulse
    pub lambda_n: f32,
    /// Accumulated tangent impulses
    pub lambda_t: [f32; 2],
    /// Which manifold point this came from
    pub cache_slot: u32,
}

/// Prepared contact constraint for one manifold.
#[derive(Clone, Debug)]
pub(crate) struct ContactConstraint {
    pub body_a: BodyRef,
    pub body_b: BodyRef,
    /// World normal, A toward B
    pub normal: Vec3,
    pub tangent1: Vec3,
    pub tangent2: Vec3,
    pub friction: f32,
    pub points: Vec<ContactPoint>,
    /// Cache key for writing impulses back after the solve
    pub key: ManifoldKey,
}

impl ContactConstraint {
    /// Prepare a manifold for solving. `a`/`b` follow the manifold's canonical
    /// (first, second) order; the manifold normal points first -> second.
    pub(crate) fn prepare(
        manifold: &ContactManifold,
        body_a: BodyRef,
        body_b: BodyRef,
        a: &SolverBody,
        b: &SolverBody,
        settings: &SolverSettings,
        dt: f32,
    ) -> Self {
        let normal = manifold.normal;
        let (tangent1, tangent2) = tangent_frame(normal);
        let inv_dt = if dt > 0.0 { 1.0 / dt } else { 0.0 };

        let offset_ab = (b.position - a.position).as_vec3();
        let mut points = Vec::with_capacity(manifold.points.len());
        for (slot, p) in manifold.points.iter().enumerate() {
            let r_a = a.rotation * p.local_first;
            let r_b = b.rotation * p.local_second;

            let normal_mass = effective_mass(a, b, r_a, r_b, normal);
            let tangent_mass = [
                effective_mass(a, b, r_a, r_b, tangent1),
                effective_mass(a, b, r_a, r_b, tangent2),
            ];

            // Restitution only above the threshold closing speed.
            let v_n = (b.velocity_at(r_b) - a.velocity_at(r_a)).dot(normal);
            let restitution_bias = if v_n < -settings.min_velocity_for_restitution {
                -manifold.restitution * v_n
            } else {
                0.0
            };

            // Separated (speculative) contacts may close the gap this step.
            let speculative_allowance = (-p.penetration).max(0.0) * inv_dt;

            let gap0 = (offset_ab + r_b - r_a).dot(normal);
            points.push(ContactPoint {
                r_a,
                r_b,
                normal_mass,
                tangent_mass,
                restitution_bias,
                speculative_allowance,
                position_rest: p.penetration + gap0,
                penetration: p.penetration,
                lambda_n: p.lambda_n,
                lambda_t: [p.lambda_t1, p.lambda_t2],
                cache_slot: slot as u32,
            });
        }

        Self {
            body_a,
            body_b,
            normal,
            tangent1,
            tangent2,
            friction: manifold.friction,
            points,
            key: manifold.key,
        }
    }

    /// Apply cached impulses as the warm-start seed.
    pub(crate) fn warm_start(&mut self, bodies: &mut [SolverBody], factor: f32) {
        let mut scratch_a;
        let mut scratch_b;
        let (a, b) = resolve_pair!(bodies, self.body_a, self.body_b, scratch_a, scratch_b);

        for p in &mut self.points {
            p.lambda_n *= factor;
            p.lambda_t[0] *= factor;
            p.lambda_t[1] *= factor;
            let impulse = self.normal * p.lambda_n
                + self.tangent1 * p.lambda_t[0]
                + self.tangent2 * p.lambda_t[1];
            apply_contact_impulse(a, b, p.r_a, p.r_b, impulse);
        }
    }

    /// One velocity iteration over all points: normal first, then friction
    /// clamped to the cone.
    pub(crate) fn solve_velocity(&mut self, bodies: &mut [SolverBody]) {
        let mut scratch_a;
        let mut scratch_b;
        let (a, b) = resolve_pair!(bodies, self.body_a, self.body_b, scratch_a, scratch_b);

        for p in &mut self.points {
            // Normal impulse.
            let v_n = (b.velocity_at(p.r_b) - a.velocity_at(p.r_a)).dot(self.normal);
            let target = p.restitution_bias - p.speculative_allowance;
            let delta = -p.normal_mass * (v_n - target);
            let new_lambda = (p.lambda_n + delta).max(0.0);
            let applied = new_lambda - p.lambda_n;
            p.lambda_n = new_lambda;
            apply_contact_impulse(a, b, p.r_a, p.r_b, self.normal * applied);
        }

        for p in &mut self.points {
            // Friction, bounded by the cone |lambda_t| <= mu * lambda_n.
            let v_rel = b.velocity_at(p.r_b) - a.velocity_at(p.r_a);
            let mut delta_t = [
                -p.tangent_mass[0] * v_rel.dot(self.tangent1),
                -p.tangent_mass[1] * v_rel.dot(self.tangent2),
            ];

            let max_friction = self.friction * p.lambda_n;
            let new_t = [p.lambda_t[0] + delta_t[0], p.lambda_t[1] + delta_t[1]];
            let len = (new_t[0] * new_t[0] + new_t[1] * new_t[1]).sqrt();
            let clamped = if len > max_friction && len > 1.0e-9 {
                let scale = max_friction / len;
                [new_t[0] * scale, new_t[1] * scale]
            } else {
                new_t
            };
            delta_t = [clamped[0] - p.lambda_t[0], clamped[1] - p.lambda_t[1]];
            p.lambda_t = clamped;

            let impulse = self.tangent1 * delta_t[0] + self.tangent2 * delta_t[1];
            apply_contact_impulse(a, b, p.r_a, p.r_b, impulse);
        }
    }

    /// One position iteration: push residual penetration beyond the slop out
    /// with pseudo-impulses.
    pub(crate) fn solve_position(&mut self, bodies: &mut [SolverBody], settings: &SolverSettings) {
        let mut scratch_a;
        let mut scratch_b;
        let (a, b) = resolve_pair!(bodies, self.body_a, self.body_b, scratch_a, scratch_b);

        for p in &self.points {
            // Penetration from current poses; anchors keep their prepare-time
            // orientation, which is accurate for the small per-iteration moves.
            let gap = ((b.position - a.position).as_vec3() + p.r_b - p.r_a).dot(self.normal);
            let penetration = p.position_rest - gap;
            if penetration <= settings.penetration_slop {
                continue;
            }
            let correction = settings.baumgarte * (penetration - settings.penetration_slop);
            let impulse = self.normal * (p.normal_mass * correction);

            a.position -= (impulse * a.inv_mass).as_dvec3();
            a.rotation = integrate_rotation(
                a.rotation,
                -(a.inv_inertia_world * p.r_a.cross(impulse)),
                1.0,
            );
            b.position += (impulse * b.inv_mass).as_dvec3();
            b.rotation =
                integrate_rotation(b.rotation, b.inv_inertia_world * p.r_b.cross(impulse), 1.0);
        }
    }
}

fn effective_mass(a: &SolverBody, b: &SolverBody, r_a: Vec3, r_b: Vec3, axis: Vec3) -> f32 {
    let ra_x = r_a.cross(axis);
    let rb_x = r_b.cross(axis);
    let k = a.inv_mass
        + b.inv_mass
        + ra_x.dot(a.inv_inertia_world * ra_x)
        + rb_x.dot(b.inv_inertia_world * rb_x);
    if k > 1.0e-12 {
        1.0 / k
    } else {
        0.0
    }
}

fn apply_contact_impulse(
    a: &mut SolverBody,
    b: &mut SolverBody,
    r_a: Vec3,
    r_b: Vec3,
    impulse: Vec3,
) {
    a.linear_velocity -= impulse * a.inv_mass;
    a.angular_velocity -= a.inv_inertia_world * r_a.cross(impulse);
    b.linear_velocity += impulse * b.inv_mass;
    b.angular_velocity += b.inv_inertia_world * r_b.cross(impulse);
}

// ============================================================================
// Joint runs
// ============================================================================

/// A user constraint scheduled into an island, with prepared data and a copy
/// of the joint (impulses are written back to the store after the solve).
#[derive(Clone, Debug)]
pub(crate) struct JointRun {
    pub id: ConstraintId,
    pub body_a: BodyRef,
    pub body_b: BodyRef,
    pub constraint: Constraint,
    pub prep: PreparedJoint,
}

// ============================================================================
// Island solve
// ============================================================================

/// Solve one island to completion: warm start, velocity iterations,
/// position integration, position iterations.
#[allow(clippy::too_many_arguments)]
pub(crate) fn solve_island(
    bodies: &mut [SolverBody],
    contacts: &mut [ContactConstraint],
    joints: &mut [JointRun],
    vehicles: &mut [VehicleRun],
    settings: &SolverSettings,
    dt: f32,
) {
    // Per-constraint iteration overrides raise the whole island's counts.
    let mut velocity_steps = settings.num_velocity_steps;
    let mut position_steps = settings.num_position_steps;
    for j in &*joints {
        velocity_steps = velocity_steps.max(j.constraint.num_velocity_steps_override);
        position_steps = position_steps.max(j.constraint.num_position_steps_override);
    }

    if settings.constraint_warm_start {
        let factor = settings.warm_start_factor;
        for j in joints.iter_mut() {
            let mut scratch_a;
            let mut scratch_b;
            let (a, b) = resolve_pair!(bodies, j.body_a, j.body_b, scratch_a, scratch_b);
            j.constraint.warm_start(&j.prep, a, b, factor);
        }
        for c in contacts.iter_mut() {
            c.warm_start(bodies, factor);
        }
    }

    // Large islands are reordered into batches of contacts that share no
    // bodies; batches run back to back, so hard couplings are never split
    // across a solve pass, but each batch is internally conflict-free.
    let contact_order: Vec<u32> = if settings.use_large_island_splitter
        && contacts.len() >= settings.large_island_min_constraints as usize
    {
        let edges: Vec<(Option<u32>, Option<u32>)> = contacts
            .iter()
            .map(|c| (c.body_a.island_index(), c.body_b.island_index()))
            .collect();
        crate::island::split_batches(&edges, bodies.len())
            .into_iter()
            .flatten()
            .collect()
    } else {
        (0..contacts.len() as u32).collect()
    };

    for _ in 0..velocity_steps {
        for j in joints.iter_mut() {
            let mut scratch_a;
            let mut scratch_b;
            let (a, b) = resolve_pair!(bodies, j.body_a, j.body_b, scratch_a, scratch_b);
            j.constraint.solve_velocity(&j.prep, a, b, dt);
        }
        for v in vehicles.iter_mut() {
            v.solve_velocity(bodies, dt);
        }
        for &ci in &contact_order {
            contacts[ci as usize].solve_velocity(bodies);
        }
    }

    integrate_positions(bodies, dt);

    for _ in 0..position_steps {
        for j in joints.iter_mut() {
            let mut scratch_a;
            let mut scratch_b;
            let (a, b) = resolve_pair!(bodies, j.body_a, j.body_b, scratch_a, scratch_b);
            j.constraint.solve_position(a, b, settings.baumgarte);
        }
        for &ci in &contact_order {
            contacts[ci as usize].solve_position(bodies, settings);
        }
    }
}

/// Integrate island body poses from their solved velocities.
pub(crate) fn integrate_positions(bodies: &mut [SolverBody], dt: f32) {
    for body in bodies {
        body.linear_velocity *= body.linear_dof_mask;
        body.angular_velocity *= body.angular_dof_mask;

        if !is_finite_vec3(body.linear_velocity) || !is_finite_vec3(body.angular_velocity) {
            // Contract violation upstream; keep the pose, drop the motion.
            log::error!("non-finite velocity reached integration (slot {})", body.body_index);
            body.linear_velocity = Vec3::ZERO;
            body.angular_velocity = Vec3::ZERO;
            continue;
        }

        body.position += (body.linear_velocity * dt).as_dvec3();
        body.rotation = integrate_rotation(body.rotation, body.angular_velocity, dt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyId;
    use crate::contact::{BodyPairKey, ContactCache};
    use approx::assert_relative_eq;

    fn settings() -> SolverSettings {
        SolverSettings::default()
    }

    fn manifold_between(
        cache: &mut ContactCache,
        normal: Vec3,
        local_a: Vec3,
        local_b: Vec3,
        penetration: f32,
        restitution: f32,
    ) -> ContactManifold {
        cache.begin_step();
        let (pair, _) = BodyPairKey::new(BodyId::new(0, 0), BodyId::new(1, 0));
        let key = ManifoldKey { pair, sub_first: 0, sub_second: 0 };
        let m = cache.get_or_create(key, normal, 0.5, restitution).unwrap();
        m.add_or_update(local_a, local_b, local_a, penetration, 1.0e-4);
        m.clone()
    }

    #[test]
    fn test_head_on_spheres_zero_restitution_reach_common_velocity() {
        let mut cache = ContactCache::new(8);
        // Two unit spheres touching at the origin, A at -1, B at +1 on X.
        let manifold = manifold_between(
            &mut cache,
            Vec3::X,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            0.0,
            0.0,
        );

        let mut bodies = vec![
            SolverBody::test_dynamic(RVec3::new(-1.0, 0.0, 0.0), 1.0),
            SolverBody::test_dynamic(RVec3::new(1.0, 0.0, 0.0), 1.0),
        ];
        bodies[0].linear_velocity = Vec3::new(2.0, 0.0, 0.0);
        bodies[1].linear_velocity = Vec3::new(-2.0, 0.0, 0.0);

        let mut contact = ContactConstraint::prepare(
            &manifold,
            BodyRef::Island(0),
            BodyRef::Island(1),
            &bodies[0],
            &bodies[1],
            &settings(),
            1.0 / 60.0,
        );

        for _ in 0..10 {
            contact.solve_velocity(&mut bodies);
        }
        // Equal masses, e = 0: both end at the common velocity (zero here).
        assert_relative_eq!(bodies[0].linear_velocity.x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(bodies[1].linear_velocity.x, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_head_on_spheres_full_restitution_exchange_velocities() {
        let mut cache = ContactCache::new(8);
        let manifold = manifold_between(
            &mut cache,
            Vec3::X,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            0.0,
            1.0,
        );

        let mut bodies = vec![
            SolverBody::test_dynamic(RVec3::new(-1.0, 0.0, 0.0), 1.0),
            SolverBody::test_dynamic(RVec3::new(1.0, 0.0, 0.0), 1.0),
        ];
        bodies[0].linear_velocity = Vec3::new(2.0, 0.0, 0.0);
        bodies[1].linear_velocity = Vec3::new(-2.0, 0.0, 0.0);

        let mut contact = ContactConstraint::prepare(
            &manifold,
            BodyRef::Island(0),
            BodyRef::Island(1),
            &bodies[0],
            &bodies[1],
            &settings(),
            1.0 / 60.0,
        );

        for _ in 0..10 {
            contact.solve_velocity(&mut bodies);
        }
        // e = 1: velocities swap.
        assert_relative_eq!(bodies[0].linear_velocity.x, -2.0, epsilon = 0.05);
        assert_relative_eq!(bodies[1].linear_velocity.x, 2.0, epsilon = 0.05);
    }

    #[test]
    fn test_contact_against_static_floor_stops_body() {
        let mut cache = ContactCache::new(8);
        // Floor below (static side is `first`), body above; normal +Y
        // (first -> second).
        let manifold = manifold_between(
            &mut cache,
            Vec3::Y,
            Vec3::ZERO,
            Vec3::new(0.0, -0.5, 0.0),
            0.01,
            0.0,
        );

        let floor = {
            let mut sb = SolverBody::test_dynamic(RVec3::ZERO, 1.0);
            sb.inv_mass = 0.0;
            sb.inv_inertia_world = Mat3::ZERO;
            sb
        };
        let mut bodies = vec![SolverBody::test_dynamic(RVec3::new(0.0, 0.5, 0.0), 1.0)];
        bodies[0].linear_velocity = Vec3::new(0.0, -3.0, 0.0);

        let mut contact = ContactConstraint::prepare(
            &manifold,
            BodyRef::Fixed(floor),
            BodyRef::Island(0),
            &floor,
            &bodies[0],
            &settings(),
            1.0 / 60.0,
        );

        for _ in 0..10 {
            contact.solve_velocity(&mut bodies);
        }
        // Falling at 3 m/s is above the restitution threshold only if e > 0;
        // with e = 0 the body must simply stop.
        assert!(bodies[0].linear_velocity.y.abs() < 1e-3);
    }

    #[test]
    fn test_friction_opposes_sliding() {
        let mut cache = ContactCache::new(8);
        let manifold = manifold_between(
            &mut cache,
            Vec3::Y,
            Vec3::ZERO,
            Vec3::new(0.0, -0.5, 0.0),
            0.01,
            0.0,
        );

        let floor = {
            let mut sb = SolverBody::test_dynamic(RVec3::ZERO, 1.0);
            sb.inv_mass = 0.0;
            sb.inv_inertia_world = Mat3::ZERO;
            sb
        };
        let mut bodies = vec![SolverBody::test_dynamic(RVec3::new(0.0, 0.5, 0.0), 1.0)];
        bodies[0].linear_velocity = Vec3::new(1.0, -1.0, 0.0);

        let mut contact = ContactConstraint::prepare(
            &manifold,
            BodyRef::Fixed(floor),
            BodyRef::Island(0),
            &floor,
            &bodies[0],
            &settings(),
            1.0 / 60.0,
        );

        let vx_before = bodies[0].linear_velocity.x;
        for _ in 0..10 {
            contact.solve_velocity(&mut bodies);
        }
        assert!(
            bodies[0].linear_velocity.x < vx_before,
            "friction should slow sliding: {} -> {}",
            vx_before,
            bodies[0].linear_velocity.x
        );
    }

    #[test]
    fn test_position_iteration_resolves_penetration() {
        let mut cache = ContactCache::new(8);
        let manifold = manifold_between(
            &mut cache,
            Vec3::Y,
            Vec3::ZERO,
            Vec3::new(0.0, -0.5, 0.0),
            0.2,
            0.0,
        );

        let floor = {
            let mut sb = SolverBody::test_dynamic(RVec3::ZERO, 1.0);
            sb.inv_mass = 0.0;
            sb.inv_inertia_world = Mat3::ZERO;
            sb
        };
        let mut bodies = vec![SolverBody::test_dynamic(RVec3::new(0.0, 0.3, 0.0), 1.0)];

        let mut contact = ContactConstraint::prepare(
            &manifold,
            BodyRef::Fixed(floor),
            BodyRef::Island(0),
            &floor,
            &bodies[0],
            &settings(),
            1.0 / 60.0,
        );

        let y_before = bodies[0].position.y;
        for _ in 0..30 {
            contact.solve_position(&mut bodies, &settings());
        }
        assert!(
            bodies[0].position.y > y_before + 0.1,
            "body should be pushed out: {} -> {}",
            y_before,
            bodies[0].position.y
        );
    }

    #[test]
    fn test_integrate_positions_applies_dof_mask() {
        let mut bodies = vec![SolverBody::test_dynamic(RVec3::ZERO, 1.0)];
        bodies[0].linear_velocity = Vec3::new(1.0, 2.0, 3.0);
        bodies[0].linear_dof_mask = Vec3::new(1.0, 1.0, 0.0);
        integrate_positions(&mut bodies, 1.0);
        assert_relative_eq!(bodies[0].position.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(bodies[0].position.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_integrate_guards_non_finite() {
        let mut bodies = vec![SolverBody::test_dynamic(RVec3::new(1.0, 2.0, 3.0), 1.0)];
        bodies[0].linear_velocity = Vec3::new(f32::NAN, 0.0, 0.0);
        integrate_positions(&mut bodies, 1.0 / 60.0);
        // Pose preserved, motion dropped.
        assert_relative_eq!(bodies[0].position.x, 1.0, epsilon = 1e-9);
        assert_eq!(bodies[0].linear_velocity, Vec3::ZERO);
    }
}

//! User Constraints
//!
//! The closed set of joint kinds: Fixed, Point, Distance, Hinge, Slider.
//! Each is a tagged variant carrying its own parameters; the solver
//! dispatches with one match, no virtual calls.
//!
//! Constraints reference exactly two bodies (the second may be
//! [`BodyId::INVALID`], anchoring to the world). They live in a generational
//! arena like bodies; removing a body while constraints still reference it is
//! refused loudly by the world.
//!
//! World-space settings are captured into body-local anchors at creation, so
//! the joint is defined by the relative pose at attach time.

use crate::body::BodyId;
use crate::error::{PhysicsError, PhysicsResult};
use crate::math::{rotation_error, Mat3, Quat, RVec3, Vec3};
use crate::solver::SolverBody;

/// Checked handle to a constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintId {
    index: u32,
    generation: u32,
}

impl ConstraintId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation tag.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Spring behaviour for soft limits. Zero frequency means rigid.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SpringSettings {
    /// Oscillation frequency (Hz); 0 = rigid
    pub frequency: f32,
    /// Damping ratio (1 = critically damped)
    pub damping: f32,
}

/// Velocity motor on a hinge or slider axis. Inactive when `max_force` is 0.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotorSettings {
    /// Target velocity (rad/s for hinges, m/s for sliders)
    pub target_velocity: f32,
    /// Maximum force/torque the motor may apply
    pub max_force: f32,
}

/// World-space description of a fixed (weld) joint.
#[derive(Clone, Copy, Debug)]
pub struct FixedConstraintSettings {
    /// Common anchor point in world space
    pub point: RVec3,
}

/// World-space description of a ball-socket joint.
#[derive(Clone, Copy, Debug)]
pub struct PointConstraintSettings {
    /// Common anchor point in world space
    pub point: RVec3,
}

/// World-space description of a distance joint.
#[derive(Clone, Copy, Debug)]
pub struct DistanceConstraintSettings {
    /// Anchor on the first body, world space
    pub point1: RVec3,
    /// Anchor on the second body, world space
    pub point2: RVec3,
    /// Minimum allowed distance
    pub min_distance: f32,
    /// Maximum allowed distance
    pub max_distance: f32,
    /// Optional softness for the limits
    pub spring: SpringSettings,
}

/// World-space description of a hinge joint.
#[derive(Clone, Copy, Debug)]
pub struct HingeConstraintSettings {
    /// Hinge point in world space
    pub point: RVec3,
    /// Hinge axis in world space
    pub hinge_axis: Vec3,
    /// Lower rotation limit (rad); `-PI..PI` disables
    pub limits_min: f32,
    /// Upper rotation limit (rad)
    pub limits_max: f32,
    /// Velocity motor about the axis
    pub motor: MotorSettings,
    /// Passive friction torque resisting rotation
    pub max_friction_torque: f32,
}

impl Default for HingeConstraintSettings {
    fn default() -> Self {
        Self {
            point: RVec3::ZERO,
            hinge_axis: Vec3::X,
            limits_min: -core::f32::consts::PI,
            limits_max: core::f32::consts::PI,
            motor: MotorSettings::default(),
            max_friction_torque: 0.0,
        }
    }
}

/// World-space description of a slider (prismatic) joint.
#[derive(Clone, Copy, Debug)]
pub struct SliderConstraintSettings {
    /// Reference point in world space
    pub point: RVec3,
    /// Sliding axis in world space
    pub slider_axis: Vec3,
    /// Lower translation limit (m)
    pub limits_min: f32,
    /// Upper translation limit (m)
    pub limits_max: f32,
    /// Velocity motor along the axis
    pub motor: MotorSettings,
    /// Passive friction force resisting sliding
    pub max_friction_force: f32,
}

impl Default for SliderConstraintSettings {
    fn default() -> Self {
        Self {
            point: RVec3::ZERO,
            slider_axis: Vec3::X,
            limits_min: f32::NEG_INFINITY,
            limits_max: f32::INFINITY,
            motor: MotorSettings::default(),
            max_friction_force: 0.0,
        }
    }
}

/// Joint kind with body-local parameters.
#[derive(Clone, Debug)]
pub enum ConstraintKind {
    /// All six degrees of freedom locked.
    Fixed {
        /// Anchor in A's local space
        local_anchor_a: Vec3,
        /// Anchor in B's local space
        local_anchor_b: Vec3,
        /// Relative orientation at attach: `rot_a^-1 * rot_b`
        rel_rotation: Quat,
    },
    /// Ball socket: translation locked, rotation free.
    Point {
        /// Anchor in A's local space
        local_anchor_a: Vec3,
        /// Anchor in B's local space
        local_anchor_b: Vec3,
    },
    /// Distance between two anchors kept within a range.
    Distance {
        /// Anchor in A's local space
        local_anchor_a: Vec3,
        /// Anchor in B's local space
        local_anchor_b: Vec3,
        /// Minimum distance
        min_distance: f32,
        /// Maximum distance
        max_distance: f32,
        /// Optional softness
        spring: SpringSettings,
    },
    /// One rotational degree of freedom about a shared axis.
    Hinge {
        /// Anchor in A's local space
        local_anchor_a: Vec3,
        /// Anchor in B's local space
        local_anchor_b: Vec3,
        /// Hinge axis in A's local space
        local_axis_a: Vec3,
        /// Hinge axis in B's local space
        local_axis_b: Vec3,
        /// Relative orientation at attach
        rel_rotation: Quat,
        /// Lower angle limit
        limits_min: f32,
        /// Upper angle limit
        limits_max: f32,
        /// Axis motor
        motor: MotorSettings,
        /// Passive friction torque
        max_friction_torque: f32,
    },
    /// One translational degree of freedom along a shared axis.
    Slider {
        /// Anchor in A's local space
        local_anchor_a: Vec3,
        /// Anchor in B's local space
        local_anchor_b: Vec3,
        /// Slide axis in A's local space
        local_axis_a: Vec3,
        /// Relative orientation at attach
        rel_rotation: Quat,
        /// Lower translation limit
        limits_min: f32,
        /// Upper translation limit
        limits_max: f32,
        /// Axis motor
        motor: MotorSettings,
        /// Passive friction force
        max_friction_force: f32,
    },
}

/// Accumulated impulses, persisted across steps for warm starting.
#[derive(Clone, Copy, Debug, Default)]
pub struct JointImpulses {
    /// Linear (point) impulse
    pub linear: Vec3,
    /// Angular lock impulse
    pub angular: Vec3,
    /// Limit impulse along/about the joint axis
    pub limit: f32,
    /// Motor impulse
    pub motor: f32,
}

/// A live constraint.
#[derive(Clone, Debug)]
pub struct Constraint {
    /// First referenced body
    pub body_a: BodyId,
    /// Second referenced body; `BodyId::INVALID` anchors to the world
    pub body_b: BodyId,
    /// Joint parameters
    pub kind: ConstraintKind,
    /// Disabled constraints are skipped entirely
    pub enabled: bool,
    /// Per-constraint velocity iteration override (0 = world default)
    pub num_velocity_steps_override: u32,
    /// Per-constraint position iteration override (0 = world default)
    pub num_position_steps_override: u32,
    /// Warm-start state
    pub(crate) impulses: JointImpulses,
}

impl Constraint {
    /// Validate the body references.
    pub(crate) fn validate(&self) -> PhysicsResult<()> {
        if self.body_a == self.body_b {
            return Err(PhysicsError::InvalidConstraint {
                reason: "a constraint must reference two distinct bodies",
            });
        }
        if self.body_a.is_invalid() {
            return Err(PhysicsError::InvalidConstraint {
                reason: "the first body of a constraint must be valid",
            });
        }
        Ok(())
    }

    /// True when this constraint references `body`.
    #[must_use]
    pub fn references(&self, body: BodyId) -> bool {
        self.body_a == body || self.body_b == body
    }
}

// ============================================================================
// Constraint arena
// ============================================================================

struct Slot {
    generation: u32,
    constraint: Option<Constraint>,
}

/// Generational arena owning all constraints in a world.
#[derive(Default)]
pub struct ConstraintStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ConstraintStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), live: 0 }
    }

    /// Number of live constraints.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// True when empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Insert a constraint.
    pub fn add(&mut self, constraint: Constraint) -> PhysicsResult<ConstraintId> {
        constraint.validate()?;
        let index = if let Some(index) = self.free.pop() {
            self.slots[index as usize].constraint = Some(constraint);
            index
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, constraint: Some(constraint) });
            index
        };
        self.live += 1;
        Ok(ConstraintId::new(index, self.slots[index as usize].generation))
    }

    /// Remove a constraint, invalidating its handle.
    pub fn remove(&mut self, id: ConstraintId) -> PhysicsResult<Constraint> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.constraint.is_some())
            .ok_or(PhysicsError::InvalidConstraintHandle { id })?;
        let c = slot.constraint.take().expect("checked above");
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(c)
    }

    /// Borrow a constraint.
    pub fn get(&self, id: ConstraintId) -> PhysicsResult<&Constraint> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.constraint.as_ref())
            .ok_or(PhysicsError::InvalidConstraintHandle { id })
    }

    /// Borrow a constraint mutably.
    pub fn get_mut(&mut self, id: ConstraintId) -> PhysicsResult<&mut Constraint> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.constraint.as_mut())
            .ok_or(PhysicsError::InvalidConstraintHandle { id })
    }

    /// First live constraint referencing `body`, if any.
    #[must_use]
    pub fn find_referencing(&self, body: BodyId) -> Option<ConstraintId> {
        self.iter().find(|(_, c)| c.references(body)).map(|(id, _)| id)
    }

    /// Iterate live constraints in slot order (creation order for the solver's
    /// deterministic intra-island ordering).
    pub fn iter(&self) -> impl Iterator<Item = (ConstraintId, &Constraint)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.constraint.as_ref().map(|c| (ConstraintId::new(i as u32, s.generation), c))
        })
    }

    /// Iterate mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConstraintId, &mut Constraint)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.constraint.as_mut().map(move |c| (ConstraintId::new(i as u32, generation), c))
        })
    }
}

// ============================================================================
// Joint solving
// ============================================================================

/// Per-step prepared joint data (world-space anchors and effective masses,
/// from start-of-step poses).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PreparedJoint {
    pub r_a: Vec3,
    pub r_b: Vec3,
    /// Inverse of the linear effective mass matrix
    pub k_linear_inv: Mat3,
    /// Inverse of the angular effective mass matrix
    pub k_angular_inv: Mat3,
    /// World axis (hinge/slider/distance direction)
    pub axis: Vec3,
    /// Effective mass along/about `axis`
    pub axis_mass: f32,
    /// Current positional/angular error along the axis (for limits)
    pub axis_value: f32,
    /// Soft-constraint gamma (distance spring)
    pub gamma: f32,
    /// Soft-constraint bias velocity
    pub bias: f32,
}

fn linear_k(a: &SolverBody, b: &SolverBody, r_a: Vec3, r_b: Vec3) -> Mat3 {
    let mut k = Mat3::from_diagonal(Vec3::splat(a.inv_mass + b.inv_mass));
    let ra_skew = skew(r_a);
    let rb_skew = skew(r_b);
    k += ra_skew * a.inv_inertia_world * ra_skew.transpose();
    k += rb_skew * b.inv_inertia_world * rb_skew.transpose();
    k
}

fn skew(v: Vec3) -> Mat3 {
    Mat3::from_cols(
        Vec3::new(0.0, v.z, -v.y),
        Vec3::new(-v.z, 0.0, v.x),
        Vec3::new(v.y, -v.x, 0.0),
    )
}

fn invert_or_zero(m: Mat3) -> Mat3 {
    if m.determinant().abs() > 1.0e-12 {
        m.inverse()
    } else {
        Mat3::ZERO
    }
}

fn axial_mass(a: &SolverBody, b: &SolverBody, r_a: Vec3, r_b: Vec3, axis: Vec3) -> f32 {
    let ra_x_n = r_a.cross(axis);
    let rb_x_n = r_b.cross(axis);
    let k = a.inv_mass
        + b.inv_mass
        + ra_x_n.dot(a.inv_inertia_world * ra_x_n)
        + rb_x_n.dot(b.inv_inertia_world * rb_x_n);
    if k > 1.0e-12 {
        1.0 / k
    } else {
        0.0
    }
}

fn angular_axis_mass(a: &SolverBody, b: &SolverBody, axis: Vec3) -> f32 {
    let k = axis.dot(a.inv_inertia_world * axis) + axis.dot(b.inv_inertia_world * axis);
    if k > 1.0e-12 {
        1.0 / k
    } else {
        0.0
    }
}

/// Twist angle of a relative rotation about `axis`.
fn twist_angle(q: Quat, axis: Vec3) -> f32 {
    let proj = Vec3::new(q.x, q.y, q.z).dot(axis);
    2.0 * proj.atan2(q.w)
}

impl Constraint {
    /// Compute prepared data for this step.
    pub(crate) fn prepare(&self, a: &SolverBody, b: &SolverBody, dt: f32) -> PreparedJoint {
        let mut prep = PreparedJoint::default();
        match &self.kind {
            ConstraintKind::Point { local_anchor_a, local_anchor_b }
            | ConstraintKind::Fixed { local_anchor_a, local_anchor_b, .. } => {
                prep.r_a = a.rotation * *local_anchor_a;
                prep.r_b = b.rotation * *local_anchor_b;
                prep.k_linear_inv = invert_or_zero(linear_k(a, b, prep.r_a, prep.r_b));
                prep.k_angular_inv =
                    invert_or_zero(a.inv_inertia_world + b.inv_inertia_world);
            }
            ConstraintKind::Distance {
                local_anchor_a,
                local_anchor_b,
                min_distance,
                max_distance,
                spring,
            } => {
                prep.r_a = a.rotation * *local_anchor_a;
                prep.r_b = b.rotation * *local_anchor_b;
                let pa = prep.r_a;
                let pb = (b.position - a.position).as_vec3() + prep.r_b;
                let delta = pb - pa;
                let dist = delta.length();
                prep.axis = if dist > 1.0e-6 { delta / dist } else { Vec3::Y };
                prep.axis_value = dist;
                prep.axis_mass = axial_mass(a, b, prep.r_a, prep.r_b, prep.axis);

                if spring.frequency > 0.0 && prep.axis_mass > 0.0 {
                    // Implicit spring (Box2D-style gamma/bias).
                    let m = 1.0 / prep.axis_mass;
                    let omega = 2.0 * core::f32::consts::PI * spring.frequency;
                    let c_damp = 2.0 * m * spring.damping * omega;
                    let k = m * omega * omega;
                    let gamma = dt * (c_damp + dt * k);
                    prep.gamma = if gamma > 1.0e-12 { 1.0 / gamma } else { 0.0 };
                    let error = if dist > *max_distance {
                        dist - max_distance
                    } else if dist < *min_distance {
                        dist - min_distance
                    } else {
                        0.0
                    };
                    prep.bias = error * dt * k * prep.gamma;
                    // Refresh effective mass with the soft term.
                    let soft = m + prep.gamma;
                    prep.axis_mass = if soft > 1.0e-12 { 1.0 / soft } else { 0.0 };
                }
            }
            ConstraintKind::Hinge {
                local_anchor_a, local_anchor_b, local_axis_a, rel_rotation, ..
            } => {
                prep.r_a = a.rotation * *local_anchor_a;
                prep.r_b = b.rotation * *local_anchor_b;
                prep.k_linear_inv = invert_or_zero(linear_k(a, b, prep.r_a, prep.r_b));
                prep.k_angular_inv =
                    invert_or_zero(a.inv_inertia_world + b.inv_inertia_world);
                prep.axis = (a.rotation * *local_axis_a).normalize();
                prep.axis_mass = angular_axis_mass(a, b, prep.axis);
                let q_rel = a.rotation.inverse() * b.rotation;
                let q_offset = rel_rotation.inverse() * q_rel;
                prep.axis_value = twist_angle(q_offset.normalize(), *local_axis_a);
            }
            ConstraintKind::Slider { local_anchor_a, local_anchor_b, local_axis_a, .. } => {
                prep.r_a = a.rotation * *local_anchor_a;
                prep.r_b = b.rotation * *local_anchor_b;
                prep.axis = (a.rotation * *local_axis_a).normalize();
                prep.k_linear_inv = invert_or_zero(linear_k(a, b, prep.r_a, prep.r_b));
                prep.k_angular_inv =
                    invert_or_zero(a.inv_inertia_world + b.inv_inertia_world);
                prep.axis_mass = axial_mass(a, b, prep.r_a, prep.r_b, prep.axis);
                let pa = prep.r_a;
                let pb = (b.position - a.position).as_vec3() + prep.r_b;
                prep.axis_value = (pb - pa).dot(prep.axis);
            }
        }
        prep
    }

    /// Re-apply last step's impulses as the warm-start seed.
    pub(crate) fn warm_start(
        &self,
        prep: &PreparedJoint,
        a: &mut SolverBody,
        b: &mut SolverBody,
        factor: f32,
    ) {
        let imp = &self.impulses;
        match &self.kind {
            ConstraintKind::Point { .. } => {
                apply_linear(a, b, prep, imp.linear * factor);
            }
            ConstraintKind::Fixed { .. } => {
                apply_linear(a, b, prep, imp.linear * factor);
                apply_angular(a, b, imp.angular * factor);
            }
            ConstraintKind::Distance { .. } => {
                apply_linear(a, b, prep, prep.axis * (imp.limit * factor));
            }
            ConstraintKind::Hinge { .. } => {
                apply_linear(a, b, prep, imp.linear * factor);
                apply_angular(a, b, imp.angular * factor);
                apply_angular(a, b, prep.axis * ((imp.motor + imp.limit) * factor));
            }
            ConstraintKind::Slider { .. } => {
                apply_linear(a, b, prep, imp.linear * factor);
                apply_angular(a, b, imp.angular * factor);
                apply_linear(a, b, prep, prep.axis * ((imp.motor + imp.limit) * factor));
            }
        }
    }

    /// One velocity iteration.
    pub(crate) fn solve_velocity(
        &mut self,
        prep: &PreparedJoint,
        a: &mut SolverBody,
        b: &mut SolverBody,
        dt: f32,
    ) {
        match &self.kind {
            ConstraintKind::Point { .. } => {
                solve_point_velocity(prep, a, b, &mut self.impulses);
            }
            ConstraintKind::Fixed { .. } => {
                solve_angular_lock(prep, a, b, &mut self.impulses);
                solve_point_velocity(prep, a, b, &mut self.impulses);
            }
            ConstraintKind::Distance { min_distance, max_distance, spring, .. } => {
                let (min_d, max_d, springy) = (*min_distance, *max_distance, *spring);
                let v_rel = (b.linear_velocity + b.angular_velocity.cross(prep.r_b))
                    - (a.linear_velocity + a.angular_velocity.cross(prep.r_a));
                let cdot = v_rel.dot(prep.axis);

                if springy.frequency > 0.0 {
                    let impulse =
                        -prep.axis_mass * (cdot + prep.bias + prep.gamma * self.impulses.limit);
                    self.impulses.limit += impulse;
                    apply_linear(a, b, prep, prep.axis * impulse);
                } else {
                    let violating_max = prep.axis_value > max_d;
                    let violating_min = prep.axis_value < min_d;
                    if !(violating_max || violating_min) && (max_d - min_d) > 1.0e-6 {
                        return;
                    }
                    let impulse = -prep.axis_mass * cdot;
                    let old = self.impulses.limit;
                    // One-sided clamp when only a limit is active.
                    let new = if (max_d - min_d) <= 1.0e-6 {
                        old + impulse
                    } else if violating_max {
                        (old + impulse).min(0.0)
                    } else {
                        (old + impulse).max(0.0)
                    };
                    let delta = new - old;
                    self.impulses.limit = new;
                    apply_linear(a, b, prep, prep.axis * delta);
                }
            }
            ConstraintKind::Hinge {
                limits_min, limits_max, motor, max_friction_torque, ..
            } => {
                let (lim_min, lim_max) = (*limits_min, *limits_max);
                let motor = *motor;
                let friction = *max_friction_torque;

                // Motor / friction about the axis.
                let w_rel = (b.angular_velocity - a.angular_velocity).dot(prep.axis);
                if motor.max_force > 0.0 {
                    let impulse = -prep.axis_mass * (w_rel - motor.target_velocity);
                    let max = motor.max_force * dt;
                    let old = self.impulses.motor;
                    let new = (old + impulse).clamp(-max, max);
                    let delta = new - old;
                    self.impulses.motor = new;
                    apply_angular(a, b, prep.axis * delta);
                } else if friction > 0.0 {
                    let impulse = -prep.axis_mass * w_rel;
                    let max = friction * dt;
                    let old = self.impulses.motor;
                    let new = (old + impulse).clamp(-max, max);
                    let delta = new - old;
                    self.impulses.motor = new;
                    apply_angular(a, b, prep.axis * delta);
                }

                // Rotation limits.
                let has_limits = lim_max - lim_min < 2.0 * core::f32::consts::PI - 1.0e-4;
                if has_limits {
                    let w_rel = (b.angular_velocity - a.angular_velocity).dot(prep.axis);
                    if prep.axis_value >= lim_max {
                        let impulse = -prep.axis_mass * w_rel;
                        let old = self.impulses.limit;
                        let new = (old + impulse).min(0.0);
                        let delta = new - old;
                        self.impulses.limit = new;
                        apply_angular(a, b, prep.axis * delta);
                    } else if prep.axis_value <= lim_min {
                        let impulse = -prep.axis_mass * w_rel;
                        let old = self.impulses.limit;
                        let new = (old + impulse).max(0.0);
                        let delta = new - old;
                        self.impulses.limit = new;
                        apply_angular(a, b, prep.axis * delta);
                    }
                }

                // Lock the two angular DOF perpendicular to the axis.
                let w_err = {
                    let w_rel = b.angular_velocity - a.angular_velocity;
                    w_rel - prep.axis * w_rel.dot(prep.axis)
                };
                let impulse = prep.k_angular_inv * (-w_err);
                let impulse = impulse - prep.axis * impulse.dot(prep.axis);
                self.impulses.angular += impulse;
                apply_angular(a, b, impulse);

                // Point part.
                solve_point_velocity(prep, a, b, &mut self.impulses);
            }
            ConstraintKind::Slider {
                limits_min, limits_max, motor, max_friction_force, ..
            } => {
                let (lim_min, lim_max) = (*limits_min, *limits_max);
                let motor = *motor;
                let friction = *max_friction_force;

                // Full angular lock.
                solve_angular_lock(prep, a, b, &mut self.impulses);

                let v_rel = (b.linear_velocity + b.angular_velocity.cross(prep.r_b))
                    - (a.linear_velocity + a.angular_velocity.cross(prep.r_a));

                // Motor / friction along the axis.
                let v_axis = v_rel.dot(prep.axis);
                if motor.max_force > 0.0 {
                    let impulse = -prep.axis_mass * (v_axis - motor.target_velocity);
                    let max = motor.max_force * dt;
                    let old = self.impulses.motor;
                    let new = (old + impulse).clamp(-max, max);
                    let delta = new - old;
                    self.impulses.motor = new;
                    apply_linear(a, b, prep, prep.axis * delta);
                } else if friction > 0.0 {
                    let impulse = -prep.axis_mass * v_axis;
                    let max = friction * dt;
                    let old = self.impulses.motor;
                    let new = (old + impulse).clamp(-max, max);
                    let delta = new - old;
                    self.impulses.motor = new;
                    apply_linear(a, b, prep, prep.axis * delta);
                }

                // Translation limits.
                if prep.axis_value >= lim_max || prep.axis_value <= lim_min {
                    let v_axis = {
                        let v_rel = (b.linear_velocity + b.angular_velocity.cross(prep.r_b))
                            - (a.linear_velocity + a.angular_velocity.cross(prep.r_a));
                        v_rel.dot(prep.axis)
                    };
                    let impulse = -prep.axis_mass * v_axis;
                    let old = self.impulses.limit;
                    let new = if prep.axis_value >= lim_max {
                        (old + impulse).min(0.0)
                    } else {
                        (old + impulse).max(0.0)
                    };
                    let delta = new - old;
                    self.impulses.limit = new;
                    apply_linear(a, b, prep, prep.axis * delta);
                }

                // Lock the two linear DOF perpendicular to the axis.
                let v_rel = (b.linear_velocity + b.angular_velocity.cross(prep.r_b))
                    - (a.linear_velocity + a.angular_velocity.cross(prep.r_a));
                let v_perp = v_rel - prep.axis * v_rel.dot(prep.axis);
                let impulse = prep.k_linear_inv * (-v_perp);
                let impulse = impulse - prep.axis * impulse.dot(prep.axis);
                self.impulses.linear += impulse;
                apply_linear(a, b, prep, impulse);
            }
        }
    }

    /// One position iteration: pseudo-impulses applied straight to the poses.
    pub(crate) fn solve_position(&self, a: &mut SolverBody, b: &mut SolverBody, baumgarte: f32) {
        match &self.kind {
            ConstraintKind::Point { local_anchor_a, local_anchor_b } => {
                correct_anchor_error(a, b, *local_anchor_a, *local_anchor_b, baumgarte);
            }
            ConstraintKind::Fixed { local_anchor_a, local_anchor_b, rel_rotation } => {
                correct_rotation_error(a, b, *rel_rotation, baumgarte);
                correct_anchor_error(a, b, *local_anchor_a, *local_anchor_b, baumgarte);
            }
            ConstraintKind::Distance {
                local_anchor_a, local_anchor_b, min_distance, max_distance, spring,
            } => {
                if spring.frequency > 0.0 {
                    return; // springs leave position error to the spring force
                }
                let r_a = a.rotation * *local_anchor_a;
                let r_b = b.rotation * *local_anchor_b;
                let pa = r_a;
                let pb = (b.position - a.position).as_vec3() + r_b;
                let delta = pb - pa;
                let dist = delta.length();
                if dist < 1.0e-6 {
                    return;
                }
                let axis = delta / dist;
                let error = if dist > *max_distance {
                    dist - max_distance
                } else if dist < *min_distance {
                    dist - min_distance
                } else {
                    return;
                };
                let mass = axial_mass(a, b, r_a, r_b, axis);
                let impulse = axis * (-baumgarte * error * mass);
                apply_position_impulse(a, b, r_a, r_b, impulse);
            }
            ConstraintKind::Hinge {
                local_anchor_a, local_anchor_b, local_axis_a, local_axis_b, ..
            } => {
                // Align the hinge axes.
                let axis_a = a.rotation * *local_axis_a;
                let axis_b = b.rotation * *local_axis_b;
                let err = axis_a.cross(axis_b);
                let k_ang = invert_or_zero(a.inv_inertia_world + b.inv_inertia_world);
                let impulse = k_ang * (-err * baumgarte);
                apply_position_angular(a, b, impulse);
                correct_anchor_error(a, b, *local_anchor_a, *local_anchor_b, baumgarte);
            }
            ConstraintKind::Slider {
                local_anchor_a, local_anchor_b, local_axis_a, rel_rotation, ..
            } => {
                correct_rotation_error(a, b, *rel_rotation, baumgarte);
                // Only the perpendicular part of the anchor error is corrected.
                let r_a = a.rotation * *local_anchor_a;
                let r_b = b.rotation * *local_anchor_b;
                let axis = (a.rotation * *local_axis_a).normalize();
                let pa = r_a;
                let pb = (b.position - a.position).as_vec3() + r_b;
                let err = pb - pa;
                let err_perp = err - axis * err.dot(axis);
                let k = invert_or_zero(linear_k(a, b, r_a, r_b));
                let impulse = k * (-err_perp * baumgarte);
                let impulse = impulse - axis * impulse.dot(axis);
                apply_position_impulse(a, b, r_a, r_b, impulse);
            }
        }
    }
}

fn apply_linear(a: &mut SolverBody, b: &mut SolverBody, prep: &PreparedJoint, impulse: Vec3) {
    a.linear_velocity -= impulse * a.inv_mass;
    a.angular_velocity -= a.inv_inertia_world * prep.r_a.cross(impulse);
    b.linear_velocity += impulse * b.inv_mass;
    b.angular_velocity += b.inv_inertia_world * prep.r_b.cross(impulse);
}

fn apply_angular(a: &mut SolverBody, b: &mut SolverBody, impulse: Vec3) {
    a.angular_velocity -= a.inv_inertia_world * impulse;
    b.angular_velocity += b.inv_inertia_world * impulse;
}

fn solve_point_velocity(
    prep: &PreparedJoint,
    a: &mut SolverBody,
    b: &mut SolverBody,
    impulses: &mut JointImpulses,
) {
    let v_rel = (b.linear_velocity + b.angular_velocity.cross(prep.r_b))
        - (a.linear_velocity + a.angular_velocity.cross(prep.r_a));
    let impulse = prep.k_linear_inv * (-v_rel);
    impulses.linear += impulse;
    apply_linear(a, b, prep, impulse);
}

fn solve_angular_lock(
    prep: &PreparedJoint,
    a: &mut SolverBody,
    b: &mut SolverBody,
    impulses: &mut JointImpulses,
) {
    let w_rel = b.angular_velocity - a.angular_velocity;
    let impulse = prep.k_angular_inv * (-w_rel);
    impulses.angular += impulse;
    apply_angular(a, b, impulse);
}

fn apply_position_impulse(
    a: &mut SolverBody,
    b: &mut SolverBody,
    r_a: Vec3,
    r_b: Vec3,
    impulse: Vec3,
) {
    a.position -= (impulse * a.inv_mass).as_dvec3();
    a.rotation = crate::math::integrate_rotation(
        a.rotation,
        -(a.inv_inertia_world * r_a.cross(impulse)),
        1.0,
    );
    b.position += (impulse * b.inv_mass).as_dvec3();
    b.rotation = crate::math::integrate_rotation(
        b.rotation,
        b.inv_inertia_world * r_b.cross(impulse),
        1.0,
    );
}

fn apply_position_angular(a: &mut SolverBody, b: &mut SolverBody, impulse: Vec3) {
    a.rotation =
        crate::math::integrate_rotation(a.rotation, -(a.inv_inertia_world * impulse), 1.0);
    b.rotation = crate::math::integrate_rotation(b.rotation, b.inv_inertia_world * impulse, 1.0);
}

fn correct_anchor_error(
    a: &mut SolverBody,
    b: &mut SolverBody,
    local_anchor_a: Vec3,
    local_anchor_b: Vec3,
    baumgarte: f32,
) {
    let r_a = a.rotation * local_anchor_a;
    let r_b = b.rotation * local_anchor_b;
    let pa = r_a;
    let pb = (b.position - a.position).as_vec3() + r_b;
    let err = pb - pa;
    if err.length_squared() < 1.0e-12 {
        return;
    }
    let k = invert_or_zero(linear_k(a, b, r_a, r_b));
    let impulse = k * (-err * baumgarte);
    apply_position_impulse(a, b, r_a, r_b, impulse);
}

fn correct_rotation_error(a: &mut SolverBody, b: &mut SolverBody, rel_rotation: Quat, baumgarte: f32) {
    let target_b = (a.rotation * rel_rotation).normalize();
    let err = rotation_error(target_b, b.rotation);
    if err.length_squared() < 1.0e-12 {
        return;
    }
    let k = invert_or_zero(a.inv_inertia_world + b.inv_inertia_world);
    let impulse = k * (-err * baumgarte);
    apply_position_angular(a, b, impulse);
}

// ============================================================================
// Settings -> local-space kinds
// ============================================================================

/// Capture world-space fixed-joint settings into local anchors.
pub(crate) fn make_fixed(
    settings: &FixedConstraintSettings,
    pos_a: RVec3,
    rot_a: Quat,
    pos_b: RVec3,
    rot_b: Quat,
) -> ConstraintKind {
    ConstraintKind::Fixed {
        local_anchor_a: rot_a.inverse() * (settings.point - pos_a).as_vec3(),
        local_anchor_b: rot_b.inverse() * (settings.point - pos_b).as_vec3(),
        rel_rotation: rot_a.inverse() * rot_b,
    }
}

/// Capture world-space point-joint settings into local anchors.
pub(crate) fn make_point(
    settings: &PointConstraintSettings,
    pos_a: RVec3,
    rot_a: Quat,
    pos_b: RVec3,
    rot_b: Quat,
) -> ConstraintKind {
    ConstraintKind::Point {
        local_anchor_a: rot_a.inverse() * (settings.point - pos_a).as_vec3(),
        local_anchor_b: rot_b.inverse() * (settings.point - pos_b).as_vec3(),
    }
}

/// Capture world-space distance-joint settings into local anchors.
pub(crate) fn make_distance(
    settings: &DistanceConstraintSettings,
    pos_a: RVec3,
    rot_a: Quat,
    pos_b: RVec3,
    rot_b: Quat,
) -> ConstraintKind {
    ConstraintKind::Distance {
        local_anchor_a: rot_a.inverse() * (settings.point1 - pos_a).as_vec3(),
        local_anchor_b: rot_b.inverse() * (settings.point2 - pos_b).as_vec3(),
        min_distance: settings.min_distance,
        max_distance: settings.max_distance,
        spring: settings.spring,
    }
}

/// Capture world-space hinge settings into local anchors and axes.
pub(crate) fn make_hinge(
    settings: &HingeConstraintSettings,
    pos_a: RVec3,
    rot_a: Quat,
    pos_b: RVec3,
    rot_b: Quat,
) -> ConstraintKind {
    let axis = settings.hinge_axis.normalize();
    ConstraintKind::Hinge {
        local_anchor_a: rot_a.inverse() * (settings.point - pos_a).as_vec3(),
        local_anchor_b: rot_b.inverse() * (settings.point - pos_b).as_vec3(),
        local_axis_a: rot_a.inverse() * axis,
        local_axis_b: rot_b.inverse() * axis,
        rel_rotation: rot_a.inverse() * rot_b,
        limits_min: settings.limits_min,
        limits_max: settings.limits_max,
        motor: settings.motor,
        max_friction_torque: settings.max_friction_torque,
    }
}

/// Capture world-space slider settings into local anchors and axis.
pub(crate) fn make_slider(
    settings: &SliderConstraintSettings,
    pos_a: RVec3,
    rot_a: Quat,
    pos_b: RVec3,
    rot_b: Quat,
) -> ConstraintKind {
    let axis = settings.slider_axis.normalize();
    ConstraintKind::Slider {
        local_anchor_a: rot_a.inverse() * (settings.point - pos_a).as_vec3(),
        local_anchor_b: rot_b.inverse() * (settings.point - pos_b).as_vec3(),
        local_axis_a: rot_a.inverse() * axis,
        rel_rotation: rot_a.inverse() * rot_b,
        limits_min: settings.limits_min,
        limits_max: settings.limits_max,
        motor: settings.motor,
        max_friction_force: settings.max_friction_force,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_constraint(a: u32, b: u32) -> Constraint {
        Constraint {
            body_a: BodyId::new(a, 0),
            body_b: BodyId::new(b, 0),
            kind: ConstraintKind::Point { local_anchor_a: Vec3::ZERO, local_anchor_b: Vec3::ZERO },
            enabled: true,
            num_velocity_steps_override: 0,
            num_position_steps_override: 0,
            impulses: JointImpulses::default(),
        }
    }

    #[test]
    fn test_store_add_remove() {
        let mut store = ConstraintStore::new();
        let id = store.add(dummy_constraint(0, 1)).unwrap();
        assert_eq!(store.len(), 1);
        store.remove(id).unwrap();
        assert!(store.is_empty());
        assert!(store.get(id).is_err());
    }

    #[test]
    fn test_stale_constraint_handle() {
        let mut store = ConstraintStore::new();
        let id = store.add(dummy_constraint(0, 1)).unwrap();
        store.remove(id).unwrap();
        let id2 = store.add(dummy_constraint(2, 3)).unwrap();
        assert_eq!(id2.index(), id.index());
        assert!(store.get(id).is_err());
        assert!(store.get(id2).is_ok());
    }

    #[test]
    fn test_same_body_rejected() {
        let mut store = ConstraintStore::new();
        let result = store.add(dummy_constraint(1, 1));
        assert!(matches!(result, Err(PhysicsError::InvalidConstraint { .. })));
    }

    #[test]
    fn test_find_referencing() {
        let mut store = ConstraintStore::new();
        store.add(dummy_constraint(0, 1)).unwrap();
        let id = store.add(dummy_constraint(2, 3)).unwrap();
        assert_eq!(store.find_referencing(BodyId::new(3, 0)), Some(id));
        assert_eq!(store.find_referencing(BodyId::new(9, 0)), None);
    }

    #[test]
    fn test_twist_angle() {
        let q = Quat::from_axis_angle(Vec3::Y, 0.5);
        let angle = twist_angle(q, Vec3::Y);
        assert!((angle - 0.5).abs() < 1e-5, "angle = {angle}");
    }

    #[test]
    fn test_make_point_captures_local_anchors() {
        let settings = PointConstraintSettings { point: RVec3::new(1.0, 0.0, 0.0) };
        let kind = make_point(
            &settings,
            RVec3::ZERO,
            Quat::IDENTITY,
            RVec3::new(2.0, 0.0, 0.0),
            Quat::IDENTITY,
        );
        let ConstraintKind::Point { local_anchor_a, local_anchor_b } = kind else {
            panic!("wrong kind");
        };
        assert!((local_anchor_a - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
        assert!((local_anchor_b - Vec3::new(-1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_point_velocity_solve_stops_separation() {
        // Two unit-mass bodies joined at the midpoint, pulling apart.
        let mut a = SolverBody::test_dynamic(RVec3::ZERO, 1.0);
        let mut b = SolverBody::test_dynamic(RVec3::new(2.0, 0.0, 0.0), 1.0);
        a.linear_velocity = Vec3::new(-1.0, 0.0, 0.0);
        b.linear_velocity = Vec3::new(1.0, 0.0, 0.0);

        let mut c = dummy_constraint(0, 1);
        c.kind = ConstraintKind::Point {
            local_anchor_a: Vec3::new(1.0, 0.0, 0.0),
            local_anchor_b: Vec3::new(-1.0, 0.0, 0.0),
        };
        let prep = c.prepare(&a, &b, 1.0 / 60.0);
        for _ in 0..8 {
            c.solve_velocity(&prep, &mut a, &mut b, 1.0 / 60.0);
        }
        // Relative velocity at the anchor must vanish.
        let v_rel = (b.linear_velocity + b.angular_velocity.cross(prep.r_b))
            - (a.linear_velocity + a.angular_velocity.cross(prep.r_a));
        assert!(v_rel.length() < 1e-4, "v_rel = {v_rel:?}");
    }

    #[test]
    fn test_hinge_motor_spins_bodies() {
        let mut a = SolverBody::test_dynamic(RVec3::ZERO, 1.0);
        let mut b = SolverBody::test_dynamic(RVec3::new(0.0, 1.0, 0.0), 1.0);

        let mut c = dummy_constraint(0, 1);
        c.kind = ConstraintKind::Hinge {
            local_anchor_a: Vec3::ZERO,
            local_anchor_b: Vec3::new(0.0, -1.0, 0.0),
            local_axis_a: Vec3::Y,
            local_axis_b: Vec3::Y,
            rel_rotation: Quat::IDENTITY,
            limits_min: -core::f32::consts::PI,
            limits_max: core::f32::consts::PI,
            motor: MotorSettings { target_velocity: 2.0, max_force: 100.0 },
            max_friction_torque: 0.0,
        };

        let dt = 1.0 / 60.0;
        for _ in 0..20 {
            let prep = c.prepare(&a, &b, dt);
            c.solve_velocity(&prep, &mut a, &mut b, dt);
        }
        let w_rel = (b.angular_velocity - a.angular_velocity).y;
        assert!((w_rel - 2.0).abs() < 0.1, "w_rel = {w_rel}");
    }

    #[test]
    fn test_fixed_position_correction_pulls_anchors_together() {
        let mut a = SolverBody::test_dynamic(RVec3::ZERO, 1.0);
        let mut b = SolverBody::test_dynamic(RVec3::new(1.1, 0.0, 0.0), 1.0);

        let c = Constraint {
            body_a: BodyId::new(0, 0),
            body_b: BodyId::new(1, 0),
            kind: ConstraintKind::Fixed {
                local_anchor_a: Vec3::new(0.5, 0.0, 0.0),
                local_anchor_b: Vec3::new(-0.5, 0.0, 0.0),
                rel_rotation: Quat::IDENTITY,
            },
            enabled: true,
            num_velocity_steps_override: 0,
            num_position_steps_override: 0,
            impulses: JointImpulses::default(),
        };

        let initial_gap = (b.position.x - a.position.x - 1.0).abs();
        for _ in 0..20 {
            c.solve_position(&mut a, &mut b, 0.2);
        }
        let final_gap = (b.position.x - a.position.x - 1.0).abs();
        assert!(final_gap < initial_gap * 0.2, "gap {initial_gap} -> {final_gap}");
    }
}

//! Bodies and the Body Store
//!
//! A [`Body`] owns pose, velocity and mass state plus its collision data.
//! Positions are wide (f64) vectors; everything else is single precision.
//!
//! Bodies live in a generational slot arena ([`BodyStore`]). A [`BodyId`] is
//! an index plus a generation tag: destroying a body bumps the slot's
//! generation, so stale handles are detectably invalid even after the index
//! is recycled. Every cross-reference in the engine (constraint -> body,
//! manifold -> body) goes through these checked handles.

use crate::error::{PhysicsError, PhysicsResult};
use crate::filter::{CollisionFilter, ObjectLayer};
use crate::math::{is_finite_rvec3, is_finite_vec3, Quat, RVec3, Vec3};
use crate::shape::{Shape, ShapeRef};

/// Checked handle to a body: recyclable index + generation tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId {
    index: u32,
    generation: u32,
}

impl BodyId {
    /// Sentinel that never refers to a live body.
    pub const INVALID: BodyId = BodyId { index: u32::MAX, generation: 0 };

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index. Only meaningful while the handle is valid.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation tag distinguishing reuses of the same slot.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// True for the invalid sentinel.
    #[inline]
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.index == u32::MAX
    }
}

/// How a body is simulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MotionType {
    /// Never moves
    Static = 0,
    /// Moved by explicit kinematic calls, pushes dynamic bodies
    Kinematic = 1,
    /// Moved by forces, contacts and constraints
    Dynamic = 2,
}

/// Integration quality for fast-moving bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MotionQuality {
    /// One discrete step; may tunnel at high speed
    Discrete = 0,
    /// Cast the shape along its motion and clamp to first impact
    LinearCast = 1,
}

/// Whether a newly added body starts active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    /// Start simulating immediately
    Activate,
    /// Start asleep until something wakes it
    DontActivate,
}

/// Mask of degrees of freedom a dynamic body may use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllowedDofs(pub u8);

impl AllowedDofs {
    /// Translation along X
    pub const TRANSLATION_X: AllowedDofs = AllowedDofs(0b000001);
    /// Translation along Y
    pub const TRANSLATION_Y: AllowedDofs = AllowedDofs(0b000010);
    /// Translation along Z
    pub const TRANSLATION_Z: AllowedDofs = AllowedDofs(0b000100);
    /// Rotation about X
    pub const ROTATION_X: AllowedDofs = AllowedDofs(0b001000);
    /// Rotation about Y
    pub const ROTATION_Y: AllowedDofs = AllowedDofs(0b010000);
    /// Rotation about Z
    pub const ROTATION_Z: AllowedDofs = AllowedDofs(0b100000);
    /// All six degrees of freedom
    pub const ALL: AllowedDofs = AllowedDofs(0b111111);
    /// XY-plane motion only (2D-style body)
    pub const PLANE_2D: AllowedDofs = AllowedDofs(0b100011);

    /// Set union.
    #[must_use]
    pub const fn union(self, other: AllowedDofs) -> AllowedDofs {
        AllowedDofs(self.0 | other.0)
    }

    /// Membership test.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: AllowedDofs) -> bool {
        self.0 & other.0 == other.0
    }

    /// Translation mask as a per-axis multiplier vector.
    #[must_use]
    pub fn linear_mask(self) -> Vec3 {
        Vec3::new(
            if self.contains(Self::TRANSLATION_X) { 1.0 } else { 0.0 },
            if self.contains(Self::TRANSLATION_Y) { 1.0 } else { 0.0 },
            if self.contains(Self::TRANSLATION_Z) { 1.0 } else { 0.0 },
        )
    }

    /// Rotation mask as a per-axis multiplier vector.
    #[must_use]
    pub fn angular_mask(self) -> Vec3 {
        Vec3::new(
            if self.contains(Self::ROTATION_X) { 1.0 } else { 0.0 },
            if self.contains(Self::ROTATION_Y) { 1.0 } else { 0.0 },
            if self.contains(Self::ROTATION_Z) { 1.0 } else { 0.0 },
        )
    }
}

impl Default for AllowedDofs {
    fn default() -> Self {
        Self::ALL
    }
}

/// Everything needed to create a body.
#[derive(Clone, Debug)]
pub struct BodyCreationSettings {
    /// Collision geometry
    pub shape: ShapeRef,
    /// Initial world position
    pub position: RVec3,
    /// Initial world orientation
    pub rotation: Quat,
    /// Simulation mode
    pub motion_type: MotionType,
    /// Object layer for the pair table
    pub object_layer: ObjectLayer,
    /// Bitmask filter
    pub filter: CollisionFilter,
    /// Initial linear velocity
    pub linear_velocity: Vec3,
    /// Initial angular velocity
    pub angular_velocity: Vec3,
    /// Friction coefficient
    pub friction: f32,
    /// Restitution coefficient
    pub restitution: f32,
    /// Gravity multiplier
    pub gravity_factor: f32,
    /// Density used to derive mass properties (kg/m^3)
    pub density: f32,
    /// Explicit mass override; `None` derives from shape and density
    pub mass_override: Option<f32>,
    /// Integration quality
    pub motion_quality: MotionQuality,
    /// Allowed degrees of freedom
    pub allowed_dofs: AllowedDofs,
    /// Opaque user tag carried on the body
    pub user_data: u64,
}

impl BodyCreationSettings {
    /// Settings for a body at `position` with the given shape and motion type.
    #[must_use]
    pub fn new(shape: ShapeRef, position: RVec3, motion_type: MotionType) -> Self {
        Self {
            shape,
            position,
            rotation: Quat::IDENTITY,
            motion_type,
            object_layer: 0,
            filter: CollisionFilter::DEFAULT,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            friction: 0.3,
            restitution: 0.0,
            gravity_factor: 1.0,
            density: 1000.0,
            mass_override: None,
            motion_quality: MotionQuality::Discrete,
            allowed_dofs: AllowedDofs::ALL,
            user_data: 0,
        }
    }

    /// Builder: set rotation.
    #[must_use]
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Builder: set restitution.
    #[must_use]
    pub fn with_restitution(mut self, restitution: f32) -> Self {
        self.restitution = restitution;
        self
    }

    /// Builder: set friction.
    #[must_use]
    pub fn with_friction(mut self, friction: f32) -> Self {
        self.friction = friction;
        self
    }

    /// Builder: set the object layer.
    #[must_use]
    pub fn with_object_layer(mut self, layer: ObjectLayer) -> Self {
        self.object_layer = layer;
        self
    }

    /// Builder: set the bitmask filter.
    #[must_use]
    pub fn with_filter(mut self, filter: CollisionFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// A rigid body.
#[derive(Clone, Debug)]
pub struct Body {
    /// World position of the center of mass (wide precision)
    pub position: RVec3,
    /// World orientation
    pub rotation: Quat,
    /// Linear velocity (m/s)
    pub linear_velocity: Vec3,
    /// Angular velocity (rad/s)
    pub angular_velocity: Vec3,
    /// Inverse mass; zero for static/kinematic
    pub(crate) inv_mass: f32,
    /// Inverse inertia diagonal in local space; zero for static/kinematic
    pub(crate) inv_inertia_local: Vec3,
    /// Collision geometry
    pub shape: ShapeRef,
    /// Simulation mode
    pub motion_type: MotionType,
    /// Integration quality
    pub motion_quality: MotionQuality,
    /// Object layer for the pair table
    pub object_layer: ObjectLayer,
    /// Bitmask filter
    pub filter: CollisionFilter,
    /// Friction coefficient
    pub friction: f32,
    /// Restitution coefficient
    pub restitution: f32,
    /// Gravity multiplier
    pub gravity_factor: f32,
    /// Allowed degrees of freedom
    pub allowed_dofs: AllowedDofs,
    /// Opaque user tag
    pub user_data: u64,
    /// Whether the body is currently simulated
    pub(crate) active: bool,
    /// Seconds this body has been below the sleep thresholds
    pub(crate) sleep_timer: f32,
    /// Accumulated force, cleared after each step
    pub(crate) force_accum: Vec3,
    /// Accumulated torque, cleared after each step
    pub(crate) torque_accum: Vec3,
    /// Broadphase proxy id
    pub(crate) proxy: u32,
}

impl Body {
    fn from_settings(settings: &BodyCreationSettings) -> Self {
        let (inv_mass, inv_inertia_local) = match settings.motion_type {
            MotionType::Static | MotionType::Kinematic => (0.0, Vec3::ZERO),
            MotionType::Dynamic => {
                let mut mp = settings.shape.mass_properties(settings.density);
                if let Some(mass) = settings.mass_override {
                    // Rescale inertia with the explicit mass.
                    if mp.mass > 0.0 {
                        mp.inertia *= mass / mp.mass;
                    }
                    mp.mass = mass;
                }
                let inv_mass = if mp.mass > 0.0 { 1.0 / mp.mass } else { 0.0 };
                let inv_inertia = Vec3::new(
                    if mp.inertia.x > 0.0 { 1.0 / mp.inertia.x } else { 0.0 },
                    if mp.inertia.y > 0.0 { 1.0 / mp.inertia.y } else { 0.0 },
                    if mp.inertia.z > 0.0 { 1.0 / mp.inertia.z } else { 0.0 },
                );
                (inv_mass, inv_inertia)
            }
        };

        Self {
            position: settings.position,
            rotation: settings.rotation.normalize(),
            linear_velocity: settings.linear_velocity,
            angular_velocity: settings.angular_velocity,
            inv_mass,
            inv_inertia_local,
            shape: settings.shape.clone(),
            motion_type: settings.motion_type,
            motion_quality: settings.motion_quality,
            object_layer: settings.object_layer,
            filter: settings.filter,
            friction: settings.friction,
            restitution: settings.restitution,
            gravity_factor: settings.gravity_factor,
            allowed_dofs: settings.allowed_dofs,
            user_data: settings.user_data,
            active: true,
            sleep_timer: 0.0,
            force_accum: Vec3::ZERO,
            torque_accum: Vec3::ZERO,
            proxy: u32::MAX,
        }
    }

    /// True for dynamic bodies.
    #[inline]
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.motion_type == MotionType::Dynamic
    }

    /// True for static bodies.
    #[inline]
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.motion_type == MotionType::Static
    }

    /// True for kinematic bodies.
    #[inline]
    #[must_use]
    pub fn is_kinematic(&self) -> bool {
        self.motion_type == MotionType::Kinematic
    }

    /// Whether the body is currently simulated (not sleeping).
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Inverse mass (0 for static/kinematic).
    #[inline]
    #[must_use]
    pub fn inv_mass(&self) -> f32 {
        self.inv_mass
    }

    /// Local-space inverse inertia diagonal.
    #[inline]
    #[must_use]
    pub fn inv_inertia_local(&self) -> Vec3 {
        self.inv_inertia_local
    }

    /// Velocity of a world point rigidly attached to this body.
    #[must_use]
    pub fn point_velocity(&self, point: RVec3) -> Vec3 {
        let r = (point - self.position).as_vec3();
        self.linear_velocity + self.angular_velocity.cross(r)
    }

    /// Accumulate a force at the center of mass for the next step.
    pub fn add_force(&mut self, force: Vec3) {
        if self.is_dynamic() {
            self.force_accum += force;
        }
    }

    /// Accumulate a torque for the next step.
    pub fn add_torque(&mut self, torque: Vec3) {
        if self.is_dynamic() {
            self.torque_accum += torque;
        }
    }

    /// Accumulate a force applied at a world point.
    pub fn add_force_at(&mut self, force: Vec3, point: RVec3) {
        if self.is_dynamic() {
            let r = (point - self.position).as_vec3();
            self.force_accum += force;
            self.torque_accum += r.cross(force);
        }
    }

    /// Apply an instantaneous impulse at the center of mass.
    pub fn add_impulse(&mut self, impulse: Vec3) {
        if self.is_dynamic() {
            self.linear_velocity += impulse * self.inv_mass;
        }
    }

    /// Apply an instantaneous angular impulse.
    pub fn add_angular_impulse(&mut self, impulse: Vec3) {
        if self.is_dynamic() {
            let inv_i = crate::math::inverse_inertia_world(self.inv_inertia_local, self.rotation);
            self.angular_velocity += inv_i * impulse;
        }
    }

    /// Apply an instantaneous impulse at a world point.
    pub fn add_impulse_at(&mut self, impulse: Vec3, point: RVec3) {
        if self.is_dynamic() {
            self.linear_velocity += impulse * self.inv_mass;
            let r = (point - self.position).as_vec3();
            let inv_i = crate::math::inverse_inertia_world(self.inv_inertia_local, self.rotation);
            self.angular_velocity += inv_i * r.cross(impulse);
        }
    }

    /// Drive a kinematic body toward a target pose over `dt`.
    ///
    /// The pose is reached by integration, so kinematic bodies only ever move
    /// through this call (or direct velocity writes).
    pub fn move_kinematic(&mut self, target_position: RVec3, target_rotation: Quat, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        self.linear_velocity = ((target_position - self.position) / f64::from(dt)).as_vec3();

        let delta = crate::math::rotation_error(self.rotation, target_rotation.normalize());
        self.angular_velocity = delta / dt;
    }

    /// Replace velocities, sanitizing non-finite input.
    pub fn set_velocities(&mut self, linear: Vec3, angular: Vec3) {
        debug_assert!(is_finite_vec3(linear) && is_finite_vec3(angular));
        if is_finite_vec3(linear) {
            self.linear_velocity = linear;
        }
        if is_finite_vec3(angular) {
            self.angular_velocity = angular;
        }
    }

    /// Replace the pose, sanitizing non-finite input.
    pub fn set_pose(&mut self, position: RVec3, rotation: Quat) {
        debug_assert!(is_finite_rvec3(position));
        if is_finite_rvec3(position) {
            self.position = position;
        }
        if rotation.is_finite() {
            self.rotation = rotation.normalize();
        }
    }
}

// ============================================================================
// Body Store
// ============================================================================

struct Slot {
    generation: u32,
    body: Option<Body>,
}

/// Generational slot arena owning every body in a world.
pub struct BodyStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    max_bodies: usize,
}

impl BodyStore {
    /// Create a store bounded by `max_bodies`.
    #[must_use]
    pub fn new(max_bodies: usize) -> Self {
        Self { slots: Vec::new(), free: Vec::new(), live: 0, max_bodies }
    }

    /// Number of live bodies.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// True when no bodies are live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots ever allocated (live or free). Raw indices are always
    /// below this bound.
    #[inline]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Allocate a body from creation settings.
    pub fn add(&mut self, settings: &BodyCreationSettings) -> PhysicsResult<BodyId> {
        if self.live >= self.max_bodies {
            return Err(PhysicsError::CapacityExceeded {
                resource: "bodies",
                limit: self.max_bodies,
            });
        }

        let body = Body::from_settings(settings);
        let index = if let Some(index) = self.free.pop() {
            self.slots[index as usize].body = Some(body);
            index
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, body: Some(body) });
            index
        };
        self.live += 1;
        Ok(BodyId::new(index, self.slots[index as usize].generation))
    }

    /// Free a body. The slot's generation is bumped so the handle (and any
    /// copies of it) become invalid immediately.
    pub fn remove(&mut self, id: BodyId) -> PhysicsResult<Body> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.body.is_some())
            .ok_or(PhysicsError::InvalidBody { id })?;

        let body = slot.body.take().expect("checked above");
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(body)
    }

    /// Check a handle without touching the body.
    #[must_use]
    pub fn is_valid(&self, id: BodyId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|s| s.generation == id.generation && s.body.is_some())
    }

    /// Borrow a body.
    pub fn get(&self, id: BodyId) -> PhysicsResult<&Body> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.body.as_ref())
            .ok_or(PhysicsError::InvalidBody { id })
    }

    /// Borrow a body mutably.
    pub fn get_mut(&mut self, id: BodyId) -> PhysicsResult<&mut Body> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.body.as_mut())
            .ok_or(PhysicsError::InvalidBody { id })
    }

    /// Borrow by raw slot index (internal fast path; index must be live).
    pub(crate) fn get_by_index(&self, index: u32) -> Option<&Body> {
        self.slots.get(index as usize).and_then(|s| s.body.as_ref())
    }

    /// Mutable borrow by raw slot index.
    pub(crate) fn get_by_index_mut(&mut self, index: u32) -> Option<&mut Body> {
        self.slots.get_mut(index as usize).and_then(|s| s.body.as_mut())
    }

    /// Current handle for a raw slot index.
    pub(crate) fn id_for_index(&self, index: u32) -> Option<BodyId> {
        let slot = self.slots.get(index as usize)?;
        slot.body.as_ref()?;
        Some(BodyId::new(index, slot.generation))
    }

    /// Iterate live bodies in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (BodyId, &Body)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.body.as_ref().map(|b| (BodyId::new(i as u32, s.generation), b))
        })
    }

    /// Iterate live bodies mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BodyId, &mut Body)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.body.as_mut().map(move |b| (BodyId::new(i as u32, generation), b))
        })
    }
}

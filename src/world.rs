//! The Physics System
//!
//! Owns every store (bodies, broadphase, manifold cache, constraints,
//! vehicles) and runs the per-step pipeline:
//!
//! broadphase -> narrowphase -> island build -> solve (parallel across
//! islands) -> integration -> sleep management.
//!
//! `step` is synchronous: it blocks until all island jobs have joined.
//! Structural mutation (adding/removing bodies, constraints, vehicles) takes
//! `&mut self` and therefore cannot race an in-flight step by construction;
//! callers perform it between steps.
//!
//! Capacity saturation during a step is reported through [`StepResult`]
//! flags and never fails the step; the overflowed category is simply
//! truncated for that step.

use std::sync::Mutex;

use crate::body::{
    Activation, Body, BodyCreationSettings, BodyId, BodyStore, MotionQuality, MotionType,
};
use crate::broad_phase::BroadPhase;
use crate::config::{default_gravity, SimulationSettings, SolverSettings};
use crate::constraint::{
    self, Constraint, ConstraintId, ConstraintStore, DistanceConstraintSettings,
    FixedConstraintSettings, HingeConstraintSettings, JointImpulses, PointConstraintSettings,
    SliderConstraintSettings,
};
use crate::contact::{BodyPairKey, ContactCache, ManifoldKey};
use crate::error::{PhysicsError, PhysicsResult};
use crate::filter::{CollisionFilter, ObjectLayerPairTable, QueryFilter};
use crate::island::{build_islands, IslandBuilder};
use crate::math::{inverse_inertia_world, Quat, RVec3, Vec3};
use crate::narrow_phase::{self, CollideSettings};
use crate::scheduler::JobSystem;
use crate::sleeping::{self, SleepSettings};
use crate::solver::{self, BodyRef, ContactConstraint, JointRun, SolverBody};
use crate::vehicle::{VehicleConstraint, VehicleConstraintSettings, VehicleRun, WheelContact};

/// Saturation flags reported by one step. All false = nothing was dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepResult {
    /// The manifold cache filled up; some contact manifolds were dropped
    pub manifold_cache_full: bool,
    /// The body-pair list filled up; some candidate pairs were dropped
    pub body_pair_cache_full: bool,
    /// The contact-constraint list filled up; some contacts went unsolved
    pub contact_constraints_full: bool,
}

impl StepResult {
    /// True when nothing saturated.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !(self.manifold_cache_full || self.body_pair_cache_full || self.contact_constraints_full)
    }

    fn merge(&mut self, other: StepResult) {
        self.manifold_cache_full |= other.manifold_cache_full;
        self.body_pair_cache_full |= other.body_pair_cache_full;
        self.contact_constraints_full |= other.contact_constraints_full;
    }
}

/// Synchronous trace/assert sink, invoked on the calling thread. The core
/// never performs I/O itself; the default sink forwards to the `log` crate.
pub trait TraceSink: Send + Sync {
    /// A diagnostic message from the engine.
    fn trace(&self, message: &str) {
        log::debug!("{message}");
    }

    /// A violated internal expectation. Return true to request a break into
    /// the debugger (callers embedding the engine decide what that means).
    fn assert_failed(&self, expression: &str, message: &str, file: &str, line: u32) -> bool {
        log::error!("assert failed: {expression} ({message}) at {file}:{line}");
        false
    }
}

/// Handle to a vehicle owned by the world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VehicleId(u32);

/// The simulation world.
pub struct PhysicsSystem {
    simulation: SimulationSettings,
    pub(crate) solver_settings: SolverSettings,
    gravity: Vec3,
    pub(crate) bodies: BodyStore,
    pub(crate) broad_phase: BroadPhase,
    contact_cache: ContactCache,
    constraints: ConstraintStore,
    vehicles: Vec<Option<VehicleConstraint>>,
    layer_table: ObjectLayerPairTable,
    island_builder: IslandBuilder,
    trace: Option<Box<dyn TraceSink>>,
}

impl PhysicsSystem {
    /// Create a world. Invalid settings refuse construction.
    pub fn new(
        simulation: SimulationSettings,
        solver_settings: SolverSettings,
        layer_table: ObjectLayerPairTable,
    ) -> PhysicsResult<Self> {
        simulation.validate()?;
        solver_settings.validate()?;
        Ok(Self {
            simulation,
            solver_settings,
            gravity: default_gravity(),
            bodies: BodyStore::new(simulation.max_bodies as usize),
            broad_phase: BroadPhase::new(),
            contact_cache: ContactCache::new(simulation.max_body_pairs as usize),
            constraints: ConstraintStore::new(),
            vehicles: Vec::new(),
            layer_table,
            island_builder: IslandBuilder::new(0),
            trace: None,
        })
    }

    /// Create a world with default limits and tuning.
    pub fn with_default_settings() -> PhysicsResult<Self> {
        Self::new(
            SimulationSettings::default(),
            SolverSettings::default(),
            ObjectLayerPairTable::default(),
        )
    }

    /// Current gravity.
    #[must_use]
    pub fn gravity(&self) -> Vec3 {
        self.gravity
    }

    /// Replace gravity.
    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = gravity;
    }

    /// Current solver tuning.
    #[must_use]
    pub fn physics_settings(&self) -> SolverSettings {
        self.solver_settings
    }

    /// Replace solver tuning; invalid values are rejected and nothing changes.
    pub fn set_physics_settings(&mut self, settings: SolverSettings) -> PhysicsResult<()> {
        settings.validate()?;
        self.solver_settings = settings;
        Ok(())
    }

    /// Install a trace/assert sink.
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace = Some(sink);
    }

    fn emit_trace(&self, message: &str) {
        match &self.trace {
            Some(sink) => sink.trace(message),
            None => log::debug!("{message}"),
        }
    }

    // ========================================================================
    // Body interface
    // ========================================================================

    /// Number of live bodies.
    #[must_use]
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Create a body and insert it into the broadphase.
    pub fn add_body(
        &mut self,
        settings: &BodyCreationSettings,
        activation: Activation,
    ) -> PhysicsResult<BodyId> {
        let id = self.bodies.add(settings)?;
        let body = self.bodies.get_mut(id)?;
        body.set_active_flag(match settings.motion_type {
            MotionType::Static => false,
            _ => activation == Activation::Activate,
        });
        let aabb = body.shape.world_aabb(body.position, body.rotation);
        self.broad_phase.add_body(id.index(), aabb);
        Ok(id)
    }

    /// Remove a body.
    ///
    /// Fails with [`PhysicsError::BodyInConstraint`] while a constraint or a
    /// vehicle still references it: dependent objects must be removed first.
    /// A stale handle fails with [`PhysicsError::InvalidBody`]; live bodies
    /// sharing the recycled index are never touched.
    pub fn remove_body(&mut self, id: BodyId) -> PhysicsResult<()> {
        if !self.bodies.is_valid(id) {
            return Err(PhysicsError::InvalidBody { id });
        }
        if let Some(constraint) = self.constraints.find_referencing(id) {
            return Err(PhysicsError::BodyInConstraint { body: id, constraint });
        }
        if self.vehicles.iter().flatten().any(|v| v.body == id) {
            return Err(PhysicsError::InvalidConstraint {
                reason: "body is still used as a vehicle chassis",
            });
        }

        self.broad_phase.remove_body(id.index());
        self.contact_cache.remove_body(id);
        self.bodies.remove(id)?;
        Ok(())
    }

    /// Borrow a body.
    pub fn body(&self, id: BodyId) -> PhysicsResult<&Body> {
        self.bodies.get(id)
    }

    /// Borrow a body mutably. Waking is NOT implied; use the explicit calls.
    pub fn body_mut(&mut self, id: BodyId) -> PhysicsResult<&mut Body> {
        self.bodies.get_mut(id)
    }

    /// True when the handle refers to a live body.
    #[must_use]
    pub fn is_valid(&self, id: BodyId) -> bool {
        self.bodies.is_valid(id)
    }

    /// Whether the body is currently simulated (awake).
    pub fn is_active(&self, id: BodyId) -> PhysicsResult<bool> {
        Ok(self.bodies.get(id)?.is_active())
    }

    /// Wake a body (its island follows on the next step).
    pub fn activate_body(&mut self, id: BodyId) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        if !body.is_static() {
            sleeping::wake(body);
        }
        Ok(())
    }

    /// Put a body to sleep immediately.
    pub fn deactivate_body(&mut self, id: BodyId) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        if !body.is_static() {
            sleeping::put_to_sleep(body);
        }
        Ok(())
    }

    /// Teleport a body, refreshing its broadphase proxy.
    pub fn set_position(
        &mut self,
        id: BodyId,
        position: RVec3,
        activation: Activation,
    ) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.set_pose(position, body.rotation);
        if activation == Activation::Activate && !body.is_static() {
            sleeping::wake(body);
        }
        let aabb = body.shape.world_aabb(body.position, body.rotation);
        self.broad_phase.update_body(id.index(), aabb);
        Ok(())
    }

    /// Rotate a body in place, refreshing its broadphase proxy.
    pub fn set_rotation(
        &mut self,
        id: BodyId,
        rotation: Quat,
        activation: Activation,
    ) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.set_pose(body.position, rotation);
        if activation == Activation::Activate && !body.is_static() {
            sleeping::wake(body);
        }
        let aabb = body.shape.world_aabb(body.position, body.rotation);
        self.broad_phase.update_body(id.index(), aabb);
        Ok(())
    }

    /// Set a body's linear velocity, waking it.
    pub fn set_linear_velocity(&mut self, id: BodyId, velocity: Vec3) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.set_velocities(velocity, body.angular_velocity);
        if body.is_dynamic() {
            sleeping::wake(body);
        }
        Ok(())
    }

    /// Set a body's angular velocity, waking it.
    pub fn set_angular_velocity(&mut self, id: BodyId, velocity: Vec3) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.set_velocities(body.linear_velocity, velocity);
        if body.is_dynamic() {
            sleeping::wake(body);
        }
        Ok(())
    }

    /// Accumulate a force for the next step, waking the body.
    pub fn add_force(&mut self, id: BodyId, force: Vec3) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.add_force(force);
        if body.is_dynamic() {
            sleeping::wake(body);
        }
        Ok(())
    }

    /// Accumulate a torque for the next step, waking the body.
    pub fn add_torque(&mut self, id: BodyId, torque: Vec3) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.add_torque(torque);
        if body.is_dynamic() {
            sleeping::wake(body);
        }
        Ok(())
    }

    /// Apply an impulse at the center of mass, waking the body.
    pub fn add_impulse(&mut self, id: BodyId, impulse: Vec3) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.add_impulse(impulse);
        if body.is_dynamic() {
            sleeping::wake(body);
        }
        Ok(())
    }

    /// Apply an impulse at a world point, waking the body.
    pub fn add_impulse_at(&mut self, id: BodyId, impulse: Vec3, point: RVec3) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.add_impulse_at(impulse, point);
        if body.is_dynamic() {
            sleeping::wake(body);
        }
        Ok(())
    }

    /// Apply an angular impulse, waking the body.
    pub fn add_angular_impulse(&mut self, id: BodyId, impulse: Vec3) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.add_angular_impulse(impulse);
        if body.is_dynamic() {
            sleeping::wake(body);
        }
        Ok(())
    }

    /// Drive a kinematic body toward a target pose over `dt`.
    pub fn move_kinematic(
        &mut self,
        id: BodyId,
        target_position: RVec3,
        target_rotation: Quat,
        dt: f32,
    ) -> PhysicsResult<()> {
        let body = self.bodies.get_mut(id)?;
        body.move_kinematic(target_position, target_rotation, dt);
        body.set_active_flag(true);
        Ok(())
    }

    /// Velocity of a world point rigidly attached to a body.
    pub fn body_point_velocity(&self, id: BodyId, point: RVec3) -> PhysicsResult<Vec3> {
        Ok(self.bodies.get(id)?.point_velocity(point))
    }

    /// Rebuild the broadphase tree for query locality (e.g. after bulk
    /// insertion).
    pub fn optimize_broad_phase(&mut self) {
        self.broad_phase.optimize();
    }

    // ========================================================================
    // Constraint interface
    // ========================================================================

    fn attach_constraint(
        &mut self,
        body_a: BodyId,
        body_b: BodyId,
        make: impl FnOnce(RVec3, Quat, RVec3, Quat) -> constraint::ConstraintKind,
    ) -> PhysicsResult<ConstraintId> {
        let (pos_a, rot_a) = {
            let a = self.bodies.get(body_a)?;
            (a.position, a.rotation)
        };
        let (pos_b, rot_b) = if body_b.is_invalid() {
            (RVec3::ZERO, Quat::IDENTITY)
        } else {
            let b = self.bodies.get(body_b)?;
            (b.position, b.rotation)
        };

        let id = self.constraints.add(Constraint {
            body_a,
            body_b,
            kind: make(pos_a, rot_a, pos_b, rot_b),
            enabled: true,
            num_velocity_steps_override: 0,
            num_position_steps_override: 0,
            impulses: JointImpulses::default(),
        })?;

        let _ = self.activate_body(body_a);
        if !body_b.is_invalid() {
            let _ = self.activate_body(body_b);
        }
        Ok(id)
    }

    /// Weld two bodies together (`body_b` may be [`BodyId::INVALID`] for the
    /// world).
    pub fn create_fixed_constraint(
        &mut self,
        body_a: BodyId,
        body_b: BodyId,
        settings: &FixedConstraintSettings,
    ) -> PhysicsResult<ConstraintId> {
        self.attach_constraint(body_a, body_b, |pa, ra, pb, rb| {
            constraint::make_fixed(settings, pa, ra, pb, rb)
        })
    }

    /// Ball-socket joint.
    pub fn create_point_constraint(
        &mut self,
        body_a: BodyId,
        body_b: BodyId,
        settings: &PointConstraintSettings,
    ) -> PhysicsResult<ConstraintId> {
        self.attach_constraint(body_a, body_b, |pa, ra, pb, rb| {
            constraint::make_point(settings, pa, ra, pb, rb)
        })
    }

    /// Distance joint.
    pub fn create_distance_constraint(
        &mut self,
        body_a: BodyId,
        body_b: BodyId,
        settings: &DistanceConstraintSettings,
    ) -> PhysicsResult<ConstraintId> {
        if settings.min_distance > settings.max_distance {
            return Err(PhysicsError::InvalidConstraint {
                reason: "distance constraint: min_distance > max_distance",
            });
        }
        self.attach_constraint(body_a, body_b, |pa, ra, pb, rb| {
            constraint::make_distance(settings, pa, ra, pb, rb)
        })
    }

    /// Hinge joint.
    pub fn create_hinge_constraint(
        &mut self,
        body_a: BodyId,
        body_b: BodyId,
        settings: &HingeConstraintSettings,
    ) -> PhysicsResult<ConstraintId> {
        if settings.hinge_axis.length_squared() < 1.0e-10 {
            return Err(PhysicsError::ZeroLengthVector { context: "hinge axis" });
        }
        self.attach_constraint(body_a, body_b, |pa, ra, pb, rb| {
            constraint::make_hinge(settings, pa, ra, pb, rb)
        })
    }

    /// Slider joint.
    pub fn create_slider_constraint(
        &mut self,
        body_a: BodyId,
        body_b: BodyId,
        settings: &SliderConstraintSettings,
    ) -> PhysicsResult<ConstraintId> {
        if settings.slider_axis.length_squared() < 1.0e-10 {
            return Err(PhysicsError::ZeroLengthVector { context: "slider axis" });
        }
        self.attach_constraint(body_a, body_b, |pa, ra, pb, rb| {
            constraint::make_slider(settings, pa, ra, pb, rb)
        })
    }

    /// Remove a constraint, waking its bodies.
    pub fn remove_constraint(&mut self, id: ConstraintId) -> PhysicsResult<()> {
        let constraint = self.constraints.remove(id)?;
        let _ = self.activate_body(constraint.body_a);
        if !constraint.body_b.is_invalid() {
            let _ = self.activate_body(constraint.body_b);
        }
        Ok(())
    }

    /// Borrow a constraint.
    pub fn constraint(&self, id: ConstraintId) -> PhysicsResult<&Constraint> {
        self.constraints.get(id)
    }

    /// Borrow a constraint mutably (to tune motors, limits, overrides).
    pub fn constraint_mut(&mut self, id: ConstraintId) -> PhysicsResult<&mut Constraint> {
        self.constraints.get_mut(id)
    }

    // ========================================================================
    // Vehicle interface
    // ========================================================================

    /// Attach a vehicle constraint to a chassis body.
    pub fn add_vehicle(
        &mut self,
        body: BodyId,
        settings: VehicleConstraintSettings,
    ) -> PhysicsResult<VehicleId> {
        if !self.bodies.is_valid(body) {
            return Err(PhysicsError::InvalidBody { id: body });
        }
        if settings.wheels.is_empty() {
            return Err(PhysicsError::InvalidConstraint {
                reason: "a vehicle needs at least one wheel",
            });
        }
        let vehicle = VehicleConstraint::new(body, settings);
        for (i, slot) in self.vehicles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(vehicle);
                return Ok(VehicleId(i as u32));
            }
        }
        self.vehicles.push(Some(vehicle));
        Ok(VehicleId(self.vehicles.len() as u32 - 1))
    }

    /// Detach a vehicle.
    pub fn remove_vehicle(&mut self, id: VehicleId) -> PhysicsResult<()> {
        match self.vehicles.get_mut(id.0 as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(PhysicsError::InvalidConstraint { reason: "unknown vehicle handle" }),
        }
    }

    /// Borrow a vehicle.
    pub fn vehicle(&self, id: VehicleId) -> PhysicsResult<&VehicleConstraint> {
        self.vehicles
            .get(id.0 as usize)
            .and_then(|v| v.as_ref())
            .ok_or(PhysicsError::InvalidConstraint { reason: "unknown vehicle handle" })
    }

    /// Borrow a vehicle mutably (driver input).
    pub fn vehicle_mut(&mut self, id: VehicleId) -> PhysicsResult<&mut VehicleConstraint> {
        self.vehicles
            .get_mut(id.0 as usize)
            .and_then(|v| v.as_mut())
            .ok_or(PhysicsError::InvalidConstraint { reason: "unknown vehicle handle" })
    }

    // ========================================================================
    // Stepping
    // ========================================================================

    /// Advance the world by `delta_time`, split into `collision_steps`
    /// substeps. Blocks until all parallel work has joined.
    pub fn step(
        &mut self,
        delta_time: f32,
        collision_steps: u32,
        job_system: &JobSystem,
    ) -> PhysicsResult<StepResult> {
        if !delta_time.is_finite() || delta_time <= 0.0 {
            return Err(PhysicsError::InvalidConfiguration { reason: "delta_time must be > 0" });
        }
        if collision_steps == 0 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "collision_steps must be > 0",
            });
        }
        // Each collision step joins two fork-join scopes (narrowphase batch,
        // island solve). Exceeding the pool's barrier capacity is a
        // configuration error, never a runtime race.
        if collision_steps * 2 > job_system.config().max_barriers {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "collision_steps exceeds the job system's barrier capacity",
            });
        }

        let dt = delta_time / collision_steps as f32;
        let mut result = StepResult::default();
        for _ in 0..collision_steps {
            result.merge(self.collision_step(dt, job_system));
        }

        // Forces accumulate per user step, not per collision substep.
        for (_, body) in self.bodies.iter_mut() {
            body.clear_accumulated_forces();
        }

        if !result.is_ok() {
            self.emit_trace(&format!("step saturated: {result:?}"));
        }
        Ok(result)
    }

    fn collision_step(&mut self, dt: f32, job_system: &JobSystem) -> StepResult {
        let mut result = StepResult::default();
        self.contact_cache.begin_step();

        self.propagate_wake();
        self.integrate_forces(dt);

        let (active_all, active_dynamic, ccd_snapshot) = self.refresh_proxies(dt);
        let pairs = self.collect_filtered_pairs(&active_all, &mut result);
        self.update_manifolds(&pairs, job_system, dt);
        result.manifold_cache_full |= self.contact_cache.saturation.manifold_cache_full;
        result.body_pair_cache_full |= self.contact_cache.saturation.body_pair_cache_full;

        self.update_vehicle_wheels();

        let works = self.build_islands_and_work(&active_dynamic, dt, &mut result);
        let solved = Self::solve_parallel(works, &self.solver_settings, dt, job_system);
        self.write_back(&solved);

        self.integrate_kinematic(dt);
        self.continuous_collision(&ccd_snapshot, dt);
        self.update_sleep(&solved, dt);
        self.finish_vehicles(dt);

        // Prune dead pairs; sleeping islands keep their manifolds frozen.
        let bodies = &self.bodies;
        self.contact_cache.end_step_with(|key| {
            let alive = |id: BodyId| {
                bodies
                    .get(id)
                    .map(|b| !b.is_active() || b.is_static())
                    .unwrap_or(false)
            };
            alive(key.pair.first) && alive(key.pair.second)
        });

        result
    }

    /// Wake sleeping bodies connected to active ones through frozen manifolds
    /// or constraints, transitively (islands wake as a unit).
    fn propagate_wake(&mut self) {
        loop {
            let mut to_wake: Vec<u32> = Vec::new();
            {
                let bodies = &self.bodies;
                let mut consider = |a: BodyId, b: BodyId| {
                    let (Ok(ba), Ok(bb)) = (bodies.get(a), bodies.get(b)) else { return };
                    let a_wakes = ba.is_active() && !ba.is_static();
                    let b_wakes = bb.is_active() && !bb.is_static();
                    if a_wakes && !bb.is_active() && bb.is_dynamic() {
                        to_wake.push(b.index());
                    }
                    if b_wakes && !ba.is_active() && ba.is_dynamic() {
                        to_wake.push(a.index());
                    }
                };
                for m in self.contact_cache.iter() {
                    consider(m.key.pair.first, m.key.pair.second);
                }
                for (_, c) in self.constraints.iter() {
                    if c.enabled && !c.body_b.is_invalid() {
                        consider(c.body_a, c.body_b);
                    }
                }
            }
            if to_wake.is_empty() {
                break;
            }
            for index in to_wake {
                if let Some(body) = self.bodies.get_by_index_mut(index) {
                    sleeping::wake(body);
                }
            }
        }
    }

    /// Gravity and accumulated forces -> velocities, for active dynamic
    /// bodies.
    fn integrate_forces(&mut self, dt: f32) {
        let gravity = self.gravity;
        for (_, body) in self.bodies.iter_mut() {
            if !body.is_dynamic() || !body.is_active() {
                continue;
            }
            let inv_mass = body.inv_mass();
            body.linear_velocity +=
                (gravity * body.gravity_factor + body.force_accum() * inv_mass) * dt;
            let inv_i = inverse_inertia_world(body.inv_inertia_local(), body.rotation);
            body.angular_velocity += inv_i * body.torque_accum() * dt;
        }
    }

    /// Refresh broadphase proxies for moving bodies. Returns (all active
    /// bodies, active dynamic bodies, CCD snapshots), slot-sorted.
    fn refresh_proxies(&mut self, dt: f32) -> (Vec<u32>, Vec<u32>, Vec<(u32, RVec3, Quat)>) {
        let margin = f64::from(self.solver_settings.speculative_contact_distance);
        let bodies = &self.bodies;
        let broad_phase = &mut self.broad_phase;

        let mut active_all = Vec::new();
        let mut active_dynamic = Vec::new();
        let mut ccd = Vec::new();

        for (id, body) in bodies.iter() {
            if body.is_static() || !body.is_active() {
                continue;
            }
            let index = id.index();
            active_all.push(index);
            if body.is_dynamic() {
                active_dynamic.push(index);
                if body.motion_quality == MotionQuality::LinearCast {
                    ccd.push((index, body.position, body.rotation));
                }
            }

            let aabb = body
                .shape
                .world_aabb(body.position, body.rotation)
                .extended_by((body.linear_velocity * dt).as_dvec3())
                .grown(margin);
            broad_phase.update_body(index, aabb);
        }

        (active_all, active_dynamic, ccd)
    }

    /// Broadphase pairs filtered by layers, bounded by `max_body_pairs`.
    fn collect_filtered_pairs(&self, active: &[u32], result: &mut StepResult) -> Vec<(u32, u32)> {
        let bodies = &self.bodies;
        let candidates = self
            .broad_phase
            .collect_pairs(active, |index| {
                bodies.get_by_index(index).is_some_and(|b| b.is_active() && !b.is_static())
            });

        let max_pairs = self.simulation.max_body_pairs as usize;
        let mut pairs = Vec::with_capacity(candidates.len().min(max_pairs));
        for (a, b) in candidates {
            let (Some(body_a), Some(body_b)) =
                (bodies.get_by_index(a), bodies.get_by_index(b))
            else {
                continue;
            };
            // At least one side must respond to contacts.
            if !body_a.is_dynamic() && !body_b.is_dynamic() {
                continue;
            }
            if !CollisionFilter::can_collide(&body_a.filter, &body_b.filter) {
                continue;
            }
            if !self.layer_table.should_collide(body_a.object_layer, body_b.object_layer) {
                continue;
            }
            if pairs.len() >= max_pairs {
                result.body_pair_cache_full = true;
                break;
            }
            pairs.push((a, b));
        }
        pairs
    }

    /// Narrowphase over all pairs (parallel), then a serial, deterministic
    /// merge into the manifold cache.
    fn update_manifolds(&mut self, pairs: &[(u32, u32)], job_system: &JobSystem, _dt: f32) {
        let settings = CollideSettings {
            speculative_distance: self.solver_settings.speculative_contact_distance,
            tolerance: 1.0e-4,
            active_edge_cos_threshold: self.solver_settings.active_edge_cos_threshold,
        };

        // Parallel exact tests; results are tagged with the pair index so the
        // merge below is order-independent.
        let collected: Mutex<Vec<(u32, narrow_phase::PairManifold)>> = Mutex::new(Vec::new());
        {
            let bodies = &self.bodies;
            job_system.dispatch(pairs.len(), |i| {
                let (a, b) = pairs[i];
                let (Some(body_a), Some(body_b)) =
                    (bodies.get_by_index(a), bodies.get_by_index(b))
                else {
                    return;
                };
                let offset = (body_b.position - body_a.position).as_vec3();
                let manifolds = narrow_phase::collide_shapes(
                    &body_a.shape,
                    body_a.rotation,
                    &body_b.shape,
                    body_b.rotation,
                    offset,
                    &settings,
                );
                if !manifolds.is_empty() {
                    let mut sink = collected.lock().unwrap_or_else(|e| e.into_inner());
                    for m in manifolds {
                        sink.push((i as u32, m));
                    }
                }
            });
        }

        let mut manifolds = collected.into_inner().unwrap_or_else(|e| e.into_inner());
        if self.solver_settings.deterministic_simulation {
            // Full stable order: results merge identically for a fixed thread
            // count, making the step bit-reproducible. Costs a global sort.
            manifolds.sort_by_key(|(i, m)| (*i, m.sub_shape_a, m.sub_shape_b));
        } else {
            // Cheap bucketing by pair only; order within a pair follows worker
            // interleaving, which is good enough for warm-start matching.
            manifolds.sort_unstable_by_key(|(i, _)| *i);
        }

        let tolerance_sq = self.solver_settings.manifold_tolerance_sq;
        let mut wake_list: Vec<u32> = Vec::new();
        for (pair_idx, m) in manifolds {
            let (ai, bi) = pairs[pair_idx as usize];
            let (Some(id_a), Some(id_b)) =
                (self.bodies.id_for_index(ai), self.bodies.id_for_index(bi))
            else {
                continue;
            };
            let (Some(body_a), Some(body_b)) =
                (self.bodies.get_by_index(ai), self.bodies.get_by_index(bi))
            else {
                continue;
            };

            // Contact with an active body wakes a sleeping one (next step).
            if m.points.iter().any(|p| p.penetration >= 0.0) {
                if !body_a.is_active() && body_a.is_dynamic() {
                    wake_list.push(ai);
                }
                if !body_b.is_active() && body_b.is_dynamic() {
                    wake_list.push(bi);
                }
            }

            let friction = (body_a.friction * body_b.friction).max(0.0).sqrt();
            let restitution = body_a.restitution.max(body_b.restitution);

            // Canonicalize so the cached normal always points first -> second.
            let (pair_key, swapped) = BodyPairKey::new(id_a, id_b);
            let (normal, sub_first, sub_second) = if swapped {
                (-m.normal, m.sub_shape_b, m.sub_shape_a)
            } else {
                (m.normal, m.sub_shape_a, m.sub_shape_b)
            };
            let key = ManifoldKey { pair: pair_key, sub_first, sub_second };

            let (first_body, second_body) = if swapped { (body_b, body_a) } else { (body_a, body_b) };
            let offset_first_second = (second_body.position - first_body.position).as_vec3();

            let Some(manifold) =
                self.contact_cache.get_or_create(key, normal, friction, restitution)
            else {
                continue; // cache full; flag already raised
            };

            for p in &m.points {
                // Narrowphase points are relative to its body A (slot `ai`).
                // After canonicalization `first` may be the other body; re-base.
                let rel_first = if swapped {
                    p.position + offset_first_second
                } else {
                    p.position
                };
                let local_first = first_body.rotation.inverse() * rel_first;
                let local_second = second_body.rotation.inverse()
                    * (rel_first - offset_first_second);
                manifold.add_or_update(
                    local_first,
                    local_second,
                    rel_first,
                    p.penetration,
                    tolerance_sq,
                );
            }
        }

        wake_list.sort_unstable();
        wake_list.dedup();
        for index in wake_list {
            if let Some(body) = self.bodies.get_by_index_mut(index) {
                sleeping::wake(body);
            }
        }
    }

    /// Per-wheel suspension casts for every vehicle.
    fn update_vehicle_wheels(&mut self) {
        let mut vehicles = std::mem::take(&mut self.vehicles);
        for vehicle in vehicles.iter_mut().flatten() {
            let Ok(chassis) = self.bodies.get(vehicle.body) else { continue };
            if !chassis.is_active() {
                continue;
            }
            let (pos, rot) = (chassis.position, chassis.rotation);
            let exclude = [vehicle.body];
            let filter = QueryFilter::any();
            let sys = &*self;
            vehicle.update_wheel_contacts(pos, rot, |start, sweep| {
                sys.cast_ray_all(
                    crate::query::RayCast::new(start, sweep.as_dvec3()),
                    &narrow_phase::RayCastSettings::default(),
                    &filter,
                )
                .sorted()
                .into_iter()
                .find(|hit| !exclude.contains(&hit.body))
                .map(|hit| {
                    let point = start + (sweep * hit.fraction).as_dvec3();
                    let normal = sys.surface_normal_at(hit.body, point).unwrap_or(Vec3::Y);
                    WheelContact { body: hit.body, fraction: hit.fraction, point, normal }
                })
            });
        }
        self.vehicles = vehicles;
    }

    /// Approximate surface normal of a body at a world point (gradient of the
    /// support toward the point).
    fn surface_normal_at(&self, id: BodyId, point: RVec3) -> PhysicsResult<Vec3> {
        let body = self.bodies.get(id)?;
        let local = body.rotation.inverse() * (point - body.position).as_vec3();
        let normal_local = match &*body.shape {
            crate::shape::Shape::Plane { normal, .. } => *normal,
            crate::shape::Shape::Sphere { .. } => local.normalize_or_zero(),
            crate::shape::Shape::Box { half_extents, .. } => {
                // Face whose boundary the point is nearest.
                let d = (local.abs() - *half_extents).abs();
                if d.x <= d.y && d.x <= d.z {
                    Vec3::new(local.x.signum(), 0.0, 0.0)
                } else if d.y <= d.z {
                    Vec3::new(0.0, local.y.signum(), 0.0)
                } else {
                    Vec3::new(0.0, 0.0, local.z.signum())
                }
            }
            _ => local.normalize_or_zero(),
        };
        let n = body.rotation * normal_local;
        if n.length_squared() < 1.0e-10 {
            return Ok(Vec3::Y);
        }
        Ok(n.normalize())
    }

    /// Union-find over the contact/constraint/vehicle graph, then package
    /// per-island solver work.
    fn build_islands_and_work(
        &mut self,
        active_dynamic: &[u32],
        dt: f32,
        result: &mut StepResult,
    ) -> Vec<IslandWork> {
        let slot_count = self.bodies.slot_count();
        self.island_builder.reset(slot_count);

        let bodies = &self.bodies;
        let is_live = |id: BodyId| bodies.get(id).map(|b| b.is_dynamic() && b.is_active());

        for m in self.contact_cache.iter() {
            if let (Ok(true), Ok(true)) = (is_live(m.key.pair.first), is_live(m.key.pair.second)) {
                self.island_builder.union(m.key.pair.first.index(), m.key.pair.second.index());
            }
        }
        for (_, c) in self.constraints.iter() {
            if !c.enabled || c.body_b.is_invalid() {
                continue;
            }
            if let (Ok(true), Ok(true)) = (is_live(c.body_a), is_live(c.body_b)) {
                self.island_builder.union(c.body_a.index(), c.body_b.index());
            }
        }
        for vehicle in self.vehicles.iter().flatten() {
            if is_live(vehicle.body) != Ok(true) {
                continue;
            }
            for wheel in &vehicle.wheels {
                if wheel.has_contact && is_live(wheel.contact_body) == Ok(true) {
                    self.island_builder.union(vehicle.body.index(), wheel.contact_body.index());
                }
            }
        }

        let (islands, island_of_body) = build_islands(&mut self.island_builder, active_dynamic);
        let mut local_of_slot = vec![u32::MAX; slot_count];
        for island in &islands {
            for (local, &slot) in island.bodies.iter().enumerate() {
                local_of_slot[slot as usize] = local as u32;
            }
        }

        let mut works: Vec<IslandWork> = islands
            .iter()
            .map(|island| IslandWork {
                bodies: island
                    .bodies
                    .iter()
                    .filter_map(|&slot| {
                        self.bodies
                            .get_by_index(slot)
                            .map(|body| SolverBody::from_body(body, slot))
                    })
                    .collect(),
                contacts: Vec::new(),
                joints: Vec::new(),
                vehicles: Vec::new(),
            })
            .collect();

        let body_ref = |id: BodyId| -> BodyRef {
            let index = id.index();
            match self.bodies.get_by_index(index) {
                Some(body) if body.is_dynamic() && body.is_active() => {
                    BodyRef::Island(local_of_slot[index as usize])
                }
                Some(body) => BodyRef::Fixed(SolverBody::from_body(body, index)),
                None => BodyRef::Fixed(world_anchor()),
            }
        };
        let island_of = |a: BodyRef, b: BodyRef, ids: (BodyId, BodyId)| -> Option<usize> {
            match (a, b) {
                (BodyRef::Island(_), _) => {
                    island_of_body[ids.0.index() as usize].map(|i| i as usize)
                }
                (_, BodyRef::Island(_)) => {
                    island_of_body[ids.1.index() as usize].map(|i| i as usize)
                }
                _ => None,
            }
        };

        // Contacts, in cache insertion order (stable across steps).
        let mut budget = self.simulation.max_contact_constraints as usize;
        let mut prepared_contacts: Vec<(usize, ContactConstraint)> = Vec::new();
        for manifold in self.contact_cache.iter() {
            if manifold.points.is_empty() {
                continue;
            }
            let ids = (manifold.key.pair.first, manifold.key.pair.second);
            let ref_a = body_ref(ids.0);
            let ref_b = body_ref(ids.1);
            let Some(island) = island_of(ref_a, ref_b, ids) else { continue };

            if budget == 0 {
                result.contact_constraints_full = true;
                break;
            }
            budget -= 1;

            let sb_a = snapshot(&self.bodies, ids.0);
            let sb_b = snapshot(&self.bodies, ids.1);
            prepared_contacts.push((
                island,
                ContactConstraint::prepare(
                    manifold,
                    ref_a,
                    ref_b,
                    &sb_a,
                    &sb_b,
                    &self.solver_settings,
                    dt,
                ),
            ));
        }
        for (island, contact) in prepared_contacts {
            works[island].contacts.push(contact);
        }

        // Joints, in creation (slot) order.
        let mut prepared_joints: Vec<(usize, JointRun)> = Vec::new();
        for (id, c) in self.constraints.iter() {
            if !c.enabled {
                continue;
            }
            let ids = (c.body_a, c.body_b);
            let ref_a = body_ref(ids.0);
            let ref_b = body_ref(ids.1);
            let Some(island) = island_of(ref_a, ref_b, ids) else { continue };

            let sb_a = snapshot(&self.bodies, ids.0);
            let sb_b = snapshot(&self.bodies, ids.1);
            let prep = c.prepare(&sb_a, &sb_b, dt);
            prepared_joints.push((
                island,
                JointRun { id, body_a: ref_a, body_b: ref_b, constraint: c.clone(), prep },
            ));
        }
        for (island, joint) in prepared_joints {
            works[island].joints.push(joint);
        }

        // Vehicles.
        for (vi, vehicle) in self.vehicles.iter().enumerate() {
            let Some(vehicle) = vehicle else { continue };
            let index = vehicle.body.index();
            let Some(chassis) = self.bodies.get_by_index(index) else { continue };
            if !chassis.is_dynamic() || !chassis.is_active() {
                continue;
            }
            let Some(island) = island_of_body[index as usize] else { continue };
            let chassis_sb = SolverBody::from_body(chassis, index);
            let run = VehicleRun::prepare(
                vehicle,
                BodyRef::Island(local_of_slot[index as usize]),
                &chassis_sb,
                vi as u32,
                dt,
            );
            works[island as usize].vehicles.push(run);
        }

        works
    }

    /// Fan islands out across the worker pool; the dispatch joins them all
    /// before returning (the step's barrier).
    fn solve_parallel(
        works: Vec<IslandWork>,
        settings: &SolverSettings,
        dt: f32,
        job_system: &JobSystem,
    ) -> Vec<IslandWork> {
        let cells: Vec<Mutex<IslandWork>> = works.into_iter().map(Mutex::new).collect();
        job_system.dispatch(cells.len(), |i| {
            let mut work = cells[i].lock().unwrap_or_else(|e| e.into_inner());
            let work = &mut *work;
            solver::solve_island(
                &mut work.bodies,
                &mut work.contacts,
                &mut work.joints,
                &mut work.vehicles,
                settings,
                dt,
            );
        });
        cells
            .into_iter()
            .map(|cell| cell.into_inner().unwrap_or_else(|e| e.into_inner()))
            .collect()
    }

    /// Copy solved state and impulses back into the stores.
    fn write_back(&mut self, works: &[IslandWork]) {
        for work in works {
            for sb in &work.bodies {
                if let Some(body) = self.bodies.get_by_index_mut(sb.body_index) {
                    sb.write_back(body);
                }
            }
            for contact in &work.contacts {
                if let Some(manifold) = self.contact_cache.get_mut(&contact.key) {
                    for p in &contact.points {
                        if let Some(cached) = manifold.points.get_mut(p.cache_slot as usize) {
                            cached.lambda_n = p.lambda_n;
                            cached.lambda_t1 = p.lambda_t[0];
                            cached.lambda_t2 = p.lambda_t[1];
                        }
                    }
                }
            }
            for joint in &work.joints {
                if let Ok(c) = self.constraints.get_mut(joint.id) {
                    c.impulses = joint.constraint.impulses;
                }
            }
        }

        // Refresh proxies of moved bodies so queries after the step are exact.
        let bodies = &self.bodies;
        let broad_phase = &mut self.broad_phase;
        for work in works {
            for sb in &work.bodies {
                if let Some(body) = bodies.get_by_index(sb.body_index) {
                    let aabb = body.shape.world_aabb(body.position, body.rotation);
                    broad_phase.update_body(sb.body_index, aabb);
                }
            }
        }
    }

    /// Kinematic bodies integrate their externally driven velocities.
    fn integrate_kinematic(&mut self, dt: f32) {
        let bodies = &mut self.bodies;
        let broad_phase = &mut self.broad_phase;
        for (id, body) in bodies.iter_mut() {
            if !body.is_kinematic() || !body.is_active() {
                continue;
            }
            body.position += (body.linear_velocity * dt).as_dvec3();
            body.rotation =
                crate::math::integrate_rotation(body.rotation, body.angular_velocity, dt);
            let aabb = body.shape.world_aabb(body.position, body.rotation);
            broad_phase.update_body(id.index(), aabb);
        }
    }

    /// Linear-cast continuous collision: clamp fast bodies to their first
    /// time of impact along this step's motion.
    fn continuous_collision(&mut self, snapshot: &[(u32, RVec3, Quat)], _dt: f32) {
        for &(index, old_pos, old_rot) in snapshot {
            let Some(id) = self.bodies.id_for_index(index) else { continue };
            let Ok(body) = self.bodies.get(id) else { continue };
            let displacement = (body.position - old_pos).as_vec3();
            // Only worth casting when the motion exceeds the shape margin.
            if displacement.length_squared()
                < self.solver_settings.speculative_contact_distance.powi(2)
            {
                continue;
            }
            let shape = body.shape.clone();
            let filter = QueryFilter::with_filter(body.filter);

            let Some(hit) =
                self.cast_shape(&shape, old_rot, old_pos, displacement, &filter, &[id])
            else {
                continue;
            };
            if hit.fraction >= 1.0 {
                continue;
            }

            let Ok(body) = self.bodies.get_mut(id) else { continue };
            body.position = old_pos + (displacement * hit.fraction).as_dvec3();
            // Kill the velocity component that would tunnel on the next step.
            let into = body.linear_velocity.dot(hit.normal).max(0.0);
            body.linear_velocity -= hit.normal * into;
            let aabb = body.shape.world_aabb(body.position, body.rotation);
            self.broad_phase.update_body(index, aabb);
        }
    }

    /// Advance sleep timers; islands sleep as a unit.
    fn update_sleep(&mut self, works: &[IslandWork], dt: f32) {
        if !self.solver_settings.allow_sleeping {
            return;
        }
        let settings = SleepSettings {
            linear_threshold: self.solver_settings.point_velocity_sleep_threshold,
            angular_threshold: self.solver_settings.angular_velocity_sleep_threshold,
            time_before_sleep: self.solver_settings.time_before_sleep,
        };

        for work in works {
            let mut timers = Vec::with_capacity(work.bodies.len());
            for sb in &work.bodies {
                let Some(body) = self.bodies.get_by_index_mut(sb.body_index) else { continue };
                let timer = sleeping::advance_sleep_timer(body, dt, &settings);
                body.set_sleep_timer(timer);
                timers.push(timer);
            }
            if sleeping::island_can_sleep(&timers, &settings) {
                for sb in &work.bodies {
                    if let Some(body) = self.bodies.get_by_index_mut(sb.body_index) {
                        sleeping::put_to_sleep(body);
                    }
                }
            }
        }
    }

    /// Wheel spin and pose bookkeeping after the solve.
    fn finish_vehicles(&mut self, dt: f32) {
        let mut vehicles = std::mem::take(&mut self.vehicles);
        for vehicle in vehicles.iter_mut().flatten() {
            if let Ok(chassis) = self.bodies.get(vehicle.body) {
                vehicle.post_step(chassis.linear_velocity, chassis.rotation, dt);
            }
        }
        self.vehicles = vehicles;
    }
}

/// Per-island solver work, boxed up for the worker pool.
struct IslandWork {
    bodies: Vec<SolverBody>,
    contacts: Vec<ContactConstraint>,
    joints: Vec<JointRun>,
    vehicles: Vec<VehicleRun>,
}

/// A solver-body snapshot for a (possibly invalid) handle; invalid handles
/// become a world anchor with infinite mass.
fn snapshot(bodies: &BodyStore, id: BodyId) -> SolverBody {
    match bodies.get(id) {
        Ok(body) => SolverBody::from_body(body, id.index()),
        Err(_) => world_anchor(),
    }
}

fn world_anchor() -> SolverBody {
    SolverBody {
        position: RVec3::ZERO,
        rotation: Quat::IDENTITY,
        linear_velocity: Vec3::ZERO,
        angular_velocity: Vec3::ZERO,
        inv_mass: 0.0,
        inv_inertia_world: crate::math::Mat3::ZERO,
        linear_dof_mask: Vec3::ONE,
        angular_dof_mask: Vec3::ONE,
        body_index: u32::MAX,
    }
}

impl Body {
    pub(crate) fn force_accum(&self) -> Vec3 {
        self.force_accum
    }

    pub(crate) fn torque_accum(&self) -> Vec3 {
        self.torque_accum
    }

    pub(crate) fn clear_accumulated_forces(&mut self) {
        self.force_accum = Vec3::ZERO;
        self.torque_accum = Vec3::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    fn world() -> PhysicsSystem {
        PhysicsSystem::with_default_settings().unwrap()
    }

    fn jobs() -> JobSystem {
        JobSystem::new(crate::scheduler::JobSystemConfig {
            num_threads: 2,
            ..Default::default()
        })
        .unwrap()
    }

    fn dynamic_sphere_at(y: f64) -> BodyCreationSettings {
        BodyCreationSettings::new(
            Shape::sphere(0.5),
            RVec3::new(0.0, y, 0.0),
            MotionType::Dynamic,
        )
    }

    fn static_floor() -> BodyCreationSettings {
        BodyCreationSettings::new(Shape::plane(Vec3::Y, 0.0), RVec3::ZERO, MotionType::Static)
    }

    #[test]
    fn test_invalid_settings_refuse_construction() {
        let bad = SimulationSettings { max_bodies: 0, ..Default::default() };
        assert!(PhysicsSystem::new(
            bad,
            SolverSettings::default(),
            ObjectLayerPairTable::default()
        )
        .is_err());
    }

    #[test]
    fn test_step_rejects_bad_arguments() {
        let mut w = world();
        let js = jobs();
        assert!(w.step(0.0, 1, &js).is_err());
        assert!(w.step(f32::NAN, 1, &js).is_err());
        assert!(w.step(1.0 / 60.0, 0, &js).is_err());
        // More substeps than the pool has barriers for is a setup error.
        assert!(w.step(1.0 / 60.0, 100, &js).is_err());
    }

    #[test]
    fn test_gravity_pulls_dynamic_body_down() {
        let mut w = world();
        let js = jobs();
        let id = w.add_body(&dynamic_sphere_at(100.0), Activation::Activate).unwrap();

        for _ in 0..60 {
            w.step(1.0 / 60.0, 1, &js).unwrap();
        }
        // After one second of free fall: v ~ -9.8 m/s, y ~ 100 - 5.
        let body = w.body(id).unwrap();
        assert!(body.position.y < 95.5, "y = {}", body.position.y);
        assert!(body.linear_velocity.y < -9.0);
    }

    #[test]
    fn test_static_body_never_moves() {
        let mut w = world();
        let js = jobs();
        let floor = w.add_body(&static_floor(), Activation::Activate).unwrap();
        let _ball = w.add_body(&dynamic_sphere_at(2.0), Activation::Activate).unwrap();

        for _ in 0..120 {
            w.step(1.0 / 60.0, 1, &js).unwrap();
        }
        let body = w.body(floor).unwrap();
        assert_eq!(body.position, RVec3::ZERO);
        assert_eq!(body.linear_velocity, Vec3::ZERO);
    }

    #[test]
    fn test_sphere_rests_on_floor_within_slop() {
        let mut w = world();
        let js = jobs();
        w.add_body(&static_floor(), Activation::Activate).unwrap();
        let ball = w.add_body(&dynamic_sphere_at(2.0), Activation::Activate).unwrap();

        for _ in 0..300 {
            w.step(1.0 / 60.0, 1, &js).unwrap();
        }
        let body = w.body(ball).unwrap();
        let slop = w.physics_settings().penetration_slop;
        // Resting height: radius minus at most the slop.
        assert!(
            body.position.y > f64::from(0.5 - 2.0 * slop),
            "resting y = {}",
            body.position.y
        );
        assert!(body.position.y < 0.6, "resting y = {}", body.position.y);
        assert!(body.linear_velocity.length() < 0.1);
    }

    #[test]
    fn test_stale_handle_after_removal() {
        let mut w = world();
        let id = w.add_body(&dynamic_sphere_at(0.0), Activation::Activate).unwrap();
        w.remove_body(id).unwrap();
        assert!(matches!(w.body(id), Err(PhysicsError::InvalidBody { .. })));

        // Recycling the slot must not resurrect the old handle.
        let id2 = w.add_body(&dynamic_sphere_at(5.0), Activation::Activate).unwrap();
        assert_eq!(id2.index(), id.index());
        assert!(w.body(id).is_err());
        assert!(w.body(id2).is_ok());
        assert!(matches!(w.remove_body(id), Err(PhysicsError::InvalidBody { .. })));
    }

    #[test]
    fn test_remove_body_with_constraint_fails_loudly() {
        let mut w = world();
        let a = w.add_body(&dynamic_sphere_at(0.0), Activation::Activate).unwrap();
        let b = w.add_body(&dynamic_sphere_at(2.0), Activation::Activate).unwrap();
        let c = w
            .create_point_constraint(
                a,
                b,
                &PointConstraintSettings { point: RVec3::new(0.0, 1.0, 0.0) },
            )
            .unwrap();

        assert!(matches!(w.remove_body(a), Err(PhysicsError::BodyInConstraint { .. })));

        w.remove_constraint(c).unwrap();
        assert!(w.remove_body(a).is_ok());
    }

    #[test]
    fn test_island_sleeps_and_wakes_on_impulse() {
        let mut w = world();
        let js = jobs();
        w.add_body(&static_floor(), Activation::Activate).unwrap();
        // A two-box stack: the boxes stay in contact, forming one island.
        let cube = |y: f64| {
            BodyCreationSettings::new(
                Shape::cuboid(Vec3::splat(0.5)),
                RVec3::new(0.0, y, 0.0),
                MotionType::Dynamic,
            )
        };
        let a = w.add_body(&cube(0.5), Activation::Activate).unwrap();
        let b = w.add_body(&cube(1.52), Activation::Activate).unwrap();

        // Let everything settle and fall asleep.
        for _ in 0..400 {
            w.step(1.0 / 60.0, 1, &js).unwrap();
        }
        assert!(!w.is_active(a).unwrap(), "bottom box should be asleep");
        assert!(!w.is_active(b).unwrap(), "top box should be asleep");

        // An impulse on one body wakes the whole island next step.
        w.add_impulse(a, Vec3::new(0.0, 50.0, 0.0)).unwrap();
        w.step(1.0 / 60.0, 1, &js).unwrap();
        assert!(w.is_active(a).unwrap());
        assert!(w.is_active(b).unwrap(), "island neighbor should wake too");
    }

    #[test]
    fn test_kinematic_moves_only_by_kinematic_calls() {
        let mut w = world();
        let js = jobs();
        let settings = BodyCreationSettings::new(
            Shape::cuboid(Vec3::splat(0.5)),
            RVec3::new(0.0, 5.0, 0.0),
            MotionType::Kinematic,
        );
        let id = w.add_body(&settings, Activation::Activate).unwrap();

        // Gravity must not move it.
        for _ in 0..60 {
            w.step(1.0 / 60.0, 1, &js).unwrap();
        }
        assert_eq!(w.body(id).unwrap().position, RVec3::new(0.0, 5.0, 0.0));

        // An explicit kinematic move does.
        w.move_kinematic(id, RVec3::new(1.0, 5.0, 0.0), Quat::IDENTITY, 1.0 / 60.0).unwrap();
        w.step(1.0 / 60.0, 1, &js).unwrap();
        let x = w.body(id).unwrap().position.x;
        assert!((x - 1.0).abs() < 1e-3, "x = {x}");
    }

    #[test]
    fn test_step_result_saturation_flags() {
        // A world that can only track one pair: three touching spheres must
        // overflow it.
        let settings = SimulationSettings {
            max_bodies: 16,
            max_body_pairs: 1,
            max_contact_constraints: 1,
        };
        let mut w = PhysicsSystem::new(
            settings,
            SolverSettings::default(),
            ObjectLayerPairTable::default(),
        )
        .unwrap();
        let js = jobs();

        for i in 0..3 {
            let mut s = dynamic_sphere_at(0.5);
            s.position.x = f64::from(i) * 0.9;
            w.add_body(&s, Activation::Activate).unwrap();
        }
        let result = w.step(1.0 / 60.0, 1, &js).unwrap();
        assert!(!result.is_ok());
        assert!(result.body_pair_cache_full || result.manifold_cache_full);
    }

    #[test]
    fn test_deterministic_two_runs_bit_identical() {
        fn run() -> Vec<(RVec3, Quat, Vec3)> {
            let mut settings = SolverSettings::default();
            settings.deterministic_simulation = true;
            let mut w = PhysicsSystem::new(
                SimulationSettings::default(),
                settings,
                ObjectLayerPairTable::default(),
            )
            .unwrap();
            let js = JobSystem::new(crate::scheduler::JobSystemConfig {
                num_threads: 2,
                ..Default::default()
            })
            .unwrap();

            w.add_body(&static_floor(), Activation::Activate).unwrap();
            for i in 0..8 {
                let mut s = dynamic_sphere_at(1.0 + f64::from(i) * 1.1);
                s.position.x = f64::from(i % 3) * 0.4;
                w.add_body(&s, Activation::Activate).unwrap();
            }
            for _ in 0..90 {
                w.step(1.0 / 60.0, 1, &js).unwrap();
            }
            w.bodies
                .iter()
                .map(|(_, b)| (b.position, b.rotation, b.linear_velocity))
                .collect()
        }

        let a = run();
        let b = run();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.0, y.0, "positions diverged");
            assert_eq!(x.1, y.1, "rotations diverged");
            assert_eq!(x.2, y.2, "velocities diverged");
        }
    }

    #[test]
    fn test_vehicle_roundtrip() {
        let mut w = world();
        let chassis = w
            .add_body(
                &BodyCreationSettings::new(
                    Shape::cuboid(Vec3::new(0.9, 0.4, 2.0)),
                    RVec3::new(0.0, 1.0, 0.0),
                    MotionType::Dynamic,
                ),
                Activation::Activate,
            )
            .unwrap();
        let vid = w
            .add_vehicle(
                chassis,
                VehicleConstraintSettings {
                    wheels: crate::vehicle::four_wheel_car(0.8, 1.4, -1.4, -0.4),
                    ..Default::default()
                },
            )
            .unwrap();

        w.vehicle_mut(vid).unwrap().set_driver_input(1.0, 0.0, 0.0, 0.0);
        assert_eq!(w.vehicle(vid).unwrap().wheels.len(), 4);

        // Chassis removal is refused while the vehicle exists.
        assert!(w.remove_body(chassis).is_err());
        w.remove_vehicle(vid).unwrap();
        assert!(w.remove_body(chassis).is_ok());
    }
}

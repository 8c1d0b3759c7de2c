//! Kinematic Character Controller
//!
//! A "virtual" character: it does not live in an island and is never solved
//! by the constraint solver. Each update sweeps the character shape through
//! the world with the shared narrowphase (collide-and-slide with a bounded
//! iteration count), classifies the ground, and optionally pushes dynamic
//! bodies it lands on, limited by its configured strength.
//!
//! Stair walking and floor sticking are explicit secondary passes, mirroring
//! how gameplay code wants to gate them: `walk_stairs` probes
//! up-forward-down around a blocking step, `stick_to_floor` performs one
//! extra downward probe when the character would otherwise float off a ledge.
//!
//! The controller may be backed by an inner kinematic body so dynamic bodies
//! collide with something real; the inner body is driven to the controller
//! pose every update.

use crate::body::BodyId;
use crate::filter::QueryFilter;
use crate::math::{Quat, RVec3, Vec3};
use crate::shape::ShapeRef;
use crate::world::PhysicsSystem;

/// Ground classification after an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroundState {
    /// Standing on a walkable surface
    OnGround,
    /// Touching ground steeper than the max slope angle
    OnSteepGround,
    /// Touching something that cannot carry the character
    NotSupported,
    /// No ground contact at all
    InAir,
}

/// Static configuration of a character.
#[derive(Clone, Debug)]
pub struct CharacterVirtualSettings {
    /// World up direction
    pub up: Vec3,
    /// Collision shape (usually a capsule)
    pub shape: ShapeRef,
    /// Steepest walkable slope (rad)
    pub max_slope_angle: f32,
    /// Maximum force used to push dynamic bodies (N)
    pub max_strength: f32,
    /// Character mass for push interactions (kg)
    pub mass: f32,
    /// Gap kept between the shape and geometry (m)
    pub character_padding: f32,
    /// Collide-and-slide iteration bound
    pub max_collision_iterations: usize,
    /// Supporting volume plane (local space): contacts at or below it can
    /// carry the character
    pub supporting_volume: (Vec3, f32),
}

impl Default for CharacterVirtualSettings {
    fn default() -> Self {
        Self {
            up: Vec3::Y,
            shape: crate::shape::Shape::capsule(0.6, 0.3),
            max_slope_angle: 50.0_f32.to_radians(),
            max_strength: 100.0,
            mass: 70.0,
            character_padding: 0.02,
            max_collision_iterations: 5,
            supporting_volume: (Vec3::Y, -0.5),
        }
    }
}

/// One contact recorded during the last update.
#[derive(Clone, Copy, Debug)]
pub struct CharacterContact {
    /// Body touched
    pub body: BodyId,
    /// World contact position
    pub position: RVec3,
    /// Contact normal, pointing toward the character
    pub normal: Vec3,
    /// Velocity of the touched body at the contact point
    pub body_velocity: Vec3,
    /// Separation at contact time (<= padding)
    pub distance: f32,
    /// Fraction of the sweep where the contact occurred
    pub fraction: f32,
}

/// The kinematic character.
pub struct CharacterVirtual {
    /// Static configuration
    pub settings: CharacterVirtualSettings,
    /// Current position (bottom-center convention is the caller's choice;
    /// this is the shape origin)
    pub position: RVec3,
    /// Current facing
    pub rotation: Quat,
    /// Desired/current velocity, set by the caller before `update`
    pub linear_velocity: Vec3,
    /// Ground classification from the last update
    ground_state: GroundState,
    /// Body carrying the character, if any
    ground_body: BodyId,
    /// Ground surface normal
    ground_normal: Vec3,
    /// Ground contact position
    ground_position: RVec3,
    /// Ground velocity at the contact (moving platforms)
    ground_velocity: Vec3,
    /// Contacts from the last update
    contacts: Vec<CharacterContact>,
    /// Optional kinematic body mirroring the controller
    inner_body: Option<BodyId>,
}

impl CharacterVirtual {
    /// Create a character at a pose.
    #[must_use]
    pub fn new(settings: CharacterVirtualSettings, position: RVec3, rotation: Quat) -> Self {
        Self {
            settings,
            position,
            rotation,
            linear_velocity: Vec3::ZERO,
            ground_state: GroundState::InAir,
            ground_body: BodyId::INVALID,
            ground_normal: Vec3::Y,
            ground_position: RVec3::ZERO,
            ground_velocity: Vec3::ZERO,
            contacts: Vec::new(),
            inner_body: None,
        }
    }

    /// Attach an inner kinematic body that will be driven to the controller
    /// pose every update.
    pub fn set_inner_body(&mut self, body: BodyId) {
        self.inner_body = Some(body);
    }

    /// Inner body, if attached.
    #[must_use]
    pub fn inner_body(&self) -> Option<BodyId> {
        self.inner_body
    }

    /// Ground classification from the last update.
    #[inline]
    #[must_use]
    pub fn ground_state(&self) -> GroundState {
        self.ground_state
    }

    /// True when the ground can carry the character (not steep, not in air).
    #[must_use]
    pub fn is_supported(&self) -> bool {
        matches!(self.ground_state, GroundState::OnGround | GroundState::OnSteepGround)
    }

    /// Body the character stands on.
    #[must_use]
    pub fn ground_body(&self) -> BodyId {
        self.ground_body
    }

    /// Ground normal from the last update.
    #[must_use]
    pub fn ground_normal(&self) -> Vec3 {
        self.ground_normal
    }

    /// Ground contact position from the last update.
    #[must_use]
    pub fn ground_position(&self) -> RVec3 {
        self.ground_position
    }

    /// Ground velocity (for moving platforms).
    #[must_use]
    pub fn ground_velocity(&self) -> Vec3 {
        self.ground_velocity
    }

    /// Contacts recorded during the last update.
    #[must_use]
    pub fn active_contacts(&self) -> &[CharacterContact] {
        &self.contacts
    }

    /// Advance the character one step: integrate gravity, collide-and-slide,
    /// classify ground, push touched dynamic bodies, drive the inner body.
    pub fn update(
        &mut self,
        dt: f32,
        gravity: Vec3,
        filter: &QueryFilter,
        system: &mut PhysicsSystem,
    ) {
        if dt <= 0.0 {
            return;
        }
        self.contacts.clear();

        // Gravity only pulls when the ground is not carrying us.
        if self.ground_state != GroundState::OnGround {
            self.linear_velocity += gravity * dt;
        } else {
            // Cancel motion into the walkable ground, keep it tangent.
            let into = self.linear_velocity.dot(self.ground_normal).min(0.0);
            self.linear_velocity -= self.ground_normal * into;
        }

        let mut remaining = self.linear_velocity * dt;
        let exclude = self.exclusions();

        for _ in 0..self.settings.max_collision_iterations {
            if remaining.length_squared() < 1.0e-10 {
                break;
            }
            match system.cast_shape(
                &self.settings.shape,
                self.rotation,
                self.position,
                remaining,
                filter,
                &exclude,
            ) {
                None => {
                    self.position += remaining.as_dvec3();
                    break;
                }
                Some(hit) => {
                    // Stop a padding short of the surface.
                    let travel = remaining.length() * hit.fraction;
                    let back_off = (self.settings.character_padding / travel.max(1.0e-6)).min(1.0);
                    let fraction = hit.fraction * (1.0 - back_off);
                    self.position += (remaining * fraction).as_dvec3();

                    self.record_contact(&hit, system);
                    self.push_body(&hit, system, dt);

                    // Slide the rest along the contact plane.
                    let left = remaining * (1.0 - fraction);
                    remaining = left - hit.normal * left.dot(hit.normal);
                    // Strip the velocity component pressing into the surface
                    // so the next step does not re-collide immediately.
                    let into = self.linear_velocity.dot(hit.normal).max(0.0);
                    self.linear_velocity -= hit.normal * into;
                }
            }
        }

        self.refresh_ground_state(filter, system);
        self.drive_inner_body(dt, system);
    }

    /// Whether a forward probe suggests a climbable step is blocking us.
    #[must_use]
    pub fn can_walk_stairs(&self, desired_velocity: Vec3) -> bool {
        let up = self.settings.up;
        let horizontal = desired_velocity - up * desired_velocity.dot(up);
        if horizontal.length_squared() < 1.0e-8 {
            return false;
        }
        let dir = horizontal.normalize();
        let cos_max = self.settings.max_slope_angle.cos();
        self.contacts.iter().any(|c| {
            // A contact facing against our motion that is too steep to walk.
            c.normal.dot(dir) < -1.0e-2 && c.normal.dot(up) < cos_max
        })
    }

    /// Try to step over an obstacle: up, forward, then back down. Returns
    /// true (and moves the character) when a walkable landing was found.
    #[allow(clippy::too_many_arguments)]
    pub fn walk_stairs(
        &mut self,
        dt: f32,
        step_up: Vec3,
        step_forward: Vec3,
        step_forward_test: Vec3,
        step_down_extra: Vec3,
        filter: &QueryFilter,
        system: &mut PhysicsSystem,
    ) -> bool {
        let _ = dt;
        let exclude = self.exclusions();
        let start = self.position;

        // Up: must clear the full step height.
        let up_hit = system.cast_shape(
            &self.settings.shape,
            self.rotation,
            self.position,
            step_up,
            filter,
            &exclude,
        );
        let up_travel = match up_hit {
            Some(hit) if hit.fraction < 0.1 => return false,
            Some(hit) => step_up * (hit.fraction * 0.95),
            None => step_up,
        };
        let top = start + up_travel.as_dvec3();

        // Forward: use the longer test distance to validate, move the shorter.
        let probe = if step_forward_test.length_squared() > step_forward.length_squared() {
            step_forward_test
        } else {
            step_forward
        };
        let forward_hit =
            system.cast_shape(&self.settings.shape, self.rotation, top, probe, filter, &exclude);
        if let Some(hit) = &forward_hit {
            if hit.fraction * probe.length() < step_forward.length() * 0.5 {
                return false; // still blocked after stepping up
            }
        }
        let forward_travel = match &forward_hit {
            Some(hit) => step_forward * (hit.fraction * 0.95).min(1.0),
            None => step_forward,
        };
        let ahead = top + forward_travel.as_dvec3();

        // Down: must land on a walkable slope within the step height.
        let down = -(up_travel) + step_down_extra;
        let down_hit =
            system.cast_shape(&self.settings.shape, self.rotation, ahead, down, filter, &exclude);
        let Some(hit) = down_hit else { return false };
        let cos_max = self.settings.max_slope_angle.cos();
        if hit.normal.dot(self.settings.up) < cos_max {
            return false;
        }

        let landing = ahead + (down * (hit.fraction * 0.95)).as_dvec3();
        self.position = landing;
        self.record_contact(&hit, system);
        self.refresh_ground_state(filter, system);
        true
    }

    /// One extra downward probe that keeps the character glued to the floor
    /// when walking off small ledges. Returns true when the character was
    /// moved down onto ground.
    pub fn stick_to_floor(
        &mut self,
        step_down: Vec3,
        filter: &QueryFilter,
        system: &mut PhysicsSystem,
    ) -> bool {
        if self.ground_state == GroundState::OnGround {
            return false;
        }
        let exclude = self.exclusions();
        let Some(hit) = system.cast_shape(
            &self.settings.shape,
            self.rotation,
            self.position,
            step_down,
            filter,
            &exclude,
        ) else {
            return false;
        };

        self.position += (step_down * (hit.fraction * 0.95)).as_dvec3();
        self.record_contact(&hit, system);
        self.refresh_ground_state(filter, system);
        true
    }

    // =========== Internal methods ===========

    fn exclusions(&self) -> Vec<BodyId> {
        self.inner_body.into_iter().collect()
    }

    fn record_contact(&mut self, hit: &crate::query::ShapeCastHit, system: &PhysicsSystem) {
        let body_velocity = system
            .body_point_velocity(hit.body, hit.point)
            .unwrap_or(Vec3::ZERO);
        self.contacts.push(CharacterContact {
            body: hit.body,
            position: hit.point,
            // Narrowphase normals point from the cast shape toward the body;
            // character contacts face the character.
            normal: -hit.normal,
            body_velocity,
            distance: 0.0,
            fraction: hit.fraction,
        });
    }

    fn push_body(&self, hit: &crate::query::ShapeCastHit, system: &mut PhysicsSystem, dt: f32) {
        let Ok(body) = system.body(hit.body) else { return };
        if !body.is_dynamic() {
            return;
        }
        // Impulse along the motion-blocking normal, capped by max strength.
        let approach = self.linear_velocity.dot(hit.normal).max(0.0);
        let magnitude = (self.settings.mass * approach).min(self.settings.max_strength * dt);
        if magnitude <= 0.0 {
            return;
        }
        let impulse = hit.normal * magnitude;
        let _ = system.add_impulse_at(hit.body, impulse, hit.point);
    }

    fn refresh_ground_state(&mut self, filter: &QueryFilter, system: &PhysicsSystem) {
        let probe_len = self.settings.character_padding * 2.0 + 0.05;
        let down = -self.settings.up * probe_len;
        let exclude = self.exclusions();

        let Some(hit) = system.cast_shape(
            &self.settings.shape,
            self.rotation,
            self.position,
            down,
            filter,
            &exclude,
        ) else {
            self.ground_state = GroundState::InAir;
            self.ground_body = BodyId::INVALID;
            return;
        };

        let surface_normal = -hit.normal; // toward the character
        self.ground_body = hit.body;
        self.ground_normal = surface_normal;
        self.ground_position = hit.point;
        self.ground_velocity =
            system.body_point_velocity(hit.body, hit.point).unwrap_or(Vec3::ZERO);

        // Only contacts inside the supporting volume can carry the character.
        let (plane_n, plane_c) = self.settings.supporting_volume;
        let local = (hit.point - self.position).as_vec3();
        let local = self.rotation.inverse() * local;
        if local.dot(plane_n) + plane_c > 0.0 {
            self.ground_state = GroundState::NotSupported;
            return;
        }

        let cos_max = self.settings.max_slope_angle.cos();
        self.ground_state = if surface_normal.dot(self.settings.up) >= cos_max {
            GroundState::OnGround
        } else {
            GroundState::OnSteepGround
        };
    }

    fn drive_inner_body(&self, dt: f32, system: &mut PhysicsSystem) {
        if let Some(id) = self.inner_body {
            let _ = system.move_kinematic(id, self.position, self.rotation, dt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ground_state_queries_default() {
        let c = CharacterVirtual::new(
            CharacterVirtualSettings::default(),
            RVec3::new(0.0, 2.0, 0.0),
            Quat::IDENTITY,
        );
        assert_eq!(c.ground_state(), GroundState::InAir);
        assert!(!c.is_supported());
        assert!(c.active_contacts().is_empty());
        assert_eq!(c.ground_body(), BodyId::INVALID);
    }

    #[test]
    fn test_can_walk_stairs_requires_horizontal_motion() {
        let c = CharacterVirtual::new(
            CharacterVirtualSettings::default(),
            RVec3::ZERO,
            Quat::IDENTITY,
        );
        assert!(!c.can_walk_stairs(Vec3::ZERO));
        assert!(!c.can_walk_stairs(Vec3::new(0.0, -1.0, 0.0)));
    }

    #[test]
    fn test_can_walk_stairs_detects_blocking_wall() {
        let mut c = CharacterVirtual::new(
            CharacterVirtualSettings::default(),
            RVec3::ZERO,
            Quat::IDENTITY,
        );
        // A vertical wall dead ahead (+Z motion, normal facing back at us).
        c.contacts.push(CharacterContact {
            body: BodyId::INVALID,
            position: RVec3::new(0.0, 0.0, 0.5),
            normal: Vec3::new(0.0, 0.0, -1.0),
            body_velocity: Vec3::ZERO,
            distance: 0.0,
            fraction: 0.5,
        });
        assert!(c.can_walk_stairs(Vec3::new(0.0, 0.0, 2.0)));
        // Walkable ground contact is not a stair candidate.
        c.contacts[0].normal = Vec3::Y;
        assert!(!c.can_walk_stairs(Vec3::new(0.0, 0.0, 2.0)));
    }
}

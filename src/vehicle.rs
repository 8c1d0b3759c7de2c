//! Wheeled Vehicle Controller
//!
//! One [`VehicleConstraint`] couples a chassis body to N wheels. Each step the
//! constraint casts along every wheel's suspension axis to find ground
//! contact, then — inside the regular velocity-iteration pass, alongside
//! ordinary contacts — applies suspension spring/damper impulses plus
//! longitudinal (drive/brake) and lateral (steering) tire impulses, bounded
//! by a friction circle per wheel. Vehicle and environment contacts therefore
//! resolve consistently within one island.

use crate::body::BodyId;
use crate::math::{Quat, RVec3, Vec3};
use crate::solver::{BodyRef, SolverBody};

/// Static description of one wheel.
#[derive(Clone, Copy, Debug)]
pub struct WheelSettings {
    /// Suspension attachment point, chassis-local
    pub position: Vec3,
    /// Suspension travel direction, chassis-local (usually -Y)
    pub suspension_direction: Vec3,
    /// Steering rotation axis, chassis-local (usually +Y)
    pub steering_axis: Vec3,
    /// Wheel forward at zero steer, chassis-local
    pub wheel_forward: Vec3,
    /// Shortest suspension length (m)
    pub suspension_min_length: f32,
    /// Longest suspension length (m)
    pub suspension_max_length: f32,
    /// Suspension spring frequency (Hz)
    pub suspension_frequency: f32,
    /// Suspension damping ratio
    pub suspension_damping: f32,
    /// Wheel radius (m)
    pub radius: f32,
    /// Wheel width (m)
    pub width: f32,
    /// Wheel spin inertia (kg m^2)
    pub inertia: f32,
    /// Passive spin damping per second
    pub angular_damping: f32,
    /// Maximum steering angle (rad); 0 for non-steered wheels
    pub max_steer_angle: f32,
    /// Brake torque at full brake input (N m)
    pub max_brake_torque: f32,
    /// Handbrake torque at full input (N m)
    pub max_hand_brake_torque: f32,
    /// Whether engine torque reaches this wheel
    pub driven: bool,
    /// Tire friction along the rolling direction
    pub longitudinal_friction: f32,
    /// Tire friction across the rolling direction
    pub lateral_friction: f32,
}

impl Default for WheelSettings {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            suspension_direction: Vec3::NEG_Y,
            steering_axis: Vec3::Y,
            wheel_forward: Vec3::Z,
            suspension_min_length: 0.1,
            suspension_max_length: 0.5,
            suspension_frequency: 1.5,
            suspension_damping: 0.5,
            radius: 0.3,
            width: 0.1,
            inertia: 0.9,
            angular_damping: 0.2,
            max_steer_angle: 0.0,
            max_brake_torque: 1500.0,
            max_hand_brake_torque: 0.0,
            driven: false,
            longitudinal_friction: 1.2,
            lateral_friction: 1.4,
        }
    }
}

/// Engine/transmission tuning.
#[derive(Clone, Copy, Debug)]
pub struct WheeledControllerSettings {
    /// Peak engine torque (N m)
    pub max_engine_torque: f32,
    /// Combined gear + final-drive ratio
    pub gear_ratio: f32,
}

impl Default for WheeledControllerSettings {
    fn default() -> Self {
        Self { max_engine_torque: 500.0, gear_ratio: 3.0 }
    }
}

/// Driver input state.
#[derive(Clone, Copy, Debug, Default)]
pub struct WheeledVehicleController {
    /// Throttle, -1..1 (negative = reverse)
    pub forward_input: f32,
    /// Steering, -1..1
    pub right_input: f32,
    /// Brake, 0..1
    pub brake_input: f32,
    /// Handbrake, 0..1
    pub hand_brake_input: f32,
    /// Engine tuning
    pub settings: WheeledControllerSettings,
}

/// Everything needed to create a vehicle.
#[derive(Clone, Debug)]
pub struct VehicleConstraintSettings {
    /// Chassis-local up
    pub up: Vec3,
    /// Chassis-local forward
    pub forward: Vec3,
    /// Wheels, in a stable user-chosen order
    pub wheels: Vec<WheelSettings>,
    /// Engine tuning
    pub controller: WheeledControllerSettings,
}

impl Default for VehicleConstraintSettings {
    fn default() -> Self {
        Self {
            up: Vec3::Y,
            forward: Vec3::Z,
            wheels: Vec::new(),
            controller: WheeledControllerSettings::default(),
        }
    }
}

/// Runtime state of one wheel.
#[derive(Clone, Copy, Debug)]
pub struct Wheel {
    /// Static settings
    pub settings: WheelSettings,
    /// Accumulated spin angle (rad)
    pub rotation_angle: f32,
    /// Spin speed (rad/s)
    pub angular_velocity: f32,
    /// Current steering angle (rad)
    pub steer_angle: f32,
    /// Current suspension length (m)
    pub suspension_length: f32,
    /// Body the wheel rests on this step
    pub contact_body: BodyId,
    /// Ground contact point (world)
    pub contact_point: RVec3,
    /// Ground normal at the contact (world)
    pub contact_normal: Vec3,
    /// Whether the wheel touches anything this step
    pub has_contact: bool,
}

impl Wheel {
    fn new(settings: WheelSettings) -> Self {
        Self {
            settings,
            rotation_angle: 0.0,
            angular_velocity: 0.0,
            steer_angle: 0.0,
            suspension_length: settings.suspension_max_length,
            contact_body: BodyId::INVALID,
            contact_point: RVec3::ZERO,
            contact_normal: Vec3::Y,
            has_contact: false,
        }
    }
}

/// A wheel-suspension ground hit reported by the world's cast.
#[derive(Clone, Copy, Debug)]
pub struct WheelContact {
    /// Body the suspension ray hit
    pub body: BodyId,
    /// Fraction along the cast
    pub fraction: f32,
    /// World contact point
    pub point: RVec3,
    /// World contact normal
    pub normal: Vec3,
}

/// The vehicle: one constraint instance attached to a chassis body.
#[derive(Clone, Debug)]
pub struct VehicleConstraint {
    /// Chassis body
    pub body: BodyId,
    /// Chassis-local up
    pub up: Vec3,
    /// Chassis-local forward
    pub forward: Vec3,
    /// Wheels with runtime state
    pub wheels: Vec<Wheel>,
    /// Driver input
    pub controller: WheeledVehicleController,
}

impl VehicleConstraint {
    /// Create a vehicle from settings.
    #[must_use]
    pub fn new(body: BodyId, settings: VehicleConstraintSettings) -> Self {
        Self {
            body,
            up: settings.up,
            forward: settings.forward,
            wheels: settings.wheels.into_iter().map(Wheel::new).collect(),
            controller: WheeledVehicleController {
                settings: settings.controller,
                ..Default::default()
            },
        }
    }

    /// Set all driver inputs at once.
    pub fn set_driver_input(&mut self, forward: f32, right: f32, brake: f32, hand_brake: f32) {
        self.controller.forward_input = forward.clamp(-1.0, 1.0);
        self.controller.right_input = right.clamp(-1.0, 1.0);
        self.controller.brake_input = brake.clamp(0.0, 1.0);
        self.controller.hand_brake_input = hand_brake.clamp(0.0, 1.0);
    }

    /// Number of wheels currently touching ground.
    #[must_use]
    pub fn wheels_in_contact(&self) -> usize {
        self.wheels.iter().filter(|w| w.has_contact).count()
    }

    /// World transform of a wheel (for rendering/audio callers).
    #[must_use]
    pub fn wheel_world_position(&self, index: usize, chassis_pos: RVec3, chassis_rot: Quat) -> RVec3 {
        let w = &self.wheels[index];
        let local =
            w.settings.position + w.settings.suspension_direction * w.suspension_length;
        chassis_pos + (chassis_rot * local).as_dvec3()
    }

    /// Update per-wheel ground contacts. `cast` sweeps a point from the
    /// world-space attachment along a displacement, skipping the chassis
    /// itself, and returns the closest hit.
    pub(crate) fn update_wheel_contacts<F>(
        &mut self,
        chassis_pos: RVec3,
        chassis_rot: Quat,
        mut cast: F,
    ) where
        F: FnMut(RVec3, Vec3) -> Option<WheelContact>,
    {
        let steer_input = self.controller.right_input;
        for wheel in &mut self.wheels {
            let s = wheel.settings;
            wheel.steer_angle = -steer_input * s.max_steer_angle;

            let start = chassis_pos + (chassis_rot * s.position).as_dvec3();
            let dir = chassis_rot * s.suspension_direction;
            let sweep = dir * (s.suspension_max_length + s.radius);

            match cast(start, sweep) {
                Some(hit) => {
                    let hit_dist =
                        hit.fraction * (s.suspension_max_length + s.radius) - s.radius;
                    wheel.suspension_length =
                        hit_dist.clamp(s.suspension_min_length, s.suspension_max_length);
                    wheel.has_contact = true;
                    wheel.contact_body = hit.body;
                    wheel.contact_point = hit.point;
                    wheel.contact_normal = hit.normal;
                }
                None => {
                    wheel.suspension_length = s.suspension_max_length;
                    wheel.has_contact = false;
                    wheel.contact_body = BodyId::INVALID;
                }
            }
        }
    }

    /// Advance wheel spin after the solve. Grounded wheels roll with the
    /// chassis; airborne wheels integrate drive/brake torque on their own
    /// inertia.
    pub(crate) fn post_step(&mut self, chassis_velocity: Vec3, chassis_rot: Quat, dt: f32) {
        let c = self.controller;
        let driven = self.wheels.iter().filter(|w| w.settings.driven).count().max(1) as f32;

        for wheel in &mut self.wheels {
            let s = wheel.settings;
            if wheel.has_contact {
                let forward = chassis_rot * steered_forward(&s, wheel.steer_angle);
                let ground_speed = chassis_velocity.dot(forward);
                wheel.angular_velocity = ground_speed / s.radius;
            } else {
                let mut torque = 0.0;
                if s.driven {
                    torque +=
                        c.forward_input * c.settings.max_engine_torque * c.settings.gear_ratio
                            / driven;
                }
                torque -= wheel.angular_velocity.signum()
                    * (c.brake_input * s.max_brake_torque
                        + c.hand_brake_input * s.max_hand_brake_torque);
                wheel.angular_velocity += torque / s.inertia * dt;
                wheel.angular_velocity *= 1.0 - (s.angular_damping * dt).min(1.0);
            }
            wheel.rotation_angle += wheel.angular_velocity * dt;
        }
    }
}

fn steered_forward(settings: &WheelSettings, steer_angle: f32) -> Vec3 {
    Quat::from_axis_angle(settings.steering_axis, steer_angle) * settings.wheel_forward
}

// ============================================================================
// Solver coupling
// ============================================================================

/// Per-wheel data prepared for the velocity pass.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WheelRun {
    /// Contact offset from the chassis center of mass (world orientation)
    r: Vec3,
    /// Ground normal
    normal: Vec3,
    /// Rolling direction on the ground plane
    longitudinal: Vec3,
    /// Side direction on the ground plane
    lateral: Vec3,
    /// Suspension spring impulse for this step (before clamping)
    spring_impulse: f32,
    /// Damper coefficient impulse factor
    damper_impulse_per_velocity: f32,
    /// Drive impulse along `longitudinal` for this step
    drive_impulse: f32,
    /// Brake impulse magnitude available this step
    brake_impulse: f32,
    /// Friction coefficients
    longitudinal_friction: f32,
    lateral_friction: f32,
    /// Effective masses
    normal_mass: f32,
    longitudinal_mass: f32,
    lateral_mass: f32,
    /// Accumulated impulses
    lambda_suspension: f32,
    lambda_long: f32,
    lambda_lat: f32,
}

/// A vehicle scheduled into an island's velocity pass.
#[derive(Clone, Debug)]
pub(crate) struct VehicleRun {
    pub chassis: BodyRef,
    pub vehicle_index: u32,
    wheels: Vec<WheelRun>,
}

impl VehicleRun {
    /// Prepare impulse-level data from the wheel contacts.
    pub(crate) fn prepare(
        vehicle: &VehicleConstraint,
        chassis: BodyRef,
        chassis_body: &SolverBody,
        vehicle_index: u32,
        dt: f32,
    ) -> Self {
        let c = vehicle.controller;
        let driven = vehicle.wheels.iter().filter(|w| w.settings.driven).count().max(1) as f32;
        let mut wheels = Vec::with_capacity(vehicle.wheels.len());

        for wheel in &vehicle.wheels {
            if !wheel.has_contact {
                continue;
            }
            let s = wheel.settings;
            let normal = wheel.contact_normal;
            let r = (wheel.contact_point - chassis_body.position).as_vec3();

            // Tire frame on the ground plane.
            let forward = chassis_body.rotation * steered_forward(&s, wheel.steer_angle);
            let longitudinal = (forward - normal * forward.dot(normal)).normalize_or_zero();
            let longitudinal = if longitudinal.length_squared() < 1.0e-6 {
                crate::math::tangent_frame(normal).0
            } else {
                longitudinal
            };
            let lateral = normal.cross(longitudinal);

            let normal_mass = wheel_effective_mass(chassis_body, r, normal);
            let longitudinal_mass = wheel_effective_mass(chassis_body, r, longitudinal);
            let lateral_mass = wheel_effective_mass(chassis_body, r, lateral);

            // Spring from compression, as an impulse over this step.
            let m = if normal_mass > 0.0 { 1.0 / normal_mass } else { 0.0 };
            let omega = 2.0 * core::f32::consts::PI * s.suspension_frequency;
            let stiffness = m * omega * omega;
            let damping = 2.0 * m * s.suspension_damping * omega;
            let compression = s.suspension_max_length - wheel.suspension_length;
            let spring_impulse = stiffness * compression * dt;
            let damper_impulse_per_velocity = damping * dt;

            // Engine torque at the contact patch.
            let mut drive_impulse = 0.0;
            if s.driven {
                let torque =
                    c.forward_input * c.settings.max_engine_torque * c.settings.gear_ratio / driven;
                drive_impulse = torque / s.radius * dt;
            }
            let brake_impulse = (c.brake_input * s.max_brake_torque
                + c.hand_brake_input * s.max_hand_brake_torque)
                / s.radius
                * dt;

            wheels.push(WheelRun {
                r,
                normal,
                longitudinal,
                lateral,
                spring_impulse,
                damper_impulse_per_velocity,
                drive_impulse,
                brake_impulse,
                longitudinal_friction: s.longitudinal_friction,
                lateral_friction: s.lateral_friction,
                normal_mass,
                longitudinal_mass,
                lateral_mass,
                lambda_suspension: 0.0,
                lambda_long: 0.0,
                lambda_lat: 0.0,
            });
        }

        Self { chassis, vehicle_index, wheels }
    }

    /// One velocity iteration: suspension, then tire forces within the
    /// friction circle.
    pub(crate) fn solve_velocity(&mut self, bodies: &mut [SolverBody], _dt: f32) {
        let chassis = match self.chassis {
            BodyRef::Island(i) => &mut bodies[i as usize],
            // A sleeping/kinematic chassis does not respond to wheel forces.
            BodyRef::Fixed(_) => return,
        };

        for w in &mut self.wheels {
            // Suspension: spring minus damper as a total impulse for the
            // step, never pulling the chassis down.
            let v_n = chassis.velocity_at(w.r).dot(w.normal);
            let new_lambda =
                (w.spring_impulse - w.damper_impulse_per_velocity * v_n).max(0.0);
            let applied = new_lambda - w.lambda_suspension;
            w.lambda_suspension = new_lambda;
            apply_wheel_impulse(chassis, w.r, w.normal * applied);

            let max_long = w.longitudinal_friction * w.lambda_suspension;
            let max_lat = w.lateral_friction * w.lambda_suspension;

            // Longitudinal: drive plus braking toward zero patch velocity,
            // all inside the friction circle.
            let v_long = chassis.velocity_at(w.r).dot(w.longitudinal);
            let mut desired = w.drive_impulse;
            if w.brake_impulse > 0.0 {
                desired +=
                    (-v_long * w.longitudinal_mass).clamp(-w.brake_impulse, w.brake_impulse);
            }
            let new_long = desired.clamp(-max_long, max_long);
            let applied_long = new_long - w.lambda_long;
            w.lambda_long = new_long;
            apply_wheel_impulse(chassis, w.r, w.longitudinal * applied_long);

            // Lateral: kill side slip within the remaining friction budget.
            let v_lat = chassis.velocity_at(w.r).dot(w.lateral);
            let desired_lat = -v_lat * w.lateral_mass;
            let new_lat = (w.lambda_lat + desired_lat).clamp(-max_lat, max_lat);
            let applied_lat = new_lat - w.lambda_lat;
            w.lambda_lat = new_lat;
            apply_wheel_impulse(chassis, w.r, w.lateral * applied_lat);
        }
    }
}

fn wheel_effective_mass(body: &SolverBody, r: Vec3, axis: Vec3) -> f32 {
    let rx = r.cross(axis);
    let k = body.inv_mass + rx.dot(body.inv_inertia_world * rx);
    if k > 1.0e-12 {
        1.0 / k
    } else {
        0.0
    }
}

fn apply_wheel_impulse(body: &mut SolverBody, r: Vec3, impulse: Vec3) {
    body.linear_velocity += impulse * body.inv_mass;
    body.angular_velocity += body.inv_inertia_world * r.cross(impulse);
}

/// Four-wheel car preset: two steered front wheels, two driven rear wheels.
#[must_use]
pub fn four_wheel_car(half_width: f32, front_z: f32, rear_z: f32, height: f32) -> Vec<WheelSettings> {
    let front = WheelSettings {
        max_steer_angle: 0.5,
        driven: false,
        ..Default::default()
    };
    let rear = WheelSettings { driven: true, ..Default::default() };
    vec![
        WheelSettings { position: Vec3::new(-half_width, height, front_z), ..front },
        WheelSettings { position: Vec3::new(half_width, height, front_z), ..front },
        WheelSettings { position: Vec3::new(-half_width, height, rear_z), ..rear },
        WheelSettings { position: Vec3::new(half_width, height, rear_z), ..rear },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Mat3;

    fn test_vehicle() -> VehicleConstraint {
        let settings = VehicleConstraintSettings {
            wheels: four_wheel_car(0.8, 1.2, -1.2, -0.3),
            ..Default::default()
        };
        VehicleConstraint::new(BodyId::INVALID, settings)
    }

    fn chassis_body(mass: f32) -> SolverBody {
        let mut sb = SolverBody::test_dynamic(RVec3::new(0.0, 1.0, 0.0), mass);
        // Chassis-ish inertia.
        sb.inv_inertia_world = Mat3::from_diagonal(Vec3::splat(1.0 / (mass * 0.8)));
        sb
    }

    fn ground_everywhere(start: RVec3, sweep: Vec3) -> Option<WheelContact> {
        // Flat ground plane at y = 0.
        if sweep.y >= 0.0 {
            return None;
        }
        let t = (-start.y / f64::from(sweep.y)) as f32;
        (0.0..=1.0).contains(&t).then(|| WheelContact {
            body: BodyId::INVALID,
            fraction: t,
            point: start + (sweep * t).as_dvec3(),
            normal: Vec3::Y,
        })
    }

    #[test]
    fn test_driver_input_clamped() {
        let mut v = test_vehicle();
        v.set_driver_input(2.0, -3.0, 1.5, -1.0);
        assert_eq!(v.controller.forward_input, 1.0);
        assert_eq!(v.controller.right_input, -1.0);
        assert_eq!(v.controller.brake_input, 1.0);
        assert_eq!(v.controller.hand_brake_input, 0.0);
    }

    #[test]
    fn test_wheel_contacts_on_flat_ground() {
        let mut v = test_vehicle();
        v.update_wheel_contacts(RVec3::new(0.0, 0.6, 0.0), Quat::IDENTITY, ground_everywhere);
        assert_eq!(v.wheels_in_contact(), 4);
        for w in &v.wheels {
            assert!(w.suspension_length < w.settings.suspension_max_length);
        }
    }

    #[test]
    fn test_airborne_vehicle_has_no_contacts() {
        let mut v = test_vehicle();
        v.update_wheel_contacts(RVec3::new(0.0, 50.0, 0.0), Quat::IDENTITY, ground_everywhere);
        assert_eq!(v.wheels_in_contact(), 0);
    }

    #[test]
    fn test_suspension_pushes_chassis_up() {
        let mut v = test_vehicle();
        v.update_wheel_contacts(RVec3::new(0.0, 0.4, 0.0), Quat::IDENTITY, ground_everywhere);
        assert!(v.wheels_in_contact() > 0);

        let mut bodies = vec![chassis_body(1200.0)];
        let mut run = VehicleRun::prepare(&v, BodyRef::Island(0), &bodies[0], 0, 1.0 / 60.0);
        for _ in 0..4 {
            run.solve_velocity(&mut bodies, 1.0 / 60.0);
        }
        assert!(
            bodies[0].linear_velocity.y > 0.0,
            "compressed suspension should push up, v = {:?}",
            bodies[0].linear_velocity
        );
    }

    #[test]
    fn test_throttle_accelerates_forward() {
        let mut v = test_vehicle();
        v.set_driver_input(1.0, 0.0, 0.0, 0.0);
        v.update_wheel_contacts(RVec3::new(0.0, 0.55, 0.0), Quat::IDENTITY, ground_everywhere);

        let mut bodies = vec![chassis_body(1200.0)];
        let mut run = VehicleRun::prepare(&v, BodyRef::Island(0), &bodies[0], 0, 1.0 / 60.0);
        for _ in 0..8 {
            run.solve_velocity(&mut bodies, 1.0 / 60.0);
        }
        assert!(
            bodies[0].linear_velocity.z > 0.0,
            "rear-driven car should accelerate along +Z, v = {:?}",
            bodies[0].linear_velocity
        );
    }

    #[test]
    fn test_lateral_friction_resists_sliding() {
        let mut v = test_vehicle();
        v.update_wheel_contacts(RVec3::new(0.0, 0.55, 0.0), Quat::IDENTITY, ground_everywhere);

        let mut bodies = vec![chassis_body(1200.0)];
        bodies[0].linear_velocity = Vec3::new(3.0, 0.0, 0.0);
        let mut run = VehicleRun::prepare(&v, BodyRef::Island(0), &bodies[0], 0, 1.0 / 60.0);
        for _ in 0..8 {
            run.solve_velocity(&mut bodies, 1.0 / 60.0);
        }
        assert!(
            bodies[0].linear_velocity.x < 3.0,
            "side slip should be damped, v = {:?}",
            bodies[0].linear_velocity
        );
    }

    #[test]
    fn test_post_step_spins_grounded_wheels() {
        let mut v = test_vehicle();
        v.update_wheel_contacts(RVec3::new(0.0, 0.55, 0.0), Quat::IDENTITY, ground_everywhere);
        v.post_step(Vec3::new(0.0, 0.0, 6.0), Quat::IDENTITY, 1.0 / 60.0);
        for w in &v.wheels {
            // Rolling at 6 m/s with 0.3 m radius: 20 rad/s.
            assert!((w.angular_velocity - 20.0).abs() < 0.5, "w = {}", w.angular_velocity);
        }
    }
}

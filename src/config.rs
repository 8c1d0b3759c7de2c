//! Simulation Configuration
//!
//! Two layers of tuning:
//!
//! - [`SimulationSettings`]: hard world limits fixed at construction
//!   (body/pair/constraint capacities). Violations of these are reported as
//!   per-step saturation flags, never as panics.
//! - [`SolverSettings`]: runtime-tunable solver behaviour (iteration counts,
//!   tolerances, sleep thresholds, determinism trade-offs).
//!
//! All validation happens up front: an invalid value refuses to construct the
//! world instead of surfacing as NaNs ten steps later.

use crate::error::{PhysicsError, PhysicsResult};
use crate::math::Vec3;

/// Default collision tolerance used by narrowphase queries (m).
pub const DEFAULT_COLLISION_TOLERANCE: f32 = 1.0e-4;

/// Default penetration tolerance for EPA convergence (fraction).
pub const DEFAULT_PENETRATION_TOLERANCE: f32 = 1.0e-4;

/// Default convex radius rounding off sharp corners (m).
pub const DEFAULT_CONVEX_RADIUS: f32 = 0.05;

/// Hard world limits, fixed for the lifetime of a world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimulationSettings {
    /// Maximum number of live bodies.
    pub max_bodies: u32,
    /// Maximum number of overlapping body pairs tracked per step.
    pub max_body_pairs: u32,
    /// Maximum number of contact constraints prepared per step.
    pub max_contact_constraints: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            max_bodies: 65536,
            max_body_pairs: 65536,
            max_contact_constraints: 10240,
        }
    }
}

impl SimulationSettings {
    /// Validate the limits. Zero capacities make a world that can never
    /// simulate anything, which is always a caller bug.
    pub fn validate(&self) -> PhysicsResult<()> {
        if self.max_bodies == 0 {
            return Err(PhysicsError::InvalidConfiguration { reason: "max_bodies must be > 0" });
        }
        if self.max_body_pairs == 0 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "max_body_pairs must be > 0",
            });
        }
        if self.max_contact_constraints == 0 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "max_contact_constraints must be > 0",
            });
        }
        Ok(())
    }
}

/// Runtime-tunable solver behaviour.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverSettings {
    /// Velocity iterations per collision step.
    pub num_velocity_steps: u32,
    /// Position iterations per collision step.
    pub num_position_steps: u32,
    /// Baumgarte stabilization factor (fraction of penetration corrected per
    /// position iteration).
    pub baumgarte: f32,
    /// Distance below which bodies are allowed to interpenetrate at rest (m).
    pub penetration_slop: f32,
    /// Radius around shapes within which speculative contacts are created (m).
    pub speculative_contact_distance: f32,
    /// Squared distance under which a new contact point is matched to a cached
    /// one for warm starting (m^2).
    pub manifold_tolerance_sq: f32,
    /// Closing speed below which restitution is not applied (m/s).
    pub min_velocity_for_restitution: f32,
    /// Time a whole island must stay below the sleep thresholds before it is
    /// put to sleep (s).
    pub time_before_sleep: f32,
    /// Linear speed under which a body counts as idle (m/s).
    pub point_velocity_sleep_threshold: f32,
    /// Angular speed under which a body counts as idle (rad/s).
    pub angular_velocity_sleep_threshold: f32,
    /// Cosine of the active-edge threshold angle; contacts against edges
    /// flatter than this are projected onto the face normal.
    pub active_edge_cos_threshold: f32,
    /// Trade throughput for bit-reproducible results at a fixed thread count.
    pub deterministic_simulation: bool,
    /// Seed solver iterations with the previous step's impulses.
    pub constraint_warm_start: bool,
    /// Split oversized islands into independently-solvable batches.
    pub use_large_island_splitter: bool,
    /// Master switch for the sleep state machine.
    pub allow_sleeping: bool,
    /// Islands with at least this many constraints are eligible for splitting.
    pub large_island_min_constraints: u32,
    /// Fraction of a cached impulse applied during warm starting.
    pub warm_start_factor: f32,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            num_velocity_steps: 10,
            num_position_steps: 2,
            baumgarte: 0.2,
            penetration_slop: 0.02,
            speculative_contact_distance: 0.02,
            manifold_tolerance_sq: 1.0e-4,
            min_velocity_for_restitution: 1.0,
            time_before_sleep: 0.5,
            point_velocity_sleep_threshold: 0.03,
            angular_velocity_sleep_threshold: 0.03,
            active_edge_cos_threshold: 0.996_195, // cos(5 degrees)
            deterministic_simulation: false,
            constraint_warm_start: true,
            use_large_island_splitter: true,
            allow_sleeping: true,
            large_island_min_constraints: 128,
            warm_start_factor: 1.0,
        }
    }
}

impl SolverSettings {
    /// Validate tunables. Iteration counts of zero and non-finite tolerances
    /// are configuration errors, not runtime conditions.
    pub fn validate(&self) -> PhysicsResult<()> {
        if self.num_velocity_steps == 0 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "num_velocity_steps must be > 0",
            });
        }
        if !self.baumgarte.is_finite() || self.baumgarte <= 0.0 || self.baumgarte > 1.0 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "baumgarte must be in (0, 1]",
            });
        }
        if !self.penetration_slop.is_finite() || self.penetration_slop < 0.0 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "penetration_slop must be >= 0",
            });
        }
        if !self.speculative_contact_distance.is_finite()
            || self.speculative_contact_distance < 0.0
        {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "speculative_contact_distance must be >= 0",
            });
        }
        if !self.manifold_tolerance_sq.is_finite() || self.manifold_tolerance_sq <= 0.0 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "manifold_tolerance_sq must be > 0",
            });
        }
        if !self.time_before_sleep.is_finite() || self.time_before_sleep <= 0.0 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "time_before_sleep must be > 0",
            });
        }
        if self.point_velocity_sleep_threshold < 0.0
            || self.angular_velocity_sleep_threshold < 0.0
        {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "sleep thresholds must be >= 0",
            });
        }
        if !(0.0..=1.0).contains(&self.warm_start_factor) {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "warm_start_factor must be in [0, 1]",
            });
        }
        Ok(())
    }
}

/// Default gravity (m/s^2).
#[must_use]
pub fn default_gravity() -> Vec3 {
    Vec3::new(0.0, -9.81, 0.0)
}

//! # keel-physics
//!
//! A real-time rigid-body physics core: the per-frame pipeline that advances
//! a world of bodies under gravity, contacts and constraints, plus the
//! kinematic character and wheeled-vehicle controllers layered on top.
//!
//! ## Pipeline
//!
//! Each [`PhysicsSystem::step`] runs: broadphase (incremental dynamic AABB
//! tree) -> narrowphase (analytic tests + GJK/EPA, dispatched on shape kind)
//! -> island build (union-find over the contact/constraint graph) -> solve
//! (sequential impulses with warm starting, islands fanned out across a fixed
//! worker pool) -> integration -> sleep management. The step is synchronous:
//! it blocks until every island job has joined.
//!
//! ## Handles
//!
//! All cross-references are checked handles (slot index + generation tag):
//! destroying a body invalidates every copy of its [`BodyId`] even after the
//! slot is recycled. There is no ambient global state; a [`PhysicsSystem`]
//! plus a [`JobSystem`] own every resource.
//!
//! ## Quick start
//!
//! ```
//! use keel_physics::prelude::*;
//!
//! let mut world = PhysicsSystem::with_default_settings()?;
//! let jobs = JobSystem::with_default_config()?;
//!
//! world.add_body(
//!     &BodyCreationSettings::new(Shape::plane(Vec3::Y, 0.0), RVec3::ZERO, MotionType::Static),
//!     Activation::Activate,
//! )?;
//! let ball = world.add_body(
//!     &BodyCreationSettings::new(
//!         Shape::sphere(0.5),
//!         RVec3::new(0.0, 5.0, 0.0),
//!         MotionType::Dynamic,
//!     ),
//!     Activation::Activate,
//! )?;
//!
//! for _ in 0..60 {
//!     let result = world.step(1.0 / 60.0, 1, &jobs)?;
//!     assert!(result.is_ok());
//! }
//! assert!(world.body(ball)?.position.y < 5.0);
//! # Ok::<(), keel_physics::PhysicsError>(())
//! ```

pub mod aabb;
pub mod body;
pub mod broad_phase;
pub mod character;
pub mod config;
pub mod constraint;
pub mod contact;
pub mod error;
pub mod filter;
pub mod island;
pub mod math;
pub mod narrow_phase;
pub mod query;
pub mod scheduler;
pub mod shape;
pub mod sleeping;
pub mod solver;
pub mod vehicle;
pub mod world;

pub use body::{
    Activation, AllowedDofs, Body, BodyCreationSettings, BodyId, MotionQuality, MotionType,
};
pub use character::{CharacterContact, CharacterVirtual, CharacterVirtualSettings, GroundState};
pub use config::{SimulationSettings, SolverSettings};
pub use constraint::{
    Constraint, ConstraintId, DistanceConstraintSettings, FixedConstraintSettings,
    HingeConstraintSettings, MotorSettings, PointConstraintSettings, SliderConstraintSettings,
    SpringSettings,
};
pub use error::{PhysicsError, PhysicsResult};
pub use filter::{CollisionFilter, ObjectLayer, ObjectLayerPairTable, QueryFilter};
pub use math::{Quat, RVec3, Vec3};
pub use narrow_phase::RayCastSettings;
pub use query::{OverlapHit, PointHit, RayCast, RayHit, ShapeCastHit};
pub use scheduler::{JobSystem, JobSystemConfig};
pub use shape::{CompoundChild, Shape, ShapeRef, SubShapeId};
pub use vehicle::{
    VehicleConstraint, VehicleConstraintSettings, WheelSettings, WheeledControllerSettings,
};
pub use world::{PhysicsSystem, StepResult, TraceSink, VehicleId};

/// Everything most callers need.
pub mod prelude {
    pub use crate::body::{
        Activation, AllowedDofs, BodyCreationSettings, BodyId, MotionQuality, MotionType,
    };
    pub use crate::character::{CharacterVirtual, CharacterVirtualSettings, GroundState};
    pub use crate::config::{SimulationSettings, SolverSettings};
    pub use crate::constraint::{
        DistanceConstraintSettings, FixedConstraintSettings, HingeConstraintSettings,
        PointConstraintSettings, SliderConstraintSettings,
    };
    pub use crate::error::{PhysicsError, PhysicsResult};
    pub use crate::filter::{CollisionFilter, ObjectLayerPairTable, QueryFilter};
    pub use crate::math::{Quat, RVec3, Vec3};
    pub use crate::narrow_phase::RayCastSettings;
    pub use crate::query::RayCast;
    pub use crate::scheduler::{JobSystem, JobSystemConfig};
    pub use crate::shape::Shape;
    pub use crate::vehicle::{VehicleConstraintSettings, WheelSettings};
    pub use crate::world::{PhysicsSystem, StepResult, VehicleId};
}

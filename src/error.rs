//! Physics Error Types
//!
//! Unified error type for the engine. Fallible operations (body lookup,
//! constraint validation, world construction) return
//! `Result<T, PhysicsError>` instead of panicking.
//!
//! Capacity saturation during a step is deliberately NOT an error: it is
//! reported through [`crate::world::StepResult`] flags and the step keeps
//! going with the overflow truncated.

use thiserror::Error;

use crate::body::BodyId;
use crate::constraint::ConstraintId;

/// Unified error type for physics operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PhysicsError {
    /// A body handle refers to a freed or recycled slot.
    #[error("invalid body handle {id:?} (slot reused or never allocated)")]
    InvalidBody {
        /// The stale handle that was presented
        id: BodyId,
    },

    /// A constraint handle refers to a freed or recycled slot.
    #[error("invalid constraint handle {id:?}")]
    InvalidConstraintHandle {
        /// The stale handle that was presented
        id: ConstraintId,
    },

    /// A constraint definition is malformed (same body twice, bad axis, ...).
    #[error("invalid constraint: {reason}")]
    InvalidConstraint {
        /// Human-readable description of the problem
        reason: &'static str,
    },

    /// A body cannot be removed while constraints still reference it.
    ///
    /// Dependent constraints must be removed first; cascading removal is
    /// deliberately not performed.
    #[error("body {body:?} is still referenced by constraint {constraint:?}")]
    BodyInConstraint {
        /// The body whose removal was refused
        body: BodyId,
        /// The first constraint found referencing it
        constraint: ConstraintId,
    },

    /// A zero-length direction or normal was provided where a unit vector is
    /// required.
    #[error("zero-length vector in {context}")]
    ZeroLengthVector {
        /// Where the degenerate vector was encountered
        context: &'static str,
    },

    /// A hard capacity limit was exceeded (too many bodies, ...).
    #[error("{resource} capacity exceeded (limit={limit})")]
    CapacityExceeded {
        /// What resource was exhausted
        resource: &'static str,
        /// The limit that was exceeded
        limit: usize,
    },

    /// Invalid configuration parameter, detected at construction time.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the invalid configuration
        reason: &'static str,
    },
}

/// Convenience alias used throughout the crate.
pub type PhysicsResult<T> = Result<T, PhysicsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = PhysicsError::CapacityExceeded {
            resource: "bodies",
            limit: 10240,
        };
        let s = format!("{e}");
        assert!(s.contains("bodies"));
        assert!(s.contains("10240"));
    }

    #[test]
    fn test_invalid_configuration_display() {
        let e = PhysicsError::InvalidConfiguration {
            reason: "num_velocity_steps must be > 0",
        };
        assert!(format!("{e}").contains("num_velocity_steps"));
    }

    #[test]
    fn test_error_variants_distinct() {
        let a = PhysicsError::InvalidConstraint { reason: "body A == body B" };
        let b = PhysicsError::ZeroLengthVector { context: "ray direction" };
        assert_ne!(a, b);
    }
}

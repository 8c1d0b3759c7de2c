//! Engine Math Layer
//!
//! Thin layer over `glam` with the precision split the engine mandates:
//! wide (f64) vectors for world positions so large worlds keep sub-millimeter
//! resolution, single precision for orientations, velocities and all
//! local-space geometry.
//!
//! Also home to the small geometric helpers the solver and narrowphase share:
//! tangent frames, quaternion integration, world-space inverse inertia and
//! finite-value guards.

pub use glam::{DVec3, Mat3, Quat, Vec3};

/// Wide vector used for world-space positions.
pub type RVec3 = DVec3;

/// Scalar type used for everything that is not a world position.
pub type Real = f32;

/// Build an orthonormal tangent frame `(t1, t2)` from a unit normal.
///
/// Picks the world axis least parallel to the normal as reference, so the
/// frame is stable for persistent contacts as long as the normal does not
/// swing across an octant boundary.
#[must_use]
pub fn tangent_frame(normal: Vec3) -> (Vec3, Vec3) {
    let abs = normal.abs();
    let reference = if abs.x <= abs.y && abs.x <= abs.z {
        Vec3::X
    } else if abs.y <= abs.z {
        Vec3::Y
    } else {
        Vec3::Z
    };

    let t1 = normal.cross(reference).normalize();
    let t2 = normal.cross(t1);
    (t1, t2)
}

/// Integrate an angular velocity into a rotation over `dt`.
///
/// Uses the standard first-order quaternion derivative
/// `q' = q + 0.5 * (w, 0) * q * dt`, renormalized.
#[must_use]
pub fn integrate_rotation(rotation: Quat, angular_velocity: Vec3, dt: Real) -> Quat {
    let w = Quat::from_xyzw(angular_velocity.x, angular_velocity.y, angular_velocity.z, 0.0);
    let dq = w * rotation;
    let q = Quat::from_xyzw(
        rotation.x + 0.5 * dt * dq.x,
        rotation.y + 0.5 * dt * dq.y,
        rotation.z + 0.5 * dt * dq.z,
        rotation.w + 0.5 * dt * dq.w,
    );
    if q.length_squared() > 0.0 {
        q.normalize()
    } else {
        rotation
    }
}

/// World-space inverse inertia tensor from a local diagonal and a rotation.
///
/// `R * diag(inv_i) * R^T`. A zero diagonal (static/kinematic body) yields the
/// zero matrix.
#[must_use]
pub fn inverse_inertia_world(inv_inertia_local: Vec3, rotation: Quat) -> Mat3 {
    let r = Mat3::from_quat(rotation);
    let d = Mat3::from_diagonal(inv_inertia_local);
    r * d * r.transpose()
}

/// True when every component of the vector is finite.
#[inline]
#[must_use]
pub fn is_finite_vec3(v: Vec3) -> bool {
    v.x.is_finite() && v.y.is_finite() && v.z.is_finite()
}

/// True when every component of the wide vector is finite.
#[inline]
#[must_use]
pub fn is_finite_rvec3(v: RVec3) -> bool {
    v.x.is_finite() && v.y.is_finite() && v.z.is_finite()
}

/// Rotation angle-axis error between two orientations, as a small-angle vector.
///
/// For nearly aligned orientations this is `2 * im(q_b * q_a^-1)` with the
/// sign fixed so the shortest arc is taken. Used by the fixed/hinge/slider
/// position solvers.
#[must_use]
pub fn rotation_error(a: Quat, b: Quat) -> Vec3 {
    let mut d = b * a.inverse();
    if d.w < 0.0 {
        d = Quat::from_xyzw(-d.x, -d.y, -d.z, -d.w);
    }
    2.0 * Vec3::new(d.x, d.y, d.z)
}

/// Offset of a world point from a wide origin, narrowed to f32.
///
/// All narrowphase and solver math runs in f32 relative to one body's
/// position; this is the only place the f64 -> f32 narrowing happens.
#[inline]
#[must_use]
pub fn relative_to(point: RVec3, origin: RVec3) -> Vec3 {
    (point - origin).as_vec3()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tangent_frame_orthonormal() {
        for normal in [Vec3::Y, Vec3::X, Vec3::NEG_Z, Vec3::new(1.0, 2.0, -0.5).normalize()] {
            let (t1, t2) = tangent_frame(normal);
            assert_relative_eq!(normal.dot(t1), 0.0, epsilon = 1e-6);
            assert_relative_eq!(normal.dot(t2), 0.0, epsilon = 1e-6);
            assert_relative_eq!(t1.dot(t2), 0.0, epsilon = 1e-6);
            assert_relative_eq!(t1.length(), 1.0, epsilon = 1e-6);
            assert_relative_eq!(t2.length(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_integrate_rotation_about_y() {
        // Quarter turn per second about Y, integrated in small steps.
        let mut q = Quat::IDENTITY;
        let w = Vec3::new(0.0, core::f32::consts::FRAC_PI_2, 0.0);
        for _ in 0..100 {
            q = integrate_rotation(q, w, 0.01);
        }
        let rotated = q * Vec3::X;
        // After one second we expect roughly -Z.
        assert!(rotated.z < -0.9, "rotated = {rotated:?}");
        assert_relative_eq!(q.length(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_inverse_inertia_world_identity_rotation() {
        let inv = inverse_inertia_world(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY);
        assert_relative_eq!(inv.col(0).x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(inv.col(1).y, 2.0, epsilon = 1e-6);
        assert_relative_eq!(inv.col(2).z, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rotation_error_small_angle() {
        let a = Quat::IDENTITY;
        let b = Quat::from_axis_angle(Vec3::Y, 0.02);
        let err = rotation_error(a, b);
        assert_relative_eq!(err.y, 0.02, epsilon = 1e-4);
        assert_relative_eq!(err.x, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_finite_guards() {
        assert!(is_finite_vec3(Vec3::ONE));
        assert!(!is_finite_vec3(Vec3::new(f32::NAN, 0.0, 0.0)));
        assert!(!is_finite_rvec3(RVec3::new(f64::INFINITY, 0.0, 0.0)));
    }
}

//! Collision Shapes
//!
//! Closed sum type over the shape kinds the engine simulates. The narrowphase
//! dispatches on kind pairs with a single match instead of virtual calls
//! through opaque handles.
//!
//! Shape *authoring* (mesh baking, convex decomposition, serialization) is
//! out of scope; this module only carries the query surface the core
//! consumes: support mapping, local bounds, mass properties and stable
//! sub-shape identifiers for compounds.

use std::sync::Arc;

use crate::aabb::Aabb;
use crate::config::DEFAULT_CONVEX_RADIUS;
use crate::math::{Mat3, Quat, RVec3, Vec3};

/// Stable identifier of a sub-shape inside a compound. Zero for simple shapes.
pub type SubShapeId = u32;

/// Shared, immutable shape reference. Bodies holding the same geometry share
/// one allocation.
pub type ShapeRef = Arc<Shape>;

/// Mass and local-space diagonal inertia computed from a shape and density.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MassProperties {
    /// Mass (kg)
    pub mass: f32,
    /// Diagonal of the local inertia tensor (kg m^2)
    pub inertia: Vec3,
}

/// One child of a compound shape.
#[derive(Clone, Debug)]
pub struct CompoundChild {
    /// Child offset in compound-local space
    pub local_position: Vec3,
    /// Child rotation in compound-local space
    pub local_rotation: Quat,
    /// Child geometry. Must not itself be a compound.
    pub shape: ShapeRef,
}

/// Collision shape.
#[derive(Clone, Debug)]
pub enum Shape {
    /// Sphere centered at the local origin.
    Sphere {
        /// Radius (m)
        radius: f32,
    },
    /// Box centered at the local origin.
    Box {
        /// Half extents along each local axis
        half_extents: Vec3,
        /// Rounding radius for contact generation
        convex_radius: f32,
    },
    /// Capsule along the local Y axis.
    Capsule {
        /// Half the distance between the hemisphere centers
        half_height: f32,
        /// Radius (m)
        radius: f32,
    },
    /// Cylinder along the local Y axis.
    Cylinder {
        /// Half height (m)
        half_height: f32,
        /// Radius (m)
        radius: f32,
    },
    /// Single-sided plane, for static world geometry only.
    Plane {
        /// Unit normal in local space
        normal: Vec3,
        /// Signed distance of the plane from the local origin along the normal
        distance: f32,
        /// Half extent of the bounded query region
        half_extent: f32,
    },
    /// Convex hull of a point cloud.
    ConvexHull {
        /// Hull vertices in local space
        points: Vec<Vec3>,
        /// Rounding radius for contact generation
        convex_radius: f32,
    },
    /// Rigid assembly of child shapes with stable sub-shape ids.
    Compound {
        /// Children; the index is the child's [`SubShapeId`]
        children: Vec<CompoundChild>,
    },
}

impl Shape {
    /// Sphere constructor.
    #[must_use]
    pub fn sphere(radius: f32) -> ShapeRef {
        Arc::new(Shape::Sphere { radius })
    }

    /// Box constructor with the default convex radius.
    #[must_use]
    pub fn cuboid(half_extents: Vec3) -> ShapeRef {
        let convex_radius = DEFAULT_CONVEX_RADIUS.min(half_extents.min_element() * 0.5);
        Arc::new(Shape::Box { half_extents, convex_radius })
    }

    /// Capsule constructor.
    #[must_use]
    pub fn capsule(half_height: f32, radius: f32) -> ShapeRef {
        Arc::new(Shape::Capsule { half_height, radius })
    }

    /// Cylinder constructor.
    #[must_use]
    pub fn cylinder(half_height: f32, radius: f32) -> ShapeRef {
        Arc::new(Shape::Cylinder { half_height, radius })
    }

    /// Plane constructor. `normal` is normalized here.
    #[must_use]
    pub fn plane(normal: Vec3, distance: f32) -> ShapeRef {
        Arc::new(Shape::Plane {
            normal: normal.normalize(),
            distance,
            half_extent: 1000.0,
        })
    }

    /// Convex hull constructor.
    #[must_use]
    pub fn convex_hull(points: Vec<Vec3>) -> ShapeRef {
        Arc::new(Shape::ConvexHull { points, convex_radius: DEFAULT_CONVEX_RADIUS })
    }

    /// Compound constructor.
    #[must_use]
    pub fn compound(children: Vec<CompoundChild>) -> ShapeRef {
        debug_assert!(
            children.iter().all(|c| !matches!(&*c.shape, Shape::Compound { .. })),
            "compounds must not nest"
        );
        Arc::new(Shape::Compound { children })
    }

    /// True for shapes GJK/EPA can consume directly.
    #[must_use]
    pub fn is_convex(&self) -> bool {
        !matches!(self, Shape::Plane { .. } | Shape::Compound { .. })
    }

    /// Support mapping in local space: the furthest point in `direction`.
    ///
    /// Only valid for convex kinds; planes and compounds are dispatched
    /// separately by the narrowphase.
    #[must_use]
    pub fn support(&self, direction: Vec3) -> Vec3 {
        match self {
            Shape::Sphere { radius } => {
                let d = direction.normalize_or_zero();
                d * *radius
            }
            Shape::Box { half_extents, .. } => Vec3::new(
                half_extents.x.copysign(direction.x),
                half_extents.y.copysign(direction.y),
                half_extents.z.copysign(direction.z),
            ),
            Shape::Capsule { half_height, radius } => {
                let d = direction.normalize_or_zero();
                Vec3::new(0.0, half_height.copysign(direction.y), 0.0) + d * *radius
            }
            Shape::Cylinder { half_height, radius } => {
                let radial = Vec3::new(direction.x, 0.0, direction.z);
                let rim = if radial.length_squared() > 1.0e-12 {
                    radial.normalize() * *radius
                } else {
                    Vec3::ZERO
                };
                rim + Vec3::new(0.0, half_height.copysign(direction.y), 0.0)
            }
            Shape::ConvexHull { points, .. } => {
                let mut best = Vec3::ZERO;
                let mut best_dot = f32::NEG_INFINITY;
                for &p in points {
                    let d = p.dot(direction);
                    if d > best_dot {
                        best_dot = d;
                        best = p;
                    }
                }
                best
            }
            Shape::Plane { .. } | Shape::Compound { .. } => {
                debug_assert!(false, "support() called on non-convex shape");
                Vec3::ZERO
            }
        }
    }

    /// Local-space bounds as (min, max).
    #[must_use]
    pub fn local_bounds(&self) -> (Vec3, Vec3) {
        match self {
            Shape::Sphere { radius } => (Vec3::splat(-radius), Vec3::splat(*radius)),
            Shape::Box { half_extents, .. } => (-*half_extents, *half_extents),
            Shape::Capsule { half_height, radius } => {
                let h = Vec3::new(*radius, half_height + radius, *radius);
                (-h, h)
            }
            Shape::Cylinder { half_height, radius } => {
                let h = Vec3::new(*radius, *half_height, *radius);
                (-h, h)
            }
            Shape::Plane { half_extent, .. } => {
                (Vec3::splat(-half_extent), Vec3::splat(*half_extent))
            }
            Shape::ConvexHull { points, .. } => {
                let mut min = Vec3::splat(f32::INFINITY);
                let mut max = Vec3::splat(f32::NEG_INFINITY);
                for &p in points {
                    min = min.min(p);
                    max = max.max(p);
                }
                if points.is_empty() {
                    (Vec3::ZERO, Vec3::ZERO)
                } else {
                    (min, max)
                }
            }
            Shape::Compound { children } => {
                let mut min = Vec3::splat(f32::INFINITY);
                let mut max = Vec3::splat(f32::NEG_INFINITY);
                for child in children {
                    let (cmin, cmax) = child.shape.local_bounds();
                    // Conservative: rotate the child box by its local rotation.
                    let center = (cmin + cmax) * 0.5;
                    let half = (cmax - cmin) * 0.5;
                    let m = Mat3::from_quat(child.local_rotation);
                    let abs_half =
                        m.x_axis.abs() * half.x + m.y_axis.abs() * half.y + m.z_axis.abs() * half.z;
                    let c = child.local_position + child.local_rotation * center;
                    min = min.min(c - abs_half);
                    max = max.max(c + abs_half);
                }
                if children.is_empty() {
                    (Vec3::ZERO, Vec3::ZERO)
                } else {
                    (min, max)
                }
            }
        }
    }

    /// World-space AABB for a given pose.
    #[must_use]
    pub fn world_aabb(&self, position: RVec3, rotation: Quat) -> Aabb {
        let (min, max) = self.local_bounds();
        let center = (min + max) * 0.5;
        let half = (max - min) * 0.5;

        // |R| * h gives the rotated box's half extents.
        let m = Mat3::from_quat(rotation);
        let abs_half =
            m.x_axis.abs() * half.x + m.y_axis.abs() * half.y + m.z_axis.abs() * half.z;
        let world_center = position + (rotation * center).as_dvec3();
        Aabb::from_center_half(world_center, abs_half.as_dvec3())
    }

    /// Mass and local inertia from a uniform density (kg/m^3).
    ///
    /// Hulls use their bounding-box inertia; compounds accumulate children via
    /// the parallel-axis theorem on the diagonal (products of inertia are
    /// dropped).
    #[must_use]
    pub fn mass_properties(&self, density: f32) -> MassProperties {
        match self {
            Shape::Sphere { radius } => {
                let r = *radius;
                let mass = density * 4.0 / 3.0 * core::f32::consts::PI * r * r * r;
                let i = 0.4 * mass * r * r;
                MassProperties { mass, inertia: Vec3::splat(i) }
            }
            Shape::Box { half_extents, .. } => {
                let e = *half_extents * 2.0;
                let mass = density * e.x * e.y * e.z;
                let inertia = Vec3::new(
                    mass / 12.0 * (e.y * e.y + e.z * e.z),
                    mass / 12.0 * (e.x * e.x + e.z * e.z),
                    mass / 12.0 * (e.x * e.x + e.y * e.y),
                );
                MassProperties { mass, inertia }
            }
            Shape::Capsule { half_height, radius } => {
                let r = *radius;
                let h = 2.0 * half_height;
                let pi = core::f32::consts::PI;
                let m_cyl = density * pi * r * r * h;
                let m_sph = density * 4.0 / 3.0 * pi * r * r * r;
                let mass = m_cyl + m_sph;

                // Cylinder part + two hemispheres offset to the caps.
                let i_y = m_cyl * r * r / 2.0 + m_sph * 0.4 * r * r;
                let hh = *half_height;
                let i_xz = m_cyl * (3.0 * r * r + h * h) / 12.0
                    + m_sph * (0.4 * r * r + hh * hh + 0.75 * hh * r);
                MassProperties { mass, inertia: Vec3::new(i_xz, i_y, i_xz) }
            }
            Shape::Cylinder { half_height, radius } => {
                let r = *radius;
                let h = 2.0 * half_height;
                let mass = density * core::f32::consts::PI * r * r * h;
                let i_y = mass * r * r / 2.0;
                let i_xz = mass * (3.0 * r * r + h * h) / 12.0;
                MassProperties { mass, inertia: Vec3::new(i_xz, i_y, i_xz) }
            }
            Shape::Plane { .. } => MassProperties { mass: 0.0, inertia: Vec3::ZERO },
            Shape::ConvexHull { .. } => {
                let (min, max) = self.local_bounds();
                let e = max - min;
                let mass = density * e.x * e.y * e.z;
                let inertia = Vec3::new(
                    mass / 12.0 * (e.y * e.y + e.z * e.z),
                    mass / 12.0 * (e.x * e.x + e.z * e.z),
                    mass / 12.0 * (e.x * e.x + e.y * e.y),
                );
                MassProperties { mass, inertia }
            }
            Shape::Compound { children } => {
                let mut mass = 0.0;
                let mut inertia = Vec3::ZERO;
                for child in children {
                    let mp = child.shape.mass_properties(density);
                    let d = child.local_position;
                    let d2 = d * d;
                    mass += mp.mass;
                    inertia += mp.inertia
                        + mp.mass * Vec3::new(d2.y + d2.z, d2.x + d2.z, d2.x + d2.y);
                }
                MassProperties { mass, inertia }
            }
        }
    }

    /// Number of sub-shapes (1 for simple shapes).
    #[must_use]
    pub fn sub_shape_count(&self) -> u32 {
        match self {
            Shape::Compound { children } => children.len() as u32,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sphere_support() {
        let s = Shape::Sphere { radius: 2.0 };
        let p = s.support(Vec3::X);
        assert_relative_eq!(p.x, 2.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_box_support_picks_corner() {
        let b = Shape::Box { half_extents: Vec3::new(1.0, 2.0, 3.0), convex_radius: 0.0 };
        let p = b.support(Vec3::new(0.3, -0.5, 0.8));
        assert_eq!(p, Vec3::new(1.0, -2.0, 3.0));
    }

    #[test]
    fn test_capsule_bounds_include_caps() {
        let c = Shape::Capsule { half_height: 1.0, radius: 0.5 };
        let (min, max) = c.local_bounds();
        assert_relative_eq!(max.y, 1.5, epsilon = 1e-6);
        assert_relative_eq!(min.x, -0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_world_aabb_rotated_box() {
        let b = Shape::Box { half_extents: Vec3::new(1.0, 0.1, 0.1), convex_radius: 0.0 };
        // Quarter turn about Z swaps the long axis onto Y.
        let rot = Quat::from_axis_angle(Vec3::Z, core::f32::consts::FRAC_PI_2);
        let aabb = b.world_aabb(RVec3::new(10.0, 0.0, 0.0), rot);
        assert!((aabb.max.y - 1.0).abs() < 1e-4, "max.y = {}", aabb.max.y);
        assert!((aabb.max.x - 10.1).abs() < 1e-4, "max.x = {}", aabb.max.x);
    }

    #[test]
    fn test_sphere_mass() {
        let s = Shape::Sphere { radius: 1.0 };
        let mp = s.mass_properties(1000.0);
        assert_relative_eq!(mp.mass, 4188.79, epsilon = 1.0);
        // Solid sphere: I = 2/5 m r^2
        assert_relative_eq!(mp.inertia.x, 0.4 * mp.mass, epsilon = 1.0);
    }

    #[test]
    fn test_compound_mass_accumulates() {
        let child = Shape::sphere(1.0);
        let compound = Shape::compound(vec![
            CompoundChild {
                local_position: Vec3::new(0.0, 1.0, 0.0),
                local_rotation: Quat::IDENTITY,
                shape: child.clone(),
            },
            CompoundChild {
                local_position: Vec3::new(0.0, -1.0, 0.0),
                local_rotation: Quat::IDENTITY,
                shape: child.clone(),
            },
        ]);
        let single = child.mass_properties(100.0);
        let mp = compound.mass_properties(100.0);
        assert_relative_eq!(mp.mass, 2.0 * single.mass, epsilon = 1e-2);
        // Offset along Y adds m*d^2 to X and Z only.
        assert!(mp.inertia.x > 2.0 * single.inertia.x);
        assert_relative_eq!(mp.inertia.y, 2.0 * single.inertia.y, epsilon = 1e-2);
        assert_eq!(compound.sub_shape_count(), 2);
    }

    #[test]
    fn test_hull_support() {
        let hull = Shape::ConvexHull {
            points: vec![
                Vec3::new(-1.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 2.0, 0.0),
            ],
            convex_radius: 0.0,
        };
        assert_eq!(hull.support(Vec3::Y), Vec3::new(0.0, 2.0, 0.0));
        assert_eq!(hull.support(Vec3::NEG_X), Vec3::new(-1.0, 0.0, 0.0));
    }
}

//! Axis-Aligned Bounding Boxes
//!
//! World-space boxes use the wide (f64) position type so the broadphase stays
//! exact far from the origin.

use crate::math::RVec3;

/// World-space axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: RVec3,
    /// Maximum corner
    pub max: RVec3,
}

impl Aabb {
    /// Create from explicit corners.
    #[inline]
    #[must_use]
    pub fn new(min: RVec3, max: RVec3) -> Self {
        Self { min, max }
    }

    /// Create from a center and half extents.
    #[inline]
    #[must_use]
    pub fn from_center_half(center: RVec3, half: RVec3) -> Self {
        Self { min: center - half, max: center + half }
    }

    /// An inverted box that unions to anything.
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            min: RVec3::splat(f64::INFINITY),
            max: RVec3::splat(f64::NEG_INFINITY),
        }
    }

    /// Overlap test, inclusive on the boundary.
    #[inline]
    #[must_use]
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Point containment, inclusive.
    #[inline]
    #[must_use]
    pub fn contains_point(&self, p: RVec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// True when `other` fits entirely inside `self`.
    #[inline]
    #[must_use]
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.x <= other.min.x
            && self.min.y <= other.min.y
            && self.min.z <= other.min.z
            && self.max.x >= other.max.x
            && self.max.y >= other.max.y
            && self.max.z >= other.max.z
    }

    /// Smallest box covering both inputs.
    #[inline]
    #[must_use]
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grow symmetrically by `margin` on every axis.
    #[inline]
    #[must_use]
    pub fn grown(&self, margin: f64) -> Aabb {
        let m = RVec3::splat(margin);
        Aabb { min: self.min - m, max: self.max + m }
    }

    /// Extend along a displacement, covering the swept volume.
    #[must_use]
    pub fn extended_by(&self, displacement: RVec3) -> Aabb {
        Aabb {
            min: self.min + displacement.min(RVec3::ZERO),
            max: self.max + displacement.max(RVec3::ZERO),
        }
    }

    /// Box center.
    #[inline]
    #[must_use]
    pub fn center(&self) -> RVec3 {
        (self.min + self.max) * 0.5
    }

    /// Surface area, the cost metric for tree construction.
    #[must_use]
    pub fn surface_area(&self) -> f64 {
        let d = self.max - self.min;
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Slab test against a ray segment `origin + t * direction`, `t` in
    /// `[0, max_t]`. Returns the entry parameter, 0 when starting inside.
    #[must_use]
    pub fn ray_intersect(&self, origin: RVec3, direction: RVec3, max_t: f64) -> Option<f64> {
        let mut t_min: f64 = 0.0;
        let mut t_max = max_t;

        for axis in 0..3 {
            let o = origin[axis];
            let d = direction[axis];
            let lo = self.min[axis];
            let hi = self.max[axis];

            if d.abs() < f64::EPSILON {
                if o < lo || o > hi {
                    return None;
                }
            } else {
                let inv = 1.0 / d;
                let mut t0 = (lo - o) * inv;
                let mut t1 = (hi - o) * inv;
                if t0 > t1 {
                    core::mem::swap(&mut t0, &mut t1);
                }
                t_min = t_min.max(t0);
                t_max = t_max.min(t1);
                if t_min > t_max {
                    return None;
                }
            }
        }

        Some(t_min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box_at(x: f64, y: f64, z: f64) -> Aabb {
        let c = RVec3::new(x, y, z);
        Aabb::from_center_half(c, RVec3::splat(0.5))
    }

    #[test]
    fn test_intersects() {
        let a = unit_box_at(0.0, 0.0, 0.0);
        let b = unit_box_at(0.9, 0.0, 0.0);
        let c = unit_box_at(3.0, 0.0, 0.0);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_union_and_contains() {
        let a = unit_box_at(0.0, 0.0, 0.0);
        let b = unit_box_at(2.0, 0.0, 0.0);
        let u = a.union(&b);
        assert!(u.contains(&a));
        assert!(u.contains(&b));
        assert!(!a.contains(&u));
    }

    #[test]
    fn test_surface_area() {
        let a = Aabb::new(RVec3::ZERO, RVec3::new(1.0, 2.0, 3.0));
        // 2 * (1*2 + 2*3 + 3*1) = 22
        assert!((a.surface_area() - 22.0).abs() < 1e-12);
    }

    #[test]
    fn test_ray_hit_and_miss() {
        let b = unit_box_at(0.0, 0.0, 0.0);
        // Ray along +X from the left, hits the -0.5 face at t = 0.45.
        let t = b
            .ray_intersect(RVec3::new(-5.0, 0.0, 0.0), RVec3::new(10.0, 0.0, 0.0), 1.0)
            .expect("should hit");
        assert!((t - 0.45).abs() < 1e-12, "t = {t}");

        // Parallel ray above the box misses.
        assert!(b
            .ray_intersect(RVec3::new(-5.0, 2.0, 0.0), RVec3::new(10.0, 0.0, 0.0), 1.0)
            .is_none());
    }

    #[test]
    fn test_ray_starting_inside() {
        let b = unit_box_at(0.0, 0.0, 0.0);
        let t = b
            .ray_intersect(RVec3::ZERO, RVec3::new(1.0, 0.0, 0.0), 1.0)
            .expect("inside counts as hit");
        assert_eq!(t, 0.0);
    }

    #[test]
    fn test_extended_by() {
        let b = unit_box_at(0.0, 0.0, 0.0);
        let e = b.extended_by(RVec3::new(2.0, -1.0, 0.0));
        assert_eq!(e.max.x, 2.5);
        assert_eq!(e.min.y, -1.5);
        assert_eq!(e.min.x, -0.5);
    }
}

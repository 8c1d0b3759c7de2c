//! Collision Filtering
//!
//! Two cooperating predicates decide whether a broadphase candidate pair is
//! handed to the narrowphase, both pure functions of layer data only:
//!
//! - [`CollisionFilter`]: per-body layer/mask/group bitmasks.
//! - [`ObjectLayerPairTable`]: a many-to-many enable/disable matrix over
//!   object layers, for setups where bitmasks get unwieldy.
//!
//! The table defaults to all-enabled, so worlds that only use bitmasks pay
//! nothing for it.

/// Object layer index a body belongs to.
pub type ObjectLayer = u16;

/// Collision filter using layer/mask bitmasks.
///
/// Two bodies can collide iff
/// `(a.layer & b.mask) != 0 && (b.layer & a.mask) != 0`,
/// and they are not members of the same non-zero group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CollisionFilter {
    /// Which layer bit(s) this body belongs to
    pub layer: u32,
    /// Which layer bits this body may collide with
    pub mask: u32,
    /// Bodies sharing the same non-zero group never collide
    pub group: u32,
}

impl CollisionFilter {
    /// Default filter: layer 1, collides with everything.
    pub const DEFAULT: Self = Self { layer: 1, mask: u32::MAX, group: 0 };

    /// Collides with nothing.
    pub const NONE: Self = Self { layer: 0, mask: 0, group: 0 };

    /// Create a new filter.
    #[inline]
    #[must_use]
    pub const fn new(layer: u32, mask: u32) -> Self {
        Self { layer, mask, group: 0 }
    }

    /// Attach a collision group.
    #[inline]
    #[must_use]
    pub const fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// Check whether two filters allow collision.
    #[inline]
    #[must_use]
    pub fn can_collide(a: &Self, b: &Self) -> bool {
        if a.group != 0 && a.group == b.group {
            return false;
        }
        (a.layer & b.mask) != 0 && (b.layer & a.mask) != 0
    }
}

impl Default for CollisionFilter {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Pairwise enable/disable matrix over object layers.
///
/// Symmetric by construction: enabling/disabling `(a, b)` also affects
/// `(b, a)`. Layers outside the configured count collide by default.
#[derive(Clone, Debug)]
pub struct ObjectLayerPairTable {
    num_layers: u16,
    // Row-major upper-triangle-mirrored bit matrix, true = collision enabled.
    enabled: Vec<bool>,
}

impl ObjectLayerPairTable {
    /// Create a table over `num_layers` layers with every pair enabled.
    #[must_use]
    pub fn new(num_layers: u16) -> Self {
        Self {
            num_layers,
            enabled: vec![true; num_layers as usize * num_layers as usize],
        }
    }

    #[inline]
    fn idx(&self, a: ObjectLayer, b: ObjectLayer) -> usize {
        a as usize * self.num_layers as usize + b as usize
    }

    /// Disable collision between two layers (both directions).
    pub fn disable_collision(&mut self, a: ObjectLayer, b: ObjectLayer) {
        if a < self.num_layers && b < self.num_layers {
            let (i, j) = (self.idx(a, b), self.idx(b, a));
            self.enabled[i] = false;
            self.enabled[j] = false;
        }
    }

    /// Re-enable collision between two layers (both directions).
    pub fn enable_collision(&mut self, a: ObjectLayer, b: ObjectLayer) {
        if a < self.num_layers && b < self.num_layers {
            let (i, j) = (self.idx(a, b), self.idx(b, a));
            self.enabled[i] = true;
            self.enabled[j] = true;
        }
    }

    /// Query the matrix. Pure function of the two layers.
    #[inline]
    #[must_use]
    pub fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
        if a >= self.num_layers || b >= self.num_layers {
            return true;
        }
        self.enabled[self.idx(a, b)]
    }

    /// Number of configured layers.
    #[inline]
    #[must_use]
    pub fn num_layers(&self) -> u16 {
        self.num_layers
    }
}

impl Default for ObjectLayerPairTable {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Layer filter applied to world queries (ray/shape casts).
///
/// `None` fields match everything, so `QueryFilter::default()` hits all
/// bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryFilter {
    /// Only hit bodies whose filter passes against this one
    pub filter: Option<CollisionFilter>,
    /// Only hit bodies on this object layer
    pub object_layer: Option<ObjectLayer>,
}

impl QueryFilter {
    /// Filter that matches every body.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to bodies colliding with `filter`.
    #[must_use]
    pub fn with_filter(filter: CollisionFilter) -> Self {
        Self { filter: Some(filter), object_layer: None }
    }

    /// Check a body's filter data against this query.
    #[inline]
    #[must_use]
    pub fn matches(&self, body_filter: &CollisionFilter, body_layer: ObjectLayer) -> bool {
        if let Some(layer) = self.object_layer {
            if layer != body_layer {
                return false;
            }
        }
        if let Some(f) = &self.filter {
            if !CollisionFilter::can_collide(f, body_filter) {
                return false;
            }
        }
        true
    }
}

/// Predefined collision layer bits for common setups.
pub mod layers {
    /// Default collision layer
    pub const DEFAULT: u32 = 1 << 0;
    /// Static world geometry
    pub const STATIC: u32 = 1 << 1;
    /// Kinematic bodies
    pub const KINEMATIC: u32 = 1 << 2;
    /// Player characters
    pub const PLAYER: u32 = 1 << 3;
    /// Debris that only collides with static geometry
    pub const DEBRIS: u32 = 1 << 4;
    /// Sensor volumes
    pub const SENSOR: u32 = 1 << 5;
    /// Vehicles
    pub const VEHICLE: u32 = 1 << 6;
    /// All layers combined
    pub const ALL: u32 = u32::MAX;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_collides() {
        let a = CollisionFilter::DEFAULT;
        let b = CollisionFilter::DEFAULT;
        assert!(CollisionFilter::can_collide(&a, &b));
    }

    #[test]
    fn test_none_filter() {
        assert!(!CollisionFilter::can_collide(
            &CollisionFilter::NONE,
            &CollisionFilter::DEFAULT
        ));
    }

    #[test]
    fn test_one_way_mask_blocks() {
        let a = CollisionFilter::new(1 << 0, 1 << 1);
        let b = CollisionFilter::new(1 << 1, 0);
        assert!(!CollisionFilter::can_collide(&a, &b));
    }

    #[test]
    fn test_same_group_never_collides() {
        let a = CollisionFilter::new(layers::ALL, layers::ALL).with_group(7);
        let b = CollisionFilter::new(layers::ALL, layers::ALL).with_group(7);
        let c = CollisionFilter::new(layers::ALL, layers::ALL).with_group(8);
        assert!(!CollisionFilter::can_collide(&a, &b));
        assert!(CollisionFilter::can_collide(&a, &c));
    }

    #[test]
    fn test_pair_table_symmetric() {
        let mut table = ObjectLayerPairTable::new(4);
        assert!(table.should_collide(0, 1));

        table.disable_collision(0, 1);
        assert!(!table.should_collide(0, 1));
        assert!(!table.should_collide(1, 0));
        assert!(table.should_collide(0, 2));

        table.enable_collision(1, 0);
        assert!(table.should_collide(0, 1));
    }

    #[test]
    fn test_pair_table_out_of_range_defaults_enabled() {
        let table = ObjectLayerPairTable::new(2);
        assert!(table.should_collide(0, 9));
    }

    #[test]
    fn test_query_filter() {
        let body = CollisionFilter::new(layers::STATIC, layers::ALL);
        let q = QueryFilter::with_filter(CollisionFilter::new(layers::PLAYER, layers::STATIC));
        assert!(q.matches(&body, 0));

        let q = QueryFilter::with_filter(CollisionFilter::new(layers::PLAYER, layers::DEBRIS));
        assert!(!q.matches(&body, 0));

        let q = QueryFilter { object_layer: Some(3), ..Default::default() };
        assert!(!q.matches(&body, 0));
        assert!(q.matches(&body, 3));
    }
}

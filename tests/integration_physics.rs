//! Integration tests for keel-physics
//!
//! End-to-end behaviour through the public API only: bodies fall, settle,
//! bounce, sleep, wake, and the world answers queries about them. Each test
//! builds its own world and job system.

use keel_physics::prelude::*;

// ============================================================================
// Helpers
// ============================================================================

fn jobs() -> JobSystem {
    JobSystem::new(JobSystemConfig { num_threads: 2, ..Default::default() }).unwrap()
}

fn world() -> PhysicsSystem {
    PhysicsSystem::with_default_settings().unwrap()
}

fn floor(world: &mut PhysicsSystem) -> BodyId {
    world
        .add_body(
            &BodyCreationSettings::new(Shape::plane(Vec3::Y, 0.0), RVec3::ZERO, MotionType::Static),
            Activation::Activate,
        )
        .unwrap()
}

fn sphere(at: RVec3, restitution: f32) -> BodyCreationSettings {
    BodyCreationSettings::new(Shape::sphere(0.5), at, MotionType::Dynamic)
        .with_restitution(restitution)
}

fn run(world: &mut PhysicsSystem, jobs: &JobSystem, steps: usize) {
    for _ in 0..steps {
        world.step(1.0 / 60.0, 1, jobs).unwrap();
    }
}

// ============================================================================
// Test 1 — Static and kinematic bodies are never moved by integration
// ============================================================================

#[test]
fn test_static_and_kinematic_unmoved_by_gravity() {
    let mut w = world();
    let js = jobs();

    let st = floor(&mut w);
    let kin = w
        .add_body(
            &BodyCreationSettings::new(
                Shape::cuboid(Vec3::splat(0.5)),
                RVec3::new(3.0, 4.0, 0.0),
                MotionType::Kinematic,
            ),
            Activation::Activate,
        )
        .unwrap();

    run(&mut w, &js, 120);

    assert_eq!(w.body(st).unwrap().position, RVec3::ZERO);
    assert_eq!(w.body(kin).unwrap().position, RVec3::new(3.0, 4.0, 0.0));

    // An explicit kinematic move is the only way a kinematic body travels.
    w.move_kinematic(kin, RVec3::new(3.0, 6.0, 0.0), Quat::IDENTITY, 1.0 / 60.0).unwrap();
    w.step(1.0 / 60.0, 1, &js).unwrap();
    assert!((w.body(kin).unwrap().position.y - 6.0).abs() < 1e-3);
}

// ============================================================================
// Test 2 — A dropped body settles on the floor within the slop
// ============================================================================

#[test]
fn test_dropped_body_settles_within_slop() {
    let mut w = world();
    let js = jobs();
    floor(&mut w);
    let ball = w.add_body(&sphere(RVec3::new(0.0, 3.0, 0.0), 0.0), Activation::Activate).unwrap();

    run(&mut w, &js, 300);

    let body = w.body(ball).unwrap();
    let slop = f64::from(w.physics_settings().penetration_slop);
    assert!(
        body.position.y >= 0.5 - 2.0 * slop,
        "resting penetration exceeds slop: y = {}",
        body.position.y
    );
    assert!(
        body.linear_velocity.length() < w.physics_settings().point_velocity_sleep_threshold * 2.0,
        "body did not come to rest: v = {:?}",
        body.linear_velocity
    );
}

// ============================================================================
// Test 3 — Equal-mass head-on collisions: restitution 1 swaps, 0 merges
// ============================================================================

fn head_on(restitution: f32) -> (Vec3, Vec3) {
    let mut w = world();
    let js = jobs();
    w.set_gravity(Vec3::ZERO);

    // Slight initial overlap so no speculative allowance dilutes the bounce.
    let a = w.add_body(&sphere(RVec3::new(-0.495, 0.0, 0.0), restitution), Activation::Activate).unwrap();
    let b = w.add_body(&sphere(RVec3::new(0.495, 0.0, 0.0), restitution), Activation::Activate).unwrap();
    w.set_linear_velocity(a, Vec3::new(2.0, 0.0, 0.0)).unwrap();
    w.set_linear_velocity(b, Vec3::new(-2.0, 0.0, 0.0)).unwrap();

    run(&mut w, &js, 5);
    (
        w.body(a).unwrap().linear_velocity,
        w.body(b).unwrap().linear_velocity,
    )
}

#[test]
fn test_full_restitution_exchanges_velocities() {
    let (va, vb) = head_on(1.0);
    assert!((va.x + 2.0).abs() < 0.15, "va = {va:?}");
    assert!((vb.x - 2.0).abs() < 0.15, "vb = {vb:?}");
}

#[test]
fn test_zero_restitution_reaches_common_velocity() {
    let (va, vb) = head_on(0.0);
    assert!((va.x - vb.x).abs() < 0.05, "va = {va:?}, vb = {vb:?}");
    assert!(va.x.abs() < 0.1, "momentum should cancel, va = {va:?}");
}

// ============================================================================
// Test 4 — Islands sleep as a unit and wake as a unit
// ============================================================================

#[test]
fn test_island_sleep_and_transitive_wake() {
    let mut w = world();
    let js = jobs();
    floor(&mut w);

    let cube = |y: f64| {
        BodyCreationSettings::new(
            Shape::cuboid(Vec3::splat(0.5)),
            RVec3::new(0.0, y, 0.0),
            MotionType::Dynamic,
        )
    };
    let bottom = w.add_body(&cube(0.5), Activation::Activate).unwrap();
    let top = w.add_body(&cube(1.52), Activation::Activate).unwrap();

    run(&mut w, &js, 400);
    assert!(!w.is_active(bottom).unwrap(), "stack should be asleep");
    assert!(!w.is_active(top).unwrap(), "stack should be asleep");

    // Waking one member wakes the whole island on the next step.
    w.add_impulse(top, Vec3::new(0.0, 40.0, 0.0)).unwrap();
    w.step(1.0 / 60.0, 1, &js).unwrap();
    assert!(w.is_active(top).unwrap());
    assert!(w.is_active(bottom).unwrap(), "impulse must wake the island, not one body");
}

// ============================================================================
// Test 5 — Ray casts: hit fraction matches geometry, misses miss
// ============================================================================

#[test]
fn test_ray_cast_sphere_fraction_and_miss() {
    let mut w = world();
    let ball = w
        .add_body(
            &BodyCreationSettings::new(Shape::sphere(1.0), RVec3::ZERO, MotionType::Static),
            Activation::Activate,
        )
        .unwrap();

    // From x = -5, a 10-unit ray through the center hits the surface at
    // distance 4 -> fraction 0.4.
    let hit = w
        .cast_ray(
            RayCast::new(RVec3::new(-5.0, 0.0, 0.0), RVec3::new(10.0, 0.0, 0.0)),
            &RayCastSettings::default(),
            &QueryFilter::any(),
        )
        .expect("should hit");
    assert_eq!(hit.body, ball);
    assert!((hit.fraction - 0.4).abs() < 1e-4, "fraction = {}", hit.fraction);

    // Perpendicular offset beyond the radius: no hit.
    let miss = w.cast_ray(
        RayCast::new(RVec3::new(-5.0, 1.5, 0.0), RVec3::new(10.0, 0.0, 0.0)),
        &RayCastSettings::default(),
        &QueryFilter::any(),
    );
    assert!(miss.is_none());
}

#[test]
fn test_ray_all_hits_sorted_by_fraction() {
    let mut w = world();
    for x in [4.0, 2.0, 6.0] {
        w.add_body(
            &BodyCreationSettings::new(
                Shape::sphere(0.5),
                RVec3::new(x, 0.0, 0.0),
                MotionType::Static,
            ),
            Activation::Activate,
        )
        .unwrap();
    }

    let hits = w
        .cast_ray_all(
            RayCast::new(RVec3::new(0.0, 0.0, 0.0), RVec3::new(10.0, 0.0, 0.0)),
            &RayCastSettings::default(),
            &QueryFilter::any(),
        )
        .sorted();
    assert_eq!(hits.len(), 3);
    assert!(hits[0].fraction < hits[1].fraction);
    assert!(hits[1].fraction < hits[2].fraction);
    // First surface along the ray is the sphere at x = 2.
    assert!((hits[0].fraction - 0.15).abs() < 1e-3);
}

// ============================================================================
// Test 6 — Removing a body invalidates its handle, even after slot reuse
// ============================================================================

#[test]
fn test_removed_body_handle_stays_invalid() {
    let mut w = world();
    let id = w.add_body(&sphere(RVec3::new(0.0, 1.0, 0.0), 0.0), Activation::Activate).unwrap();
    w.remove_body(id).unwrap();

    assert!(w.body(id).is_err());
    assert!(!w.is_valid(id));

    // Reuse the slot; the stale handle must still be rejected everywhere.
    let id2 = w.add_body(&sphere(RVec3::new(5.0, 1.0, 0.0), 0.0), Activation::Activate).unwrap();
    assert_eq!(id2.index(), id.index(), "slot should be recycled");
    assert!(w.body(id).is_err(), "stale handle resolved to a new body");
    assert!(w.add_impulse(id, Vec3::X).is_err());
    assert!(w.body(id2).is_ok());

    // Queries never return the removed body.
    let hit = w.cast_ray(
        RayCast::new(RVec3::new(0.0, 1.0, -5.0), RVec3::new(0.0, 0.0, 10.0)),
        &RayCastSettings::default(),
        &QueryFilter::any(),
    );
    assert!(hit.is_none(), "query hit a removed body's ghost");
}

// ============================================================================
// Test 7 — Character controller stands still on a flat floor
// ============================================================================

#[test]
fn test_character_stays_on_flat_floor() {
    let mut w = world();
    floor(&mut w);

    let mut character = CharacterVirtual::new(
        CharacterVirtualSettings::default(),
        // Capsule center: half_height + radius above the floor, plus a hair.
        RVec3::new(0.0, 0.95, 0.0),
        Quat::IDENTITY,
    );

    let gravity = w.gravity();
    let filter = QueryFilter::any();

    for _ in 0..10 {
        character.update(1.0 / 60.0, gravity, &filter, &mut w);
    }
    assert_eq!(character.ground_state(), GroundState::OnGround);
    let settled_y = character.position.y;

    for _ in 0..60 {
        character.update(1.0 / 60.0, gravity, &filter, &mut w);
    }
    assert_eq!(character.ground_state(), GroundState::OnGround);
    assert!(
        (character.position.y - settled_y).abs() < 0.02,
        "character drifted vertically: {} -> {}",
        settled_y,
        character.position.y
    );
}

#[test]
fn test_character_classifies_steep_ground() {
    let mut w = world();
    // A 70-degree ramp: steeper than the default 50-degree walkable limit.
    let normal = Vec3::new(-(70.0f32.to_radians().sin()), 70.0f32.to_radians().cos(), 0.0);
    w.add_body(
        &BodyCreationSettings::new(
            Shape::plane(normal.normalize(), 0.0),
            RVec3::ZERO,
            MotionType::Static,
        ),
        Activation::Activate,
    )
    .unwrap();

    let mut character = CharacterVirtual::new(
        CharacterVirtualSettings::default(),
        RVec3::new(0.0, 1.2, 0.0),
        Quat::IDENTITY,
    );
    let gravity = w.gravity();
    let filter = QueryFilter::any();
    for _ in 0..30 {
        character.update(1.0 / 60.0, gravity, &filter, &mut w);
    }
    assert_ne!(
        character.ground_state(),
        GroundState::OnGround,
        "a 70-degree slope must not classify as walkable ground"
    );
}

// ============================================================================
// Test 8 — Deterministic mode: identical runs are bit-identical
// ============================================================================

#[test]
fn test_deterministic_simulation_bit_identical() {
    fn simulate() -> Vec<(RVec3, Quat)> {
        let mut solver = SolverSettings::default();
        solver.deterministic_simulation = true;
        let mut w = PhysicsSystem::new(
            SimulationSettings::default(),
            solver,
            ObjectLayerPairTable::default(),
        )
        .unwrap();
        let js = jobs();

        floor(&mut w);
        let mut ids = Vec::new();
        for i in 0..10 {
            let s = BodyCreationSettings::new(
                Shape::cuboid(Vec3::splat(0.4)),
                RVec3::new(f64::from(i % 3) * 0.3, 1.0 + f64::from(i) * 0.9, 0.0),
                MotionType::Dynamic,
            );
            ids.push(w.add_body(&s, Activation::Activate).unwrap());
        }
        run(&mut w, &js, 120);
        ids.iter().map(|&id| {
            let b = w.body(id).unwrap();
            (b.position, b.rotation)
        }).collect()
    }

    let first = simulate();
    let second = simulate();
    for (i, (a, b)) in first.iter().zip(second.iter()).enumerate() {
        assert_eq!(a.0, b.0, "body {i} position diverged");
        assert_eq!(a.1, b.1, "body {i} rotation diverged");
    }
}

// ============================================================================
// Test 9 — Constraints couple bodies
// ============================================================================

#[test]
fn test_distance_constraint_limits_separation() {
    let mut w = world();
    let js = jobs();
    w.set_gravity(Vec3::ZERO);

    let a = w
        .add_body(
            &BodyCreationSettings::new(Shape::sphere(0.2), RVec3::ZERO, MotionType::Static),
            Activation::Activate,
        )
        .unwrap();
    let b = w.add_body(&sphere(RVec3::new(1.0, 0.0, 0.0), 0.0), Activation::Activate).unwrap();

    w.create_distance_constraint(
        a,
        b,
        &DistanceConstraintSettings {
            point1: RVec3::ZERO,
            point2: RVec3::new(1.0, 0.0, 0.0),
            min_distance: 0.0,
            max_distance: 1.5,
            spring: Default::default(),
        },
    )
    .unwrap();

    // Fling the tethered body away; the rope must stop it near max distance.
    w.set_linear_velocity(b, Vec3::new(10.0, 0.0, 0.0)).unwrap();
    run(&mut w, &js, 120);

    let dist = w.body(b).unwrap().position.length();
    assert!(dist < 1.8, "tethered body escaped to {dist}");
}

#[test]
fn test_hinge_motor_spins_wheel() {
    let mut w = world();
    let js = jobs();
    w.set_gravity(Vec3::ZERO);

    let anchor = w
        .add_body(
            &BodyCreationSettings::new(Shape::sphere(0.1), RVec3::ZERO, MotionType::Static),
            Activation::Activate,
        )
        .unwrap();
    let wheel = w
        .add_body(
            &BodyCreationSettings::new(
                Shape::cylinder(0.1, 0.5),
                RVec3::new(0.0, 0.0, 0.3),
                MotionType::Dynamic,
            ),
            Activation::Activate,
        )
        .unwrap();

    let hinge = w
        .create_hinge_constraint(
            anchor,
            wheel,
            &HingeConstraintSettings {
                point: RVec3::new(0.0, 0.0, 0.3),
                hinge_axis: Vec3::Y,
                motor: keel_physics::MotorSettings { target_velocity: 3.0, max_force: 50.0 },
                ..Default::default()
            },
        )
        .unwrap();

    run(&mut w, &js, 120);
    let spin = w.body(wheel).unwrap().angular_velocity.y;
    assert!((spin - 3.0).abs() < 0.3, "motor should reach target speed, spin = {spin}");

    w.remove_constraint(hinge).unwrap();
}

// ============================================================================
// Test 10 — Saturation flags are reported, not thrown
// ============================================================================

#[test]
fn test_saturation_is_reported_not_fatal() {
    let mut w = PhysicsSystem::new(
        SimulationSettings { max_bodies: 32, max_body_pairs: 2, max_contact_constraints: 2 },
        SolverSettings::default(),
        ObjectLayerPairTable::default(),
    )
    .unwrap();
    let js = jobs();
    floor(&mut w);

    for i in 0..6 {
        w.add_body(
            &sphere(RVec3::new(f64::from(i) * 0.8, 0.5, 0.0), 0.0),
            Activation::Activate,
        )
        .unwrap();
    }

    // The step must complete and flag the overflow.
    let result = w.step(1.0 / 60.0, 1, &js).unwrap();
    assert!(!result.is_ok(), "expected saturation flags, got {result:?}");
}

// ============================================================================
// Test 11 — Layer filtering is honored end to end
// ============================================================================

#[test]
fn test_layer_table_disables_collision() {
    let mut table = ObjectLayerPairTable::new(2);
    table.disable_collision(0, 1);
    let mut w =
        PhysicsSystem::new(SimulationSettings::default(), SolverSettings::default(), table)
            .unwrap();
    let js = jobs();

    // Floor on layer 0, ball on layer 1: they must pass through each other.
    w.add_body(
        &BodyCreationSettings::new(Shape::plane(Vec3::Y, 0.0), RVec3::ZERO, MotionType::Static)
            .with_object_layer(0),
        Activation::Activate,
    )
    .unwrap();
    let ghost = w
        .add_body(
            &sphere(RVec3::new(0.0, 2.0, 0.0), 0.0).with_object_layer(1),
            Activation::Activate,
        )
        .unwrap();

    run(&mut w, &js, 120);
    assert!(
        w.body(ghost).unwrap().position.y < -1.0,
        "filtered pair must not collide, y = {}",
        w.body(ghost).unwrap().position.y
    );
}

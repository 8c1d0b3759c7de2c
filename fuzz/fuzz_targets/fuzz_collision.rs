#![no_main]
use arbitrary::Arbitrary;
use keel_physics::prelude::*;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct CollisionInput {
    /// Two bodies' positions (close together to force collision)
    x1: i8,
    y1: i8,
    x2: i8,
    y2: i8,
    /// Shape selectors
    shape_a: u8,
    shape_b: u8,
    /// Steps to run
    steps: u8,
}

fn pick_shape(selector: u8) -> keel_physics::ShapeRef {
    match selector % 4 {
        0 => Shape::sphere(0.5),
        1 => Shape::cuboid(Vec3::splat(0.5)),
        2 => Shape::capsule(0.4, 0.3),
        _ => Shape::cylinder(0.4, 0.3),
    }
}

// Fuzz the narrowphase by placing bodies close together, including fully
// overlapping starts. Must never panic.
fuzz_target!(|input: CollisionInput| {
    let Ok(mut world) = PhysicsSystem::with_default_settings() else { return };
    let Ok(jobs) = JobSystem::new(JobSystemConfig { num_threads: 1, ..Default::default() }) else {
        return;
    };

    let a = BodyCreationSettings::new(
        pick_shape(input.shape_a),
        RVec3::new(f64::from(input.x1), f64::from(input.y1), 0.0),
        MotionType::Dynamic,
    );
    let b = BodyCreationSettings::new(
        pick_shape(input.shape_b),
        RVec3::new(f64::from(input.x2), f64::from(input.y2), 0.0),
        MotionType::Dynamic,
    );
    let _ = world.add_body(&a, Activation::Activate);
    let _ = world.add_body(&b, Activation::Activate);

    let steps = (input.steps as usize).min(64);
    for _ in 0..steps {
        let _ = world.step(1.0 / 60.0, 1, &jobs);
    }
});

#![no_main]
use arbitrary::Arbitrary;
use keel_physics::prelude::*;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    /// Number of bodies to add (capped)
    body_count: u8,
    /// Position components (i16 to keep values reasonable)
    positions: Vec<(i16, i16, i16)>,
    /// Shape selector per body
    shapes: Vec<u8>,
    /// Number of simulation steps (capped)
    step_count: u8,
}

// Fuzz the step pipeline: add random bodies and step.
// Must never panic regardless of input.
fuzz_target!(|input: FuzzInput| {
    let Ok(mut world) = PhysicsSystem::with_default_settings() else { return };
    let Ok(jobs) = JobSystem::new(JobSystemConfig { num_threads: 1, ..Default::default() }) else {
        return;
    };

    let body_count = (input.body_count as usize).min(16);
    for i in 0..body_count {
        let (px, py, pz) = input.positions.get(i).copied().unwrap_or((0, 0, 0));
        let shape = match input.shapes.get(i).copied().unwrap_or(0) % 4 {
            0 => Shape::sphere(0.5),
            1 => Shape::cuboid(Vec3::splat(0.5)),
            2 => Shape::capsule(0.4, 0.3),
            _ => Shape::cylinder(0.4, 0.3),
        };
        let settings = BodyCreationSettings::new(
            shape,
            RVec3::new(f64::from(px), f64::from(py), f64::from(pz)),
            MotionType::Dynamic,
        );
        let _ = world.add_body(&settings, Activation::Activate);
    }

    let steps = (input.step_count as usize).min(32);
    for _ in 0..steps {
        let _ = world.step(1.0 / 60.0, 1, &jobs);
    }
});

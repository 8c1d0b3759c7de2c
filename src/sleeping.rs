//! Activation / Sleep Management
//!
//! Bodies whose velocities stay below the configured thresholds accumulate
//! sleep time; when *every* body in an island has been idle for
//! `time_before_sleep`, the whole island is demoted to sleeping in one
//! transition. Partially sleeping islands are never produced — they would
//! leave contact state inconsistent.
//!
//! Sleeping bodies keep their broadphase proxies but are excluded from pair
//! generation and solving until something wakes them: an explicit activation
//! call, an impulse/force, or contact with an active body. Waking is always
//! island-transitive.
//!
//! Static bodies never participate; kinematic bodies are driven externally
//! every step they are meant to move and are not put to sleep by this
//! mechanism.

use crate::body::Body;
use crate::math::Vec3;

/// Sleep thresholds, extracted from the world's solver settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SleepSettings {
    /// Linear speed under which a body counts as idle (m/s)
    pub linear_threshold: f32,
    /// Angular speed under which a body counts as idle (rad/s)
    pub angular_threshold: f32,
    /// Idle time required before an island may sleep (s)
    pub time_before_sleep: f32,
}

impl Default for SleepSettings {
    fn default() -> Self {
        Self { linear_threshold: 0.03, angular_threshold: 0.03, time_before_sleep: 0.5 }
    }
}

/// True when the body's velocities are below the idle thresholds.
#[must_use]
pub fn body_is_idle(body: &Body, settings: &SleepSettings) -> bool {
    body.linear_velocity.length_squared()
        <= settings.linear_threshold * settings.linear_threshold
        && body.angular_velocity.length_squared()
            <= settings.angular_threshold * settings.angular_threshold
}

/// Advance one body's sleep timer. Returns the updated timer value; a
/// non-idle body resets to zero.
#[must_use]
pub fn advance_sleep_timer(body: &Body, dt: f32, settings: &SleepSettings) -> f32 {
    if body_is_idle(body, settings) {
        body.sleep_timer() + dt
    } else {
        0.0
    }
}

/// Whether a whole island may go to sleep: every dynamic member idle for the
/// full duration. `timers` are the members' already-advanced sleep timers.
#[must_use]
pub fn island_can_sleep(timers: &[f32], settings: &SleepSettings) -> bool {
    !timers.is_empty() && timers.iter().all(|&t| t >= settings.time_before_sleep)
}

/// State applied to a body when its island sleeps.
pub fn put_to_sleep(body: &mut Body) {
    body.set_active_flag(false);
    body.linear_velocity = Vec3::ZERO;
    body.angular_velocity = Vec3::ZERO;
}

/// State applied to a body when it wakes.
pub fn wake(body: &mut Body) {
    body.set_active_flag(true);
    body.reset_sleep_timer();
}

impl Body {
    pub(crate) fn sleep_timer(&self) -> f32 {
        self.sleep_timer
    }

    pub(crate) fn set_sleep_timer(&mut self, value: f32) {
        self.sleep_timer = value;
    }

    pub(crate) fn reset_sleep_timer(&mut self) {
        self.sleep_timer = 0.0;
    }

    pub(crate) fn set_active_flag(&mut self, active: bool) {
        self.active = active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{BodyCreationSettings, BodyStore, MotionType};
    use crate::math::RVec3;
    use crate::shape::Shape;

    fn make_body(motion: MotionType) -> Body {
        let mut store = BodyStore::new(4);
        let id = store
            .add(&BodyCreationSettings::new(Shape::sphere(1.0), RVec3::ZERO, motion))
            .unwrap();
        store.remove(id).unwrap()
    }

    fn settings() -> SleepSettings {
        SleepSettings { linear_threshold: 0.05, angular_threshold: 0.05, time_before_sleep: 0.5 }
    }

    #[test]
    fn test_idle_detection() {
        let mut body = make_body(MotionType::Dynamic);
        assert!(body_is_idle(&body, &settings()));

        body.linear_velocity = Vec3::new(1.0, 0.0, 0.0);
        assert!(!body_is_idle(&body, &settings()));

        body.linear_velocity = Vec3::ZERO;
        body.angular_velocity = Vec3::new(0.0, 1.0, 0.0);
        assert!(!body_is_idle(&body, &settings()));
    }

    #[test]
    fn test_timer_accumulates_and_resets() {
        let mut body = make_body(MotionType::Dynamic);
        let s = settings();

        let dt = 1.0 / 60.0;
        let mut t = 0.0;
        for _ in 0..10 {
            body.set_sleep_timer(t);
            t = advance_sleep_timer(&body, dt, &s);
        }
        assert!(t > 0.15 && t < 0.17, "t = {t}");

        body.linear_velocity = Vec3::new(1.0, 0.0, 0.0);
        body.set_sleep_timer(t);
        assert_eq!(advance_sleep_timer(&body, dt, &s), 0.0);
    }

    #[test]
    fn test_island_sleeps_only_when_all_idle() {
        let s = settings();
        assert!(island_can_sleep(&[0.6, 0.7, 0.5], &s));
        // One member still fresh: the island stays awake.
        assert!(!island_can_sleep(&[0.6, 0.1, 0.7], &s));
        assert!(!island_can_sleep(&[], &s));
    }

    #[test]
    fn test_put_to_sleep_zeroes_velocity() {
        let mut body = make_body(MotionType::Dynamic);
        body.linear_velocity = Vec3::new(0.01, 0.0, 0.0);
        put_to_sleep(&mut body);
        assert!(!body.is_active());
        assert_eq!(body.linear_velocity, Vec3::ZERO);

        wake(&mut body);
        assert!(body.is_active());
        assert_eq!(body.sleep_timer(), 0.0);
    }
}

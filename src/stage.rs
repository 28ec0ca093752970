//! Ramp schedules.
//!
//! A schedule is an ordered list of [`Stage`]s. Each stage ramps linearly from
//! the level reached by the previous stage to its own `target` over its
//! `duration`. The same schedule type drives both execution models: the
//! ramping-VUs executor reads targets as virtual-user counts, the arrival-rate
//! executor reads them as iterations per second.
//!
//! [`target_at`] is a pure function of the schedule and elapsed time, so a
//! given configuration always produces the same ramp; runs are reproducible
//! modulo the system under test.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One segment of a ramp schedule: ramp to `target` over `duration`.
///
/// Use `Stage::new(Duration::from_secs(60), 100.0)` to ramp to 100 over one
/// minute. A stage with `Duration::ZERO` jumps the level instantly, which is
/// how spikes and non-zero starting levels are expressed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub duration: Duration,
    /// Target level (virtual users or iterations per second).
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

/// Total wall-clock length of a schedule.
pub fn total_duration(stages: &[Stage]) -> Duration {
    stages.iter().map(|s| s.duration).sum()
}

/// Target level at `elapsed` time into the schedule.
///
/// Linear interpolation inside each stage, starting from level 0 before the
/// first stage. At a stage boundary the value is exactly that stage's target;
/// strictly past the end of the schedule the target is 0 (the run is over and
/// the pool drains).
pub fn target_at(stages: &[Stage], elapsed: Duration) -> f64 {
    let mut level = 0.0;
    let mut offset = Duration::ZERO;

    for stage in stages {
        if stage.duration.is_zero() {
            level = stage.target;
            continue;
        }
        let end = offset + stage.duration;
        if elapsed <= end {
            let t = (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
            return level + (stage.target - level) * t;
        }
        level = stage.target;
        offset = end;
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn boundary_values_are_exact() {
        let stages = vec![
            Stage::new(secs(60), 50.0),
            Stage::new(secs(60), 200.0),
            Stage::new(secs(30), 0.0),
        ];

        assert_eq!(target_at(&stages, secs(60)), 50.0);
        assert_eq!(target_at(&stages, secs(120)), 200.0);
        assert_eq!(target_at(&stages, secs(150)), 0.0);
    }

    #[test]
    fn ramp_is_strictly_monotonic_between_boundaries() {
        let stages = vec![Stage::new(secs(100), 100.0)];

        let mut previous = target_at(&stages, secs(1));
        for s in 2..100 {
            let current = target_at(&stages, secs(s));
            assert!(
                current > previous,
                "expected strict increase at t={s}: {previous} -> {current}"
            );
            previous = current;
        }

        let stages = vec![
            Stage::new(Duration::ZERO, 100.0),
            Stage::new(secs(100), 100.0),
            Stage::new(secs(100), 0.0),
        ];
        let mut previous = target_at(&stages, secs(101));
        for s in 102..200 {
            let current = target_at(&stages, secs(s));
            assert!(current < previous, "expected strict decrease at t={s}");
            previous = current;
        }
    }

    #[test]
    fn flat_stage_holds_level() {
        let stages = vec![
            Stage::new(Duration::ZERO, 75.0),
            Stage::new(secs(120), 75.0),
        ];

        for s in [0, 1, 30, 119, 120] {
            assert_eq!(target_at(&stages, secs(s)), 75.0);
        }
    }

    #[test]
    fn single_ramp_from_zero() {
        // 30s ramp to 100: halfway in, the target is half the final level.
        let stages = vec![Stage::new(secs(30), 100.0)];

        let midpoint = target_at(&stages, secs(15));
        assert!((midpoint - 50.0).abs() < 1e-9, "got {midpoint}");
        assert_eq!(target_at(&stages, secs(30)), 100.0);
    }

    #[test]
    fn past_the_schedule_target_is_zero() {
        let stages = vec![Stage::new(secs(30), 100.0)];

        assert_eq!(target_at(&stages, secs(30) + Duration::from_millis(1)), 0.0);
        assert_eq!(target_at(&stages, secs(3000)), 0.0);
        assert_eq!(target_at(&[], secs(1)), 0.0);
    }

    #[test]
    fn zero_duration_stage_jumps_instantly() {
        let stages = vec![
            Stage::new(Duration::ZERO, 500.0),
            Stage::new(secs(10), 500.0),
        ];

        assert_eq!(target_at(&stages, Duration::ZERO), 500.0);
        assert_eq!(target_at(&stages, secs(5)), 500.0);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let stages = vec![
            Stage::new(secs(13), 37.0),
            Stage::new(secs(7), 11.0),
        ];
        for ms in (0..20_000).step_by(137) {
            let t = Duration::from_millis(ms);
            assert_eq!(target_at(&stages, t), target_at(&stages, t));
        }
    }

    #[test]
    fn total_duration_sums_stages() {
        let stages = vec![
            Stage::new(Duration::ZERO, 10.0),
            Stage::new(secs(90), 10.0),
            Stage::new(secs(30), 0.0),
        ];
        assert_eq!(total_duration(&stages), secs(120));
    }
}

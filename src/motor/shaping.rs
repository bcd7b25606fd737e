// Stick shaping: deadzone, expo curve and slew-rate limiting
//
// Turns a raw controller sample into a bounded command whose per-tick change
// is capped, so a jerk on the stick never reaches the wheels as a step.

use crate::config::ControlConfig;
use crate::messages::StickSample;

/// Stick command after shaping, axes in [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShapedCommand {
    pub x: f32,
    pub y: f32,
}

impl ShapedCommand {
    pub const ZERO: ShapedCommand = ShapedCommand { x: 0.0, y: 0.0 };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapingParams {
    pub deadzone: f32,
    pub expo: f32,
    /// Max change per second on each axis
    pub slew_rate: f32,
    pub invert_x: bool,
    pub invert_y: bool,
}

impl From<&ControlConfig> for ShapingParams {
    fn from(config: &ControlConfig) -> Self {
        Self {
            deadzone: config.deadzone,
            expo: config.expo,
            slew_rate: config.slew_rate,
            invert_x: config.invert_x,
            invert_y: config.invert_y,
        }
    }
}

/// Deadzone then expo curve on one axis.
///
/// Values below `deadzone` in magnitude snap to exactly 0. Anything else is
/// remapped by `expo * v^3 + (1 - expo) * v`, which keeps the sign and the
/// endpoints (+-1 stays +-1) while softening small deflections.
pub fn curve(value: f32, deadzone: f32, expo: f32) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    let v = value.clamp(-1.0, 1.0);
    if v.abs() < deadzone {
        return 0.0;
    }
    expo * v * v * v + (1.0 - expo) * v
}

/// Move `previous` toward `target` by at most `max_step`
pub fn slew(target: f32, previous: f32, max_step: f32) -> f32 {
    target.clamp(previous - max_step, previous + max_step)
}

/// Shape one raw sample given the previous output and the elapsed time.
///
/// Pure: the result depends only on the arguments.
pub fn shape(
    raw: &StickSample,
    prev: ShapedCommand,
    dt: f32,
    params: &ShapingParams,
) -> ShapedCommand {
    let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
    let max_step = params.slew_rate * dt;

    let raw_x = if params.invert_x { -raw.x } else { raw.x };
    let raw_y = if params.invert_y { -raw.y } else { raw.y };

    let target_x = curve(raw_x, params.deadzone, params.expo);
    let target_y = curve(raw_y, params.deadzone, params.expo);

    ShapedCommand {
        x: slew(target_x, prev.x, max_step),
        y: slew(target_y, prev.y, max_step),
    }
}

/// Stateful wrapper that remembers the previous shaped output
#[derive(Debug, Clone)]
pub struct InputShaper {
    params: ShapingParams,
    prev: ShapedCommand,
}

impl InputShaper {
    pub fn new(params: ShapingParams) -> Self {
        Self {
            params,
            prev: ShapedCommand::ZERO,
        }
    }

    pub fn shape(&mut self, raw: &StickSample, dt: f32) -> ShapedCommand {
        self.prev = shape(raw, self.prev, dt, &self.params);
        self.prev
    }

    /// Drop back to rest, used whenever motion authority is withdrawn
    pub fn reset(&mut self) {
        self.prev = ShapedCommand::ZERO;
    }

    pub fn last(&self) -> ShapedCommand {
        self.prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ShapingParams {
        ShapingParams {
            deadzone: 0.08,
            expo: 0.3,
            slew_rate: 2.5,
            invert_x: false,
            invert_y: false,
        }
    }

    fn sample(x: f32, y: f32) -> StickSample {
        StickSample { x, y, timestamp: 0.0 }
    }

    #[test]
    fn test_deadzone_snaps_to_zero() {
        let p = params();
        for v in [0.0, 0.01, -0.05, 0.079, -0.079] {
            for w in [0.0, 0.03, -0.07] {
                let out = shape(&sample(v, w), ShapedCommand::ZERO, 1.0, &p);
                assert_eq!(out, ShapedCommand::ZERO, "input ({}, {})", v, w);
            }
        }
    }

    #[test]
    fn test_expo_curve() {
        // expo = 0 is linear
        assert_eq!(curve(0.5, 0.0, 0.0), 0.5);
        // endpoints preserved
        assert!((curve(1.0, 0.08, 0.3) - 1.0).abs() < 1e-6);
        assert!((curve(-1.0, 0.08, 0.3) + 1.0).abs() < 1e-6);
        // 0.3 * 0.125 + 0.7 * 0.5 = 0.3875
        assert!((curve(0.5, 0.08, 0.3) - 0.3875).abs() < 1e-6);
        assert!((curve(-0.5, 0.08, 0.3) + 0.3875).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_range_and_non_finite_inputs() {
        assert_eq!(curve(3.0, 0.08, 0.0), 1.0);
        assert_eq!(curve(-3.0, 0.08, 0.0), -1.0);
        assert_eq!(curve(f32::NAN, 0.08, 0.3), 0.0);
        assert_eq!(curve(f32::INFINITY, 0.08, 0.3), 0.0);
    }

    #[test]
    fn test_slew_limits_step_per_tick() {
        let p = params();
        let dt = 1.0 / 60.0;
        let max_step = p.slew_rate * dt;

        // Bang the stick between extremes and check every tick
        let inputs = [1.0, -1.0, 1.0, 0.0, 0.5, -0.9, 1.0, 1.0, 1.0, -1.0];
        let mut prev = ShapedCommand::ZERO;
        for (i, &v) in inputs.iter().cycle().take(200).enumerate() {
            let out = shape(&sample(v, -v), prev, dt, &p);
            assert!((out.x - prev.x).abs() <= max_step + 1e-6, "tick {}", i);
            assert!((out.y - prev.y).abs() <= max_step + 1e-6, "tick {}", i);
            prev = out;
        }
    }

    #[test]
    fn test_slew_reaches_target_eventually() {
        let mut shaper = InputShaper::new(params());
        let mut out = ShapedCommand::ZERO;
        // 0.4s at 2.5/s covers the full scale
        for _ in 0..30 {
            out = shaper.shape(&sample(0.0, 1.0), 1.0 / 60.0);
        }
        assert!((out.y - 1.0).abs() < 1e-5);
        assert_eq!(out.x, 0.0);
    }

    #[test]
    fn test_zero_dt_holds_previous() {
        let prev = ShapedCommand { x: 0.2, y: -0.4 };
        assert_eq!(shape(&sample(1.0, 1.0), prev, 0.0, &params()), prev);
        assert_eq!(shape(&sample(1.0, 1.0), prev, f32::NAN, &params()), prev);
    }

    #[test]
    fn test_inversion() {
        let mut p = params();
        p.invert_x = true;
        let out = shape(&sample(1.0, 1.0), ShapedCommand::ZERO, 10.0, &p);
        assert!((out.x + 1.0).abs() < 1e-6);
        assert!((out.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_returns_to_rest() {
        let mut shaper = InputShaper::new(params());
        shaper.shape(&sample(1.0, 1.0), 1.0);
        assert_ne!(shaper.last(), ShapedCommand::ZERO);
        shaper.reset();
        assert_eq!(shaper.last(), ShapedCommand::ZERO);
    }
}

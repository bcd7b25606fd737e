// Differential drive mixing for the two-wheel base
// Converts a shaped stick command (x = turn, y = throttle) into left/right wheel speeds.

use super::shaping::ShapedCommand;
use crate::config::ControlConfig;
use crate::messages::MotorCommand;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixingParams {
    pub turning_sensitivity: f32,
    pub speed_multiplier: f32,
    pub pure_rotation_speed: Option<u8>,
}

impl From<&ControlConfig> for MixingParams {
    fn from(config: &ControlConfig) -> Self {
        Self {
            turning_sensitivity: config.turning_sensitivity,
            speed_multiplier: config.speed_multiplier,
            pure_rotation_speed: config.pure_rotation_speed,
        }
    }
}

/// Mix a shaped command into wheel speeds.
///
/// `left = y + x * turning_sensitivity`, `right = y - x * turning_sensitivity`,
/// both normalized by `max(|left|, |right|, 1)` so the pair keeps its ratio
/// instead of clipping, then scaled to `100 * speed_multiplier`.
pub fn mix(cmd: ShapedCommand, turning_sensitivity: f32, speed_multiplier: f32) -> MotorCommand {
    let left = cmd.y + cmd.x * turning_sensitivity;
    let right = cmd.y - cmd.x * turning_sensitivity;

    let magnitude = left.abs().max(right.abs()).max(1.0);
    let scale = MotorCommand::MAX as f32 * speed_multiplier;

    MotorCommand::new(
        (left / magnitude * scale).round() as i32,
        (right / magnitude * scale).round() as i32,
    )
}

/// In-place turn at a fixed low speed when only the X axis is deflected
pub fn pure_rotation(cmd: ShapedCommand, speed: u8) -> Option<MotorCommand> {
    if cmd.y == 0.0 && cmd.x != 0.0 {
        let speed = speed as i32 * cmd.x.signum() as i32;
        Some(MotorCommand::new(speed, -speed))
    } else {
        None
    }
}

/// Pure rotation if enabled and applicable, normal mixing otherwise
pub fn mix_command(cmd: ShapedCommand, params: &MixingParams) -> MotorCommand {
    params
        .pure_rotation_speed
        .and_then(|speed| pure_rotation(cmd, speed))
        .unwrap_or_else(|| mix(cmd, params.turning_sensitivity, params.speed_multiplier))
}

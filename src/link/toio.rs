// toio Core Cube BLE protocol
//
// GATT characteristics used by the runtime:
//   motor  (write without response, notify) - timed motor control, speed feedback
//   sensor (notify)                         - motion detection incl. collision flag
//   config (write with response)            - collision threshold, feedback switches
//
// Reference: https://toio.github.io/toio-spec/en/docs/ble_motor/

use std::time::Duration;

use uuid::Uuid;

use crate::messages::MotorCommand;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x10b20100_5b3b_4571_9508_cf3efcd7bbae);
pub const MOTOR_CHAR_UUID: Uuid = Uuid::from_u128(0x10b20102_5b3b_4571_9508_cf3efcd7bbae);
pub const SENSOR_CHAR_UUID: Uuid = Uuid::from_u128(0x10b20106_5b3b_4571_9508_cf3efcd7bbae);
pub const CONFIG_CHAR_UUID: Uuid = Uuid::from_u128(0x10b201ff_5b3b_4571_9508_cf3efcd7bbae);

/// Motor control with a hold time, after which the cube stops by itself
const MOTOR_CONTROL_TIMED: u8 = 0x02;
const MOTOR_ID_LEFT: u8 = 0x01;
const MOTOR_ID_RIGHT: u8 = 0x02;

/// Motor speed notification header (motor characteristic)
const MOTOR_SPEED_INFO: u8 = 0xe0;

/// Motion detection notification header (sensor characteristic)
const MOTION_DETECTION: u8 = 0x01;

/// Config instructions
const CONFIG_COLLISION_THRESHOLD: u8 = 0x06;
const CONFIG_MOTOR_SPEED_INFO: u8 = 0x1c;

/// Motor speed units accepted by the cube (0-255); capped to the command range
const MAX_SPEED: u8 = 100;

/// Hold time is encoded in 10ms units, 0 meaning "until the next command"
const DURATION_UNIT_MS: u128 = 10;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward = 0x01,
    Backward = 0x02,
}

impl Direction {
    fn of(speed: i8) -> Self {
        if speed >= 0 {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Asynchronous robot-side readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorEvent {
    Collision,
    /// Measured wheel speeds, magnitude only
    MotorSpeed { left: u8, right: u8 },
}

/// Build the 8-byte timed motor control payload.
///
/// `[0x02, 0x01, dir_l, speed_l, 0x02, dir_r, speed_r, duration_10ms]`
pub fn motor_payload(cmd: MotorCommand, hold: Duration) -> [u8; 8] {
    let duration = (hold.as_millis() + DURATION_UNIT_MS / 2) / DURATION_UNIT_MS;
    [
        MOTOR_CONTROL_TIMED,
        MOTOR_ID_LEFT,
        Direction::of(cmd.left) as u8,
        cmd.left.unsigned_abs().min(MAX_SPEED),
        MOTOR_ID_RIGHT,
        Direction::of(cmd.right) as u8,
        cmd.right.unsigned_abs().min(MAX_SPEED),
        duration.min(u8::MAX as u128) as u8,
    ]
}

/// Collision detection sensitivity, 1 (most sensitive) to 10
pub fn collision_threshold_payload(threshold: u8) -> [u8; 3] {
    [CONFIG_COLLISION_THRESHOLD, 0x00, threshold.clamp(1, 10)]
}

/// Switch motor speed notifications on or off
pub fn motor_speed_feedback_payload(enabled: bool) -> [u8; 3] {
    [CONFIG_MOTOR_SPEED_INFO, 0x00, enabled as u8]
}

/// Decode a notification by the characteristic it arrived on
pub fn decode_notification(characteristic: Uuid, data: &[u8]) -> Option<SensorEvent> {
    if characteristic == SENSOR_CHAR_UUID {
        decode_motion(data)
    } else if characteristic == MOTOR_CHAR_UUID {
        decode_motor_speed(data)
    } else {
        None
    }
}

/// Motion detection: `[0x01, horizontal, collision, double_tap, posture, shake]`.
/// Only the collision byte matters; horizontal flips on tilt, not impacts.
fn decode_motion(data: &[u8]) -> Option<SensorEvent> {
    match data {
        [MOTION_DETECTION, _, 0x01, ..] => Some(SensorEvent::Collision),
        _ => None,
    }
}

/// Motor speed info: `[0xe0, left, right]`
fn decode_motor_speed(data: &[u8]) -> Option<SensorEvent> {
    match data {
        [MOTOR_SPEED_INFO, left, right, ..] => Some(SensorEvent::MotorSpeed {
            left: *left,
            right: *right,
        }),
        _ => None,
    }
}

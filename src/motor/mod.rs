// Stick-to-wheel pipeline for the two-wheel toio base
//
// Provides:
// - Input shaping (deadzone, expo, slew-rate limiting)
// - Differential drive mixing, including the low-speed pure rotation mode

pub mod mixing;
pub mod shaping;

pub use mixing::{MixingParams, mix, mix_command, pure_rotation};
pub use shaping::{InputShaper, ShapedCommand, ShapingParams, shape};

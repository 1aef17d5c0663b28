//! Signed-byte angle encoding for the legacy entity packets.
//!
//! The world model stores yaw/pitch as radians, but `named_entity_spawn`,
//! `entity_teleport` and `entity_head_rotation` carry angles as a single byte
//! in 1/256ths of a full turn. The exact transform below (including the odd
//! `+255` bias and the final negation for yaw) matches what 1.12.2 clients
//! expect; any deviation shows up as a ghost facing the wrong way.

use std::f64::consts::PI;

/// One encoding unit in radians (1/256 of a full turn).
pub const UNIT: f64 = PI / 128.0;

/// Encode a yaw in radians to the wire byte.
pub fn yaw_to_byte(yaw: f64) -> i8 {
    let scaled = (yaw / PI) * 128.0 + 255.0;
    (-((scaled % 256.0).floor() as i32 - 127)) as i8
}

/// Encode a pitch in radians to the wire byte.
pub fn pitch_to_byte(pitch: f64) -> i8 {
    ((((pitch / PI) * 128.0) % 256.0).floor() as i32) as i8
}

/// Decode a wire yaw byte back to radians in `[0, 2π)`.
///
/// Inverse of [`yaw_to_byte`] up to the encoding resolution; only used for
/// round-trip verification, the proxy itself never decodes angles.
pub fn byte_to_yaw(byte: i8) -> f64 {
    ((128 - byte as i32).rem_euclid(256)) as f64 * UNIT
}

/// Decode a wire pitch byte back to radians.
pub fn byte_to_pitch(byte: i8) -> f64 {
    byte as f64 * UNIT
}

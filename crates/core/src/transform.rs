//! Avatar position and look state.

use serde::{Deserialize, Serialize};

/// Position, look direction (radians) and ground flag of an avatar.
///
/// This is the entire slice of the bot's world model the proxy consumes: it is
/// updated from upstream `position` packets and replayed into ghost-entity and
/// camera-follow packets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub pitch: f64,
    pub on_ground: bool,
}

impl Transform {
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            ..Self::default()
        }
    }
}

//! Upstream avatar state, derived from observed packets.
//!
//! This is the slice of "bot world model" the proxy consumes: transform,
//! gamemode, health, held item and inventory — just enough to synthesize the
//! ghost entity and the initial-state snapshot for a joining client. It is an
//! instance field of the splice core, never module-level state, and is reset
//! whenever a new upstream session is bound.

use std::sync::RwLock;

use ghostlink_core::equipment::{
    EquipmentSnapshot, SLOT_BOOTS, SLOT_CHESTPLATE, SLOT_HELMET, SLOT_LEGGINGS, SLOT_MAIN_HAND,
    SLOT_OFF_HAND,
};
use ghostlink_core::packet::Packet;
use ghostlink_core::transform::Transform;
use serde_json::Value;

/// Window-0 slot layout of the 1.12.2 player inventory.
const WINDOW_SIZE: usize = 46;
const INV_HELMET: usize = 5;
const INV_CHESTPLATE: usize = 6;
const INV_LEGGINGS: usize = 7;
const INV_BOOTS: usize = 8;
const INV_HOTBAR_START: usize = 36;
const INV_OFF_HAND: usize = 45;

/// Everything we know about the upstream avatar.
#[derive(Clone, Debug)]
pub struct AvatarState {
    pub entity_id: Option<i64>,
    pub gamemode: i64,
    pub dimension: i64,
    pub difficulty: i64,
    pub max_players: i64,
    pub level_type: String,
    pub transform: Transform,
    pub health: f64,
    pub food: i64,
    pub food_saturation: f64,
    pub held_slot: i64,
    pub inventory: Vec<Value>,
    /// Last tab-list header/footer, replayed to joining clients.
    pub tab_header: Option<Value>,
    /// True once both `login` and the first authoritative `position` arrived.
    pub position_seen: bool,
}

impl Default for AvatarState {
    fn default() -> Self {
        Self {
            entity_id: None,
            gamemode: 0,
            dimension: 0,
            difficulty: 2,
            max_players: 20,
            level_type: "default".into(),
            transform: Transform::default(),
            health: 20.0,
            food: 20,
            food_saturation: 5.0,
            held_slot: 0,
            inventory: vec![Value::Null; WINDOW_SIZE],
            tab_header: None,
            position_seen: false,
        }
    }
}

/// Thread-safe tracker fed by the upstream packet pump.
///
/// Uses `std::sync::RwLock`: every operation is brief and no lock is ever
/// held across an await.
pub struct UpstreamTracker {
    state: RwLock<AvatarState>,
}

impl UpstreamTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AvatarState::default()),
        }
    }

    /// Forget everything; called when a fresh upstream session is bound.
    pub fn reset(&self) {
        *self.state.write().expect("tracker poisoned") = AvatarState::default();
    }

    /// Fold one upstream packet into the avatar state.
    pub fn observe(&self, packet: &Packet) {
        let mut state = self.state.write().expect("tracker poisoned");
        match packet.name.as_str() {
            "login" => {
                state.entity_id = packet.int("entityId");
                state.gamemode = packet.int("gameMode").unwrap_or(0);
                state.dimension = packet.int("dimension").unwrap_or(0);
                state.difficulty = packet.int("difficulty").unwrap_or(2);
                state.max_players = packet.int("maxPlayers").unwrap_or(20);
                if let Some(level_type) = packet.text("levelType") {
                    state.level_type = level_type.to_string();
                }
            }
            "position" => {
                // Authoritative teleport. Wire carries degrees; the model
                // keeps radians.
                state.transform = Transform {
                    x: packet.float("x").unwrap_or(state.transform.x),
                    y: packet.float("y").unwrap_or(state.transform.y),
                    z: packet.float("z").unwrap_or(state.transform.z),
                    yaw: packet.float("yaw").unwrap_or(0.0).to_radians(),
                    pitch: packet.float("pitch").unwrap_or(0.0).to_radians(),
                    on_ground: state.transform.on_ground,
                };
                state.position_seen = true;
            }
            "respawn" => {
                state.dimension = packet.int("dimension").unwrap_or(state.dimension);
                state.gamemode = packet.int("gamemode").unwrap_or(state.gamemode);
                state.difficulty = packet.int("difficulty").unwrap_or(state.difficulty);
                if let Some(level_type) = packet.text("levelType") {
                    state.level_type = level_type.to_string();
                }
                // The new world is not loaded until the follow-up position.
                state.position_seen = false;
            }
            "update_health" => {
                state.health = packet.float("health").unwrap_or(state.health);
                state.food = packet.int("food").unwrap_or(state.food);
                state.food_saturation = packet
                    .float("foodSaturation")
                    .unwrap_or(state.food_saturation);
            }
            "held_item_slot" => {
                state.held_slot = packet.int("slot").unwrap_or(state.held_slot);
            }
            "window_items" => {
                if packet.int("windowId") == Some(0) {
                    if let Some(Value::Array(items)) = packet.data.get("items") {
                        for (i, item) in items.iter().take(WINDOW_SIZE).enumerate() {
                            state.inventory[i] = normalize_item(item);
                        }
                    }
                }
            }
            "set_slot" => {
                if packet.int("windowId") == Some(0) {
                    if let Some(slot) = packet.int("slot") {
                        let slot = slot as usize;
                        if slot < WINDOW_SIZE {
                            let item = packet.data.get("item").cloned().unwrap_or(Value::Null);
                            state.inventory[slot] = normalize_item(&item);
                        }
                    }
                }
            }
            "difficulty" => {
                state.difficulty = packet.int("difficulty").unwrap_or(state.difficulty);
            }
            "playerlist_header" => {
                state.tab_header = Some(packet.data.clone());
            }
            "game_state_change" => {
                // Reason 3 = gamemode change.
                if packet.int("reason") == Some(3) {
                    if let Some(mode) = packet.float("gameMode") {
                        state.gamemode = mode as i64;
                    }
                }
            }
            _ => {}
        }
    }

    /// True once the avatar is fully in-world: logged in and positioned.
    pub fn spawned(&self) -> bool {
        let state = self.state.read().expect("tracker poisoned");
        state.entity_id.is_some() && state.position_seen
    }

    pub fn entity_id(&self) -> Option<i64> {
        self.state.read().expect("tracker poisoned").entity_id
    }

    pub fn transform(&self) -> Transform {
        self.state.read().expect("tracker poisoned").transform
    }

    pub fn snapshot(&self) -> AvatarState {
        self.state.read().expect("tracker poisoned").clone()
    }

    /// The avatar's visible equipment, derived from the inventory window.
    pub fn equipment(&self) -> EquipmentSnapshot {
        let state = self.state.read().expect("tracker poisoned");
        let mut snapshot = EquipmentSnapshot::new();
        let held = (INV_HOTBAR_START as i64 + state.held_slot.clamp(0, 8)) as usize;
        snapshot.set(SLOT_MAIN_HAND, state.inventory[held].clone());
        snapshot.set(SLOT_OFF_HAND, state.inventory[INV_OFF_HAND].clone());
        snapshot.set(SLOT_BOOTS, state.inventory[INV_BOOTS].clone());
        snapshot.set(SLOT_LEGGINGS, state.inventory[INV_LEGGINGS].clone());
        snapshot.set(SLOT_CHESTPLATE, state.inventory[INV_CHESTPLATE].clone());
        snapshot.set(SLOT_HELMET, state.inventory[INV_HELMET].clone());
        snapshot
    }
}

impl Default for UpstreamTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The wire encodes an empty slot as `{"blockId": -1}`; the model uses null.
fn normalize_item(item: &Value) -> Value {
    if item.is_null() || item.get("blockId").and_then(Value::as_i64) == Some(-1) {
        Value::Null
    } else {
        item.clone()
    }
}

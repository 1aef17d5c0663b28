//! Equipment snapshot and differ for the ghost entity.
//!
//! The protocol has no "sync whole equipment" packet: each of the six visible
//! slots is its own `entity_equipment` message, and re-sending an unchanged
//! slot makes the item visibly flicker on observer clients. So the ghost layer
//! keeps the last snapshot it broadcast and only emits the slots that actually
//! changed.

use serde_json::Value;

/// Wire slot ids used by `entity_equipment` in the 1.12.2 protocol.
pub const SLOT_MAIN_HAND: usize = 0;
pub const SLOT_OFF_HAND: usize = 1;
pub const SLOT_BOOTS: usize = 2;
pub const SLOT_LEGGINGS: usize = 3;
pub const SLOT_CHESTPLATE: usize = 4;
pub const SLOT_HELMET: usize = 5;

pub const SLOT_COUNT: usize = 6;

/// The six visible equipment slots. `Value::Null` means the slot is empty;
/// packet synthesis maps that to the wire's `{"blockId": -1}` empty-slot record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EquipmentSnapshot {
    slots: [Value; SLOT_COUNT],
}

impl EquipmentSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, slot: usize, item: Value) {
        if slot < SLOT_COUNT {
            self.slots[slot] = item;
        }
    }

    pub fn get(&self, slot: usize) -> &Value {
        &self.slots[slot]
    }

    /// Slots where `self` differs from `last`, as `(wire slot id, new item)`.
    ///
    /// Deep equality on the item records: two stacks with the same fields in a
    /// different order still compare equal, so cosmetic re-serialization never
    /// causes a broadcast.
    pub fn diff(&self, last: &EquipmentSnapshot) -> Vec<(usize, Value)> {
        let mut changed = Vec::new();
        for slot in 0..SLOT_COUNT {
            if self.slots[slot] != last.slots[slot] {
                changed.push((slot, self.slots[slot].clone()));
            }
        }
        changed
    }

    /// The item record as it appears on the wire (`{"blockId": -1}` for empty).
    pub fn wire_item(&self, slot: usize) -> Value {
        wire_item(&self.slots[slot])
    }
}

/// Map a snapshot item to the wire's slot record.
pub fn wire_item(item: &Value) -> Value {
    if item.is_null() {
        serde_json::json!({ "blockId": -1 })
    } else {
        item.clone()
    }
}

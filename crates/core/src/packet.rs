//! The `(name, data)` packet shape shared by every session.
//!
//! The legacy 1.12.2 protocol is consumed through a codec library that frames
//! raw bytes into named, structured packets. We keep that shape verbatim: a
//! string name (`"position"`, `"entity_teleport"`, `"use_entity"`, ...) plus a
//! JSON-like record whose field names match the wire schema byte-for-byte.
//! Real game clients parse these fields by name, so nothing in the proxy may
//! rename or re-nest them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single named packet flowing through a session, either direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub name: String,
    pub data: Value,
}

impl Packet {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Read an integer field by wire name.
    pub fn int(&self, field: &str) -> Option<i64> {
        self.data.get(field).and_then(Value::as_i64)
    }

    /// Read a float field by wire name.
    pub fn float(&self, field: &str) -> Option<f64> {
        self.data.get(field).and_then(Value::as_f64)
    }

    /// Read a string field by wire name.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// The `entityId` field, present on most entity-scoped packets.
    pub fn entity_id(&self) -> Option<i64> {
        self.int("entityId")
    }

    /// Rewrite every reference to `from` in the entity-id fields to `to`.
    ///
    /// Covers the scalar `entityId` field and the `entityIds` array carried by
    /// `entity_destroy`. Returns true if anything changed.
    pub fn rewrite_entity_id(&mut self, from: i64, to: i64) -> bool {
        let mut changed = false;
        if let Some(id) = self.data.get_mut("entityId") {
            if id.as_i64() == Some(from) {
                *id = Value::from(to);
                changed = true;
            }
        }
        if let Some(Value::Array(ids)) = self.data.get_mut("entityIds") {
            for id in ids {
                if id.as_i64() == Some(from) {
                    *id = Value::from(to);
                    changed = true;
                }
            }
        }
        changed
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

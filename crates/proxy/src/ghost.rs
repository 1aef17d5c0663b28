//! Fake-entity substitution layer.
//!
//! Non-controlling observers never see the world through the bot's session;
//! they see a synthetic "ghost" player entity that mirrors the bot's real
//! position and equipment. Each observer also carries a small camera state
//! machine: free-flying spectator, pinned to the ghost's point of view, or
//! (for the single linked client) controlling, in which case the ghost is
//! despawned for them.
//!
//! All mutation happens from synchronous sections of async tasks; no lock is
//! held across an await. The one genuinely time-based behavior — waiting for
//! a new world to finish loading after a respawn — runs on its own task and
//! re-validates the layer's state when it wakes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use ghostlink_core::angle;
use ghostlink_core::equipment::EquipmentSnapshot;
use ghostlink_core::link::{CameraMode, ClientId};
use ghostlink_core::packet::Packet;
use ghostlink_core::transform::Transform;
use serde_json::json;
use tokio::sync::watch;

use crate::net::session::{Identity, Session};
use crate::tracker::UpstreamTracker;

/// Reserved entity id for the ghost, distinct from every real entity the
/// backend allocates.
pub const GHOST_ENTITY_ID: i64 = 9999;

/// How long a respawned world gets to produce its first position packet
/// before the ghost stays down.
pub const WORLD_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-observer camera record.
struct CameraRegistration {
    session: Arc<Session>,
    mode: CameraMode,
    /// Whether the ghost is currently spawned on this observer's client.
    spawned_for: bool,
    /// Last client-reported transform, for teleport-back after bot-POV.
    last_transform: Option<Transform>,
}

#[derive(Default)]
struct GhostState {
    /// The upstream identity the ghost impersonates. None = no upstream.
    bot: Option<Identity>,
    /// Ghost is currently spawned for subscribed observers.
    visible: bool,
    /// Between a respawn and the next authoritative position packet.
    world_changing: bool,
    /// A world change timed out: the position listener is detached and the
    /// ghost stays down until the next world change re-arms it.
    detached: bool,
    /// Equipment as last broadcast; the differ's baseline.
    equipment: EquipmentSnapshot,
}

pub struct GhostLayer {
    tracker: Arc<UpstreamTracker>,
    observers: DashMap<ClientId, CameraRegistration>,
    state: RwLock<GhostState>,
    /// Bumped on every authoritative position while a world change is pending.
    position_epoch: watch::Sender<u64>,
    teleport_id: AtomicI64,
}

impl GhostLayer {
    pub fn new(tracker: Arc<UpstreamTracker>) -> Self {
        let (position_epoch, _) = watch::channel(0);
        Self {
            tracker,
            observers: DashMap::new(),
            state: RwLock::new(GhostState::default()),
            position_epoch,
            teleport_id: AtomicI64::new(1),
        }
    }

    fn lock(&self) -> std::sync::RwLockWriteGuard<'_, GhostState> {
        self.state.write().expect("ghost state poisoned")
    }

    /// Bind a fresh upstream identity. The ghost stays invisible until the
    /// avatar produces its first position.
    pub fn bind_bot(&self, identity: Identity) {
        let mut state = self.lock();
        state.bot = Some(identity);
        state.visible = false;
        state.world_changing = false;
        state.detached = false;
        state.equipment = EquipmentSnapshot::new();
    }

    /// Upstream is gone: despawn everywhere and forget the identity.
    pub fn clear_bot(&self) {
        self.despawn_all();
        let mut state = self.lock();
        state.bot = None;
        state.visible = false;
        state.world_changing = false;
    }

    // ── Observer registry ───────────────────────────────────────────────

    /// Put a freshly connected client into spectator mode and subscribe it
    /// to the ghost.
    pub fn register_spectator(&self, session: Arc<Session>) {
        let id = session.id();
        if self.observers.contains_key(&id) {
            tracing::warn!("{} already has a camera registration", session.username());
            return;
        }
        self.observers.insert(
            id,
            CameraRegistration {
                session: Arc::clone(&session),
                mode: CameraMode::Spectator,
                spawned_for: false,
                last_transform: None,
            },
        );
        self.apply_spectator_state(id);
    }

    /// Drop a disconnected observer. No packets: the client is gone.
    pub fn unregister(&self, client: ClientId) {
        self.observers.remove(&client);
    }

    pub fn mode_of(&self, client: ClientId) -> Option<CameraMode> {
        self.observers.get(&client).map(|reg| reg.mode)
    }

    /// Whether this observer currently receives ghost entity updates.
    pub fn subscribed(&self, client: ClientId) -> bool {
        self.observers
            .get(&client)
            .map(|reg| reg.spawned_for)
            .unwrap_or(false)
    }

    /// Remember where a spectating client reported itself; used to teleport
    /// it back when it leaves bot-POV.
    pub fn record_client_transform(&self, client: ClientId, transform: Transform) {
        if let Some(mut reg) = self.observers.get_mut(&client) {
            if reg.mode == CameraMode::Spectator {
                reg.last_transform = Some(transform);
            }
        }
    }

    // ── Upstream event intake ───────────────────────────────────────────

    /// Fold one upstream packet into the ghost. Called by the splice core's
    /// upstream pump after the tracker has observed the packet.
    pub fn observe_upstream(self: &Arc<Self>, packet: &Packet) {
        match packet.name.as_str() {
            "position" => self.on_position(),
            "respawn" => self.on_world_change(),
            "window_items" | "set_slot" | "held_item_slot" => {
                self.sync_equipment();
            }
            _ => {}
        }
    }

    fn on_position(self: &Arc<Self>) {
        {
            let state = self.lock();
            if state.bot.is_none() {
                return;
            }
            if state.world_changing {
                // Signal the respawn watcher; the ghost stays down until it
                // re-spawns everyone at once.
                drop(state);
                self.position_epoch.send_modify(|epoch| *epoch += 1);
                return;
            }
            if state.detached {
                return;
            }
            if state.visible {
                drop(state);
                self.broadcast_move();
                return;
            }
        }
        // First position of a fresh session: the avatar just spawned.
        self.become_visible();
    }

    /// Despawn everywhere, then wait up to [`WORLD_LOAD_TIMEOUT`] for the new
    /// world's first position packet. Re-spawn for every previously
    /// subscribed observer on arrival, or stay down on timeout — the ghost is
    /// never visible to only part of the audience.
    fn on_world_change(self: &Arc<Self>) {
        let epoch_rx = {
            let mut state = self.lock();
            if state.bot.is_none() {
                return;
            }
            state.world_changing = true;
            state.visible = false;
            state.detached = false;
            // Subscribing here marks the current epoch as seen, so the
            // watcher only wakes for a position that arrives after this
            // respawn.
            self.position_epoch.subscribe()
        };
        self.despawn_all();

        let ghost = Arc::clone(self);
        tokio::spawn(async move {
            let mut epoch_rx = epoch_rx;
            let loaded = tokio::time::timeout(WORLD_LOAD_TIMEOUT, epoch_rx.changed()).await;
            {
                let mut state = ghost.lock();
                if !state.world_changing || state.bot.is_none() {
                    return; // superseded by stop/clear
                }
                state.world_changing = false;
                match loaded {
                    Ok(Ok(())) => state.visible = true,
                    _ => {
                        tracing::debug!("world never finished loading, ghost stays despawned");
                        state.detached = true;
                        return;
                    }
                }
            }
            ghost.spawn_for_all();
        });
    }

    fn become_visible(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            state.visible = true;
            state.equipment = self.tracker.equipment();
        }
        self.spawn_for_all();
    }

    // ── Spawning / despawning ───────────────────────────────────────────

    fn spawn_for_all(&self) {
        for mut entry in self.observers.iter_mut() {
            if entry.mode != CameraMode::Controlling && !entry.spawned_for {
                self.spawn_for(entry.value_mut());
            }
        }
    }

    fn despawn_all(&self) {
        for mut entry in self.observers.iter_mut() {
            if entry.spawned_for {
                self.despawn_for(entry.value_mut());
            }
        }
    }

    fn spawn_for(&self, reg: &mut CameraRegistration) {
        let (bot, equipment) = {
            let state = self.state.read().expect("ghost state poisoned");
            let Some(bot) = state.bot.clone() else { return };
            (bot, state.equipment.clone())
        };
        let avatar = self.tracker.snapshot();
        let t = avatar.transform;

        reg.session.write(
            "player_info",
            json!({
                "action": 0,
                "data": [{
                    "UUID": bot.uuid,
                    "name": bot.username,
                    "properties": [],
                    "gamemode": avatar.gamemode,
                    "ping": 0
                }]
            }),
        );
        reg.session.write(
            "named_entity_spawn",
            json!({
                "entityId": GHOST_ENTITY_ID,
                "playerUUID": bot.uuid,
                "x": t.x,
                "y": t.y,
                "z": t.z,
                "yaw": angle::yaw_to_byte(t.yaw),
                "pitch": angle::pitch_to_byte(t.pitch),
                "metadata": []
            }),
        );
        reg.session.write(
            "entity_head_rotation",
            json!({
                "entityId": GHOST_ENTITY_ID,
                "headYaw": angle::yaw_to_byte(t.yaw)
            }),
        );
        for slot in 0..ghostlink_core::equipment::SLOT_COUNT {
            if !equipment.get(slot).is_null() {
                reg.session.write(
                    "entity_equipment",
                    json!({
                        "entityId": GHOST_ENTITY_ID,
                        "slot": slot,
                        "item": equipment.wire_item(slot)
                    }),
                );
            }
        }
        reg.spawned_for = true;
    }

    fn despawn_for(&self, reg: &mut CameraRegistration) {
        reg.session.write(
            "entity_destroy",
            json!({ "entityIds": [GHOST_ENTITY_ID] }),
        );
        reg.spawned_for = false;
    }

    // ── Movement & equipment broadcast ──────────────────────────────────

    fn broadcast_move(&self) {
        let t = self.tracker.transform();
        let yaw = angle::yaw_to_byte(t.yaw);
        let pitch = angle::pitch_to_byte(t.pitch);

        for entry in self.observers.iter() {
            if entry.spawned_for {
                entry.session.write(
                    "entity_teleport",
                    json!({
                        "entityId": GHOST_ENTITY_ID,
                        "x": t.x,
                        "y": t.y,
                        "z": t.z,
                        "yaw": yaw,
                        "pitch": pitch,
                        "onGround": t.on_ground
                    }),
                );
                entry.session.write(
                    "entity_head_rotation",
                    json!({ "entityId": GHOST_ENTITY_ID, "headYaw": yaw }),
                );
            }
            if entry.mode == CameraMode::BotPov {
                self.write_position(&entry.session, t);
            }
        }
    }

    /// Diff the avatar's equipment against the last broadcast and emit only
    /// the changed slots. Returns how many slot packets went out per
    /// observer; calling twice with no inventory change sends nothing.
    pub fn sync_equipment(&self) -> usize {
        let desired = self.tracker.equipment();
        let changed = {
            let mut state = self.lock();
            if !state.visible {
                // Keep the baseline current so the next spawn carries the
                // right items.
                state.equipment = desired;
                return 0;
            }
            let changed = desired.diff(&state.equipment);
            state.equipment = desired;
            changed
        };
        if changed.is_empty() {
            return 0;
        }
        for entry in self.observers.iter() {
            if !entry.spawned_for {
                continue;
            }
            for (slot, item) in &changed {
                entry.session.write(
                    "entity_equipment",
                    json!({
                        "entityId": GHOST_ENTITY_ID,
                        "slot": slot,
                        "item": ghostlink_core::equipment::wire_item(item)
                    }),
                );
            }
        }
        changed.len()
    }

    // ── Camera state machine ────────────────────────────────────────────

    /// `SPECTATOR -> BOT_POV`: pin the observer's camera to the ghost.
    /// Re-entering while already in bot-POV is an idempotent reset.
    pub fn enter_pov(&self, client: ClientId) -> Result<(), String> {
        let Some(mut reg) = self.observers.get_mut(&client) else {
            return Err("No camera registration for this connection!".into());
        };
        match reg.mode {
            CameraMode::Controlling => {
                return Err("Cannot view the bot while in control!".into());
            }
            CameraMode::BotPov => {
                tracing::warn!(
                    "{} re-entered bot POV while already viewing",
                    reg.session.username()
                );
            }
            CameraMode::Spectator => {
                if !reg.spawned_for {
                    return Err("The bot is not in the world yet!".into());
                }
                reg.mode = CameraMode::BotPov;
            }
        }
        reg.session
            .write("camera", json!({ "cameraId": GHOST_ENTITY_ID }));
        let t = self.tracker.transform();
        self.write_position(&reg.session, t);
        Ok(())
    }

    /// `BOT_POV -> SPECTATOR`: release the camera and teleport the observer
    /// back to where it was before viewing.
    pub fn exit_pov(&self, client: ClientId) -> Result<(), String> {
        let Some(mut reg) = self.observers.get_mut(&client) else {
            return Err("No camera registration for this connection!".into());
        };
        if reg.mode != CameraMode::BotPov {
            return Err("Not viewing the bot!".into());
        }
        let own_entity = self.tracker.entity_id().unwrap_or(0);
        reg.session.write("camera", json!({ "cameraId": own_entity }));
        if let Some(back) = reg.last_transform {
            self.write_position(&reg.session, back);
        }
        reg.mode = CameraMode::Spectator;
        Ok(())
    }

    /// Teleport a free-flying spectator to the ghost's location.
    pub fn teleport_to_ghost(&self, client: ClientId) -> Result<(), String> {
        let Some(reg) = self.observers.get(&client) else {
            return Err("No camera registration for this connection!".into());
        };
        if reg.mode != CameraMode::Spectator {
            return Err("Can only teleport while spectating!".into());
        }
        let t = self.tracker.transform();
        self.write_position(&reg.session, t);
        Ok(())
    }

    /// `* -> CONTROLLING` on link: the controller sees the world through the
    /// bot's own session, so the ghost disappears for it and its
    /// gamemode/abilities revert to the bot's real ones.
    pub fn make_controller(&self, client: ClientId) {
        let Some(mut reg) = self.observers.get_mut(&client) else {
            return;
        };
        if reg.spawned_for {
            self.despawn_for(reg.value_mut());
        }
        reg.mode = CameraMode::Controlling;
        let avatar = self.tracker.snapshot();
        reg.session.write(
            "game_state_change",
            json!({ "reason": 3, "gameMode": avatar.gamemode as f64 }),
        );
        reg.session.write(
            "abilities",
            json!({
                "flags": abilities_flags(avatar.gamemode),
                "flyingSpeed": 0.05,
                "walkingSpeed": 0.1
            }),
        );
    }

    /// `CONTROLLING -> SPECTATOR` on unlink: back to free-flight and ghost
    /// subscription.
    pub fn restore_spectator(&self, client: ClientId) {
        if !self.observers.contains_key(&client) {
            return; // disconnected in the meantime
        }
        if let Some(mut reg) = self.observers.get_mut(&client) {
            reg.mode = CameraMode::Spectator;
        }
        self.apply_spectator_state(client);
    }

    fn apply_spectator_state(&self, client: ClientId) {
        let Some(mut reg) = self.observers.get_mut(&client) else {
            return;
        };
        reg.session.write(
            "game_state_change",
            json!({ "reason": 3, "gameMode": 3.0 }),
        );
        reg.session.write(
            "abilities",
            json!({ "flags": 7, "flyingSpeed": 0.05, "walkingSpeed": 0.1 }),
        );
        let visible = self.state.read().expect("ghost state poisoned").visible;
        if visible && !reg.spawned_for {
            self.spawn_for(reg.value_mut());
        }
    }

    fn write_position(&self, session: &Session, t: Transform) {
        session.write(
            "position",
            json!({
                "x": t.x,
                "y": t.y,
                "z": t.z,
                "yaw": t.yaw.to_degrees(),
                "pitch": t.pitch.to_degrees(),
                "flags": 0,
                "teleportId": self.teleport_id.fetch_add(1, Ordering::Relaxed)
            }),
        );
    }
}

/// 1.12.2 abilities bitmask for a gamemode: invulnerable 0x1, flying 0x2,
/// allow-flying 0x4, creative 0x8.
fn abilities_flags(gamemode: i64) -> i64 {
    match gamemode {
        1 => 0x0D, // creative: invulnerable + allow flying + instabuild
        3 => 0x07, // spectator: invulnerable + flying + allow flying
        _ => 0x00,
    }
}

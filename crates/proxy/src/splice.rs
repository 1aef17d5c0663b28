//! Connection splice core.
//!
//! Owns the single upstream session, the registry of downstream clients, and
//! the link state. Raw traffic flows bidirectionally between the upstream and
//! at most one linked client; every other client gets the filtered spectator
//! feed (entity packets about the bot rewritten to the ghost id, control-only
//! packets dropped).
//!
//! Link state discipline: the state is re-read freshly at every decision
//! point. Nothing captured before an await is trusted after it; an operation
//! whose precondition no longer holds after a sleep bails out and undoes its
//! cosmetic side effects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use ghostlink_core::link::{ClientId, LinkDenied, LinkState};
use ghostlink_core::packet::Packet;
use ghostlink_core::transform::Transform;
use serde_json::json;
use tokio::sync::broadcast;

use crate::command::CommandRegistry;
use crate::ghost::{GHOST_ENTITY_ID, GhostLayer};
use crate::lifecycle::LifecycleEvent;
use crate::net::session::{EndKind, Session, SessionEvent};
use crate::tracker::UpstreamTracker;

/// Pause between reverting a client's camera/gamemode and binding the raw
/// packet flow, so the client-side render settles before the authoritative
/// snapshot lands. An ordering delay, not a lock.
pub const LINK_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Poll interval while waiting for the upstream avatar to spawn.
pub const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Middleware verdict for one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Drop,
}

/// Context handed to middleware alongside the (mutable) packet.
pub struct MiddlewareCtx {
    pub client: ClientId,
    pub is_controller: bool,
}

pub type Middleware = Arc<dyn Fn(&mut Packet, &MiddlewareCtx) -> Verdict + Send + Sync>;

/// Per-client filter chains, both directions.
#[derive(Clone, Default)]
pub struct MiddlewareChains {
    pub to_client: Vec<Middleware>,
    pub to_server: Vec<Middleware>,
}

impl MiddlewareChains {
    /// The chains every client gets: keep-alive and time-sync traffic is
    /// answered by the synthetic client-side session, so forwarding it to or
    /// from the controller would produce duplicate responses and get the
    /// session kicked for a protocol violation.
    pub fn standard() -> Self {
        let suppress_sync: Middleware = Arc::new(|packet, ctx| {
            if ctx.is_controller && matches!(packet.name.as_str(), "keep_alive" | "update_time") {
                Verdict::Drop
            } else {
                Verdict::Forward
            }
        });
        let suppress_client_sync: Middleware = Arc::new(|packet, _ctx| {
            if packet.name == "keep_alive" {
                Verdict::Drop
            } else {
                Verdict::Forward
            }
        });
        Self {
            to_client: vec![suppress_sync],
            to_server: vec![suppress_client_sync],
        }
    }
}

/// Server→client packets that only make sense for the session owner; the
/// spectator feed drops them (spectators get their own synthesized versions
/// from the ghost layer).
const SPECTATOR_SUPPRESSED: &[&str] = &[
    "keep_alive",
    "login",
    "position",
    "respawn",
    "update_health",
    "experience",
    "held_item_slot",
    "window_items",
    "set_slot",
    "open_window",
    "close_window",
    "transaction",
    "abilities",
    "game_state_change",
    "camera",
];

struct ClientEntry {
    session: Arc<Session>,
    chains: MiddlewareChains,
    initial_sent: Arc<AtomicBool>,
}

pub struct SpliceCore {
    online_mode: bool,
    command_prefix: String,
    link: Mutex<LinkState>,
    clients: DashMap<ClientId, ClientEntry>,
    upstream: RwLock<Option<Arc<Session>>>,
    tracker: Arc<UpstreamTracker>,
    ghost: Arc<GhostLayer>,
    commands: Arc<CommandRegistry>,
    bus: broadcast::Sender<LifecycleEvent>,
}

impl SpliceCore {
    pub fn new(
        online_mode: bool,
        command_prefix: String,
        tracker: Arc<UpstreamTracker>,
        ghost: Arc<GhostLayer>,
        commands: Arc<CommandRegistry>,
        bus: broadcast::Sender<LifecycleEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            online_mode,
            command_prefix,
            link: Mutex::new(LinkState::default()),
            clients: DashMap::new(),
            upstream: RwLock::new(None),
            tracker,
            ghost,
            commands,
            bus,
        })
    }

    pub fn tracker(&self) -> &Arc<UpstreamTracker> {
        &self.tracker
    }

    pub fn ghost(&self) -> &Arc<GhostLayer> {
        &self.ghost
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    /// A fresh read of the link state.
    pub fn link_state(&self) -> LinkState {
        *self.link.lock().expect("link state poisoned")
    }

    pub fn upstream(&self) -> Option<Arc<Session>> {
        self.upstream.read().expect("upstream poisoned").clone()
    }

    pub fn client(&self, id: ClientId) -> Option<Arc<Session>> {
        self.clients.get(&id).map(|entry| Arc::clone(&entry.session))
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.bus.send(event);
    }

    // ── Upstream binding ────────────────────────────────────────────────

    /// Bind a freshly connected upstream session and start its pump.
    pub fn bind_upstream(self: &Arc<Self>, session: Arc<Session>) {
        self.tracker.reset();
        self.ghost.bind_bot(session.identity().clone());
        *self.upstream.write().expect("upstream poisoned") = Some(Arc::clone(&session));

        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.pump_upstream(session).await;
        });
    }

    /// Tear the upstream down from our side (manual stop). The pump sees a
    /// local end and exits without raising remote-loss events.
    pub fn shutdown_upstream(&self, reason: &str) {
        let session = self.upstream.write().expect("upstream poisoned").take();
        if let Some(session) = session {
            session.end(reason);
        }
        self.ghost.clear_bot();
    }

    /// Drop the link without ceremony; used during shutdown when the clients
    /// are being closed anyway.
    pub fn force_unlink_silent(&self) {
        let _ = self
            .link
            .lock()
            .expect("link state poisoned")
            .try_unlink(None);
    }

    /// End every downstream connection with a reason.
    pub fn close_all_clients(&self, reason: &str) {
        for entry in self.clients.iter() {
            entry.session.end(reason);
        }
    }

    async fn pump_upstream(self: Arc<Self>, session: Arc<Session>) {
        let mut rx = session.subscribe();
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Packet(packet)) => self.handle_upstream_packet(packet),
                Ok(SessionEvent::End { kind, reason }) => {
                    if kind != EndKind::Local {
                        self.handle_upstream_loss(&session, kind, &reason);
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("upstream pump lagged, {} packets skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn handle_upstream_packet(self: &Arc<Self>, packet: Packet) {
        self.tracker.observe(&packet);
        self.ghost.observe_upstream(&packet);

        let controller = self.link_state().controller();
        let bot_entity = self.tracker.entity_id();

        for entry in self.clients.iter() {
            let id = *entry.key();
            if controller == Some(id) {
                let ctx = MiddlewareCtx {
                    client: id,
                    is_controller: true,
                };
                let mut copy = packet.clone();
                if run_chain(&entry.chains.to_client, &mut copy, &ctx) == Verdict::Forward {
                    entry.session.send(copy);
                }
            } else {
                if SPECTATOR_SUPPRESSED.contains(&packet.name.as_str()) {
                    continue;
                }
                let mut copy = packet.clone();
                if let Some(bot_entity) = bot_entity {
                    // Observers must see the ghost, not the server's view of
                    // the bot itself.
                    copy.rewrite_entity_id(bot_entity, GHOST_ENTITY_ID);
                }
                entry.session.send(copy);
            }
        }
    }

    /// The upstream ended on us: forced unlink, explain to the linked client,
    /// raise exactly one remote-loss lifecycle event.
    fn handle_upstream_loss(self: &Arc<Self>, session: &Arc<Session>, kind: EndKind, reason: &str) {
        {
            let mut upstream = self.upstream.write().expect("upstream poisoned");
            match upstream.as_ref() {
                Some(current) if Arc::ptr_eq(current, session) => *upstream = None,
                // A stale pump from a previous incarnation; the loss was
                // already handled.
                _ => return,
            }
        }
        tracing::warn!("remote connection lost ({kind:?}): {reason}");

        self.ghost.clear_bot();

        let unlinked = self
            .link
            .lock()
            .expect("link state poisoned")
            .try_unlink(None)
            .unwrap_or(None);
        if let Some(old) = unlinked {
            if let Some(client) = self.client(old) {
                client.end(&format!("Lost connection to the remote server: {reason}"));
            }
        }
        self.emit(LifecycleEvent::BotShutdown);
        match kind {
            EndKind::Kicked => self.emit(LifecycleEvent::RemoteKick {
                reason: reason.to_string(),
            }),
            _ => self.emit(LifecycleEvent::RemoteError {
                message: reason.to_string(),
            }),
        }
    }

    // ── Downstream clients ──────────────────────────────────────────────

    /// Register a downstream client's packet stream. Grants no control: the
    /// client starts out as a plain observer of world replication.
    pub fn attach(self: &Arc<Self>, session: Arc<Session>, chains: MiddlewareChains) {
        let id = session.id();
        self.clients.insert(
            id,
            ClientEntry {
                session: Arc::clone(&session),
                chains,
                initial_sent: Arc::new(AtomicBool::new(false)),
            },
        );
        self.emit(LifecycleEvent::PlayerConnected {
            username: session.username().to_string(),
        });

        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.pump_client(session).await;
        });
    }

    async fn pump_client(self: Arc<Self>, session: Arc<Session>) {
        let mut rx = session.subscribe();
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Packet(packet)) => {
                    self.handle_client_packet(&session, packet).await;
                }
                Ok(SessionEvent::End { reason, .. }) => {
                    self.handle_client_disconnect(&session, &reason);
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        "client pump for {} lagged, {} packets skipped",
                        session.username(),
                        n
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_client_packet(self: &Arc<Self>, session: &Arc<Session>, packet: Packet) {
        let id = session.id();
        match packet.name.as_str() {
            "chat" => {
                let message = packet.text("message").unwrap_or("").to_string();
                if self
                    .commands
                    .handle_chat(self, session, &message, &self.command_prefix)
                    .await
                {
                    return;
                }
                // Unconsumed chat flows upstream only from the controller.
                self.forward_from(id, packet);
            }
            "position" | "position_look" => {
                self.ghost.record_client_transform(
                    id,
                    Transform {
                        x: packet.float("x").unwrap_or(0.0),
                        y: packet.float("y").unwrap_or(0.0),
                        z: packet.float("z").unwrap_or(0.0),
                        yaw: packet.float("yaw").unwrap_or(0.0).to_radians(),
                        pitch: packet.float("pitch").unwrap_or(0.0).to_radians(),
                        on_ground: packet.data.get("onGround").and_then(|v| v.as_bool()).unwrap_or(true),
                    },
                );
                self.forward_from(id, packet);
            }
            "use_entity" => {
                let is_controller = self.link_state().controller() == Some(id);
                if !is_controller && packet.int("target") == Some(GHOST_ENTITY_ID) {
                    // Clicking the ghost asks to see through its eyes.
                    if let Err(message) = self.ghost.enter_pov(id) {
                        session.chat(&message);
                    }
                    return;
                }
                self.forward_from(id, packet);
            }
            _ => self.forward_from(id, packet),
        }
    }

    /// Forward a client packet upstream iff the client is, right now, the
    /// controller and an upstream exists. Everything else is dropped: an
    /// observer may never drive the bot.
    fn forward_from(&self, id: ClientId, mut packet: Packet) {
        if self.link_state().controller() != Some(id) {
            return;
        }
        let Some(upstream) = self.upstream() else {
            return;
        };
        let Some(entry) = self.clients.get(&id) else {
            return;
        };
        let ctx = MiddlewareCtx {
            client: id,
            is_controller: true,
        };
        if run_chain(&entry.chains.to_server, &mut packet, &ctx) == Verdict::Forward {
            upstream.send(packet);
        }
    }

    fn handle_client_disconnect(self: &Arc<Self>, session: &Arc<Session>, reason: &str) {
        let id = session.id();
        tracing::info!("{} disconnected: {}", session.username(), reason);
        self.clients.remove(&id);
        self.ghost.unregister(id);

        let was_controller = {
            let mut link = self.link.lock().expect("link state poisoned");
            match *link {
                LinkState::Linked { client } if client == id => {
                    let _ = link.try_unlink(None);
                    true
                }
                _ => false,
            }
        };
        if was_controller && self.upstream().is_some() {
            // The bot is on its own again.
            self.emit(LifecycleEvent::BotStartup);
        }
        self.emit(LifecycleEvent::PlayerDisconnected {
            username: session.username().to_string(),
        });
    }

    // ── Initial state ───────────────────────────────────────────────────

    /// Push the full join snapshot to a newly attached client, once the
    /// upstream avatar has spawned.
    ///
    /// Polls with a 100 ms sleep until spawn; there is deliberately no
    /// timeout — if the upstream never spawns, the joining client hangs in
    /// this phase (known limitation of the splice design). Idempotent per
    /// client.
    pub async fn send_initial_state(&self, session: &Arc<Session>) -> anyhow::Result<()> {
        let initial_sent = match self.clients.get(&session.id()) {
            Some(entry) => Arc::clone(&entry.initial_sent),
            None => anyhow::bail!("send_initial_state called for a client that is not attached"),
        };
        if initial_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        while !self.tracker.spawned() {
            if !session.is_open() {
                return Ok(());
            }
            tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
        }

        let avatar = self.tracker.snapshot();
        let t = avatar.transform;
        session.write(
            "login",
            json!({
                "entityId": avatar.entity_id.unwrap_or(0),
                "gameMode": avatar.gamemode,
                "dimension": avatar.dimension,
                "difficulty": avatar.difficulty,
                "maxPlayers": avatar.max_players,
                "levelType": avatar.level_type,
                "reducedDebugInfo": false
            }),
        );
        session.write("difficulty", json!({ "difficulty": avatar.difficulty }));
        session.write(
            "update_health",
            json!({
                "health": avatar.health,
                "food": avatar.food,
                "foodSaturation": avatar.food_saturation
            }),
        );
        session.write("held_item_slot", json!({ "slot": avatar.held_slot }));
        session.write(
            "window_items",
            json!({ "windowId": 0, "items": avatar.inventory }),
        );
        if let Some(header) = &avatar.tab_header {
            session.write("playerlist_header", header.clone());
        }
        session.write(
            "position",
            json!({
                "x": t.x,
                "y": t.y,
                "z": t.z,
                "yaw": t.yaw.to_degrees(),
                "pitch": t.pitch.to_degrees(),
                "flags": 0,
                "teleportId": 0
            }),
        );
        tracing::debug!("initial state sent to {}", session.username());
        Ok(())
    }

    // ── Link / unlink ───────────────────────────────────────────────────

    /// Bind `session` as the exclusive controller of the upstream.
    ///
    /// On refusal the state is untouched and the returned message is meant
    /// for the requesting client's chat — linking is a user-facing command,
    /// not a fatal operation.
    pub async fn link(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), String> {
        let Some(upstream) = self.upstream() else {
            return Err("Remote server is not connected, cannot link!".into());
        };
        if !self.authorized(session, &upstream) {
            return Err(LinkDenied::NotAuthorized.message().into());
        }
        let id = session.id();

        // Precondition check without mutation; the commit below re-checks.
        match self.link_state() {
            LinkState::Unlinked => {}
            LinkState::Linked { client } if client == id => {
                return Err(LinkDenied::AlreadyController.message().into());
            }
            LinkState::Linked { .. } => {
                return Err(LinkDenied::OtherController.message().into());
            }
        }

        // Revert camera/gamemode first, give the client a beat to settle...
        self.ghost.make_controller(id);
        tokio::time::sleep(LINK_SETTLE_DELAY).await;

        // ...then commit against a fresh read. A rival link during the sleep
        // wins; we undo our cosmetic changes and report.
        let commit = self
            .link
            .lock()
            .expect("link state poisoned")
            .try_link(id);
        if let Err(denied) = commit {
            self.ghost.restore_spectator(id);
            return Err(denied.message().into());
        }

        // Authoritative snap to the bot's real position.
        let t = self.tracker.transform();
        session.write(
            "position",
            json!({
                "x": t.x,
                "y": t.y,
                "z": t.z,
                "yaw": t.yaw.to_degrees(),
                "pitch": t.pitch.to_degrees(),
                "flags": 0,
                "teleportId": 0
            }),
        );
        tracing::info!("{} is now controlling the bot", session.username());
        self.emit(LifecycleEvent::BotShutdown);
        Ok(())
    }

    /// Release control. `Some(session)` must be the current controller;
    /// `None` is the programmatic/forced form used on remote disconnect.
    pub async fn unlink(self: &Arc<Self>, session: Option<&Arc<Session>>) -> Result<(), String> {
        let caller = session.map(|s| s.id());
        let released = {
            let mut link = self.link.lock().expect("link state poisoned");
            match link.try_unlink(caller) {
                Ok(released) => released,
                Err(denied) => return Err(denied.message().into()),
            }
        };
        let Some(old) = released else {
            return Ok(()); // forced unlink with nothing linked
        };
        tracing::info!("client {} released control", old);
        if self.upstream().is_some() {
            self.emit(LifecycleEvent::BotStartup);
        }

        tokio::time::sleep(LINK_SETTLE_DELAY).await;

        // Re-validate: still unlinked, client still around.
        if self.link_state() == LinkState::Unlinked && self.clients.contains_key(&old) {
            self.ghost.restore_spectator(old);
        }
        Ok(())
    }

    fn authorized(&self, session: &Session, upstream: &Session) -> bool {
        if self.online_mode {
            session.identity().uuid == upstream.identity().uuid
        } else {
            session
                .identity()
                .username
                .eq_ignore_ascii_case(&upstream.identity().username)
        }
    }
}

fn run_chain(chain: &[Middleware], packet: &mut Packet, ctx: &MiddlewareCtx) -> Verdict {
    for middleware in chain {
        if middleware(packet, ctx) == Verdict::Drop {
            return Verdict::Drop;
        }
    }
    Verdict::Forward
}

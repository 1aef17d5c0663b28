//! Scripted transport doubles.
//!
//! The protocol codec is an external collaborator, so rehearsing the splice
//! end-to-end needs stand-ins for both sides of it: a [`ScriptedServer`]
//! playing the backend (driving the upstream peer), and a [`ScriptedClient`]
//! playing a human player (driving a downstream peer). Both speak the same
//! named-packet shapes real sessions would. Used by `main --demo` style runs
//! and by the integration tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ghostlink_core::packet::Packet;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::{Config, RemoteConfig};
use crate::lifecycle::Proxy;
use crate::net::connect::RemoteConnector;
use crate::net::session::{Identity, Peer, Session};

/// Wait for a specific packet name, skipping everything else. Gives up after
/// two seconds so a missing packet fails a test instead of hanging it.
pub async fn await_packet(peer: &mut Peer, name: &str) -> Option<Packet> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match peer.recv().await {
                Some(packet) if packet.name == name => return Some(packet),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

// ── Upstream double ─────────────────────────────────────────────────────

/// Drives the upstream peer the way a backend server would.
pub struct ScriptedServer {
    peer: Peer,
    entity_id: i64,
}

impl ScriptedServer {
    pub fn new(peer: Peer) -> Self {
        Self { peer, entity_id: 1 }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.peer.session()
    }

    pub fn entity_id(&self) -> i64 {
        self.entity_id
    }

    /// The post-handshake burst: login state plus the first authoritative
    /// position, which is what marks the avatar as spawned.
    pub fn complete_login(&self) {
        self.peer.send(
            "login",
            json!({
                "entityId": self.entity_id,
                "gameMode": 0,
                "dimension": 0,
                "difficulty": 2,
                "maxPlayers": 20,
                "levelType": "default",
                "reducedDebugInfo": false
            }),
        );
        self.move_bot(0.5, 64.0, 0.5, 0.0, 0.0);
    }

    /// Authoritative position update (wire degrees).
    pub fn move_bot(&self, x: f64, y: f64, z: f64, yaw_deg: f64, pitch_deg: f64) {
        self.peer.send(
            "position",
            json!({
                "x": x,
                "y": y,
                "z": z,
                "yaw": yaw_deg,
                "pitch": pitch_deg,
                "flags": 0,
                "teleportId": 1
            }),
        );
    }

    /// Put an item into the bot's inventory window.
    pub fn set_inventory_slot(&self, slot: i64, item: Value) {
        self.peer.send("set_slot", json!({ "windowId": 0, "slot": slot, "item": item }));
    }

    /// Move the avatar to another dimension.
    pub fn respawn(&self, dimension: i64) {
        self.peer.send(
            "respawn",
            json!({
                "dimension": dimension,
                "difficulty": 2,
                "gamemode": 0,
                "levelType": "default"
            }),
        );
    }

    /// Any raw packet.
    pub fn send(&self, name: &str, data: Value) {
        self.peer.send(name, data);
    }

    /// Server-initiated disconnect (ban, kick).
    pub fn kick(&self, reason: &str) {
        self.peer.close(reason);
    }

    /// Transport failure underneath the session.
    pub fn fail(&self, message: &str) {
        self.peer.fail(message);
    }

    /// Next serverbound packet the proxy forwarded to us.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.peer.recv().await
    }

    pub async fn expect(&mut self, name: &str) -> Option<Packet> {
        await_packet(&mut self.peer, name).await
    }

    pub fn drain(&mut self) -> Vec<Packet> {
        self.peer.drain()
    }
}

/// [`RemoteConnector`] that hands each dialed session to the test script as a
/// [`ScriptedServer`]. Every `connect` yields a fresh pair, so restart flows
/// get a new incarnation to drive.
pub struct SimConnector {
    identity: Identity,
    handoff: mpsc::UnboundedSender<ScriptedServer>,
}

impl SimConnector {
    pub fn new(identity: Identity) -> (Arc<Self>, mpsc::UnboundedReceiver<ScriptedServer>) {
        let (handoff, incoming) = mpsc::unbounded_channel();
        (Arc::new(Self { identity, handoff }), incoming)
    }
}

#[async_trait]
impl RemoteConnector for SimConnector {
    async fn connect(&self, _remote: &RemoteConfig) -> Result<Arc<Session>> {
        let (session, peer) = Session::pair(self.identity.clone());
        self.handoff
            .send(ScriptedServer::new(peer))
            .map_err(|_| anyhow::anyhow!("simulated server script is gone"))?;
        Ok(session)
    }
}

/// Bootstrap a proxy against a scripted backend: started, logged in, avatar
/// spawned. Also returns the connector's handoff receiver so restart flows
/// can pick up the next incarnation.
pub async fn rehearsal(
    config: Config,
) -> Result<(
    Arc<Proxy>,
    ScriptedServer,
    mpsc::UnboundedReceiver<ScriptedServer>,
)> {
    let (connector, mut incoming) = SimConnector::new(config.account_identity());
    let proxy = Proxy::new(config, connector);
    proxy.start().await?;
    let server = incoming
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("connector produced no scripted server"))?;
    server.complete_login();
    while !proxy.splice().tracker().spawned() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok((proxy, server, incoming))
}

// ── Downstream double ───────────────────────────────────────────────────

/// Drives a downstream peer the way a human player's client would.
pub struct ScriptedClient {
    peer: Peer,
}

impl ScriptedClient {
    /// A logged-in local client. Hand the returned session to
    /// `Proxy::handle_client_connect`.
    pub fn connect(username: &str) -> (Arc<Session>, ScriptedClient) {
        let (session, peer) = Session::pair(Identity::offline(username));
        (session, ScriptedClient { peer })
    }

    pub fn session(&self) -> &Arc<Session> {
        self.peer.session()
    }

    /// Serverbound chat; commands go through here too.
    pub fn chat(&self, message: &str) {
        self.peer.send("chat", json!({ "message": message }));
    }

    pub fn move_to(&self, x: f64, y: f64, z: f64, yaw_deg: f64, pitch_deg: f64) {
        self.peer.send(
            "position_look",
            json!({
                "x": x,
                "y": y,
                "z": z,
                "yaw": yaw_deg,
                "pitch": pitch_deg,
                "onGround": false
            }),
        );
    }

    /// Left/right-click an entity.
    pub fn click_entity(&self, target: i64) {
        self.peer
            .send("use_entity", json!({ "target": target, "mouse": 1, "sneaking": false }));
    }

    pub fn send(&self, name: &str, data: Value) {
        self.peer.send(name, data);
    }

    /// Client-side quit.
    pub fn quit(&self) {
        self.peer.close("Disconnected");
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.peer.recv().await
    }

    pub async fn expect(&mut self, name: &str) -> Option<Packet> {
        await_packet(&mut self.peer, name).await
    }

    pub fn drain(&mut self) -> Vec<Packet> {
        self.peer.drain()
    }
}

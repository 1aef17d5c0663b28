//! Channel-backed session handles.
//!
//! A [`Session`] is the proxy's view of one authenticated connection, local or
//! remote: `write` pushes packets toward the peer, `subscribe` yields packets
//! and the end-of-stream signal coming from it, `end` closes it with a reason.
//! `Session::pair` returns the matching [`Peer`] driver, which is the seam the
//! protocol codec (or a scripted stand-in) plugs into.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ghostlink_core::packet::Packet;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Capacity of the per-session incoming event bus. Bursty chunk replication
/// peaks well below this; a lagged subscriber only loses spectator cosmetics.
pub const SESSION_BUS_CAPACITY: usize = 1024;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Authenticated identity of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub uuid: Uuid,
}

impl Identity {
    pub fn new(username: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            username: username.into(),
            uuid,
        }
    }

    /// Offline-mode identity: UUID derived the way vanilla servers do it.
    pub fn offline(username: impl Into<String>) -> Self {
        let username = username.into();
        let uuid = offline_uuid(&username);
        Self { username, uuid }
    }
}

/// Generate an offline-mode UUID from a player name.
pub fn offline_uuid(name: &str) -> Uuid {
    Uuid::new_v3(
        &Uuid::NAMESPACE_URL,
        format!("OfflinePlayer:{}", name).as_bytes(),
    )
}

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndKind {
    /// We closed it (kick, shutdown). Never triggers restart policy.
    Local,
    /// The peer closed it deliberately (server kick / client quit).
    Kicked,
    /// The transport failed underneath it (socket error, codec error).
    Error,
}

/// One event on a session's incoming stream.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Packet(Packet),
    End { kind: EndKind, reason: String },
}

/// A live connection, shared as `Arc<Session>` across the routing tasks.
pub struct Session {
    id: u64,
    identity: Identity,
    to_peer: mpsc::UnboundedSender<Packet>,
    events: broadcast::Sender<SessionEvent>,
    open: AtomicBool,
}

impl Session {
    /// Create a session and its peer driver.
    pub fn pair(identity: Identity) -> (Arc<Session>, Peer) {
        let (to_peer, from_session) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(SESSION_BUS_CAPACITY);
        let session = Arc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            to_peer,
            events,
            open: AtomicBool::new(true),
        });
        let peer = Peer {
            session: Arc::clone(&session),
            outgoing: from_session,
        };
        (session, peer)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Send a named packet toward the peer. Best-effort: writes after the
    /// session ended are dropped silently, matching a closed socket.
    pub fn write(&self, name: &str, data: Value) {
        self.send(Packet::new(name, data));
    }

    pub fn send(&self, packet: Packet) {
        if self.is_open() {
            let _ = self.to_peer.send(packet);
        }
    }

    /// Push a system chat line to this client.
    pub fn chat(&self, text: &str) {
        let component = json!({ "text": text }).to_string();
        self.write("chat", json!({ "message": component, "position": 0 }));
    }

    /// Close the session from our side with an explanatory reason.
    ///
    /// Emits a final `disconnect` packet toward the peer (real clients render
    /// the reason on their disconnect screen), then an `End` event with
    /// [`EndKind::Local`] so routing tasks unwind. Idempotent.
    pub fn end(&self, reason: &str) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let component = json!({ "text": reason }).to_string();
        let _ = self.to_peer.send(Packet::new("disconnect", json!({ "reason": component })));
        let _ = self.events.send(SessionEvent::End {
            kind: EndKind::Local,
            reason: reason.to_string(),
        });
    }

    /// Subscribe to the incoming packet/end stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit_end(&self, kind: EndKind, reason: &str) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.events.send(SessionEvent::End {
            kind,
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &self.identity.username)
            .field("open", &self.is_open())
            .finish()
    }
}

/// The codec-facing half of a session pair.
pub struct Peer {
    session: Arc<Session>,
    outgoing: mpsc::UnboundedReceiver<Packet>,
}

impl Peer {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Inject a packet as if it arrived from the wire.
    pub fn send(&self, name: &str, data: Value) {
        if self.session.is_open() {
            let _ = self
                .session
                .events
                .send(SessionEvent::Packet(Packet::new(name, data)));
        }
    }

    /// The peer disconnected deliberately (server kick, client quit).
    pub fn close(&self, reason: &str) {
        self.session.emit_end(EndKind::Kicked, reason);
    }

    /// The transport failed underneath the session.
    pub fn fail(&self, message: &str) {
        self.session.emit_end(EndKind::Error, message);
    }

    /// Next packet the proxy wrote toward this peer.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.outgoing.recv().await
    }

    /// Drain every already-written packet without waiting. Test utility.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.outgoing.try_recv() {
            packets.push(packet);
        }
        packets
    }
}

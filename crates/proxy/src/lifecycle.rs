//! Session lifecycle controller.
//!
//! The proxy-level state machine: connects and tears down the single
//! upstream session, fans lifecycle events out to plugins over a typed
//! broadcast bus, and owns the auto-restart policy. The controller has no
//! bot-behavior logic of its own — `BotStartup`/`BotShutdown` are pure
//! signals for external plugins (antiAFK, auto-eat) to start and stop
//! themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::command::CommandRegistry;
use crate::config::Config;
use crate::ghost::GhostLayer;
use crate::net::connect::RemoteConnector;
use crate::net::session::Session;
use crate::splice::{MiddlewareChains, SPAWN_POLL_INTERVAL, SpliceCore};
use crate::tracker::UpstreamTracker;

/// Capacity of the lifecycle event bus. Lifecycle traffic is sparse; a
/// subscriber would have to sleep through an entire restart storm to lag.
pub const BUS_CAPACITY: usize = 256;

/// The closed set of lifecycle signals plugins can subscribe to.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    Starting,
    Started,
    Stopping,
    Stopped,
    Restart,
    ClosingConnections,
    PlayerConnected { username: String },
    PlayerDisconnected { username: String },
    RemoteKick { reason: String },
    RemoteError { message: String },
    /// The bot is on its own: autonomous behavior should run.
    BotStartup,
    /// A human has control (or the session is gone): autonomous behavior
    /// should stop.
    BotShutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Starting,
    Connected,
    Stopping,
    /// Upstream lost; a policy-gated restart may be pending.
    Disconnected,
}

pub struct Proxy {
    config: Config,
    connector: Arc<dyn RemoteConnector>,
    splice: Arc<SpliceCore>,
    events: broadcast::Sender<LifecycleEvent>,
    state: RwLock<ProxyState>,
    /// Set by `stop()`; suppresses the auto-restart policy. Checked at the
    /// moment a disconnect is handled (and once more after the restart
    /// delay) — a restart racing a simultaneous manual stop is a documented
    /// ambiguity, not something this flag fully serializes.
    manually_stopped: AtomicBool,
}

impl Proxy {
    pub fn new(config: Config, connector: Arc<dyn RemoteConnector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(BUS_CAPACITY);
        let tracker = Arc::new(UpstreamTracker::new());
        let ghost = Arc::new(GhostLayer::new(Arc::clone(&tracker)));
        let commands = CommandRegistry::with_builtins();
        let splice = SpliceCore::new(
            config.online_mode,
            config.command_prefix.clone(),
            tracker,
            ghost,
            commands,
            events.clone(),
        );
        let proxy = Arc::new(Self {
            config,
            connector,
            splice,
            events,
            state: RwLock::new(ProxyState::Stopped),
            manually_stopped: AtomicBool::new(false),
        });
        proxy.spawn_restart_policy();
        proxy
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn splice(&self) -> &Arc<SpliceCore> {
        &self.splice
    }

    pub fn state(&self) -> ProxyState {
        *self.state.read().expect("proxy state poisoned")
    }

    /// Subscribe to lifecycle events; the plugin-facing observer surface.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, state: ProxyState) {
        *self.state.write().expect("proxy state poisoned") = state;
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    /// Signal plugins that autonomous behavior should run.
    pub fn begin_bot_logic(&self) {
        self.emit(LifecycleEvent::BotStartup);
    }

    /// Signal plugins that autonomous behavior should stop.
    pub fn end_bot_logic(&self) {
        self.emit(LifecycleEvent::BotShutdown);
    }

    // ── start / stop / restart ──────────────────────────────────────────

    /// Open the upstream session. No-op when already connected or starting.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ProxyState::Connected | ProxyState::Starting => return Ok(()),
            _ => {}
        }
        self.manually_stopped.store(false, Ordering::SeqCst);

        // Stale local connections belong to the previous incarnation.
        if self.splice.client_count() > 0 {
            self.emit(LifecycleEvent::ClosingConnections);
            self.splice.close_all_clients("Proxy is reconnecting.");
        }

        self.set_state(ProxyState::Starting);
        self.emit(LifecycleEvent::Starting);

        let upstream = match self.connector.connect(&self.config.remote).await {
            Ok(session) => session,
            Err(error) => {
                self.set_state(ProxyState::Disconnected);
                return Err(error).context("connecting to the remote server");
            }
        };
        // A manual stop may have raced the dial; honor it.
        if self.manually_stopped.load(Ordering::SeqCst) {
            upstream.end("Proxy stopped");
            self.set_state(ProxyState::Stopped);
            return Ok(());
        }
        tracing::info!(
            "connected to {}:{} as {}",
            self.config.remote.host,
            self.config.remote.port,
            upstream.username()
        );
        self.splice.bind_upstream(upstream);
        self.spawn_started_watch();
        Ok(())
    }

    /// One-shot watcher: once the avatar spawns, the proxy is `Connected`
    /// and autonomous behavior begins.
    fn spawn_started_watch(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
                let Some(proxy) = weak.upgrade() else { return };
                if proxy.state() != ProxyState::Starting {
                    return; // superseded by stop/restart
                }
                if proxy.splice.upstream().is_none() {
                    return; // died before spawning; loss path owns the state
                }
                if proxy.splice.tracker().spawned() {
                    proxy.set_state(ProxyState::Connected);
                    proxy.emit(LifecycleEvent::Started);
                    proxy.begin_bot_logic();
                    return;
                }
            }
        });
    }

    /// Tear everything down deliberately. Suppresses auto-restart.
    pub async fn stop(self: &Arc<Self>) {
        if matches!(self.state(), ProxyState::Stopped | ProxyState::Stopping) {
            return;
        }
        self.manually_stopped.store(true, Ordering::SeqCst);
        self.set_state(ProxyState::Stopping);
        self.emit(LifecycleEvent::Stopping);

        self.splice.force_unlink_silent();
        self.end_bot_logic();
        self.splice.shutdown_upstream("Proxy stopped");
        self.splice.close_all_clients("Proxy stopped.");

        self.set_state(ProxyState::Stopped);
        self.emit(LifecycleEvent::Stopped);
    }

    /// `stop`, wait, `start`. Used by both manual restarts and the
    /// auto-restart policy.
    pub async fn restart(self: &Arc<Self>, delay: Duration) {
        self.emit(LifecycleEvent::Restart);
        self.stop().await;
        tokio::time::sleep(delay).await;
        if let Err(error) = self.start().await {
            tracing::error!("restart failed: {:#}", error);
        }
    }

    /// Flat fixed-delay reconnect after a remote loss, unless disabled or
    /// deliberately stopped. This is the only automatic retry in the system.
    fn spawn_restart_policy(self: &Arc<Self>) {
        let mut rx = self.events.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if !matches!(
                    event,
                    LifecycleEvent::RemoteKick { .. } | LifecycleEvent::RemoteError { .. }
                ) {
                    continue;
                }
                let Some(proxy) = weak.upgrade() else { return };
                proxy.set_state(ProxyState::Disconnected);
                if !proxy.config.auto_restart {
                    continue;
                }
                if proxy.manually_stopped.load(Ordering::SeqCst) {
                    tracing::info!("manually stopped, skipping auto-restart");
                    continue;
                }
                let delay = Duration::from_secs(proxy.config.restart_delay_secs);
                tracing::info!("reconnecting in {:?}", delay);
                tokio::time::sleep(delay).await;
                if proxy.manually_stopped.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(error) = proxy.start().await {
                    tracing::error!("auto-restart failed: {:#}", error);
                }
            }
        });
    }

    // ── Downstream ingress ──────────────────────────────────────────────

    /// A local client finished its login handshake: authorize it, attach it
    /// to the splice core, and bring it up as a spectator.
    pub async fn handle_client_connect(self: &Arc<Self>, session: Arc<Session>) -> Result<()> {
        if !self.config.whitelisted(session.username()) {
            tracing::info!("{} rejected: not whitelisted", session.username());
            session.end("You are not whitelisted on this proxy!");
            return Ok(());
        }
        tracing::info!("{} connected", session.username());
        self.splice
            .attach(Arc::clone(&session), MiddlewareChains::standard());

        // Initial state blocks on the avatar spawning; run it off to the
        // side so ingress never stalls.
        let splice = Arc::clone(&self.splice);
        tokio::spawn(async move {
            if let Err(error) = splice.send_initial_state(&session).await {
                tracing::warn!("initial state for {} failed: {:#}", session.username(), error);
                return;
            }
            if !session.is_open() {
                return;
            }
            // Everyone starts as a spectator; control is a separate, explicit
            // transition.
            if splice.link_state().controller() != Some(session.id()) {
                splice.ghost().register_spectator(session);
            }
        });
        Ok(())
    }
}

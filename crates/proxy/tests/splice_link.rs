//! Link/unlink scenarios over the full splice: control handoff, refusal
//! messages, remote-kick teardown, and forwarding rules.

use std::sync::Arc;
use std::time::Duration;

use ghostlink_core::link::{CameraMode, LinkState};
use ghostlink_core::packet::Packet;
use ghostlink_proxy::config::Config;
use ghostlink_proxy::lifecycle::{LifecycleEvent, Proxy, ProxyState};
use ghostlink_proxy::sim::{ScriptedClient, rehearsal};
use serde_json::json;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Default config with auto-restart off so a kicked upstream stays down.
fn quiet_config() -> Config {
    Config {
        auto_restart: false,
        ..Config::default()
    }
}

/// Connect a client and wait until it is fully up as a spectator (initial
/// state delivered, ghost spawned). Leaves its packet queue drained.
async fn join(proxy: &Arc<Proxy>, name: &str) -> ScriptedClient {
    let (session, mut client) = ScriptedClient::connect(name);
    proxy.handle_client_connect(session).await.unwrap();
    client.expect("login").await.expect("initial state login");
    client
        .expect("named_entity_spawn")
        .await
        .expect("ghost spawn");
    client.drain();
    client
}

fn drain_events(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn chat_text(packet: &Packet) -> String {
    packet.text("message").unwrap_or_default().to_string()
}

/// Give the routing tasks a beat to settle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Connect while unlinked -> spectator; /link -> control + BotShutdown;
/// /link again -> refused without mutation; disconnect -> unlinked +
/// BotStartup and the registration is gone.
#[tokio::test]
async fn link_cycle_follows_the_scenario() {
    let (proxy, _server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut events = proxy.subscribe();

    let mut alice = join(&proxy, "ghostlink").await;
    let alice_id = alice.session().id();
    assert_eq!(
        proxy.splice().ghost().mode_of(alice_id),
        Some(CameraMode::Spectator)
    );
    assert!(proxy.splice().ghost().subscribed(alice_id));
    assert!(
        drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, LifecycleEvent::PlayerConnected { username } if username == "ghostlink"))
    );

    alice.chat("/link");
    let reply = alice.expect("chat").await.unwrap();
    assert!(chat_text(&reply).contains("now in control"));
    assert_eq!(
        proxy.splice().link_state(),
        LinkState::Linked { client: alice_id }
    );
    assert_eq!(
        proxy.splice().ghost().mode_of(alice_id),
        Some(CameraMode::Controlling)
    );
    settle().await;
    assert!(drain_events(&mut events).contains(&LifecycleEvent::BotShutdown));

    // A second /link is refused with the canonical message, state untouched.
    alice.chat("/link");
    let reply = alice.expect("chat").await.unwrap();
    assert!(chat_text(&reply).contains("Already in control, cannot link!"));
    assert_eq!(
        proxy.splice().link_state(),
        LinkState::Linked { client: alice_id }
    );

    alice.quit();
    settle().await;
    assert_eq!(proxy.splice().link_state(), LinkState::Unlinked);
    assert_eq!(proxy.splice().ghost().mode_of(alice_id), None);
    let after = drain_events(&mut events);
    assert!(after.contains(&LifecycleEvent::BotStartup));
    assert!(
        after
            .iter()
            .any(|e| matches!(e, LifecycleEvent::PlayerDisconnected { .. }))
    );
}

#[tokio::test]
async fn only_one_client_controls_at_a_time() {
    let (proxy, mut server, _incoming) = rehearsal(quiet_config()).await.unwrap();

    let mut alice = join(&proxy, "ghostlink").await;
    let mut bob = join(&proxy, "ghostlink").await;

    alice.chat("/link");
    let reply = alice.expect("chat").await.unwrap();
    assert!(chat_text(&reply).contains("now in control"));

    bob.chat("/link");
    let reply = bob.expect("chat").await.unwrap();
    assert!(chat_text(&reply).contains("Another client is in control"));
    assert_eq!(
        proxy.splice().link_state(),
        LinkState::Linked {
            client: alice.session().id()
        }
    );

    // Only the controller's packets reach the backend.
    server.drain();
    bob.send("use_entity", json!({ "target": 7, "mouse": 1, "sneaking": false }));
    settle().await;
    assert!(server.drain().is_empty());

    alice.send("use_entity", json!({ "target": 7, "mouse": 1, "sneaking": false }));
    let forwarded = server.expect("use_entity").await.unwrap();
    assert_eq!(forwarded.int("target"), Some(7));
}

#[tokio::test]
async fn wrong_account_cannot_link() {
    let (proxy, _server, _incoming) = rehearsal(quiet_config()).await.unwrap();

    let mut mallory = join(&proxy, "mallory").await;
    mallory.chat("/link");
    let reply = mallory.expect("chat").await.unwrap();
    assert!(chat_text(&reply).contains("Not authorized"));
    assert_eq!(proxy.splice().link_state(), LinkState::Unlinked);
}

#[tokio::test]
async fn unlink_requires_the_controller_and_restores_spectator() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();

    let mut alice = join(&proxy, "ghostlink").await;
    let mut bob = join(&proxy, "ghostlink").await;

    alice.chat("/link");
    alice.expect("chat").await.unwrap();

    bob.chat("/unlink");
    let reply = bob.expect("chat").await.unwrap();
    assert!(chat_text(&reply).contains("Not in control, cannot unlink!"));

    alice.chat("/unlink");
    let reply = alice.expect("chat").await.unwrap();
    assert!(chat_text(&reply).contains("spectator"));
    settle().await;

    // Camera mode is back to the pre-link default and the ghost is
    // re-subscribed: a bot move reaches Alice as a ghost teleport again.
    let alice_id = alice.session().id();
    assert_eq!(
        proxy.splice().ghost().mode_of(alice_id),
        Some(CameraMode::Spectator)
    );
    assert!(proxy.splice().ghost().subscribed(alice_id));

    alice.drain();
    server.move_bot(10.0, 64.0, 10.0, 90.0, 0.0);
    let teleport = alice.expect("entity_teleport").await.unwrap();
    assert_eq!(teleport.entity_id(), Some(9999));
}

/// Upstream kick while Bob is linked: Bob's connection ends with a message
/// containing the kick reason, the link drops, and exactly one RemoteKick
/// event fires.
#[tokio::test]
async fn remote_kick_tears_down_the_link() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut events = proxy.subscribe();

    let mut bob = join(&proxy, "ghostlink").await;
    bob.chat("/link");
    bob.expect("chat").await.unwrap();
    drain_events(&mut events);

    server.kick("You have been banned");
    settle().await;

    let disconnect = bob.expect("disconnect").await.unwrap();
    assert!(
        disconnect
            .text("reason")
            .unwrap_or_default()
            .contains("You have been banned")
    );

    assert_eq!(proxy.splice().link_state(), LinkState::Unlinked);
    assert!(proxy.splice().upstream().is_none());

    let after = drain_events(&mut events);
    let kicks: Vec<_> = after
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::RemoteKick { .. }))
        .collect();
    assert_eq!(kicks.len(), 1);
    assert_eq!(
        kicks[0],
        &LifecycleEvent::RemoteKick {
            reason: "You have been banned".into()
        }
    );
    assert!(after.contains(&LifecycleEvent::BotShutdown));
    assert_eq!(proxy.state(), ProxyState::Disconnected);
}

/// The synthetic client-side session answers keep-alives itself; forwarding
/// them in either direction would double-answer and get the session kicked.
#[tokio::test]
async fn keep_alive_is_never_forwarded_verbatim() {
    let (proxy, mut server, _incoming) = rehearsal(quiet_config()).await.unwrap();

    let mut alice = join(&proxy, "ghostlink").await;
    alice.chat("/link");
    alice.expect("chat").await.unwrap();
    alice.drain();
    server.drain();

    server.send("keep_alive", json!({ "keepAliveId": 17 }));
    settle().await;
    assert!(alice.drain().iter().all(|p| p.name != "keep_alive"));

    alice.send("keep_alive", json!({ "keepAliveId": 17 }));
    settle().await;
    assert!(server.drain().iter().all(|p| p.name != "keep_alive"));

    // Regular traffic still flows both ways.
    server.send("chat", json!({ "message": "{\"text\":\"hi\"}", "position": 0 }));
    assert!(alice.expect("chat").await.is_some());
}

//! Ghost substitution and camera behavior as observed by spectator clients.

use std::sync::Arc;
use std::time::Duration;

use ghostlink_core::link::CameraMode;
use ghostlink_proxy::config::Config;
use ghostlink_proxy::ghost::GHOST_ENTITY_ID;
use ghostlink_proxy::lifecycle::Proxy;
use ghostlink_proxy::sim::{ScriptedClient, rehearsal};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn quiet_config() -> Config {
    Config {
        auto_restart: false,
        ..Config::default()
    }
}

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

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

// ---------------------------------------------------------------------------
// Substitution
// ---------------------------------------------------------------------------

/// Entity packets about the bot's own entity reach observers rewritten to
/// the ghost id; control-only packets never reach them at all.
#[tokio::test]
async fn observers_see_the_ghost_not_the_bot() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut watcher = join(&proxy, "watcher").await;

    // The bot's real entity id is 1 in the scripted backend.
    server.send("animation", json!({ "entityId": 1, "animation": 0 }));
    let animation = watcher.expect("animation").await.unwrap();
    assert_eq!(animation.entity_id(), Some(GHOST_ENTITY_ID));

    // Other entities pass through untouched.
    server.send("animation", json!({ "entityId": 7, "animation": 0 }));
    let animation = watcher.expect("animation").await.unwrap();
    assert_eq!(animation.entity_id(), Some(7));

    // Session-owner packets are suppressed for observers.
    watcher.drain();
    server.send(
        "update_health",
        json!({ "health": 10.0, "food": 20, "foodSaturation": 5.0 }),
    );
    server.send("keep_alive", json!({ "keepAliveId": 3 }));
    settle().await;
    assert!(
        watcher
            .drain()
            .iter()
            .all(|p| p.name != "update_health" && p.name != "keep_alive")
    );
}

#[tokio::test]
async fn bot_movement_becomes_ghost_teleports() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut watcher = join(&proxy, "watcher").await;

    server.move_bot(100.0, 70.0, -20.0, 180.0, 0.0);
    let teleport = watcher.expect("entity_teleport").await.unwrap();
    assert_eq!(teleport.entity_id(), Some(GHOST_ENTITY_ID));
    assert_eq!(teleport.float("x"), Some(100.0));
    assert_eq!(teleport.float("y"), Some(70.0));
    assert_eq!(teleport.float("z"), Some(-20.0));

    let head = watcher.expect("entity_head_rotation").await.unwrap();
    assert_eq!(head.entity_id(), Some(GHOST_ENTITY_ID));
}

// ---------------------------------------------------------------------------
// Equipment sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn equipment_sync_sends_only_changed_slots_once() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut watcher = join(&proxy, "watcher").await;

    let sword = json!({ "blockId": 276, "itemCount": 1, "itemDamage": 0 });

    // Held slot 0 -> inventory slot 36 is the visible main hand.
    server.set_inventory_slot(36, sword.clone());
    let equipment = watcher.expect("entity_equipment").await.unwrap();
    assert_eq!(equipment.entity_id(), Some(GHOST_ENTITY_ID));
    assert_eq!(equipment.int("slot"), Some(0));
    assert_eq!(equipment.data["item"], sword);

    // Second sync with no intervening change: zero outgoing packets.
    settle().await;
    assert_eq!(proxy.splice().ghost().sync_equipment(), 0);

    // Re-sending the identical item is also not a change.
    watcher.drain();
    server.set_inventory_slot(36, sword);
    settle().await;
    assert!(watcher.drain().iter().all(|p| p.name != "entity_equipment"));
}

// ---------------------------------------------------------------------------
// World transitions
// ---------------------------------------------------------------------------

/// Respawn pairs a despawn with either a full re-spawn (world loaded in
/// time) or nothing; here the position arrives promptly.
#[tokio::test]
async fn ghost_respawns_after_world_change() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut watcher = join(&proxy, "watcher").await;

    server.respawn(-1);
    let destroy = watcher.expect("entity_destroy").await.unwrap();
    assert_eq!(destroy.data["entityIds"], json!([GHOST_ENTITY_ID]));
    settle().await;
    assert!(!proxy.splice().ghost().subscribed(watcher.session().id()));

    // The new world finishes loading.
    server.move_bot(0.5, 70.0, 0.5, 0.0, 0.0);
    let spawn = watcher.expect("named_entity_spawn").await.unwrap();
    assert_eq!(spawn.entity_id(), Some(GHOST_ENTITY_ID));
    assert!(proxy.splice().ghost().subscribed(watcher.session().id()));
}

/// If the new world never produces a position within the timeout, the
/// listener detaches: no spawn at all, not even for a late position. A later
/// world change re-arms the cycle.
#[tokio::test(start_paused = true)]
async fn ghost_stays_down_when_the_world_never_loads() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut watcher = join(&proxy, "watcher").await;

    server.respawn(-1);
    watcher.expect("entity_destroy").await.unwrap();

    // Sleep past the world-load timeout, then deliver the position late.
    tokio::time::sleep(Duration::from_secs(6)).await;
    watcher.drain();
    server.move_bot(0.5, 70.0, 0.5, 0.0, 0.0);
    settle().await;
    assert!(
        watcher
            .drain()
            .iter()
            .all(|p| p.name != "named_entity_spawn")
    );
    assert!(!proxy.splice().ghost().subscribed(watcher.session().id()));

    // The next world change re-arms the respawn pairing.
    server.respawn(0);
    server.move_bot(0.5, 64.0, 0.5, 0.0, 0.0);
    let spawn = watcher.expect("named_entity_spawn").await.unwrap();
    assert_eq!(spawn.entity_id(), Some(GHOST_ENTITY_ID));
}

// ---------------------------------------------------------------------------
// Camera state machine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bot_pov_cycle_pins_and_releases_the_camera() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut watcher = join(&proxy, "watcher").await;
    let watcher_id = watcher.session().id();

    // Remember a spot to come back to.
    watcher.move_to(5.0, 80.0, 5.0, 0.0, 0.0);
    settle().await;

    watcher.chat("/view");
    let camera = watcher.expect("camera").await.unwrap();
    assert_eq!(camera.int("cameraId"), Some(GHOST_ENTITY_ID));
    assert_eq!(
        proxy.splice().ghost().mode_of(watcher_id),
        Some(CameraMode::BotPov)
    );

    // Every bot move now also synthesizes a follow position.
    watcher.drain();
    server.move_bot(50.0, 64.0, 50.0, 0.0, 0.0);
    let follow = watcher.expect("position").await.unwrap();
    assert_eq!(follow.float("x"), Some(50.0));

    // Re-entering is an idempotent reset, not an error.
    watcher.chat("/view");
    let camera = watcher.expect("camera").await.unwrap();
    assert_eq!(camera.int("cameraId"), Some(GHOST_ENTITY_ID));
    assert_eq!(
        proxy.splice().ghost().mode_of(watcher_id),
        Some(CameraMode::BotPov)
    );

    watcher.chat("/unview");
    let camera = watcher.expect("camera").await.unwrap();
    // Camera returns to the observer's own entity (the session entity id).
    assert_eq!(camera.int("cameraId"), Some(1));
    let back = watcher.expect("position").await.unwrap();
    assert_eq!(back.float("x"), Some(5.0));
    assert_eq!(
        proxy.splice().ghost().mode_of(watcher_id),
        Some(CameraMode::Spectator)
    );
}

/// Clicking the ghost entity is consumed as an enter-bot-POV request, never
/// forwarded upstream.
#[tokio::test]
async fn clicking_the_ghost_enters_bot_pov() {
    let (proxy, mut server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut watcher = join(&proxy, "watcher").await;

    server.drain();
    watcher.click_entity(GHOST_ENTITY_ID);
    let camera = watcher.expect("camera").await.unwrap();
    assert_eq!(camera.int("cameraId"), Some(GHOST_ENTITY_ID));
    assert_eq!(
        proxy.splice().ghost().mode_of(watcher.session().id()),
        Some(CameraMode::BotPov)
    );
    settle().await;
    assert!(server.drain().iter().all(|p| p.name != "use_entity"));
}

#[tokio::test]
async fn tp_moves_a_spectator_to_the_bot() {
    let (proxy, server, _incoming) = rehearsal(quiet_config()).await.unwrap();
    let mut watcher = join(&proxy, "watcher").await;

    server.move_bot(33.0, 65.0, -12.0, 0.0, 0.0);
    settle().await;
    watcher.drain();

    watcher.chat("/tp");
    let teleport = watcher.expect("position").await.unwrap();
    assert_eq!(teleport.float("x"), Some(33.0));
    assert_eq!(teleport.float("z"), Some(-12.0));
}

use std::sync::Arc;
use std::time::Duration;

use ghostlink_proxy::config::Config;
use ghostlink_proxy::lifecycle::Proxy;
use ghostlink_proxy::sim::{ScriptedClient, SimConnector};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() {
    let config_path = std::env::args().skip_while(|a| a != "--config").nth(1);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let config = match &config_path {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(error) => {
                tracing::error!("failed to load {}: {:#}", path, error);
                return;
            }
        },
        None => Config::default(),
    };

    tracing::info!("ghostlink -- splice proxy rehearsal");
    tracing::info!(
        "account {} against {}:{} (embed a protocol codec behind RemoteConnector for a live deployment)",
        config.account.username,
        config.remote.host,
        config.remote.port,
    );

    let pilot_name = config.account.username.clone();
    let (connector, mut servers) = SimConnector::new(config.account_identity());
    let proxy = Proxy::new(config, connector);

    // Log every lifecycle event the way a plugin would consume them.
    let mut events = proxy.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!("lifecycle: {:?}", event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Err(error) = proxy.start().await {
        tracing::error!("start failed: {:#}", error);
        return;
    }
    let mut server = servers
        .recv()
        .await
        .expect("sim connector produced no server");
    server.complete_login();

    // The scripted backend: the bot wanders a circle while the splice does
    // its thing.
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        let mut angle: f64 = 0.0;
        loop {
            tick.tick().await;
            angle += 0.05;
            server.move_bot(
                8.0 * angle.cos(),
                64.0,
                8.0 * angle.sin(),
                angle.to_degrees() % 360.0,
                0.0,
            );
            for packet in server.drain() {
                tracing::debug!("serverbound: {}", packet);
            }
        }
    });

    // A spectator and the account owner walk through the core flows.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (watcher_session, mut watcher) = ScriptedClient::connect("watcher");
    let _ = proxy.handle_client_connect(watcher_session).await;

    let (pilot_session, mut pilot) = ScriptedClient::connect(&pilot_name);
    let _ = proxy.handle_client_connect(pilot_session).await;

    tokio::spawn(async move {
        while let Some(packet) = watcher.recv().await {
            if packet.name == "chat" {
                tracing::info!("watcher chat: {}", packet.data["message"]);
            }
        }
    });

    let script = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            pilot.chat("/link");
            tokio::time::sleep(Duration::from_secs(2)).await;
            pilot.chat("/unlink");
            tokio::time::sleep(Duration::from_millis(500)).await;
            pilot.chat("/view");
            tokio::time::sleep(Duration::from_secs(2)).await;
            pilot.chat("/unview | tp");
            loop {
                match pilot.recv().await {
                    Some(packet) if packet.name == "chat" => {
                        tracing::info!("pilot chat: {}", packet.data["message"]);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            drop(proxy);
        })
    };

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("ctrl+c received, shutting down...");
    script.abort();
    proxy.stop().await;
}

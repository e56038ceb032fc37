/**
 * Registry Listener Example
 *
 * Loads a JSON config, starts the registry in the configured mode and
 * prints every entity announcement and device update.
 *
 * Usage: cargo run --example listen -- ewelink.json
 */
use ewelink::protocol::SIGNAL_ADD_ENTITIES;
use ewelink::{Config, Registry};
use futures_util::StreamExt;
use serde_json::Value;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "ewelink.json".to_string());
    let config = match Config::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return;
        }
    };

    let registry = Registry::new(config);
    let mut entities = Box::pin(registry.dispatcher().stream(SIGNAL_ADD_ENTITIES));
    tokio::spawn(async move {
        while let Some(Value::Array(stubs)) = entities.next().await {
            for stub in stubs {
                println!("[ENTITY] {} {} {}", stub["deviceid"], stub["kind"], stub["name"]);
            }
        }
    });

    if let Err(e) = registry.start().await {
        eprintln!("[ERROR] Start failed: {}", e);
        return;
    }

    for device in registry.devices() {
        let mut updates = Box::pin(registry.dispatcher().stream(&device.deviceid));
        tokio::spawn(async move {
            while let Some(params) = updates.next().await {
                println!("[UPDATE] {} ({}): {}", device.deviceid, device.name, params);
            }
        });
    }

    println!("[INFO] Listening. Press Ctrl+C to stop.");
    let _ = tokio::signal::ctrl_c().await;
    registry.stop().await;
}

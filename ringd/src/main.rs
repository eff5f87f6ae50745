use std::sync::Arc;

use log::{error, info};

use ringd::bluez::{self, BluezTransport};
use ringd::cache::{JsonFileStore, MemoryStore, SnapshotStore};
use ringd::{config, debug_server, server, RingManager};

const DEFAULT_SOCKET: &str = "/tmp/ringd.sock";
const DEFAULT_CONFIG: &str = "ringd_config.json";
const DEFAULT_CACHE: &str = "ringd_snapshot.json";
const DEFAULT_DEBUG_PORT: u16 = 8828;

#[derive(Debug, Clone, PartialEq)]
struct Args {
    socket_path: String,
    config_path: String,
    cache_path: Option<String>,
    debug_port: u16,
    adapter: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = parse_args(std::env::args().collect());
    info!(
        "Ring daemon starting, socket: {}, config: {}, cache: {}, debug port: {}",
        args.socket_path,
        args.config_path,
        args.cache_path.as_deref().unwrap_or("memory"),
        args.debug_port
    );

    let mut cfg = config::load(&args.config_path).unwrap_or_default();
    if let Some(adapter) = &args.adapter {
        cfg.restore_id = adapter.clone();
    }
    let last_paired = cfg.paired.first().map(|d| d.id.clone());

    let transport = match BluezTransport::new().await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Cannot open BlueZ session: {}", e);
            return;
        }
    };
    let store: Arc<dyn SnapshotStore> = match &args.cache_path {
        Some(path) => Arc::new(JsonFileStore::new(path.clone())),
        None => Arc::new(MemoryStore::default()),
    };

    let manager = Arc::new(
        RingManager::builder(transport)
            .config(cfg)
            .persist_config_to(args.config_path.clone())
            .store(store)
            .classifier(bluez::classifier())
            .build(),
    );

    // Pick up where we left off with the most recently paired ring.
    if let Some(id) = last_paired {
        let manager = manager.clone();
        tokio::spawn(async move {
            info!("Reconnecting to saved ring {}", id);
            if !manager.connect(&id).await {
                info!("Saved ring {} not reachable, waiting for commands", id);
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server::run(manager.clone(), &args.socket_path) => {
            if let Err(e) = result {
                error!("Server task exited with error: {}", e);
            }
        }
        result = debug_server::run(manager.clone(), args.config_path.clone(), args.debug_port) => {
            if let Err(e) = result {
                error!("Debug server exited with error: {}", e);
            }
        }
    }

    manager.shutdown().await;
    info!("Ring daemon shutting down");
}

fn parse_args(args: Vec<String>) -> Args {
    let mut parsed = Args {
        socket_path: DEFAULT_SOCKET.to_string(),
        config_path: DEFAULT_CONFIG.to_string(),
        cache_path: Some(DEFAULT_CACHE.to_string()),
        debug_port: DEFAULT_DEBUG_PORT,
        adapter: None,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--socket" => {
                if let Some(path) = args.get(i + 1) {
                    parsed.socket_path = path.clone();
                    i += 1;
                }
            }
            "--config" => {
                if let Some(path) = args.get(i + 1) {
                    parsed.config_path = path.clone();
                    i += 1;
                }
            }
            "--cache" => {
                if let Some(path) = args.get(i + 1) {
                    parsed.cache_path = Some(path.clone());
                    i += 1;
                }
            }
            "--no-cache" => parsed.cache_path = None,
            "--debug-port" => {
                if let Some(port) = args.get(i + 1) {
                    parsed.debug_port = port.parse().unwrap_or(DEFAULT_DEBUG_PORT);
                    i += 1;
                }
            }
            "--adapter" => {
                if let Some(name) = args.get(i + 1) {
                    parsed.adapter = Some(name.clone());
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    parsed
}

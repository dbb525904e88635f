mod config;
mod dispatcher;
mod error;
mod mqtt;
mod reader;
mod server;
mod transport;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use enbridge::buffer::TelegramBuffer;
use enbridge::command::CommandEncoder;
use enbridge::device::DeviceRegistry;
use enbridge::eep::EepStore;
use enbridge::mapping::MappingStore;
use enbridge::state::StateCache;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, run_dispatcher};
use crate::error::BridgeError;
use crate::mqtt::start_mqtt;
use crate::reader::{FrameQueue, QUEUE_CAPACITY, spawn_reader};
use crate::server::{
    ServerState, add_custom_profile, add_device, delete_custom_profile, delete_device,
    delete_mapping, get_devices, get_gateway_info, get_mapping, get_mappings, get_profile,
    get_profiles, get_telegram_stats, get_telegrams, get_unknown_devices, send_command,
    set_mapping, update_device,
};
use crate::transport::Transport;

type AppRouter = Router<Arc<ServerState>>;

fn get_router() -> AppRouter {
    Router::new()
        .route("/api/devices", get(get_devices))
        .route("/api/devices", post(add_device))
        .route("/api/devices/{name}", put(update_device))
        .route("/api/devices/{name}", delete(delete_device))
        .route("/api/eep", get(get_profiles))
        .route("/api/eep/custom", post(add_custom_profile))
        .route("/api/eep/custom/{id}", delete(delete_custom_profile))
        .route("/api/eep/{id}", get(get_profile))
        .route("/api/mappings", get(get_mappings))
        .route("/api/mappings/{eep}", get(get_mapping))
        .route("/api/mappings/{eep}", put(set_mapping))
        .route("/api/mappings/{eep}", delete(delete_mapping))
        .route("/api/telegrams", get(get_telegrams))
        .route("/api/telegrams/unknown", get(get_unknown_devices))
        .route("/api/telegrams/stats", get(get_telegram_stats))
        .route("/api/gateway", get(get_gateway_info))
        .route("/api/gateway/send", post(send_command))
}

async fn run_server(
    task_tracker: &TaskTracker,
    state: Arc<ServerState>,
    shutdown_token: CancellationToken,
) -> Result<JoinHandle<()>, BridgeError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.admin_port));
    let listener = TcpListener::bind(&addr).await?;
    info!("admin API listening on {addr}");
    let app = get_router().with_state(state);

    Ok(task_tracker.spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_token.cancelled_owned())
            .await
        {
            error!("admin API server failed: {e}");
        }
    }))
}

/// The bundled profile library, overridable by a user copy in the config
/// directory.
fn find_eep_library(config_dir: &Path) -> Option<PathBuf> {
    let user_copy = config_dir.join("EEP.xml");
    if user_copy.exists() {
        return Some(user_copy);
    }
    let bundled = PathBuf::from("data/EEP.xml");
    bundled.exists().then_some(bundled)
}

fn run_shutdown_task(
    task_tracker: &TaskTracker,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    task_tracker.spawn(async move {
        select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("unable to listen for shutdown signal: {e}");
                }
                info!("shutting down");
            }
            _ = shutdown_token.cancelled() => {}
        }
        shutdown_token.cancel();
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BridgeError> {
    let config = Config::from_env();
    env_logger::Builder::new()
        .filter_level(config.log_level)
        .init();
    info!("starting EnOcean-MQTT bridge");

    let config_dir = PathBuf::from(&config.config_path);
    let library_path = find_eep_library(&config_dir);
    let eep_store = Arc::new(RwLock::new(
        EepStore::load(library_path.as_deref(), &config_dir.join("custom_eep")).await,
    ));
    let registry = Arc::new(RwLock::new(DeviceRegistry::load(&config_dir).await));
    let mappings = Arc::new(RwLock::new(MappingStore::load(&config_dir).await));
    let buffer = Arc::new(RwLock::new(TelegramBuffer::default()));
    let state_cache = StateCache::load(&config_dir).await;

    let task_tracker = TaskTracker::new();
    let shutdown_token = CancellationToken::new();

    let (command_tx, command_rx) = mpsc::channel(64);
    let (teach_in_tx, _) = broadcast::channel(16);
    let (telegram_tx, _) = broadcast::channel(64);

    let transport = Transport::open(&config.enocean_port)?;
    let writer = Arc::new(std::sync::Mutex::new(transport.writer()?));
    let frame_queue = Arc::new(FrameQueue::new(QUEUE_CAPACITY));
    let reader = spawn_reader(
        config.enocean_port.clone(),
        transport,
        writer.clone(),
        frame_queue.clone(),
    );
    let transport_connected = reader.connected_flag();

    let (mqtt, _mqtt_join) = start_mqtt(
        &task_tracker,
        &config,
        registry.clone(),
        mappings.clone(),
        state_cache,
        command_tx.clone(),
        shutdown_token.clone(),
    );

    run_dispatcher(
        &task_tracker,
        Dispatcher {
            registry: registry.clone(),
            eep_store: eep_store.clone(),
            buffer: buffer.clone(),
            mqtt: mqtt.clone(),
            encoder: CommandEncoder::new(),
            writer,
            teach_in_tx,
            telegram_tx,
        },
        frame_queue.clone(),
        command_rx,
        shutdown_token.clone(),
    );

    run_shutdown_task(&task_tracker, shutdown_token.clone());

    let state = Arc::new(ServerState {
        config,
        registry,
        eep_store,
        mappings,
        buffer,
        mqtt,
        command_tx,
        transport_connected,
        frame_queue,
    });
    run_server(&task_tracker, state, shutdown_token.clone()).await?;

    shutdown_token.cancelled().await;

    // Stop the blocking reader first; its next read returns within the
    // transport timeout. Then drain the async side, which flushes
    // outstanding disk writes and disconnects MQTT.
    reader.stop();

    task_tracker.close();
    task_tracker.wait().await;

    info!("gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_router() {
        // assert that creating the router does not panic from invalid
        // route patterns.
        let _ = get_router();
    }
}

//! MQTT side of the bridge: broker connection, retained state publishes
//! with restart persistence, Home Assistant discovery, and the inbound
//! command surface.
//!
//! Topic layout under the configured prefix `P` (default `enocean`):
//! `P/status` for gateway availability, `P/<device>/state` for retained
//! state, `P/<device>/set` (plus `brightness/set` and `position/set`) for
//! commands. Discovery documents go to the HA discovery prefix.
//!
//! Two tasks: one drives the rumqttc event loop (reconnecting with
//! exponential backoff), the other owns the state cache and serves
//! publish/discovery requests. Keeping them separate means a request
//! handler awaiting a publish can never starve the network loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use enbridge::command::CommandRequest;
use enbridge::device::DeviceRegistry;
use enbridge::mapping::{MappingStore, discovery_configs};
use enbridge::state::StateCache;

use crate::config::Config;

const RECONNECT_DELAY_MIN: Duration = Duration::from_millis(200);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(10);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

pub enum MqttRequest {
    /// Retained state publish for one device, persisted to the cache first.
    PublishState {
        device: String,
        state: Map<String, Value>,
    },
    /// (Re)announce all HA entities of one device.
    PublishDiscovery { device: String },
    /// Retract the HA entities of one device by publishing empty retained
    /// discovery payloads.
    RemoveDiscovery { device: String },
}

enum BrokerEvent {
    Connected,
    Message { topic: String, payload: String },
}

/// Cheap cloneable handle other components use to talk to the MQTT task.
#[derive(Clone)]
pub struct MqttHandle {
    tx: Sender<MqttRequest>,
    connected: Arc<AtomicBool>,
}

impl MqttHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn publish_state(&self, device: &str, state: Map<String, Value>) {
        self.send(MqttRequest::PublishState {
            device: device.to_string(),
            state,
        })
        .await;
    }

    pub async fn publish_discovery(&self, device: &str) {
        self.send(MqttRequest::PublishDiscovery {
            device: device.to_string(),
        })
        .await;
    }

    pub async fn remove_discovery(&self, device: &str) {
        self.send(MqttRequest::RemoveDiscovery {
            device: device.to_string(),
        })
        .await;
    }

    async fn send(&self, request: MqttRequest) {
        if self.tx.send(request).await.is_err() {
            warn!("MQTT task is gone, dropping request");
        }
    }
}

struct MqttTask {
    client: AsyncClient,
    prefix: String,
    discovery_prefix: String,
    cache_states: bool,
    connected: Arc<AtomicBool>,
    state_cache: StateCache,
    registry: Arc<RwLock<DeviceRegistry>>,
    mappings: Arc<RwLock<MappingStore>>,
    command_tx: Sender<CommandRequest>,
    states_restored: bool,
}

/// Spawns the MQTT event loop and request handler on the tracker and
/// returns the handle used for publishes.
pub fn start_mqtt(
    task_tracker: &TaskTracker,
    config: &Config,
    registry: Arc<RwLock<DeviceRegistry>>,
    mappings: Arc<RwLock<MappingStore>>,
    state_cache: StateCache,
    command_tx: Sender<CommandRequest>,
    shutdown_token: CancellationToken,
) -> (MqttHandle, JoinHandle<()>) {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        format!("{}/status", config.mqtt_prefix),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if !config.mqtt_user.is_empty() {
        options.set_credentials(config.mqtt_user.clone(), config.mqtt_password.clone());
    }

    let (client, event_loop) = AsyncClient::new(options, 64);
    let (tx, rx) = mpsc::channel(64);
    // Unbounded so the event loop never blocks on the request handler.
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));

    task_tracker.spawn(run_event_loop(
        event_loop,
        event_tx,
        connected.clone(),
        shutdown_token.clone(),
    ));

    let task = MqttTask {
        client,
        prefix: config.mqtt_prefix.clone(),
        discovery_prefix: config.mqtt_discovery_prefix.clone(),
        cache_states: config.cache_device_states,
        connected: connected.clone(),
        state_cache,
        registry,
        mappings,
        command_tx,
        states_restored: false,
    };
    let join = task_tracker.spawn(task.run(rx, event_rx, shutdown_token));

    (MqttHandle { tx, connected }, join)
}

/// Drives the broker connection. On poll errors the connection is retried
/// with exponential backoff (200 ms doubling up to 10 s); on shutdown the
/// loop keeps polling briefly so the farewell publish and DISCONNECT
/// actually reach the broker.
async fn run_event_loop(
    mut event_loop: EventLoop,
    events: UnboundedSender<BrokerEvent>,
    connected: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
) {
    let mut reconnect_delay = RECONNECT_DELAY_MIN;

    loop {
        tokio::select! {
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    reconnect_delay = RECONNECT_DELAY_MIN;
                    connected.store(true, Ordering::Relaxed);
                    let _ = events.send(BrokerEvent::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = events.send(BrokerEvent::Message {
                        topic: publish.topic.clone(),
                        payload: String::from_utf8_lossy(&publish.payload).to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("MQTT connection lost ({e}), retrying in {reconnect_delay:?}");
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(RECONNECT_DELAY_MAX);
                }
            },
            _ = shutdown_token.cancelled() => {
                drain_until_disconnect(&mut event_loop).await;
                break;
            }
        }
    }
}

async fn drain_until_disconnect(event_loop: &mut EventLoop) {
    let deadline = sleep(SHUTDOWN_DRAIN);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = event_loop.poll() => match event {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
}

impl MqttTask {
    async fn run(
        mut self,
        mut rx: Receiver<MqttRequest>,
        mut event_rx: UnboundedReceiver<BrokerEvent>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => match event {
                    BrokerEvent::Connected => self.on_connect().await,
                    BrokerEvent::Message { topic, payload } => {
                        self.on_message(&topic, &payload).await;
                    }
                },
                Some(request) = rx.recv() => self.handle_request(request).await,
                _ = shutdown_token.cancelled() => break,
            }
        }

        // Make the gateway disappear cleanly instead of waiting for the
        // broker to fire the last will.
        let status_topic = format!("{}/status", self.prefix);
        let _ = self
            .client
            .publish(status_topic, QoS::AtLeastOnce, true, "offline")
            .await;
        let _ = self.client.disconnect().await;
        info!("disconnected from MQTT broker");
    }

    async fn on_connect(&mut self) {
        info!("connected to MQTT broker");

        for suffix in ["set", "brightness/set", "position/set"] {
            let filter = format!("{}/+/{suffix}", self.prefix);
            if let Err(e) = self.client.subscribe(filter.clone(), QoS::AtMostOnce).await {
                warn!("failed to subscribe to {filter}: {e}");
            }
        }

        self.publish(&format!("{}/status", self.prefix), "online".into(), true)
            .await;

        if !self.states_restored {
            self.states_restored = true;
            self.restore_states().await;
        }
        self.announce_all_devices().await;
    }

    /// Republishes every persisted device state, marked `_restored`, so
    /// sparsely-transmitting sensors are visible right after a restart.
    async fn restore_states(&self) {
        let mut restored = 0;
        for (device, state) in self.state_cache.entries() {
            let Some(object) = state.as_object() else {
                continue;
            };
            let mut state = object.clone();
            state.insert("_restored".to_string(), Value::Bool(true));
            let topic = format!("{}/{device}/state", self.prefix);
            let payload = Value::Object(state).to_string();
            self.publish(&topic, payload, true).await;
            restored += 1;
        }
        if restored > 0 {
            info!("republished {restored} persisted device states");
        }
    }

    async fn announce_all_devices(&self) {
        let registry = self.registry.read().await;
        let mappings = self.mappings.read().await;
        for device in registry.all() {
            let mapping = mappings.get_mapping(&device.eep_id());
            if mapping.is_empty() && mappings.common().is_empty() {
                debug!("no mapping for {}, skipping discovery", device.eep_id());
                continue;
            }
            for config in discovery_configs(device, &mapping, mappings.common(), &self.prefix) {
                let topic = format!(
                    "{}/{}/{}/config",
                    self.discovery_prefix, config.component, config.unique_id
                );
                self.publish(&topic, config.payload.to_string(), true).await;
            }
        }
    }

    async fn on_message(&self, topic: &str, payload: &str) {
        debug!("MQTT RX [{topic}] = {payload}");

        let Some(rest) = topic.strip_prefix(&format!("{}/", self.prefix)) else {
            return;
        };
        let segments: Vec<&str> = rest.split('/').collect();

        let request = match segments.as_slice() {
            [device, "set"] => CommandRequest::from_payload(device, payload),
            [device, "brightness", "set"] => {
                CommandRequest::new(device, "dim", serde_json::from_str(payload.trim()).ok())
            }
            [device, "position", "set"] => {
                CommandRequest::new(device, "position", serde_json::from_str(payload.trim()).ok())
            }
            _ => return,
        };

        // try_send: the dispatcher may itself be waiting on this task's
        // request channel, so blocking here could deadlock the pair.
        if self.command_tx.try_send(request).is_err() {
            warn!("dispatcher busy or gone, dropping command from {topic}");
        }
    }

    async fn handle_request(&mut self, request: MqttRequest) {
        match request {
            MqttRequest::PublishState { device, mut state } => {
                state.insert(
                    "_last_update".to_string(),
                    Value::String(Local::now().to_rfc3339()),
                );

                // The cache file must hit disk before the retained publish:
                // a state observable on the broker has to survive a restart.
                if self.cache_states {
                    self.state_cache
                        .insert(&device, Value::Object(state.clone()));
                    if let Err(e) = self.state_cache.save().await {
                        warn!("failed to persist device states: {e}");
                    }
                }

                let topic = format!("{}/{device}/state", self.prefix);
                self.publish(&topic, Value::Object(state).to_string(), true)
                    .await;
            }
            MqttRequest::PublishDiscovery { device } => {
                self.publish_discovery(&device, false).await;
            }
            MqttRequest::RemoveDiscovery { device } => {
                self.publish_discovery(&device, true).await;
            }
        }
    }

    /// Publishes the discovery documents for one device; with `remove` set,
    /// empty retained payloads retract the HA entities instead.
    async fn publish_discovery(&self, device_name: &str, remove: bool) {
        let registry = self.registry.read().await;
        let Some(device) = registry.get(device_name) else {
            warn!("discovery requested for unknown device {device_name}");
            return;
        };

        let mappings = self.mappings.read().await;
        let mapping = mappings.get_mapping(&device.eep_id());
        for config in discovery_configs(device, &mapping, mappings.common(), &self.prefix) {
            let topic = format!(
                "{}/{}/{}/config",
                self.discovery_prefix, config.component, config.unique_id
            );
            let payload = if remove {
                String::new()
            } else {
                config.payload.to_string()
            };
            self.publish(&topic, payload, true).await;
        }
        info!(
            "{} discovery for {device_name}",
            if remove { "removed" } else { "published" }
        );
    }

    /// Publish with the drop-when-disconnected contract: callers never
    /// block on broker availability.
    async fn publish(&self, topic: &str, payload: String, retain: bool) {
        if !self.connected.load(Ordering::Relaxed) {
            warn!("MQTT not connected, dropping publish to {topic}");
            return;
        }
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
        {
            warn!("MQTT publish to {topic} failed: {e}");
        }
    }
}

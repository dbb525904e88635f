//! Telegram dispatcher: the single task that owns the receive pipeline
//! (frame → teach-in detection → registry lookup → decode → publish →
//! ring buffer) and the outbound command path. Telegrams are processed
//! strictly in arrival order.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::sync::mpsc::Receiver;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use enbridge::buffer::{TelegramBuffer, TelegramEntry};
use enbridge::command::{CommandEncoder, CommandRequest};
use enbridge::decode;
use enbridge::device::DeviceRegistry;
use enbridge::eep::EepStore;
use enbridge::esp3::{Esp3Packet, PacketType};
use enbridge::telegram::{BROADCAST_ID, RadioTelegram, TeachInEvent, encode_radio};

use crate::mqtt::MqttHandle;
use crate::reader::FrameQueue;
use crate::transport::SharedWriter;

pub struct Dispatcher {
    pub registry: Arc<RwLock<DeviceRegistry>>,
    pub eep_store: Arc<RwLock<EepStore>>,
    pub buffer: Arc<RwLock<TelegramBuffer>>,
    pub mqtt: MqttHandle,
    pub encoder: CommandEncoder,
    pub writer: SharedWriter,
    pub teach_in_tx: broadcast::Sender<TeachInEvent>,
    pub telegram_tx: broadcast::Sender<TelegramEntry>,
}

pub fn run_dispatcher(
    task_tracker: &TaskTracker,
    mut dispatcher: Dispatcher,
    frame_queue: Arc<FrameQueue>,
    mut command_rx: Receiver<CommandRequest>,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    task_tracker.spawn(async move {
        info!("dispatcher running");
        loop {
            tokio::select! {
                packet = frame_queue.pop() => dispatcher.handle_packet(packet).await,
                Some(request) = command_rx.recv() => dispatcher.handle_command(request).await,
                _ = shutdown_token.cancelled() => break,
            }
        }
        info!("dispatcher stopped");
    })
}

impl Dispatcher {
    async fn handle_packet(&mut self, packet: Esp3Packet) {
        match packet.packet_type() {
            Some(PacketType::RadioErp1) => self.process_radio(packet).await,
            Some(PacketType::Response) => {
                debug!("response packet: {}", hex_upper(&packet.data));
            }
            Some(PacketType::Event) => {
                info!("event packet: {}", hex_upper(&packet.data));
            }
            Some(PacketType::CommonCommand) => {
                debug!("ignoring common-command packet");
            }
            None => {
                debug!("ignoring unsupported packet type 0x{:02X}", packet.packet_type);
            }
        }
    }

    async fn process_radio(&mut self, packet: Esp3Packet) {
        let Some(telegram) = RadioTelegram::from_packet(&packet) else {
            debug!("malformed radio telegram, dropping");
            return;
        };

        info!(
            "RX [{}] RORG={} data={} dBm={}",
            telegram.sender_hex(),
            telegram.rorg_hex(),
            telegram.payload_hex(),
            telegram.dbm
        );

        if telegram.is_teach_in() {
            info!(
                "TEACH-IN [{}] RORG={}, new device wants to pair",
                telegram.sender_hex(),
                telegram.rorg_hex()
            );
            let _ = self.teach_in_tx.send(telegram.teach_in_event());
        }

        let device = {
            let registry = self.registry.read().await;
            registry.get_by_address(&telegram.sender_hex()).cloned()
        };

        let entry = match device {
            None => {
                info!("RX [{}] unknown device (not configured)", telegram.sender_hex());
                TelegramEntry::record(&telegram, None, None, None)
            }
            Some(device) => {
                let eep_id = device.eep_id();
                let profile = {
                    let eep_store = self.eep_store.read().await;
                    eep_store.get(&eep_id).cloned()
                };

                match profile {
                    None => {
                        warn!("unknown EEP profile {eep_id} for device {}", device.name);
                        TelegramEntry::record(&telegram, Some(device.name), Some(eep_id), None)
                    }
                    Some(profile) => {
                        let decoded = decode::decode(&telegram, &profile);
                        debug!("RX [{}] decoded: {:?}", device.name, decoded);
                        self.mqtt.publish_state(&device.name, decoded.clone()).await;
                        TelegramEntry::record(
                            &telegram,
                            Some(device.name),
                            Some(eep_id),
                            Some(decoded),
                        )
                    }
                }
            }
        };

        self.buffer.write().await.add(entry.clone());
        let _ = self.telegram_tx.send(entry);
    }

    async fn handle_command(&mut self, request: CommandRequest) {
        let device = {
            let registry = self.registry.read().await;
            registry.get(&request.device).cloned()
        };
        let Some(device) = device else {
            warn!("command for unknown device {:?}, dropping", request.device);
            return;
        };

        let Some(sender_id) = device.sender_u32() else {
            warn!("device {} has no sender_id configured", device.name);
            return;
        };
        let Some(rorg) = parse_rorg(&device.rorg) else {
            warn!("device {} has an invalid rorg {:?}", device.name, device.rorg);
            return;
        };

        let Some(payload) =
            self.encoder
                .encode(&device.eep_id(), &request.command, request.value.as_ref())
        else {
            warn!(
                "no encoding for command {:?} on device {}",
                request.command, device.name
            );
            return;
        };

        let destination = device.address_u32().unwrap_or(BROADCAST_ID);
        let packet = encode_radio(rorg, &payload, sender_id, destination);
        info!(
            "TX EnOcean: RORG={rorg:02X} data={} dest=0x{destination:08X}",
            hex_upper(&payload)
        );
        let result = self
            .writer
            .lock()
            .expect("transport writer lock poisoned")
            .write_frame(&packet.to_bytes());
        if let Err(e) = result {
            error!("failed to send telegram: {e}");
        }
    }
}

fn parse_rorg(rorg: &str) -> Option<u8> {
    let hex = rorg.trim().trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(hex, 16).ok()
}

fn hex_upper(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rorg() {
        assert_eq!(parse_rorg("0xD2"), Some(0xD2));
        assert_eq!(parse_rorg("a5"), Some(0xA5));
        assert_eq!(parse_rorg(""), None);
        assert_eq!(parse_rorg("XYZ"), None);
    }
}

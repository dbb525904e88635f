//! ERP1 radio telegrams: parsing RADIO_ERP1 packets into their semantic
//! parts, LRN-bit teach-in detection, and building outbound telegrams.

use bytes::Buf;
use serde::Serialize;

use crate::esp3::{Esp3Packet, PacketType};

pub const RORG_RPS: u8 = 0xF6;
pub const RORG_1BS: u8 = 0xD5;
pub const RORG_4BS: u8 = 0xA5;
pub const RORG_VLD: u8 = 0xD2;

/// Broadcast destination for outbound telegrams.
pub const BROADCAST_ID: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioTelegram {
    pub rorg: u8,
    /// Payload between the RORG byte and the sender id.
    pub payload: Vec<u8>,
    pub sender_id: u32,
    pub status: u8,
    pub dbm: i32,
}

impl RadioTelegram {
    /// Splits a RADIO_ERP1 packet's data block into rorg, payload, sender
    /// and status. Returns None for other packet types or for data blocks
    /// shorter than the 6-byte minimum.
    pub fn from_packet(packet: &Esp3Packet) -> Option<Self> {
        if packet.packet_type() != Some(PacketType::RadioErp1) {
            return None;
        }
        let data = &packet.data;
        if data.len() < 6 {
            return None;
        }

        let sender_id = (&data[data.len() - 5..data.len() - 1]).get_u32();
        let dbm = if packet.optional.len() >= 5 {
            -(packet.optional[4] as i32)
        } else {
            0
        };

        Some(RadioTelegram {
            rorg: data[0],
            payload: data[1..data.len() - 5].to_vec(),
            sender_id,
            status: data[data.len() - 1],
            dbm,
        })
    }

    pub fn sender_hex(&self) -> String {
        format!("0x{:08X}", self.sender_id)
    }

    pub fn rorg_hex(&self) -> String {
        format!("{:02X}", self.rorg)
    }

    pub fn payload_hex(&self) -> String {
        self.payload.iter().map(|b| format!("{b:02X}")).collect()
    }

    /// True when the LRN bit marks this telegram as a teach-in.
    ///
    /// RPS telegrams have no teach-in variant, and VLD (D2) teach-in is not
    /// handled: UTE negotiation is a different mechanism entirely, so VLD
    /// telegrams always report false here.
    pub fn is_teach_in(&self) -> bool {
        match self.rorg {
            RORG_1BS => self.payload.first().is_some_and(|b| b & 0x08 == 0),
            RORG_4BS => self.payload.len() >= 4 && self.payload[3] & 0x08 == 0,
            _ => false,
        }
    }

    /// The (func, type) pair a 4BS teach-in telegram advertises. None for
    /// every other rorg, and for 4BS variations without embedded profile.
    pub fn teach_in_eep(&self) -> Option<(u8, u8)> {
        if self.rorg != RORG_4BS || !self.is_teach_in() {
            return None;
        }
        let func = (self.payload[0] >> 2) & 0x3F;
        let typ = ((self.payload[0] & 0x03) << 5) | ((self.payload[1] >> 3) & 0x1F);
        Some((func, typ))
    }

    pub fn teach_in_event(&self) -> TeachInEvent {
        let (func, typ) = self.teach_in_eep().unwrap_or((0, 0));
        TeachInEvent {
            sender_id: self.sender_hex(),
            rorg: self.rorg_hex(),
            func: format!("{func:02X}"),
            typ: format!("{typ:02X}"),
            dbm: self.dbm,
        }
    }
}

/// Teach-in notification handed to observers (the admin surface's
/// WebSocket feed subscribes to these).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeachInEvent {
    pub sender_id: String,
    pub rorg: String,
    pub func: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub dbm: i32,
}

/// Builds an outbound RADIO_ERP1 packet: `rorg ‖ payload ‖ sender ‖ status 0`
/// with the fixed optional block (SubTelNum 3, destination, dBm 0xFF,
/// security 0).
pub fn encode_radio(rorg: u8, payload: &[u8], sender_id: u32, destination: u32) -> Esp3Packet {
    let mut data = Vec::with_capacity(payload.len() + 6);
    data.push(rorg);
    data.extend_from_slice(payload);
    data.extend_from_slice(&sender_id.to_be_bytes());
    data.push(0x00);

    let mut optional = Vec::with_capacity(7);
    optional.push(0x03);
    optional.extend_from_slice(&destination.to_be_bytes());
    optional.push(0xFF);
    optional.push(0x00);

    Esp3Packet::new(PacketType::RadioErp1, data, optional)
}

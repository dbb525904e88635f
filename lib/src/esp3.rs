//! ESP3 (EnOcean Serial Protocol v3) framing: the byte protocol spoken
//! between the host and a serial/TCP transceiver. A frame is
//! `[0x55][len_hi][len_lo][opt_len][ptype][header_crc][data][optional][data_crc]`
//! with both checksums computed over CRC-8, polynomial 0x07.

use crc::{Algorithm, Crc};
use log::debug;
use num_enum::TryFromPrimitive;

pub const SYNC_BYTE: u8 = 0x55;

/// Sync byte, four header bytes, header CRC.
pub const HEADER_LEN: usize = 6;

pub const CRC_8_ESP3_ALG: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x07,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xf4,
    residue: 0x00,
};

pub const CRC_8_ESP3: Crc<u8> = Crc::<u8>::new(&CRC_8_ESP3_ALG);

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    RadioErp1 = 0x01,
    Response = 0x02,
    Event = 0x04,
    CommonCommand = 0x05,
}

/// A validated ESP3 packet: the data and optional blocks of a frame whose
/// header and data CRCs both checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esp3Packet {
    pub packet_type: u8,
    pub data: Vec<u8>,
    pub optional: Vec<u8>,
}

impl Esp3Packet {
    pub fn new(packet_type: PacketType, data: Vec<u8>, optional: Vec<u8>) -> Self {
        Esp3Packet {
            packet_type: packet_type as u8,
            data,
            optional,
        }
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from_primitive(self.packet_type).ok()
    }

    /// Serialises the packet into the exact wire frame, both CRCs included.
    /// The data block must fit a 16-bit length and the optional block an
    /// 8-bit length; radio telegrams are far below either limit.
    pub fn to_bytes(&self) -> Vec<u8> {
        let data_len = self.data.len() as u16;
        let mut frame = Vec::with_capacity(HEADER_LEN + self.data.len() + self.optional.len() + 1);
        frame.push(SYNC_BYTE);
        frame.extend_from_slice(&data_len.to_be_bytes());
        frame.push(self.optional.len() as u8);
        frame.push(self.packet_type);
        frame.push(CRC_8_ESP3.checksum(&frame[1..5]));
        frame.extend_from_slice(&self.data);
        frame.extend_from_slice(&self.optional);
        frame.push(CRC_8_ESP3.checksum(&frame[HEADER_LEN..]));
        frame
    }
}

/// Incremental frame parser over an append-only byte stream.
///
/// Feed raw bytes with [`push`](Esp3Framer::push) and drain validated packets
/// with [`next_packet`](Esp3Framer::next_packet). On a CRC mismatch only the
/// sync byte is discarded, so a real frame starting inside a false one is
/// still found.
#[derive(Debug, Default)]
pub struct Esp3Framer {
    buf: Vec<u8>,
    crc_errors: u64,
}

impl Esp3Framer {
    pub fn new() -> Self {
        Esp3Framer::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of header or data CRC mismatches seen so far.
    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next validated packet, or None if the buffer holds no
    /// complete frame yet.
    pub fn next_packet(&mut self) -> Option<Esp3Packet> {
        loop {
            // Hunt for the sync byte, discarding everything before it.
            match self.buf.iter().position(|&b| b == SYNC_BYTE) {
                Some(0) => {}
                Some(n) => {
                    self.buf.drain(..n);
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            if CRC_8_ESP3.checksum(&self.buf[1..5]) != self.buf[5] {
                self.crc_errors += 1;
                debug!("ESP3 header CRC mismatch, resyncing");
                self.buf.drain(..1);
                continue;
            }

            let data_len = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
            let optional_len = self.buf[3] as usize;
            let total_len = HEADER_LEN + data_len + optional_len + 1;
            if self.buf.len() < total_len {
                return None;
            }

            if CRC_8_ESP3.checksum(&self.buf[HEADER_LEN..total_len - 1]) != self.buf[total_len - 1]
            {
                self.crc_errors += 1;
                debug!("ESP3 data CRC mismatch, resyncing");
                self.buf.drain(..1);
                continue;
            }

            let packet = Esp3Packet {
                packet_type: self.buf[4],
                data: self.buf[HEADER_LEN..HEADER_LEN + data_len].to_vec(),
                optional: self.buf[HEADER_LEN + data_len..total_len - 1].to_vec(),
            };
            self.buf.drain(..total_len);
            return Some(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temperature_packet() -> Esp3Packet {
        Esp3Packet::new(
            PacketType::RadioErp1,
            vec![0xA5, 0x00, 0x00, 0x55, 0x08, 0x05, 0x83, 0x4F, 0xA4, 0x00],
            vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x40, 0x00],
        )
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let packet = temperature_packet();
        let mut framer = Esp3Framer::new();
        framer.push(&packet.to_bytes());
        assert_eq!(framer.next_packet(), Some(packet));
        assert!(framer.next_packet().is_none());
        assert_eq!(framer.crc_errors(), 0);
    }

    #[test]
    fn test_header_layout() {
        let frame = temperature_packet().to_bytes();
        assert_eq!(&frame[..6], &[0x55, 0x00, 0x0A, 0x07, 0x01, 0xEB]);
        assert_eq!(frame.len(), 6 + 10 + 7 + 1);
    }

    #[test]
    fn test_junk_prefix_discarded() {
        let mut framer = Esp3Framer::new();
        framer.push(&[0x00, 0x13, 0x37]);
        assert!(framer.next_packet().is_none());
        framer.push(&temperature_packet().to_bytes());
        assert_eq!(framer.next_packet(), Some(temperature_packet()));
    }

    #[test]
    fn test_resync_after_bad_header() {
        let mut framer = Esp3Framer::new();
        // A sync byte followed by garbage with a bad header CRC, then a
        // valid frame. Only the leading sync byte may be discarded.
        framer.push(&[0x55, 0x01, 0x02, 0x03, 0x04, 0x00]);
        framer.push(&temperature_packet().to_bytes());
        assert_eq!(framer.next_packet(), Some(temperature_packet()));
        assert_eq!(framer.crc_errors(), 1);
    }

    #[test]
    fn test_resync_after_bad_data_crc() {
        let mut frame = temperature_packet().to_bytes();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let mut framer = Esp3Framer::new();
        framer.push(&frame);
        framer.push(&temperature_packet().to_bytes());
        assert_eq!(framer.next_packet(), Some(temperature_packet()));
        // One data CRC mismatch, plus one header mismatch while re-hunting
        // from the 0x55 that sits inside the corrupted frame's data block.
        assert_eq!(framer.crc_errors(), 2);
    }

    #[test]
    fn test_truncated_frame_waits_for_more_data() {
        let frame = temperature_packet().to_bytes();
        let mut framer = Esp3Framer::new();
        framer.push(&frame[..8]);
        assert!(framer.next_packet().is_none());
        framer.push(&frame[8..]);
        assert_eq!(framer.next_packet(), Some(temperature_packet()));
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let mut bytes = temperature_packet().to_bytes();
        let second = Esp3Packet::new(PacketType::Response, vec![0x00], vec![]);
        bytes.extend_from_slice(&second.to_bytes());
        let mut framer = Esp3Framer::new();
        framer.push(&bytes);
        assert_eq!(framer.next_packet(), Some(temperature_packet()));
        assert_eq!(framer.next_packet(), Some(second));
        assert!(framer.next_packet().is_none());
    }
}

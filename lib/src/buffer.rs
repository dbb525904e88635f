//! Ring buffer of recently received telegrams, plus a separate list of
//! senders that don't match any configured device. Both are bounded; the
//! oldest entries are evicted first.

use std::collections::VecDeque;

use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::telegram::RadioTelegram;

pub const DEFAULT_CAPACITY: usize = 200;
pub const UNKNOWN_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelegramEntry {
    pub timestamp: String,
    pub sender_id: String,
    pub rorg: String,
    pub data: String,
    pub status: u8,
    pub dbm: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eep_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<Map<String, Value>>,
    pub is_teach_in: bool,
}

impl TelegramEntry {
    /// Stamps a received telegram with the current time and its resolution
    /// outcome (device/profile/decoded map, when known).
    pub fn record(
        telegram: &RadioTelegram,
        device_name: Option<String>,
        eep_id: Option<String>,
        decoded: Option<Map<String, Value>>,
    ) -> Self {
        TelegramEntry {
            timestamp: Local::now().to_rfc3339(),
            sender_id: telegram.sender_hex(),
            rorg: telegram.rorg_hex(),
            data: telegram.payload_hex(),
            status: telegram.status,
            dbm: telegram.dbm,
            device_name,
            eep_id,
            decoded,
            is_teach_in: telegram.is_teach_in(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownSender {
    pub sender_id: String,
    pub rorg: String,
    pub first_seen: String,
    pub last_seen: String,
    pub count: u64,
    pub last_dbm: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub total_count: usize,
    pub max_size: usize,
    pub unknown_device_count: usize,
    pub teach_in_count: usize,
}

pub struct TelegramBuffer {
    capacity: usize,
    entries: VecDeque<TelegramEntry>,
    unknown: VecDeque<UnknownSender>,
}

impl Default for TelegramBuffer {
    fn default() -> Self {
        TelegramBuffer::new(DEFAULT_CAPACITY)
    }
}

impl TelegramBuffer {
    pub fn new(capacity: usize) -> Self {
        TelegramBuffer {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            unknown: VecDeque::new(),
        }
    }

    /// Appends an entry, evicting the oldest when full. Entries without a
    /// resolved device also update the unknown-sender list.
    pub fn add(&mut self, entry: TelegramEntry) {
        if entry.device_name.is_none() {
            self.track_unknown(&entry);
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn track_unknown(&mut self, entry: &TelegramEntry) {
        if let Some(record) = self
            .unknown
            .iter_mut()
            .find(|u| u.sender_id == entry.sender_id)
        {
            record.last_seen = entry.timestamp.clone();
            record.count += 1;
            record.last_dbm = entry.dbm;
            return;
        }

        if self.unknown.len() == UNKNOWN_CAPACITY {
            self.unknown.pop_front();
        }
        self.unknown.push_back(UnknownSender {
            sender_id: entry.sender_id.clone(),
            rorg: entry.rorg.clone(),
            first_seen: entry.timestamp.clone(),
            last_seen: entry.timestamp.clone(),
            count: 1,
            last_dbm: entry.dbm,
        });
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<TelegramEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn by_device(&self, device_name: &str, limit: usize) -> Vec<TelegramEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.device_name.as_deref() == Some(device_name))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn by_sender(&self, sender_id: &str, limit: usize) -> Vec<TelegramEntry> {
        let sender_id = sender_id.to_uppercase();
        self.entries
            .iter()
            .rev()
            .filter(|e| e.sender_id.to_uppercase() == sender_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn teach_ins(&self, limit: usize) -> Vec<TelegramEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.is_teach_in)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn unknown_devices(&self) -> Vec<UnknownSender> {
        self.unknown.iter().cloned().collect()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            total_count: self.entries.len(),
            max_size: self.capacity,
            unknown_device_count: self.unknown.len(),
            teach_in_count: self.entries.iter().filter(|e| e.is_teach_in).count(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.unknown.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::RORG_4BS;

    fn telegram(sender_id: u32) -> RadioTelegram {
        RadioTelegram {
            rorg: RORG_4BS,
            payload: vec![0x00, 0x00, 0x55, 0x08],
            sender_id,
            status: 0,
            dbm: -70,
        }
    }

    fn known_entry(sender_id: u32) -> TelegramEntry {
        TelegramEntry::record(
            &telegram(sender_id),
            Some("thermo".to_string()),
            Some("A5-02-05".to_string()),
            None,
        )
    }

    fn unknown_entry(sender_id: u32) -> TelegramEntry {
        TelegramEntry::record(&telegram(sender_id), None, None, None)
    }

    #[test]
    fn test_eviction_is_oldest_first() {
        let mut buffer = TelegramBuffer::new(3);
        for sender in 1..=5u32 {
            buffer.add(known_entry(sender));
        }

        let recent = buffer.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].sender_id, "0x00000005");
        assert_eq!(recent[2].sender_id, "0x00000003");
        assert_eq!(buffer.stats().total_count, 3);
    }

    #[test]
    fn test_unknown_sender_counting() {
        let mut buffer = TelegramBuffer::default();
        for _ in 0..3 {
            buffer.add(unknown_entry(0x12345678));
        }

        let unknown = buffer.unknown_devices();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].sender_id, "0x12345678");
        assert_eq!(unknown[0].rorg, "A5");
        assert_eq!(unknown[0].count, 3);
        assert_eq!(unknown[0].last_dbm, -70);
    }

    #[test]
    fn test_known_devices_not_tracked_as_unknown() {
        let mut buffer = TelegramBuffer::default();
        buffer.add(known_entry(1));
        assert!(buffer.unknown_devices().is_empty());
    }

    #[test]
    fn test_unknown_list_is_bounded() {
        let mut buffer = TelegramBuffer::default();
        for sender in 0..(UNKNOWN_CAPACITY as u32 + 10) {
            buffer.add(unknown_entry(sender));
        }
        assert_eq!(buffer.unknown_devices().len(), UNKNOWN_CAPACITY);
    }

    #[test]
    fn test_filters() {
        let mut buffer = TelegramBuffer::default();
        buffer.add(known_entry(1));
        buffer.add(unknown_entry(2));

        let mut teach_in = telegram(3);
        teach_in.payload = vec![0x00, 0x00, 0x00, 0x00];
        buffer.add(TelegramEntry::record(&teach_in, None, None, None));

        assert_eq!(buffer.by_device("thermo", 10).len(), 1);
        assert_eq!(buffer.by_sender("0x00000002", 10).len(), 1);
        assert_eq!(buffer.by_sender("0X00000002", 10).len(), 1);
        assert_eq!(buffer.teach_ins(10).len(), 1);
        assert_eq!(buffer.stats().teach_in_count, 1);

        buffer.clear();
        assert_eq!(buffer.stats().total_count, 0);
        assert!(buffer.unknown_devices().is_empty());
    }
}

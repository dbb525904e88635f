//! Device registry: maps radio sender addresses to configured devices and
//! persists the device list.
//!
//! The primary store is `devices.json`; a legacy INI file
//! (`enoceanmqtt.devices`) is read as a fallback and kept up to date on
//! every mutation so older tooling keeps working.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

pub const DEVICES_FILE: &str = "devices.json";
pub const LEGACY_DEVICES_FILE: &str = "enoceanmqtt.devices";

#[derive(Debug, Error)]
pub enum DeviceStoreError {
    #[error("Device {0:?} already exists")]
    DuplicateName(String),
    #[error("A device with address {0} already exists")]
    DuplicateAddress(String),
    #[error("No device named {0:?}")]
    NoSuchDevice(String),
    #[error("Couldn't read device store: {0}")]
    Read(std::io::Error),
    #[error("Couldn't write device store: {0}")]
    Write(std::io::Error),
    #[error("Couldn't parse device store: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub name: String,
    pub address: String,
    pub rorg: String,
    pub func: String,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,
}

impl Device {
    pub fn eep_id(&self) -> String {
        crate::eep::make_eep_id(&self.rorg, &self.func, &self.typ)
    }

    pub fn address_u32(&self) -> Option<u32> {
        parse_hex_u32(&self.address)
    }

    pub fn sender_u32(&self) -> Option<u32> {
        parse_hex_u32(&self.sender_id)
    }
}

fn parse_hex_u32(value: &str) -> Option<u32> {
    let hex = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(hex, 16).ok()
}

/// Canonical address form used on both sides of lookups: `0x` + uppercase
/// hex digits.
pub fn normalize_address(address: &str) -> String {
    let hex = address
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    format!("0x{}", hex.to_uppercase())
}

pub struct DeviceRegistry {
    config_dir: PathBuf,
    devices: BTreeMap<String, Device>,
}

impl DeviceRegistry {
    /// Loads the registry from `devices.json`, falling back to the legacy
    /// INI store (and migrating it to JSON) when only that exists.
    pub async fn load(config_dir: &Path) -> Self {
        let mut registry = DeviceRegistry {
            config_dir: config_dir.to_path_buf(),
            devices: BTreeMap::new(),
        };

        match fs::read_to_string(registry.json_path()).await {
            Ok(content) => match registry.parse_json(&content) {
                Ok(()) => info!("loaded {} devices", registry.len()),
                Err(e) => error!("failed to parse {DEVICES_FILE}: {e}"),
            },
            Err(_) => match fs::read_to_string(registry.legacy_path()).await {
                Ok(content) => {
                    registry.devices = parse_legacy(&content);
                    info!(
                        "loaded {} devices from legacy store, migrating to JSON",
                        registry.len()
                    );
                    if let Err(e) = registry.save().await {
                        error!("failed to migrate legacy device store: {e}");
                    }
                }
                Err(_) => info!("no device configuration found, starting fresh"),
            },
        }

        registry
    }

    fn json_path(&self) -> PathBuf {
        self.config_dir.join(DEVICES_FILE)
    }

    fn legacy_path(&self) -> PathBuf {
        self.config_dir.join(LEGACY_DEVICES_FILE)
    }

    fn parse_json(&mut self, content: &str) -> Result<(), DeviceStoreError> {
        let parsed: BTreeMap<String, Device> = serde_json::from_str(content)?;
        self.devices = parsed
            .into_iter()
            .map(|(name, mut device)| {
                device.name = name.clone();
                (name, device)
            })
            .collect();
        Ok(())
    }

    /// Rewrites both stores. The JSON file is replaced atomically; the
    /// legacy INI mirror is best-effort.
    pub async fn save(&self) -> Result<(), DeviceStoreError> {
        fs::create_dir_all(&self.config_dir)
            .await
            .map_err(DeviceStoreError::Write)?;

        let json = serde_json::to_string_pretty(&self.devices)?;
        let tmp_path = self.json_path().with_extension("json.new");
        fs::write(&tmp_path, json)
            .await
            .map_err(DeviceStoreError::Write)?;
        fs::rename(&tmp_path, self.json_path())
            .await
            .map_err(DeviceStoreError::Write)?;

        if let Err(e) = fs::write(self.legacy_path(), write_legacy(&self.devices)).await {
            warn!("failed to write legacy device store: {e}");
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// First device whose normalised address matches.
    pub fn get_by_address(&self, address: &str) -> Option<&Device> {
        let wanted = normalize_address(address);
        self.devices
            .values()
            .find(|d| normalize_address(&d.address) == wanted)
    }

    pub async fn add(&mut self, device: Device) -> Result<(), DeviceStoreError> {
        if self.devices.contains_key(&device.name) {
            return Err(DeviceStoreError::DuplicateName(device.name));
        }
        if self.get_by_address(&device.address).is_some() {
            return Err(DeviceStoreError::DuplicateAddress(normalize_address(
                &device.address,
            )));
        }

        info!("added device {}", device.name);
        self.devices.insert(device.name.clone(), device);
        self.save().await
    }

    pub async fn update(&mut self, name: &str, mut device: Device) -> Result<(), DeviceStoreError> {
        if !self.devices.contains_key(name) {
            return Err(DeviceStoreError::NoSuchDevice(name.to_string()));
        }
        let address_taken = self
            .get_by_address(&device.address)
            .is_some_and(|other| other.name != name);
        if address_taken {
            return Err(DeviceStoreError::DuplicateAddress(normalize_address(
                &device.address,
            )));
        }

        device.name = name.to_string();
        self.devices.insert(name.to_string(), device);
        info!("updated device {name}");
        self.save().await
    }

    pub async fn delete(&mut self, name: &str) -> Result<Device, DeviceStoreError> {
        let device = self
            .devices
            .remove(name)
            .ok_or_else(|| DeviceStoreError::NoSuchDevice(name.to_string()))?;
        info!("deleted device {name}");
        self.save().await?;
        Ok(device)
    }

    pub fn all(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Case-insensitive substring search over names and addresses.
    pub fn search(&self, query: &str) -> Vec<&Device> {
        let query = query.to_lowercase();
        self.devices
            .values()
            .filter(|d| {
                d.name.to_lowercase().contains(&query)
                    || d.address.to_lowercase().contains(&query)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Parses the legacy INI store: one `[section]` per device, `key = value`
/// lines, with rorg/func/type written as `0x<HEX>`. The `[CONFIG]` section
/// belongs to the legacy consumer and is skipped.
fn parse_legacy(content: &str) -> BTreeMap<String, Device> {
    let mut devices = BTreeMap::new();
    let mut current: Option<Device> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some(device) = current.take() {
                devices.insert(device.name.clone(), device);
            }
            if name != "CONFIG" {
                current = Some(Device {
                    name: name.to_string(),
                    address: String::new(),
                    rorg: String::new(),
                    func: String::new(),
                    typ: String::new(),
                    sender_id: String::new(),
                    description: String::new(),
                    room: String::new(),
                    manufacturer: String::new(),
                });
            }
            continue;
        }

        let Some(device) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "address" => device.address = value.to_string(),
            "rorg" => device.rorg = strip_hex_prefix(value),
            "func" => device.func = strip_hex_prefix(value),
            "type" => device.typ = strip_hex_prefix(value),
            "sender_id" => device.sender_id = value.to_string(),
            _ => {}
        }
    }

    if let Some(device) = current.take() {
        devices.insert(device.name.clone(), device);
    }
    devices
}

fn strip_hex_prefix(value: &str) -> String {
    value
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .to_uppercase()
}

fn write_legacy(devices: &BTreeMap<String, Device>) -> String {
    let mut out = String::new();
    for device in devices.values() {
        out.push_str(&format!("[{}]\n", device.name));
        out.push_str(&format!("address = {}\n", device.address));
        out.push_str(&format!("rorg = 0x{}\n", device.rorg));
        out.push_str(&format!("func = 0x{}\n", device.func));
        out.push_str(&format!("type = 0x{}\n", device.typ));
        if !device.sender_id.is_empty() {
            out.push_str(&format!("sender_id = {}\n", device.sender_id));
        }
        out.push('\n');
    }
    out
}

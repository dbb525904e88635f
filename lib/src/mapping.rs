//! EEP-field → Home Assistant entity mapping, and the MQTT discovery
//! payloads built from it.
//!
//! A mapping assigns each profile field shortcut an HA entity description
//! (component, device class, unit, …). User mappings from `mapping.yaml`
//! take precedence over the compiled-in defaults, per shortcut table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::fs;

use crate::device::Device;

pub const MAPPING_FILE: &str = "mapping.yaml";

/// Key in the mapping file whose entries are appended to every device's
/// discovery, regardless of EEP (typically `rssi` and `last_update`).
pub const COMMON_KEY: &str = "common";

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Couldn't write mapping file: {0}")]
    Write(std::io::Error),
    #[error("Couldn't parse mapping file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// One HA entity bound to a field shortcut. Keys this service doesn't know
/// about are kept in `extra` and passed through to the discovery payload
/// untouched, so the mapping file can track HA schema additions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaEntity {
    #[serde(default = "default_component")]
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub brightness: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_component() -> String {
    "sensor".to_string()
}

impl Default for HaEntity {
    fn default() -> Self {
        HaEntity {
            component: default_component(),
            name: None,
            device_class: None,
            unit_of_measurement: None,
            icon: None,
            value_template: None,
            brightness: false,
            extra: Map::new(),
        }
    }
}

pub type EntityMap = BTreeMap<String, HaEntity>;

fn entity(component: &str, name: &str) -> HaEntity {
    HaEntity {
        component: component.to_string(),
        name: Some(name.to_string()),
        ..HaEntity::default()
    }
}

fn sensor(name: &str, device_class: &str, unit: &str) -> HaEntity {
    HaEntity {
        device_class: (!device_class.is_empty()).then(|| device_class.to_string()),
        unit_of_measurement: (!unit.is_empty()).then(|| unit.to_string()),
        ..entity("sensor", name)
    }
}

fn binary_sensor(name: &str, device_class: &str) -> HaEntity {
    HaEntity {
        device_class: Some(device_class.to_string()),
        ..entity("binary_sensor", name)
    }
}

/// Compiled-in fallback mappings for common profiles.
fn default_mappings() -> &'static BTreeMap<String, EntityMap> {
    static DEFAULTS: OnceLock<BTreeMap<String, EntityMap>> = OnceLock::new();
    DEFAULTS.get_or_init(|| {
        let mut defaults = BTreeMap::new();

        defaults.insert(
            "A5-02-05".to_string(),
            EntityMap::from([("TMP".to_string(), sensor("Temperature", "temperature", "°C"))]),
        );
        defaults.insert(
            "A5-04-01".to_string(),
            EntityMap::from([
                ("TMP".to_string(), sensor("Temperature", "temperature", "°C")),
                ("HUM".to_string(), sensor("Humidity", "humidity", "%")),
            ]),
        );
        defaults.insert(
            "A5-07-01".to_string(),
            EntityMap::from([
                ("PIR".to_string(), binary_sensor("Occupancy", "occupancy")),
                ("SVC".to_string(), sensor("Supply Voltage", "voltage", "V")),
            ]),
        );
        defaults.insert(
            "A5-30-03".to_string(),
            EntityMap::from([
                ("DI0".to_string(), binary_sensor("Input 0", "power")),
                ("DI1".to_string(), binary_sensor("Input 1", "power")),
                ("DI2".to_string(), binary_sensor("Input 2", "power")),
                ("DI3".to_string(), binary_sensor("Input 3", "power")),
            ]),
        );
        defaults.insert(
            "D5-00-01".to_string(),
            EntityMap::from([("CO".to_string(), binary_sensor("Contact", "door"))]),
        );
        defaults.insert(
            "F6-02-01".to_string(),
            EntityMap::from([
                ("R1".to_string(), binary_sensor("Rocker 1", "power")),
                ("R2".to_string(), binary_sensor("Rocker 2", "power")),
                ("EB".to_string(), binary_sensor("Energy Bow", "power")),
            ]),
        );
        defaults.insert(
            "D2-01-0F".to_string(),
            EntityMap::from([
                (
                    "CMD".to_string(),
                    HaEntity {
                        icon: Some("mdi:power".to_string()),
                        ..entity("switch", "Switch")
                    },
                ),
                ("OV".to_string(), sensor("Output Value", "", "%")),
            ]),
        );
        defaults.insert(
            "D2-05-00".to_string(),
            EntityMap::from([
                (
                    "POS".to_string(),
                    HaEntity {
                        device_class: Some("blind".to_string()),
                        ..entity("cover", "Position")
                    },
                ),
                ("ANG".to_string(), sensor("Angle", "", "°")),
            ]),
        );

        defaults
    })
}

/// Custom mapping table persisted in `mapping.yaml`, resolved over the
/// compiled-in defaults.
pub struct MappingStore {
    path: PathBuf,
    custom: BTreeMap<String, EntityMap>,
    common: EntityMap,
}

impl MappingStore {
    pub async fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(MAPPING_FILE);
        let mut store = MappingStore {
            path,
            custom: BTreeMap::new(),
            common: EntityMap::new(),
        };

        if let Ok(content) = fs::read_to_string(&store.path).await {
            match store.parse(&content) {
                Ok(()) => info!(
                    "loaded {} custom mappings ({} common entries)",
                    store.custom.len(),
                    store.common.len()
                ),
                Err(e) => error!("failed to parse {MAPPING_FILE}: {e}"),
            }
        }

        store
    }

    fn parse(&mut self, content: &str) -> Result<(), MappingError> {
        let mut parsed: BTreeMap<String, EntityMap> = serde_yaml::from_str(content)?;
        self.common = parsed.remove(COMMON_KEY).unwrap_or_default();
        self.custom = parsed
            .into_iter()
            .map(|(eep, mapping)| (eep.to_uppercase(), mapping))
            .collect();
        Ok(())
    }

    /// Effective mapping for a profile: the custom table if one exists,
    /// else the compiled-in default, else empty.
    pub fn get_mapping(&self, eep_id: &str) -> EntityMap {
        let eep_id = eep_id.to_uppercase();
        self.custom
            .get(&eep_id)
            .or_else(|| default_mappings().get(&eep_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn common(&self) -> &EntityMap {
        &self.common
    }

    /// Merged view of every known mapping, custom entries shadowing
    /// defaults.
    pub fn all(&self) -> BTreeMap<String, EntityMap> {
        let mut merged = default_mappings().clone();
        for (eep, mapping) in &self.custom {
            merged.insert(eep.clone(), mapping.clone());
        }
        merged
    }

    pub async fn set_mapping(
        &mut self,
        eep_id: &str,
        mapping: EntityMap,
    ) -> Result<(), MappingError> {
        self.custom.insert(eep_id.to_uppercase(), mapping);
        self.save().await
    }

    pub async fn delete_mapping(&mut self, eep_id: &str) -> Result<bool, MappingError> {
        if self.custom.remove(&eep_id.to_uppercase()).is_none() {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    async fn save(&self) -> Result<(), MappingError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(MappingError::Write)?;
        }

        let mut document = self.custom.clone();
        if !self.common.is_empty() {
            document.insert(COMMON_KEY.to_string(), self.common.clone());
        }
        let yaml = serde_yaml::to_string(&document)?;

        let tmp_path = self.path.with_extension("yaml.new");
        fs::write(&tmp_path, yaml)
            .await
            .map_err(MappingError::Write)?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(MappingError::Write)?;
        Ok(())
    }
}

/// A single HA discovery document, ready to publish retained to
/// `<discovery-prefix>/<component>/<unique_id>/config`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryConfig {
    pub component: String,
    pub unique_id: String,
    pub payload: Value,
}

fn object_name(device_name: &str, shortcut: &str) -> String {
    format!("{device_name}_{shortcut}")
        .to_lowercase()
        .replace(' ', "_")
}

/// Builds the discovery documents for one device from its effective mapping
/// plus the common entries.
pub fn discovery_configs(
    device: &Device,
    mapping: &EntityMap,
    common: &EntityMap,
    prefix: &str,
) -> Vec<DiscoveryConfig> {
    let state_topic = format!("{prefix}/{}/state", device.name);
    let device_block = json!({
        "identifiers": [format!("enocean_{}", device.address)],
        "name": if device.description.is_empty() { device.name.as_str() } else { device.description.as_str() },
        "manufacturer": if device.manufacturer.is_empty() { "EnOcean" } else { device.manufacturer.as_str() },
        "model": device.eep_id(),
        "via_device": "enocean_gateway",
    });
    let availability = json!({
        "topic": format!("{prefix}/status"),
        "payload_available": "online",
        "payload_not_available": "offline",
    });

    mapping
        .iter()
        .chain(common.iter())
        .map(|(shortcut, ha_entity)| {
            let unique_id = format!("enocean_{}", object_name(&device.name, shortcut));
            let mut payload = Map::new();

            payload.insert(
                "name".to_string(),
                Value::String(ha_entity.name.clone().unwrap_or_else(|| shortcut.clone())),
            );
            payload.insert("unique_id".to_string(), Value::String(unique_id.clone()));
            payload.insert(
                "object_id".to_string(),
                Value::String(object_name(&device.name, shortcut)),
            );
            payload.insert("state_topic".to_string(), Value::String(state_topic.clone()));
            payload.insert(
                "value_template".to_string(),
                Value::String(
                    ha_entity
                        .value_template
                        .clone()
                        .unwrap_or_else(|| format!("{{{{ value_json.{shortcut} }}}}")),
                ),
            );

            if let Some(device_class) = &ha_entity.device_class {
                payload.insert(
                    "device_class".to_string(),
                    Value::String(device_class.clone()),
                );
            }
            if let Some(unit) = &ha_entity.unit_of_measurement {
                payload.insert(
                    "unit_of_measurement".to_string(),
                    Value::String(unit.clone()),
                );
            }
            if let Some(icon) = &ha_entity.icon {
                payload.insert("icon".to_string(), Value::String(icon.clone()));
            }

            if matches!(
                ha_entity.component.as_str(),
                "switch" | "light" | "cover" | "climate" | "fan"
            ) {
                payload.insert(
                    "command_topic".to_string(),
                    Value::String(format!("{prefix}/{}/set", device.name)),
                );

                if ha_entity.component == "light" && ha_entity.brightness {
                    payload.insert(
                        "brightness_state_topic".to_string(),
                        Value::String(state_topic.clone()),
                    );
                    payload.insert(
                        "brightness_value_template".to_string(),
                        Value::String(format!("{{{{ value_json.{shortcut} }}}}")),
                    );
                    payload.insert(
                        "brightness_command_topic".to_string(),
                        Value::String(format!("{prefix}/{}/brightness/set", device.name)),
                    );
                    payload.insert("brightness_scale".to_string(), Value::from(100));
                }

                if ha_entity.component == "cover" {
                    payload.insert(
                        "position_topic".to_string(),
                        Value::String(state_topic.clone()),
                    );
                    payload.insert(
                        "position_template".to_string(),
                        Value::String(format!("{{{{ value_json.{shortcut} }}}}")),
                    );
                    payload.insert(
                        "set_position_topic".to_string(),
                        Value::String(format!("{prefix}/{}/position/set", device.name)),
                    );
                }
            }

            for (key, value) in &ha_entity.extra {
                payload.insert(key.clone(), value.clone());
            }

            payload.insert("device".to_string(), device_block.clone());
            payload.insert("availability".to_string(), availability.clone());

            DiscoveryConfig {
                component: ha_entity.component.clone(),
                unique_id,
                payload: Value::Object(payload),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lamp() -> Device {
        Device {
            name: "Desk Lamp".to_string(),
            address: "0xFFD97100".to_string(),
            rorg: "D2".to_string(),
            func: "01".to_string(),
            typ: "0F".to_string(),
            sender_id: "0xFFAABBCC".to_string(),
            description: String::new(),
            room: String::new(),
            manufacturer: String::new(),
        }
    }

    #[test]
    fn test_default_table_matches_spec() {
        let defaults = default_mappings();
        assert_eq!(defaults.len(), 8);

        let tmp = &defaults["A5-02-05"]["TMP"];
        assert_eq!(tmp.component, "sensor");
        assert_eq!(tmp.device_class.as_deref(), Some("temperature"));
        assert_eq!(tmp.unit_of_measurement.as_deref(), Some("°C"));

        assert_eq!(defaults["A5-30-03"].len(), 4);
        assert_eq!(defaults["F6-02-01"]["EB"].component, "binary_sensor");
        assert_eq!(defaults["D2-01-0F"]["CMD"].component, "switch");
        assert_eq!(
            defaults["D2-05-00"]["POS"].device_class.as_deref(),
            Some("blind")
        );
    }

    #[tokio::test]
    async fn test_custom_mapping_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let mut store = MappingStore::load(dir.path()).await;

        assert_eq!(store.get_mapping("a5-02-05")["TMP"].component, "sensor");
        assert!(store.get_mapping("FF-FF-FF").is_empty());

        let custom = EntityMap::from([("TMP".to_string(), binary_sensor("Frost", "cold"))]);
        store.set_mapping("A5-02-05", custom).await.unwrap();
        assert_eq!(
            store.get_mapping("A5-02-05")["TMP"].component,
            "binary_sensor"
        );

        // A reload sees the persisted custom table.
        let reloaded = MappingStore::load(dir.path()).await;
        assert_eq!(
            reloaded.get_mapping("A5-02-05")["TMP"].component,
            "binary_sensor"
        );

        assert!(store.delete_mapping("A5-02-05").await.unwrap());
        assert_eq!(store.get_mapping("A5-02-05")["TMP"].component, "sensor");
        assert!(!store.delete_mapping("A5-02-05").await.unwrap());
    }

    #[tokio::test]
    async fn test_common_section_and_unknown_keys_survive() {
        let dir = TempDir::new().unwrap();
        let yaml = "\
common:
  rssi:
    component: sensor
    name: RSSI
    unit_of_measurement: dBm
    entity_category: diagnostic
";
        std::fs::write(dir.path().join(MAPPING_FILE), yaml).unwrap();

        let store = MappingStore::load(dir.path()).await;
        let rssi = &store.common()["rssi"];
        assert_eq!(rssi.unit_of_measurement.as_deref(), Some("dBm"));
        assert_eq!(rssi.extra["entity_category"], Value::from("diagnostic"));
        assert!(store.get_mapping(COMMON_KEY).is_empty());
    }

    #[test]
    fn test_discovery_for_sensor() {
        let mut device = lamp();
        device.rorg = "A5".to_string();
        device.func = "02".to_string();
        device.typ = "05".to_string();
        let mapping = default_mappings()["A5-02-05"].clone();

        let configs = discovery_configs(&device, &mapping, &EntityMap::new(), "enocean");
        assert_eq!(configs.len(), 1);
        let config = &configs[0];
        assert_eq!(config.component, "sensor");
        assert_eq!(config.unique_id, "enocean_desk_lamp_tmp");

        let payload = config.payload.as_object().unwrap();
        assert_eq!(payload["state_topic"], "enocean/Desk Lamp/state");
        assert_eq!(payload["value_template"], "{{ value_json.TMP }}");
        assert_eq!(payload["device"]["model"], "A5-02-05");
        assert_eq!(payload["device"]["via_device"], "enocean_gateway");
        assert_eq!(payload["availability"]["topic"], "enocean/status");
        assert!(!payload.contains_key("command_topic"));
    }

    #[test]
    fn test_discovery_for_dimmable_light() {
        let device = lamp();
        let mapping = EntityMap::from([(
            "DIM".to_string(),
            HaEntity {
                brightness: true,
                ..entity("light", "Lamp")
            },
        )]);

        let configs = discovery_configs(&device, &mapping, &EntityMap::new(), "enocean");
        let payload = configs[0].payload.as_object().unwrap();
        assert_eq!(payload["command_topic"], "enocean/Desk Lamp/set");
        assert_eq!(
            payload["brightness_command_topic"],
            "enocean/Desk Lamp/brightness/set"
        );
        assert_eq!(payload["brightness_scale"], 100);
    }

    #[test]
    fn test_discovery_for_cover_and_common_entries() {
        let mut device = lamp();
        device.name = "shade".to_string();
        let mapping = EntityMap::from([(
            "POS".to_string(),
            HaEntity {
                device_class: Some("blind".to_string()),
                ..entity("cover", "Position")
            },
        )]);
        let common = EntityMap::from([("rssi".to_string(), sensor("RSSI", "", "dBm"))]);

        let configs = discovery_configs(&device, &mapping, &common, "enocean");
        assert_eq!(configs.len(), 2);

        let cover = configs
            .iter()
            .find(|c| c.component == "cover")
            .unwrap()
            .payload
            .as_object()
            .unwrap();
        assert_eq!(cover["set_position_topic"], "enocean/shade/position/set");
        assert_eq!(cover["position_template"], "{{ value_json.POS }}");

        let rssi = configs.iter().find(|c| c.component == "sensor").unwrap();
        assert_eq!(rssi.unique_id, "enocean_shade_rssi");
    }
}

//! EnOcean Equipment Profile (EEP) library: parses the official profile XML,
//! merges user-supplied YAML overrides and exposes field descriptors to the
//! decoder.
//!
//! A profile is keyed by `RORG-FUNC-TYPE` (two uppercase hex chars each,
//! e.g. `A5-02-05`) and carries an ordered list of bit-field descriptors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum EepError {
    #[error("Couldn't read profile file: {0}")]
    Read(std::io::Error),
    #[error("Couldn't write profile file: {0}")]
    Write(std::io::Error),
    #[error("Couldn't parse EEP XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("Couldn't parse profile YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("No custom profile with id {0}")]
    NoSuchCustomProfile(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumItem {
    #[serde(deserialize_with = "flexible_string")]
    pub value: String,
    #[serde(default)]
    pub description: String,
}

/// YAML authors write `value: 0` or `func: 02` as often as the quoted
/// forms; accept scalars of any shape as their string rendering.
fn flexible_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Int(value) => value.to_string(),
        Raw::Float(value) => value.to_string(),
    })
}

/// What a field's raw bits mean. Decoding pattern-matches on this.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Enum {
        items: Vec<EnumItem>,
    },
    Value {
        range_min: f64,
        range_max: f64,
        scale_min: f64,
        scale_max: f64,
        unit: Option<String>,
    },
    Status,
    Raw,
}

/// One bit field of a profile: `size` bits starting `offset` bits from the
/// MSB of the telegram payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FieldSpec", into = "FieldSpec")]
pub struct FieldDescriptor {
    pub shortcut: String,
    pub description: String,
    pub offset: u32,
    pub size: u32,
    pub kind: FieldKind,
}

/// Flat serde form of a field, matching the custom-profile YAML layout and
/// the admin API:
/// `{shortcut, type, offset, size, min, max, scale_min, scale_max, unit, values}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(default)]
    pub shortcut: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_field_type", rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_field_size")]
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<EnumItem>,
}

fn default_field_type() -> String {
    "value".to_string()
}

fn default_field_size() -> u32 {
    1
}

impl From<FieldSpec> for FieldDescriptor {
    fn from(spec: FieldSpec) -> Self {
        let kind = match spec.field_type.as_str() {
            "enum" => FieldKind::Enum { items: spec.values },
            "value" => FieldKind::Value {
                range_min: spec.min.unwrap_or(0.0),
                range_max: spec.max.unwrap_or(255.0),
                scale_min: spec.scale_min.unwrap_or(0.0),
                scale_max: spec.scale_max.unwrap_or(255.0),
                unit: spec.unit,
            },
            "status" => FieldKind::Status,
            _ => FieldKind::Raw,
        };
        FieldDescriptor {
            shortcut: spec.shortcut,
            description: spec.description,
            offset: spec.offset,
            size: spec.size,
            kind,
        }
    }
}

impl From<FieldDescriptor> for FieldSpec {
    fn from(field: FieldDescriptor) -> Self {
        let mut spec = FieldSpec {
            shortcut: field.shortcut,
            description: field.description,
            field_type: String::new(),
            offset: field.offset,
            size: field.size,
            min: None,
            max: None,
            scale_min: None,
            scale_max: None,
            unit: None,
            values: Vec::new(),
        };
        match field.kind {
            FieldKind::Enum { items } => {
                spec.field_type = "enum".to_string();
                spec.values = items;
            }
            FieldKind::Value {
                range_min,
                range_max,
                scale_min,
                scale_max,
                unit,
            } => {
                spec.field_type = "value".to_string();
                spec.min = Some(range_min);
                spec.max = Some(range_max);
                spec.scale_min = Some(scale_min);
                spec.scale_max = Some(scale_max);
                spec.unit = unit;
            }
            FieldKind::Status => spec.field_type = "status".to_string(),
            FieldKind::Raw => spec.field_type = "raw".to_string(),
        }
        spec
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EepProfile {
    #[serde(deserialize_with = "flexible_string")]
    pub rorg: String,
    #[serde(deserialize_with = "flexible_string")]
    pub func: String,
    #[serde(rename = "type", deserialize_with = "flexible_string")]
    pub typ: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub is_custom: bool,
}

impl EepProfile {
    pub fn eep_id(&self) -> String {
        format!("{}-{}-{}", self.rorg, self.func, self.typ)
    }

    /// Rewrites rorg/func/type into canonical form: no `0x` prefix,
    /// uppercase, func and type zero-padded to two chars.
    fn normalize(&mut self) {
        self.rorg = normalize_component(&self.rorg, false);
        self.func = normalize_component(&self.func, true);
        self.typ = normalize_component(&self.typ, true);
    }
}

fn normalize_component(raw: &str, pad: bool) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let mut value = stripped.to_uppercase();
    if pad {
        if value.is_empty() {
            value = "00".to_string();
        } else if value.len() < 2 {
            value.insert(0, '0');
        }
    }
    value
}

pub fn make_eep_id(rorg: &str, func: &str, typ: &str) -> String {
    format!(
        "{}-{}-{}",
        normalize_component(rorg, false),
        normalize_component(func, true),
        normalize_component(typ, true)
    )
}

/// On-disk wrapper for custom profile files: a single `profile:` document.
#[derive(Debug, Serialize, Deserialize)]
struct ProfileDocument {
    profile: EepProfile,
}

/// Profile library: the parsed XML bundle with user overrides layered on
/// top. Custom profiles replace built-ins with the same id.
pub struct EepStore {
    profiles: BTreeMap<String, EepProfile>,
    custom_dir: PathBuf,
}

impl EepStore {
    /// Loads the bundled library (when present) and the custom overrides.
    /// Falls back to a minimal built-in profile set when no library can be
    /// read, so the gateway stays usable.
    pub async fn load(library_path: Option<&Path>, custom_dir: &Path) -> Self {
        let mut store = EepStore {
            profiles: BTreeMap::new(),
            custom_dir: custom_dir.to_path_buf(),
        };

        if let Some(path) = library_path {
            match fs::read_to_string(path).await {
                Ok(xml) => match store.parse_library(&xml) {
                    Ok(count) => info!("parsed {count} profiles from {}", path.display()),
                    Err(e) => error!("failed to parse EEP library {}: {e}", path.display()),
                },
                Err(e) => warn!("couldn't read EEP library {}: {e}", path.display()),
            }
        }

        if store.profiles.is_empty() {
            warn!("no EEP library available, seeding minimal built-in profiles");
            store.load_minimal_profiles();
        }

        store.load_custom_profiles().await;
        info!("EEP store initialised with {} profiles", store.len());
        store
    }

    /// Parses the official library XML
    /// (`telegrams/telegram[@rorg]/profiles[@func]/profile[@type]/data/*`)
    /// and merges every profile into the store.
    pub fn parse_library(&mut self, xml: &str) -> Result<usize, EepError> {
        let doc = Document::parse(xml)?;
        let mut count = 0;

        for telegram in doc.descendants().filter(|n| n.has_tag_name("telegram")) {
            let rorg = normalize_component(telegram.attribute("rorg").unwrap_or(""), false);

            for profiles in telegram.children().filter(|n| n.has_tag_name("profiles")) {
                let func = normalize_component(profiles.attribute("func").unwrap_or(""), true);
                let func_desc = profiles.attribute("description").unwrap_or("");

                for profile in profiles.children().filter(|n| n.has_tag_name("profile")) {
                    let typ = normalize_component(profile.attribute("type").unwrap_or(""), true);
                    let description = profile
                        .attribute("description")
                        .unwrap_or(func_desc)
                        .to_string();

                    let eep_profile = EepProfile {
                        rorg: rorg.clone(),
                        func: func.clone(),
                        typ,
                        description,
                        fields: parse_profile_fields(&profile),
                        is_custom: false,
                    };
                    self.profiles.insert(eep_profile.eep_id(), eep_profile);
                    count += 1;
                }
            }
        }

        Ok(count)
    }

    fn load_minimal_profiles(&mut self) {
        let minimal = [
            ("A5", "02", "05", "Temperature Sensor 0°C to +40°C"),
            ("A5", "04", "01", "Temperature and Humidity Sensor"),
            ("A5", "07", "01", "Occupancy Sensor"),
            ("A5", "30", "03", "Digital Input (4 channels)"),
            ("D5", "00", "01", "Single Input Contact"),
            ("F6", "02", "01", "Rocker Switch, 2 Rockers"),
            ("D2", "01", "0F", "Electronic Switch"),
            ("D2", "05", "00", "Blinds Control"),
        ];

        for (rorg, func, typ, description) in minimal {
            let profile = EepProfile {
                rorg: rorg.to_string(),
                func: func.to_string(),
                typ: typ.to_string(),
                description: description.to_string(),
                fields: Vec::new(),
                is_custom: false,
            };
            self.profiles.insert(profile.eep_id(), profile);
        }
    }

    async fn load_custom_profiles(&mut self) {
        let mut dir = match fs::read_dir(&self.custom_dir).await {
            Ok(dir) => dir,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }

            match fs::read_to_string(&path).await {
                Ok(content) => match self.insert_custom_str(&content) {
                    Ok(id) => info!("loaded custom profile {id} from {}", path.display()),
                    Err(e) => error!("failed to load custom profile {}: {e}", path.display()),
                },
                Err(e) => error!("failed to read custom profile {}: {e}", path.display()),
            }
        }
    }

    fn insert_custom_str(&mut self, yaml: &str) -> Result<String, EepError> {
        let doc: ProfileDocument = serde_yaml::from_str(yaml)?;
        let mut profile = doc.profile;
        profile.normalize();
        profile.is_custom = true;
        let id = profile.eep_id();
        self.profiles.insert(id.clone(), profile);
        Ok(id)
    }

    pub fn get(&self, eep_id: &str) -> Option<&EepProfile> {
        self.profiles.get(&eep_id.to_uppercase())
    }

    pub fn get_by_triple(&self, rorg: &str, func: &str, typ: &str) -> Option<&EepProfile> {
        self.profiles.get(&make_eep_id(rorg, func, typ))
    }

    /// Case-insensitive substring search over profile ids and descriptions.
    pub fn search(&self, query: &str) -> Vec<&EepProfile> {
        let query = query.to_lowercase();
        self.profiles
            .values()
            .filter(|p| {
                p.eep_id().to_lowercase().contains(&query)
                    || p.description.to_lowercase().contains(&query)
            })
            .collect()
    }

    pub fn profiles_by_rorg(&self, rorg: &str) -> Vec<&EepProfile> {
        let rorg = normalize_component(rorg, false);
        self.profiles.values().filter(|p| p.rorg == rorg).collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &EepProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Adds or replaces a custom profile and persists it as
    /// `<custom_dir>/<eep-id>.yaml`.
    pub async fn save_custom(&mut self, mut profile: EepProfile) -> Result<String, EepError> {
        profile.normalize();
        profile.is_custom = true;
        let id = profile.eep_id();

        fs::create_dir_all(&self.custom_dir)
            .await
            .map_err(EepError::Write)?;
        let yaml = serde_yaml::to_string(&ProfileDocument {
            profile: profile.clone(),
        })?;
        fs::write(self.custom_file(&id), yaml)
            .await
            .map_err(EepError::Write)?;

        self.profiles.insert(id.clone(), profile);
        info!("saved custom profile {id}");
        Ok(id)
    }

    /// Removes a custom profile and its YAML file. Built-in profiles can't
    /// be deleted; a built-in shadowed by the removed custom one reappears
    /// on the next restart.
    pub async fn delete_custom(&mut self, eep_id: &str) -> Result<(), EepError> {
        let id = eep_id.to_uppercase();
        match self.profiles.get(&id) {
            Some(profile) if profile.is_custom => {}
            _ => return Err(EepError::NoSuchCustomProfile(id)),
        }

        match fs::remove_file(self.custom_file(&id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EepError::Write(e)),
        }

        self.profiles.remove(&id);
        info!("deleted custom profile {id}");
        Ok(())
    }

    fn custom_file(&self, eep_id: &str) -> PathBuf {
        self.custom_dir.join(format!("{eep_id}.yaml"))
    }
}

fn parse_profile_fields(profile: &Node) -> Vec<FieldDescriptor> {
    let Some(data) = profile.children().find(|n| n.has_tag_name("data")) else {
        return Vec::new();
    };

    data.children()
        .filter(|n| n.is_element())
        .map(|field| parse_field(&field))
        .collect()
}

fn attr_f64(node: &Node, name: &str) -> Option<f64> {
    node.attribute(name).and_then(|v| v.parse().ok())
}

fn parse_field(node: &Node) -> FieldDescriptor {
    let kind = match node.tag_name().name() {
        "enum" => FieldKind::Enum {
            items: node
                .children()
                .filter(|n| n.has_tag_name("item"))
                .map(|item| EnumItem {
                    value: item.attribute("value").unwrap_or("").to_string(),
                    description: item.attribute("description").unwrap_or("").to_string(),
                })
                .collect(),
        },
        "value" => {
            let range = node.children().find(|n| n.has_tag_name("range"));
            let scale = node.children().find(|n| n.has_tag_name("scale"));
            FieldKind::Value {
                range_min: range.as_ref().and_then(|n| attr_f64(n, "min")).unwrap_or(0.0),
                range_max: range
                    .as_ref()
                    .and_then(|n| attr_f64(n, "max"))
                    .unwrap_or(255.0),
                scale_min: scale.as_ref().and_then(|n| attr_f64(n, "min")).unwrap_or(0.0),
                scale_max: scale
                    .as_ref()
                    .and_then(|n| attr_f64(n, "max"))
                    .unwrap_or(255.0),
                unit: node.attribute("unit").map(str::to_string),
            }
        }
        "status" => FieldKind::Status,
        _ => FieldKind::Raw,
    };

    FieldDescriptor {
        shortcut: node.attribute("shortcut").unwrap_or("").to_string(),
        description: node.attribute("description").unwrap_or("").to_string(),
        offset: node
            .attribute("offset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        size: node
            .attribute("size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LIBRARY_XML: &str = r#"
        <telegrams>
          <telegram rorg="0xA5" type="4BS">
            <profiles func="0x02" description="Temperature Sensors">
              <profile type="0x05" description="Temperature Sensor 0C to +40C">
                <data>
                  <value shortcut="TMP" description="Temperature" offset="16" size="8" unit="°C">
                    <range min="255" max="0"/>
                    <scale min="0" max="40"/>
                  </value>
                </data>
              </profile>
            </profiles>
          </telegram>
          <telegram rorg="0xF6" type="RPS">
            <profiles func="0x02" description="Rocker Switch">
              <profile type="0x01">
                <data>
                  <enum shortcut="R1" description="Rocker 1" offset="0" size="3">
                    <item value="0" description="AI"/>
                    <item value="1" description="A0"/>
                  </enum>
                  <status shortcut="T21" offset="2" size="1"/>
                </data>
              </profile>
            </profiles>
          </telegram>
        </telegrams>"#;

    fn store_with_library(custom_dir: &Path) -> EepStore {
        let mut store = EepStore {
            profiles: BTreeMap::new(),
            custom_dir: custom_dir.to_path_buf(),
        };
        store.parse_library(LIBRARY_XML).unwrap();
        store
    }

    #[test]
    fn test_parse_library_normalises_ids() {
        let dir = TempDir::new().unwrap();
        let store = store_with_library(dir.path());
        assert_eq!(store.len(), 2);

        let profile = store.get("A5-02-05").unwrap();
        assert_eq!(profile.description, "Temperature Sensor 0C to +40C");
        assert!(!profile.is_custom);
        assert_eq!(profile.fields.len(), 1);
        let tmp = &profile.fields[0];
        assert_eq!(tmp.shortcut, "TMP");
        assert_eq!((tmp.offset, tmp.size), (16, 8));
        assert_eq!(
            tmp.kind,
            FieldKind::Value {
                range_min: 255.0,
                range_max: 0.0,
                scale_min: 0.0,
                scale_max: 40.0,
                unit: Some("°C".to_string()),
            }
        );
    }

    #[test]
    fn test_profile_without_description_inherits_func_description() {
        let dir = TempDir::new().unwrap();
        let store = store_with_library(dir.path());
        let profile = store.get("F6-02-01").unwrap();
        assert_eq!(profile.description, "Rocker Switch");

        match &profile.fields[0].kind {
            FieldKind::Enum { items } => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].value, "0");
                assert_eq!(items[0].description, "AI");
            }
            other => panic!("expected enum field, got {other:?}"),
        }
        assert_eq!(profile.fields[1].kind, FieldKind::Status);
    }

    #[test]
    fn test_get_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = store_with_library(dir.path());
        assert!(store.get("a5-02-05").is_some());
        assert!(store.get_by_triple("0xA5", "2", "5").is_some());
    }

    #[test]
    fn test_search() {
        let dir = TempDir::new().unwrap();
        let store = store_with_library(dir.path());
        assert_eq!(store.search("temperature").len(), 1);
        assert_eq!(store.search("f6-").len(), 1);
        assert!(store.search("nonexistent").is_empty());
    }

    #[test]
    fn test_custom_profile_replaces_builtin() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_library(dir.path());

        let yaml = r#"
profile:
  rorg: A5
  func: "02"
  type: "05"
  description: Narrower temperature sensor
  fields:
    - {shortcut: TMP, type: value, offset: 16, size: 8,
       min: 0, max: 255, scale_min: 40, scale_max: 0, unit: "°C"}
"#;
        let id = store.insert_custom_str(yaml).unwrap();
        assert_eq!(id, "A5-02-05");
        assert_eq!(store.len(), 2);

        let profile = store.get("A5-02-05").unwrap();
        assert!(profile.is_custom);
        assert_eq!(profile.description, "Narrower temperature sensor");
        assert_eq!(
            profile.fields[0].kind,
            FieldKind::Value {
                range_min: 0.0,
                range_max: 255.0,
                scale_min: 40.0,
                scale_max: 0.0,
                unit: Some("°C".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_save_and_delete_custom_profile() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_library(dir.path());

        let profile = EepProfile {
            rorg: "0xd2".to_string(),
            func: "3".to_string(),
            typ: "0A".to_string(),
            description: "Push button".to_string(),
            fields: Vec::new(),
            is_custom: false,
        };
        let id = store.save_custom(profile).await.unwrap();
        assert_eq!(id, "D2-03-0A");
        assert!(dir.path().join("D2-03-0A.yaml").exists());

        // A fresh store picks the file up again.
        let reloaded = EepStore::load(None, dir.path()).await;
        assert!(reloaded.get("D2-03-0A").unwrap().is_custom);

        store.delete_custom("d2-03-0a").await.unwrap();
        assert!(store.get("D2-03-0A").is_none());
        assert!(!dir.path().join("D2-03-0A.yaml").exists());
        assert!(matches!(
            store.delete_custom("D2-03-0A").await,
            Err(EepError::NoSuchCustomProfile(_))
        ));
    }

    #[tokio::test]
    async fn test_minimal_fallback_without_library() {
        let dir = TempDir::new().unwrap();
        let store = EepStore::load(None, dir.path()).await;
        assert_eq!(store.len(), 8);
        assert!(store.get("A5-02-05").is_some());
        assert!(store.get("D2-05-00").is_some());
        assert!(store.get("A5-02-05").unwrap().fields.is_empty());
    }

    #[test]
    fn test_field_spec_round_trip() {
        let field = FieldDescriptor {
            shortcut: "HUM".to_string(),
            description: "Humidity".to_string(),
            offset: 10,
            size: 8,
            kind: FieldKind::Value {
                range_min: 0.0,
                range_max: 250.0,
                scale_min: 0.0,
                scale_max: 100.0,
                unit: Some("%".to_string()),
            },
        };
        let spec = FieldSpec::from(field.clone());
        assert_eq!(FieldDescriptor::from(spec), field);
    }
}

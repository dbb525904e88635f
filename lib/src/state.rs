//! Last-known device state cache. Sensors that transmit every few hours
//! would otherwise be invisible in Home Assistant after a gateway restart,
//! so the last published state per device is persisted to a single JSON
//! file and republished on startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;

pub const STATES_FILE: &str = "last_states.json";

#[derive(Debug, Error)]
pub enum StateCacheError {
    #[error("Couldn't write state cache: {0}")]
    Write(std::io::Error),
    #[error("Couldn't serialize state cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct StateCache {
    path: PathBuf,
    states: BTreeMap<String, Value>,
}

impl StateCache {
    /// Loads the cache file when present; a missing or unparsable file
    /// yields an empty cache.
    pub async fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(STATES_FILE);
        let states = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
                Ok(states) => {
                    info!("loaded {} persisted device states", states.len());
                    states
                }
                Err(e) => {
                    warn!("failed to parse {STATES_FILE}: {e}");
                    BTreeMap::new()
                }
            },
            Err(_) => {
                info!("no persisted states to restore");
                BTreeMap::new()
            }
        };

        StateCache { path, states }
    }

    /// Rewrites the cache file atomically (temp file + rename). Callers
    /// publish the retained state only after this returns, so a state that
    /// reached the broker is always recoverable after a restart.
    pub async fn save(&self) -> Result<(), StateCacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(StateCacheError::Write)?;
        }

        let json = serde_json::to_string_pretty(&self.states)?;
        let tmp_path = self.path.with_extension("json.new");
        fs::write(&tmp_path, json)
            .await
            .map_err(StateCacheError::Write)?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(StateCacheError::Write)?;
        Ok(())
    }

    pub fn insert(&mut self, device_name: &str, state: Value) {
        self.states.insert(device_name.to_string(), state);
    }

    pub fn get(&self, device_name: &str) -> Option<&Value> {
        self.states.get(device_name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.states.iter()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

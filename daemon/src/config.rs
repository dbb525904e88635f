use std::env;

use log::LevelFilter;

/// Service configuration, read from the environment (the contract used by
/// the add-on packaging).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_password: String,
    pub mqtt_prefix: String,
    pub mqtt_discovery_prefix: String,
    pub mqtt_client_id: String,
    /// Serial device path, or `tcp:<host>:<port>`.
    pub enocean_port: String,
    pub config_path: String,
    pub log_level: LevelFilter,
    pub cache_device_states: bool,
    pub admin_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_password: String::new(),
            mqtt_prefix: "enocean".to_string(),
            mqtt_discovery_prefix: "homeassistant".to_string(),
            mqtt_client_id: "enocean_gateway".to_string(),
            enocean_port: "/dev/ttyUSB0".to_string(),
            config_path: "/config/enocean".to_string(),
            log_level: LevelFilter::Info,
            cache_device_states: true,
            admin_port: 8080,
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            mqtt_host: var_or("MQTT_HOST", &defaults.mqtt_host),
            mqtt_port: env::var("MQTT_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.mqtt_port),
            mqtt_user: var_or("MQTT_USER", ""),
            mqtt_password: var_or("MQTT_PASSWORD", ""),
            mqtt_prefix: var_or("MQTT_PREFIX", &defaults.mqtt_prefix)
                .trim_end_matches('/')
                .to_string(),
            mqtt_discovery_prefix: var_or("MQTT_DISCOVERY_PREFIX", &defaults.mqtt_discovery_prefix)
                .trim_end_matches('/')
                .to_string(),
            mqtt_client_id: var_or("MQTT_CLIENT_ID", &defaults.mqtt_client_id),
            enocean_port: var_or("ENOCEAN_PORT", &defaults.enocean_port),
            config_path: var_or("CONFIG_PATH", &defaults.config_path),
            log_level: env::var("LOG_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_level),
            cache_device_states: env::var("CACHE_DEVICE_STATES")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.cache_device_states),
            admin_port: env::var("ADMIN_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.admin_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global, so the from_env cases run as one test.
    #[test]
    fn test_from_env() {
        let config = Config::from_env();
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.mqtt_prefix, "enocean");
        assert!(config.cache_device_states);

        env::set_var("MQTT_HOST", "broker.local");
        env::set_var("MQTT_PORT", "8883");
        env::set_var("MQTT_PREFIX", "gateway/");
        env::set_var("CACHE_DEVICE_STATES", "false");
        env::set_var("LOG_LEVEL", "debug");

        let config = Config::from_env();
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.mqtt_port, 8883);
        assert_eq!(config.mqtt_prefix, "gateway");
        assert!(!config.cache_device_states);
        assert_eq!(config.log_level, LevelFilter::Debug);

        env::set_var("MQTT_PORT", "not-a-port");
        assert_eq!(Config::from_env().mqtt_port, 1883);

        for name in [
            "MQTT_HOST",
            "MQTT_PORT",
            "MQTT_PREFIX",
            "CACHE_DEVICE_STATES",
            "LOG_LEVEL",
        ] {
            env::remove_var(name);
        }
    }
}

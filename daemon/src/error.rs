use enbridge::device::DeviceStoreError;
use enbridge::state::StateCacheError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to open EnOcean transport: {0}")]
    TransportOpenError(std::io::Error),
    #[error("Failed to open serial port: {0}")]
    SerialOpenError(#[from] serialport::Error),
    #[error("Device store error: {0}")]
    DeviceStoreError(#[from] DeviceStoreError),
    #[error("State cache error: {0}")]
    StateCacheError(#[from] StateCacheError),
    #[error("MQTT error: {0}")]
    MqttClientError(#[from] rumqttc::ClientError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

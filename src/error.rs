use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

/**
 * Failures of the underlying radio link, reported by whichever Transport
 * implementation is plugged in.
 */
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Device {0} is not known to the transport")]
    UnknownDevice(String),

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("Write to device {0} failed: {1}")]
    WriteFailed(String, String),

    #[error("Connecting to device {0} failed: {1}")]
    ConnectFailed(String, String),
}

/**
 * Failure taxonomy of the public operation surface. No operation retries by
 * itself; callers decide whether reissuing makes sense for the variant they
 * got back.
 */
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Busy: {0}")]
    Busy(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rejected by device: {0}")]
    Rejected(String),

    #[error("Link lost: {0}")]
    LinkLost(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Transport failure: {source}")]
    Transport { #[from] source: TransportError },
}

impl SensorError {
    /// True for failures that a plain reissue of the same command can recover
    /// from once the link is usable again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SensorError::Timeout(_) | SensorError::LinkLost(_) | SensorError::Busy(_))
    }
}

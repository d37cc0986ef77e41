use std::io;
use std::str::Utf8Error;
use thiserror::Error;

use crate::device::types::Stage;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCategory {
    Negative,
    OverHundred,
    UnderHundred,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Value #{position} is negative ({value})", position = .index + 1)]
    Negative { index: usize, value: i32 },

    #[error("Values add up to more than 100% at value #{position} (total {total}%)", position = .index + 1)]
    OverHundred { index: usize, total: i32 },

    #[error("Values add up to less than 100% (total {total}%)")]
    UnderHundred { index: usize, total: i32 },

    #[error("Could not parse value {input:?}, expected label=percentage")]
    Malformed { input: String },
}

impl ValidationError {
    /// Index of the value that caused the failure. `None` for input that could not be parsed at all.
    pub fn index(&self) -> Option<usize> {
        match self {
            ValidationError::Negative { index, .. } => Some(*index),
            ValidationError::OverHundred { index, .. } => Some(*index),
            ValidationError::UnderHundred { index, .. } => Some(*index),
            ValidationError::Malformed { .. } => None,
        }
    }

    pub fn category(&self) -> Option<ValidationCategory> {
        match self {
            ValidationError::Negative { .. } => Some(ValidationCategory::Negative),
            ValidationError::OverHundred { .. } => Some(ValidationCategory::OverHundred),
            ValidationError::UnderHundred { .. } => Some(ValidationCategory::UnderHundred),
            ValidationError::Malformed { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Transport rejected request while {stage}: {reason}")]
    TransportFailure { stage: Stage, reason: String },

    #[error("Timed out while {stage}")]
    Timeout { stage: Stage },

    #[error("Operation cancelled while {stage}")]
    Cancelled { stage: Stage },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("No bluetooth adapter found")]
    NoAdapter,

    #[error("Unknown connection handle")]
    UnknownHandle,

    #[error("Transport event channel closed while {stage}")]
    EventChannelClosed { stage: Stage },

    #[error("Value #{position} ({value}) does not fit in a single byte", position = .index + 1)]
    ValueOutOfRange { index: usize, value: i32 },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Device operation failed: {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Invalid configuration values: {source}")]
    ValidationError { #[from] source: ValidationError },

    #[error("Failed to start async runtime: {source}")]
    RuntimeError { #[from] source: io::Error },

    #[error("Bluetooth adapter refused to start scanning")]
    ScanRefused,

    #[error("Peripheral {target:?} not found")]
    PeripheralNotFound { target: String },

    #[error("Writing the configuration to the peripheral failed")]
    WriteFailed,
}

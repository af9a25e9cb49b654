use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;
use futures::channel::mpsc::SendError;
use uuid::Uuid;

use crate::device::decoder::PayloadFormat;
use crate::device::types::{ConnectionState, DeviceId};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

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

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start (runtime): {source}")]
    Runtime { #[from] source: io::Error },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Device {0} is not known")]
    UnknownDevice(DeviceId),

    #[error("Device {id} can not do this while {state:?}")]
    InvalidState { id: DeviceId, state: ConnectionState },

    #[error("The bluetooth session has stopped: {source}")]
    SessionClosed { #[from] source: SendError },
}

/// A characteristic value that could not be turned into a reading. Never mutates device state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{format} needs {required} bytes, got {actual}")]
    TooShort { format: PayloadFormat, required: usize, actual: usize },

    #[error("No decoder is registered for characteristic {0}")]
    UnknownCharacteristic(Uuid),
}

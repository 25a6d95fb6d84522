//! Device descriptors.
//!
//! Devices are transient: rediscovered on every transport query and never
//! persisted.

use serde::{Deserialize, Serialize};

/// Which transport a device is currently answering on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Normal OS with the debug bridge available.
    Debug,
    /// Bootloader mode; only low-level partition commands are accepted.
    Bootloader,
    /// Not responding on either transport.
    Disconnected,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Debug => "debug",
            ConnectionMode::Bootloader => "bootloader",
            ConnectionMode::Disconnected => "disconnected",
        }
    }
}

/// A device as observed by the transport at a single point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Transport-assigned serial.
    pub id: String,
    /// Internal product identifier, when it could be read.
    pub codename: Option<String>,
    pub connection_mode: ConnectionMode,
    /// `None` when the lock state could not be determined in the current mode.
    pub bootloader_locked: Option<bool>,
    pub secure_boot: Option<bool>,
}

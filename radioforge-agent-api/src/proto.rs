//! Wire types for the agent protocol.
//!
//! The daemon speaks newline-delimited JSON over TCP. Every request is one
//! [`Request`] line; every operation answers with one [`Reply`] line, except
//! `flash`, which acknowledges with a `Reply` and then streams one
//! [`radioforge_core::ProgressEvent`] line per progress update until the
//! terminal event (the one carrying `success`).

use radioforge_core::SearchQuery;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "kebab-case")]
pub enum Request {
    DetectDevice {
        #[serde(default)]
        device_id: Option<String>,
    },
    ListDevices,
    SupportedDevices,
    DeviceSupport {
        codename: String,
    },
    ValidateOperation {
        operation: String,
        #[serde(default)]
        device_id: Option<String>,
    },
    CurrentVersion {
        #[serde(default)]
        device_id: Option<String>,
    },
    Backup {
        #[serde(default)]
        device_id: Option<String>,
    },
    Search {
        query: SearchQuery,
    },
    Latest {
        codename: String,
        #[serde(default)]
        official_only: bool,
    },
    Popular {
        codename: String,
        limit: i64,
    },
    CheckUpdates {
        codename: String,
        current_version: String,
    },
    ValidateUrl {
        url: String,
    },
    CompatibleFirmware {
        #[serde(default)]
        device_id: Option<String>,
    },
    Flash(FlashRequest),
    FlashSession {
        device_id: String,
    },
    ClearCache,
}

/// Exactly one of `firmware_id` (catalog flash; needs `codename` unless the
/// device reports one) or `image_path` (local flash) must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashRequest {
    pub device_id: String,
    #[serde(default)]
    pub firmware_id: Option<String>,
    #[serde(default)]
    pub codename: Option<String>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub require_backup: bool,
}

/// Owned mirror of [`radioforge_core::DeviceSupport`] for the client side;
/// the daemon serializes the static registry entries directly and the field
/// names line up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSupportInfo {
    pub codename: String,
    pub marketing_name: String,
    pub regions: Vec<String>,
    pub modem_partition: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            ok: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { ok: false, data: None, error: Some(message.into()) }
    }
}

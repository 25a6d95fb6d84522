//! Supported-device registry and operation gating.

use crate::device::{ConnectionMode, Device};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Static support entry for one device model.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSupport {
    pub codename: &'static str,
    pub marketing_name: &'static str,
    pub regions: &'static [&'static str],
    /// Partition holding the radio/modem firmware on this model.
    pub modem_partition: &'static str,
    pub notes: &'static str,
}

pub const SUPPORTED_DEVICES: &[DeviceSupport] = &[
    DeviceSupport {
        codename: "guacamoleb",
        marketing_name: "OnePlus 7",
        regions: &["GLOBAL", "EU", "IN"],
        modem_partition: "radio",
        notes: "",
    },
    DeviceSupport {
        codename: "guacamole",
        marketing_name: "OnePlus 7 Pro",
        regions: &["GLOBAL", "EU", "IN", "US"],
        modem_partition: "radio",
        notes: "5G variant uses a separate image set",
    },
    DeviceSupport {
        codename: "hotdogb",
        marketing_name: "OnePlus 7T",
        regions: &["GLOBAL", "EU", "IN"],
        modem_partition: "radio",
        notes: "",
    },
    DeviceSupport {
        codename: "hotdog",
        marketing_name: "OnePlus 7T Pro",
        regions: &["GLOBAL", "EU", "IN"],
        modem_partition: "radio",
        notes: "",
    },
    DeviceSupport {
        codename: "instantnoodle",
        marketing_name: "OnePlus 8",
        regions: &["GLOBAL", "EU", "IN", "US"],
        modem_partition: "modem",
        notes: "",
    },
    DeviceSupport {
        codename: "instantnoodlep",
        marketing_name: "OnePlus 8 Pro",
        regions: &["GLOBAL", "EU", "IN"],
        modem_partition: "modem",
        notes: "",
    },
    DeviceSupport {
        codename: "kebab",
        marketing_name: "OnePlus 8T",
        regions: &["GLOBAL", "EU", "IN", "US"],
        modem_partition: "modem",
        notes: "",
    },
    DeviceSupport {
        codename: "lemonade",
        marketing_name: "OnePlus 9",
        regions: &["GLOBAL", "EU", "IN", "US"],
        modem_partition: "modem",
        notes: "",
    },
    DeviceSupport {
        codename: "lemonadep",
        marketing_name: "OnePlus 9 Pro",
        regions: &["GLOBAL", "EU", "IN", "US"],
        modem_partition: "modem",
        notes: "",
    },
    DeviceSupport {
        codename: "martini",
        marketing_name: "OnePlus 9RT",
        regions: &["IN", "CN"],
        modem_partition: "modem",
        notes: "regional model; most images are region-locked",
    },
];

pub fn list_supported_devices() -> &'static [DeviceSupport] {
    SUPPORTED_DEVICES
}

pub fn get_device_support(codename: &str) -> Option<&'static DeviceSupport> {
    SUPPORTED_DEVICES
        .iter()
        .find(|d| d.codename.eq_ignore_ascii_case(codename))
}

/// Operations that can be gated against a device's observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Flash,
    Erase,
    Format,
    Unlock,
    Backup,
    Reboot,
}

impl Operation {
    pub fn is_destructive(self) -> bool {
        matches!(self, Operation::Flash | Operation::Erase | Operation::Format | Operation::Unlock)
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flash" => Ok(Operation::Flash),
            "erase" => Ok(Operation::Erase),
            "format" => Ok(Operation::Format),
            "unlock" => Ok(Operation::Unlock),
            "backup" => Ok(Operation::Backup),
            "reboot" => Ok(Operation::Reboot),
            other => Err(format!("unknown operation {other:?}")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Flash => "flash",
            Operation::Erase => "erase",
            Operation::Format => "format",
            Operation::Unlock => "unlock",
            Operation::Backup => "backup",
            Operation::Reboot => "reboot",
        };
        f.write_str(name)
    }
}

/// Gate verdict. Destructive operations always carry a restated warning,
/// even when allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationGate {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OperationGate {
    fn allowed(warning: Option<String>) -> Self {
        Self { allowed: true, warning, reason: None }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self { allowed: false, warning: None, reason: Some(reason.into()) }
    }
}

/// Check whether `operation` is safe to attempt against the device as
/// currently observed.
pub fn validate_for_operation(operation: Operation, device: &Device) -> OperationGate {
    let destructive_warning = || {
        Some(format!(
            "{operation} writes to device storage and can render the device unbootable; \
             make sure a backup exists and do not disconnect the device"
        ))
    };

    match operation {
        Operation::Flash | Operation::Erase | Operation::Format => {
            if device.connection_mode != ConnectionMode::Bootloader {
                return OperationGate::denied(format!(
                    "{operation} requires bootloader mode; device is in {} mode",
                    device.connection_mode.as_str()
                ));
            }
            if device.bootloader_locked == Some(true) {
                return OperationGate::denied(format!(
                    "{operation} requires an unlocked bootloader"
                ));
            }
            OperationGate::allowed(destructive_warning())
        }
        Operation::Unlock => {
            if device.connection_mode != ConnectionMode::Bootloader {
                return OperationGate::denied("unlock requires bootloader mode");
            }
            if device.bootloader_locked == Some(false) {
                return OperationGate::denied("bootloader is already unlocked");
            }
            OperationGate::allowed(Some(
                "unlocking erases all user data on the device".to_string(),
            ))
        }
        Operation::Backup => {
            if device.connection_mode != ConnectionMode::Debug {
                return OperationGate::denied(
                    "backup reads partitions through the debug transport; reboot to system first",
                );
            }
            OperationGate::allowed(None)
        }
        Operation::Reboot => OperationGate::allowed(None),
    }
}

//! Device transport.
//!
//! Issues device-management commands in debug (adb-style) and bootloader
//! (fastboot-style) mode against a specific or single attached device, and
//! parses the tools' textual responses into structured values.
//!
//! Bootloader tools write variable output to either stdout or stderr
//! depending on version; the parser always concatenates the channels in
//! stdout-then-stderr order before matching, so it never depends on
//! real-time interleaving.

pub mod runner;

use crate::device::{ConnectionMode, Device};
use crate::error::{CoreError, Result};
use runner::CommandRunner;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed poll interval for [`DeviceTransport::wait_for_device`].
pub const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Case-insensitive markers identifying the supported brand family.
/// Heuristic gate only, not a security boundary.
const BRAND_MARKERS: &[&str] = &[
    "oneplus",
    "guacamole",
    "hotdog",
    "instantnoodle",
    "kebab",
    "lemonade",
    "martini",
];

/// Characters never allowed in values interpolated into command arguments.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '*', '?', '!', '~', '"', '\'', '\n',
    '\r',
];

/// Paths to the device-management binaries, assumed pre-installed.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub adb: String,
    pub fastboot: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self { adb: "adb".to_string(), fastboot: "fastboot".to_string() }
    }
}

/// Structured result of one transport command. Execution failures are
/// captured here, never thrown to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub succeeded: bool,
    /// stdout followed by stderr, channel-then-channel, so output stays
    /// deterministic for tests.
    pub combined_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Size and filesystem type reported for a partition, when the bootloader
/// exposes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition: String,
    pub size: Option<String>,
    pub fs_type: Option<String>,
}

/// Where a reboot should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootTarget {
    System,
    Bootloader,
    Recovery,
}

/// Transport over the debug and bootloader command tools.
pub struct DeviceTransport {
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
}

impl DeviceTransport {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: ToolPaths) -> Self {
        Self { runner, tools }
    }

    fn tool_for(&self, mode: ConnectionMode) -> &str {
        match mode {
            ConnectionMode::Bootloader => &self.tools.fastboot,
            // Disconnected has no tool of its own; the debug tool answers
            // (with an empty device list) for both.
            ConnectionMode::Debug | ConnectionMode::Disconnected => &self.tools.adb,
        }
    }

    /// Execute a command, optionally scoped to one device with `-s <id>`.
    /// Never returns an error; failures land in `error_message`.
    pub async fn execute(
        &self,
        mode: ConnectionMode,
        args: &[&str],
        device_id: Option<&str>,
    ) -> CommandOutcome {
        let mut full: Vec<String> = Vec::with_capacity(args.len() + 2);
        if let Some(id) = device_id {
            full.push("-s".to_string());
            full.push(id.to_string());
        }
        full.extend(args.iter().map(|a| (*a).to_string()));

        match self.runner.run(self.tool_for(mode), &full).await {
            Ok(raw) => {
                let combined = format!("{}{}", raw.stdout, raw.stderr);
                let error_message = if raw.status_ok {
                    None
                } else {
                    let err = raw.stderr.trim();
                    Some(if err.is_empty() {
                        "command exited with failure status".to_string()
                    } else {
                        err.to_string()
                    })
                };
                CommandOutcome { succeeded: raw.status_ok, combined_output: combined, error_message }
            }
            Err(e) => CommandOutcome {
                succeeded: false,
                combined_output: String::new(),
                error_message: Some(e.to_string()),
            },
        }
    }

    /// Device ids currently responding in `mode`. Empty, never an error,
    /// when none are found.
    pub async fn list_devices(&self, mode: ConnectionMode) -> Vec<String> {
        let outcome = self.execute(mode, &["devices"], None).await;
        let mut ids = Vec::new();
        for line in outcome.combined_output.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("List of") || line.starts_with('*') {
                continue;
            }
            let mut parts = line.split_whitespace();
            if let (Some(id), Some(state)) = (parts.next(), parts.next()) {
                // "unauthorized"/"offline" entries are visible but not usable.
                if state == "device" || state == "fastboot" {
                    ids.push(id.to_string());
                }
            }
        }
        ids
    }

    /// Resolve which device a command should target.
    ///
    /// An explicit id must be present in the device list; with no id, exactly
    /// one attached device is required — more than one is `DeviceAmbiguous`,
    /// never a silent first-device pick.
    pub async fn resolve_device(
        &self,
        mode: ConnectionMode,
        device_id: Option<&str>,
    ) -> Result<String> {
        let mut devices = self.list_devices(mode).await;
        match device_id {
            Some(id) => {
                if devices.iter().any(|d| d == id) {
                    Ok(id.to_string())
                } else {
                    Err(CoreError::DeviceNotFound)
                }
            }
            None => match devices.len() {
                0 => Err(CoreError::DeviceNotFound),
                1 => Ok(devices.remove(0)),
                n => Err(CoreError::DeviceAmbiguous(n)),
            },
        }
    }

    /// Read a bootloader variable from a known device id.
    async fn getvar(&self, device_id: &str, name: &str) -> Option<String> {
        let outcome = self
            .execute(ConnectionMode::Bootloader, &["getvar", name], Some(device_id))
            .await;
        parse_variable(&outcome.combined_output, name)
    }

    /// Read a debug-mode system property from a known device id.
    async fn getprop(&self, device_id: &str, name: &str) -> Option<String> {
        let outcome = self
            .execute(ConnectionMode::Debug, &["shell", "getprop", name], Some(device_id))
            .await;
        if !outcome.succeeded {
            return None;
        }
        let value = outcome.combined_output.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    /// Read a bootloader variable. `Ok(None)` when the variable is not
    /// reported; errors only for device resolution.
    pub async fn get_variable(
        &self,
        name: &str,
        device_id: Option<&str>,
    ) -> Result<Option<String>> {
        let id = self.resolve_device(ConnectionMode::Bootloader, device_id).await?;
        Ok(self.getvar(&id, name).await)
    }

    /// Poll for any device in `mode`, suspending only the calling task.
    /// True the first moment a device is observed, false once `timeout`
    /// elapses with none seen.
    pub async fn wait_for_device(&self, mode: ConnectionMode, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.list_devices(mode).await.is_empty() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(remaining.min(DEVICE_POLL_INTERVAL)).await;
        }
    }

    /// Heuristic brand gate: true iff the `product` or `brand` variable
    /// (or debug-mode equivalents) contains a known brand marker.
    pub async fn is_oneplus_device(&self, device_id: Option<&str>) -> Result<bool> {
        let mut observed = Vec::new();

        match self.resolve_device(ConnectionMode::Bootloader, device_id).await {
            Ok(id) => {
                observed.extend(self.getvar(&id, "product").await);
                observed.extend(self.getvar(&id, "brand").await);
            }
            Err(CoreError::DeviceNotFound) => {
                let id = self.resolve_device(ConnectionMode::Debug, device_id).await?;
                observed.extend(self.getprop(&id, "ro.product.brand").await);
                observed.extend(self.getprop(&id, "ro.product.device").await);
            }
            Err(e) => return Err(e),
        }

        Ok(observed.iter().any(|value| {
            let value = value.to_lowercase();
            BRAND_MARKERS.iter().any(|marker| value.contains(marker))
        }))
    }

    /// Discover the device and its current state.
    pub async fn detect_device(&self, device_id: Option<&str>) -> Result<Device> {
        match self.resolve_device(ConnectionMode::Bootloader, device_id).await {
            Ok(id) => {
                let codename = self.getvar(&id, "product").await;
                let unlocked = self.getvar(&id, "unlocked").await;
                let secure = self.getvar(&id, "secure").await;
                return Ok(Device {
                    id,
                    codename,
                    connection_mode: ConnectionMode::Bootloader,
                    bootloader_locked: unlocked.map(|v| !v.eq_ignore_ascii_case("yes")),
                    secure_boot: secure.map(|v| v.eq_ignore_ascii_case("yes")),
                });
            }
            Err(CoreError::DeviceNotFound) => {}
            Err(e) => return Err(e),
        }

        let id = self.resolve_device(ConnectionMode::Debug, device_id).await?;
        let codename = self.getprop(&id, "ro.product.device").await;
        Ok(Device {
            id,
            codename,
            connection_mode: ConnectionMode::Debug,
            bootloader_locked: None,
            secure_boot: None,
        })
    }

    /// Current baseband version: bootloader `version-baseband` first, then
    /// the debug-mode radio property.
    pub async fn get_current_version(&self, device_id: Option<&str>) -> Result<Option<String>> {
        match self.resolve_device(ConnectionMode::Bootloader, device_id).await {
            Ok(id) => {
                if let Some(version) = self.getvar(&id, "version-baseband").await {
                    return Ok(Some(version));
                }
            }
            Err(CoreError::DeviceNotFound) => {}
            Err(e) => return Err(e),
        }

        match self.resolve_device(ConnectionMode::Debug, device_id).await {
            Ok(id) => Ok(self.getprop(&id, "gsm.version.baseband").await),
            Err(e) => Err(e),
        }
    }

    /// Write `image_path` to `partition`. Transport failures are captured in
    /// the returned outcome; only validation and resolution fail as errors.
    pub async fn flash_partition(
        &self,
        partition: &str,
        image_path: &str,
        device_id: Option<&str>,
    ) -> Result<CommandOutcome> {
        validate_partition(partition)?;
        validate_path_arg("image path", image_path)?;
        let id = self.resolve_device(ConnectionMode::Bootloader, device_id).await?;
        Ok(self
            .execute(ConnectionMode::Bootloader, &["flash", partition, image_path], Some(&id))
            .await)
    }

    pub async fn erase_partition(
        &self,
        partition: &str,
        device_id: Option<&str>,
    ) -> Result<CommandOutcome> {
        validate_partition(partition)?;
        let id = self.resolve_device(ConnectionMode::Bootloader, device_id).await?;
        Ok(self
            .execute(ConnectionMode::Bootloader, &["erase", partition], Some(&id))
            .await)
    }

    pub async fn format_partition(
        &self,
        partition: &str,
        fs_type: &str,
        device_id: Option<&str>,
    ) -> Result<CommandOutcome> {
        validate_partition(partition)?;
        if fs_type.is_empty() || !fs_type.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidParameter(format!(
                "filesystem type {fs_type:?} is not a plain identifier"
            )));
        }
        let id = self.resolve_device(ConnectionMode::Bootloader, device_id).await?;
        let format_arg = format!("format:{fs_type}");
        Ok(self
            .execute(ConnectionMode::Bootloader, &[&format_arg, partition], Some(&id))
            .await)
    }

    /// Reboot the device into `target`, from whichever mode it is in.
    pub async fn reboot(
        &self,
        target: RebootTarget,
        device_id: Option<&str>,
    ) -> Result<CommandOutcome> {
        match self.resolve_device(ConnectionMode::Debug, device_id).await {
            Ok(id) => {
                let args: &[&str] = match target {
                    RebootTarget::System => &["reboot"],
                    RebootTarget::Bootloader => &["reboot", "bootloader"],
                    RebootTarget::Recovery => &["reboot", "recovery"],
                };
                return Ok(self.execute(ConnectionMode::Debug, args, Some(&id)).await);
            }
            Err(CoreError::DeviceNotFound) => {}
            Err(e) => return Err(e),
        }

        let id = self.resolve_device(ConnectionMode::Bootloader, device_id).await?;
        let args: &[&str] = match target {
            RebootTarget::System => &["reboot"],
            RebootTarget::Bootloader => &["reboot-bootloader"],
            RebootTarget::Recovery => {
                return Err(CoreError::InvalidParameter(
                    "recovery reboot is only available from debug mode".to_string(),
                ))
            }
        };
        Ok(self.execute(ConnectionMode::Bootloader, args, Some(&id)).await)
    }

    pub async fn get_partition_info(
        &self,
        partition: &str,
        device_id: Option<&str>,
    ) -> Result<PartitionInfo> {
        validate_partition(partition)?;
        let id = self.resolve_device(ConnectionMode::Bootloader, device_id).await?;
        let size = self.getvar(&id, &format!("partition-size:{partition}")).await;
        let fs_type = self.getvar(&id, &format!("partition-type:{partition}")).await;
        Ok(PartitionInfo { partition: partition.to_string(), size, fs_type })
    }

    /// Copy the current contents of `partition` off the device via the
    /// debug transport. Needs elevated access on the device; the lack of it
    /// maps to [`CoreError::BackupUnavailable`].
    pub async fn backup_partition(
        &self,
        partition: &str,
        dest: &Path,
        device_id: Option<&str>,
    ) -> Result<PathBuf> {
        validate_partition(partition)?;
        let dest_str = dest.to_string_lossy().into_owned();
        validate_path_arg("backup destination", &dest_str)?;
        let id = self.resolve_device(ConnectionMode::Debug, device_id).await?;

        let remote = format!("/sdcard/{partition}.backup.img");
        let dd = format!("dd if=/dev/block/bootdevice/by-name/{partition} of={remote}");
        let outcome = self
            .execute(ConnectionMode::Debug, &["shell", "su", "-c", &dd], Some(&id))
            .await;

        let combined = outcome.combined_output.to_lowercase();
        if !outcome.succeeded
            || combined.contains("permission denied")
            || combined.contains("su: not found")
            || combined.contains("su: inaccessible")
        {
            let detail = outcome
                .error_message
                .unwrap_or_else(|| outcome.combined_output.trim().to_string());
            return Err(CoreError::BackupUnavailable(if detail.is_empty() {
                "elevated access required to read partitions".to_string()
            } else {
                detail
            }));
        }

        let pull = self
            .execute(ConnectionMode::Debug, &["pull", &remote, &dest_str], Some(&id))
            .await;
        if !pull.succeeded {
            return Err(CoreError::TransportFailure(
                pull.error_message.unwrap_or_else(|| "pull failed".to_string()),
            ));
        }
        Ok(dest.to_path_buf())
    }
}

/// Match `name: value` in concatenated channel output, case-sensitively on
/// the name, trimming the value. Tolerates the `(bootloader) ` line prefix
/// some tool builds emit.
fn parse_variable(output: &str, name: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim_start();
        let line = line.strip_prefix("(bootloader)").map_or(line, str::trim_start);
        if let Some(rest) = line.strip_prefix(name) {
            if let Some(value) = rest.strip_prefix(':') {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn validate_partition(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::InvalidParameter("partition name is required".to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CoreError::InvalidParameter(format!(
            "partition name {name:?} contains forbidden characters"
        )));
    }
    Ok(())
}

fn validate_path_arg(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CoreError::InvalidParameter(format!("{what} is required")));
    }
    if value.contains(SHELL_METACHARACTERS) {
        return Err(CoreError::InvalidParameter(format!(
            "{what} {value:?} contains shell metacharacters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::runner::{RawOutput, ScriptedRunner};
    use super::*;

    fn transport(runner: ScriptedRunner) -> DeviceTransport {
        DeviceTransport::new(Arc::new(runner), ToolPaths::default())
    }

    #[tokio::test]
    async fn test_list_devices_parses_both_tools() {
        let t = transport(
            ScriptedRunner::new()
                .on_ok("devices", "List of devices attached\nserial1\tdevice\nserial2\toffline\n"),
        );
        assert_eq!(t.list_devices(ConnectionMode::Debug).await, vec!["serial1"]);
    }

    #[tokio::test]
    async fn test_list_devices_empty_is_not_an_error() {
        let t = transport(ScriptedRunner::new().on_ok("devices", "List of devices attached\n"));
        assert!(t.list_devices(ConnectionMode::Debug).await.is_empty());
    }

    #[tokio::test]
    async fn test_get_variable_reads_either_channel() {
        // getvar output lands on stderr with this tool build.
        let t = transport(
            ScriptedRunner::new()
                .on_ok("devices", "serial1\tfastboot\n")
                .on(
                    "getvar version-baseband",
                    RawOutput::ok_stderr("version-baseband: 2.1.380.016\nFinished.\n"),
                ),
        );
        let v = t.get_variable("version-baseband", None).await.unwrap();
        assert_eq!(v.as_deref(), Some("2.1.380.016"));
    }

    #[tokio::test]
    async fn test_get_variable_absent_is_none() {
        let t = transport(
            ScriptedRunner::new()
                .on_ok("devices", "serial1\tfastboot\n")
                .on("getvar", RawOutput::ok_stderr("Finished. Total time: 0.001s\n")),
        );
        assert_eq!(t.get_variable("product", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_variable_name_is_case_sensitive() {
        assert_eq!(parse_variable("Product: guacamole\n", "product"), None);
        assert_eq!(
            parse_variable("(bootloader) product: guacamole \n", "product").as_deref(),
            Some("guacamole")
        );
    }

    #[tokio::test]
    async fn test_resolve_rejects_ambiguous_device() {
        let t = transport(
            ScriptedRunner::new().on_ok("devices", "serial1\tfastboot\nserial2\tfastboot\n"),
        );
        match t.resolve_device(ConnectionMode::Bootloader, None).await {
            Err(CoreError::DeviceAmbiguous(2)) => {}
            other => panic!("expected DeviceAmbiguous, got {other:?}"),
        }
        // An explicit id resolves fine with two attached.
        let id = t
            .resolve_device(ConnectionMode::Bootloader, Some("serial2"))
            .await
            .unwrap();
        assert_eq!(id, "serial2");
    }

    #[tokio::test]
    async fn test_execute_captures_failures() {
        let t = transport(ScriptedRunner::new());
        let outcome = t.execute(ConnectionMode::Bootloader, &["oem", "unlock"], None).await;
        assert!(!outcome.succeeded);
        assert!(outcome.error_message.is_some());
    }

    #[tokio::test]
    async fn test_flash_partition_rejects_metacharacters() {
        let runner = Arc::new(ScriptedRunner::new());
        let t = DeviceTransport::new(runner.clone(), ToolPaths::default());
        let err = t
            .flash_partition("radio", "/tmp/x.img; rm -rf /", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidParameter(_)));
        let err = t.flash_partition("radio$(reboot)", "/tmp/x.img", None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidParameter(_)));
        // Validation happens before any device interaction.
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_device_times_out() {
        let t = transport(ScriptedRunner::new().on_ok("devices", ""));
        assert!(!t.wait_for_device(ConnectionMode::Bootloader, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn test_wait_for_device_returns_immediately_when_present() {
        let t = transport(ScriptedRunner::new().on_ok("devices", "serial1\tfastboot\n"));
        assert!(t.wait_for_device(ConnectionMode::Bootloader, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn test_is_oneplus_device_matches_markers() {
        let t = transport(
            ScriptedRunner::new()
                .on_ok("devices", "serial1\tfastboot\n")
                .on("getvar product", RawOutput::ok_stderr("product: guacamole\n"))
                .on("getvar brand", RawOutput::ok_stderr("Finished.\n")),
        );
        assert!(t.is_oneplus_device(None).await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_without_root_is_backup_unavailable() {
        let t = transport(
            ScriptedRunner::new()
                .on_ok("devices", "serial1\tdevice\n")
                .on("shell su -c", RawOutput::failed("su: not found\n")),
        );
        let err = t
            .backup_partition("modem", Path::new("/tmp/modem.img"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BackupUnavailable(_)));
    }
}

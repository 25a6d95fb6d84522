//! Flashing orchestration.
//!
//! Drives a per-device session through backup, download, verification,
//! flashing and confirmation, emitting ordered progress events. At most one
//! non-terminal session exists per device; a second flash request is
//! rejected synchronously, never queued.

use crate::catalog::FirmwareRecord;
use crate::device::{ConnectionMode, Device};
use crate::download::{verify_checksums, Downloader};
use crate::error::{CoreError, Result};
use crate::transport::{DeviceTransport, RebootTarget};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Upper bound per stage so no session can stay non-terminal forever.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How long to wait for the device to reappear after a reboot into the
/// bootloader.
const REBOOT_WAIT: Duration = Duration::from_secs(60);

/// Restated in every successful flash payload; flashing is destructive and
/// the caller must surface this to the user.
const FLASH_REMINDER: &str =
    "the radio partition was rewritten; verify cellular connectivity before relying on the device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashStage {
    Idle,
    Detecting,
    BackingUp,
    Downloading,
    Verifying,
    Flashing,
    Confirming,
    Complete,
    Failed,
}

impl FlashStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlashStage::Complete | FlashStage::Failed)
    }
}

/// One progress event. The final event of every session carries `success`;
/// consumers detect stream end from that, there is no separate sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: FlashStage,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What to flash: a verified catalog record (downloaded and checksummed) or
/// a local image the caller already staged.
#[derive(Debug, Clone)]
pub enum FlashSource {
    Catalog(FirmwareRecord),
    LocalImage(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    /// Partition to write; defaults to "radio".
    pub partition: Option<String>,
    /// Turn a failed backup from a warning into a fatal error.
    pub require_backup: bool,
}

/// Session state as held in the registry. Owned and mutated exclusively by
/// the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashSession {
    pub device_id: String,
    pub stage: FlashStage,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

type SessionMap = Arc<Mutex<HashMap<String, FlashSession>>>;

pub struct FlashOrchestrator {
    transport: Arc<DeviceTransport>,
    downloader: Arc<Downloader>,
    staging_dir: PathBuf,
    stage_timeout: Duration,
    sessions: SessionMap,
}

impl FlashOrchestrator {
    pub fn new(transport: Arc<DeviceTransport>, staging_dir: PathBuf) -> Self {
        Self {
            transport,
            downloader: Arc::new(Downloader::new()),
            staging_dir,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn staging_dir(&self) -> &std::path::Path {
        &self.staging_dir
    }

    /// Last known session for a device, terminal ones included until the
    /// next flash replaces them.
    pub fn session(&self, device_id: &str) -> Option<FlashSession> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .get(device_id)
            .cloned()
    }

    /// Start a flash session and return its ordered progress stream.
    ///
    /// Parameter validation happens before any device interaction or state
    /// mutation. The check-for-existing-session and the insert happen under
    /// one lock so two concurrent requests cannot both start.
    pub fn start_flash(
        &self,
        device_id: &str,
        source: FlashSource,
        opts: FlashOptions,
    ) -> Result<UnboundedReceiverStream<ProgressEvent>> {
        validate_request(device_id, &source, &opts)?;

        {
            let mut sessions = self.sessions.lock().expect("session registry poisoned");
            if let Some(existing) = sessions.get(device_id) {
                if !existing.stage.is_terminal() {
                    return Err(CoreError::SessionAlreadyActive(device_id.to_string()));
                }
            }
            sessions.insert(
                device_id.to_string(),
                FlashSession {
                    device_id: device_id.to_string(),
                    stage: FlashStage::Idle,
                    progress: 0,
                    started_at: Utc::now(),
                    last_error: None,
                },
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            transport: Arc::clone(&self.transport),
            downloader: Arc::clone(&self.downloader),
            staging_dir: self.staging_dir.clone(),
            stage_timeout: self.stage_timeout,
            device_id: device_id.to_string(),
            source,
            opts,
        };
        let emitter = Emitter {
            device_id: device_id.to_string(),
            tx,
            sessions: Arc::clone(&self.sessions),
            last_progress: 0,
        };
        tokio::spawn(task.run(emitter));

        Ok(UnboundedReceiverStream::new(rx))
    }
}

/// Emits progress events and mirrors them into the session registry. All
/// emissions for one session come from its single driver task, which is
/// what guarantees causal stage ordering.
struct Emitter {
    device_id: String,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    sessions: SessionMap,
    last_progress: u8,
}

impl Emitter {
    fn update_session(&self, stage: FlashStage, progress: u8, error: Option<&str>) {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        if let Some(session) = sessions.get_mut(&self.device_id) {
            session.stage = stage;
            session.progress = progress;
            session.last_error = error.map(str::to_string);
        }
    }

    fn emit(&mut self, stage: FlashStage, progress: u8, message: impl Into<String>) {
        self.last_progress = progress;
        self.update_session(stage, progress, None);
        let _ = self.tx.send(ProgressEvent {
            stage,
            progress,
            message: message.into(),
            success: None,
            error: None,
        });
    }

    fn finish_ok(mut self, message: String) {
        self.last_progress = 100;
        self.update_session(FlashStage::Complete, 100, None);
        let _ = self.tx.send(ProgressEvent {
            stage: FlashStage::Complete,
            progress: 100,
            message,
            success: Some(true),
            error: None,
        });
    }

    fn finish_err(self, err: &CoreError) {
        let progress = self.last_progress;
        let rendered = err.to_string();
        self.update_session(FlashStage::Failed, progress, Some(&rendered));
        let _ = self.tx.send(ProgressEvent {
            stage: FlashStage::Failed,
            progress,
            message: "flash session failed".to_string(),
            success: Some(false),
            error: Some(rendered),
        });
    }
}

struct SessionTask {
    transport: Arc<DeviceTransport>,
    downloader: Arc<Downloader>,
    staging_dir: PathBuf,
    stage_timeout: Duration,
    device_id: String,
    source: FlashSource,
    opts: FlashOptions,
}

impl SessionTask {
    async fn run(self, mut emitter: Emitter) {
        match self.run_stages(&mut emitter).await {
            Ok(summary) => emitter.finish_ok(summary),
            Err(e) => {
                log::warn!("flash session for {} failed: {e}", self.device_id);
                emitter.finish_err(&e);
            }
        }
    }

    async fn staged<T>(
        &self,
        stage: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.stage_timeout, fut)
            .await
            .map_err(|_| CoreError::StageTimeout(stage))?
    }

    async fn run_stages(&self, emitter: &mut Emitter) -> Result<String> {
        let device_id = self.device_id.as_str();
        let partition = self.opts.partition.as_deref().unwrap_or("radio").to_string();

        // Detecting. No retry: an absent device fails the session.
        emitter.emit(FlashStage::Detecting, 5, format!("locating device {device_id}"));
        let device = self
            .staged("detecting", self.transport.detect_device(Some(device_id)))
            .await?;

        // Backing up, before anything destructive. Never silently skipped:
        // an unavailable backup is surfaced and only continues as a warning.
        emitter.emit(FlashStage::BackingUp, 12, format!("backing up current {partition} image"));
        self.back_up(emitter, &device, &partition).await?;

        // Downloading + Verifying.
        let (image_path, expected_version) = self.stage_image(emitter).await?;

        // Flashing. Irreversible from here; failures are fatal and never
        // retried against a device mid-write.
        if device.connection_mode == ConnectionMode::Debug {
            emitter.emit(FlashStage::Flashing, 70, "rebooting into bootloader");
            let outcome = self
                .staged(
                    "flashing",
                    self.transport.reboot(RebootTarget::Bootloader, Some(device_id)),
                )
                .await?;
            if !outcome.succeeded {
                return Err(CoreError::TransportFailure(
                    outcome.error_message.unwrap_or_else(|| "reboot failed".to_string()),
                ));
            }
            let appeared = self
                .staged("flashing", async {
                    Ok(self
                        .transport
                        .wait_for_device(ConnectionMode::Bootloader, REBOOT_WAIT)
                        .await)
                })
                .await?;
            if !appeared {
                return Err(CoreError::DeviceNotFound);
            }
        }

        emitter.emit(FlashStage::Flashing, 75, format!("flashing {partition} partition"));
        let image_str = image_path.to_string_lossy().into_owned();
        let outcome = self
            .staged(
                "flashing",
                self.transport.flash_partition(&partition, &image_str, Some(device_id)),
            )
            .await?;
        if !outcome.succeeded {
            return Err(CoreError::TransportFailure(
                outcome
                    .error_message
                    .unwrap_or_else(|| outcome.combined_output.trim().to_string()),
            ));
        }
        emitter.emit(FlashStage::Flashing, 90, "partition written");

        // Confirming.
        emitter.emit(FlashStage::Confirming, 95, "confirming flashed version");
        if let Some(expected) = expected_version {
            let current = self
                .staged("confirming", self.transport.get_current_version(Some(device_id)))
                .await?;
            let confirmed = current
                .as_deref()
                .is_some_and(|cur| cur == expected || cur.contains(&expected));
            if !confirmed {
                return Err(CoreError::ConfirmFailed(format!(
                    "device reports baseband {current:?}, expected {expected}"
                )));
            }
        }
        // Local-path flashes have no expected version; the transport's exit
        // status above is the confirmation.

        Ok(format!("{partition} firmware flashed; {FLASH_REMINDER}"))
    }

    async fn back_up(
        &self,
        emitter: &mut Emitter,
        device: &Device,
        partition: &str,
    ) -> Result<()> {
        if device.connection_mode != ConnectionMode::Debug {
            let msg = "device is in bootloader mode; partitions cannot be read for backup";
            if self.opts.require_backup {
                return Err(CoreError::BackupUnavailable(msg.to_string()));
            }
            emitter.emit(
                FlashStage::BackingUp,
                20,
                format!("warning: proceeding without backup: {msg}"),
            );
            return Ok(());
        }

        let backup_path = self.staging_dir.join(format!(
            "{}-{partition}-backup.img",
            safe_file_component(&self.device_id)
        ));
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let result = self
            .staged(
                "backing-up",
                self.transport
                    .backup_partition(partition, &backup_path, Some(&self.device_id)),
            )
            .await;
        match result {
            Ok(path) => {
                emitter.emit(
                    FlashStage::BackingUp,
                    20,
                    format!("backup saved to {}", path.display()),
                );
                Ok(())
            }
            Err(CoreError::BackupUnavailable(msg)) if !self.opts.require_backup => {
                emitter.emit(
                    FlashStage::BackingUp,
                    20,
                    format!("warning: proceeding without backup: {msg}"),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Download + verify for catalog sources; existence check for local
    /// images. Returns the image path and the expected post-flash version,
    /// when one is known.
    async fn stage_image(&self, emitter: &mut Emitter) -> Result<(PathBuf, Option<String>)> {
        match &self.source {
            FlashSource::Catalog(record) => {
                emitter.emit(
                    FlashStage::Downloading,
                    22,
                    format!("downloading {} {} ({} bytes)", record.codename, record.version, record.size_bytes),
                );
                tokio::fs::create_dir_all(&self.staging_dir).await?;
                let dest = self
                    .staging_dir
                    .join(format!("{}.img", safe_file_component(&record.id)));

                {
                    let tx = emitter.tx.clone();
                    let sessions = Arc::clone(&emitter.sessions);
                    let device_id = emitter.device_id.clone();
                    let mut forward = Emitter { device_id, tx, sessions, last_progress: 0 };
                    self.staged(
                        "downloading",
                        self.downloader.fetch(&record.download_url, &dest, |percent| {
                            let scaled = 22 + u8::try_from(u16::from(percent) * 40 / 100).unwrap_or(40);
                            forward.emit(
                                FlashStage::Downloading,
                                scaled,
                                format!("downloaded {percent}%"),
                            );
                        }),
                    )
                    .await?;
                    emitter.last_progress = forward.last_progress.max(emitter.last_progress);
                }

                emitter.emit(FlashStage::Verifying, 65, "verifying artifact checksums");
                self.staged(
                    "verifying",
                    verify_checksums(&dest, record.md5.as_deref(), record.sha256.as_deref()),
                )
                .await?;
                Ok((dest, Some(record.version.clone())))
            }
            FlashSource::LocalImage(path) => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(CoreError::InvalidParameter(format!(
                        "image {} does not exist",
                        path.display()
                    )));
                }
                emitter.emit(
                    FlashStage::Verifying,
                    65,
                    "local image supplied; no declared checksums to verify",
                );
                Ok((path.clone(), None))
            }
        }
    }
}

/// Reject malformed flash requests without any device interaction. Shared
/// with the engine so its pre-flight device probe only happens for requests
/// that could actually start.
pub(crate) fn validate_request(
    device_id: &str,
    source: &FlashSource,
    opts: &FlashOptions,
) -> Result<()> {
    if device_id.is_empty() {
        return Err(CoreError::InvalidParameter("device id is required".to_string()));
    }
    if let Some(partition) = opts.partition.as_deref() {
        if partition.is_empty() {
            return Err(CoreError::InvalidParameter("partition must not be empty".to_string()));
        }
    }
    match source {
        FlashSource::Catalog(record) => {
            if record.md5.is_none() && record.sha256.is_none() {
                return Err(CoreError::InvalidParameter(format!(
                    "firmware record {} declares no checksum; refusing to flash unverifiable image",
                    record.id
                )));
            }
            if record.download_url.is_empty() {
                return Err(CoreError::InvalidParameter(format!(
                    "firmware record {} has no download url",
                    record.id
                )));
            }
        }
        FlashSource::LocalImage(path) => {
            if path.as_os_str().is_empty() {
                return Err(CoreError::InvalidParameter("image path is required".to_string()));
            }
        }
    }
    Ok(())
}

pub(crate) fn safe_file_component(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

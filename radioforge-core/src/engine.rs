//! Top-level engine facade.
//!
//! Wires the transport, catalog, compatibility evaluator and orchestrator
//! together behind one API. The daemon and CLI talk to this type only.

use crate::catalog::store::{FirmwareStore, JsonFileStore, MemoryStore};
use crate::catalog::{FirmwareCatalog, FirmwareRecord, SearchQuery, SearchResult, UpdateCheck};
use crate::compat::CompatibilityEvaluator;
use crate::device::Device;
use crate::error::{CoreError, Result};
use crate::orchestrator::{
    FlashOptions, FlashOrchestrator, FlashSession, FlashSource, ProgressEvent,
};
use crate::support::{
    get_device_support, list_supported_devices, validate_for_operation, DeviceSupport, Operation,
    OperationGate,
};
use crate::transport::runner::{CommandRunner, ProcessRunner};
use crate::transport::{DeviceTransport, ToolPaths};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tool_paths: ToolPaths,
    /// Where downloaded images and partition backups land.
    pub staging_dir: PathBuf,
    pub cache_ttl: Duration,
    /// JSON catalog file; `None` starts with an empty in-memory catalog.
    pub catalog_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_paths: ToolPaths::default(),
            staging_dir: std::env::temp_dir().join("radioforge"),
            cache_ttl: crate::catalog::cache::DEFAULT_TTL,
            catalog_path: None,
        }
    }
}

pub struct Engine {
    transport: Arc<DeviceTransport>,
    catalog: Arc<FirmwareCatalog>,
    evaluator: CompatibilityEvaluator,
    orchestrator: FlashOrchestrator,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_runner(config, Arc::new(ProcessRunner::new()))
    }

    /// Same wiring with a custom command runner; this is how tests and the
    /// daemon's mock mode get a device-free engine.
    pub fn with_runner(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let store: Arc<dyn FirmwareStore> = match config.catalog_path {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => Arc::new(MemoryStore::new(Vec::new())),
        };
        Self::assemble(config.tool_paths, config.staging_dir, config.cache_ttl, runner, store)
    }

    pub fn with_store(
        config: EngineConfig,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn FirmwareStore>,
    ) -> Self {
        Self::assemble(config.tool_paths, config.staging_dir, config.cache_ttl, runner, store)
    }

    fn assemble(
        tools: ToolPaths,
        staging_dir: PathBuf,
        cache_ttl: Duration,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn FirmwareStore>,
    ) -> Self {
        let transport = Arc::new(DeviceTransport::new(runner, tools));
        let catalog = Arc::new(FirmwareCatalog::new(store, cache_ttl));
        catalog.initialize_cache();
        Self {
            evaluator: CompatibilityEvaluator::new(Arc::clone(&catalog)),
            orchestrator: FlashOrchestrator::new(Arc::clone(&transport), staging_dir),
            transport,
            catalog,
        }
    }

    // Device operations.

    pub async fn detect_device(&self, device_id: Option<&str>) -> Result<Device> {
        self.transport.detect_device(device_id).await
    }

    pub async fn list_devices(&self) -> Vec<String> {
        let mut ids = self
            .transport
            .list_devices(crate::device::ConnectionMode::Debug)
            .await;
        ids.extend(
            self.transport
                .list_devices(crate::device::ConnectionMode::Bootloader)
                .await,
        );
        ids
    }

    pub fn supported_devices(&self) -> &'static [DeviceSupport] {
        list_supported_devices()
    }

    pub fn device_support(&self, codename: &str) -> Option<&'static DeviceSupport> {
        get_device_support(codename)
    }

    /// Detect the device, then gate `operation` against its observed state.
    pub async fn validate_operation(
        &self,
        operation: Operation,
        device_id: Option<&str>,
    ) -> Result<OperationGate> {
        let device = self.transport.detect_device(device_id).await?;
        Ok(validate_for_operation(operation, &device))
    }

    pub async fn get_current_version(&self, device_id: Option<&str>) -> Result<Option<String>> {
        self.transport.get_current_version(device_id).await
    }

    /// Back up the device's modem partition into the staging directory.
    pub async fn backup_current(&self, device_id: Option<&str>) -> Result<PathBuf> {
        let device = self.transport.detect_device(device_id).await?;
        let partition = self.partition_for(&device);
        let dest = self.orchestrator.staging_dir().join(format!(
            "{}-{partition}-backup.img",
            crate::orchestrator::safe_file_component(&device.id)
        ));
        tokio::fs::create_dir_all(self.orchestrator.staging_dir()).await?;
        self.transport
            .backup_partition(&partition, &dest, Some(&device.id))
            .await
    }

    // Catalog operations.

    pub async fn search_firmware(&self, query: &SearchQuery) -> Result<SearchResult> {
        self.catalog.search(query).await
    }

    pub async fn latest_firmware(
        &self,
        codename: &str,
        official_only: bool,
    ) -> Result<Option<FirmwareRecord>> {
        self.catalog.latest(codename, official_only).await
    }

    pub async fn popular_firmware(&self, codename: &str, limit: i64) -> Result<Vec<FirmwareRecord>> {
        self.catalog.popular(codename, limit).await
    }

    pub async fn check_for_updates(
        &self,
        current_version: &str,
        codename: &str,
    ) -> Result<UpdateCheck> {
        self.catalog.check_for_updates(current_version, codename).await
    }

    pub async fn validate_firmware_url(&self, url: &str) -> bool {
        self.catalog.validate_firmware_url(url).await
    }

    pub async fn find_firmware(&self, codename: &str, id: &str) -> Result<FirmwareRecord> {
        self.catalog
            .search(&SearchQuery::for_codename(codename))
            .await?
            .records
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| {
                CoreError::InvalidParameter(format!("no firmware {id:?} known for {codename}"))
            })
    }

    /// Firmware eligible for the device as currently flashed.
    pub async fn compatible_firmware(&self, device_id: Option<&str>) -> Result<Vec<FirmwareRecord>> {
        let device = self.transport.detect_device(device_id).await?;
        let codename = device.codename.ok_or_else(|| {
            CoreError::InvalidParameter("device did not report a codename".to_string())
        })?;
        let current = self.transport.get_current_version(Some(&device.id)).await?;
        self.evaluator.eligible(&codename, current.as_deref()).await
    }

    pub fn initialize_cache(&self) {
        self.catalog.initialize_cache();
    }

    pub fn clear_cache(&self) {
        self.catalog.clear_cache();
    }

    // Flashing.

    /// Start a flash session. For catalog sources the detected codename must
    /// appear in the record's compatibility set; that check cannot be opted
    /// out of.
    pub async fn start_flash(
        &self,
        device_id: &str,
        source: FlashSource,
        mut opts: FlashOptions,
    ) -> Result<UnboundedReceiverStream<ProgressEvent>> {
        // Malformed requests are rejected before the device is ever probed.
        crate::orchestrator::validate_request(device_id, &source, &opts)?;
        let device = self.transport.detect_device(Some(device_id)).await?;

        if let FlashSource::Catalog(record) = &source {
            let codename = device.codename.as_deref().ok_or_else(|| {
                CoreError::IncompatibleFirmware(
                    "device did not report a codename; cannot evaluate compatibility".to_string(),
                )
            })?;
            if !CompatibilityEvaluator::record_allows(record, codename) {
                return Err(CoreError::IncompatibleFirmware(format!(
                    "firmware {} is not compatible with {codename}",
                    record.id
                )));
            }
        }

        if opts.partition.is_none() {
            opts.partition = Some(self.partition_for(&device));
        }
        self.orchestrator.start_flash(device_id, source, opts)
    }

    pub fn flash_session(&self, device_id: &str) -> Option<FlashSession> {
        self.orchestrator.session(device_id)
    }

    fn partition_for(&self, device: &Device) -> String {
        device
            .codename
            .as_deref()
            .and_then(get_device_support)
            .map_or("radio", |s| s.modem_partition)
            .to_string()
    }
}

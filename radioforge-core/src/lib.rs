//! RadioForge Core - radio/modem firmware management and flashing engine.
//!
//! This crate talks to devices over their debug and bootloader transports,
//! answers firmware catalog queries, evaluates flash compatibility, and
//! drives flash sessions with live progress events.

pub mod catalog;
pub mod compat;
pub mod device;
pub mod download;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod support;
pub mod transport;

// Re-export commonly used types
pub use catalog::store::{FirmwareStore, JsonFileStore, MemoryStore};
pub use catalog::{FirmwareCatalog, FirmwareRecord, SearchQuery, SearchResult, UpdateCheck};
pub use compat::CompatibilityEvaluator;
pub use device::{ConnectionMode, Device};
pub use download::Downloader;
pub use engine::{Engine, EngineConfig};
pub use error::{CoreError, Result};
pub use orchestrator::{
    FlashOptions, FlashOrchestrator, FlashSession, FlashSource, FlashStage, ProgressEvent,
};
pub use support::{DeviceSupport, Operation, OperationGate};
pub use transport::runner::{CommandRunner, ProcessRunner, RawOutput, ScriptedRunner};
pub use transport::{CommandOutcome, DeviceTransport, PartitionInfo, RebootTarget, ToolPaths};

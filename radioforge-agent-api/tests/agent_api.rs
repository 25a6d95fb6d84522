//! Integration tests for the agent API.

#![allow(missing_docs)]
#![allow(clippy::uninlined_format_args)]

use chrono::NaiveDate;
use radioforge_agent_api::client::AgentClient;
use radioforge_agent_api::proto::{FlashRequest, Request};
use radioforge_agent_api::run_server;
use radioforge_core::{
    Device, Engine, EngineConfig, FirmwareRecord, FlashStage, MemoryStore, RawOutput,
    ScriptedRunner, SearchQuery, SearchResult, UpdateCheck,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn kebab_record(id: &str, version: &str, build_date: (i32, u32, u32)) -> FirmwareRecord {
    FirmwareRecord {
        id: id.to_string(),
        version: version.to_string(),
        codename: "kebab".to_string(),
        region: "GLOBAL".to_string(),
        build_date: NaiveDate::from_ymd_opt(build_date.0, build_date.1, build_date.2).unwrap(),
        size_bytes: 100 * 1024 * 1024,
        md5: None,
        sha256: Some("11".repeat(32)),
        download_url: format!("https://mirror.invalid/kebab/{version}/modem.img"),
        is_official: true,
        compatibility: BTreeSet::from(["kebab".to_string()]),
        changelog: String::new(),
    }
}

fn mock_engine(staging: std::path::PathBuf) -> Arc<Engine> {
    let runner = ScriptedRunner::new()
        .on_ok("fastboot devices", "MOCKSERIAL\tfastboot\n")
        .on("getvar product", RawOutput::ok_stderr("product: kebab\n"))
        .on("getvar unlocked", RawOutput::ok_stderr("unlocked: yes\n"))
        .on("getvar secure", RawOutput::ok_stderr("secure: no\n"))
        .on("getvar version-baseband", RawOutput::ok_stderr("version-baseband: 11.0\n"))
        .on_ok("adb devices", "List of devices attached\n")
        .on_ok("flash modem", "OKAY\nFinished.\n");
    let records = vec![
        kebab_record("kebab-11.0", "11.0", (2023, 11, 2)),
        kebab_record("kebab-11.2", "11.2", (2024, 2, 19)),
    ];
    let config = EngineConfig { staging_dir: staging, ..EngineConfig::default() };
    Arc::new(Engine::with_store(config, Arc::new(runner), Arc::new(MemoryStore::new(records))))
}

async fn start_agent(port: u16, staging: std::path::PathBuf) -> AgentClient {
    let engine = mock_engine(staging);
    tokio::spawn(async move {
        if let Err(e) = run_server(engine, "127.0.0.1", port).await {
            eprintln!("Test server error during run: {:?}", e);
        }
    });

    // Wait for the server to start robustly
    let mut started = false;
    for _ in 0..50 {
        if std::net::TcpStream::connect(format!("127.0.0.1:{port}")).is_ok() {
            started = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(started, "Server did not start on port {port}");

    AgentClient::connect(&format!("127.0.0.1:{port}")).await.expect("Failed to connect")
}

#[tokio::test]
async fn test_agent_api_basic_ops() {
    let staging = tempfile::tempdir().unwrap();
    let mut client = start_agent(45157, staging.path().to_path_buf()).await;

    // Detection over the wire.
    let device: Device = client
        .call(&Request::DetectDevice { device_id: None })
        .await
        .expect("detect failed");
    assert_eq!(device.id, "MOCKSERIAL");
    assert_eq!(device.codename.as_deref(), Some("kebab"));

    // Catalog queries over the wire.
    let result: SearchResult = client
        .call(&Request::Search { query: SearchQuery::for_codename("kebab") })
        .await
        .expect("search failed");
    assert_eq!(result.total_count, 2);

    let latest: Option<FirmwareRecord> = client
        .call(&Request::Latest { codename: "kebab".to_string(), official_only: false })
        .await
        .expect("latest failed");
    assert_eq!(latest.unwrap().version, "11.2");

    let check: UpdateCheck = client
        .call(&Request::CheckUpdates {
            codename: "kebab".to_string(),
            current_version: "11.0".to_string(),
        })
        .await
        .expect("update check failed");
    assert!(check.has_update);

    // Daemon-side errors surface as client errors, not protocol failures.
    let missing: anyhow::Result<FirmwareRecord> = client
        .call(&Request::DeviceSupport { codename: "pixel".to_string() })
        .await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_agent_api_flash_streams_progress_then_answers_queries() {
    let staging = tempfile::tempdir().unwrap();
    let image = staging.path().join("modem.img");
    tokio::fs::write(&image, b"image bytes").await.unwrap();
    let mut client = start_agent(45158, staging.path().to_path_buf()).await;

    let mut seen = Vec::new();
    let terminal = client
        .flash(
            FlashRequest {
                device_id: "MOCKSERIAL".to_string(),
                firmware_id: None,
                codename: None,
                image_path: Some(image.to_string_lossy().into_owned()),
                partition: None,
                require_backup: false,
            },
            |event| seen.push(event.stage),
        )
        .await
        .expect("flash failed");

    assert_eq!(terminal.success, Some(true));
    assert_eq!(terminal.progress, 100);
    assert!(seen.contains(&FlashStage::Flashing));

    // The connection keeps working after a streamed flash.
    let session: radioforge_core::FlashSession = client
        .call(&Request::FlashSession { device_id: "MOCKSERIAL".to_string() })
        .await
        .expect("session query failed");
    assert_eq!(session.stage, FlashStage::Complete);
}

#[tokio::test]
async fn test_agent_api_rejects_ambiguous_flash_request() {
    let staging = tempfile::tempdir().unwrap();
    let mut client = start_agent(45159, staging.path().to_path_buf()).await;

    let err = client
        .flash(
            FlashRequest {
                device_id: "MOCKSERIAL".to_string(),
                firmware_id: Some("kebab-11.2".to_string()),
                codename: None,
                image_path: Some("/tmp/also-an-image.img".to_string()),
                partition: None,
                require_backup: false,
            },
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not both"));
}

//! End-to-end flash sessions against a scripted device transport and a
//! local HTTP server standing in for the firmware mirror.

use chrono::NaiveDate;
use radioforge_core::{
    DeviceTransport, FirmwareRecord, FlashOptions, FlashOrchestrator, FlashSource, FlashStage,
    ProgressEvent, RawOutput, ScriptedRunner, ToolPaths,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;

const IMAGE_BYTES: &[u8] = b"NON-HLOS radio image payload";

/// Minimal HTTP/1.1 server that answers every request with `body`.
async fn spawn_mirror(body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                loop {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) => return,
                        Ok(n) => read += n,
                        Err(_) => return,
                    }
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                    if read == buf.len() {
                        return;
                    }
                }
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

fn catalog_record(url: &str, sha256: &str) -> FirmwareRecord {
    FirmwareRecord {
        id: "fw-guac-12".to_string(),
        version: "12.0".to_string(),
        codename: "guacamole".to_string(),
        region: "GLOBAL".to_string(),
        build_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        size_bytes: IMAGE_BYTES.len() as u64,
        md5: None,
        sha256: Some(sha256.to_string()),
        download_url: format!("{url}/fw-guac-12.img"),
        is_official: true,
        compatibility: BTreeSet::from(["guacamole".to_string()]),
        changelog: String::new(),
    }
}

fn bootloader_runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .on_ok("fastboot devices", "serial1\tfastboot\n")
        .on("getvar product", RawOutput::ok_stderr("product: guacamole\n"))
        .on("getvar unlocked", RawOutput::ok_stderr("unlocked: yes\n"))
        .on("getvar secure", RawOutput::ok_stderr("secure: yes\n"))
        .on("getvar version-baseband", RawOutput::ok_stderr("version-baseband: 12.0\n"))
        .on_ok("adb devices", "List of devices attached\n")
        .on_ok("flash radio", "Sending 'radio'\nOKAY\nFinished.\n")
}

async fn run_to_end(
    orch: &FlashOrchestrator,
    record: FirmwareRecord,
) -> Vec<ProgressEvent> {
    let stream = orch
        .start_flash("serial1", FlashSource::Catalog(record), FlashOptions::default())
        .unwrap();
    stream.collect().await
}

#[tokio::test]
async fn test_catalog_flash_downloads_verifies_and_flashes() {
    let url = spawn_mirror(IMAGE_BYTES).await;
    let sha256 = hex::encode(Sha256::digest(IMAGE_BYTES));
    let record = catalog_record(&url, &sha256);

    let runner = Arc::new(bootloader_runner());
    let staging = tempfile::tempdir().unwrap();
    let transport = Arc::new(DeviceTransport::new(runner.clone(), ToolPaths::default()));
    let orch = FlashOrchestrator::new(transport, staging.path().to_path_buf());

    let events = run_to_end(&orch, record).await;
    let last = events.last().unwrap();
    assert_eq!(last.stage, FlashStage::Complete);
    assert_eq!(last.progress, 100);
    assert_eq!(last.success, Some(true));

    // Every stage of the pipeline was reported.
    for stage in [
        FlashStage::Detecting,
        FlashStage::Downloading,
        FlashStage::Verifying,
        FlashStage::Flashing,
        FlashStage::Confirming,
    ] {
        assert!(events.iter().any(|e| e.stage == stage), "missing {stage:?}");
    }

    // Progress never goes backwards until the terminal event.
    let mut last_progress = 0;
    for event in &events {
        assert!(event.progress >= last_progress, "progress regressed at {event:?}");
        last_progress = event.progress;
    }

    // The downloaded image actually hit the flash tool.
    assert!(runner.calls().iter().any(|c| c.contains("flash radio")));
}

#[tokio::test]
async fn test_checksum_mismatch_never_reaches_the_device() {
    let url = spawn_mirror(IMAGE_BYTES).await;
    let record = catalog_record(&url, &"ab".repeat(32));

    let runner = Arc::new(bootloader_runner());
    let staging = tempfile::tempdir().unwrap();
    let transport = Arc::new(DeviceTransport::new(runner.clone(), ToolPaths::default()));
    let orch = FlashOrchestrator::new(transport, staging.path().to_path_buf());

    let events = run_to_end(&orch, record).await;
    let last = events.last().unwrap();
    assert_eq!(last.stage, FlashStage::Failed);
    assert_eq!(last.success, Some(false));
    assert!(last.error.as_deref().unwrap().contains("checksum"));

    // No flash or erase command was ever issued.
    assert!(!runner.calls().iter().any(|c| c.contains("flash ") || c.contains("erase ")));

    let session = orch.session("serial1").unwrap();
    assert_eq!(session.stage, FlashStage::Failed);
}

#[tokio::test]
async fn test_download_progress_is_scaled_into_the_session_window() {
    let url = spawn_mirror(IMAGE_BYTES).await;
    let sha256 = hex::encode(Sha256::digest(IMAGE_BYTES));
    let record = catalog_record(&url, &sha256);

    let staging = tempfile::tempdir().unwrap();
    let transport = Arc::new(DeviceTransport::new(
        Arc::new(bootloader_runner()),
        ToolPaths::default(),
    ));
    let orch = FlashOrchestrator::new(transport, staging.path().to_path_buf());

    let events = run_to_end(&orch, record).await;
    let download_events: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| e.stage == FlashStage::Downloading)
        .collect();
    assert!(!download_events.is_empty());
    assert!(download_events.iter().all(|e| e.progress >= 22 && e.progress <= 62));
}

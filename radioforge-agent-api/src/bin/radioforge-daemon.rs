use clap::Parser;
use log::{error, info};
use radioforge_core::{
    Engine, EngineConfig, FirmwareRecord, MemoryStore, RawOutput, ScriptedRunner, ToolPaths,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 45151)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Path to the adb binary
    #[arg(long, default_value = "adb")]
    adb: String,

    /// Path to the fastboot binary
    #[arg(long, default_value = "fastboot")]
    fastboot: String,

    /// JSON firmware catalog file
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Directory for downloads and backups
    #[arg(long)]
    staging: Option<PathBuf>,

    /// Run in mock mode (no device tools required)
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting RadioForge daemon...");

    let mut config = EngineConfig {
        tool_paths: ToolPaths { adb: args.adb, fastboot: args.fastboot },
        catalog_path: args.catalog,
        ..EngineConfig::default()
    };
    if let Some(staging) = args.staging {
        config.staging_dir = staging;
    }

    let engine = if args.mock {
        info!("Starting in MOCK mode. No device tools will be invoked.");
        Arc::new(Engine::with_store(
            config,
            Arc::new(mock_runner()),
            Arc::new(MemoryStore::new(mock_catalog())),
        ))
    } else {
        Arc::new(Engine::new(config))
    };

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down...");
                std::process::exit(0);
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {err}");
            }
        }
    });

    radioforge_agent_api::run_server(engine, &args.host, args.port).await
}

/// One simulated OnePlus 8T sitting in the bootloader.
fn mock_runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .on_ok("fastboot devices", "MOCKSERIAL\tfastboot\n")
        .on("getvar product", RawOutput::ok_stderr("product: kebab\n"))
        .on("getvar unlocked", RawOutput::ok_stderr("unlocked: yes\n"))
        .on("getvar secure", RawOutput::ok_stderr("secure: no\n"))
        .on("getvar version-baseband", RawOutput::ok_stderr("version-baseband: 11.0\n"))
        .on_ok("adb devices", "List of devices attached\n")
        .on_ok("flash modem", "OKAY\nFinished.\n")
}

fn mock_catalog() -> Vec<FirmwareRecord> {
    let raw = include_str!("../../mock/catalog.json");
    serde_json::from_str(raw).expect("bundled mock catalog is valid")
}

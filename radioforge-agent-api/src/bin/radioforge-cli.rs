use clap::{Parser, Subcommand};
use radioforge_agent_api::client::AgentClient;
use radioforge_agent_api::proto::{DeviceSupportInfo, FlashRequest, Request};
use radioforge_core::support::OperationGate;
use radioforge_core::{Device, FirmwareRecord, FlashSession, SearchQuery, SearchResult, UpdateCheck};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon address
    #[arg(short, long, default_value = "127.0.0.1:45151")]
    addr: String,

    /// Device serial (optional when exactly one device is attached)
    #[arg(short, long)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the connected device
    Detect,
    /// List attached device serials
    Devices,
    /// List supported device models
    Supported,
    /// Show support details for a codename
    Support { codename: String },
    /// Check whether an operation is allowed right now
    Validate { operation: String },
    /// Report the device's current baseband version
    Version,
    /// Back up the device's modem partition
    Backup,
    /// Search the firmware catalog
    Search {
        codename: String,
        #[arg(short, long)]
        region: Option<String>,
        /// Substring version filter, e.g. "12."
        #[arg(short, long)]
        version: Option<String>,
        #[arg(long)]
        official_only: bool,
    },
    /// Show the newest known firmware for a codename
    Latest {
        codename: String,
        #[arg(long)]
        official_only: bool,
    },
    /// Show the most recently built firmware for a codename
    Popular {
        codename: String,
        #[arg(short, long, default_value_t = 5)]
        limit: i64,
    },
    /// Check whether an update exists for a version
    Updates { codename: String, current_version: String },
    /// List firmware eligible for the connected device
    Compatible,
    /// Probe a firmware download URL without fetching it
    UrlCheck { url: String },
    /// Flash firmware onto the device
    Flash {
        /// Catalog firmware id
        #[arg(long, conflicts_with = "image")]
        firmware: Option<String>,
        /// Codename for catalog lookups (defaults to the detected one)
        #[arg(long)]
        codename: Option<String>,
        /// Local image file
        #[arg(long)]
        image: Option<PathBuf>,
        /// Partition to write (defaults per device model)
        #[arg(long)]
        partition: Option<String>,
        /// Abort if the current firmware cannot be backed up first
        #[arg(long)]
        require_backup: bool,
    },
    /// Show the last known flash session for the device
    Session,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut client = AgentClient::connect(&cli.addr).await?;
    let device = cli.device;

    match cli.command {
        Commands::Detect => {
            let found: Device =
                client.call(&Request::DetectDevice { device_id: device }).await?;
            println!(
                "{} ({}) in {} mode",
                found.id,
                found.codename.as_deref().unwrap_or("unknown model"),
                found.connection_mode.as_str()
            );
            if let Some(locked) = found.bootloader_locked {
                println!("bootloader: {}", if locked { "locked" } else { "unlocked" });
            }
        }
        Commands::Devices => {
            let ids: Vec<String> = client.call(&Request::ListDevices).await?;
            if ids.is_empty() {
                println!("No devices attached.");
            }
            for id in ids {
                println!("{id}");
            }
        }
        Commands::Supported => {
            let models: Vec<DeviceSupportInfo> = client.call(&Request::SupportedDevices).await?;
            for m in models {
                println!("{:<16} {:<16} partition={}", m.codename, m.marketing_name, m.modem_partition);
            }
        }
        Commands::Support { codename } => {
            let m: DeviceSupportInfo = client.call(&Request::DeviceSupport { codename }).await?;
            println!("{} ({})", m.marketing_name, m.codename);
            println!("regions: {}", m.regions.join(", "));
            println!("modem partition: {}", m.modem_partition);
            if !m.notes.is_empty() {
                println!("notes: {}", m.notes);
            }
        }
        Commands::Validate { operation } => {
            let gate: OperationGate = client
                .call(&Request::ValidateOperation { operation: operation.clone(), device_id: device })
                .await?;
            if gate.allowed {
                println!("{operation}: allowed");
            } else {
                println!("{operation}: NOT allowed");
            }
            if let Some(warning) = gate.warning {
                println!("warning: {warning}");
            }
            if let Some(reason) = gate.reason {
                println!("reason: {reason}");
            }
        }
        Commands::Version => {
            let version: Option<String> =
                client.call(&Request::CurrentVersion { device_id: device }).await?;
            match version {
                Some(v) => println!("baseband: {v}"),
                None => println!("baseband version not reported"),
            }
        }
        Commands::Backup => {
            let path: PathBuf = client.call(&Request::Backup { device_id: device }).await?;
            println!("backup written to {}", path.display());
        }
        Commands::Search { codename, region, version, official_only } => {
            let query = SearchQuery { codename, region, version_filter: version, official_only };
            let result: SearchResult = client.call(&Request::Search { query }).await?;
            println!("{} match(es)", result.total_count);
            for record in result.records {
                print_record(&record);
            }
        }
        Commands::Latest { codename, official_only } => {
            let latest: Option<FirmwareRecord> =
                client.call(&Request::Latest { codename, official_only }).await?;
            match latest {
                Some(record) => print_record(&record),
                None => println!("no firmware known"),
            }
        }
        Commands::Popular { codename, limit } => {
            let records: Vec<FirmwareRecord> =
                client.call(&Request::Popular { codename, limit }).await?;
            for record in records {
                print_record(&record);
            }
        }
        Commands::Updates { codename, current_version } => {
            let check: UpdateCheck =
                client.call(&Request::CheckUpdates { codename, current_version }).await?;
            match check.latest {
                Some(latest) if check.has_update => {
                    println!("update available: {} ({})", latest.version, latest.id);
                }
                _ => println!("already up to date"),
            }
        }
        Commands::Compatible => {
            let records: Vec<FirmwareRecord> =
                client.call(&Request::CompatibleFirmware { device_id: device }).await?;
            if records.is_empty() {
                println!("no eligible firmware");
            }
            for record in records {
                print_record(&record);
            }
        }
        Commands::UrlCheck { url } => {
            let reachable: bool = client.call(&Request::ValidateUrl { url }).await?;
            println!("{}", if reachable { "reachable" } else { "unreachable" });
        }
        Commands::Flash { firmware, codename, image, partition, require_backup } => {
            let device_id = device
                .ok_or_else(|| anyhow::anyhow!("flash requires an explicit --device serial"))?;
            let request = FlashRequest {
                device_id,
                firmware_id: firmware,
                codename,
                image_path: image.map(|p| p.to_string_lossy().into_owned()),
                partition,
                require_backup,
            };
            let terminal = client
                .flash(request, |event| {
                    println!("[{:>3}%] {}", event.progress, event.message);
                })
                .await?;
            if terminal.success == Some(true) {
                println!("done.");
            } else {
                anyhow::bail!(
                    "flash failed: {}",
                    terminal.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
        Commands::Session => {
            let device_id = device
                .ok_or_else(|| anyhow::anyhow!("session requires an explicit --device serial"))?;
            let session: FlashSession =
                client.call(&Request::FlashSession { device_id }).await?;
            println!(
                "{}: {:?} at {}% (started {})",
                session.device_id, session.stage, session.progress, session.started_at
            );
            if let Some(error) = session.last_error {
                println!("last error: {error}");
            }
        }
    }

    Ok(())
}

fn print_record(record: &FirmwareRecord) {
    println!(
        "{:<24} {:<8} {:<6} {}  {}{}",
        record.id,
        record.version,
        record.region,
        record.build_date,
        if record.is_official { "official" } else { "community" },
        if record.changelog.is_empty() {
            String::new()
        } else {
            format!("  - {}", record.changelog)
        }
    );
}

//! Agent daemon: serves the engine over newline-delimited JSON on TCP.

pub mod client;
pub mod proto;

use proto::{FlashRequest, Reply, Request};
use radioforge_core::support::Operation;
use radioforge_core::{Engine, FlashOptions, FlashSource};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;

pub struct AgentService {
    engine: Arc<Engine>,
}

impl AgentService {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        let peer = stream.peer_addr()?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request: Request = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    write_line(&mut write_half, &Reply::err(format!("malformed request: {e}")))
                        .await?;
                    continue;
                }
            };

            log::debug!("{peer}: {request:?}");
            match request {
                Request::Flash(flash) => self.handle_flash(&mut write_half, flash).await?,
                other => {
                    let reply = self.dispatch(other).await;
                    write_line(&mut write_half, &reply).await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Reply {
        match request {
            Request::DetectDevice { device_id } => {
                reply_from(self.engine.detect_device(device_id.as_deref()).await)
            }
            Request::ListDevices => Reply::ok(self.engine.list_devices().await),
            Request::SupportedDevices => Reply::ok(self.engine.supported_devices()),
            Request::DeviceSupport { codename } => match self.engine.device_support(&codename) {
                Some(support) => Reply::ok(support),
                None => Reply::err(format!("unsupported device {codename:?}")),
            },
            Request::ValidateOperation { operation, device_id } => {
                let operation = match operation.parse::<Operation>() {
                    Ok(op) => op,
                    Err(e) => return Reply::err(e),
                };
                reply_from(self.engine.validate_operation(operation, device_id.as_deref()).await)
            }
            Request::CurrentVersion { device_id } => {
                reply_from(self.engine.get_current_version(device_id.as_deref()).await)
            }
            Request::Backup { device_id } => {
                reply_from(self.engine.backup_current(device_id.as_deref()).await)
            }
            Request::Search { query } => reply_from(self.engine.search_firmware(&query).await),
            Request::Latest { codename, official_only } => {
                reply_from(self.engine.latest_firmware(&codename, official_only).await)
            }
            Request::Popular { codename, limit } => {
                reply_from(self.engine.popular_firmware(&codename, limit).await)
            }
            Request::CheckUpdates { codename, current_version } => {
                reply_from(self.engine.check_for_updates(&current_version, &codename).await)
            }
            Request::ValidateUrl { url } => Reply::ok(self.engine.validate_firmware_url(&url).await),
            Request::CompatibleFirmware { device_id } => {
                reply_from(self.engine.compatible_firmware(device_id.as_deref()).await)
            }
            Request::FlashSession { device_id } => match self.engine.flash_session(&device_id) {
                Some(session) => Reply::ok(session),
                None => Reply::err(format!("no flash session known for {device_id}")),
            },
            Request::ClearCache => {
                self.engine.clear_cache();
                Reply::ok(())
            }
            // Streamed separately in handle_connection.
            Request::Flash(_) => Reply::err("flash must be dispatched as a stream"),
        }
    }

    /// Acknowledge with a `Reply`, then stream progress events until the
    /// terminal one. The request loop resumes afterwards, so the same
    /// connection can watch a flash and then keep issuing queries.
    async fn handle_flash(
        &self,
        writer: &mut OwnedWriteHalf,
        request: FlashRequest,
    ) -> anyhow::Result<()> {
        let source = match self.resolve_source(&request).await {
            Ok(source) => source,
            Err(message) => {
                write_line(writer, &Reply::err(message)).await?;
                return Ok(());
            }
        };
        let opts = FlashOptions {
            partition: request.partition.clone(),
            require_backup: request.require_backup,
        };

        match self.engine.start_flash(&request.device_id, source, opts).await {
            Ok(mut events) => {
                write_line(writer, &Reply::ok(())).await?;
                while let Some(event) = events.next().await {
                    write_line(writer, &event).await?;
                }
            }
            Err(e) => write_line(writer, &Reply::err(e.to_string())).await?,
        }
        Ok(())
    }

    async fn resolve_source(&self, request: &FlashRequest) -> Result<FlashSource, String> {
        match (&request.firmware_id, &request.image_path) {
            (Some(_), Some(_)) => {
                Err("give either firmware_id or image_path, not both".to_string())
            }
            (None, None) => Err("one of firmware_id or image_path is required".to_string()),
            (None, Some(path)) => Ok(FlashSource::LocalImage(PathBuf::from(path))),
            (Some(id), None) => {
                let codename = match &request.codename {
                    Some(codename) => codename.clone(),
                    None => self
                        .engine
                        .detect_device(Some(&request.device_id))
                        .await
                        .map_err(|e| e.to_string())?
                        .codename
                        .ok_or_else(|| {
                            "device did not report a codename; pass one explicitly".to_string()
                        })?,
                };
                self.engine
                    .find_firmware(&codename, id)
                    .await
                    .map(FlashSource::Catalog)
                    .map_err(|e| e.to_string())
            }
        }
    }
}

fn reply_from<T: serde::Serialize>(result: radioforge_core::Result<T>) -> Reply {
    match result {
        Ok(value) => Reply::ok(value),
        Err(e) => Reply::err(e.to_string()),
    }
}

async fn write_line<T: serde::Serialize>(
    writer: &mut OwnedWriteHalf,
    value: &T,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

pub async fn run_server(engine: Arc<Engine>, host: &str, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    log::info!("agent listening on {}", listener.local_addr()?);
    let service = Arc::new(AgentService::new(engine));

    loop {
        let (stream, peer) = listener.accept().await?;
        log::debug!("connection from {peer}");
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = service.handle_connection(stream).await {
                log::warn!("connection {peer} ended with error: {e}");
            }
        });
    }
}

//! Line-oriented client for the agent daemon.

use crate::proto::{FlashRequest, Reply, Request};
use anyhow::{anyhow, bail, Context};
use radioforge_core::ProgressEvent;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub struct AgentClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl AgentClient {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to agent at {addr}"))?;
        let (read_half, writer) = stream.into_split();
        Ok(Self { lines: BufReader::new(read_half).lines(), writer })
    }

    /// Issue one request and decode the reply payload. A daemon-side error
    /// becomes an `Err` here.
    pub async fn call<T: DeserializeOwned>(&mut self, request: &Request) -> anyhow::Result<T> {
        self.send(request).await?;
        let reply: Reply = self.next_message().await?;
        if !reply.ok {
            bail!("{}", reply.error.unwrap_or_else(|| "unspecified agent error".to_string()));
        }
        let data = reply.data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).context("decoding agent reply payload")
    }

    /// Run a flash, invoking `on_event` for every progress line. Returns the
    /// terminal event.
    pub async fn flash<F>(
        &mut self,
        request: FlashRequest,
        mut on_event: F,
    ) -> anyhow::Result<ProgressEvent>
    where
        F: FnMut(&ProgressEvent),
    {
        self.send(&Request::Flash(request)).await?;
        let ack: Reply = self.next_message().await?;
        if !ack.ok {
            bail!("{}", ack.error.unwrap_or_else(|| "flash rejected".to_string()));
        }

        loop {
            let event: ProgressEvent = self.next_message().await?;
            on_event(&event);
            if event.success.is_some() {
                return Ok(event);
            }
        }
    }

    async fn send(&mut self, request: &Request) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn next_message<T: DeserializeOwned>(&mut self) -> anyhow::Result<T> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("agent closed the connection"))?;
        serde_json::from_str(&line).with_context(|| format!("decoding agent line {line:?}"))
    }
}

//! Streaming firmware downloads and artifact integrity checks.

use crate::error::{CoreError, Result};
use futures_util::StreamExt;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Attempts per fetch. Network fetches get bounded retry with backoff;
/// device partition operations never do.
const DOWNLOAD_ATTEMPTS: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

pub struct Downloader {
    http: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Stream `url` into `dest`, reporting whole-percent progress. Progress
    /// callbacks fire at most once per percent so the event channel is not
    /// flooded.
    pub async fn fetch<F>(&self, url: &str, dest: &Path, mut on_progress: F) -> Result<()>
    where
        F: FnMut(u8) + Send,
    {
        let mut attempt = 1;
        loop {
            match self.try_fetch(url, dest, &mut on_progress).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < DOWNLOAD_ATTEMPTS => {
                    log::warn!("download attempt {attempt} failed ({e}), retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_fetch<F>(&self, url: &str, dest: &Path, on_progress: &mut F) -> Result<()>
    where
        F: FnMut(u8) + Send,
    {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::Download(format!("HTTP {} from {url}", response.status())));
        }

        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut last_percent: u8 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CoreError::Download(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if total > 0 {
                let percent = ((written.saturating_mul(100)) / total).min(100) as u8;
                if percent > last_percent {
                    last_percent = percent;
                    on_progress(percent);
                }
            }
        }
        file.flush().await?;
        Ok(())
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify every digest declared for the artifact. A digest that does not
/// match is fatal for the session that staged the file.
pub async fn verify_checksums(
    path: &Path,
    md5: Option<&str>,
    sha256: Option<&str>,
) -> Result<()> {
    let data = tokio::fs::read(path).await?;

    if let Some(expected) = sha256 {
        let actual = hex::encode(Sha256::digest(&data));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(CoreError::ChecksumMismatch {
                algorithm: "sha256",
                expected: expected.to_string(),
                actual,
            });
        }
    }

    if let Some(expected) = md5 {
        let actual = hex::encode(Md5::digest(&data));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(CoreError::ChecksumMismatch {
                algorithm: "md5",
                expected: expected.to_string(),
                actual,
            });
        }
    }

    Ok(())
}

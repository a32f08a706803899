//! Antivirus scanning.
//!
//! `ClamdScanner` streams content to a clamd daemon with the `zINSTREAM`
//! command: a sequence of `<u32 big-endian length><bytes>` chunks closed by
//! a zero-length chunk. clamd answers `stream: OK` or
//! `stream: <signature> FOUND`.

use crate::services::{
    content_store::ByteStream,
    storage_service::{StoreError, StoreResult},
};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    Clean,
    /// Name of the detected signature.
    VirusFound(String),
}

#[async_trait]
pub trait AntivirusScanner: Send + Sync {
    /// Scan everything `content` yields.
    async fn scan_reader(&self, content: ByteStream) -> StoreResult<ScanResult>;

    fn name(&self) -> &'static str;
}

/// Reports every file as clean. Used when no scanner is configured.
#[derive(Debug, Clone, Default)]
pub struct NoOpScanner;

#[async_trait]
impl AntivirusScanner for NoOpScanner {
    async fn scan_reader(&self, _content: ByteStream) -> StoreResult<ScanResult> {
        Ok(ScanResult::Clean)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

#[derive(Debug, Clone)]
pub struct ClamdScanner {
    addr: String,
}

impl ClamdScanner {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl AntivirusScanner for ClamdScanner {
    async fn scan_reader(&self, mut content: ByteStream) -> StoreResult<ScanResult> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| StoreError::Scanner(format!("connecting to clamd at {} timed out", self.addr)))?
            .map_err(|e| StoreError::Scanner(format!("connecting to clamd at {}: {}", self.addr, e)))?;

        stream.write_all(b"zINSTREAM\0").await?;
        let mut sent: u64 = 0;
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            // a zero-length chunk would end the session early
            for piece in chunk.chunks(CHUNK_SIZE) {
                stream.write_all(&(piece.len() as u32).to_be_bytes()).await?;
                stream.write_all(piece).await?;
            }
            sent += chunk.len() as u64;
        }
        stream.write_all(&0u32.to_be_bytes()).await?;
        stream.flush().await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        let reply = String::from_utf8_lossy(&reply);
        debug!(bytes = sent, reply = %reply.trim_end_matches('\0'), "clamd reply");
        parse_clamd_reply(&reply)
    }

    fn name(&self) -> &'static str {
        "clamd"
    }
}

/// Interpret a clamd `INSTREAM` reply.
pub fn parse_clamd_reply(reply: &str) -> StoreResult<ScanResult> {
    let reply = reply.trim_end_matches(['\0', '\n', '\r']).trim();
    let body = reply.strip_prefix("stream:").map(str::trim).unwrap_or(reply);

    if body == "OK" {
        return Ok(ScanResult::Clean);
    }
    if let Some(virus) = body.strip_suffix("FOUND") {
        return Ok(ScanResult::VirusFound(virus.trim().to_string()));
    }
    Err(StoreError::Scanner(format!("unexpected clamd reply `{}`", reply)))
}

//! Upload bodies parked on disk between the request and the stores.
//!
//! Each multipart part is written chunk by chunk to
//! `spool_dir/.tmp-upload-<uuid>`. The first [`SNIFF_LEN`] bytes stay in
//! memory for content sniffing; the scan and the content store re-read the
//! rest from disk. The spool file is removed when its [`FileSource`] drops.

use crate::services::{
    content_store::{ByteStream, byte_stream},
    sniff::SNIFF_LEN,
};
use bytes::{Bytes, BytesMut};
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

const SPOOL_PREFIX: &str = ".tmp-upload-";

/// Content of one uploaded file.
#[derive(Debug)]
pub enum FileSource {
    Memory(Bytes),
    Spooled(SpooledFile),
}

impl FileSource {
    /// Bytes received for this file.
    pub fn size(&self) -> u64 {
        match self {
            FileSource::Memory(bytes) => bytes.len() as u64,
            FileSource::Spooled(file) => file.size,
        }
    }

    /// Leading bytes, at most [`SNIFF_LEN`].
    pub fn head(&self) -> &[u8] {
        match self {
            FileSource::Memory(bytes) => &bytes[..bytes.len().min(SNIFF_LEN)],
            FileSource::Spooled(file) => &file.head,
        }
    }

    /// Stream the whole content from the start. Can be called repeatedly.
    pub async fn open(&self) -> io::Result<ByteStream> {
        match self {
            FileSource::Memory(bytes) => Ok(byte_stream(bytes.clone())),
            FileSource::Spooled(file) => {
                if file.truncated {
                    return Err(io::Error::other(format!(
                        "spooled upload {} stopped storing after its size limit",
                        file.path.path.display()
                    )));
                }
                let reader = File::open(&file.path.path).await?;
                Ok(Box::pin(ReaderStream::new(reader)))
            }
        }
    }
}

impl From<Bytes> for FileSource {
    fn from(bytes: Bytes) -> Self {
        FileSource::Memory(bytes)
    }
}

/// A finished spool file.
#[derive(Debug)]
pub struct SpooledFile {
    path: SpoolPath,
    size: u64,
    head: Bytes,
    /// Set when the part outgrew its limit; only `size` is meaningful then.
    truncated: bool,
}

/// Removes the spool file on drop, including when a request is cancelled
/// mid-part.
#[derive(Debug)]
struct SpoolPath {
    path: PathBuf,
}

impl Drop for SpoolPath {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "could not remove spool file");
            }
        }
    }
}

/// Creates spool files under one directory.
#[derive(Debug, Clone)]
pub struct Spooler {
    dir: PathBuf,
}

impl Spooler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Start a spool file. With a `limit`, bytes past it are counted but
    /// not written.
    pub async fn create(&self, limit: Option<u64>) -> io::Result<SpoolWriter> {
        fs::create_dir_all(&self.dir).await?;
        let path = SpoolPath {
            path: self.dir.join(format!("{}{}", SPOOL_PREFIX, Uuid::new_v4())),
        };
        let file = File::create(&path.path).await?;
        Ok(SpoolWriter {
            file,
            path,
            size: 0,
            head: BytesMut::with_capacity(SNIFF_LEN),
            limit,
            truncated: false,
        })
    }
}

pub struct SpoolWriter {
    file: File,
    path: SpoolPath,
    size: u64,
    head: BytesMut,
    limit: Option<u64>,
    truncated: bool,
}

impl SpoolWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.size += chunk.len() as u64;
        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
        if self.truncated {
            return Ok(());
        }
        if self.limit.is_some_and(|limit| self.size > limit) {
            debug!(path = %self.path.path.display(), size = self.size, "spool limit reached");
            self.truncated = true;
            return Ok(());
        }
        self.file.write_all(chunk).await
    }

    pub async fn finish(mut self) -> io::Result<FileSource> {
        self.file.flush().await?;
        Ok(FileSource::Spooled(SpooledFile {
            path: self.path,
            size: self.size,
            head: self.head.freeze(),
            truncated: self.truncated,
        }))
    }
}

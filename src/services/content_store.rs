//! Content store: blob bytes keyed by `{bucketId}/{fileId}`.
//!
//! `DiskContentStore` keeps each object at `base_path/{bucketId}/{fileId}`.
//! Writes stream into a temporary file beside the target, are fsynced and
//! then renamed over it, so a failed write leaves the previous object as
//! it was.

use crate::services::storage_service::{StoreError, StoreResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{Stream, StreamExt, stream};
use hmac::{Hmac, Mac};
use md5::Context;
use sha2::Sha256;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    pin::Pin,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

const TMP_PREFIX: &str = ".tmp-";
const MAX_KEY_SEGMENT_LEN: usize = 255;

/// An open content object, possibly restricted to a byte range.
pub struct FileContent {
    pub body: ByteStream,
    /// Bytes that `body` will yield.
    pub content_length: u64,
    /// Size of the whole object.
    pub total_size: u64,
    /// `Content-Range` value when a range was served.
    pub content_range: Option<String>,
}

impl FileContent {
    pub fn is_partial(&self) -> bool {
        self.content_range.is_some()
    }
}

impl std::fmt::Debug for FileContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileContent")
            .field("content_length", &self.content_length)
            .field("total_size", &self.total_size)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Write `body` under `key`, returning the quoted etag of the stored bytes.
    ///
    /// Atomic-or-unchanged: on failure the previous object under `key`, if
    /// any, is left as it was.
    async fn put_file(&self, body: ByteStream, key: &str, content_type: &str)
    -> StoreResult<String>;

    /// Open `key`, honouring a single-range `Range` header value when given.
    async fn get_file(&self, key: &str, range: Option<&str>) -> StoreResult<FileContent>;

    /// Like `get_file`, after checking a signature minted by `create_presigned_url`.
    async fn get_file_with_presigned_url(
        &self,
        key: &str,
        signature: &str,
        range: Option<&str>,
    ) -> StoreResult<FileContent>;

    /// Mint a query-string signature granting read access to `key` for `expiry`.
    async fn create_presigned_url(&self, key: &str, expiry: Duration) -> StoreResult<String>;

    async fn delete_file(&self, key: &str) -> StoreResult<()>;

    /// Every object key in the store.
    async fn list_files(&self) -> StoreResult<Vec<String>>;

    async fn check_health(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Local-disk content store.
#[derive(Clone)]
pub struct DiskContentStore {
    base_path: PathBuf,
    signer: UrlSigner,
}

impl DiskContentStore {
    pub fn new(base_path: impl Into<PathBuf>, signing_key: impl AsRef<[u8]>) -> Self {
        Self {
            base_path: base_path.into(),
            signer: UrlSigner::new(signing_key.as_ref()),
        }
    }

    /// Map `bucket/id` to its on-disk path, rejecting anything that could
    /// escape `base_path`.
    fn object_path(&self, key: &str) -> StoreResult<PathBuf> {
        let (bucket, id) = split_key(key)?;
        let mut path = self.base_path.clone();
        path.push(bucket);
        path.push(id);
        Ok(path)
    }

    async fn open(&self, key: &str, range: Option<&str>) -> StoreResult<FileContent> {
        let path = self.object_path(key)?;
        let mut file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::ObjectNotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        let total_size = file.metadata().await?.len();

        let resolved = match range {
            Some(header) => resolve_range(header, total_size)?,
            None => None,
        };

        match resolved {
            Some((start, end)) => {
                file.seek(SeekFrom::Start(start)).await?;
                let length = end - start + 1;
                Ok(FileContent {
                    body: Box::pin(ReaderStream::new(file.take(length))),
                    content_length: length,
                    total_size,
                    content_range: Some(format!("bytes {}-{}/{}", start, end, total_size)),
                })
            }
            None => Ok(FileContent {
                body: Box::pin(ReaderStream::new(file)),
                content_length: total_size,
                total_size,
                content_range: None,
            }),
        }
    }
}

#[async_trait]
impl ContentStore for DiskContentStore {
    async fn put_file(
        &self,
        mut body: ByteStream,
        key: &str,
        content_type: &str,
    ) -> StoreResult<String> {
        let file_path = self.object_path(key)?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let etag = format!("\"{:x}\"", digest.compute());
        debug!(key, size_bytes, content_type, %etag, "stored content object");
        Ok(etag)
    }

    async fn get_file(&self, key: &str, range: Option<&str>) -> StoreResult<FileContent> {
        self.open(key, range).await
    }

    async fn get_file_with_presigned_url(
        &self,
        key: &str,
        signature: &str,
        range: Option<&str>,
    ) -> StoreResult<FileContent> {
        self.signer.verify(key, signature, Utc::now().timestamp())?;
        self.open(key, range).await
    }

    async fn create_presigned_url(&self, key: &str, expiry: Duration) -> StoreResult<String> {
        split_key(key)?;
        let expires = Utc::now().timestamp() + expiry.as_secs() as i64;
        self.signer.sign(key, expires)
    }

    async fn delete_file(&self, key: &str) -> StoreResult<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed content object {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("content object {} already missing", path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        Ok(())
    }

    async fn list_files(&self) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut buckets = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(err) => return Err(StoreError::Io(err)),
        };

        while let Some(bucket) = buckets.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            let bucket_name = bucket.file_name().to_string_lossy().to_string();
            let mut objects = fs::read_dir(bucket.path()).await?;
            while let Some(object) = objects.next_entry().await? {
                let name = object.file_name().to_string_lossy().to_string();
                if name.starts_with(TMP_PREFIX) || !object.file_type().await?.is_file() {
                    continue;
                }
                keys.push(format!("{}/{}", bucket_name, name));
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Write, read back and delete a probe file under `base_path`.
    async fn check_health(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self
            .base_path
            .join(format!("{}readyz-{}", TMP_PREFIX, Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

/// Split `bucket/id`, rejecting empty, oversized or path-like segments.
pub fn split_key(key: &str) -> StoreResult<(&str, &str)> {
    let invalid = || StoreError::InvalidKey(key.to_string());
    let (bucket, id) = key.split_once('/').ok_or_else(invalid)?;
    for segment in [bucket, id] {
        if segment.is_empty()
            || segment.len() > MAX_KEY_SEGMENT_LEN
            || segment == "."
            || segment == ".."
            || segment.starts_with(TMP_PREFIX)
            || segment
                .bytes()
                .any(|b| b == b'/' || b == b'\\' || b.is_ascii_control())
        {
            return Err(invalid());
        }
    }
    Ok((bucket, id))
}

/// Resolve a `Range` header value against an object of `size` bytes.
///
/// Returns `Ok(None)` for values this store does not handle (other units,
/// multiple ranges, malformed syntax), which callers serve as a full body.
/// Syntactically valid but unsatisfiable ranges are an error.
pub fn resolve_range(header: &str, size: u64) -> StoreResult<Option<(u64, u64)>> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return Ok(None);
    };
    let unsatisfiable = StoreError::InvalidRange { size };

    match (start.trim(), end.trim()) {
        ("", "") => Ok(None),
        ("", suffix) => {
            let Ok(suffix) = suffix.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || size == 0 {
                return Err(unsatisfiable);
            }
            Ok(Some((size.saturating_sub(suffix), size - 1)))
        }
        (start, end) => {
            let Ok(start) = start.parse::<u64>() else {
                return Ok(None);
            };
            let end = if end.is_empty() {
                size.saturating_sub(1)
            } else {
                match end.parse::<u64>() {
                    Ok(end) if end >= start => end.min(size.saturating_sub(1)),
                    Ok(_) => return Ok(None),
                    Err(_) => return Ok(None),
                }
            };
            if start >= size {
                return Err(unsatisfiable);
            }
            Ok(Some((start, end)))
        }
    }
}

/// Wrap an in-memory buffer as a single-chunk stream.
pub fn byte_stream(bytes: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(bytes) }))
}

/// Drain a stream into one buffer.
pub async fn collect_bytes(mut body: ByteStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

type HmacSha256 = Hmac<Sha256>;

/// Signs `X-Expires=<unix>&X-Signature=<hmac>` query strings for content keys.
#[derive(Clone)]
pub struct UrlSigner {
    key: Vec<u8>,
}

impl UrlSigner {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    fn mac(&self, key: &str, expires: i64) -> StoreResult<HmacSha256> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| StoreError::InvalidSignature)?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, key: &str, expires: i64) -> StoreResult<String> {
        let tag = self.mac(key, expires)?.finalize().into_bytes();
        Ok(format!(
            "X-Expires={}&X-Signature={}",
            expires,
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Check a query string produced by [`sign`](Self::sign) at time `now`.
    pub fn verify(&self, key: &str, query: &str, now: i64) -> StoreResult<()> {
        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("X-Expires", value)) => expires = value.parse::<i64>().ok(),
                Some(("X-Signature", value)) => signature = URL_SAFE_NO_PAD.decode(value).ok(),
                _ => {}
            }
        }
        let (Some(expires), Some(signature)) = (expires, signature) else {
            return Err(StoreError::InvalidSignature);
        };

        self.mac(key, expires)?
            .verify_slice(&signature)
            .map_err(|_| StoreError::InvalidSignature)?;
        if expires < now {
            return Err(StoreError::SignatureExpired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, DiskContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskContentStore::new(dir.path(), "test-signing-key");
        (dir, store)
    }

    async fn read_all(content: FileContent) -> Bytes {
        collect_bytes(content.body).await.unwrap()
    }

    #[tokio::test]
    async fn put_get_list_delete() {
        let (_dir, store) = store().await;

        let etag = store
            .put_file(byte_stream(Bytes::from("Hello, World")), "default/f1", "text/plain")
            .await
            .unwrap();
        assert_eq!(etag, format!("\"{:x}\"", md5::compute("Hello, World")));

        let content = store.get_file("default/f1", None).await.unwrap();
        assert_eq!(content.content_length, 12);
        assert!(!content.is_partial());
        assert_eq!(read_all(content).await, Bytes::from("Hello, World"));

        store
            .put_file(byte_stream(Bytes::from("x")), "other/f2", "text/plain")
            .await
            .unwrap();
        assert_eq!(
            store.list_files().await.unwrap(),
            vec!["default/f1".to_string(), "other/f2".to_string()]
        );

        store.delete_file("default/f1").await.unwrap();
        // deleting twice is fine
        store.delete_file("default/f1").await.unwrap();
        assert!(matches!(
            store.get_file("default/f1", None).await,
            Err(StoreError::ObjectNotFound(_))
        ));
        assert_eq!(store.list_files().await.unwrap(), vec!["other/f2".to_string()]);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_object() {
        let (_dir, store) = store().await;
        store
            .put_file(byte_stream(Bytes::from("original")), "default/f1", "text/plain")
            .await
            .unwrap();

        let broken: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from("partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]));
        assert!(store.put_file(broken, "default/f1", "text/plain").await.is_err());

        let content = store.get_file("default/f1", None).await.unwrap();
        assert_eq!(read_all(content).await, Bytes::from("original"));
        assert_eq!(store.list_files().await.unwrap(), vec!["default/f1".to_string()]);
    }

    #[tokio::test]
    async fn serves_byte_ranges() {
        let (_dir, store) = store().await;
        store
            .put_file(byte_stream(Bytes::from("0123456789")), "default/f1", "text/plain")
            .await
            .unwrap();

        let content = store.get_file("default/f1", Some("bytes=2-5")).await.unwrap();
        assert_eq!(content.content_range.as_deref(), Some("bytes 2-5/10"));
        assert_eq!(content.content_length, 4);
        assert_eq!(read_all(content).await, Bytes::from("2345"));

        let content = store.get_file("default/f1", Some("bytes=-3")).await.unwrap();
        assert_eq!(read_all(content).await, Bytes::from("789"));

        assert!(matches!(
            store.get_file("default/f1", Some("bytes=20-")).await,
            Err(StoreError::InvalidRange { size: 10 })
        ));
    }

    #[test]
    fn range_resolution() {
        assert_eq!(resolve_range("bytes=0-0", 10).unwrap(), Some((0, 0)));
        assert_eq!(resolve_range("bytes=5-", 10).unwrap(), Some((5, 9)));
        assert_eq!(resolve_range("bytes=5-100", 10).unwrap(), Some((5, 9)));
        assert_eq!(resolve_range("bytes=-100", 10).unwrap(), Some((0, 9)));
        assert_eq!(resolve_range("bytes=0-1,4-5", 10).unwrap(), None);
        assert_eq!(resolve_range("items=0-1", 10).unwrap(), None);
        assert_eq!(resolve_range("bytes=abc", 10).unwrap(), None);
        assert_eq!(resolve_range("bytes=7-3", 10).unwrap(), None);
        assert!(resolve_range("bytes=10-", 10).is_err());
        assert!(resolve_range("bytes=-0", 10).is_err());
    }

    #[test]
    fn rejects_unsafe_keys() {
        assert!(split_key("default/abc").is_ok());
        for key in ["default", "/abc", "default/", "../abc", "default/..", "a/b/c", "a/.tmp-x"] {
            assert!(split_key(key).is_err(), "{key} should be rejected");
        }
    }

    #[tokio::test]
    async fn presigned_reads_check_signature_and_expiry() {
        let (_dir, store) = store().await;
        store
            .put_file(byte_stream(Bytes::from("secret")), "default/f1", "text/plain")
            .await
            .unwrap();

        let signature = store
            .create_presigned_url("default/f1", Duration::from_secs(60))
            .await
            .unwrap();
        let content = store
            .get_file_with_presigned_url("default/f1", &signature, None)
            .await
            .unwrap();
        assert_eq!(read_all(content).await, Bytes::from("secret"));

        // signature for another key
        assert!(matches!(
            store
                .get_file_with_presigned_url("default/f2", &signature, None)
                .await,
            Err(StoreError::InvalidSignature)
        ));

        let signer = UrlSigner::new(b"test-signing-key");
        let stale = signer.sign("default/f1", 1_000).unwrap();
        assert!(matches!(
            signer.verify("default/f1", &stale, 2_000),
            Err(StoreError::SignatureExpired)
        ));
        assert!(matches!(
            signer.verify("default/f1", "X-Expires=99999999999", 0),
            Err(StoreError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn health_probe_leaves_nothing_behind() {
        let (_dir, store) = store().await;
        store.check_health().await.unwrap();
        assert!(store.list_files().await.unwrap().is_empty());
    }
}

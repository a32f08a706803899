//! In-memory collaborators for service and router tests.
//!
//! Each fake can be told to fail a named operation, right away or after a
//! number of successful calls, which is how the compensation paths get
//! exercised.

use crate::{
    models::{
        bucket::BucketMetadata,
        file::{FileMetadata, FileSummary, FileUpdate},
    },
    services::{
        content_store::{ByteStream, ContentStore, FileContent, byte_stream, collect_bytes, resolve_range},
        image::{ImageOptions, ImageTransformer, TransformedImage},
        metadata_store::{MetadataStore, USER_ID_HEADER},
        scanner::{AntivirusScanner, ScanResult},
        spool::Spooler,
        storage_service::{FileService, StoreError, StoreResult},
        upload::UploadFile,
    },
};
use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Marker the fake scanner treats as infected.
pub const EICAR: &str = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE";

fn injected(op: &str) -> StoreError {
    StoreError::Io(io::Error::other(format!("injected failure in {}", op)))
}

/// Operation name -> successful calls left before it starts failing.
#[derive(Default)]
struct Failures(Mutex<HashMap<String, usize>>);

impl Failures {
    fn set(&self, op: &str, after: usize) {
        self.0.lock().unwrap().insert(op.to_string(), after);
    }

    fn clear(&self, op: &str) {
        self.0.lock().unwrap().remove(op);
    }

    fn check(&self, op: &str) -> StoreResult<()> {
        match self.0.lock().unwrap().get_mut(op) {
            Some(0) => Err(injected(op)),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

pub fn bucket(id: &str, min: i64, max: i64) -> BucketMetadata {
    BucketMetadata {
        id: id.to_string(),
        min_upload_file_size: min,
        max_upload_file_size: max,
        presigned_urls_enabled: true,
        download_expiration: 30,
        cache_control: "max-age=3600".into(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn text(name: &str, content: &str) -> UploadFile {
    UploadFile {
        name: name.to_string(),
        id: None,
        content: Bytes::copy_from_slice(content.as_bytes()).into(),
        metadata: None,
    }
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    buckets: Mutex<BTreeMap<String, BucketMetadata>>,
    files: Mutex<BTreeMap<String, FileMetadata>>,
    /// `x-user-id` values that cannot see any file.
    hidden_from: Mutex<HashSet<String>>,
    failures: Failures,
}

impl InMemoryMetadataStore {
    pub fn insert_bucket(&self, bucket: BucketMetadata) {
        self.buckets.lock().unwrap().insert(bucket.id.clone(), bucket);
    }

    /// A record with `isUploaded = false` and no content behind it.
    pub fn insert_pending_file(&self, id: &str, bucket_id: &str, name: &str) {
        let now = Utc::now();
        self.insert_file(FileMetadata {
            id: id.to_string(),
            name: name.to_string(),
            size: 0,
            bucket_id: bucket_id.to_string(),
            etag: String::new(),
            created_at: now,
            updated_at: now,
            is_uploaded: false,
            mime_type: String::new(),
            uploaded_by_user_id: None,
            metadata: None,
        });
    }

    pub fn insert_file(&self, file: FileMetadata) {
        self.files.lock().unwrap().insert(file.id.clone(), file);
    }

    pub fn file(&self, id: &str) -> Option<FileMetadata> {
        self.files.lock().unwrap().get(id).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn fail(&self, op: &str) {
        self.failures.set(op, 0);
    }

    /// Let `op` succeed `calls` times, then fail.
    pub fn fail_after(&self, op: &str, calls: usize) {
        self.failures.set(op, calls);
    }

    pub fn recover(&self, op: &str) {
        self.failures.clear(op);
    }

    /// Hide every file from requests made as `user_id`, the way a store
    /// with per-caller permissions would.
    pub fn hide_files_from(&self, user_id: &str) {
        self.hidden_from.lock().unwrap().insert(user_id.to_string());
    }

    fn visible_to(&self, headers: &HeaderMap) -> bool {
        match headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
            Some(user) => !self.hidden_from.lock().unwrap().contains(user),
            None => true,
        }
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_bucket_by_id(&self, id: &str, _headers: &HeaderMap) -> StoreResult<BucketMetadata> {
        self.failures.check("get_bucket_by_id")?;
        self.buckets
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::BucketNotFound(id.to_string()))
    }

    async fn get_file_by_id(
        &self,
        id: &str,
        headers: &HeaderMap,
    ) -> StoreResult<(FileMetadata, BucketMetadata)> {
        self.failures.check("get_file_by_id")?;
        let file = self
            .file(id)
            .filter(|_| self.visible_to(headers))
            .ok_or_else(|| StoreError::FileNotFound(id.to_string()))?;
        let bucket = self
            .buckets
            .lock()
            .unwrap()
            .get(&file.bucket_id)
            .cloned()
            .ok_or_else(|| StoreError::BucketNotFound(file.bucket_id.clone()))?;
        Ok((file, bucket))
    }

    async fn initialize_file(
        &self,
        id: &str,
        name: &str,
        size: i64,
        bucket_id: &str,
        mime_type: &str,
        headers: &HeaderMap,
    ) -> StoreResult<()> {
        self.failures.check("initialize_file")?;
        let mut files = self.files.lock().unwrap();
        if files.contains_key(id) {
            return Err(StoreError::FileAlreadyExists(id.to_string()));
        }
        let now = Utc::now();
        files.insert(
            id.to_string(),
            FileMetadata {
                id: id.to_string(),
                name: name.to_string(),
                size,
                bucket_id: bucket_id.to_string(),
                etag: String::new(),
                created_at: now,
                updated_at: now,
                is_uploaded: false,
                mime_type: mime_type.to_string(),
                uploaded_by_user_id: headers
                    .get(USER_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                metadata: None,
            },
        );
        Ok(())
    }

    async fn populate_metadata(
        &self,
        update: &FileUpdate,
        _headers: &HeaderMap,
    ) -> StoreResult<FileMetadata> {
        self.failures.check("populate_metadata")?;
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(&update.id)
            .ok_or_else(|| StoreError::FileNotFound(update.id.clone()))?;
        file.name = update.name.clone();
        file.size = update.size;
        file.bucket_id = update.bucket_id.clone();
        file.etag = update.etag.clone();
        file.is_uploaded = update.is_uploaded;
        file.mime_type = update.mime_type.clone();
        file.metadata = update.metadata.clone();
        file.updated_at = Utc::now();
        Ok(file.clone())
    }

    async fn set_is_uploaded(
        &self,
        id: &str,
        is_uploaded: bool,
        _headers: &HeaderMap,
    ) -> StoreResult<()> {
        self.failures.check("set_is_uploaded")?;
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(id)
            .ok_or_else(|| StoreError::FileNotFound(id.to_string()))?;
        file.is_uploaded = is_uploaded;
        file.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_file_by_id(&self, id: &str, _headers: &HeaderMap) -> StoreResult<()> {
        self.failures.check("delete_file_by_id")?;
        self.files
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::FileNotFound(id.to_string()))
    }

    async fn list_files(&self, _headers: &HeaderMap) -> StoreResult<Vec<FileSummary>> {
        self.failures.check("list_files")?;
        Ok(self
            .files
            .lock()
            .unwrap()
            .values()
            .map(FileSummary::from)
            .collect())
    }

    async fn check_health(&self) -> StoreResult<()> {
        self.failures.check("check_health")
    }
}

#[derive(Default)]
pub struct InMemoryContentStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    presigned: AtomicUsize,
    failures: Failures,
}

impl InMemoryContentStore {
    pub fn insert(&self, key: &str, content: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::copy_from_slice(content.as_bytes()));
    }

    /// Drop an object without going through the store contract.
    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn presigned_count(&self) -> usize {
        self.presigned.load(Ordering::SeqCst)
    }

    pub fn fail(&self, op: &str) {
        self.failures.set(op, 0);
    }

    fn open(&self, key: &str, range: Option<&str>) -> StoreResult<FileContent> {
        let bytes = self
            .object(key)
            .ok_or_else(|| StoreError::ObjectNotFound(key.to_string()))?;
        let total_size = bytes.len() as u64;
        let resolved = match range {
            Some(header) => resolve_range(header, total_size)?,
            None => None,
        };
        Ok(match resolved {
            Some((start, end)) => FileContent {
                body: byte_stream(bytes.slice(start as usize..=end as usize)),
                content_length: end - start + 1,
                total_size,
                content_range: Some(format!("bytes {}-{}/{}", start, end, total_size)),
            },
            None => FileContent {
                body: byte_stream(bytes),
                content_length: total_size,
                total_size,
                content_range: None,
            },
        })
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn put_file(
        &self,
        body: ByteStream,
        key: &str,
        _content_type: &str,
    ) -> StoreResult<String> {
        self.failures.check("put_file")?;
        let bytes = collect_bytes(body).await?;
        let etag = format!("\"{:x}\"", md5::compute(&bytes));
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(etag)
    }

    async fn get_file(&self, key: &str, range: Option<&str>) -> StoreResult<FileContent> {
        self.failures.check("get_file")?;
        self.open(key, range)
    }

    async fn get_file_with_presigned_url(
        &self,
        key: &str,
        signature: &str,
        range: Option<&str>,
    ) -> StoreResult<FileContent> {
        if signature != format!("sig={}", key) {
            return Err(StoreError::InvalidSignature);
        }
        self.open(key, range)
    }

    async fn create_presigned_url(&self, key: &str, _expiry: Duration) -> StoreResult<String> {
        self.failures.check("create_presigned_url")?;
        self.presigned.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sig={}", key))
    }

    async fn delete_file(&self, key: &str) -> StoreResult<()> {
        self.failures.check("delete_file")?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_files(&self) -> StoreResult<Vec<String>> {
        self.failures.check("list_files")?;
        Ok(self.keys())
    }

    async fn check_health(&self) -> StoreResult<()> {
        self.failures.check("check_health")
    }
}

/// Flags any content containing [`EICAR`].
#[derive(Default)]
pub struct FakeScanner {
    scanned: AtomicUsize,
}

impl FakeScanner {
    pub fn scanned(&self) -> usize {
        self.scanned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AntivirusScanner for FakeScanner {
    async fn scan_reader(&self, content: ByteStream) -> StoreResult<ScanResult> {
        self.scanned.fetch_add(1, Ordering::SeqCst);
        let content = collect_bytes(content).await?;
        let marker = EICAR.as_bytes();
        if content.windows(marker.len()).any(|w| w == marker) {
            return Ok(ScanResult::VirusFound("Eicar-Test-Signature".into()));
        }
        Ok(ScanResult::Clean)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Prefixes the content with a description of the options. Empty input
/// is treated as an undecodable image.
pub struct FakeTransformer;

#[async_trait]
impl ImageTransformer for FakeTransformer {
    async fn transform(
        &self,
        content: Bytes,
        _size: u64,
        options: &ImageOptions,
    ) -> StoreResult<TransformedImage> {
        if content.is_empty() {
            return Err(StoreError::Transform("no image data".into()));
        }
        let mut out = format!("w={:?};", options.width).into_bytes();
        out.extend_from_slice(&content);
        let content = Bytes::from(out);
        Ok(TransformedImage {
            etag: format!("\"{:x}\"", md5::compute(&content)),
            size: content.len() as u64,
            content,
        })
    }
}

/// A `FileService` wired to in-memory fakes, with a `default` bucket
/// accepting 0..=100 bytes and a private spool directory.
pub struct Harness {
    pub service: FileService,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub content: Arc<InMemoryContentStore>,
    pub scanner: Arc<FakeScanner>,
    pub spool_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let metadata = Arc::new(InMemoryMetadataStore::default());
        metadata.insert_bucket(bucket("default", 0, 100));
        let content = Arc::new(InMemoryContentStore::default());
        let scanner = Arc::new(FakeScanner::default());
        let service = FileService::new(metadata.clone(), content.clone(), scanner.clone());
        Self {
            service,
            metadata,
            content,
            scanner,
            spool_dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn spooler(&self) -> Spooler {
        Spooler::new(self.spool_dir.path())
    }

    /// Files currently parked in the spool directory.
    pub fn spooled_count(&self) -> usize {
        std::fs::read_dir(self.spool_dir.path()).map_or(0, |entries| entries.count())
    }

    pub fn with_image_transformer(mut self) -> Self {
        self.service = self.service.with_image_transformer(Arc::new(FakeTransformer));
        self
    }

    /// Upload `content` into `default` and return the stored record.
    pub async fn upload(&self, name: &str, content: &str) -> FileMetadata {
        self.service
            .upload_files("default", vec![text(name, content)], &HeaderMap::new())
            .await
            .into_result()
            .unwrap()
            .remove(0)
    }
}

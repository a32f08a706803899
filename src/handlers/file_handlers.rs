//! HTTP handlers for file uploads, reads, replacement and deletion.
//! Reads stream content from the content store and never buffer it,
//! except when an image transformation needs the whole body.

use crate::{
    errors::{ApiError, ApiResult, ErrorBody},
    handlers::AppState,
    models::{bucket::BucketMetadata, file::FileMetadata},
    services::{
        conditional::{Preconditions, Representation},
        content_store::FileContent,
        image::ImageOptions,
        replace::ReplaceFile,
        spool::{FileSource, Spooler},
        storage_service::FileService,
        upload::UploadFile,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, Query, RawQuery, State,
        multipart::Field,
        rejection::QueryRejection,
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tracing::debug;

pub const DEFAULT_BUCKET: &str = "default";

/// Per-file entry of the `metadata[]` multipart parts.
#[derive(Debug, Default, Deserialize)]
pub struct UploadFileMetadata {
    pub id: Option<String>,
    pub name: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub processed_files: Vec<FileMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Query parameters accepted on reads: image options plus `download`.
#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub q: Option<u8>,
    pub b: Option<f32>,
    pub f: Option<String>,
    pub download: Option<bool>,
}

impl ReadQuery {
    fn image_options(&self) -> ImageOptions {
        ImageOptions {
            width: self.w,
            height: self.h,
            quality: self.q,
            blur: self.b,
            format: self.f.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PresignedUrlResponse {
    pub url: String,
    /// Seconds the URL stays valid.
    pub expiration: u64,
}

/// `POST /files`: multipart `bucket-id`, `file[]`, `metadata[]`.
///
/// Parts are spooled to disk as they arrive. When `bucket-id` comes before
/// the files, the bucket is resolved first and nothing past its size limit
/// is stored.
pub async fn upload_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let upload = match parse_upload(&state, &headers, multipart).await {
        Ok(upload) => upload,
        Err(err) => return upload_response(Vec::new(), Some(err)),
    };

    let outcome = match &upload.bucket {
        Some(bucket) => state.service.upload_into(bucket, upload.files, &headers).await,
        None => {
            state
                .service
                .upload_files(&upload.bucket_id, upload.files, &headers)
                .await
        }
    };
    upload_response(outcome.processed, outcome.error)
}

fn upload_response(processed: Vec<FileMetadata>, error: Option<ApiError>) -> Response {
    let status = match &error {
        Some(err) => {
            err.log();
            err.status
        }
        None => StatusCode::CREATED,
    };
    let body = UploadResponse {
        processed_files: processed,
        error: error.map(|err| err.body()),
    };
    (status, Json(body)).into_response()
}

struct ParsedUpload {
    bucket_id: String,
    /// Resolved while parsing when `bucket-id` preceded the files.
    bucket: Option<BucketMetadata>,
    files: Vec<UploadFile>,
}

async fn parse_upload(
    state: &AppState,
    headers: &HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<ParsedUpload> {
    let mut bucket_id = None;
    let mut bucket: Option<BucketMetadata> = None;
    let mut parts: Vec<(String, FileSource)> = Vec::new();
    let mut entries: Vec<UploadFileMetadata> = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "bucket-id" => {
                let id = field.text().await?;
                // a bucket named after files were spooled cannot limit them
                bucket = if parts.is_empty() && !id.is_empty() {
                    Some(state.service.get_bucket(&id, headers).await?)
                } else {
                    None
                };
                bucket_id = Some(id);
            }
            "file[]" | "file" => {
                let limit = bucket
                    .as_ref()
                    .map(|b| b.max_upload_file_size.max(0) as u64);
                parts.push(read_file_part(&state.spooler, field, limit).await?);
            }
            "metadata[]" => {
                let raw = field.text().await?;
                entries.push(parse_metadata_part(&raw)?);
            }
            other => debug!(field = other, "ignoring multipart field"),
        }
    }

    if parts.is_empty() {
        return Err(ApiError::bad_request("no files provided"));
    }
    if !entries.is_empty() && entries.len() != parts.len() {
        return Err(ApiError::bad_request("metadata count does not match file count")
            .with_data("files", parts.len())
            .with_data("metadata", entries.len()));
    }

    let mut entries = entries.into_iter();
    let files = parts
        .into_iter()
        .map(|(filename, content)| {
            let entry = entries.next().unwrap_or_default();
            UploadFile {
                name: entry.name.unwrap_or(filename),
                id: entry.id,
                content,
                metadata: entry.metadata,
            }
        })
        .collect();

    let bucket_id = bucket_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_BUCKET.to_string());
    Ok(ParsedUpload {
        bucket_id,
        bucket,
        files,
    })
}

/// Spool one file part to disk, chunk by chunk.
async fn read_file_part(
    spooler: &Spooler,
    mut field: Field<'_>,
    limit: Option<u64>,
) -> ApiResult<(String, FileSource)> {
    let filename = field.file_name().unwrap_or_default().to_string();
    let spool_err =
        |e: std::io::Error| ApiError::internal(e).extend(format!("problem spooling {}", filename));

    let mut writer = spooler.create(limit).await.map_err(spool_err)?;
    while let Some(chunk) = field.chunk().await? {
        writer.write(&chunk).await.map_err(spool_err)?;
    }
    let content = writer.finish().await.map_err(spool_err)?;
    Ok((filename, content))
}

fn parse_metadata_part<T: DeserializeOwned>(raw: &str) -> ApiResult<T> {
    serde_json::from_str(raw).map_err(|err| {
        ApiError::bad_request("invalid metadata")
            .extend(format!("parsing metadata part: {}", err))
    })
}

/// `GET /files/{id}`
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ReadQuery>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let query = read_query(query)?;
    let (file, bucket) = state.service.get_readable_file(&id, &headers).await?;
    serve_file(&state.service, &file, &bucket, &query, &headers, Access::Direct, true).await
}

/// `HEAD /files/{id}`: same headers as GET, empty body.
pub async fn head_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ReadQuery>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let query = read_query(query)?;
    let (file, bucket) = state.service.get_readable_file(&id, &headers).await?;
    serve_file(&state.service, &file, &bucket, &query, &headers, Access::Direct, false).await
}

/// `PUT /files/{id}`: multipart `file` plus an optional `metadata` JSON part.
pub async fn replace_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<FileMetadata>> {
    let mut part = None;
    let mut entry = UploadFileMetadata::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "file[]" => part = Some(read_file_part(&state.spooler, field, None).await?),
            "metadata" | "metadata[]" => entry = parse_metadata_part(&field.text().await?)?,
            other => debug!(field = other, "ignoring multipart field"),
        }
    }

    let Some((filename, content)) = part else {
        return Err(ApiError::bad_request("no file provided"));
    };
    let name = entry
        .name
        .or_else(|| Some(filename).filter(|n| !n.is_empty()));

    let replaced = state
        .service
        .replace_file(
            &id,
            ReplaceFile {
                name,
                content,
                metadata: entry.metadata,
            },
            &headers,
        )
        .await?;
    Ok(Json(replaced))
}

/// `DELETE /files/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    state.service.delete_file(&id, &headers).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /files/{id}/presignedurl`
pub async fn get_presigned_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<PresignedUrlResponse>> {
    let presigned = state.service.create_presigned_url(&id, &headers).await?;
    Ok(Json(PresignedUrlResponse {
        url: format!(
            "{}/files/{}/presignedurl/contents?{}",
            state.public_url, id, presigned.signature
        ),
        expiration: presigned.expiration,
    }))
}

/// `GET /files/{id}/presignedurl/contents?X-Expires=..&X-Signature=..`
pub async fn get_presigned_contents(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(raw): RawQuery,
    query: Result<Query<ReadQuery>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let query = read_query(query)?;
    let signature = raw.unwrap_or_default();
    // the signature is the only credential; caller identity is not forwarded
    let (file, bucket) = state
        .service
        .get_readable_file(&id, &HeaderMap::new())
        .await?;
    serve_file(
        &state.service,
        &file,
        &bucket,
        &query,
        &headers,
        Access::Presigned(&signature),
        true,
    )
    .await
}

fn read_query(query: Result<Query<ReadQuery>, QueryRejection>) -> ApiResult<ReadQuery> {
    query
        .map(|Query(q)| q)
        .map_err(|err| ApiError::bad_request("invalid query parameters").extend(err.body_text()))
}

#[derive(Clone, Copy)]
enum Access<'a> {
    Direct,
    Presigned(&'a str),
}

async fn serve_file(
    service: &FileService,
    file: &FileMetadata,
    bucket: &BucketMetadata,
    query: &ReadQuery,
    headers: &HeaderMap,
    access: Access<'_>,
    with_body: bool,
) -> ApiResult<Response> {
    let pre = Preconditions::from_headers(headers)?;
    let options = query.image_options();
    let disposition = content_disposition(&file.name, query.download.unwrap_or(false));

    if !options.is_empty() {
        let content = open(service, file, access, None).await?;
        let image = service.transform_image(file, content, &options).await?;
        let mime_type = options
            .output_mime_type()
            .unwrap_or_else(|| file.mime_type.clone());
        let repr = Representation {
            etag: &image.etag,
            updated_at: file.updated_at,
            cache_control: &bucket.cache_control,
            content_type: &mime_type,
            content_length: image.size,
        };
        let status = repr.evaluate(&pre);
        let body = if with_body && status == StatusCode::OK {
            Body::from(image.content)
        } else {
            Body::empty()
        };
        return Ok(build_response(status, repr.headers(status), disposition, body));
    }

    let repr = Representation {
        etag: &file.etag,
        updated_at: file.updated_at,
        cache_control: &bucket.cache_control,
        content_type: &file.mime_type,
        content_length: file.size.max(0) as u64,
    };

    // a presigned read must prove its signature before revealing anything
    let opened = match access {
        Access::Presigned(_) if with_body => Some(open(service, file, access, range(headers)).await?),
        _ => None,
    };

    let status = repr.evaluate(&pre);
    if status != StatusCode::OK || !with_body {
        return Ok(build_response(status, repr.headers(status), disposition, Body::empty()));
    }

    let content = match opened {
        Some(content) => content,
        None => open(service, file, access, range(headers)).await?,
    };
    let (status, mut response_headers) = if content.is_partial() {
        let status = StatusCode::PARTIAL_CONTENT;
        let mut h = repr.headers(status);
        if let Some(value) = content
            .content_range
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            h.insert(header::CONTENT_RANGE, value);
        }
        (status, h)
    } else {
        (StatusCode::OK, repr.headers(StatusCode::OK))
    };
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content.content_length));

    Ok(build_response(
        status,
        response_headers,
        disposition,
        Body::from_stream(content.body),
    ))
}

async fn open(
    service: &FileService,
    file: &FileMetadata,
    access: Access<'_>,
    range: Option<&str>,
) -> ApiResult<FileContent> {
    match access {
        Access::Direct => service.open_content(file, range).await,
        Access::Presigned(signature) => service.open_presigned_content(file, signature, range).await,
    }
}

fn range(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

fn content_disposition(name: &str, download: bool) -> Option<HeaderValue> {
    let kind = if download { "attachment" } else { "inline" };
    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
    HeaderValue::from_str(&format!("{}; filename=\"{}\"", kind, escaped)).ok()
}

fn build_response(
    status: StatusCode,
    headers: HeaderMap,
    disposition: Option<HeaderValue>,
    body: Body,
) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    if matches!(status, StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
        if let Some(value) = disposition {
            response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
        }
    }
    response
}

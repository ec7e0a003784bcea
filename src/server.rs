//! In-process distribution API handler.
//!
//! The router is never bound to a socket; [`crate::InstanceHandle`] drives it
//! one request at a time with `tower::ServiceExt::oneshot`.

use crate::config::Configuration;
use crate::errcode::{CodedError, CodedErrors, ErrorCode};
use crate::error::{RegistryError, Result};
use crate::reference::{valid_repository, valid_tag, Digest};
use crate::storage::{ManifestEntry, Storage, DEFAULT_MANIFEST_TYPE};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use hmac::{Hmac, Mac};
use oci_spec::image::{ImageIndex, ImageManifest};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";
pub const API_VERSION: &str = "registry/2.0";
/// Query parameter carrying the signed upload state.
pub const UPLOAD_STATE_PARAM: &str = "_state";

const BODY_LIMIT: usize = 512 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;
type SharedStorage = Arc<dyn Storage>;
type HandlerResult = std::result::Result<Response, CodedErrors>;

fn strip_leading_slash(s: &str) -> &str {
    s.strip_prefix('/').unwrap_or(s)
}

/// Handler options taken from the resolved configuration.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    secret: String,
    delete_enabled: bool,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl HandlerSettings {
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let mut headers = Vec::with_capacity(config.http.headers.len());
        for (name, values) in &config.http.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RegistryError::parse(format!("http.headers: {name:?}: {e}")))?;
            let value = HeaderValue::from_str(&values.join(", "))
                .map_err(|e| RegistryError::parse(format!("http.headers.{name}: {e}")))?;
            headers.push((header, value));
        }

        Ok(Self {
            secret: config.http.secret.clone(),
            delete_enabled: config.storage.delete_enabled(),
            headers,
        })
    }

    pub fn delete_enabled(&self) -> bool {
        self.delete_enabled
    }
}

#[derive(Clone)]
struct AppState {
    storage: SharedStorage,
    secret: Arc<str>,
    delete_enabled: bool,
}

#[derive(Serialize)]
struct ApiVersion {
    version: String,
}

/// Builds the distribution API router over `storage`.
pub fn router(storage: SharedStorage, settings: HandlerSettings) -> Router {
    let state = AppState {
        storage,
        secret: Arc::from(settings.secret),
        delete_enabled: settings.delete_enabled,
    };

    let mut app = Router::new()
        .route("/v2/", get(api_version))
        .route("/v2/{*path}", any(dispatch))
        .layer(
            tower::ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(BODY_LIMIT))
                .layer(TraceLayer::new_for_http()),
        )
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(API_VERSION_HEADER),
            HeaderValue::from_static(API_VERSION),
        ))
        .with_state(state);

    for (name, value) in settings.headers {
        app = app.layer(SetResponseHeaderLayer::if_not_present(name, value));
    }
    app
}

async fn api_version() -> Json<ApiVersion> {
    Json(ApiVersion {
        version: API_VERSION.to_string(),
    })
}

/// Endpoints below `/v2/`. Repository names may contain `/` and even the
/// endpoint keywords themselves, so a route only matches when the part after
/// its keyword is a single segment.
#[derive(Debug, PartialEq)]
enum Endpoint<'a> {
    Manifest { name: &'a str, reference: &'a str },
    Blob { name: &'a str, digest: &'a str },
    Uploads { name: &'a str },
    Upload { name: &'a str, uuid: &'a str },
}

impl<'a> Endpoint<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let path = path.strip_suffix('/').unwrap_or(path);
        if let Some(name) = path.strip_suffix("/blobs/uploads") {
            return Some(Endpoint::Uploads { name });
        }
        if let Some((name, uuid)) = split_last_segment(path, "/blobs/uploads/") {
            return Some(Endpoint::Upload { name, uuid });
        }
        if let Some((name, digest)) = split_last_segment(path, "/blobs/") {
            return Some(Endpoint::Blob { name, digest });
        }
        if let Some((name, reference)) = split_last_segment(path, "/manifests/") {
            return Some(Endpoint::Manifest { name, reference });
        }
        None
    }

    fn name(&self) -> &'a str {
        match self {
            Endpoint::Manifest { name, .. }
            | Endpoint::Blob { name, .. }
            | Endpoint::Uploads { name }
            | Endpoint::Upload { name, .. } => name,
        }
    }
}

/// Splits `path` at its last `keyword` when a single non-empty segment follows.
fn split_last_segment<'a>(path: &'a str, keyword: &str) -> Option<(&'a str, &'a str)> {
    path.rsplit_once(keyword)
        .filter(|(name, tail)| !name.is_empty() && !tail.is_empty() && !tail.contains('/'))
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = strip_leading_slash(&path);
    let Some(endpoint) = Endpoint::parse(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let name = endpoint.name();
    if !valid_repository(name) {
        return CodedError::new(ErrorCode::NameInvalid, "invalid repository name")
            .with_detail(json!({ "name": name }))
            .into_response();
    }

    let state = &state;
    let result = match (endpoint, method.as_str()) {
        (Endpoint::Manifest { reference, .. }, "GET") => {
            get_manifest(state, name, reference).await
        }
        (Endpoint::Manifest { reference, .. }, "HEAD") => {
            check_manifest(state, name, reference).await
        }
        (Endpoint::Manifest { reference, .. }, "PUT") => {
            put_manifest(state, name, reference, &headers, body).await
        }
        (Endpoint::Manifest { reference, .. }, "DELETE") => {
            delete_manifest(state, name, reference).await
        }
        (Endpoint::Blob { digest, .. }, "GET") => get_blob(state, name, digest).await,
        (Endpoint::Blob { digest, .. }, "HEAD") => check_blob(state, name, digest).await,
        (Endpoint::Blob { digest, .. }, "DELETE") => delete_blob(state, name, digest).await,
        (Endpoint::Uploads { .. }, "POST") => start_upload(state, name).await,
        (Endpoint::Upload { uuid, .. }, "PATCH") => {
            upload_chunk(state, name, uuid, &params, body).await
        }
        (Endpoint::Upload { uuid, .. }, "PUT") => {
            finish_upload(state, name, uuid, &params, body).await
        }
        (Endpoint::Upload { uuid, .. }, "DELETE") => {
            cancel_upload(state, name, uuid, &params).await
        }
        (_, method) => Err(CodedError::new(
            ErrorCode::Unsupported,
            format!("method {method} not supported on this endpoint"),
        )
        .into()),
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

fn storage_error(err: RegistryError) -> CodedError {
    match err {
        RegistryError::UploadNotFound(uuid) => upload_unknown(&uuid),
        err => {
            warn!("Storage error: {}", err);
            CodedError::new(ErrorCode::Unknown, err.to_string())
        }
    }
}

fn upload_unknown(uuid: &str) -> CodedError {
    CodedError::new(ErrorCode::BlobUploadUnknown, "blob upload unknown to registry")
        .with_detail(json!({ "uuid": uuid }))
}

fn parse_digest(digest: &str) -> std::result::Result<Digest, CodedError> {
    digest
        .parse()
        .map_err(|reason: String| CodedError::new(ErrorCode::DigestInvalid, reason))
}

fn upload_mac(
    secret: &str,
    name: &str,
    uuid: &str,
) -> std::result::Result<HmacSha256, CodedError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CodedError::new(ErrorCode::Unknown, e.to_string()))?;
    mac.update(name.as_bytes());
    mac.update(b"/");
    mac.update(uuid.as_bytes());
    Ok(mac)
}

fn upload_location(
    state: &AppState,
    name: &str,
    uuid: &str,
) -> std::result::Result<String, CodedError> {
    let token = hex::encode(upload_mac(&state.secret, name, uuid)?.finalize().into_bytes());
    Ok(format!(
        "/v2/{name}/blobs/uploads/{uuid}?{UPLOAD_STATE_PARAM}={token}"
    ))
}

fn verify_upload(
    state: &AppState,
    name: &str,
    uuid: &str,
    params: &HashMap<String, String>,
) -> std::result::Result<(), CodedError> {
    if Uuid::parse_str(uuid).is_err() {
        return Err(upload_unknown(uuid));
    }

    let invalid = || {
        CodedError::new(ErrorCode::BlobUploadInvalid, "blob upload invalid")
            .with_detail(json!({ "reason": "missing or mismatching upload state" }))
    };
    let token = params
        .get(UPLOAD_STATE_PARAM)
        .and_then(|t| hex::decode(t).ok())
        .ok_or_else(invalid)?;
    upload_mac(&state.secret, name, uuid)?
        .verify_slice(&token)
        .map_err(|_| invalid())
}

fn range(total: u64) -> String {
    format!("0-{}", total.saturating_sub(1))
}

async fn check_blob(state: &AppState, name: &str, digest: &str) -> HandlerResult {
    info!("Checking blob: {}/{}", name, digest);
    let digest = parse_digest(digest)?;

    match state.storage.get_blob(&digest.to_string()).await.map_err(storage_error)? {
        Some(blob) => Ok((
            StatusCode::OK,
            [
                ("Content-Length", blob.len().to_string()),
                ("Content-Type", "application/octet-stream".to_string()),
                ("Docker-Content-Digest", digest.to_string()),
            ],
        )
            .into_response()),
        None => Err(blob_unknown(&digest).into()),
    }
}

async fn get_blob(state: &AppState, name: &str, digest: &str) -> HandlerResult {
    info!("Getting blob: {}/{}", name, digest);
    let digest = parse_digest(digest)?;

    match state.storage.get_blob(&digest.to_string()).await.map_err(storage_error)? {
        Some(blob) => Ok((
            StatusCode::OK,
            [
                ("Content-Type", "application/octet-stream".to_string()),
                ("Docker-Content-Digest", digest.to_string()),
            ],
            blob,
        )
            .into_response()),
        None => Err(blob_unknown(&digest).into()),
    }
}

async fn delete_blob(state: &AppState, name: &str, digest: &str) -> HandlerResult {
    info!("Deleting blob: {}/{}", name, digest);
    ensure_delete_enabled(state)?;
    let digest = parse_digest(digest)?;

    if state.storage.delete_blob(&digest.to_string()).await.map_err(storage_error)? {
        Ok(StatusCode::ACCEPTED.into_response())
    } else {
        Err(blob_unknown(&digest).into())
    }
}

fn blob_unknown(digest: &Digest) -> CodedError {
    CodedError::new(ErrorCode::BlobUnknown, "blob unknown to registry")
        .with_detail(json!({ "digest": digest.to_string() }))
}

fn ensure_delete_enabled(state: &AppState) -> std::result::Result<(), CodedError> {
    if state.delete_enabled {
        Ok(())
    } else {
        Err(CodedError::new(
            ErrorCode::Unsupported,
            "The operation is unsupported.",
        ))
    }
}

async fn start_upload(state: &AppState, name: &str) -> HandlerResult {
    let uuid = Uuid::new_v4().to_string();
    info!("Starting upload: {} ({})", name, uuid);

    state
        .storage
        .create_upload(uuid.clone())
        .await
        .map_err(storage_error)?;

    Ok((
        StatusCode::ACCEPTED,
        [
            ("Location", upload_location(state, name, &uuid)?),
            ("Range", "0-0".to_string()),
            ("Docker-Upload-UUID", uuid),
        ],
    )
        .into_response())
}

async fn upload_chunk(
    state: &AppState,
    name: &str,
    uuid: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> HandlerResult {
    debug!("Uploading chunk: {}/{} ({} bytes)", name, uuid, body.len());
    verify_upload(state, name, uuid, params)?;

    let total = state
        .storage
        .append_upload(uuid, &body)
        .await
        .map_err(storage_error)?;

    Ok((
        StatusCode::ACCEPTED,
        [
            ("Location", upload_location(state, name, uuid)?),
            ("Range", range(total)),
            ("Docker-Upload-UUID", uuid.to_string()),
        ],
    )
        .into_response())
}

async fn finish_upload(
    state: &AppState,
    name: &str,
    uuid: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> HandlerResult {
    debug!("Finishing upload: {}/{}", name, uuid);
    verify_upload(state, name, uuid, params)?;

    let digest = params.get("digest").ok_or_else(|| {
        CodedError::new(ErrorCode::DigestInvalid, "digest parameter is required")
    })?;
    let digest = parse_digest(digest)?;

    let mut data = state
        .storage
        .finish_upload(uuid)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| upload_unknown(uuid))?;
    data.extend_from_slice(&body);

    match digest.verify(&data) {
        Some(true) => {}
        Some(false) => {
            return Err(CodedError::new(
                ErrorCode::DigestInvalid,
                "provided digest did not match uploaded content",
            )
            .with_detail(json!({ "digest": digest.to_string() }))
            .into())
        }
        None => {
            return Err(CodedError::new(
                ErrorCode::DigestInvalid,
                format!("unsupported digest algorithm {}", digest.algorithm()),
            )
            .into())
        }
    }

    let digest = digest.to_string();
    state
        .storage
        .store_blob(digest.clone(), data)
        .await
        .map_err(storage_error)?;

    info!("Stored blob: {}", digest);

    Ok((
        StatusCode::CREATED,
        [
            ("Location", format!("/v2/{name}/blobs/{digest}")),
            ("Content-Length", "0".to_string()),
            ("Docker-Content-Digest", digest),
        ],
    )
        .into_response())
}

async fn cancel_upload(
    state: &AppState,
    name: &str,
    uuid: &str,
    params: &HashMap<String, String>,
) -> HandlerResult {
    debug!("Cancelling upload: {}/{}", name, uuid);
    verify_upload(state, name, uuid, params)?;

    if state.storage.cancel_upload(uuid).await.map_err(storage_error)? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(upload_unknown(uuid).into())
    }
}

fn check_manifest_reference(
    reference: &str,
) -> std::result::Result<Option<Digest>, CodedError> {
    if reference.contains(':') {
        return parse_digest(reference).map(Some);
    }
    if valid_tag(reference) {
        Ok(None)
    } else {
        Err(CodedError::new(ErrorCode::TagInvalid, "manifest tag did not match URI")
            .with_detail(json!({ "tag": reference })))
    }
}

fn manifest_unknown(name: &str, reference: &str) -> CodedError {
    CodedError::new(ErrorCode::ManifestUnknown, "manifest unknown")
        .with_detail(json!({ "name": name, "reference": reference }))
}

fn manifest_invalid(reason: impl ToString) -> CodedError {
    CodedError::new(ErrorCode::ManifestInvalid, "manifest invalid")
        .with_detail(json!({ "reason": reason.to_string() }))
}

fn is_index_type(media_type: &str) -> bool {
    media_type.contains("image.index") || media_type.contains("manifest.list")
}

/// Parses the manifest and returns the digests of the config and layer blobs
/// it points at. Indexes and schema 1 manifests reference no blobs.
fn referenced_blobs(
    content_type: &str,
    body: &[u8],
) -> std::result::Result<Vec<String>, CodedError> {
    let media_type = serde_json::from_slice::<serde_json::Value>(body)
        .map_err(manifest_invalid)?
        .get("mediaType")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(content_type)
        .to_string();

    if is_index_type(&media_type) {
        ImageIndex::from_reader(body).map_err(manifest_invalid)?;
        return Ok(Vec::new());
    }
    if media_type.contains("manifest.v1+") {
        return Ok(Vec::new());
    }

    let manifest = ImageManifest::from_reader(body).map_err(manifest_invalid)?;
    Ok(std::iter::once(manifest.config())
        .chain(manifest.layers())
        .map(|descriptor| descriptor.digest().to_string())
        .collect())
}

async fn put_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> HandlerResult {
    info!("Putting manifest: {}/{}", name, reference);
    let expected = check_manifest_reference(reference)?;

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_MANIFEST_TYPE)
        .to_string();

    let blobs = referenced_blobs(&content_type, &body)?;

    let digest = Digest::sha256_of(&body);
    if let Some(expected) = expected {
        if expected.verify(&body) != Some(true) {
            return Err(CodedError::new(
                ErrorCode::DigestInvalid,
                "provided digest did not match uploaded content",
            )
            .with_detail(json!({ "digest": expected.to_string() }))
            .into());
        }
    }

    let mut missing = Vec::new();
    for blob in blobs {
        if state.storage.get_blob(&blob).await.map_err(storage_error)?.is_none() {
            missing.push(
                CodedError::new(ErrorCode::ManifestBlobUnknown, "blob unknown to registry")
                    .with_detail(json!({ "digest": blob })),
            );
        }
    }
    if !missing.is_empty() {
        return Err(missing.into_iter().collect());
    }

    let entry = ManifestEntry {
        data: body.to_vec(),
        content_type: content_type.clone(),
    };
    let digest = digest.to_string();

    state
        .storage
        .store_manifest(name, reference, entry.clone())
        .await
        .map_err(storage_error)?;
    if reference != digest {
        state
            .storage
            .store_manifest(name, &digest, entry)
            .await
            .map_err(storage_error)?;
    }

    info!(
        "Stored manifest with digest: {} (type: {})",
        digest, content_type
    );

    Ok((
        StatusCode::CREATED,
        [
            ("Location", format!("/v2/{name}/manifests/{digest}")),
            ("Content-Length", "0".to_string()),
            ("Docker-Content-Digest", digest),
        ],
    )
        .into_response())
}

async fn get_manifest(state: &AppState, name: &str, reference: &str) -> HandlerResult {
    info!("Getting manifest: {}/{}", name, reference);
    check_manifest_reference(reference)?;

    let entry = state
        .storage
        .get_manifest(name, reference)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| manifest_unknown(name, reference))?;
    let digest = entry.digest();

    Ok((
        StatusCode::OK,
        [
            ("Content-Type", entry.content_type),
            ("Docker-Content-Digest", digest),
        ],
        entry.data,
    )
        .into_response())
}

async fn check_manifest(state: &AppState, name: &str, reference: &str) -> HandlerResult {
    info!("Checking manifest: {}/{}", name, reference);
    check_manifest_reference(reference)?;

    let entry = state
        .storage
        .get_manifest(name, reference)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| manifest_unknown(name, reference))?;

    Ok((
        StatusCode::OK,
        [
            ("Content-Type", entry.content_type.clone()),
            ("Content-Length", entry.data.len().to_string()),
            ("Docker-Content-Digest", entry.digest()),
        ],
    )
        .into_response())
}

async fn delete_manifest(state: &AppState, name: &str, reference: &str) -> HandlerResult {
    info!("Deleting manifest: {}/{}", name, reference);
    ensure_delete_enabled(state)?;

    let Some(digest) = check_manifest_reference(reference)? else {
        return Err(CodedError::new(
            ErrorCode::Unsupported,
            "manifests can only be deleted by digest",
        )
        .into());
    };

    if state
        .storage
        .delete_manifest(name, &digest.to_string())
        .await
        .map_err(storage_error)?
    {
        Ok(StatusCode::ACCEPTED.into_response())
    } else {
        Err(manifest_unknown(name, reference).into())
    }
}

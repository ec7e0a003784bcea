//! Image references bound to a [`Bridge`] and the source/destination
//! capabilities built on them.
//!
//! Every registry call made here goes through
//! [`InstanceHandle::serve_one_exchange`](crate::InstanceHandle::serve_one_exchange);
//! no connection is ever opened.

use crate::errcode::CodedErrors;
use crate::error::{normalize, RegistryError, Result};
use crate::reference::{Digest, DockerReference};
use crate::transport::{Bridge, ImageTransport};
use axum::body::{to_bytes, Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use oci_spec::image::ImageManifest;
use std::fmt;
use tracing::debug;

/// Manifest media types accepted when pulling and pushing.
pub const MANIFEST_MIME_TYPES: [&str; 5] = [
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
];

/// A repository plus exactly one of tag or digest, bound to one bridge.
#[derive(Clone)]
pub struct ImageReference {
    bridge: Bridge,
    docker: DockerReference,
}

impl fmt::Debug for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageReference")
            .field("transport", &self.bridge.name())
            .field("reference", &self.docker.to_string())
            .finish()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bridge.name(), self.string_within_transport())
    }
}

impl ImageReference {
    pub(crate) fn new(bridge: Bridge, docker: DockerReference) -> Result<Self> {
        if docker.is_name_only() {
            return Err(RegistryError::NameOnlyReference(docker.familiar_string()));
        }
        if docker.tag().is_some() && docker.digest().is_some() {
            return Err(RegistryError::TagAndDigestConflict(docker.familiar_string()));
        }
        Ok(Self { bridge, docker })
    }

    pub fn transport(&self) -> &Bridge {
        &self.bridge
    }

    /// `//` followed by the familiar form; parses back to an equal reference.
    pub fn string_within_transport(&self) -> String {
        format!("//{}", self.docker.familiar_string())
    }

    pub fn docker_reference(&self) -> &DockerReference {
        &self.docker
    }

    /// `name:tag` or `name@digest`, fully expanded.
    pub fn policy_configuration_identity(&self) -> Result<String> {
        match (self.docker.tag(), self.docker.digest()) {
            (Some(tag), None) => Ok(format!("{}:{tag}", self.docker.name())),
            (None, Some(digest)) => Ok(format!("{}@{digest}", self.docker.name())),
            _ => Err(RegistryError::Internal(format!(
                "no policy identity for {}",
                self.docker
            ))),
        }
    }

    /// Namespaces to search when the identity has no explicit policy: the
    /// repository, its parents up to the host, then wildcarded parent domains.
    pub fn policy_configuration_namespaces(&self) -> Vec<String> {
        let mut namespaces = Vec::new();
        let mut name = self.docker.name();
        loop {
            namespaces.push(name.clone());
            match name.rfind('/') {
                Some(slash) => name.truncate(slash),
                None => break,
            }
        }

        if name.starts_with('[') {
            return namespaces;
        }
        let mut host = name.split(':').next().unwrap_or_default();
        while let Some((_, parent)) = host.split_once('.') {
            namespaces.push(format!("*.{parent}"));
            host = parent;
        }
        namespaces
    }

    pub async fn new_image_source(&self) -> Result<ImageSource> {
        self.bridge.ensure_registered()?;
        Ok(ImageSource {
            client: Client::new(self),
            reference: self.clone(),
        })
    }

    pub async fn new_image_destination(&self) -> Result<ImageDestination> {
        self.bridge.ensure_registered()?;
        Ok(ImageDestination {
            client: Client::new(self),
            reference: self.clone(),
        })
    }

    /// Fetches the manifest this reference points at. Image manifests are
    /// parsed; manifest lists, indexes and schema 1 manifests are kept as raw
    /// bytes.
    pub async fn new_image(&self) -> Result<Image> {
        let source = self.new_image_source().await?;
        let (manifest, mime_type) = source.get_manifest(None).await?;
        let parsed = if is_list_type(&mime_type) || mime_type.contains("manifest.v1+") {
            None
        } else {
            let parsed = ImageManifest::from_reader(manifest.as_slice())
                .map_err(|e| RegistryError::Other(Box::new(e)))?;
            Some(parsed)
        };
        Ok(Image {
            source,
            manifest,
            mime_type,
            parsed,
        })
    }

    /// Deletes the manifest this reference points at, by digest.
    pub async fn delete_image(&self) -> Result<()> {
        self.bridge.ensure_registered()?;
        let client = Client::new(self);
        let reference = client.manifest_reference(None);

        let fetched = client
            .send(
                Method::GET,
                &format!("manifests/{reference}"),
                accept_manifests(),
                Vec::new(),
            )
            .await?
            .ensure_status(StatusCode::OK)?;
        let digest = fetched.header("docker-content-digest").ok_or_else(|| {
            RegistryError::Other(
                format!("registry did not return a digest for {}", self.docker).into(),
            )
        })?;

        client
            .send(Method::DELETE, &format!("manifests/{digest}"), Vec::new(), Vec::new())
            .await?
            .ensure_status(StatusCode::ACCEPTED)?;
        Ok(())
    }
}

fn is_list_type(mime_type: &str) -> bool {
    mime_type.contains("image.index") || mime_type.contains("manifest.list")
}

fn accept_manifests() -> Vec<(header::HeaderName, String)> {
    vec![(header::ACCEPT, MANIFEST_MIME_TYPES.join(", "))]
}

/// One completed request/response pair.
struct Exchange {
    method: Method,
    uri: String,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Exchange {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Passes the exchange through when its status is `expected`; otherwise
    /// decodes the error envelope and normalizes it.
    fn ensure_status(self, expected: StatusCode) -> Result<Self> {
        if self.status == expected {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    fn into_error(self) -> RegistryError {
        match serde_json::from_slice::<CodedErrors>(&self.body) {
            Ok(mut errors) if errors.len() == 1 => normalize(Box::new(errors.errors.remove(0))),
            Ok(errors) if !errors.is_empty() => normalize(Box::new(errors)),
            _ => RegistryError::UnexpectedResponse {
                method: self.method.to_string(),
                uri: self.uri,
                status: self.status.as_u16(),
            },
        }
    }
}

/// Issues distribution API requests for one repository.
#[derive(Clone)]
struct Client {
    bridge: Bridge,
    docker: DockerReference,
}

impl Client {
    fn new(reference: &ImageReference) -> Self {
        Self {
            bridge: reference.bridge.clone(),
            docker: reference.docker.clone(),
        }
    }

    fn manifest_reference(&self, instance_digest: Option<&Digest>) -> String {
        match (instance_digest, self.docker.digest(), self.docker.tag()) {
            (Some(digest), _, _) | (None, Some(digest), _) => digest.to_string(),
            (None, None, Some(tag)) => tag.to_string(),
            (None, None, None) => crate::reference::DEFAULT_TAG.to_string(),
        }
    }

    /// Sends a request for `/v2/<repository>/<suffix>`. A suffix starting
    /// with `/` is used as the whole path, as upload locations are.
    async fn send(
        &self,
        method: Method,
        suffix: &str,
        headers: Vec<(header::HeaderName, String)>,
        body: Vec<u8>,
    ) -> Result<Exchange> {
        self.bridge.ensure_registered()?;

        let uri = if suffix.starts_with('/') {
            suffix.to_string()
        } else {
            format!("/v2/{}/{suffix}", self.docker.path())
        };
        debug!(method = %method, uri = %uri, "in-process exchange");

        let mut request = Request::builder().method(method.clone()).uri(&uri);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let request = request
            .body(Body::from(body))
            .map_err(|e| RegistryError::Other(Box::new(e)))?;

        let response = self.bridge.handle().serve_one_exchange(request).await?;
        let (parts, body) = response.into_parts();
        let body = to_bytes(body, usize::MAX)
            .await
            .map_err(|e| RegistryError::Other(Box::new(e)))?;

        Ok(Exchange {
            method,
            uri,
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    async fn has_blob(&self, digest: &Digest) -> Result<Option<u64>> {
        let exchange = self
            .send(Method::HEAD, &format!("blobs/{digest}"), Vec::new(), Vec::new())
            .await?;
        match exchange.status {
            StatusCode::OK => Ok(Some(
                exchange
                    .header("content-length")
                    .and_then(|len| len.parse().ok())
                    .unwrap_or_default(),
            )),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(exchange.into_error()),
        }
    }
}

/// Read side of a reference.
pub struct ImageSource {
    reference: ImageReference,
    client: Client,
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSource")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

impl ImageSource {
    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// Returns the manifest bytes and media type. With `instance_digest`, the
    /// manifest of that instance is fetched instead of the reference's own.
    pub async fn get_manifest(
        &self,
        instance_digest: Option<&Digest>,
    ) -> Result<(Vec<u8>, String)> {
        let reference = self.client.manifest_reference(instance_digest);
        let exchange = self
            .client
            .send(
                Method::GET,
                &format!("manifests/{reference}"),
                accept_manifests(),
                Vec::new(),
            )
            .await?
            .ensure_status(StatusCode::OK)?;

        let mime_type = exchange
            .header("content-type")
            .unwrap_or(crate::storage::DEFAULT_MANIFEST_TYPE)
            .to_string();
        Ok((exchange.body.to_vec(), mime_type))
    }

    pub async fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let exchange = self
            .client
            .send(Method::GET, &format!("blobs/{digest}"), Vec::new(), Vec::new())
            .await?
            .ensure_status(StatusCode::OK)?;
        Ok(exchange.body.to_vec())
    }

    pub async fn has_blob(&self, digest: &Digest) -> Result<bool> {
        Ok(self.client.has_blob(digest).await?.is_some())
    }
}

/// A blob as stored by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: Digest,
    pub size: u64,
}

/// Write side of a reference.
pub struct ImageDestination {
    reference: ImageReference,
    client: Client,
}

impl ImageDestination {
    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn supported_manifest_mime_types(&self) -> Vec<&'static str> {
        MANIFEST_MIME_TYPES.to_vec()
    }

    /// Reports the blob if the repository already has it.
    pub async fn try_reusing_blob(&self, digest: &Digest) -> Result<Option<BlobInfo>> {
        Ok(self.client.has_blob(digest).await?.map(|size| BlobInfo {
            digest: digest.clone(),
            size,
        }))
    }

    /// Uploads `data` in one chunk and commits it under its sha256 digest.
    pub async fn put_blob(&self, data: &[u8]) -> Result<BlobInfo> {
        let digest = Digest::sha256_of(data);

        let started = self
            .client
            .send(Method::POST, "blobs/uploads/", Vec::new(), Vec::new())
            .await?
            .ensure_status(StatusCode::ACCEPTED)?;
        let location = upload_location(&started)?;

        let patched = self
            .client
            .send(
                Method::PATCH,
                &location,
                vec![(header::CONTENT_TYPE, "application/octet-stream".to_string())],
                data.to_vec(),
            )
            .await?
            .ensure_status(StatusCode::ACCEPTED)?;
        let location = upload_location(&patched)?;

        let separator = if location.contains('?') { '&' } else { '?' };
        self.client
            .send(
                Method::PUT,
                &format!("{location}{separator}digest={digest}"),
                Vec::new(),
                Vec::new(),
            )
            .await?
            .ensure_status(StatusCode::CREATED)?;

        Ok(BlobInfo {
            digest,
            size: data.len() as u64,
        })
    }

    /// Stores `manifest` under the reference, or under `instance_digest` when
    /// writing one instance of a manifest list. Returns its digest.
    pub async fn put_manifest(
        &self,
        manifest: &[u8],
        mime_type: &str,
        instance_digest: Option<&Digest>,
    ) -> Result<Digest> {
        let reference = self.client.manifest_reference(instance_digest);
        self.client
            .send(
                Method::PUT,
                &format!("manifests/{reference}"),
                vec![(header::CONTENT_TYPE, mime_type.to_string())],
                manifest.to_vec(),
            )
            .await?
            .ensure_status(StatusCode::CREATED)?;
        Ok(Digest::sha256_of(manifest))
    }
}

fn upload_location(exchange: &Exchange) -> Result<String> {
    exchange
        .header("location")
        .map(str::to_string)
        .ok_or_else(|| RegistryError::UnexpectedResponse {
            method: exchange.method.to_string(),
            uri: exchange.uri.clone(),
            status: exchange.status.as_u16(),
        })
}

/// A pulled manifest together with the source it came from.
pub struct Image {
    source: ImageSource,
    manifest: Vec<u8>,
    mime_type: String,
    parsed: Option<ImageManifest>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("source", &self.source)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

impl Image {
    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn manifest(&self) -> &[u8] {
        &self.manifest
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn manifest_digest(&self) -> Digest {
        Digest::sha256_of(&self.manifest)
    }

    /// The parsed image manifest; `None` unless the manifest is a single image.
    pub fn image_manifest(&self) -> Option<&ImageManifest> {
        self.parsed.as_ref()
    }

    pub fn config_digest(&self) -> Option<Digest> {
        self.parsed.as_ref()?.config().digest().to_string().parse().ok()
    }

    pub fn layer_digests(&self) -> Vec<Digest> {
        self.parsed
            .iter()
            .flat_map(|manifest| manifest.layers())
            .filter_map(|layer| layer.digest().to_string().parse().ok())
            .collect()
    }

    pub async fn config_blob(&self) -> Result<Vec<u8>> {
        let digest = self.config_digest().ok_or_else(|| {
            RegistryError::Other(
                format!(
                    "manifest of {} has no config descriptor",
                    self.source.reference()
                )
                .into(),
            )
        })?;
        self.source.get_blob(&digest).await
    }
}

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use registry_bridge::{
    build, Configuration, DistributionFactory, ErrorKind, InstanceBuilder, InstanceHandle,
    Registry, RegistryError, RegistryFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const EMPTY_DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
const TIMEOUT: Duration = Duration::from_secs(5);

fn filesystem_overlay(dir: &TempDir) -> Vec<String> {
    vec![
        "REGISTRY_STORAGE=filesystem".to_string(),
        format!(
            "REGISTRY_STORAGE_FILESYSTEM_ROOTDIRECTORY={}",
            dir.path().display()
        ),
    ]
}

async fn memory_instance() -> InstanceHandle {
    let config = Configuration::resolve("", ["REGISTRY_STORAGE=inmemory"]).unwrap();
    build(config).await.unwrap()
}

async fn exchange(
    handle: &InstanceHandle,
    method: Method,
    uri: &str,
    body: Vec<u8>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body))
        .unwrap();
    let response = handle.serve_one_exchange(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap();
    (parts.status, parts.headers, body.to_vec())
}

/// Wraps the distribution handler and stalls every call by `delay`.
struct SlowRegistry {
    inner: Arc<dyn Registry>,
    delay: Duration,
}

#[async_trait]
impl Registry for SlowRegistry {
    async fn serve_http(&self, request: Request<Body>) -> Response<Body> {
        tokio::time::sleep(self.delay).await;
        self.inner.serve_http(request).await
    }

    async fn health(&self) -> registry_bridge::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.health().await
    }

    async fn shutdown(&self) -> registry_bridge::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.shutdown().await
    }
}

struct SlowFactory {
    delay: Duration,
}

#[async_trait]
impl RegistryFactory for SlowFactory {
    async fn create(
        &self,
        config: &Configuration,
        storage_type: &str,
        user_agent: &str,
    ) -> registry_bridge::Result<Arc<dyn Registry>> {
        let inner = DistributionFactory::default()
            .create(config, storage_type, user_agent)
            .await?;
        Ok(Arc::new(SlowRegistry {
            inner,
            delay: self.delay,
        }))
    }
}

async fn slow_instance(delay: Duration) -> InstanceHandle {
    let config = Configuration::resolve("", ["REGISTRY_STORAGE=inmemory"]).unwrap();
    InstanceBuilder::new()
        .with_factory(SlowFactory { delay })
        .build(config)
        .await
        .unwrap()
}

fn error_code(body: &[u8]) -> String {
    let json: serde_json::Value = serde_json::from_slice(body).unwrap();
    json["errors"][0]["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_resolve_overlay_over_default_document() {
    let config = Configuration::resolve(
        "",
        [
            "REGISTRY_STORAGE=filesystem",
            "REGISTRY_STORAGE_FILESYSTEM_ROOTDIRECTORY=/tmp/x",
        ],
    )
    .unwrap();

    assert_eq!(config.storage_type(), "filesystem");
    let params = config.storage.parameters().unwrap();
    assert_eq!(params["rootdirectory"], serde_yaml::Value::from("/tmp/x"));
    assert_eq!(config.log.level, "debug");
    assert!(config.loglevel.is_empty());
}

#[tokio::test]
async fn test_resolve_without_storage_fails() {
    let document = "version: 0.1\nlog:\n  level: info\n";
    let err = Configuration::resolve(document, Vec::<String>::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingStorage);

    let config = Configuration::resolve(document, ["REGISTRY_STORAGE=inmemory"]).unwrap();
    assert_eq!(config.storage_type(), "inmemory");
}

#[tokio::test]
async fn test_resolve_leaves_environment_untouched() {
    let before: Vec<(String, String)> = std::env::vars().collect();

    Configuration::resolve("", ["REGISTRY_LOG_LEVEL=warn", "REGISTRY_STORAGE=inmemory"]).unwrap();
    Configuration::resolve("version: 0.1\n", ["REGISTRY_HTTP_SECRET=s"]).unwrap_err();
    Configuration::resolve("[not, a, mapping]", ["REGISTRY_STORAGE=inmemory"]).unwrap_err();

    let after: Vec<(String, String)> = std::env::vars().collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_generated_secrets_differ() {
    let a = Configuration::resolve("", Vec::<String>::new()).unwrap();
    let b = Configuration::resolve("", Vec::<String>::new()).unwrap();

    assert_eq!(a.http.secret.len(), 64);
    assert_ne!(a.http.secret, b.http.secret);

    let fixed = Configuration::resolve("", ["REGISTRY_HTTP_SECRET=fixed"]).unwrap();
    assert_eq!(fixed.http.secret, "fixed");
}

#[tokio::test]
async fn test_filesystem_instance_lifecycle() {
    let dir = TempDir::new().unwrap();
    let config = Configuration::resolve("", filesystem_overlay(&dir)).unwrap();
    let handle = build(config).await.unwrap();

    let (status, headers, body) = exchange(&handle, Method::GET, "/v2/", Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["docker-distribution-api-version"], "registry/2.0");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["version"], "registry/2.0");

    handle.health(TIMEOUT).await.unwrap();
    handle.shutdown(TIMEOUT).await.unwrap();
    handle.shutdown(TIMEOUT).await.unwrap();

    assert!(matches!(
        handle.health(TIMEOUT).await,
        Err(RegistryError::ShutDown)
    ));
    let request = Request::builder().uri("/v2/").body(Body::empty()).unwrap();
    assert!(matches!(
        handle.serve_one_exchange(request).await,
        Err(RegistryError::ShutDown)
    ));
}

#[tokio::test]
async fn test_user_agent_is_exposed_without_touching_config() {
    let handle = memory_instance().await;

    assert!(handle.user_agent().starts_with("registry-bridge/"));
    assert!(handle.user_agent().contains(" rustc/"));
    assert!(handle.user_agent().contains(std::env::consts::OS));
    let params = handle.config().storage.parameters().unwrap();
    assert!(!params.contains_key("useragent"));
    assert_eq!(handle.storage_type(), "inmemory");
}

#[tokio::test]
async fn test_unknown_and_unavailable_backends() {
    let config = Configuration::resolve("", ["REGISTRY_STORAGE=bogus"]).unwrap();
    let err = build(config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownBackend);

    let config = Configuration::resolve("", ["REGISTRY_STORAGE=s3"]).unwrap();
    let err = build(config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
}

#[tokio::test]
async fn test_unsupported_log_formatter() {
    let config = Configuration::resolve(
        "",
        ["REGISTRY_STORAGE=inmemory", "REGISTRY_LOG_FORMATTER=xml"],
    )
    .unwrap();
    let err = build(config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
}

#[tokio::test]
async fn test_blob_operations() {
    let handle = memory_instance().await;

    let (status, _, _) = exchange(
        &handle,
        Method::HEAD,
        &format!("/v2/test/blobs/{EMPTY_DIGEST}"),
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) =
        exchange(&handle, Method::GET, "/v2/test/blobs/sha256:abc", Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "DIGEST_INVALID");

    let (status, _, body) =
        exchange(&handle, Method::GET, "/v2/Bad_Name/manifests/latest", Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "NAME_INVALID");
}

#[tokio::test]
async fn test_upload_requires_signed_state() {
    let handle = memory_instance().await;

    let (status, headers, _) =
        exchange(&handle, Method::POST, "/v2/a/b/blobs/uploads/", Vec::new()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let location = headers["location"].to_str().unwrap().to_string();
    assert!(location.contains("_state="));
    let bare = location.split_once('?').unwrap().0.to_string();

    let (status, _, body) = exchange(&handle, Method::PATCH, &bare, b"data".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "BLOB_UPLOAD_INVALID");

    let (status, headers, _) =
        exchange(&handle, Method::PATCH, &location, b"data".to_vec()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(headers["range"], "0-3");

    let (status, _, body) = exchange(
        &handle,
        Method::PUT,
        &format!("{location}&digest={EMPTY_DIGEST}"),
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "DIGEST_INVALID");
}

#[tokio::test]
async fn test_manifest_upload() {
    let handle = memory_instance().await;

    let (status, headers, _) =
        exchange(&handle, Method::POST, "/v2/test/blobs/uploads/", Vec::new()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let location = headers["location"].to_str().unwrap().to_string();
    let (status, _, _) = exchange(
        &handle,
        Method::PUT,
        &format!("{location}&digest={EMPTY_DIGEST}"),
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let manifest = format!(
        r#"{{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {{
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 0,
            "digest": "{EMPTY_DIGEST}"
        }},
        "layers": []
    }}"#
    );

    let (status, headers, _) = exchange(
        &handle,
        Method::PUT,
        "/v2/test/manifests/latest",
        manifest.clone().into_bytes(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let digest = headers["docker-content-digest"].to_str().unwrap().to_string();

    for reference in ["latest", digest.as_str()] {
        let (status, _, body) = exchange(
            &handle,
            Method::GET,
            &format!("/v2/test/manifests/{reference}"),
            Vec::new(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, manifest.as_bytes());
    }

    let (status, _, body) = exchange(
        &handle,
        Method::DELETE,
        &format!("/v2/test/manifests/{digest}"),
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(&body), "UNSUPPORTED");
}

#[tokio::test(start_paused = true)]
async fn test_health_and_shutdown_honor_deadline() {
    let handle = slow_instance(Duration::from_secs(30)).await;
    let deadline = Duration::from_millis(50);

    let err = handle.health(deadline).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    let err = handle.shutdown(deadline).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    assert!(handle.is_shut_down());
    handle.shutdown(deadline).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_lets_in_flight_exchanges_finish() {
    let handle = Arc::new(slow_instance(Duration::from_millis(200)).await);

    let in_flight: Vec<_> = (0..4)
        .map(|_| {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let request = Request::builder().uri("/v2/").body(Body::empty()).unwrap();
                handle.serve_one_exchange(request).await
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.shutdown(TIMEOUT).await.unwrap();

    for task in in_flight {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let request = Request::builder().uri("/v2/").body(Body::empty()).unwrap();
    assert!(matches!(
        handle.serve_one_exchange(request).await,
        Err(RegistryError::ShutDown)
    ));
}

#[tokio::test]
async fn test_custom_registry_factory_serves_exchanges() {
    let handle = slow_instance(Duration::ZERO).await;

    let (status, headers, _) = exchange(&handle, Method::GET, "/v2/", Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["docker-distribution-api-version"], "registry/2.0");

    handle.health(TIMEOUT).await.unwrap();
    handle.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_repository_named_like_an_endpoint() {
    let handle = memory_instance().await;

    let (status, _, body) = exchange(
        &handle,
        Method::GET,
        "/v2/team/blobs/app/manifests/v1",
        Vec::new(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "MANIFEST_UNKNOWN");
}

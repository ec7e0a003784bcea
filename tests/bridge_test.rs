use registry_bridge::{
    is_code, Bridge, Digest, ErrorKind, ImageTransport, RegistryError, TransportRegistry,
};
use std::collections::HashSet;
use std::time::Duration;

const HEX: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
const MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

async fn memory_bridge(transports: &TransportRegistry) -> Bridge {
    Bridge::from_config(
        "",
        ["REGISTRY_STORAGE=inmemory", "REGISTRY_STORAGE_DELETE_ENABLED=true"],
        transports,
    )
    .await
    .unwrap()
}

fn manifest(config: &Digest, layers: &[&Digest]) -> Vec<u8> {
    let layers: Vec<serde_json::Value> = layers
        .iter()
        .map(|digest| {
            serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "size": 0,
                "digest": digest.to_string(),
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_TYPE,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": 0,
            "digest": config.to_string(),
        },
        "layers": layers,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_parse_reference() {
    let transports = TransportRegistry::new();
    let bridge = memory_bridge(&transports).await;

    let reference = bridge.parse_reference("//repo").unwrap();
    assert_eq!(reference.docker_reference().tag(), Some("latest"));
    assert_eq!(reference.string_within_transport(), "//repo:latest");

    let reference = bridge.parse_reference("//repo:v1").unwrap();
    assert_eq!(reference.docker_reference().tag(), Some("v1"));
    assert_eq!(
        reference.to_string(),
        format!("{}://repo:v1", bridge.name())
    );

    let err = bridge.parse_reference("repo:v1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedReference);

    let err = bridge
        .parse_reference(&format!("//repo:v1@sha256:{HEX}"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TagAndDigestConflict);

    let reference = bridge
        .parse_reference(&format!("//quay.io/org/app@sha256:{HEX}"))
        .unwrap();
    assert_eq!(reference.docker_reference().tag(), None);

    bridge.handle().shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_policy_configuration() {
    let transports = TransportRegistry::new();
    let bridge = memory_bridge(&transports).await;

    let reference = bridge.parse_reference("//busybox").unwrap();
    assert_eq!(
        reference.policy_configuration_identity().unwrap(),
        "docker.io/library/busybox:latest"
    );
    assert_eq!(
        reference.policy_configuration_namespaces(),
        vec![
            "docker.io/library/busybox",
            "docker.io/library",
            "docker.io",
            "*.io",
        ]
    );

    let reference = bridge
        .parse_reference("//registry.example.com:5000/team/app:1.0")
        .unwrap();
    assert_eq!(
        reference.policy_configuration_namespaces(),
        vec![
            "registry.example.com:5000/team/app",
            "registry.example.com:5000/team",
            "registry.example.com:5000",
            "*.example.com",
            "*.com",
        ]
    );

    assert!(bridge.validate_policy_configuration_scope("anything at all").is_ok());
}

#[tokio::test]
async fn test_transport_names_are_unique() {
    let transports = TransportRegistry::new();
    let first = memory_bridge(&transports).await;
    let second = memory_bridge(&transports).await;

    assert_ne!(first.name(), second.name());
    assert!(first.name().starts_with("inproc-inmemory-"));
    assert_eq!(transports.len(), 2);
    assert_eq!(
        transports.lookup(first.name()).unwrap().name(),
        first.name()
    );

    let reference = transports
        .parse_image_name(&format!("{}://busybox:1", second.name()))
        .unwrap();
    assert_eq!(reference.transport().name(), second.name());
}

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let transports = TransportRegistry::new();
    let bridge = memory_bridge(&transports).await;
    let reference = bridge.parse_reference("//app:v1").unwrap();

    bridge.deregister();
    bridge.deregister();

    assert!(!bridge.is_registered());
    assert!(transports.lookup(bridge.name()).is_none());
    assert!(transports.is_empty());

    let err = reference.new_image_source().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deregistered);
}

#[tokio::test]
async fn test_push_and_pull() {
    let transports = TransportRegistry::new();
    let bridge = memory_bridge(&transports).await;
    let reference = bridge.parse_reference("//team/app:v1").unwrap();

    let destination = reference.new_image_destination().await.unwrap();
    assert!(destination
        .supported_manifest_mime_types()
        .contains(&MANIFEST_TYPE));

    let config = destination.put_blob(br#"{"architecture":"amd64"}"#).await.unwrap();
    let layer = destination.put_blob(b"layer contents").await.unwrap();
    assert_eq!(layer.size, 14);

    let reused = destination.try_reusing_blob(&layer.digest).await.unwrap();
    assert_eq!(reused, Some(layer.clone()));
    let unknown = Digest::sha256_of(b"never uploaded");
    assert_eq!(destination.try_reusing_blob(&unknown).await.unwrap(), None);

    let body = manifest(&config.digest, &[&layer.digest]);
    let digest = destination
        .put_manifest(&body, MANIFEST_TYPE, None)
        .await
        .unwrap();

    let image = reference.new_image().await.unwrap();
    assert_eq!(image.manifest(), body.as_slice());
    assert_eq!(image.mime_type(), MANIFEST_TYPE);
    assert_eq!(image.manifest_digest(), digest);
    assert_eq!(image.layer_digests(), vec![layer.digest.clone()]);
    assert_eq!(image.config_blob().await.unwrap(), br#"{"architecture":"amd64"}"#);

    let source = reference.new_image_source().await.unwrap();
    assert!(source.has_blob(&layer.digest).await.unwrap());
    assert_eq!(source.get_blob(&layer.digest).await.unwrap(), b"layer contents");
    let (by_digest, _) = source.get_manifest(Some(&digest)).await.unwrap();
    assert_eq!(by_digest, body);
}

#[tokio::test]
async fn test_registry_errors_are_normalized() {
    let transports = TransportRegistry::new();
    let bridge = memory_bridge(&transports).await;
    let reference = bridge.parse_reference("//app:missing").unwrap();

    let source = reference.new_image_source().await.unwrap();
    let err = source.get_manifest(None).await.unwrap_err();
    assert!(is_code(&err, "MANIFEST_UNKNOWN"), "{err}");

    let destination = reference.new_image_destination().await.unwrap();
    let config = Digest::sha256_of(b"config");
    let layer = Digest::sha256_of(b"layer");
    let err = destination
        .put_manifest(&manifest(&config, &[&layer]), MANIFEST_TYPE, None)
        .await
        .unwrap_err();

    let RegistryError::Aggregate(aggregate) = &err else {
        panic!("expected aggregate error, got {err:?}");
    };
    assert_eq!(aggregate.len(), 2);
    assert!(aggregate
        .members
        .iter()
        .all(|member| is_code(member, "MANIFEST_BLOB_UNKNOWN")));
    assert!(err.to_string().contains("blob unknown to registry"));
}

#[tokio::test]
async fn test_delete_image() {
    let transports = TransportRegistry::new();
    let bridge = memory_bridge(&transports).await;
    let reference = bridge.parse_reference("//app:v1").unwrap();

    let destination = reference.new_image_destination().await.unwrap();
    let config = destination.put_blob(b"{}").await.unwrap();
    destination
        .put_manifest(&manifest(&config.digest, &[]), MANIFEST_TYPE, None)
        .await
        .unwrap();

    reference.delete_image().await.unwrap();

    let err = reference.new_image().await.unwrap_err();
    assert!(is_code(&err, "MANIFEST_UNKNOWN"), "{err}");

    let err = reference.delete_image().await.unwrap_err();
    assert!(is_code(&err, "MANIFEST_UNKNOWN"), "{err}");
}

#[tokio::test]
async fn test_delete_requires_configuration() {
    let transports = TransportRegistry::new();
    let bridge = Bridge::from_config("", ["REGISTRY_STORAGE=inmemory"], &transports)
        .await
        .unwrap();
    let reference = bridge.parse_reference("//app:v1").unwrap();

    let destination = reference.new_image_destination().await.unwrap();
    let config = destination.put_blob(b"{}").await.unwrap();
    destination
        .put_manifest(&manifest(&config.digest, &[]), MANIFEST_TYPE, None)
        .await
        .unwrap();

    let err = reference.delete_image().await.unwrap_err();
    assert!(is_code(&err, "UNSUPPORTED"), "{err}");
}

#[tokio::test]
async fn test_repository_path_with_endpoint_keywords() {
    let transports = TransportRegistry::new();
    let bridge = memory_bridge(&transports).await;

    for name in ["//team/blobs/app:v1", "//team/manifests/app:v1", "//a/blobs/uploads:v1"] {
        let reference = bridge.parse_reference(name).unwrap();

        let err = reference
            .new_image_source()
            .await
            .unwrap()
            .get_manifest(None)
            .await
            .unwrap_err();
        assert!(is_code(&err, "MANIFEST_UNKNOWN"), "{name}: {err}");

        let destination = reference.new_image_destination().await.unwrap();
        let config = destination.put_blob(b"{}").await.unwrap();
        let body = manifest(&config.digest, &[]);
        destination.put_manifest(&body, MANIFEST_TYPE, None).await.unwrap();

        let image = reference.new_image().await.unwrap();
        assert_eq!(image.manifest(), body.as_slice(), "{name}");
        assert_eq!(image.config_blob().await.unwrap(), b"{}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_and_deregister() {
    let transports = TransportRegistry::new();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let transports = transports.clone();
            tokio::spawn(async move {
                let bridge = memory_bridge(&transports).await;
                if i % 2 == 0 {
                    bridge.deregister();
                    bridge.deregister();
                }
                bridge
            })
        })
        .collect();

    let mut bridges = Vec::new();
    for task in tasks {
        bridges.push(task.await.unwrap());
    }

    let names: HashSet<&str> = bridges.iter().map(|bridge| bridge.name()).collect();
    assert_eq!(names.len(), 16);
    assert_eq!(transports.len(), 8);

    for (i, bridge) in bridges.iter().enumerate() {
        let live = i % 2 == 1;
        assert_eq!(bridge.is_registered(), live, "{}", bridge.name());
        assert_eq!(transports.lookup(bridge.name()).is_some(), live);
    }
}

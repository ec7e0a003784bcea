use crate::config::Parameters;
use crate::error::{RegistryError, Result};
use async_trait::async_trait;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Back-end names a configuration may select.
pub const KNOWN_BACKENDS: [&str; 7] = [
    "filesystem",
    "inmemory",
    "s3",
    "azure",
    "gcs",
    "swift",
    "oss",
];

/// Root directory of the filesystem driver when none is configured.
pub const DEFAULT_ROOT_DIRECTORY: &str = "/var/lib/registry";

pub const DEFAULT_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// User agent handed to storage drivers for their outbound requests:
/// crate version, the rustc that built it, then OS and architecture.
pub fn user_agent() -> String {
    format!(
        "{}/{} rustc/{} ({}/{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("REGISTRY_BRIDGE_RUSTC_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// `sha256:<hex>` digest of `data`.
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[derive(Clone, Debug, PartialEq)]
pub struct ManifestEntry {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl ManifestEntry {
    pub fn digest(&self) -> String {
        digest_of(&self.data)
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn store_manifest(&self, name: &str, reference: &str, entry: ManifestEntry) -> Result<()>;
    async fn get_manifest(&self, name: &str, reference: &str) -> Result<Option<ManifestEntry>>;
    /// Removes the manifest stored under `digest` and every tag of `name`
    /// pointing at it. Returns whether anything was removed.
    async fn delete_manifest(&self, name: &str, digest: &str) -> Result<bool>;
    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()>;
    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_blob(&self, digest: &str) -> Result<bool>;
    async fn create_upload(&self, uuid: String) -> Result<()>;
    /// Appends to an upload and returns its new total size.
    async fn append_upload(&self, uuid: &str, data: &[u8]) -> Result<u64>;
    async fn finish_upload(&self, uuid: &str) -> Result<Option<Vec<u8>>>;
    async fn cancel_upload(&self, uuid: &str) -> Result<bool>;

    async fn health(&self) -> Result<()> {
        Ok(())
    }

    /// Releases driver resources. Called once, on instance shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    manifests: Arc<RwLock<HashMap<(String, String), ManifestEntry>>>,
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    uploads: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_manifest(
        &self,
        name: &str,
        reference: &str,
        entry: ManifestEntry,
    ) -> Result<()> {
        self.manifests
            .write()
            .await
            .insert((name.to_string(), reference.to_string()), entry);
        Ok(())
    }

    async fn get_manifest(&self, name: &str, reference: &str) -> Result<Option<ManifestEntry>> {
        Ok(self
            .manifests
            .read()
            .await
            .get(&(name.to_string(), reference.to_string()))
            .cloned())
    }

    async fn delete_manifest(&self, name: &str, digest: &str) -> Result<bool> {
        let mut manifests = self.manifests.write().await;
        let before = manifests.len();
        manifests.retain(|(repo, reference), entry| {
            !(repo == name && (reference == digest || entry.digest() == digest))
        });
        Ok(manifests.len() != before)
    }

    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(digest, data);
        Ok(())
    }

    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(digest).cloned())
    }

    async fn delete_blob(&self, digest: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(digest).is_some())
    }

    async fn create_upload(&self, uuid: String) -> Result<()> {
        self.uploads.write().await.insert(uuid, Vec::new());
        Ok(())
    }

    async fn append_upload(&self, uuid: &str, data: &[u8]) -> Result<u64> {
        if let Some(upload) = self.uploads.write().await.get_mut(uuid) {
            upload.extend_from_slice(data);
            Ok(upload.len() as u64)
        } else {
            Err(RegistryError::UploadNotFound(uuid.to_string()))
        }
    }

    async fn finish_upload(&self, uuid: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.uploads.write().await.remove(uuid))
    }

    async fn cancel_upload(&self, uuid: &str) -> Result<bool> {
        Ok(self.uploads.write().await.remove(uuid).is_some())
    }

    async fn close(&self) -> Result<()> {
        self.uploads.write().await.clear();
        Ok(())
    }
}

/// Filesystem driver. Layout under the root directory:
/// `blobs/<digest>`, `uploads/<uuid>` and
/// `repositories/<name>/_manifests/<reference>.{json,meta}`.
pub struct DiskStorage {
    base_path: PathBuf,
}

impl DiskStorage {
    pub async fn new(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(path.join("repositories")).await?;
        fs::create_dir_all(path.join("blobs")).await?;
        fs::create_dir_all(path.join("uploads")).await?;

        Ok(Self { base_path: path })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.base_path
    }

    fn manifest_dir(&self, name: &str) -> PathBuf {
        self.base_path
            .join("repositories")
            .join(name)
            .join("_manifests")
    }

    fn manifest_path(&self, name: &str, reference: &str) -> PathBuf {
        // Tags never contain '@', digests never contain it either.
        self.manifest_dir(name)
            .join(format!("{}.json", reference.replace(':', "@")))
    }

    fn manifest_meta_path(&self, name: &str, reference: &str) -> PathBuf {
        self.manifest_path(name, reference).with_extension("meta")
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let safe_digest = digest.replace(['/', ':'], "_");
        self.base_path.join("blobs").join(safe_digest)
    }

    fn upload_path(&self, uuid: &str) -> PathBuf {
        self.base_path.join("uploads").join(uuid)
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn store_manifest(
        &self,
        name: &str,
        reference: &str,
        entry: ManifestEntry,
    ) -> Result<()> {
        fs::create_dir_all(self.manifest_dir(name)).await?;
        fs::write(self.manifest_path(name, reference), &entry.data).await?;
        fs::write(self.manifest_meta_path(name, reference), &entry.content_type).await?;
        Ok(())
    }

    async fn get_manifest(&self, name: &str, reference: &str) -> Result<Option<ManifestEntry>> {
        let manifest_path = self.manifest_path(name, reference);

        if !manifest_path.exists() {
            return Ok(None);
        }

        let data = fs::read(&manifest_path).await?;
        let content_type = fs::read_to_string(self.manifest_meta_path(name, reference))
            .await
            .unwrap_or_else(|_| DEFAULT_MANIFEST_TYPE.to_string());

        Ok(Some(ManifestEntry { data, content_type }))
    }

    async fn delete_manifest(&self, name: &str, digest: &str) -> Result<bool> {
        let dir = self.manifest_dir(name);
        if !dir.exists() {
            return Ok(false);
        }

        let mut removed = false;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read(&path).await?;
            if digest_of(&data) == digest {
                remove_if_exists(&path).await?;
                remove_if_exists(&path.with_extension("meta")).await?;
                removed = true;
            }
        }
        Ok(removed)
    }

    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()> {
        fs::write(self.blob_path(&digest), &data).await?;
        Ok(())
    }

    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        let blob_path = self.blob_path(digest);

        if !blob_path.exists() {
            return Ok(None);
        }

        Ok(Some(fs::read(&blob_path).await?))
    }

    async fn delete_blob(&self, digest: &str) -> Result<bool> {
        remove_if_exists(&self.blob_path(digest)).await
    }

    async fn create_upload(&self, uuid: String) -> Result<()> {
        fs::write(self.upload_path(&uuid), &[]).await?;
        Ok(())
    }

    async fn append_upload(&self, uuid: &str, data: &[u8]) -> Result<u64> {
        let upload_path = self.upload_path(uuid);

        if !upload_path.exists() {
            return Err(RegistryError::UploadNotFound(uuid.to_string()));
        }

        let mut file = fs::OpenOptions::new().append(true).open(&upload_path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(fs::metadata(&upload_path).await?.len())
    }

    async fn finish_upload(&self, uuid: &str) -> Result<Option<Vec<u8>>> {
        let upload_path = self.upload_path(uuid);

        if !upload_path.exists() {
            return Ok(None);
        }

        let data = fs::read(&upload_path).await?;
        fs::remove_file(&upload_path).await?;

        Ok(Some(data))
    }

    async fn cancel_upload(&self, uuid: &str) -> Result<bool> {
        remove_if_exists(&self.upload_path(uuid)).await
    }

    async fn health(&self) -> Result<()> {
        let metadata = fs::metadata(&self.base_path).await?;
        if !metadata.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", self.base_path.display()),
            )
            .into());
        }
        Ok(())
    }
}

/// Constructs a storage back-end from its configuration parameters.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn create(&self, parameters: &Parameters) -> Result<Arc<dyn Storage>>;
}

/// The `filesystem` driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemDriver;

#[async_trait]
impl StorageDriver for FilesystemDriver {
    async fn create(&self, parameters: &Parameters) -> Result<Arc<dyn Storage>> {
        let root = match parameters.get("rootdirectory") {
            None | Some(Value::Null) => PathBuf::from(DEFAULT_ROOT_DIRECTORY),
            Some(Value::String(path)) if !path.is_empty() => PathBuf::from(path),
            Some(other) => {
                return Err(RegistryError::parse(format!(
                    "filesystem rootdirectory must be a non-empty string, found {other:?}"
                )))
            }
        };
        Ok(Arc::new(DiskStorage::new(root).await?))
    }
}

/// The `inmemory` driver. Contents vanish with the instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryDriver;

#[async_trait]
impl StorageDriver for InMemoryDriver {
    async fn create(&self, _parameters: &Parameters) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(MemoryStorage::new()))
    }
}

/// Table of storage drivers by back-end name.
///
/// The default table knows `filesystem` and `inmemory`. Drivers for the
/// remaining [`KNOWN_BACKENDS`] are supplied by the host through
/// [`DriverFactory::register`].
#[derive(Clone)]
pub struct DriverFactory {
    drivers: HashMap<String, Arc<dyn StorageDriver>>,
}

impl Default for DriverFactory {
    fn default() -> Self {
        Self::empty()
            .with_driver("filesystem", FilesystemDriver)
            .with_driver("inmemory", InMemoryDriver)
    }
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("DriverFactory").field("drivers", &names).finish()
    }
}

impl DriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with no drivers at all.
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, driver: impl StorageDriver + 'static) {
        self.drivers.insert(name.into(), Arc::new(driver));
    }

    pub fn with_driver(
        mut self,
        name: impl Into<String>,
        driver: impl StorageDriver + 'static,
    ) -> Self {
        self.register(name, driver);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    pub async fn create(&self, name: &str, parameters: &Parameters) -> Result<Arc<dyn Storage>> {
        match self.drivers.get(name) {
            Some(driver) => driver.create(parameters).await,
            None if KNOWN_BACKENDS.contains(&name) => {
                Err(RegistryError::BackendUnavailable(name.to_string()))
            }
            None => Err(RegistryError::UnknownBackend(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(data: &str) -> ManifestEntry {
        ManifestEntry {
            data: data.as_bytes().to_vec(),
            content_type: DEFAULT_MANIFEST_TYPE.to_string(),
        }
    }

    async fn exercise(storage: &dyn Storage) {
        let manifest = entry("{}");
        let digest = manifest.digest();
        storage
            .store_manifest("library/app", "v1", manifest.clone())
            .await
            .unwrap();
        storage
            .store_manifest("library/app", &digest, manifest.clone())
            .await
            .unwrap();
        storage
            .store_manifest("other", "v1", manifest.clone())
            .await
            .unwrap();

        assert_eq!(
            storage.get_manifest("library/app", "v1").await.unwrap(),
            Some(manifest.clone())
        );
        assert!(storage.delete_manifest("library/app", &digest).await.unwrap());
        assert!(storage.get_manifest("library/app", "v1").await.unwrap().is_none());
        assert!(storage.get_manifest("library/app", &digest).await.unwrap().is_none());
        assert!(storage.get_manifest("other", "v1").await.unwrap().is_some());
        assert!(!storage.delete_manifest("library/app", &digest).await.unwrap());

        storage.create_upload("u1".into()).await.unwrap();
        assert_eq!(storage.append_upload("u1", b"ab").await.unwrap(), 2);
        assert_eq!(storage.append_upload("u1", b"cd").await.unwrap(), 4);
        assert_eq!(
            storage.finish_upload("u1").await.unwrap(),
            Some(b"abcd".to_vec())
        );
        assert!(matches!(
            storage.append_upload("u1", b"x").await,
            Err(RegistryError::UploadNotFound(_))
        ));

        storage.store_blob("sha256:aa".into(), b"blob".to_vec()).await.unwrap();
        assert_eq!(storage.get_blob("sha256:aa").await.unwrap(), Some(b"blob".to_vec()));
        assert!(storage.delete_blob("sha256:aa").await.unwrap());
        assert!(storage.get_blob("sha256:aa").await.unwrap().is_none());

        storage.health().await.unwrap();
    }

    #[tokio::test]
    async fn memory_storage_behaves() {
        exercise(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn disk_storage_behaves() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path().join("root")).await.unwrap();
        exercise(&storage).await;
    }

    #[tokio::test]
    async fn factory_distinguishes_unknown_from_unavailable() {
        let factory = DriverFactory::default();
        let params = Parameters::new();

        let err = factory.create("s3", &params).await.err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::BackendUnavailable);

        let err = factory.create("floppy", &params).await.err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::UnknownBackend);

        assert!(factory.create("inmemory", &params).await.is_ok());
    }

    #[tokio::test]
    async fn registered_drivers_take_over_known_names() {
        let factory = DriverFactory::default().with_driver("s3", InMemoryDriver);
        assert!(factory.contains("s3"));
        assert!(factory.create("s3", &Parameters::new()).await.is_ok());
    }

    #[tokio::test]
    async fn filesystem_driver_reads_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("registry");
        let params = Parameters::from([(
            "rootdirectory".to_string(),
            Value::String(root.display().to_string()),
        )]);

        FilesystemDriver.create(&params).await.unwrap();
        assert!(root.join("blobs").is_dir());
    }
}

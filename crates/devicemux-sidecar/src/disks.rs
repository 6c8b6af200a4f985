//! Developer disk image stores.
//!
//! Images are looked up by product version string (`16.4`, `13.4.1`). Each
//! version holds `DeveloperDiskImage.dmg` and its `.signature`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::{Result, SidecarError};

/// File name of a developer disk image.
pub const IMAGE_FILE: &str = "DeveloperDiskImage.dmg";

/// File name of a developer disk image signature.
pub const SIGNATURE_FILE: &str = "DeveloperDiskImage.dmg.signature";

/// A developer disk image and its signature.
#[derive(Clone, PartialEq, Eq)]
pub struct DeveloperDisk {
    /// The disk image.
    pub image: Vec<u8>,
    /// The image signature.
    pub signature: Vec<u8>,
}

impl std::fmt::Debug for DeveloperDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeveloperDisk")
            .field("image_len", &self.image.len())
            .field("signature_len", &self.signature.len())
            .finish()
    }
}

/// A source of developer disk images.
#[async_trait]
pub trait DeveloperDiskStore: Send + Sync {
    /// Find the image for a product version.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn find(&self, version: &str) -> Result<Option<DeveloperDisk>>;
}

/// Images on the local file system, under `<root>/<version>/`.
#[derive(Debug, Clone)]
pub struct DirectoryDiskStore {
    root: PathBuf,
}

impl DirectoryDiskStore {
    /// Create a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

async fn read_optional(path: PathBuf) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SidecarError::DiskStore(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

#[async_trait]
impl DeveloperDiskStore for DirectoryDiskStore {
    async fn find(&self, version: &str) -> Result<Option<DeveloperDisk>> {
        let dir = self.root.join(version);
        let Some(image) = read_optional(dir.join(IMAGE_FILE)).await? else {
            debug!(version, dir = %dir.display(), "No developer disk image");
            return Ok(None);
        };
        let signature = read_optional(dir.join(SIGNATURE_FILE))
            .await?
            .ok_or_else(|| {
                SidecarError::DiskStore(format!("{} has no signature", dir.display()))
            })?;
        Ok(Some(DeveloperDisk { image, signature }))
    }
}

/// Images served over HTTP, under `<base>/<version>/`.
#[derive(Debug, Clone)]
pub struct HttpDiskStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDiskStore {
    /// Create a store for images under `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| SidecarError::Config(format!("Failed to create HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, client })
    }

    async fn fetch(&self, version: &str, file: &str) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/{version}/{file}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(url = %url, "Developer disk file not found");
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.bytes().await?.to_vec()))
    }
}

#[async_trait]
impl DeveloperDiskStore for HttpDiskStore {
    async fn find(&self, version: &str) -> Result<Option<DeveloperDisk>> {
        let Some(image) = self.fetch(version, IMAGE_FILE).await? else {
            return Ok(None);
        };
        let signature = self.fetch(version, SIGNATURE_FILE).await?.ok_or_else(|| {
            SidecarError::DiskStore(format!("{}/{version} has no signature", self.base_url))
        })?;
        Ok(Some(DeveloperDisk { image, signature }))
    }
}

/// Several stores searched in order.
#[derive(Default, Clone)]
pub struct DiskStoreChain {
    stores: Vec<Arc<dyn DeveloperDiskStore>>,
}

impl DiskStoreChain {
    /// Create an empty chain, which finds nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a store.
    #[must_use]
    pub fn with(mut self, store: Arc<dyn DeveloperDiskStore>) -> Self {
        self.stores.push(store);
        self
    }

    /// Number of stores in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Check if the chain has no stores.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[async_trait]
impl DeveloperDiskStore for DiskStoreChain {
    async fn find(&self, version: &str) -> Result<Option<DeveloperDisk>> {
        for store in &self.stores {
            if let Some(disk) = store.find(version).await? {
                return Ok(Some(disk));
            }
        }
        Ok(None)
    }
}

/// In-memory disk store for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// A disk store holding images in memory and recording lookups.
    #[derive(Default)]
    pub struct MemoryDiskStore {
        disks: Mutex<HashMap<String, DeveloperDisk>>,
        lookups: Mutex<Vec<String>>,
    }

    impl MemoryDiskStore {
        /// Create an empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add an image for a version.
        pub fn insert(&self, version: &str, disk: DeveloperDisk) {
            self.disks.lock().insert(version.to_string(), disk);
        }

        /// Versions looked up so far, in order.
        #[must_use]
        pub fn lookups(&self) -> Vec<String> {
            self.lookups.lock().clone()
        }
    }

    #[async_trait]
    impl DeveloperDiskStore for MemoryDiskStore {
        async fn find(&self, version: &str) -> Result<Option<DeveloperDisk>> {
            self.lookups.lock().push(version.to_string());
            Ok(self.disks.lock().get(version).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::mock::MemoryDiskStore;
    use super::*;

    fn disk(tag: &str) -> DeveloperDisk {
        DeveloperDisk {
            image: format!("{tag}-image").into_bytes(),
            signature: format!("{tag}-signature").into_bytes(),
        }
    }

    #[tokio::test]
    async fn directory_store_reads_version_dir() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("16.4");
        std::fs::create_dir(&version_dir).unwrap();
        std::fs::write(version_dir.join(IMAGE_FILE), b"image").unwrap();
        std::fs::write(version_dir.join(SIGNATURE_FILE), b"sig").unwrap();

        let store = DirectoryDiskStore::new(dir.path());
        let found = store.find("16.4").await.unwrap().unwrap();
        assert_eq!(found.image, b"image");
        assert_eq!(found.signature, b"sig");
        assert!(store.find("15.0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_store_requires_signature() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("16.4");
        std::fs::create_dir(&version_dir).unwrap();
        std::fs::write(version_dir.join(IMAGE_FILE), b"image").unwrap();

        let store = DirectoryDiskStore::new(dir.path());
        assert!(matches!(
            store.find("16.4").await,
            Err(SidecarError::DiskStore(_))
        ));
    }

    #[tokio::test]
    async fn http_store_fetches_image_and_signature() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images/13.4/DeveloperDiskImage.dmg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/images/13.4/DeveloperDiskImage.dmg.signature"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"sig".to_vec()))
            .mount(&server)
            .await;

        let store = HttpDiskStore::new(format!("{}/images/", server.uri())).unwrap();
        let found = store.find("13.4").await.unwrap().unwrap();
        assert_eq!(found.image, b"image");
        assert_eq!(found.signature, b"sig");
    }

    #[tokio::test]
    async fn http_store_missing_version_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = HttpDiskStore::new(server.uri()).unwrap();
        assert!(store.find("13.4.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn http_store_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = HttpDiskStore::new(server.uri()).unwrap();
        let err = store.find("13.4").await.unwrap_err();
        assert!(matches!(err, SidecarError::DiskStore(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn chain_returns_first_match() {
        let first = Arc::new(MemoryDiskStore::new());
        let second = Arc::new(MemoryDiskStore::new());
        second.insert("16.4", disk("second"));

        let chain = DiskStoreChain::new()
            .with(first.clone())
            .with(second.clone());
        assert_eq!(chain.find("16.4").await.unwrap(), Some(disk("second")));
        assert_eq!(first.lookups(), vec!["16.4".to_string()]);

        assert!(DiskStoreChain::new().find("16.4").await.unwrap().is_none());
    }
}

//! In-memory blob backend.
//!
//! Containers and blobs live in a `tokio::sync::RwLock<HashMap<...>>`.
//! Useful as the store behind tests and local runs of the upload host:
//! it behaves like the Azure backend (missing container fails the
//! upload, delete of a missing blob reports `false`) and remembers what
//! it was asked to do so callers can inspect it.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use md5::{Digest, Md5};
use sha2::Sha256;

use super::backend::{BlobBackend, BlobProperties, BoxFuture, PublicAccess};
use crate::file::{ByteStream, ContentSettings, Metadata};

/// A blob as held by [`MemoryBlobBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlob {
    pub data: Bytes,
    pub etag: String,
    pub settings: ContentSettings,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Default)]
struct MemoryContainer {
    access: Option<PublicAccess>,
    blobs: HashMap<String, MemoryBlob>,
}

/// A SAS URL request as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasRequest {
    pub container: String,
    pub blob: String,
    pub expires_on: Option<DateTime<Utc>>,
}

/// In-memory blob backend.
#[derive(Debug)]
pub struct MemoryBlobBackend {
    /// container name -> container.
    containers: tokio::sync::RwLock<HashMap<String, MemoryContainer>>,
    /// Every `create_container_if_not_exists` call, in order.
    create_calls: tokio::sync::RwLock<Vec<(String, PublicAccess)>>,
    /// Every `generate_sas_url` call, in order.
    sas_requests: tokio::sync::RwLock<Vec<SasRequest>>,
    /// Base URL used for signed URLs.
    base_url: String,
}

impl Default for MemoryBlobBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::with_base_url("http://127.0.0.1:10000/memory")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            containers: tokio::sync::RwLock::new(HashMap::new()),
            create_calls: tokio::sync::RwLock::new(Vec::new()),
            sas_requests: tokio::sync::RwLock::new(Vec::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Pre-create a container, bypassing the call log.
    pub async fn insert_container(&self, container: &str) {
        self.containers
            .write()
            .await
            .entry(container.to_string())
            .or_default();
    }

    pub async fn blob(&self, container: &str, blob: &str) -> Option<MemoryBlob> {
        self.containers
            .read()
            .await
            .get(container)
            .and_then(|c| c.blobs.get(blob).cloned())
    }

    pub async fn blob_count(&self, container: &str) -> usize {
        self.containers
            .read()
            .await
            .get(container)
            .map_or(0, |c| c.blobs.len())
    }

    pub async fn container_exists(&self, container: &str) -> bool {
        self.containers.read().await.contains_key(container)
    }

    /// Access level the container was created with, if the backend created it.
    pub async fn container_access(&self, container: &str) -> Option<PublicAccess> {
        self.containers
            .read()
            .await
            .get(container)
            .and_then(|c| c.access)
    }

    pub async fn create_calls(&self) -> Vec<(String, PublicAccess)> {
        self.create_calls.read().await.clone()
    }

    pub async fn sas_requests(&self) -> Vec<SasRequest> {
        self.sas_requests.read().await.clone()
    }

    /// Compute the quoted MD5-hex ETag for a byte slice.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// Deterministic stand-in for a SAS signature.
    fn signature(container: &str, blob: &str, expiry: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("r\n{expiry}\n/blob/memory/{container}/{blob}").as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl BlobBackend for MemoryBlobBackend {
    fn create_container_if_not_exists<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move {
            self.create_calls
                .write()
                .await
                .push((container.to_string(), access));

            let mut containers = self.containers.write().await;
            if containers.contains_key(container) {
                return Ok(false);
            }
            containers.insert(
                container.to_string(),
                MemoryContainer {
                    access: Some(access),
                    blobs: HashMap::new(),
                },
            );
            tracing::debug!("Memory create container: {}", container);
            Ok(true)
        })
    }

    fn upload_stream<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        mut stream: ByteStream<'a>,
        settings: &'a ContentSettings,
        metadata: Option<&'a Metadata>,
    ) -> BoxFuture<'a, anyhow::Result<u64>> {
        Box::pin(async move {
            if !self.container_exists(container).await {
                anyhow::bail!("The specified container does not exist: {container}");
            }

            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
            }
            let data = buf.freeze();
            let size = data.len() as u64;

            let stored = MemoryBlob {
                etag: Self::compute_etag(&data),
                data,
                settings: settings.clone(),
                metadata: metadata.cloned(),
            };

            // The container may have been removed while the stream was read.
            let mut containers = self.containers.write().await;
            let entry = containers
                .get_mut(container)
                .ok_or_else(|| anyhow::anyhow!("The specified container does not exist: {container}"))?;
            entry.blobs.insert(blob.to_string(), stored);

            tracing::debug!("Memory upload: container={} blob={} size={}", container, blob, size);
            Ok(size)
        })
    }

    fn get_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<BlobProperties>> {
        Box::pin(async move {
            let stored = self
                .blob(container, blob)
                .await
                .ok_or_else(|| anyhow::anyhow!("The specified blob does not exist: {container}/{blob}"))?;
            Ok(BlobProperties {
                etag: Some(stored.etag),
                metadata: stored.metadata.filter(|m| !m.is_empty()),
                blob_type: Some("BlockBlob".to_string()),
                content_length: Some(stored.data.len() as u64),
            })
        })
    }

    fn generate_sas_url<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        expires_on: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            self.sas_requests.write().await.push(SasRequest {
                container: container.to_string(),
                blob: blob.to_string(),
                expires_on,
            });

            let expiry = expires_on
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();
            let mut query = String::from("sv=2023-11-03&sr=b&sp=r");
            if !expiry.is_empty() {
                query.push_str(&format!("&se={expiry}"));
            }
            query.push_str(&format!("&sig={}", Self::signature(container, blob, &expiry)));

            Ok(format!("{}/{}/{}?{}", self.base_url, container, blob, query))
        })
    }

    fn delete_if_exists<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move {
            let mut containers = self.containers.write().await;
            let removed = containers
                .get_mut(container)
                .and_then(|c| c.blobs.remove(blob))
                .is_some();
            tracing::debug!("Memory delete: container={} blob={} existed={}", container, blob, removed);
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::IncomingFile;
    use crate::file::FileInfo;
    use std::io;

    fn bytes_stream(data: &'static str) -> ByteStream<'static> {
        IncomingFile::from_bytes(FileInfo::default(), data).stream
    }

    #[tokio::test]
    async fn test_create_container_is_idempotent() {
        let backend = MemoryBlobBackend::new();
        assert!(backend
            .create_container_if_not_exists("c", PublicAccess::None)
            .await
            .unwrap());
        assert!(!backend
            .create_container_if_not_exists("c", PublicAccess::Blob)
            .await
            .unwrap());
        assert_eq!(backend.container_access("c").await, Some(PublicAccess::None));
        assert_eq!(backend.create_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_upload_and_properties() {
        let backend = MemoryBlobBackend::new();
        backend.insert_container("c").await;

        let settings = ContentSettings::inline("text/plain");
        let size = backend
            .upload_stream("c", "hello.txt", bytes_stream("hello world"), &settings, None)
            .await
            .unwrap();
        assert_eq!(size, 11);

        let props = backend.get_properties("c", "hello.txt").await.unwrap();
        assert_eq!(props.content_length, Some(11));
        assert_eq!(props.etag.as_deref(), Some("\"5eb63bbbe01eeed093cb22bb8f5acdc3\""));
        assert_eq!(props.blob_type.as_deref(), Some("BlockBlob"));
        assert!(props.metadata.is_none());

        let blob = backend.blob("c", "hello.txt").await.unwrap();
        assert_eq!(blob.settings, settings);
    }

    #[tokio::test]
    async fn test_upload_overwrites() {
        let backend = MemoryBlobBackend::new();
        backend.insert_container("c").await;
        let s = ContentSettings::default();
        backend
            .upload_stream("c", "k", bytes_stream("one"), &s, None)
            .await
            .unwrap();
        backend
            .upload_stream("c", "k", bytes_stream("second"), &s, None)
            .await
            .unwrap();
        assert_eq!(backend.blob("c", "k").await.unwrap().data, Bytes::from("second"));
        assert_eq!(backend.blob_count("c").await, 1);
    }

    #[tokio::test]
    async fn test_upload_missing_container_fails() {
        let backend = MemoryBlobBackend::new();
        let result = backend
            .upload_stream("nope", "k", bytes_stream("x"), &ContentSettings::default(), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_upload_stream_error_propagates() {
        let backend = MemoryBlobBackend::new();
        backend.insert_container("c").await;
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from("part")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let stream: ByteStream<'static> = Box::pin(futures_util::stream::iter(chunks));
        let err = backend
            .upload_stream("c", "k", stream, &ContentSettings::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("client went away"));
        assert!(backend.blob("c", "k").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_if_exists() {
        let backend = MemoryBlobBackend::new();
        backend.insert_container("c").await;
        backend
            .upload_stream("c", "k", bytes_stream("x"), &ContentSettings::default(), None)
            .await
            .unwrap();
        assert!(backend.delete_if_exists("c", "k").await.unwrap());
        assert!(!backend.delete_if_exists("c", "k").await.unwrap());
        assert!(!backend.delete_if_exists("no-container", "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_sas_url_with_and_without_expiry() {
        let backend = MemoryBlobBackend::new();
        let expiry = Utc::now();
        let url = backend.generate_sas_url("c", "k", Some(expiry)).await.unwrap();
        assert!(url.starts_with("http://127.0.0.1:10000/memory/c/k?"));
        assert!(url.contains("&se="));
        assert!(url.contains("&sig="));

        let url = backend.generate_sas_url("c", "k", None).await.unwrap();
        assert!(!url.contains("se="));

        let requests = backend.sas_requests().await;
        assert_eq!(requests[0].expires_on, Some(expiry));
        assert_eq!(requests[1].expires_on, None);
    }
}

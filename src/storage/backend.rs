//! Abstract blob backend trait.
//!
//! [`BlobBackend`] is the boundary between the storage engine and the
//! blob service client. The engine only ever calls these five
//! operations; transport, signing and retries live behind the trait.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::file::{ByteStream, ContentSettings, Metadata};

/// Boxed future returned by backend operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Anonymous access level set on container creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicAccess {
    None,
    Blob,
    Container,
}

impl PublicAccess {
    /// Value of the `x-ms-blob-public-access` header, if one is sent.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            PublicAccess::None => None,
            PublicAccess::Blob => Some("blob"),
            PublicAccess::Container => Some("container"),
        }
    }
}

/// Blob properties read back after an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    pub etag: Option<String>,
    /// `None` when the blob carries no user metadata.
    pub metadata: Option<Metadata>,
    pub blob_type: Option<String>,
    pub content_length: Option<u64>,
}

/// Async blob service contract.
pub trait BlobBackend: Send + Sync + 'static {
    /// Create `container` unless it exists. Returns `true` if it was created.
    fn create_container_if_not_exists<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> BoxFuture<'a, anyhow::Result<bool>>;

    /// Write `stream` to `container/blob`, consuming it to the end.
    /// Returns the number of bytes written.
    fn upload_stream<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        stream: ByteStream<'a>,
        settings: &'a ContentSettings,
        metadata: Option<&'a Metadata>,
    ) -> BoxFuture<'a, anyhow::Result<u64>>;

    /// Read the properties of `container/blob`.
    fn get_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<BlobProperties>>;

    /// Read-only signed URL for `container/blob`. `expires_on = None`
    /// requests a URL without an expiry.
    fn generate_sas_url<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        expires_on: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, anyhow::Result<String>>;

    /// Delete `container/blob`. Returns `false` if it did not exist.
    fn delete_if_exists<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<bool>>;
}

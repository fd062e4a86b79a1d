//! Azure Blob storage engine.
//!
//! [`StorageEngine`] is the contract an upload middleware drives: store one
//! incoming file and describe where it went, or remove a file stored
//! earlier. [`AzureBlobEngine`] implements it on top of a
//! [`BlobBackend`]; in production that backend is the Azure REST client.
//!
//! The engine holds only read-only configuration and the shared backend,
//! so one instance serves any number of concurrent uploads.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::file::{BlobDescriptor, ContentSettings, FileInfo, IncomingFile, Metadata, UploadRequest};
use crate::metrics::{BYTES_STORED_TOTAL, FILES_REMOVED_TOTAL, FILES_STORED_TOTAL};
use crate::options::{EngineOptions, EnvCredentials, UrlExpiration};
use crate::resolver::{default_blob_name, Resolver};
use crate::storage::azure::{AzureBlobClient, StorageAccount};
use crate::storage::backend::{BlobBackend, BoxFuture, PublicAccess};

/// Storage engine contract for an upload middleware.
pub trait StorageEngine: Send + Sync {
    /// Store `file` and return its descriptor. The stream is consumed.
    fn handle_file<'a>(
        &'a self,
        req: &'a UploadRequest,
        file: IncomingFile<'a>,
    ) -> BoxFuture<'a, Result<BlobDescriptor, EngineError>>;

    /// Remove a previously stored file. Removing a missing file succeeds.
    fn remove_file<'a>(
        &'a self,
        req: &'a UploadRequest,
        file: &'a FileInfo,
    ) -> BoxFuture<'a, Result<(), EngineError>>;
}

/// Stores uploads as block blobs in Azure Blob Storage.
pub struct AzureBlobEngine {
    backend: Arc<dyn BlobBackend>,
    container_name: Resolver<String>,
    blob_name: Resolver<String>,
    metadata: Option<Resolver<Metadata>>,
    content_settings: Option<Resolver<ContentSettings>>,
    access: PublicAccess,
    auto_create_container: bool,
    url_expiration: UrlExpiration,
}

impl std::fmt::Debug for AzureBlobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBlobEngine")
            .field("access", &self.access)
            .field("auto_create_container", &self.auto_create_container)
            .field("url_expiration", &self.url_expiration)
            .finish_non_exhaustive()
    }
}

impl AzureBlobEngine {
    /// Build an engine, falling back to the `AZURE_STORAGE_*` environment
    /// variables for credentials not given in `options`.
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        Self::with_env(options, EnvCredentials::from_env())
    }

    /// Build an engine with an explicit environment snapshot.
    pub fn with_env(options: EngineOptions, env: EnvCredentials) -> Result<Self, EngineError> {
        let credentials = options.resolve_credentials(&env)?;
        let account = StorageAccount::from_credentials(&credentials)
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        let client = AzureBlobClient::new(account, options.block_size)
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        Self::with_backend(options, Arc::new(client))
    }

    /// Build an engine over any blob backend. Credentials in `options` are
    /// ignored; the backend is assumed to be authenticated already.
    pub fn with_backend(
        options: EngineOptions,
        backend: Arc<dyn BlobBackend>,
    ) -> Result<Self, EngineError> {
        let container_name = options.container_name.ok_or_else(|| {
            EngineError::configuration("missing container name: set a static name or a resolver")
        })?;

        Ok(Self {
            backend,
            container_name,
            blob_name: options.blob_name.unwrap_or_else(default_blob_name),
            metadata: options.metadata,
            content_settings: options.content_settings,
            access: options.container_access_level.public_access(),
            auto_create_container: options.auto_create_container.unwrap_or(true),
            url_expiration: options.url_expiration,
        })
    }

    /// Container and blob name for `file`, resolved concurrently.
    async fn resolve_location(
        &self,
        req: &UploadRequest,
        file: &FileInfo,
    ) -> Result<(String, String), EngineError> {
        tokio::try_join!(
            self.container_name.resolve(req, file),
            self.blob_name.resolve(req, file)
        )
        .map_err(EngineError::Resolution)
    }

    async fn resolve_content_settings(
        &self,
        req: &UploadRequest,
        file: &FileInfo,
    ) -> Result<ContentSettings, EngineError> {
        match &self.content_settings {
            Some(resolver) => resolver
                .resolve(req, file)
                .await
                .map_err(EngineError::Resolution),
            None => Ok(ContentSettings::inline(file.mime_type())),
        }
    }

    async fn resolve_metadata(
        &self,
        req: &UploadRequest,
        file: &FileInfo,
    ) -> Result<Option<Metadata>, EngineError> {
        match &self.metadata {
            Some(resolver) => resolver
                .resolve(req, file)
                .await
                .map(Some)
                .map_err(EngineError::Resolution),
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        req: &UploadRequest,
        file: IncomingFile<'_>,
    ) -> Result<BlobDescriptor, EngineError> {
        let IncomingFile { info, stream } = file;

        let (container, blob) = self.resolve_location(req, &info).await?;
        let settings = self.resolve_content_settings(req, &info).await?;
        let metadata = self.resolve_metadata(req, &info).await?;

        if self.auto_create_container {
            let created = self
                .backend
                .create_container_if_not_exists(&container, self.access)
                .await
                .map_err(EngineError::Transport)?;
            if created {
                info!("Created container {} (access={:?})", container, self.access);
            }
        }

        debug!(
            "Uploading {} as {}/{} ({})",
            info.original_name(),
            container,
            blob,
            info.mime_type()
        );
        let size = self
            .backend
            .upload_stream(&container, &blob, stream, &settings, metadata.as_ref())
            .await
            .map_err(EngineError::Transport)?;

        let properties = self
            .backend
            .get_properties(&container, &blob)
            .await
            .map_err(EngineError::Transport)?;

        let expires_on = self.url_expiration.expires_on(Utc::now());
        let url = self
            .backend
            .generate_sas_url(&container, &blob, expires_on)
            .await
            .map_err(EngineError::Transport)?;

        counter!(FILES_STORED_TOTAL).increment(1);
        counter!(BYTES_STORED_TOTAL).increment(size);
        debug!("Stored {}/{} ({} bytes)", container, blob, size);

        Ok(BlobDescriptor {
            file: info.fields,
            url,
            etag: properties.etag,
            metadata: properties.metadata,
            container_name: container,
            blob_name: blob,
            blob_type: properties.blob_type,
            blob_size: properties.content_length.or(Some(size)),
        })
    }

    /// Location of a file being removed. A file rebuilt from a descriptor
    /// names its blob exactly; otherwise the resolvers run as for store.
    async fn removal_location(
        &self,
        req: &UploadRequest,
        file: &FileInfo,
    ) -> Result<(String, String), EngineError> {
        match (&file.container_name, &file.blob_name) {
            (Some(container), Some(blob)) => Ok((container.clone(), blob.clone())),
            _ => self.resolve_location(req, file).await,
        }
    }

    async fn remove(&self, req: &UploadRequest, file: &FileInfo) -> Result<(), EngineError> {
        let (container, blob) = self.removal_location(req, file).await?;

        let deleted = self
            .backend
            .delete_if_exists(&container, &blob)
            .await
            .map_err(EngineError::Transport)?;

        if deleted {
            counter!(FILES_REMOVED_TOTAL).increment(1);
            debug!("Removed {}/{}", container, blob);
        } else {
            debug!("Remove of {}/{}: blob did not exist", container, blob);
        }
        Ok(())
    }
}

impl StorageEngine for AzureBlobEngine {
    fn handle_file<'a>(
        &'a self,
        req: &'a UploadRequest,
        file: IncomingFile<'a>,
    ) -> BoxFuture<'a, Result<BlobDescriptor, EngineError>> {
        Box::pin(self.store(req, file))
    }

    fn remove_file<'a>(
        &'a self,
        req: &'a UploadRequest,
        file: &'a FileInfo,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(self.remove(req, file))
    }
}

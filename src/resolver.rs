//! Per-upload value resolvers.
//!
//! Every option that may vary per upload (container name, blob name,
//! metadata, content settings) is held as a [`Resolver`]: an async
//! function of the request and the file. Static values are lifted once
//! with [`Resolver::value`], so the engine never branches on "is this a
//! function".

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::file::{FileInfo, UploadRequest};

/// Future returned by a resolver.
pub type ResolverFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

type ResolverFn<T> = dyn Fn(&UploadRequest, &FileInfo) -> ResolverFuture<T> + Send + Sync;

/// Async function of `(request, file)` producing a `T`.
pub struct Resolver<T> {
    inner: Arc<ResolverFn<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Resolver")
    }
}

impl<T: Send + 'static> Resolver<T> {
    /// Wrap an async function.
    ///
    /// The returned future must own what it needs; clone fields out of the
    /// request or file before the `async move` block.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(&UploadRequest, &FileInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |req: &UploadRequest, file: &FileInfo| -> ResolverFuture<T> {
                Box::pin(f(req, file))
            }),
        }
    }

    /// Wrap a synchronous function.
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(&UploadRequest, &FileInfo) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(move |req: &UploadRequest, file: &FileInfo| -> ResolverFuture<T> {
                let result = f(req, file);
                Box::pin(async move { result })
            }),
        }
    }

    pub async fn resolve(&self, req: &UploadRequest, file: &FileInfo) -> anyhow::Result<T> {
        (self.inner)(req, file).await
    }
}

impl<T: Clone + Send + Sync + 'static> Resolver<T> {
    /// Lift a static value into a resolver that always yields it.
    pub fn value(value: T) -> Self {
        Self::from_sync(move |_, _| Ok(value.clone()))
    }
}

impl From<&str> for Resolver<String> {
    fn from(value: &str) -> Self {
        Resolver::value(value.to_string())
    }
}

impl From<String> for Resolver<String> {
    fn from(value: String) -> Self {
        Resolver::value(value)
    }
}

/// Default blob-name resolver.
///
/// A file coming back from a stored descriptor keeps its blob name so that
/// removal targets the same blob; otherwise a fresh name is generated.
pub fn default_blob_name() -> Resolver<String> {
    Resolver::from_sync(|_, file| {
        Ok(match &file.blob_name {
            Some(name) => name.clone(),
            None => generate_blob_name(file.original_name()),
        })
    })
}

/// `{unix-millis}-{uuid-v4}{extension}` for the given original filename.
pub fn generate_blob_name(original_name: &str) -> String {
    format!(
        "{}-{}{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4(),
        extension(original_name)
    )
}

/// Extension of `name` including the leading dot, or `""`.
///
/// Dotfiles such as `.env` have no extension; a trailing dot yields `"."`.
pub fn extension(name: &str) -> &str {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match base.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &base[idx..],
    }
}

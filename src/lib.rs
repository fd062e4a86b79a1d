//! Storage engine that streams multipart uploads into Azure Blob Storage.
//!
//! [`engine::AzureBlobEngine`] takes one uploaded file at a time, writes it
//! as a block blob, and returns a [`file::BlobDescriptor`] carrying a
//! read-only signed URL. Container name, blob name, metadata and content
//! settings can each be a static value or an async function of the
//! request and file ([`resolver::Resolver`]).
//!
//! The crate also ships a small upload host (`server`, `main`) that
//! exposes the engine over HTTP.

use std::sync::Arc;

pub mod config;
pub mod engine;
pub mod errors;
pub mod file;
pub mod metrics;
pub mod options;
pub mod resolver;
pub mod server;
pub mod storage;
pub mod xml;

pub use engine::{AzureBlobEngine, StorageEngine};
pub use errors::EngineError;
pub use file::{BlobDescriptor, ContentSettings, FileInfo, IncomingFile, UploadRequest};
pub use options::{ContainerAccessLevel, EngineOptions, UrlExpiration};
pub use resolver::Resolver;

use crate::config::Config;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Host configuration.
    pub config: Config,
    /// Engine every upload is routed through.
    pub engine: Arc<dyn StorageEngine>,
}

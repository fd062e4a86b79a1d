//! Blob backends.
//!
//! The [`backend::BlobBackend`] trait abstracts over the blob service.
//! Implementations are the Azure Blob REST client and an in-memory
//! store.

pub mod azure;
pub mod backend;
pub mod memory;

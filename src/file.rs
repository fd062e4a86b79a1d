//! Upload data model.
//!
//! These types mirror what an upload middleware hands to a storage
//! engine: the inbound request, the file fields of one multipart part,
//! the part's byte stream, and the descriptor returned once the bytes
//! are stored.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;

use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

/// User-defined metadata attached to a blob.
pub type Metadata = HashMap<String, String>;

/// Readable byte stream of one uploaded file.
pub type ByteStream<'a> = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'a>>;

/// Request context visible to resolvers.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl UploadRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// File fields reported by the upload middleware for one multipart part.
///
/// Field names follow the wire names callers already persist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileFields {
    /// Form field the file was sent under.
    #[serde(default)]
    pub fieldname: String,
    /// Filename supplied by the client.
    #[serde(default)]
    pub originalname: String,
    /// Transfer encoding of the part (usually `7bit`).
    #[serde(default)]
    pub encoding: String,
    /// MIME type of the part.
    #[serde(default)]
    pub mimetype: String,
}

/// Everything a resolver may look at when naming a blob.
///
/// `container_name` and `blob_name` are only set when the file comes back
/// from a previously returned [`BlobDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub fields: FileFields,
    pub container_name: Option<String>,
    pub blob_name: Option<String>,
}

impl FileInfo {
    pub fn new(
        fieldname: impl Into<String>,
        originalname: impl Into<String>,
        mimetype: impl Into<String>,
    ) -> Self {
        Self {
            fields: FileFields {
                fieldname: fieldname.into(),
                originalname: originalname.into(),
                encoding: "7bit".to_string(),
                mimetype: mimetype.into(),
            },
            container_name: None,
            blob_name: None,
        }
    }

    pub fn original_name(&self) -> &str {
        &self.fields.originalname
    }

    pub fn mime_type(&self) -> &str {
        &self.fields.mimetype
    }
}

/// A file on its way into the engine: its fields plus the bytes.
pub struct IncomingFile<'a> {
    pub info: FileInfo,
    pub stream: ByteStream<'a>,
}

impl<'a> IncomingFile<'a> {
    pub fn new(info: FileInfo, stream: ByteStream<'a>) -> Self {
        Self { info, stream }
    }

    /// Build a file whose stream yields `data` as a single chunk.
    pub fn from_bytes(info: FileInfo, data: impl Into<Bytes>) -> IncomingFile<'static> {
        let chunk: io::Result<Bytes> = Ok(data.into());
        IncomingFile {
            info,
            stream: Box::pin(futures_util::stream::iter(vec![chunk])),
        }
    }
}

impl std::fmt::Debug for IncomingFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingFile")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// HTTP content headers stored with a blob.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Base64-encoded MD5 of the content.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "contentMD5")]
    pub content_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
}

impl ContentSettings {
    /// Settings applied when no content-settings resolver is configured.
    pub fn inline(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            content_disposition: Some("inline".to_string()),
            ..Self::default()
        }
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    #[serde(flatten)]
    pub file: FileFields,
    /// Read-only signed URL for the blob.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub container_name: String,
    pub blob_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_size: Option<u64>,
}

impl BlobDescriptor {
    /// File info to hand back to the engine when removing this blob.
    pub fn file_info(&self) -> FileInfo {
        FileInfo {
            fields: self.file.clone(),
            container_name: Some(self.container_name.clone()),
            blob_name: Some(self.blob_name.clone()),
        }
    }
}

//! Azure Blob Storage backend.
//!
//! Talks to the Azure Blob REST API with `reqwest`, signing every request
//! with the storage account's Shared Key.
//!
//! Upload strategy uses Block Blob primitives:
//!   stream fits in one block -> Put Blob
//!   otherwise                -> Put Block per block, then Put Block List
//!
//! Block IDs: `base64(format!("{upload_id}:{index:06}"))`, so every ID in
//! one upload has the same length and concurrent uploads to the same
//! blob name never share IDs.
//!
//! Signed read URLs are service SAS tokens (`sr=b`, `sp=r`).

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, StatusCode, Url};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::backend::{BlobBackend, BlobProperties, BoxFuture, PublicAccess};
use crate::file::{ByteStream, ContentSettings, Metadata};
use crate::options::{Credentials, DEFAULT_BLOCK_SIZE};
use crate::xml;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Signed version of generated SAS tokens.
const SAS_VERSION: &str = "2021-06-08";

/// Signed start is back-dated by this much to tolerate clock skew
/// between this host and the storage service.
const SAS_START_SKEW_MINUTES: i64 = 5;

/// Well-known Azurite development account.
const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000";

type HmacSha256 = Hmac<Sha256>;

/// Percent-encoding set for blob paths: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Percent-encoding set for query values.
const QUERY_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Failure response from the Blob service.
#[derive(Debug, Clone, Error)]
#[error("Azure {operation} failed: HTTP {status} {code}: {message}")]
pub struct AzureError {
    pub operation: &'static str,
    pub status: u16,
    /// Azure error code (`x-ms-error-code`), `Unknown` if absent.
    pub code: String,
    pub message: String,
}

// -- Account ------------------------------------------------------------------

/// Storage account name, decoded key and Blob service endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageAccount {
    pub name: String,
    key: Vec<u8>,
    /// Endpoint without trailing slash, e.g. `https://acct.blob.core.windows.net`.
    pub endpoint: String,
}

impl std::fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAccount")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl StorageAccount {
    /// Account addressed at `https://{name}.blob.core.windows.net`.
    pub fn from_shared_key(name: &str, key: &str) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            key: decode_key(key)?,
            endpoint: format!("https://{}.blob.core.windows.net", name),
        })
    }

    /// Parse an Azure Storage connection string.
    ///
    /// Supports `AccountName`, `AccountKey`, `DefaultEndpointsProtocol`,
    /// `EndpointSuffix`, `BlobEndpoint`, and `UseDevelopmentStorage=true`
    /// (optionally with `DevelopmentStorageProxyUri`).
    pub fn from_connection_string(conn_str: &str) -> anyhow::Result<Self> {
        let mut account_name = None;
        let mut account_key = None;
        let mut protocol = None;
        let mut suffix = None;
        let mut blob_endpoint = None;
        let mut dev_storage = false;
        let mut dev_proxy = None;

        for part in conn_str.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Keys never contain '='; base64 account keys end with it.
            let Some((key, value)) = part.split_once('=') else {
                anyhow::bail!("Malformed connection string segment: '{}'", part);
            };
            match key.trim() {
                "AccountName" => account_name = Some(value.to_string()),
                "AccountKey" => account_key = Some(value.to_string()),
                "DefaultEndpointsProtocol" => protocol = Some(value.to_string()),
                "EndpointSuffix" => suffix = Some(value.to_string()),
                "BlobEndpoint" => blob_endpoint = Some(value.to_string()),
                "UseDevelopmentStorage" => dev_storage = value.eq_ignore_ascii_case("true"),
                "DevelopmentStorageProxyUri" => dev_proxy = Some(value.to_string()),
                _ => {}
            }
        }

        if dev_storage {
            let base = dev_proxy.unwrap_or_else(|| DEV_BLOB_ENDPOINT.to_string());
            return Ok(Self {
                name: DEV_ACCOUNT_NAME.to_string(),
                key: decode_key(DEV_ACCOUNT_KEY)?,
                endpoint: format!("{}/{}", base.trim_end_matches('/'), DEV_ACCOUNT_NAME),
            });
        }

        let name = account_name
            .ok_or_else(|| anyhow::anyhow!("Connection string is missing AccountName"))?;
        let key = account_key
            .ok_or_else(|| anyhow::anyhow!("Connection string is missing AccountKey"))?;

        let endpoint = match blob_endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => format!(
                "{}://{}.blob.{}",
                protocol.as_deref().unwrap_or("https"),
                name,
                suffix.as_deref().unwrap_or("core.windows.net")
            ),
        };

        Ok(Self {
            key: decode_key(&key)?,
            name,
            endpoint,
        })
    }

    pub fn from_credentials(credentials: &Credentials) -> anyhow::Result<Self> {
        match credentials {
            Credentials::ConnectionString(cs) => Self::from_connection_string(cs),
            Credentials::SharedKey { account, key } => Self::from_shared_key(account, key),
        }
    }
}

fn decode_key(key: &str) -> anyhow::Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(key.trim())
        .map_err(|e| anyhow::anyhow!("Invalid storage account key (not valid base64): {}", e))
}

// -- Client -------------------------------------------------------------------

/// Blob backend that forwards operations to Azure Blob Storage.
pub struct AzureBlobClient {
    /// HTTP client for Azure Blob REST API calls.
    client: reqwest::Client,
    account: StorageAccount,
    /// Bytes per staged block for streamed uploads.
    block_size: usize,
}

impl AzureBlobClient {
    /// Create a client for `account`.
    pub fn new(account: StorageAccount, block_size: Option<usize>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let block_size = block_size.unwrap_or(DEFAULT_BLOCK_SIZE).max(1);

        info!(
            "Azure blob client initialized: account={} endpoint={} block_size={}",
            account.name, account.endpoint, block_size
        );

        Ok(Self {
            client,
            account,
            block_size,
        })
    }

    fn container_url(&self, container: &str) -> String {
        format!(
            "{}/{}",
            self.account.endpoint,
            utf8_percent_encode(container, &AZURE_BLOB_ENCODE_SET)
        )
    }

    /// Build the full URL for a blob.
    fn blob_url(&self, container: &str, blob: &str) -> String {
        format!(
            "{}/{}",
            self.container_url(container),
            utf8_percent_encode(blob, &AZURE_BLOB_ENCODE_SET)
        )
    }

    /// Generate a block ID for a staged block.
    fn block_id(upload_id: &str, index: usize) -> String {
        BASE64_STANDARD.encode(format!("{}:{:06}", upload_id, index))
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(std::time::SystemTime::now())
    }

    fn hmac_base64(&self, payload: &str) -> anyhow::Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.account.key)
            .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(payload.as_bytes());
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Canonicalized resource: `/{account}{url path}` followed by the
    /// query parameters, lowercased and sorted, one per line.
    fn canonicalized_resource(account: &str, url: &Url) -> String {
        let mut resource = format!("/{}{}", account, url.path());

        let mut params: Vec<(String, String)> = Vec::new();
        for (k, v) in url.query_pairs() {
            let k = k.to_lowercase();
            match params.iter_mut().find(|(existing, _)| *existing == k) {
                Some((_, values)) => {
                    values.push(',');
                    values.push_str(&v);
                }
                None => params.push((k, v.into_owned())),
            }
        }
        params.sort_by(|a, b| a.0.cmp(&b.0));
        for (k, v) in &params {
            resource.push_str(&format!("\n{}:{}", k, v));
        }
        resource
    }

    /// Shared Key string-to-sign.
    ///
    /// ```text
    /// VERB\n
    /// Content-Encoding\n
    /// Content-Language\n
    /// Content-Length\n
    /// Content-MD5\n
    /// Content-Type\n
    /// Date\n
    /// If-Modified-Since\n
    /// If-Match\n
    /// If-None-Match\n
    /// If-Unmodified-Since\n
    /// Range\n
    /// CanonicalizedHeaders\n
    /// CanonicalizedResource
    /// ```
    fn string_to_sign(
        method: &str,
        content_length: usize,
        content_type: &str,
        ms_headers: &[(String, String)],
        canonicalized_resource: &str,
    ) -> String {
        // Content-Length is empty for zero-length bodies.
        let content_length = match content_length {
            0 => String::new(),
            n => n.to_string(),
        };

        let mut headers: Vec<(String, String)> = ms_headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
            .filter(|(k, _)| k.starts_with("x-ms-"))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonicalized_headers = headers
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}\n{}",
            method, content_length, content_type, canonicalized_headers, canonicalized_resource
        )
    }

    /// Sign and send one request, returning the response whatever its status.
    async fn send(
        &self,
        method: Method,
        url: &str,
        mut ms_headers: Vec<(String, String)>,
        body: Option<Bytes>,
    ) -> anyhow::Result<reqwest::Response> {
        let url = Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid blob URL {}: {}", url, e))?;
        ms_headers.push(("x-ms-date".to_string(), Self::rfc1123_date()));
        ms_headers.push(("x-ms-version".to_string(), AZURE_API_VERSION.to_string()));

        let content_length = body.as_ref().map_or(0, |b| b.len());
        let string_to_sign = Self::string_to_sign(
            method.as_str(),
            content_length,
            "",
            &ms_headers,
            &Self::canonicalized_resource(&self.account.name, &url),
        );
        let signature = self.hmac_base64(&string_to_sign)?;

        let mut req = self
            .client
            .request(method, url)
            .header(
                "Authorization",
                format!("SharedKey {}:{}", self.account.name, signature),
            );
        for (k, v) in &ms_headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        req.send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure request failed: {}", e))
    }

    /// Turn a non-success response into an [`AzureError`].
    async fn error_from(operation: &'static str, resp: reqwest::Response) -> AzureError {
        let status = resp.status().as_u16();
        let header_code = resp
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        let parsed = xml::parse_error(body.trim_start_matches('\u{feff}'));

        AzureError {
            operation,
            status,
            code: header_code
                .or(parsed.code)
                .unwrap_or_else(|| "Unknown".to_string()),
            message: parsed
                .message
                .unwrap_or_else(|| body.trim().to_string()),
        }
    }

    /// `x-ms-blob-*` and `x-ms-meta-*` headers for a committed blob.
    fn blob_headers(settings: &ContentSettings, metadata: Option<&Metadata>) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        let mut push = |name: &str, value: &Option<String>| {
            if let Some(v) = value {
                headers.push((name.to_string(), v.clone()));
            }
        };
        push("x-ms-blob-cache-control", &settings.cache_control);
        push("x-ms-blob-content-type", &settings.content_type);
        push("x-ms-blob-content-md5", &settings.content_md5);
        push("x-ms-blob-content-encoding", &settings.content_encoding);
        push("x-ms-blob-content-language", &settings.content_language);
        push("x-ms-blob-content-disposition", &settings.content_disposition);

        if let Some(metadata) = metadata {
            for (k, v) in metadata {
                headers.push((format!("x-ms-meta-{}", k), v.clone()));
            }
        }
        headers
    }

    // -- Azure Blob REST API operations ----------------------------------------

    /// Upload a whole blob in one request (Put Blob).
    async fn put_blob(
        &self,
        container: &str,
        blob: &str,
        data: Bytes,
        mut headers: Vec<(String, String)>,
    ) -> anyhow::Result<()> {
        headers.push(("x-ms-blob-type".to_string(), "BlockBlob".to_string()));
        let resp = self
            .send(Method::PUT, &self.blob_url(container, blob), headers, Some(data))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from("upload", resp).await.into());
        }
        Ok(())
    }

    /// Stage a block on a blob (Put Block).
    async fn put_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: Bytes,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}?comp=block&blockid={}",
            self.blob_url(container, blob),
            utf8_percent_encode(block_id, &QUERY_ENCODE_SET)
        );
        let resp = self.send(Method::PUT, &url, Vec::new(), Some(data)).await?;
        if !resp.status().is_success() {
            return Err(Self::error_from("put_block", resp).await.into());
        }
        Ok(())
    }

    /// Commit staged blocks (Put Block List).
    async fn put_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        headers: Vec<(String, String)>,
    ) -> anyhow::Result<()> {
        let url = format!("{}?comp=blocklist", self.blob_url(container, blob));
        let body = Bytes::from(xml::render_block_list(block_ids)?);
        let resp = self.send(Method::PUT, &url, headers, Some(body)).await?;
        if !resp.status().is_success() {
            return Err(Self::error_from("put_block_list", resp).await.into());
        }
        Ok(())
    }

    /// Read properties and metadata from the response headers of a HEAD.
    fn properties_from_headers(headers: &reqwest::header::HeaderMap) -> BlobProperties {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let mut metadata = Metadata::new();
        for (name, value) in headers {
            if let Some(key) = name.as_str().strip_prefix("x-ms-meta-") {
                if let Ok(v) = value.to_str() {
                    metadata.insert(key.to_string(), v.to_string());
                }
            }
        }

        BlobProperties {
            etag: text("etag"),
            metadata: (!metadata.is_empty()).then_some(metadata),
            blob_type: text("x-ms-blob-type"),
            content_length: text("content-length").and_then(|v| v.parse().ok()),
        }
    }

    /// Service SAS query string granting read access to one blob.
    fn sas_query(
        &self,
        container: &str,
        blob: &str,
        start: DateTime<Utc>,
        expires_on: Option<DateTime<Utc>>,
    ) -> anyhow::Result<String> {
        let signed_start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let signed_expiry = expires_on
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let signed_protocol = if self.account.endpoint.starts_with("https://") {
            "https"
        } else {
            ""
        };
        let canonicalized_resource = format!("/blob/{}/{}/{}", self.account.name, container, blob);

        let string_to_sign = [
            "r",                     // signedPermissions
            signed_start.as_str(),   // signedStart
            signed_expiry.as_str(),  // signedExpiry
            canonicalized_resource.as_str(),
            "",                      // signedIdentifier
            "",                      // signedIP
            signed_protocol,         // signedProtocol
            SAS_VERSION,             // signedVersion
            "b",                     // signedResource
            "",                      // signedSnapshotTime
            "",                      // signedEncryptionScope
            "",                      // rscc
            "",                      // rscd
            "",                      // rsce
            "",                      // rscl
            "",                      // rsct
        ]
        .join("\n");
        let signature = self.hmac_base64(&string_to_sign)?;

        let encode = |v: &str| utf8_percent_encode(v, &QUERY_ENCODE_SET).to_string();
        let mut query = format!("sv={}&st={}", SAS_VERSION, encode(&signed_start));
        if !signed_expiry.is_empty() {
            query.push_str(&format!("&se={}", encode(&signed_expiry)));
        }
        query.push_str("&sr=b&sp=r");
        if !signed_protocol.is_empty() {
            query.push_str(&format!("&spr={}", signed_protocol));
        }
        query.push_str(&format!("&sig={}", encode(&signature)));
        Ok(query)
    }
}

impl BlobBackend for AzureBlobClient {
    fn create_container_if_not_exists<'a>(
        &'a self,
        container: &'a str,
        access: PublicAccess,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move {
            let url = format!("{}?restype=container", self.container_url(container));
            let mut headers = Vec::new();
            if let Some(level) = access.header_value() {
                headers.push(("x-ms-blob-public-access".to_string(), level.to_string()));
            }

            debug!("Azure create container: {} access={:?}", container, access);

            let resp = self.send(Method::PUT, &url, headers, Some(Bytes::new())).await?;
            if resp.status().is_success() {
                return Ok(true);
            }
            if resp.status() == StatusCode::CONFLICT {
                let err = Self::error_from("create_container", resp).await;
                if err.code == "ContainerAlreadyExists" {
                    return Ok(false);
                }
                return Err(err.into());
            }
            Err(Self::error_from("create_container", resp).await.into())
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
            let headers = Self::blob_headers(settings, metadata);
            let upload_id = Uuid::new_v4().to_string();
            let mut buf = BytesMut::new();
            let mut block_ids: Vec<String> = Vec::new();
            let mut total: u64 = 0;

            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| anyhow::anyhow!("Reading upload stream failed: {}", e))?;
                total += chunk.len() as u64;
                buf.extend_from_slice(&chunk);

                while buf.len() >= self.block_size {
                    let block = buf.split_to(self.block_size).freeze();
                    let id = Self::block_id(&upload_id, block_ids.len());
                    self.put_block(container, blob, &id, block).await?;
                    block_ids.push(id);
                }
            }

            if block_ids.is_empty() {
                debug!("Azure put blob: container={} blob={} size={}", container, blob, total);
                self.put_blob(container, blob, buf.freeze(), headers).await?;
            } else {
                if !buf.is_empty() {
                    let id = Self::block_id(&upload_id, block_ids.len());
                    self.put_block(container, blob, &id, buf.freeze()).await?;
                    block_ids.push(id);
                }
                debug!(
                    "Azure put block list: container={} blob={} blocks={} size={}",
                    container,
                    blob,
                    block_ids.len(),
                    total
                );
                self.put_block_list(container, blob, &block_ids, headers)
                    .await?;
            }

            Ok(total)
        })
    }

    fn get_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<BlobProperties>> {
        Box::pin(async move {
            let resp = self
                .send(Method::HEAD, &self.blob_url(container, blob), Vec::new(), None)
                .await?;
            if !resp.status().is_success() {
                return Err(Self::error_from("get_properties", resp).await.into());
            }
            Ok(Self::properties_from_headers(resp.headers()))
        })
    }

    fn generate_sas_url<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        expires_on: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let start = Utc::now() - chrono::Duration::minutes(SAS_START_SKEW_MINUTES);
            let query = self.sas_query(container, blob, start, expires_on)?;
            Ok(format!("{}?{}", self.blob_url(container, blob), query))
        })
    }

    fn delete_if_exists<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move {
            debug!("Azure delete: container={} blob={}", container, blob);

            let resp = self
                .send(Method::DELETE, &self.blob_url(container, blob), Vec::new(), None)
                .await?;
            if resp.status().is_success() {
                return Ok(true);
            }
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(false);
            }
            Err(Self::error_from("delete", resp).await.into())
        })
    }
}

// -- Tests -------------------------------------------------------------------

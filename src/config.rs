//! Configuration loading and types for the upload host.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Every section is optional and defaulted, so an empty
//! file is a valid configuration (credentials may still come from the
//! `AZURE_STORAGE_*` environment variables).

use serde::Deserialize;
use std::path::Path;

use crate::file::{ContentSettings, Metadata};
use crate::options::{ContainerAccessLevel, EngineOptions, UrlExpiration};
use crate::resolver::Resolver;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Blob storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum multipart request body in bytes (default 100 MiB).
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `azure` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Azure Storage connection string. Takes precedence over the
    /// account name and key.
    #[serde(default)]
    pub connection_string: Option<String>,

    /// Storage account name.
    #[serde(default)]
    pub account_name: Option<String>,

    /// Storage account access key (base64).
    #[serde(default)]
    pub access_key: Option<String>,

    /// Container every upload is stored in.
    #[serde(default)]
    pub container: Option<String>,

    /// Anonymous access level for auto-created containers:
    /// `private`, `blob` or `container`.
    #[serde(default)]
    pub container_access_level: ContainerAccessLevel,

    /// Create the container on first use.
    #[serde(default = "default_true")]
    pub auto_create_container: bool,

    /// Signed URL lifetime: minutes, or `false` for no expiry.
    #[serde(default)]
    pub url_expiration: UrlExpiration,

    /// Block size for staged uploads in bytes.
    #[serde(default)]
    pub block_size: Option<usize>,

    /// Metadata attached to every blob.
    #[serde(default)]
    pub metadata: Option<Metadata>,

    /// Content settings applied to every blob instead of the defaults.
    #[serde(default)]
    pub content_settings: Option<ContentSettings>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            connection_string: None,
            account_name: None,
            access_key: None,
            container: None,
            container_access_level: ContainerAccessLevel::default(),
            auto_create_container: true,
            url_expiration: UrlExpiration::default(),
            block_size: None,
            metadata: None,
            content_settings: None,
        }
    }
}

impl StorageConfig {
    /// Engine options for this configuration. Static values are lifted
    /// into resolvers.
    pub fn engine_options(&self) -> EngineOptions {
        let mut options = EngineOptions::new()
            .container_access_level(self.container_access_level)
            .auto_create_container(self.auto_create_container)
            .url_expiration(self.url_expiration);

        options.connection_string = self.connection_string.clone();
        options.account_name = self.account_name.clone();
        options.access_key = self.access_key.clone();

        if let Some(container) = &self.container {
            options = options.container_name(container.as_str());
        }
        if let Some(block_size) = self.block_size {
            options = options.block_size(block_size);
        }
        if let Some(metadata) = &self.metadata {
            options = options.metadata(Resolver::value(metadata.clone()));
        }
        if let Some(settings) = &self.content_settings {
            options = options.content_settings(Resolver::value(settings.clone()));
        }
        options
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9013
}

fn default_storage_backend() -> String {
    "azure".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_upload_size() -> usize {
    100 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FileInfo, UploadRequest};
    use std::io::Write;
    use std::num::NonZeroU32;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let file = write_config("{}\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9013);
        assert_eq!(config.server.max_upload_size, 100 * 1024 * 1024);
        assert_eq!(config.storage.backend, "azure");
        assert!(config.storage.auto_create_container);
        assert_eq!(config.storage.url_expiration, UrlExpiration::Default);
        assert_eq!(
            config.storage.container_access_level,
            ContainerAccessLevel::Private
        );
        assert!(config.observability.metrics);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_full_storage_section() {
        let file = write_config(
            r#"
server:
  port: 8080
logging:
  level: debug
  format: json
storage:
  backend: memory
  connection_string: "UseDevelopmentStorage=true"
  container: uploads
  container_access_level: blob
  auto_create_container: false
  url_expiration: 15
  block_size: 1048576
  metadata:
    source: upload-host
  content_settings:
    cacheControl: "max-age=3600"
"#,
        );
        let config = load_config(file.path()).unwrap();
        let storage = &config.storage;
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.format, "json");
        assert_eq!(storage.backend, "memory");
        assert_eq!(storage.container.as_deref(), Some("uploads"));
        assert_eq!(storage.container_access_level, ContainerAccessLevel::Blob);
        assert!(!storage.auto_create_container);
        assert_eq!(
            storage.url_expiration,
            UrlExpiration::Minutes(NonZeroU32::new(15).unwrap())
        );
        assert_eq!(storage.block_size, Some(1_048_576));
        assert_eq!(
            storage.metadata.as_ref().unwrap().get("source").map(String::as_str),
            Some("upload-host")
        );
        assert_eq!(
            storage.content_settings.as_ref().unwrap().cache_control.as_deref(),
            Some("max-age=3600")
        );
    }

    #[test]
    fn test_url_expiration_false_disables() {
        let file = write_config("storage:\n  url_expiration: false\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.storage.url_expiration, UrlExpiration::Disabled);
    }

    #[test]
    fn test_url_expiration_zero_is_default() {
        let file = write_config("storage:\n  url_expiration: 0\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.storage.url_expiration, UrlExpiration::Default);
    }

    #[test]
    fn test_invalid_access_level_rejected() {
        let file = write_config("storage:\n  container_access_level: public\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_config("/nonexistent/azure-upload.yaml").is_err());
    }

    #[tokio::test]
    async fn test_engine_options_lift_static_values() {
        let storage = StorageConfig {
            account_name: Some("acct".to_string()),
            access_key: Some("a2V5".to_string()),
            container: Some("uploads".to_string()),
            block_size: Some(1024),
            metadata: Some(Metadata::from([("k".to_string(), "v".to_string())])),
            ..StorageConfig::default()
        };
        let options = storage.engine_options();
        let req = UploadRequest::default();
        let file = FileInfo::new("f", "a.txt", "text/plain");

        let container = options.container_name.as_ref().unwrap();
        assert_eq!(container.resolve(&req, &file).await.unwrap(), "uploads");
        let metadata = options.metadata.as_ref().unwrap();
        assert_eq!(
            metadata.resolve(&req, &file).await.unwrap().get("k").map(String::as_str),
            Some("v")
        );
        assert!(options.content_settings.is_none());
        assert!(options.blob_name.is_none());
        assert_eq!(options.block_size, Some(1024));
        assert_eq!(options.auto_create_container, Some(true));
        assert_eq!(options.account_name.as_deref(), Some("acct"));
    }

    #[test]
    fn test_engine_options_without_container() {
        let options = StorageConfig::default().engine_options();
        assert!(options.container_name.is_none());
    }
}

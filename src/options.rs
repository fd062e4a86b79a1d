//! Construction-time options for the storage engine.
//!
//! [`EngineOptions`] collects everything the engine needs once, at build
//! time. Credentials may fall back to the process environment, but the
//! environment is only read by [`EnvCredentials::from_env`]; everything
//! else takes explicit values so it can be tested without touching
//! globals.

use std::num::NonZeroU32;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::errors::EngineError;
use crate::file::{ContentSettings, Metadata};
use crate::resolver::Resolver;
use crate::storage::backend::PublicAccess;

/// Connection-string environment variable.
pub const ENV_CONNECTION_STRING: &str = "AZURE_STORAGE_CONNECTION_STRING";
/// Account access-key environment variable.
pub const ENV_ACCESS_KEY: &str = "AZURE_STORAGE_ACCESS_KEY";
/// Account name environment variable.
pub const ENV_ACCOUNT: &str = "AZURE_STORAGE_ACCOUNT";

/// Default block size for streamed uploads (4 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Public access level for containers the engine creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAccessLevel {
    /// No anonymous access.
    #[default]
    Private,
    /// Anonymous read access to blobs only.
    Blob,
    /// Anonymous read access to blobs and container listing.
    Container,
}

impl ContainerAccessLevel {
    pub fn public_access(self) -> PublicAccess {
        match self {
            ContainerAccessLevel::Private => PublicAccess::None,
            ContainerAccessLevel::Blob => PublicAccess::Blob,
            ContainerAccessLevel::Container => PublicAccess::Container,
        }
    }
}

/// Lifetime of the signed read URL returned with each upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "RawUrlExpiration")]
pub enum UrlExpiration {
    /// [`UrlExpiration::DEFAULT_MINUTES`] minutes.
    #[default]
    Default,
    /// The URL never expires.
    Disabled,
    Minutes(NonZeroU32),
}

impl UrlExpiration {
    pub const DEFAULT_MINUTES: u32 = 60;

    /// Non-positive values fall back to [`UrlExpiration::Default`].
    pub fn from_minutes(minutes: i64) -> Self {
        u32::try_from(minutes)
            .ok()
            .and_then(NonZeroU32::new)
            .map_or(UrlExpiration::Default, UrlExpiration::Minutes)
    }

    /// Effective lifetime, `None` when disabled.
    pub fn duration(self) -> Option<Duration> {
        match self {
            UrlExpiration::Default => Some(Duration::minutes(i64::from(Self::DEFAULT_MINUTES))),
            UrlExpiration::Disabled => None,
            UrlExpiration::Minutes(n) => Some(Duration::minutes(i64::from(n.get()))),
        }
    }

    pub fn expires_on(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration().map(|d| now + d)
    }
}

/// YAML shape: `false` disables expiry, `true` keeps the default, a
/// number is minutes.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawUrlExpiration {
    Flag(bool),
    Minutes(i64),
}

impl From<RawUrlExpiration> for UrlExpiration {
    fn from(raw: RawUrlExpiration) -> Self {
        match raw {
            RawUrlExpiration::Flag(false) => UrlExpiration::Disabled,
            RawUrlExpiration::Flag(true) => UrlExpiration::Default,
            RawUrlExpiration::Minutes(n) => UrlExpiration::from_minutes(n),
        }
    }
}

/// Storage account credentials the engine was built with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    ConnectionString(String),
    SharedKey { account: String, key: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ConnectionString(_) => f.write_str("ConnectionString(..)"),
            Credentials::SharedKey { account, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .finish_non_exhaustive(),
        }
    }
}

/// Credential values read from the environment, once, at the
/// construction boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvCredentials {
    pub connection_string: Option<String>,
    pub account: Option<String>,
    pub access_key: Option<String>,
}

impl EnvCredentials {
    pub fn from_env() -> Self {
        Self {
            connection_string: non_empty_env(ENV_CONNECTION_STRING),
            account: non_empty_env(ENV_ACCOUNT),
            access_key: non_empty_env(ENV_ACCESS_KEY),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Options for building an [`AzureBlobEngine`](crate::engine::AzureBlobEngine).
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub connection_string: Option<String>,
    pub account_name: Option<String>,
    pub access_key: Option<String>,
    pub container_name: Option<Resolver<String>>,
    pub container_access_level: ContainerAccessLevel,
    /// `None` means the default (`true`).
    pub auto_create_container: Option<bool>,
    /// `None` means [`default_blob_name`](crate::resolver::default_blob_name).
    ///
    /// Removal of a file rebuilt from a descriptor deletes the container and
    /// blob the descriptor names; the resolver only runs for files that
    /// carry no names. A resolver that generates fresh names must therefore
    /// not be relied on to find a blob again from bare file fields.
    pub blob_name: Option<Resolver<String>>,
    pub metadata: Option<Resolver<Metadata>>,
    pub content_settings: Option<Resolver<ContentSettings>>,
    pub url_expiration: UrlExpiration,
    /// `None` means [`DEFAULT_BLOCK_SIZE`].
    pub block_size: Option<usize>,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_string(mut self, value: impl Into<String>) -> Self {
        self.connection_string = Some(value.into());
        self
    }

    pub fn account(mut self, name: impl Into<String>, access_key: impl Into<String>) -> Self {
        self.account_name = Some(name.into());
        self.access_key = Some(access_key.into());
        self
    }

    pub fn container_name(mut self, resolver: impl Into<Resolver<String>>) -> Self {
        self.container_name = Some(resolver.into());
        self
    }

    pub fn container_access_level(mut self, level: ContainerAccessLevel) -> Self {
        self.container_access_level = level;
        self
    }

    pub fn auto_create_container(mut self, enabled: bool) -> Self {
        self.auto_create_container = Some(enabled);
        self
    }

    pub fn blob_name(mut self, resolver: impl Into<Resolver<String>>) -> Self {
        self.blob_name = Some(resolver.into());
        self
    }

    pub fn metadata(mut self, resolver: Resolver<Metadata>) -> Self {
        self.metadata = Some(resolver);
        self
    }

    pub fn content_settings(mut self, resolver: Resolver<ContentSettings>) -> Self {
        self.content_settings = Some(resolver);
        self
    }

    pub fn url_expiration(mut self, expiration: UrlExpiration) -> Self {
        self.url_expiration = expiration;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = Some(bytes);
        self
    }

    /// Pick credentials from the options, falling back to `env`.
    ///
    /// A connection string (explicit, then environment) wins. Otherwise
    /// the account name and key are each taken explicitly or from the
    /// environment and must both be present.
    pub fn resolve_credentials(&self, env: &EnvCredentials) -> Result<Credentials, EngineError> {
        let explicit = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());

        if let Some(cs) = explicit(&self.connection_string).or_else(|| env.connection_string.clone())
        {
            return Ok(Credentials::ConnectionString(cs));
        }

        let account = explicit(&self.account_name).or_else(|| env.account.clone());
        let key = explicit(&self.access_key).or_else(|| env.access_key.clone());
        match (account, key) {
            (Some(account), Some(key)) => Ok(Credentials::SharedKey { account, key }),
            _ => Err(EngineError::configuration(format!(
                "missing storage credentials: provide a connection string or an account name and \
                 access key (or set {ENV_CONNECTION_STRING}, or {ENV_ACCOUNT} and {ENV_ACCESS_KEY})"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_mapping() {
        assert_eq!(
            ContainerAccessLevel::Private.public_access(),
            PublicAccess::None
        );
        assert_eq!(ContainerAccessLevel::Blob.public_access(), PublicAccess::Blob);
        assert_eq!(
            ContainerAccessLevel::Container.public_access(),
            PublicAccess::Container
        );
        assert_eq!(ContainerAccessLevel::default(), ContainerAccessLevel::Private);
    }

    #[test]
    fn test_url_expiration_from_minutes() {
        assert_eq!(UrlExpiration::from_minutes(0), UrlExpiration::Default);
        assert_eq!(UrlExpiration::from_minutes(-5), UrlExpiration::Default);
        assert_eq!(
            UrlExpiration::from_minutes(15),
            UrlExpiration::Minutes(NonZeroU32::new(15).unwrap())
        );
    }

    #[test]
    fn test_url_expiration_durations() {
        assert_eq!(UrlExpiration::Default.duration(), Some(Duration::minutes(60)));
        assert_eq!(UrlExpiration::Disabled.duration(), None);
        assert_eq!(
            UrlExpiration::from_minutes(5).duration(),
            Some(Duration::minutes(5))
        );
    }

    #[test]
    fn test_url_expiration_expires_on() {
        let now = Utc::now();
        assert_eq!(UrlExpiration::Disabled.expires_on(now), None);
        assert_eq!(
            UrlExpiration::from_minutes(30).expires_on(now),
            Some(now + Duration::minutes(30))
        );
    }

    #[test]
    fn test_url_expiration_yaml() {
        let off: UrlExpiration = serde_yaml::from_str("false").unwrap();
        assert_eq!(off, UrlExpiration::Disabled);
        let on: UrlExpiration = serde_yaml::from_str("true").unwrap();
        assert_eq!(on, UrlExpiration::Default);
        let ten: UrlExpiration = serde_yaml::from_str("10").unwrap();
        assert_eq!(ten, UrlExpiration::from_minutes(10));
        let neg: UrlExpiration = serde_yaml::from_str("-1").unwrap();
        assert_eq!(neg, UrlExpiration::Default);
    }

    #[test]
    fn test_credentials_explicit_connection_string() {
        let opts = EngineOptions::new().connection_string("UseDevelopmentStorage=true");
        let creds = opts.resolve_credentials(&EnvCredentials::default()).unwrap();
        assert_eq!(
            creds,
            Credentials::ConnectionString("UseDevelopmentStorage=true".into())
        );
    }

    #[test]
    fn test_credentials_env_connection_string() {
        let env = EnvCredentials {
            connection_string: Some("UseDevelopmentStorage=true".into()),
            ..Default::default()
        };
        let creds = EngineOptions::new().resolve_credentials(&env).unwrap();
        assert!(matches!(creds, Credentials::ConnectionString(_)));
    }

    #[test]
    fn test_credentials_connection_string_beats_account() {
        let env = EnvCredentials {
            connection_string: Some("UseDevelopmentStorage=true".into()),
            ..Default::default()
        };
        let opts = EngineOptions::new().account("acct", "a2V5");
        let creds = opts.resolve_credentials(&env).unwrap();
        assert!(matches!(creds, Credentials::ConnectionString(_)));
    }

    #[test]
    fn test_credentials_account_key_pair() {
        let opts = EngineOptions::new().account("acct", "a2V5");
        let creds = opts.resolve_credentials(&EnvCredentials::default()).unwrap();
        assert_eq!(
            creds,
            Credentials::SharedKey {
                account: "acct".into(),
                key: "a2V5".into()
            }
        );
    }

    #[test]
    fn test_credentials_pair_mixed_with_env() {
        let mut opts = EngineOptions::new();
        opts.account_name = Some("acct".into());
        let env = EnvCredentials {
            access_key: Some("a2V5".into()),
            ..Default::default()
        };
        let creds = opts.resolve_credentials(&env).unwrap();
        assert!(matches!(creds, Credentials::SharedKey { .. }));
    }

    #[test]
    fn test_credentials_missing() {
        let err = EngineOptions::new()
            .resolve_credentials(&EnvCredentials::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_credentials_incomplete_pair() {
        let mut opts = EngineOptions::new();
        opts.account_name = Some("acct".into());
        let err = opts
            .resolve_credentials(&EnvCredentials::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_empty_strings_do_not_count() {
        let opts = EngineOptions::new().connection_string("").account("", "");
        let err = opts
            .resolve_credentials(&EnvCredentials::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials::SharedKey {
            account: "acct".into(),
            key: "c2VjcmV0".into(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("acct"));
        assert!(!shown.contains("c2VjcmV0"));
    }
}

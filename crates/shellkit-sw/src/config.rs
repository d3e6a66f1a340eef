//! Worker configuration.
//!
//! [`WorkerConfig`] is the serialized form operators write by hand.
//! [`WorkerConfig::resolve`] validates it and produces the immutable
//! [`ResolvedConfig`] shared by the lifecycle manager and the router.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cache_version must not be empty")]
    EmptyVersion,

    #[error("api_prefix must start with '/' and name a path segment, got '{0}'")]
    InvalidApiPrefix(String),

    #[error("{field} must be an http(s) URL, got '{url}'")]
    UnsupportedScheme { field: &'static str, url: String },

    #[error("Invalid precache entry '{entry}': {reason}")]
    InvalidPrecacheEntry { entry: String, reason: String },
}

/// What to do when one precache asset cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Any failure aborts the install; the new generation is discarded.
    #[default]
    Strict,
    /// Failures are logged and skipped.
    BestEffort,
}

/// Serialized worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// The one URL the application shell is always loaded from.
    pub canonical_url: Url,

    /// Origin (and path) the worker itself is served from.
    pub scope: Url,

    /// Label of the cache generation this worker installs.
    pub cache_version: String,

    /// Assets fetched at install. Relative entries resolve against
    /// `canonical_url`.
    #[serde(default)]
    pub precache: Vec<String>,

    /// Requests whose path starts with this prefix always go to the network.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    #[serde(default)]
    pub install_policy: InstallPolicy,

    /// Store the live response of a cache-first miss.
    #[serde(default)]
    pub cache_on_miss: bool,

    /// Attempts per precache asset.
    #[serde(default = "default_precache_attempts")]
    pub precache_attempts: u32,
}

fn default_api_prefix() -> String {
    "/api/".to_string()
}

fn default_precache_attempts() -> u32 {
    1
}

impl WorkerConfig {
    /// Create a configuration with defaults for everything but the
    /// identities.
    pub fn new(canonical_url: Url, scope: Url, cache_version: impl Into<String>) -> Self {
        Self {
            canonical_url,
            scope,
            cache_version: cache_version.into(),
            precache: Vec::new(),
            api_prefix: default_api_prefix(),
            install_policy: InstallPolicy::default(),
            cache_on_miss: false,
            precache_attempts: default_precache_attempts(),
        }
    }

    pub fn with_precache<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = entries.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn with_install_policy(mut self, policy: InstallPolicy) -> Self {
        self.install_policy = policy;
        self
    }

    pub fn with_cache_on_miss(mut self, enabled: bool) -> Self {
        self.cache_on_miss = enabled;
        self
    }

    /// Parse from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Validate and resolve into the runtime form.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let cache_version = self.cache_version.trim();
        if cache_version.is_empty() {
            return Err(ConfigError::EmptyVersion);
        }

        check_scheme("canonical_url", &self.canonical_url)?;
        check_scheme("scope", &self.scope)?;

        let api_prefix = self.api_prefix.trim_end_matches('/');
        if !self.api_prefix.starts_with('/') || api_prefix.is_empty() {
            return Err(ConfigError::InvalidApiPrefix(self.api_prefix.clone()));
        }

        let mut precache: Vec<Url> = Vec::with_capacity(self.precache.len());
        for entry in &self.precache {
            let url = self.canonical_url.join(entry).map_err(|e| {
                ConfigError::InvalidPrecacheEntry {
                    entry: entry.clone(),
                    reason: e.to_string(),
                }
            })?;
            check_scheme("precache entry", &url).map_err(|_| ConfigError::InvalidPrecacheEntry {
                entry: entry.clone(),
                reason: "not an http(s) URL".to_string(),
            })?;
            if !precache.contains(&url) {
                precache.push(url);
            }
        }

        if !precache.contains(&self.canonical_url) {
            warn!(
                canonical_url = %self.canonical_url,
                "Canonical URL is not precached; offline navigations will fail"
            );
        }

        Ok(ResolvedConfig {
            canonical_url: self.canonical_url.clone(),
            scope: self.scope.clone(),
            cache_version: cache_version.to_string(),
            precache,
            api_prefix: api_prefix.to_string(),
            install_policy: self.install_policy,
            cache_on_miss: self.cache_on_miss,
            precache_attempts: self.precache_attempts.max(1),
        })
    }
}

fn check_scheme(field: &'static str, url: &Url) -> Result<(), ConfigError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(ConfigError::UnsupportedScheme {
            field,
            url: url.to_string(),
        }),
    }
}

/// Validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub canonical_url: Url,
    pub scope: Url,
    pub cache_version: String,
    /// Absolute, de-duplicated, in declaration order.
    pub precache: Vec<Url>,
    /// Without trailing slash.
    pub api_prefix: String,
    pub install_policy: InstallPolicy,
    pub cache_on_miss: bool,
    pub precache_attempts: u32,
}

impl ResolvedConfig {
    /// Does `path` fall under the API prefix? Matches whole segments only.
    pub fn is_api_path(&self, path: &str) -> bool {
        match path.strip_prefix(self.api_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Is `url` served by the same origin as the worker?
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin()
    }

    /// Is `url` exactly one of the precache entries?
    pub fn is_precached(&self, url: &Url) -> bool {
        self.precache.iter().any(|p| p == url)
    }
}

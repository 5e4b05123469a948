//! Registry client: fetches the catalog of installable plugins and caches
//! it for a fixed TTL.
//!
//! Fetching never fails from the caller's point of view. When the index
//! cannot be reached the last successful catalog is served, however old;
//! with no prior success the catalog is empty.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};

/// Default time a fetched catalog stays fresh.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Catalog keyed by plugin name.
pub type Catalog = BTreeMap<String, RegistryEntry>;

/// One installable plugin as listed in the registry index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Plugin name. Filled from the index key when omitted.
    #[serde(default)]
    pub name: String,
    /// Short description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Source repository URL, for display.
    #[serde(default)]
    pub repository: String,
    /// Managed package reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npm: Option<NpmRef>,
    /// Source repository reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitRef>,
}

/// A package in the managed package registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpmRef {
    /// Package name.
    pub repo: String,
    /// Version hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A clonable source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRef {
    /// Clone URL.
    pub repo: String,
    /// Branch to check out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Tag to check out when no branch is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl GitRef {
    /// The ref to check out: branch, else version.
    #[must_use]
    pub fn checkout_ref(&self) -> Option<&str> {
        self.branch.as_deref().or(self.version.as_deref())
    }
}

/// Parse an index document, filling missing entry names from their keys.
///
/// # Errors
///
/// Returns [`PluginError::RegistryError`] if the body is not a JSON object
/// of registry entries.
pub fn parse_index(body: &str) -> PluginResult<Catalog> {
    let mut catalog: Catalog =
        serde_json::from_str(body).map_err(|e| PluginError::RegistryError {
            message: format!("invalid registry index: {e}"),
        })?;
    for (key, entry) in &mut catalog {
        if entry.name.is_empty() {
            entry.name.clone_from(key);
        }
    }
    Ok(catalog)
}

/// Source of the raw registry index.
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// Fetch the full catalog.
    async fn fetch(&self) -> PluginResult<Catalog>;
}

/// Fetches the index over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCatalogFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpCatalogFetcher {
    /// Build a fetcher for `url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::RegistryError`] if the HTTP client cannot be
    /// constructed.
    pub fn new(url: impl Into<String>, timeout: Duration) -> PluginResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hotplug/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| PluginError::RegistryError {
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CatalogFetcher for HttpCatalogFetcher {
    async fn fetch(&self) -> PluginResult<Catalog> {
        debug!(url = %self.url, "Fetching registry index");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PluginError::RegistryError {
                message: format!("registry fetch failed: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(PluginError::RegistryError {
                message: format!("registry returned {}: {}", response.status(), self.url),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| PluginError::RegistryError {
                message: format!("failed to read registry response: {e}"),
            })?;
        parse_index(&body)
    }
}

/// Single-slot catalog cache with a TTL.
#[derive(Debug)]
pub struct RegistryCache {
    ttl: Duration,
    slot: Option<(Catalog, Instant)>,
}

impl RegistryCache {
    /// An empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, slot: None }
    }

    /// The cached catalog, regardless of age.
    #[must_use]
    pub fn get(&self) -> Option<&Catalog> {
        self.slot.as_ref().map(|(catalog, _)| catalog)
    }

    /// Whether a catalog is cached and younger than the TTL.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|(_, fetched_at)| fetched_at.elapsed() < self.ttl)
    }

    /// Replace the cached catalog.
    pub fn store(&mut self, catalog: Catalog) {
        self.slot = Some((catalog, Instant::now()));
    }

    /// Drop the cached catalog.
    pub fn reset(&mut self) {
        self.slot = None;
    }
}

/// Registry client owning its cache.
pub struct CatalogClient {
    fetcher: Box<dyn CatalogFetcher>,
    cache: Mutex<RegistryCache>,
}

impl CatalogClient {
    /// Create a client with the given cache TTL.
    #[must_use]
    pub fn new(fetcher: Box<dyn CatalogFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(RegistryCache::new(ttl)),
        }
    }

    /// Current catalog, fetching when the cache is empty or expired.
    ///
    /// Concurrent callers wait for a single in-flight fetch.
    pub async fn fetch_catalog(&self) -> Catalog {
        let mut cache = self.cache.lock().await;
        if cache.is_fresh()
            && let Some(catalog) = cache.get()
        {
            return catalog.clone();
        }

        match self.fetcher.fetch().await {
            Ok(catalog) => {
                info!(entries = catalog.len(), "Fetched plugin registry");
                cache.store(catalog.clone());
                catalog
            },
            Err(e) => {
                if let Some(stale) = cache.get() {
                    warn!(error = %e, entries = stale.len(), "Registry fetch failed, serving stale catalog");
                    stale.clone()
                } else {
                    warn!(error = %e, "Registry fetch failed with no cached catalog");
                    Catalog::new()
                }
            },
        }
    }

    /// Look up one entry.
    pub async fn lookup(&self, name: &str) -> Option<RegistryEntry> {
        self.fetch_catalog().await.remove(name)
    }

    /// Forget the cached catalog.
    pub async fn reset_cache(&self) {
        self.cache.lock().await.reset();
    }
}

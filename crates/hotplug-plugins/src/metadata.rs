//! Reads an installed artifact's `package.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;

/// Manifest file at the root of every installed artifact.
pub const MANIFEST_FILE_NAME: &str = "package.json";

/// Maximum manifest size (1 MB).
const MAX_MANIFEST_SIZE: usize = 1_048_576;

/// The subset of `package.json` the lifecycle manager reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Package name.
    pub name: String,
    /// Package version.
    #[serde(default)]
    pub version: String,
    /// Entry point relative to the artifact root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Extension block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotplug: Option<HotplugSection>,
}

/// The `hotplug` block of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotplugSection {
    /// Configuration variables the plugin needs before it can load.
    #[serde(default)]
    pub required_env_vars: Vec<RequiredEnvVar>,
}

/// One required configuration variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredEnvVar {
    /// Variable name.
    pub name: String,
    /// What it is for.
    #[serde(default)]
    pub description: String,
    /// Whether the value is secret.
    #[serde(default)]
    pub sensitive: bool,
}

impl PackageManifest {
    /// Entry point path relative to the root (`.` when unset).
    #[must_use]
    pub fn entry_point(&self) -> &str {
        self.main.as_deref().unwrap_or(".")
    }

    /// Declared required variables.
    #[must_use]
    pub fn required_env_vars(&self) -> &[RequiredEnvVar] {
        self.hotplug
            .as_ref()
            .map(|h| h.required_env_vars.as_slice())
            .unwrap_or_default()
    }
}

/// What the installer needs to know about an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledMetadata {
    /// Declared name.
    pub name: String,
    /// Declared version.
    pub version: String,
    /// Names of required configuration variables.
    pub required_config_vars: Vec<String>,
}

impl From<&PackageManifest> for InstalledMetadata {
    fn from(manifest: &PackageManifest) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            required_config_vars: manifest
                .required_env_vars()
                .iter()
                .map(|v| v.name.clone())
                .collect(),
        }
    }
}

/// Path of the manifest under an artifact root.
#[must_use]
pub fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE_NAME)
}

/// Read and parse the manifest under `root`.
///
/// # Errors
///
/// Returns [`PluginError::ManifestParseError`] if the file is missing,
/// oversized, not valid JSON or has an empty name.
pub async fn read_manifest(root: &Path) -> PluginResult<PackageManifest> {
    let path = manifest_path(root);
    let content =
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PluginError::ManifestParseError {
                path: path.clone(),
                message: format!("failed to read manifest: {e}"),
            })?;

    if content.len() > MAX_MANIFEST_SIZE {
        return Err(PluginError::ManifestParseError {
            path,
            message: format!(
                "manifest is {} bytes, exceeding the {MAX_MANIFEST_SIZE} byte limit",
                content.len()
            ),
        });
    }

    let manifest: PackageManifest =
        serde_json::from_str(&content).map_err(|e| PluginError::ManifestParseError {
            path: path.clone(),
            message: e.to_string(),
        })?;

    if manifest.name.trim().is_empty() {
        return Err(PluginError::ManifestParseError {
            path,
            message: "manifest name must not be empty".into(),
        });
    }

    debug!(path = %path.display(), name = %manifest.name, "Read plugin manifest");
    Ok(manifest)
}

/// Read the name, version and required variables of an artifact.
///
/// # Errors
///
/// See [`read_manifest`].
pub async fn read_metadata(root: &Path) -> PluginResult<InstalledMetadata> {
    read_manifest(root).await.map(|m| InstalledMetadata::from(&m))
}

/// Required variables the host has no non-empty value for, in declaration
/// order.
#[must_use]
pub fn missing_config_vars(required: &[String], host: &dyn PluginHost) -> Vec<String> {
    required
        .iter()
        .filter(|name| host.setting(name).is_none_or(|v| v.is_empty()))
        .cloned()
        .collect()
}

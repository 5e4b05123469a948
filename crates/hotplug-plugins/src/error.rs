//! Plugin lifecycle error types.

use std::path::PathBuf;

use crate::plugin::{PluginId, PluginStatus};

/// Errors from plugin lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// No plugin record exists for this id.
    #[error("plugin not found: {0}")]
    NotFound(PluginId),

    /// A plugin with this id is already registered.
    #[error("plugin already registered: {0}")]
    AlreadyRegistered(PluginId),

    /// The requested transition is not legal from the current status.
    #[error("cannot {operation} plugin {plugin_id} from status {status}")]
    InvalidState {
        /// The rejected operation (`load`, `uninstall`).
        operation: &'static str,
        /// The plugin whose transition was rejected.
        plugin_id: PluginId,
        /// Status the plugin was in.
        status: PluginStatus,
    },

    /// The record has no plugin descriptor to load.
    #[error("plugin {0} has no loaded instance")]
    MissingInstance(PluginId),

    /// The plugin was present at host startup and cannot be unloaded.
    #[error("plugin {0} was present at startup and cannot be unloaded")]
    ProtectedPlugin(PluginId),

    /// The registry entry declares neither a package nor a repository.
    #[error("no installation method available for plugin {0}")]
    NoInstallMethod(String),

    /// An external install step failed. Displays the underlying message
    /// unchanged.
    #[error("{0}")]
    InstallFailed(String),

    /// The local bundle path does not exist.
    #[error("bundle not found: {}", .0.display())]
    BundleNotFound(PathBuf),

    /// The local bundle is not a directory (archives are not supported).
    #[error("unsupported bundle format: {} (only directory bundles are supported)", .0.display())]
    UnsupportedBundleFormat(PathBuf),

    /// The entry point did not yield a valid plugin.
    #[error("module load failed for {}: {message}", .path.display())]
    ModuleLoadFailed {
        /// Artifact root that was loaded.
        path: PathBuf,
        /// Failure reason.
        message: String,
    },

    /// An installed plugin still has unset required configuration.
    #[error("plugin {plugin} requires configuration: {}", .missing.join(", "))]
    ConfigurationRequired {
        /// Plugin name.
        plugin: String,
        /// Required variables that are not set.
        missing: Vec<String>,
    },

    /// No installed artifact is known under this name.
    #[error("plugin not installed: {0}")]
    NotInstalled(String),

    /// Failed to read or parse an artifact manifest.
    #[error("manifest parse error in {}: {message}", .path.display())]
    ManifestParseError {
        /// Path to the manifest file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// Registry index lookup or fetch failure.
    #[error("registry error: {message}")]
    RegistryError {
        /// Description of the registry failure.
        message: String,
    },

    /// The host refused a registry mutation.
    #[error("host error: {0}")]
    HostError(String),

    /// A plugin's init hook or service failed.
    #[error("plugin {plugin} failed: {message}")]
    ExecutionFailed {
        /// Plugin name.
        plugin: String,
        /// Failure reason.
        message: String,
    },

    /// Installed-plugin ledger read/write/parse error.
    #[error("ledger error at {}: {message}", .path.display())]
    LedgerError {
        /// Path to the ledger file.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// The plugin id or name is invalid.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

//! Module loading: turn an installed artifact into a [`PluginDescriptor`].
//!
//! A [`ModuleResolver`] maps an artifact's entry point to the values it
//! exports. The loader then picks the export that has the shape of a
//! plugin, preferring the conventional `default` export.
//!
//! [`StaticModuleResolver`] is the built-in resolver. Plugin code is linked
//! into the host binary and registered under its package name; resolving an
//! artifact runs the matching constructor.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::{PluginError, PluginResult};
use crate::metadata::{self, PackageManifest};
use crate::plugin::PluginDescriptor;

/// Conventional name of the preferred export.
pub const DEFAULT_EXPORT: &str = "default";

/// A value exported by a module.
#[derive(Clone)]
pub enum ExportValue {
    /// A plugin descriptor.
    Plugin(Arc<PluginDescriptor>),
    /// An explicit null export.
    Null,
    /// Any other value, described by its type name.
    Other(String),
}

impl fmt::Debug for ExportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin(p) => f.debug_tuple("Plugin").field(&p.name()).finish(),
            Self::Null => f.write_str("Null"),
            Self::Other(kind) => f.debug_tuple("Other").field(kind).finish(),
        }
    }
}

/// Named exports of a loaded module, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ModuleExports {
    exports: Vec<(String, ExportValue)>,
}

impl ModuleExports {
    /// No exports.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A module whose `default` export is `plugin`.
    #[must_use]
    pub fn with_default(plugin: PluginDescriptor) -> Self {
        Self::new().with_export(DEFAULT_EXPORT, ExportValue::Plugin(Arc::new(plugin)))
    }

    /// Add an export.
    #[must_use]
    pub fn with_export(mut self, name: impl Into<String>, value: ExportValue) -> Self {
        self.exports.push((name.into(), value));
        self
    }

    /// Look up an export by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ExportValue> {
        self.exports.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Export names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.exports.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Pick the plugin export: `default` if it has plugin shape, else the
    /// first export that does.
    #[must_use]
    pub fn select_plugin(&self) -> Option<Arc<PluginDescriptor>> {
        let candidate = |value: &ExportValue| match value {
            ExportValue::Plugin(p) if p.has_capabilities() => Some(Arc::clone(p)),
            _ => None,
        };
        self.get(DEFAULT_EXPORT)
            .and_then(candidate)
            .or_else(|| self.exports.iter().find_map(|(_, v)| candidate(v)))
    }
}

/// Resolves an entry point to its exports.
pub trait ModuleResolver: Send + Sync {
    /// Load the module at `entry` declared by `manifest`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ModuleLoadFailed`] if the module cannot be
    /// loaded.
    fn resolve(&self, entry: &Path, manifest: &PackageManifest) -> PluginResult<ModuleExports>;
}

/// Builds a module's exports.
pub type ModuleFactory = Arc<dyn Fn() -> ModuleExports + Send + Sync>;

/// Resolver over plugin constructors compiled into the host.
#[derive(Default)]
pub struct StaticModuleResolver {
    modules: RwLock<HashMap<String, ModuleFactory>>,
}

impl StaticModuleResolver {
    /// An empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the exports for a package name.
    pub fn register<F>(&self, package: impl Into<String>, factory: F)
    where
        F: Fn() -> ModuleExports + Send + Sync + 'static,
    {
        let package = package.into();
        debug!(package = %package, "Registered module");
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(package, Arc::new(factory));
    }

    /// Register a package whose `default` export is built by `constructor`.
    pub fn register_plugin<F>(&self, package: impl Into<String>, constructor: F)
    where
        F: Fn() -> PluginDescriptor + Send + Sync + 'static,
    {
        self.register(package, move || ModuleExports::with_default(constructor()));
    }

    /// Whether a package is registered.
    #[must_use]
    pub fn contains(&self, package: &str) -> bool {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(package)
    }
}

impl ModuleResolver for StaticModuleResolver {
    fn resolve(&self, entry: &Path, manifest: &PackageManifest) -> PluginResult<ModuleExports> {
        let factory = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&manifest.name)
            .cloned()
            .ok_or_else(|| PluginError::ModuleLoadFailed {
                path: entry.to_path_buf(),
                message: format!("no module registered for package '{}'", manifest.name),
            })?;
        Ok(factory())
    }
}

/// Loads plugin descriptors from installed artifacts.
#[derive(Clone)]
pub struct ModuleLoader {
    resolver: Arc<dyn ModuleResolver>,
}

impl ModuleLoader {
    /// A loader using `resolver`.
    #[must_use]
    pub fn new(resolver: Arc<dyn ModuleResolver>) -> Self {
        Self { resolver }
    }

    /// Load the plugin at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParseError`] if the manifest is
    /// unreadable, and [`PluginError::ModuleLoadFailed`] if the entry point
    /// is missing or exports nothing with plugin shape.
    pub async fn load(&self, root: &Path) -> PluginResult<Arc<PluginDescriptor>> {
        let manifest = metadata::read_manifest(root).await?;
        let entry = entry_path(root, &manifest);

        if !tokio::fs::try_exists(&entry).await? {
            return Err(PluginError::ModuleLoadFailed {
                path: root.to_path_buf(),
                message: format!("entry point {} does not exist", entry.display()),
            });
        }

        let exports = self.resolver.resolve(&entry, &manifest)?;
        let Some(plugin) = exports.select_plugin() else {
            return Err(PluginError::ModuleLoadFailed {
                path: root.to_path_buf(),
                message: format!(
                    "no export has a plugin shape (name plus actions, services, providers, \
                     evaluators or init); inspected [{}]",
                    exports.names().join(", ")
                ),
            });
        };

        info!(plugin = %plugin.name(), entry = %entry.display(), "Loaded plugin module");
        Ok(plugin)
    }
}

fn entry_path(root: &Path, manifest: &PackageManifest) -> PathBuf {
    match manifest.entry_point() {
        "." | "" => root.to_path_buf(),
        main => root.join(main),
    }
}

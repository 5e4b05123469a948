//! Plugin lifecycle manager.
//!
//! Installs plugin artifacts from a remote registry or a local bundle, loads
//! them into typed [`PluginDescriptor`]s, and applies or reverts their
//! components (actions, providers, evaluators, event handlers, services)
//! against a shared [`PluginHost`] without restarting it.
//!
//! Components present on the host when the [`PluginManager`] is built are
//! *originals*: they are never removed, whichever plugin later claims their
//! names. Lifecycle operations serialize per plugin id.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hotplug_plugins::{
//!     MemoryHost, ModuleResolver, PluginHost, PluginManager, StaticModuleResolver,
//! };
//!
//! # async fn example() -> hotplug_plugins::PluginResult<()> {
//! let host: Arc<dyn PluginHost> = Arc::new(MemoryHost::new());
//! let resolver: Arc<dyn ModuleResolver> = Arc::new(StaticModuleResolver::new());
//! let config = hotplug_config::Config::default();
//! let manager = PluginManager::from_config(host, &config, resolver)?;
//!
//! manager.install_plugin_from_registry("weather", None, None).await?;
//! let id = manager.load_installed_plugin("weather").await?;
//! manager.load_plugin(id, false).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod catalog;
pub mod component;
pub mod error;
pub mod host;
pub mod install;
pub mod ledger;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod plugin;
pub mod registrar;
pub mod store;

pub use catalog::{
    Catalog, CatalogClient, CatalogFetcher, GitRef, HttpCatalogFetcher, NpmRef, RegistryCache,
    RegistryEntry,
};
pub use component::{
    Action, ComponentKind, ComponentRegistration, ComponentSet, ComponentSnapshot, EventHandler,
    Evaluator, HandlerId, OriginalComponents, PluginInit, Provider, Service, ServiceFactory,
};
pub use error::{PluginError, PluginResult};
pub use host::{MemoryHost, PluginHost};
pub use install::{
    CommandRunner, CommandSpec, InstallPhase, InstallProgress, Installer, ProgressCallback,
    TokioCommandRunner, sanitize_plugin_name,
};
pub use ledger::{InstallLedger, InstalledPluginRecord, InstalledStatus};
pub use loader::{ExportValue, ModuleExports, ModuleLoader, ModuleResolver, StaticModuleResolver};
pub use manager::{ManagerConfig, PluginManager};
pub use metadata::{InstalledMetadata, PackageManifest};
pub use plugin::{PluginDescriptor, PluginId, PluginRecord, PluginStatus};
pub use registrar::ComponentRegistrar;
pub use store::PluginStore;

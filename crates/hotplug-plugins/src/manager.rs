//! The plugin lifecycle manager.
//!
//! [`PluginManager`] composes the registry client, installer, module loader,
//! state store and registrar into the public lifecycle API. Every load and
//! unload holds the plugin's lock from [`PluginStore::lock`] across all of
//! its awaited steps, so operations on one plugin never interleave while
//! different plugins proceed independently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use hotplug_config::Config;
use hotplug_events::{EventBus, EventMetadata, EventReceiver, PluginEvent};
use tracing::{debug, info, warn};

use crate::catalog::{
    Catalog, CatalogClient, CatalogFetcher, DEFAULT_CACHE_TTL, HttpCatalogFetcher,
};
use crate::component::{ComponentRegistration, ComponentSet, ComponentSnapshot, OriginalComponents};
use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::install::{
    CommandRunner, DEFAULT_INSTALL_TIMEOUT, Installer, ProgressCallback, TokioCommandRunner,
};
use crate::ledger::{InstallLedger, InstalledPluginRecord, InstalledStatus, LEDGER_FILE_NAME};
use crate::loader::{ModuleLoader, ModuleResolver};
use crate::metadata;
use crate::plugin::{PluginDescriptor, PluginId, PluginRecord, PluginStatus};
use crate::registrar::ComponentRegistrar;
use crate::store::PluginStore;

/// Source recorded on every published event.
const EVENT_SOURCE: &str = "hotplug-plugins";

/// Settings the manager needs from the outside world.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory installed artifacts and the ledger live under.
    pub install_root: PathBuf,
    /// Bound on a single install.
    pub install_timeout: Duration,
    /// Package manager binary.
    pub package_manager: String,
    /// Git binary.
    pub git_command: String,
    /// Registry index URL.
    pub registry_url: String,
    /// How long a fetched catalog is served from cache.
    pub cache_ttl: Duration,
    /// Per-request timeout for index fetches.
    pub request_timeout: Duration,
}

impl ManagerConfig {
    /// Defaults with the given install root.
    #[must_use]
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        let registry = hotplug_config::RegistrySection::default();
        Self {
            install_root: install_root.into(),
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            package_manager: "npm".to_owned(),
            git_command: "git".to_owned(),
            registry_url: registry.index_url,
            cache_ttl: DEFAULT_CACHE_TTL,
            request_timeout: Duration::from_secs(registry.request_timeout_secs),
        }
    }

    /// Settings taken from a loaded [`Config`].
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            install_root: config.resolved_install_dir(),
            install_timeout: Duration::from_secs(config.plugins.install_timeout_secs),
            package_manager: config.plugins.package_manager.clone(),
            git_command: config.plugins.git_command.clone(),
            registry_url: config.registry.index_url.clone(),
            cache_ttl: Duration::from_secs(config.registry.cache_ttl_secs),
            request_timeout: Duration::from_secs(config.registry.request_timeout_secs),
        }
    }
}

/// Orchestrates install, load and unload of plugins on one host.
pub struct PluginManager {
    host: Arc<dyn PluginHost>,
    store: PluginStore,
    registrar: ComponentRegistrar,
    originals: Arc<OriginalComponents>,
    catalog: CatalogClient,
    installer: Installer,
    loader: ModuleLoader,
    installed: DashMap<String, InstalledPluginRecord>,
    ledger_path: PathBuf,
    events: EventBus,
}

impl PluginManager {
    /// Build a manager over `host`.
    ///
    /// Whatever the host has registered now becomes the protected original
    /// set, and each plugin already active on the host gets a `Loaded`
    /// record that can never be unloaded. Installed records are restored
    /// from the ledger under the install root.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::LedgerError`] if an existing ledger cannot be
    /// read.
    pub fn new(
        host: Arc<dyn PluginHost>,
        config: ManagerConfig,
        resolver: Arc<dyn ModuleResolver>,
        runner: Arc<dyn CommandRunner>,
        fetcher: Box<dyn CatalogFetcher>,
    ) -> PluginResult<Self> {
        let originals = Arc::new(OriginalComponents::capture(host.as_ref()));
        let store = PluginStore::new();
        for plugin in host.active_plugins() {
            let name = plugin.name().to_owned();
            if let Err(e) = store.insert(PluginRecord::original(plugin)) {
                warn!(plugin = %name, error = %e, "Duplicate startup plugin ignored");
            }
        }

        let ledger_path = config.install_root.join(LEDGER_FILE_NAME);
        let installed = DashMap::new();
        for mut entry in InstallLedger::load_or_default(&ledger_path)?.into_entries() {
            // Nothing is loaded in a fresh process.
            if matches!(
                entry.status,
                InstalledStatus::Loaded | InstalledStatus::Active
            ) {
                entry.status = InstalledStatus::Installed;
            }
            installed.insert(entry.name.clone(), entry);
        }

        let installer = Installer::new(&config.install_root, runner)
            .with_package_manager(config.package_manager)
            .with_git_command(config.git_command)
            .with_timeout(config.install_timeout);

        info!(
            originals = originals.len(),
            startup_plugins = store.len(),
            installed = installed.len(),
            install_root = %config.install_root.display(),
            "Plugin manager initialized"
        );

        Ok(Self {
            registrar: ComponentRegistrar::new(Arc::clone(&host), Arc::clone(&originals)),
            host,
            store,
            originals,
            catalog: CatalogClient::new(fetcher, config.cache_ttl),
            installer,
            loader: ModuleLoader::new(resolver),
            installed,
            ledger_path,
            events: EventBus::new(),
        })
    }

    /// Build a manager from loaded configuration, using real processes and
    /// HTTP for installs and registry fetches.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the ledger
    /// cannot be read.
    pub fn from_config(
        host: Arc<dyn PluginHost>,
        config: &Config,
        resolver: Arc<dyn ModuleResolver>,
    ) -> PluginResult<Self> {
        let config = ManagerConfig::from_config(config);
        let fetcher = HttpCatalogFetcher::new(&config.registry_url, config.request_timeout)?;
        Self::new(
            host,
            config,
            resolver,
            Arc::new(TokioCommandRunner),
            Box::new(fetcher),
        )
    }

    // -- Lifecycle --------------------------------------------------------

    /// Register a plugin in `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyRegistered`] if a plugin with the same
    /// name is known, and [`PluginError::InvalidId`] for an empty name.
    pub fn register_plugin(&self, descriptor: PluginDescriptor) -> PluginResult<PluginId> {
        descriptor.validate_name()?;
        let mut record = PluginRecord::ready(Arc::new(descriptor));
        if let Some(installed) = self.installed.get(&record.name) {
            record.missing_config_vars =
                metadata::missing_config_vars(&installed.required_config_vars, self.host.as_ref());
        }
        let (id, name) = (record.id, record.name.clone());
        self.store.insert(record)?;

        info!(plugin_id = %id, plugin = %name, "Registered plugin");
        self.publish(PluginEvent::Ready {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: Some(id.to_string()),
            name,
        });
        Ok(id)
    }

    /// Run the plugin's init hook and apply its components to the host.
    ///
    /// A plugin already `Loaded` is left alone unless `force` is set.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] for an unknown id
    /// - [`PluginError::InvalidState`] when the plugin is neither `Ready`
    ///   nor `Unloaded` and `force` is not set
    /// - [`PluginError::MissingInstance`] when the record has no descriptor
    /// - whatever the init hook or the host reported; the plugin is then in
    ///   `Error`
    pub async fn load_plugin(&self, id: PluginId, force: bool) -> PluginResult<()> {
        let _guard = self.store.lock(id).await;
        let record = self.store.get(&id).ok_or(PluginError::NotFound(id))?;

        if record.status == PluginStatus::Loaded && !force {
            debug!(plugin_id = %id, "Plugin already loaded");
            return Ok(());
        }
        if !force && !matches!(record.status, PluginStatus::Ready | PluginStatus::Unloaded) {
            return Err(PluginError::InvalidState {
                operation: "load",
                plugin_id: id,
                status: record.status,
            });
        }
        let descriptor = record
            .descriptor
            .clone()
            .ok_or(PluginError::MissingInstance(id))?;

        let installed_key = record.installed_key().to_owned();
        let mut components = record.components;
        let mut audit = Vec::new();
        let outcome = self
            .activate(id, &descriptor, &mut components, &mut audit)
            .await;
        // Whatever reached the host is audited, even when a later step failed.
        self.store.record_registrations(id, audit);

        match outcome {
            Ok(()) => {
                self.store.update(&id, |r| {
                    r.status = PluginStatus::Loaded;
                    r.loaded_at = Some(Utc::now());
                    r.error = None;
                    r.components = components;
                })?;
                self.set_installed_status(&installed_key, InstalledStatus::Active, None)
                    .await;

                info!(plugin_id = %id, plugin = %record.name, "Plugin loaded");
                self.publish(PluginEvent::Loaded {
                    metadata: EventMetadata::new(EVENT_SOURCE),
                    plugin_id: id.to_string(),
                    name: record.name,
                });
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                self.store.update(&id, |r| {
                    r.status = PluginStatus::Error;
                    r.error = Some(message.clone());
                    r.components = components;
                })?;
                self.set_installed_status(
                    &installed_key,
                    InstalledStatus::Error,
                    Some(message.clone()),
                )
                .await;

                warn!(plugin_id = %id, plugin = %record.name, error = %e, "Plugin load failed");
                self.publish(PluginEvent::Error {
                    metadata: EventMetadata::new(EVENT_SOURCE),
                    plugin_id: Some(id.to_string()),
                    name: record.name,
                    error: message,
                });
                Err(e)
            },
        }
    }

    async fn activate(
        &self,
        id: PluginId,
        descriptor: &Arc<PluginDescriptor>,
        components: &mut ComponentSet,
        audit: &mut Vec<ComponentRegistration>,
    ) -> PluginResult<()> {
        if let Some(init) = descriptor.init() {
            debug!(plugin_id = %id, "Running plugin init hook");
            init.init(descriptor.config(), Arc::clone(&self.host))
                .await?;
        }
        self.registrar
            .register_all(id, descriptor, components, audit)
            .await
    }

    /// Remove the plugin's components from the host. A plugin that is not
    /// `Loaded` is left alone.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] for an unknown id
    /// - [`PluginError::ProtectedPlugin`] for a plugin present at startup
    /// - the first error the host reported while removing components; the
    ///   plugin is then in `Error`
    pub async fn unload_plugin(&self, id: PluginId) -> PluginResult<()> {
        let _guard = self.store.lock(id).await;
        let record = self.store.get(&id).ok_or(PluginError::NotFound(id))?;

        if record.original {
            return Err(PluginError::ProtectedPlugin(id));
        }
        if record.status != PluginStatus::Loaded {
            debug!(plugin_id = %id, status = %record.status, "Plugin not loaded; nothing to unload");
            return Ok(());
        }
        let descriptor = record
            .descriptor
            .clone()
            .ok_or(PluginError::MissingInstance(id))?;

        let installed_key = record.installed_key().to_owned();
        let mut components = record.components;
        let outcome = self
            .registrar
            .unregister_all(id, &descriptor, &mut components)
            .await;

        match outcome {
            Ok(()) => {
                self.store.update(&id, |r| {
                    r.status = PluginStatus::Unloaded;
                    r.unloaded_at = Some(Utc::now());
                    r.components = components;
                })?;
                self.store.clear_registrations(&id);
                self.set_installed_status(&installed_key, InstalledStatus::Inactive, None)
                    .await;

                info!(plugin_id = %id, plugin = %record.name, "Plugin unloaded");
                self.publish(PluginEvent::Unloaded {
                    metadata: EventMetadata::new(EVENT_SOURCE),
                    plugin_id: id.to_string(),
                    name: record.name,
                });
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                self.store.update(&id, |r| {
                    r.status = PluginStatus::Error;
                    r.error = Some(message.clone());
                    r.components = components;
                })?;
                self.set_installed_status(
                    &installed_key,
                    InstalledStatus::Error,
                    Some(message.clone()),
                )
                .await;

                warn!(plugin_id = %id, plugin = %record.name, error = %e, "Plugin unload failed");
                self.publish(PluginEvent::Error {
                    metadata: EventMetadata::new(EVENT_SOURCE),
                    plugin_id: Some(id.to_string()),
                    name: record.name,
                    error: message,
                });
                Err(e)
            },
        }
    }

    /// Snapshot of one plugin record.
    #[must_use]
    pub fn get_plugin(&self, id: PluginId) -> Option<PluginRecord> {
        self.store.get(&id)
    }

    /// Snapshots of every plugin record, oldest first.
    #[must_use]
    pub fn get_all_plugins(&self) -> Vec<PluginRecord> {
        self.store.all()
    }

    /// Snapshots of every `Loaded` plugin.
    #[must_use]
    pub fn get_loaded_plugins(&self) -> Vec<PluginRecord> {
        self.store.with_status(PluginStatus::Loaded)
    }

    /// Components a plugin currently contributes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for an unknown id.
    pub fn get_plugin_components(&self, id: PluginId) -> PluginResult<ComponentSnapshot> {
        self.store
            .get(&id)
            .map(|r| r.components.snapshot())
            .ok_or(PluginError::NotFound(id))
    }

    /// Audit trail of the plugin's current registrations.
    #[must_use]
    pub fn get_component_registrations(&self, id: PluginId) -> Vec<ComponentRegistration> {
        self.store.registrations(&id)
    }

    // -- Installation -----------------------------------------------------

    /// Install a plugin listed in the registry.
    ///
    /// `version` overrides the version the registry suggests.
    ///
    /// # Errors
    ///
    /// - [`PluginError::RegistryError`] when the registry does not list it
    /// - [`PluginError::NoInstallMethod`] when the entry has no package or
    ///   repository reference
    /// - [`PluginError::InstallFailed`] with the underlying message when an
    ///   install step fails or times out
    pub async fn install_plugin_from_registry(
        &self,
        name: &str,
        version: Option<&str>,
        progress: Option<ProgressCallback>,
    ) -> PluginResult<InstalledPluginRecord> {
        self.publish(PluginEvent::Building {
            metadata: EventMetadata::new(EVENT_SOURCE),
            name: name.to_owned(),
        });

        let outcome = async {
            let entry =
                self.catalog
                    .lookup(name)
                    .await
                    .ok_or_else(|| PluginError::RegistryError {
                        message: format!("plugin {name} is not listed in the registry"),
                    })?;
            let artifact = self.installer.install(&entry, version, progress).await?;
            self.record_installation(&artifact).await
        }
        .await;

        self.finish_install(name, outcome)
    }

    /// Install a plugin from a local directory bundle.
    ///
    /// # Errors
    ///
    /// - [`PluginError::BundleNotFound`] when `path` does not exist
    /// - [`PluginError::UnsupportedBundleFormat`] when it is not a directory
    /// - [`PluginError::InstallFailed`] when an install step fails
    pub async fn install_from_local_bundle(
        &self,
        path: &Path,
        progress: Option<ProgressCallback>,
    ) -> PluginResult<InstalledPluginRecord> {
        let label = path.display().to_string();
        self.publish(PluginEvent::Building {
            metadata: EventMetadata::new(EVENT_SOURCE),
            name: label.clone(),
        });

        let outcome = async {
            let artifact = self.installer.install_bundle(path, progress).await?;
            self.record_installation(&artifact).await
        }
        .await;

        self.finish_install(&label, outcome)
    }

    async fn record_installation(&self, artifact: &Path) -> PluginResult<InstalledPluginRecord> {
        let meta = metadata::read_metadata(artifact).await?;
        let missing = metadata::missing_config_vars(&meta.required_config_vars, self.host.as_ref());
        let status = if missing.is_empty() {
            InstalledStatus::Installed
        } else {
            InstalledStatus::NeedsConfiguration
        };

        let record = InstalledPluginRecord {
            name: meta.name,
            version: meta.version,
            status,
            install_path: artifact.to_path_buf(),
            required_config_vars: meta.required_config_vars,
            error_details: None,
            installed_at: Utc::now(),
            last_activated_at: None,
        };

        let saved = record.clone();
        self.write_ledger(move |ledger| ledger.upsert(saved)).await?;
        self.installed.insert(record.name.clone(), record.clone());

        info!(
            plugin = %record.name,
            version = %record.version,
            status = %record.status,
            path = %record.install_path.display(),
            "Plugin installed"
        );
        if !missing.is_empty() {
            warn!(plugin = %record.name, missing = ?missing, "Plugin needs configuration before it can load");
        }
        Ok(record)
    }

    fn finish_install(
        &self,
        label: &str,
        outcome: PluginResult<InstalledPluginRecord>,
    ) -> PluginResult<InstalledPluginRecord> {
        match &outcome {
            Ok(record) => self.publish(PluginEvent::Ready {
                metadata: EventMetadata::new(EVENT_SOURCE),
                plugin_id: None,
                name: record.name.clone(),
            }),
            Err(e) => {
                warn!(plugin = %label, error = %e, "Plugin install failed");
                self.publish(PluginEvent::Error {
                    metadata: EventMetadata::new(EVENT_SOURCE),
                    plugin_id: None,
                    name: label.to_owned(),
                    error: e.to_string(),
                });
            },
        }
        outcome
    }

    /// Load an installed plugin's module and register it in `Ready`.
    ///
    /// If the plugin is already `Loaded`, the running instance is kept and
    /// its id returned. A known plugin in any other status gets the freshly
    /// loaded descriptor and returns to `Ready`.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotInstalled`] when nothing is installed under `name`
    /// - [`PluginError::ConfigurationRequired`] when required variables are
    ///   still unset
    /// - [`PluginError::ModuleLoadFailed`] or
    ///   [`PluginError::ManifestParseError`] when the module cannot be loaded
    pub async fn load_installed_plugin(&self, name: &str) -> PluginResult<PluginId> {
        let installed = self
            .installed
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| PluginError::NotInstalled(name.to_owned()))?;

        let missing =
            metadata::missing_config_vars(&installed.required_config_vars, self.host.as_ref());
        if !missing.is_empty() {
            let err = PluginError::ConfigurationRequired {
                plugin: name.to_owned(),
                missing,
            };
            self.set_installed_status(
                name,
                InstalledStatus::NeedsConfiguration,
                Some(err.to_string()),
            )
            .await;
            return Err(err);
        }

        let descriptor = match self.loader.load(&installed.install_path).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.set_installed_status(name, InstalledStatus::Error, Some(e.to_string()))
                    .await;
                self.publish(PluginEvent::Error {
                    metadata: EventMetadata::new(EVENT_SOURCE),
                    plugin_id: None,
                    name: name.to_owned(),
                    error: e.to_string(),
                });
                return Err(e);
            },
        };

        let id = PluginId::from_name(descriptor.name());
        {
            let _guard = self.store.lock(id).await;
            match self.store.get(&id) {
                None => {
                    let mut record = PluginRecord::ready(descriptor);
                    record.installed_name = Some(name.to_owned());
                    self.store.insert(record)?;
                },
                Some(existing) if existing.status == PluginStatus::Loaded => {
                    debug!(plugin_id = %id, "Plugin already loaded; keeping the running instance");
                    self.store
                        .update(&id, |r| r.installed_name = Some(name.to_owned()))?;
                    return Ok(id);
                },
                Some(_) => self.store.update(&id, |r| {
                    r.descriptor = Some(descriptor);
                    r.installed_name = Some(name.to_owned());
                    r.status = PluginStatus::Ready;
                    r.error = None;
                })?,
            }
        }

        self.set_installed_status(name, InstalledStatus::Loaded, None)
            .await;
        info!(plugin_id = %id, plugin = %name, "Installed plugin ready to load");
        self.publish(PluginEvent::Ready {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: Some(id.to_string()),
            name: name.to_owned(),
        });
        Ok(id)
    }

    /// Current registry catalog; never fails.
    pub async fn get_available_plugins_from_registry(&self) -> Catalog {
        self.catalog.fetch_catalog().await
    }

    /// Drop the cached registry catalog so the next read fetches.
    pub async fn reset_registry_cache(&self) {
        self.catalog.reset_cache().await;
    }

    /// Installed artifacts, sorted by name.
    #[must_use]
    pub fn list_installed_plugins(&self) -> Vec<InstalledPluginRecord> {
        let mut records: Vec<_> = self.installed.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Remove an installed artifact from disk and from the ledger.
    ///
    /// Only directories under the install root are deleted.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotInstalled`] when nothing is installed under `name`
    /// - [`PluginError::InvalidState`] while the plugin is loaded
    pub async fn uninstall_plugin(&self, name: &str) -> PluginResult<()> {
        let installed = self
            .installed
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| PluginError::NotInstalled(name.to_owned()))?;

        // The package name may differ from the plugin name it loads as.
        let id = self
            .store
            .find_installed(name)
            .unwrap_or_else(|| PluginId::from_name(name));
        let _guard = self.store.lock(id).await;
        if let Some(record) = self.store.get(&id)
            && record.status == PluginStatus::Loaded
        {
            return Err(PluginError::InvalidState {
                operation: "uninstall",
                plugin_id: id,
                status: record.status,
            });
        }

        match self.install_dir_of(&installed.install_path) {
            Some(dir) => match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(path = %dir.display(), "Removed plugin files"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            },
            None => warn!(
                plugin = %name,
                path = %installed.install_path.display(),
                "Install path is outside the install root; leaving files in place"
            ),
        }

        let key = name.to_owned();
        self.write_ledger(move |ledger| {
            ledger.remove(&key);
        })
        .await?;
        self.installed.remove(name);

        info!(plugin = %name, "Plugin uninstalled");
        Ok(())
    }

    /// The top-level directory under the install root holding `artifact`.
    fn install_dir_of(&self, artifact: &Path) -> Option<PathBuf> {
        let root = self.installer.install_root();
        let relative = artifact.strip_prefix(root).ok()?;
        let first = relative.components().next()?;
        match first {
            std::path::Component::Normal(part) => Some(root.join(part)),
            _ => None,
        }
    }

    // -- Accessors --------------------------------------------------------

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The lifecycle event bus.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Names protected from unregistration.
    #[must_use]
    pub fn originals(&self) -> &OriginalComponents {
        &self.originals
    }

    /// The host components are applied to.
    #[must_use]
    pub fn host(&self) -> &Arc<dyn PluginHost> {
        &self.host
    }

    /// The install root.
    #[must_use]
    pub fn install_root(&self) -> &Path {
        self.installer.install_root()
    }

    // -- Internals --------------------------------------------------------

    fn publish(&self, event: PluginEvent) {
        let event_type = event.event_type();
        let receivers = self.events.publish(event);
        debug!(event_type, receivers, "Published lifecycle event");
    }

    /// Update an installed record's status, persisting it. Ledger failures
    /// are logged; the in-memory status is still updated.
    async fn set_installed_status(
        &self,
        name: &str,
        status: InstalledStatus,
        error_details: Option<String>,
    ) {
        let updated = self.installed.get_mut(name).map(|mut record| {
            record.status = status;
            record.error_details = error_details;
            if status == InstalledStatus::Active {
                record.last_activated_at = Some(Utc::now());
            }
            record.clone()
        });
        let Some(record) = updated else {
            return;
        };
        if let Err(e) = self.write_ledger(move |ledger| ledger.upsert(record)).await {
            warn!(plugin = %name, %status, error = %e, "Failed to persist installed status");
        }
    }

    async fn write_ledger<F>(&self, change: F) -> PluginResult<()>
    where
        F: FnOnce(&mut InstallLedger) + Send + 'static,
    {
        let path = self.ledger_path.clone();
        tokio::task::spawn_blocking(move || {
            InstallLedger::update(&path, |ledger| {
                change(ledger);
                Ok(())
            })
        })
        .await
        .map_err(|e| PluginError::LedgerError {
            path: self.ledger_path.clone(),
            message: format!("ledger task failed: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::parse_index;
    use crate::component::test_support::{NamedAction, TestService};
    use crate::host::MemoryHost;
    use crate::install::CommandSpec;
    use crate::loader::StaticModuleResolver;

    struct NoCommands;

    #[async_trait]
    impl CommandRunner for NoCommands {
        async fn run(&self, command: &CommandSpec) -> PluginResult<()> {
            Err(PluginError::InstallFailed(format!("unexpected command: {command}")))
        }
    }

    struct Scripted(Mutex<VecDeque<PluginResult<Catalog>>>);

    #[async_trait]
    impl CatalogFetcher for Scripted {
        async fn fetch(&self) -> PluginResult<Catalog> {
            self.0.lock().unwrap().pop_front().unwrap_or_else(|| {
                Err(PluginError::RegistryError {
                    message: "offline".into(),
                })
            })
        }
    }

    fn manager_with(host: MemoryHost, root: &Path) -> PluginManager {
        PluginManager::new(
            Arc::new(host),
            ManagerConfig::new(root),
            Arc::new(StaticModuleResolver::new()),
            Arc::new(NoCommands),
            Box::new(Scripted(Mutex::new(VecDeque::new()))),
        )
        .unwrap()
    }

    fn weather() -> PluginDescriptor {
        PluginDescriptor::new("weather")
            .with_action(NamedAction::arc("forecast"))
            .with_service(TestService::factory("weather-poller"))
    }

    #[tokio::test]
    async fn register_then_load_publishes_events() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(MemoryHost::new(), dir.path());
        let mut events = manager.events();

        let id = manager.register_plugin(weather()).unwrap();
        manager.load_plugin(id, false).await.unwrap();

        assert_eq!(events.recv().await.unwrap().event_type(), "plugin:ready");
        assert_eq!(events.recv().await.unwrap().event_type(), "plugin:loaded");
        let record = manager.get_plugin(id).unwrap();
        assert_eq!(record.status, PluginStatus::Loaded);
        assert!(record.loaded_at.is_some());
        assert_eq!(manager.get_component_registrations(id).len(), 2);
    }

    #[tokio::test]
    async fn duplicate_register_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(MemoryHost::new(), dir.path());
        manager.register_plugin(weather()).unwrap();
        assert!(matches!(
            manager.register_plugin(weather()),
            Err(PluginError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn load_from_error_needs_force() {
        struct FailingInit;

        #[async_trait]
        impl crate::component::PluginInit for FailingInit {
            async fn init(
                &self,
                _config: &std::collections::HashMap<String, String>,
                _host: Arc<dyn PluginHost>,
            ) -> PluginResult<()> {
                Err(PluginError::ExecutionFailed {
                    plugin: "broken".into(),
                    message: "init exploded".into(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(MemoryHost::new(), dir.path());
        let id = manager
            .register_plugin(PluginDescriptor::new("broken").with_init(Arc::new(FailingInit)))
            .unwrap();

        let err = manager.load_plugin(id, false).await.unwrap_err();
        assert!(err.to_string().contains("init exploded"));
        let record = manager.get_plugin(id).unwrap();
        assert_eq!(record.status, PluginStatus::Error);
        assert_eq!(record.error.as_deref(), Some(err.to_string().as_str()));

        assert!(matches!(
            manager.load_plugin(id, false).await,
            Err(PluginError::InvalidState {
                status: PluginStatus::Error,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(MemoryHost::new(), dir.path());
        let ghost = PluginId::from_name("ghost");
        assert!(matches!(
            manager.load_plugin(ghost, false).await,
            Err(PluginError::NotFound(_))
        ));
        assert!(matches!(
            manager.unload_plugin(ghost).await,
            Err(PluginError::NotFound(_))
        ));
        assert!(manager.get_plugin_components(ghost).is_err());
    }

    #[tokio::test]
    async fn unload_of_ready_plugin_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(MemoryHost::new(), dir.path());
        let id = manager.register_plugin(weather()).unwrap();
        manager.unload_plugin(id).await.unwrap();
        assert_eq!(manager.get_plugin(id).unwrap().status, PluginStatus::Ready);
    }

    #[tokio::test]
    async fn startup_plugins_are_protected_originals() {
        let dir = tempfile::tempdir().unwrap();
        let host = MemoryHost::new()
            .with_plugin(PluginDescriptor::new("core").with_action(NamedAction::arc("reply")));
        let manager = manager_with(host, dir.path());

        let core = PluginId::from_name("core");
        let record = manager.get_plugin(core).unwrap();
        assert!(record.original);
        assert_eq!(record.status, PluginStatus::Loaded);
        assert!(manager.originals().is_protected(
            crate::component::ComponentKind::Action,
            "reply"
        ));
        assert!(matches!(
            manager.unload_plugin(core).await,
            Err(PluginError::ProtectedPlugin(_))
        ));
    }

    #[tokio::test]
    async fn unlisted_plugin_install_fails_with_event() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(MemoryHost::new(), dir.path());
        let mut events = manager.events();

        let err = manager
            .install_plugin_from_registry("nope", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::RegistryError { .. }));
        assert_eq!(events.recv().await.unwrap().event_type(), "plugin:building");
        assert_eq!(events.recv().await.unwrap().event_type(), "plugin:error");
    }

    #[tokio::test]
    async fn registry_entry_without_method() {
        let dir = tempfile::tempdir().unwrap();
        let catalog =
            parse_index(r#"{"bare": {"repository": "https://example.com/bare"}}"#).unwrap();
        let manager = PluginManager::new(
            Arc::new(MemoryHost::new()),
            ManagerConfig::new(dir.path()),
            Arc::new(StaticModuleResolver::new()),
            Arc::new(NoCommands),
            Box::new(Scripted(Mutex::new(VecDeque::from([Ok(catalog)])))),
        )
        .unwrap();
        assert!(matches!(
            manager.install_plugin_from_registry("bare", None, None).await,
            Err(PluginError::NoInstallMethod(name)) if name == "bare"
        ));
    }

    #[tokio::test]
    async fn unknown_installed_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(MemoryHost::new(), dir.path());
        assert!(matches!(
            manager.load_installed_plugin("ghost").await,
            Err(PluginError::NotInstalled(_))
        ));
        assert!(matches!(
            manager.uninstall_plugin("ghost").await,
            Err(PluginError::NotInstalled(_))
        ));
    }

    #[test]
    fn manager_config_from_config() {
        let mut config = Config::default();
        config.plugins.install_dir = Some("/srv/hotplug".into());
        config.plugins.install_timeout_secs = 5;
        config.registry.cache_ttl_secs = 10;
        let settings = ManagerConfig::from_config(&config);
        assert_eq!(settings.install_root, PathBuf::from("/srv/hotplug"));
        assert_eq!(settings.install_timeout, Duration::from_secs(5));
        assert_eq!(settings.cache_ttl, Duration::from_secs(10));
        assert_eq!(settings.package_manager, "npm");
    }
}

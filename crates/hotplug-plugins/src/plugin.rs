//! Plugin identity, status and the typed capability descriptor.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::component::{
    Action, ComponentSet, EventHandler, Evaluator, PluginInit, Provider, ServiceFactory,
};
use crate::error::{PluginError, PluginResult};

/// Namespace for name-derived plugin ids.
const PLUGIN_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a0e_93b4_4d57_a8e1_5c3d_7b90_e214);

/// Stable plugin identifier derived from the plugin's declared name.
///
/// The same name always yields the same id, so re-registering a plugin is
/// detected without comparing descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(Uuid);

impl PluginId {
    /// Derive the id for a plugin name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&PLUGIN_ID_NAMESPACE, name.as_bytes()))
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PluginId {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PluginError::InvalidId(format!("{s}: {e}")))
    }
}

/// Lifecycle status of a plugin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Registered, not yet loaded.
    Ready,
    /// Components are active on the host.
    Loaded,
    /// Components were removed; the record remains.
    Unloaded,
    /// The last load or unload failed.
    Error,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Loaded => "loaded",
            Self::Unloaded => "unloaded",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// The capability bundle a plugin contributes.
///
/// Each capability is an explicit, optional field; [`has_capabilities`]
/// is the structural check applied when a module is loaded.
///
/// [`has_capabilities`]: PluginDescriptor::has_capabilities
#[derive(Clone, Default)]
pub struct PluginDescriptor {
    name: String,
    description: Option<String>,
    actions: Vec<Arc<dyn Action>>,
    providers: Vec<Arc<dyn Provider>>,
    evaluators: Vec<Arc<dyn Evaluator>>,
    services: Vec<Arc<dyn ServiceFactory>>,
    events: BTreeMap<String, Vec<EventHandler>>,
    init: Option<Arc<dyn PluginInit>>,
    config: HashMap<String, String>,
}

impl PluginDescriptor {
    /// Start a descriptor for the named plugin.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an action.
    #[must_use]
    pub fn with_action(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    /// Add a data provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Add an evaluator.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Add a background service.
    #[must_use]
    pub fn with_service(mut self, service: Arc<dyn ServiceFactory>) -> Self {
        self.services.push(service);
        self
    }

    /// Add a handler for a host event.
    #[must_use]
    pub fn with_event_handler(mut self, event: impl Into<String>, handler: EventHandler) -> Self {
        self.events.entry(event.into()).or_default().push(handler);
        self
    }

    /// Set the initialization hook.
    #[must_use]
    pub fn with_init(mut self, init: Arc<dyn PluginInit>) -> Self {
        self.init = Some(init);
        self
    }

    /// Add a plugin configuration value passed to the init hook.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Declared actions.
    #[must_use]
    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    /// Declared providers.
    #[must_use]
    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    /// Declared evaluators.
    #[must_use]
    pub fn evaluators(&self) -> &[Arc<dyn Evaluator>] {
        &self.evaluators
    }

    /// Declared services.
    #[must_use]
    pub fn services(&self) -> &[Arc<dyn ServiceFactory>] {
        &self.services
    }

    /// Declared event handlers, keyed by event name.
    #[must_use]
    pub fn events(&self) -> &BTreeMap<String, Vec<EventHandler>> {
        &self.events
    }

    /// Initialization hook, if any.
    #[must_use]
    pub fn init(&self) -> Option<&Arc<dyn PluginInit>> {
        self.init.as_ref()
    }

    /// Plugin configuration values.
    #[must_use]
    pub fn config(&self) -> &HashMap<String, String> {
        &self.config
    }

    /// Whether this descriptor has the shape of a plugin: a non-empty name
    /// and at least one of actions, services, providers, evaluators or an
    /// init hook.
    #[must_use]
    pub fn has_capabilities(&self) -> bool {
        !self.name.trim().is_empty()
            && (!self.actions.is_empty()
                || !self.services.is_empty()
                || !self.providers.is_empty()
                || !self.evaluators.is_empty()
                || self.init.is_some())
    }

    /// The names this descriptor would contribute, as a component set.
    #[must_use]
    pub fn declared_components(&self) -> ComponentSet {
        ComponentSet {
            actions: self.actions.iter().map(|a| a.name().to_owned()).collect(),
            providers: self.providers.iter().map(|p| p.name().to_owned()).collect(),
            evaluators: self.evaluators.iter().map(|e| e.name().to_owned()).collect(),
            services: self
                .services
                .iter()
                .map(|s| s.service_type().to_owned())
                .collect(),
            event_handlers: self.events.clone(),
        }
    }

    /// Check the plugin name before it is used to derive an id.
    pub(crate) fn validate_name(&self) -> PluginResult<()> {
        if self.name.trim().is_empty() {
            return Err(PluginError::InvalidId("plugin name must not be empty".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field(
                "actions",
                &self.actions.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "evaluators",
                &self.evaluators.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field(
                "services",
                &self
                    .services
                    .iter()
                    .map(|s| s.service_type())
                    .collect::<Vec<_>>(),
            )
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .field("init", &self.init.is_some())
            .finish_non_exhaustive()
    }
}

/// Tracked lifecycle state for one plugin.
#[derive(Debug, Clone)]
pub struct PluginRecord {
    /// Stable id derived from the name.
    pub id: PluginId,
    /// Plugin name.
    pub name: String,
    /// Current status.
    pub status: PluginStatus,
    /// Loaded capability bundle.
    pub descriptor: Option<Arc<PluginDescriptor>>,
    /// Required configuration keys that were unset at registration.
    pub missing_config_vars: Vec<String>,
    /// Components this plugin currently contributes to the host.
    pub components: ComponentSet,
    /// Whether the plugin was active on the host at startup.
    pub original: bool,
    /// Installed package the descriptor was loaded from. A package name
    /// need not match the plugin name (`@acme/notes` may load `notes`).
    pub installed_name: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Last successful load.
    pub loaded_at: Option<DateTime<Utc>>,
    /// Last successful unload.
    pub unloaded_at: Option<DateTime<Utc>>,
    /// Last failure message, cleared on successful load.
    pub error: Option<String>,
}

impl PluginRecord {
    /// A fresh record in [`PluginStatus::Ready`].
    #[must_use]
    pub fn ready(descriptor: Arc<PluginDescriptor>) -> Self {
        Self {
            id: PluginId::from_name(descriptor.name()),
            name: descriptor.name().to_owned(),
            status: PluginStatus::Ready,
            descriptor: Some(descriptor),
            missing_config_vars: Vec::new(),
            components: ComponentSet::default(),
            original: false,
            installed_name: None,
            created_at: Utc::now(),
            loaded_at: None,
            unloaded_at: None,
            error: None,
        }
    }

    /// The installed package this plugin's state is mirrored to.
    #[must_use]
    pub fn installed_key(&self) -> &str {
        self.installed_name.as_deref().unwrap_or(&self.name)
    }

    /// A record for a plugin already active on the host at startup.
    #[must_use]
    pub fn original(descriptor: Arc<PluginDescriptor>) -> Self {
        let now = Utc::now();
        let components = descriptor.declared_components();
        Self {
            status: PluginStatus::Loaded,
            components,
            original: true,
            loaded_at: Some(now),
            created_at: now,
            ..Self::ready(descriptor)
        }
    }
}

//! Runtime components a plugin contributes to the host, and the
//! bookkeeping types that track them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PluginResult;
use crate::host::PluginHost;
use crate::plugin::PluginId;

/// A named operation the host can invoke.
#[async_trait]
pub trait Action: Send + Sync {
    /// Unique action name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Run the action.
    async fn handle(&self, input: Value) -> PluginResult<Value>;
}

/// Supplies contextual data to the host.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique provider name.
    fn name(&self) -> &str;

    /// Produce data for a query.
    async fn get(&self, query: &Value) -> PluginResult<Value>;
}

/// Judges host state after an interaction.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Unique evaluator name.
    fn name(&self) -> &str;

    /// Evaluate the input, returning whether it passed.
    async fn evaluate(&self, input: &Value) -> PluginResult<bool>;
}

/// A running background service.
#[async_trait]
pub trait Service: Send + Sync {
    /// The service type this instance is installed under.
    fn service_type(&self) -> &str;

    /// Stop the service.
    async fn stop(&self) -> PluginResult<()>;
}

/// Starts a background service.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    /// The service type name, used as the host service table key.
    fn service_type(&self) -> &str;

    /// Start an instance.
    async fn start(&self, host: Arc<dyn PluginHost>) -> PluginResult<Arc<dyn Service>>;
}

/// Plugin initialization hook, run before components are registered.
#[async_trait]
pub trait PluginInit: Send + Sync {
    /// Initialize the plugin.
    async fn init(
        &self,
        config: &HashMap<String, String>,
        host: Arc<dyn PluginHost>,
    ) -> PluginResult<()>;
}

/// Identity of one registered event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(Uuid);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

type EventCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// A handler for a host event.
///
/// Clones share the same [`HandlerId`]; equality is handler identity, so
/// unregistering a handler removes exactly that reference and leaves other
/// handlers for the same event in place.
#[derive(Clone)]
pub struct EventHandler {
    id: HandlerId,
    callback: EventCallback,
}

impl EventHandler {
    /// Wrap an async callback.
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            id: HandlerId::new(),
            callback: Arc::new(move |payload| Box::pin(callback(payload))),
        }
    }

    /// Handler identity.
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Invoke the handler.
    pub async fn call(&self, payload: Value) {
        (self.callback)(payload).await;
    }
}

impl PartialEq for EventHandler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventHandler {}

impl Hash for EventHandler {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventHandler").field(&self.id).finish()
    }
}

/// Kind of component a plugin can contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// An [`Action`].
    Action,
    /// A [`Provider`].
    Provider,
    /// An [`Evaluator`].
    Evaluator,
    /// A running [`Service`].
    Service,
    /// An [`EventHandler`].
    EventHandler,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Action => "action",
            Self::Provider => "provider",
            Self::Evaluator => "evaluator",
            Self::Service => "service",
            Self::EventHandler => "event_handler",
        };
        f.write_str(s)
    }
}

/// The components one plugin currently contributes to the host.
#[derive(Debug, Clone, Default)]
pub struct ComponentSet {
    /// Action names.
    pub actions: BTreeSet<String>,
    /// Provider names.
    pub providers: BTreeSet<String>,
    /// Evaluator names.
    pub evaluators: BTreeSet<String>,
    /// Service type names.
    pub services: BTreeSet<String>,
    /// Handlers per event name.
    pub event_handlers: BTreeMap<String, Vec<EventHandler>>,
}

impl ComponentSet {
    /// Whether the set contributes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.providers.is_empty()
            && self.evaluators.is_empty()
            && self.services.is_empty()
            && self.event_handlers.values().all(Vec::is_empty)
    }

    /// Names of the given kind.
    #[must_use]
    pub fn names(&self, kind: ComponentKind) -> Vec<String> {
        match kind {
            ComponentKind::Action => self.actions.iter().cloned().collect(),
            ComponentKind::Provider => self.providers.iter().cloned().collect(),
            ComponentKind::Evaluator => self.evaluators.iter().cloned().collect(),
            ComponentKind::Service => self.services.iter().cloned().collect(),
            ComponentKind::EventHandler => self.event_handlers.keys().cloned().collect(),
        }
    }

    pub(crate) fn names_mut(&mut self, kind: ComponentKind) -> Option<&mut BTreeSet<String>> {
        match kind {
            ComponentKind::Action => Some(&mut self.actions),
            ComponentKind::Provider => Some(&mut self.providers),
            ComponentKind::Evaluator => Some(&mut self.evaluators),
            ComponentKind::Service => Some(&mut self.services),
            ComponentKind::EventHandler => None,
        }
    }

    /// A serialisable view of the set.
    #[must_use]
    pub fn snapshot(&self) -> ComponentSnapshot {
        ComponentSnapshot {
            actions: self.names(ComponentKind::Action),
            providers: self.names(ComponentKind::Provider),
            evaluators: self.names(ComponentKind::Evaluator),
            services: self.names(ComponentKind::Service),
            event_handlers: self
                .event_handlers
                .iter()
                .map(|(event, handlers)| {
                    (event.clone(), handlers.iter().map(EventHandler::id).collect())
                })
                .collect(),
        }
    }
}

/// Serialisable view of a [`ComponentSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    /// Action names.
    pub actions: Vec<String>,
    /// Provider names.
    pub providers: Vec<String>,
    /// Evaluator names.
    pub evaluators: Vec<String>,
    /// Service type names.
    pub services: Vec<String>,
    /// Handler ids per event name.
    pub event_handlers: BTreeMap<String, Vec<HandlerId>>,
}

/// Audit entry for one component registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRegistration {
    /// Owning plugin.
    pub plugin_id: PluginId,
    /// Component kind.
    pub component_type: ComponentKind,
    /// Component name (event name for handlers).
    pub component_name: String,
    /// When it was registered.
    pub timestamp: DateTime<Utc>,
}

impl ComponentRegistration {
    pub(crate) fn now(plugin_id: PluginId, kind: ComponentKind, name: &str) -> Self {
        Self {
            plugin_id,
            component_type: kind,
            component_name: name.to_owned(),
            timestamp: Utc::now(),
        }
    }
}

/// Component names present on the host before any plugin was loaded.
///
/// Captured once; these names are never removed by an unload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginalComponents {
    actions: HashSet<String>,
    providers: HashSet<String>,
    evaluators: HashSet<String>,
    services: HashSet<String>,
}

impl OriginalComponents {
    /// Snapshot what the host currently has registered.
    #[must_use]
    pub fn capture(host: &dyn PluginHost) -> Self {
        Self {
            actions: host.action_names().into_iter().collect(),
            providers: host.provider_names().into_iter().collect(),
            evaluators: host.evaluator_names().into_iter().collect(),
            services: host.service_types().into_iter().collect(),
        }
    }

    /// Whether `name` of `kind` was present at capture time.
    #[must_use]
    pub fn is_protected(&self, kind: ComponentKind, name: &str) -> bool {
        match kind {
            ComponentKind::Action => self.actions.contains(name),
            ComponentKind::Provider => self.providers.contains(name),
            ComponentKind::Evaluator => self.evaluators.contains(name),
            ComponentKind::Service => self.services.contains(name),
            ComponentKind::EventHandler => false,
        }
    }

    /// Number of protected names across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions
            .len()
            .saturating_add(self.providers.len())
            .saturating_add(self.evaluators.len())
            .saturating_add(self.services.len())
    }

    /// Whether nothing is protected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! The host collaborator: shared registries that plugins contribute to.
//!
//! [`PluginHost`] is the narrow interface the lifecycle manager mutates.
//! [`MemoryHost`] is the in-process implementation: one name-keyed map per
//! registry, so adding or removing a component is a single map operation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tracing::debug;

use crate::component::{Action, EventHandler, Evaluator, HandlerId, Provider, Service};
use crate::error::PluginResult;
use crate::plugin::PluginDescriptor;

/// Host-wide registries a plugin's components are applied to.
///
/// Implementations use interior mutability; every method takes `&self`.
pub trait PluginHost: Send + Sync {
    /// Register an action, replacing any action with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the registration.
    fn register_action(&self, action: Arc<dyn Action>) -> PluginResult<()>;
    /// Remove an action by name. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the removal.
    fn unregister_action(&self, name: &str) -> PluginResult<bool>;
    /// Look up an action.
    fn action(&self, name: &str) -> Option<Arc<dyn Action>>;
    /// Registered action names, in registration order.
    fn action_names(&self) -> Vec<String>;

    /// Register a provider, replacing any provider with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the registration.
    fn register_provider(&self, provider: Arc<dyn Provider>) -> PluginResult<()>;
    /// Remove a provider by name. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the removal.
    fn unregister_provider(&self, name: &str) -> PluginResult<bool>;
    /// Look up a provider.
    fn provider(&self, name: &str) -> Option<Arc<dyn Provider>>;
    /// Registered provider names, in registration order.
    fn provider_names(&self) -> Vec<String>;

    /// Register an evaluator, replacing any evaluator with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the registration.
    fn register_evaluator(&self, evaluator: Arc<dyn Evaluator>) -> PluginResult<()>;
    /// Remove an evaluator by name. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the removal.
    fn unregister_evaluator(&self, name: &str) -> PluginResult<bool>;
    /// Look up an evaluator.
    fn evaluator(&self, name: &str) -> Option<Arc<dyn Evaluator>>;
    /// Registered evaluator names, in registration order.
    fn evaluator_names(&self) -> Vec<String>;

    /// Add a handler for an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the registration.
    fn register_event(&self, event: &str, handler: EventHandler) -> PluginResult<()>;
    /// Remove exactly one handler from an event. Returns whether it was
    /// present.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the removal.
    fn unregister_event(&self, event: &str, handler: HandlerId) -> PluginResult<bool>;
    /// Handlers registered for an event.
    fn event_handlers(&self, event: &str) -> Vec<EventHandler>;

    /// Running service of a type.
    fn service(&self, service_type: &str) -> Option<Arc<dyn Service>>;
    /// Install a running service.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the service.
    fn set_service(&self, service_type: &str, service: Arc<dyn Service>) -> PluginResult<()>;
    /// Remove a service from the table.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses the removal.
    fn remove_service(&self, service_type: &str) -> PluginResult<Option<Arc<dyn Service>>>;
    /// Installed service types.
    fn service_types(&self) -> Vec<String>;

    /// Add a plugin to the active list, replacing one with the same name.
    fn add_active_plugin(&self, plugin: Arc<PluginDescriptor>);
    /// Remove a plugin from the active list by name.
    fn remove_active_plugin(&self, name: &str) -> bool;
    /// Active plugins.
    fn active_plugins(&self) -> Vec<Arc<PluginDescriptor>>;

    /// Look up a configuration variable.
    fn setting(&self, key: &str) -> Option<String>;
}

/// Name-keyed registry that remembers insertion order.
struct NamedRegistry<T> {
    entries: HashMap<String, (u64, T)>,
    next_seq: u64,
}

impl<T: Clone> NamedRegistry<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, name: &str, value: T) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.entries.insert(name.to_owned(), (seq, value));
    }

    fn remove(&mut self, name: &str) -> Option<T> {
        self.entries.remove(name).map(|(_, v)| v)
    }

    fn get(&self, name: &str) -> Option<T> {
        self.entries.get(name).map(|(_, v)| v.clone())
    }

    fn names(&self) -> Vec<String> {
        let mut named: Vec<_> = self.entries.iter().map(|(k, (seq, _))| (*seq, k)).collect();
        named.sort_unstable_by_key(|(seq, _)| *seq);
        named.into_iter().map(|(_, k)| k.clone()).collect()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-process [`PluginHost`].
///
/// Settings fall back to process environment variables when a key has not
/// been set explicitly.
pub struct MemoryHost {
    actions: RwLock<NamedRegistry<Arc<dyn Action>>>,
    providers: RwLock<NamedRegistry<Arc<dyn Provider>>>,
    evaluators: RwLock<NamedRegistry<Arc<dyn Evaluator>>>,
    services: RwLock<NamedRegistry<Arc<dyn Service>>>,
    events: RwLock<HashMap<String, Vec<EventHandler>>>,
    active: RwLock<Vec<Arc<PluginDescriptor>>>,
    settings: RwLock<HashMap<String, String>>,
    env_fallback: bool,
}

impl MemoryHost {
    /// An empty host with environment fallback for settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(NamedRegistry::new()),
            providers: RwLock::new(NamedRegistry::new()),
            evaluators: RwLock::new(NamedRegistry::new()),
            services: RwLock::new(NamedRegistry::new()),
            events: RwLock::new(HashMap::new()),
            active: RwLock::new(Vec::new()),
            settings: RwLock::new(HashMap::new()),
            env_fallback: true,
        }
    }

    /// Only consult explicitly set settings.
    #[must_use]
    pub fn without_env_fallback(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    /// Set a configuration variable.
    #[must_use]
    pub fn with_setting(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_setting(key, value);
        self
    }

    /// Set a configuration variable on a shared host.
    pub fn set_setting(&self, key: impl Into<String>, value: impl Into<String>) {
        write(&self.settings).insert(key.into(), value.into());
    }

    /// Install a plugin as if it had been active since startup: its
    /// actions, providers, evaluators and event handlers are registered and
    /// it joins the active list.
    #[must_use]
    pub fn with_plugin(self, plugin: PluginDescriptor) -> Self {
        for action in plugin.actions() {
            write(&self.actions).insert(action.name(), Arc::clone(action));
        }
        for provider in plugin.providers() {
            write(&self.providers).insert(provider.name(), Arc::clone(provider));
        }
        for evaluator in plugin.evaluators() {
            write(&self.evaluators).insert(evaluator.name(), Arc::clone(evaluator));
        }
        for (event, handlers) in plugin.events() {
            write(&self.events)
                .entry(event.clone())
                .or_default()
                .extend(handlers.iter().cloned());
        }
        self.add_active_plugin(Arc::new(plugin));
        self
    }

    /// Install a running service at startup.
    #[must_use]
    pub fn with_service(self, service: Arc<dyn Service>) -> Self {
        let service_type = service.service_type().to_owned();
        write(&self.services).insert(&service_type, service);
        self
    }

    /// Deliver `payload` to every handler registered for `event`, in
    /// registration order. Returns the number of handlers invoked.
    pub async fn emit_event(&self, event: &str, payload: Value) -> usize {
        let handlers = self.event_handlers(event);
        for handler in &handlers {
            handler.call(payload.clone()).await;
        }
        debug!(event, handlers = handlers.len(), "Delivered host event");
        handlers.len()
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginHost for MemoryHost {
    fn register_action(&self, action: Arc<dyn Action>) -> PluginResult<()> {
        let name = action.name().to_owned();
        write(&self.actions).insert(&name, action);
        Ok(())
    }

    fn unregister_action(&self, name: &str) -> PluginResult<bool> {
        Ok(write(&self.actions).remove(name).is_some())
    }

    fn action(&self, name: &str) -> Option<Arc<dyn Action>> {
        read(&self.actions).get(name)
    }

    fn action_names(&self) -> Vec<String> {
        read(&self.actions).names()
    }

    fn register_provider(&self, provider: Arc<dyn Provider>) -> PluginResult<()> {
        let name = provider.name().to_owned();
        write(&self.providers).insert(&name, provider);
        Ok(())
    }

    fn unregister_provider(&self, name: &str) -> PluginResult<bool> {
        Ok(write(&self.providers).remove(name).is_some())
    }

    fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        read(&self.providers).get(name)
    }

    fn provider_names(&self) -> Vec<String> {
        read(&self.providers).names()
    }

    fn register_evaluator(&self, evaluator: Arc<dyn Evaluator>) -> PluginResult<()> {
        let name = evaluator.name().to_owned();
        write(&self.evaluators).insert(&name, evaluator);
        Ok(())
    }

    fn unregister_evaluator(&self, name: &str) -> PluginResult<bool> {
        Ok(write(&self.evaluators).remove(name).is_some())
    }

    fn evaluator(&self, name: &str) -> Option<Arc<dyn Evaluator>> {
        read(&self.evaluators).get(name)
    }

    fn evaluator_names(&self) -> Vec<String> {
        read(&self.evaluators).names()
    }

    fn register_event(&self, event: &str, handler: EventHandler) -> PluginResult<()> {
        write(&self.events)
            .entry(event.to_owned())
            .or_default()
            .push(handler);
        Ok(())
    }

    fn unregister_event(&self, event: &str, handler: HandlerId) -> PluginResult<bool> {
        let mut events = write(&self.events);
        let Some(handlers) = events.get_mut(event) else {
            return Ok(false);
        };
        let Some(pos) = handlers.iter().position(|h| h.id() == handler) else {
            return Ok(false);
        };
        handlers.remove(pos);
        if handlers.is_empty() {
            events.remove(event);
        }
        Ok(true)
    }

    fn event_handlers(&self, event: &str) -> Vec<EventHandler> {
        read(&self.events).get(event).cloned().unwrap_or_default()
    }

    fn service(&self, service_type: &str) -> Option<Arc<dyn Service>> {
        read(&self.services).get(service_type)
    }

    fn set_service(&self, service_type: &str, service: Arc<dyn Service>) -> PluginResult<()> {
        write(&self.services).insert(service_type, service);
        Ok(())
    }

    fn remove_service(&self, service_type: &str) -> PluginResult<Option<Arc<dyn Service>>> {
        Ok(write(&self.services).remove(service_type))
    }

    fn service_types(&self) -> Vec<String> {
        read(&self.services).names()
    }

    fn add_active_plugin(&self, plugin: Arc<PluginDescriptor>) {
        let mut active = write(&self.active);
        active.retain(|p| p.name() != plugin.name());
        active.push(plugin);
    }

    fn remove_active_plugin(&self, name: &str) -> bool {
        let mut active = write(&self.active);
        let before = active.len();
        active.retain(|p| p.name() != name);
        active.len() < before
    }

    fn active_plugins(&self) -> Vec<Arc<PluginDescriptor>> {
        read(&self.active).clone()
    }

    fn setting(&self, key: &str) -> Option<String> {
        if let Some(value) = read(&self.settings).get(key) {
            return Some(value.clone());
        }
        if self.env_fallback {
            return std::env::var(key).ok();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::test_support::{NamedAction, TestService};
    use crate::component::ServiceFactory;

    #[test]
    fn actions_keep_registration_order() {
        let host = MemoryHost::new();
        for name in ["zeta", "alpha", "mid"] {
            host.register_action(NamedAction::arc(name)).unwrap();
        }
        assert_eq!(host.action_names(), vec!["zeta", "alpha", "mid"]);
        assert!(host.unregister_action("alpha").unwrap());
        assert!(!host.unregister_action("alpha").unwrap());
        assert_eq!(host.action_names(), vec!["zeta", "mid"]);
    }

    #[test]
    fn unregister_event_removes_one_handler() {
        let host = MemoryHost::new();
        let first = EventHandler::new(|_| async {});
        let second = EventHandler::new(|_| async {});
        host.register_event("message", first.clone()).unwrap();
        host.register_event("message", second.clone()).unwrap();

        assert!(host.unregister_event("message", first.id()).unwrap());
        assert_eq!(host.event_handlers("message"), vec![second.clone()]);

        assert!(host.unregister_event("message", second.id()).unwrap());
        assert!(host.event_handlers("message").is_empty());
        assert!(!host.unregister_event("message", second.id()).unwrap());
    }

    #[tokio::test]
    async fn emit_event_calls_each_handler() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let host = MemoryHost::new();
        for tag in ["a", "b"] {
            let tx = tx.clone();
            host.register_event(
                "tick",
                EventHandler::new(move |_| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(tag);
                    }
                }),
            )
            .unwrap();
        }
        assert_eq!(host.emit_event("tick", Value::Null).await, 2);
        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, Some("b"));
    }

    #[test]
    fn settings_prefer_explicit_values() {
        let host = MemoryHost::new()
            .without_env_fallback()
            .with_setting("API_KEY", "secret");
        assert_eq!(host.setting("API_KEY").as_deref(), Some("secret"));
        assert_eq!(host.setting("PATH"), None);
    }

    #[test]
    fn with_plugin_registers_startup_components() {
        let host = MemoryHost::new().with_plugin(
            PluginDescriptor::new("core")
                .with_action(NamedAction::arc("reply"))
                .with_event_handler("message", EventHandler::new(|_| async {})),
        );
        assert_eq!(host.action_names(), vec!["reply"]);
        assert_eq!(host.event_handlers("message").len(), 1);
        assert_eq!(host.active_plugins().len(), 1);
        assert!(host.remove_active_plugin("core"));
        assert!(host.active_plugins().is_empty());
    }

    #[tokio::test]
    async fn service_table_round_trip() {
        let host: Arc<dyn PluginHost> = Arc::new(MemoryHost::new());
        let factory = TestService::factory("cache");
        let service = factory.start(Arc::clone(&host)).await.unwrap();
        host.set_service("cache", service).unwrap();
        assert_eq!(host.service_types(), vec!["cache"]);
        assert!(host.remove_service("cache").unwrap().is_some());
        assert!(host.service("cache").is_none());
    }
}

//! Applies and reverts a plugin's components against the host registries.
//!
//! Components are processed in a fixed order: actions, providers,
//! evaluators, event handlers, services. Unregistration uses the same
//! order.
//!
//! # Name conflicts
//!
//! - A name present at startup ([`OriginalComponents`]) is never replaced
//!   and never removed. A plugin declaring such an action, provider or
//!   evaluator keeps the name in its component set as a claim, which
//!   unregistration drops without touching the host. A service type that
//!   collides with an original is not started.
//! - A name already registered by another plugin stays with its first
//!   owner; the later plugin skips it with a warning and does not record it.
//! - Re-registering a name the plugin already owns (forced reload)
//!   replaces its own entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::component::{ComponentKind, ComponentRegistration, ComponentSet, OriginalComponents};
use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::plugin::{PluginDescriptor, PluginId};

/// Outcome of a name check.
enum Claim {
    Register,
    ShadowsOriginal,
    OwnedElsewhere,
}

/// Registers and unregisters plugin components on a host.
#[derive(Clone)]
pub struct ComponentRegistrar {
    host: Arc<dyn PluginHost>,
    originals: Arc<OriginalComponents>,
}

impl ComponentRegistrar {
    /// A registrar protecting `originals` on `host`.
    #[must_use]
    pub fn new(host: Arc<dyn PluginHost>, originals: Arc<OriginalComponents>) -> Self {
        Self { host, originals }
    }

    /// The protected startup names.
    #[must_use]
    pub fn originals(&self) -> &OriginalComponents {
        &self.originals
    }

    fn claim(&self, kind: ComponentKind, name: &str, owned: bool, on_host: bool) -> Claim {
        if self.originals.is_protected(kind, name) {
            Claim::ShadowsOriginal
        } else if owned || !on_host {
            Claim::Register
        } else {
            Claim::OwnedElsewhere
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_named(
        &self,
        id: PluginId,
        kind: ComponentKind,
        name: &str,
        on_host: bool,
        set: &mut ComponentSet,
        audit: &mut Vec<ComponentRegistration>,
        register: impl FnOnce() -> PluginResult<()>,
    ) -> PluginResult<()> {
        let owned = set.names_mut(kind).is_some_and(|names| names.contains(name));
        match self.claim(kind, name, owned, on_host) {
            Claim::Register => {
                register()?;
                if let Some(names) = set.names_mut(kind) {
                    names.insert(name.to_owned());
                }
                audit.push(ComponentRegistration::now(id, kind, name));
                debug!(plugin_id = %id, %kind, name, "Registered component");
            },
            Claim::ShadowsOriginal => {
                warn!(plugin_id = %id, %kind, name, "Component shadows an original; keeping the original");
                if let Some(names) = set.names_mut(kind) {
                    names.insert(name.to_owned());
                }
            },
            Claim::OwnedElsewhere => {
                warn!(plugin_id = %id, %kind, name, "Component already registered by another plugin; skipping");
            },
        }
        Ok(())
    }

    /// Register everything `plugin` declares, recording what was applied in
    /// `set` and appending one audit entry per registration to `audit`.
    ///
    /// A service that fails to start is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the first error the host reports. Components registered
    /// before it stay recorded in `set` and keep their `audit` entries.
    pub async fn register_all(
        &self,
        id: PluginId,
        plugin: &Arc<PluginDescriptor>,
        set: &mut ComponentSet,
        audit: &mut Vec<ComponentRegistration>,
    ) -> PluginResult<()> {
        let applied = audit.len();
        let host = &self.host;

        for action in plugin.actions() {
            let name = action.name();
            self.apply_named(
                id,
                ComponentKind::Action,
                name,
                host.action(name).is_some(),
                set,
                audit,
                || host.register_action(Arc::clone(action)),
            )?;
        }
        for provider in plugin.providers() {
            let name = provider.name();
            self.apply_named(
                id,
                ComponentKind::Provider,
                name,
                host.provider(name).is_some(),
                set,
                audit,
                || host.register_provider(Arc::clone(provider)),
            )?;
        }
        for evaluator in plugin.evaluators() {
            let name = evaluator.name();
            self.apply_named(
                id,
                ComponentKind::Evaluator,
                name,
                host.evaluator(name).is_some(),
                set,
                audit,
                || host.register_evaluator(Arc::clone(evaluator)),
            )?;
        }

        for (event, handlers) in plugin.events() {
            for handler in handlers {
                let owned = set.event_handlers.get(event).is_some_and(|hs| hs.contains(handler));
                if owned {
                    continue;
                }
                host.register_event(event, handler.clone())?;
                set.event_handlers
                    .entry(event.clone())
                    .or_default()
                    .push(handler.clone());
                audit.push(ComponentRegistration::now(id, ComponentKind::EventHandler, event));
            }
        }

        for factory in plugin.services() {
            let service_type = factory.service_type();
            if self.originals.is_protected(ComponentKind::Service, service_type) {
                warn!(plugin_id = %id, service_type, "Service type belongs to the host; not starting");
                continue;
            }
            if set.services.contains(service_type) {
                debug!(plugin_id = %id, service_type, "Service already running");
                continue;
            }
            if host.service(service_type).is_some() {
                warn!(plugin_id = %id, service_type, "Service type already provided by another plugin; skipping");
                continue;
            }
            match factory.start(Arc::clone(host)).await {
                Ok(service) => {
                    if let Err(e) = host.set_service(service_type, Arc::clone(&service)) {
                        if let Err(stop) = service.stop().await {
                            warn!(plugin_id = %id, service_type, error = %stop, "Stop hook failed for refused service");
                        }
                        return Err(e);
                    }
                    set.services.insert(service_type.to_owned());
                    audit.push(ComponentRegistration::now(
                        id,
                        ComponentKind::Service,
                        service_type,
                    ));
                    debug!(plugin_id = %id, service_type, "Started service");
                },
                Err(e) => {
                    warn!(plugin_id = %id, service_type, error = %e, "Service failed to start; continuing");
                },
            }
        }

        host.add_active_plugin(Arc::clone(plugin));
        let registered = audit.len().saturating_sub(applied);
        info!(plugin_id = %id, plugin = %plugin.name(), registered, "Registered plugin components");
        Ok(())
    }

    /// Remove everything recorded in `set` from the host, leaving original
    /// names in place.
    ///
    /// Every step is attempted even when an earlier one fails; stop-hook
    /// failures are logged only. Components the host refused to remove stay
    /// recorded in `set`.
    ///
    /// # Errors
    ///
    /// Returns the first error the host reported.
    pub async fn unregister_all(
        &self,
        id: PluginId,
        plugin: &PluginDescriptor,
        set: &mut ComponentSet,
    ) -> PluginResult<()> {
        let mut first_error: Option<PluginError> = None;

        for kind in [
            ComponentKind::Action,
            ComponentKind::Provider,
            ComponentKind::Evaluator,
        ] {
            for name in set.names(kind) {
                if self.originals.is_protected(kind, &name) {
                    debug!(plugin_id = %id, %kind, name = %name, "Leaving original component in place");
                } else if let Err(e) = self.unregister_named(kind, &name) {
                    warn!(plugin_id = %id, %kind, name = %name, error = %e, "Failed to unregister component");
                    first_error.get_or_insert(e);
                    continue;
                }
                if let Some(names) = set.names_mut(kind) {
                    names.remove(&name);
                }
            }
        }

        let mut kept: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for (event, handlers) in std::mem::take(&mut set.event_handlers) {
            for handler in handlers {
                if let Err(e) = self.host.unregister_event(&event, handler.id()) {
                    warn!(plugin_id = %id, event = %event, error = %e, "Failed to unregister event handler");
                    first_error.get_or_insert(e);
                    kept.entry(event.clone()).or_default().push(handler);
                }
            }
        }
        set.event_handlers = kept;

        for service_type in set.names(ComponentKind::Service) {
            if !self.originals.is_protected(ComponentKind::Service, &service_type) {
                if let Some(service) = self.host.service(&service_type)
                    && let Err(e) = service.stop().await
                {
                    warn!(plugin_id = %id, service_type = %service_type, error = %e, "Service stop hook failed; removing anyway");
                }
                if let Err(e) = self.host.remove_service(&service_type) {
                    warn!(plugin_id = %id, service_type = %service_type, error = %e, "Failed to remove service");
                    first_error.get_or_insert(e);
                    continue;
                }
            }
            set.services.remove(&service_type);
        }

        self.host.remove_active_plugin(plugin.name());

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(plugin_id = %id, plugin = %plugin.name(), "Unregistered plugin components");
                Ok(())
            },
        }
    }

    fn unregister_named(&self, kind: ComponentKind, name: &str) -> PluginResult<bool> {
        match kind {
            ComponentKind::Action => self.host.unregister_action(name),
            ComponentKind::Provider => self.host.unregister_provider(name),
            ComponentKind::Evaluator => self.host.unregister_evaluator(name),
            ComponentKind::Service => Ok(self.host.remove_service(name)?.is_some()),
            ComponentKind::EventHandler => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::EventHandler;
    use crate::component::test_support::{
        NamedAction, NamedEvaluator, NamedProvider, TestService,
    };
    use crate::host::MemoryHost;

    fn setup(host: MemoryHost) -> (Arc<MemoryHost>, ComponentRegistrar) {
        let host = Arc::new(host);
        let originals = Arc::new(OriginalComponents::capture(host.as_ref()));
        let registrar = ComponentRegistrar::new(host.clone(), originals);
        (host, registrar)
    }

    async fn register(
        registrar: &ComponentRegistrar,
        id: PluginId,
        plugin: &Arc<PluginDescriptor>,
        set: &mut ComponentSet,
    ) -> Vec<ComponentRegistration> {
        let mut audit = Vec::new();
        registrar.register_all(id, plugin, set, &mut audit).await.unwrap();
        audit
    }

    fn full_plugin(name: &str) -> Arc<PluginDescriptor> {
        Arc::new(
            PluginDescriptor::new(name)
                .with_action(NamedAction::arc(&format!("{name}-act")))
                .with_provider(Arc::new(NamedProvider(format!("{name}-prov"))))
                .with_evaluator(Arc::new(NamedEvaluator(format!("{name}-eval"))))
                .with_event_handler("message", EventHandler::new(|_| async {}))
                .with_service(TestService::factory(&format!("{name}-svc"))),
        )
    }

    #[tokio::test]
    async fn register_then_unregister_restores_host() {
        let (host, registrar) = setup(MemoryHost::new());
        let plugin = full_plugin("p");
        let id = PluginId::from_name("p");
        let mut set = ComponentSet::default();

        let audit = register(&registrar, id, &plugin, &mut set).await;
        assert_eq!(audit.len(), 5);
        let kinds: Vec<_> = audit.iter().map(|r| r.component_type).collect();
        assert_eq!(
            kinds,
            vec![
                ComponentKind::Action,
                ComponentKind::Provider,
                ComponentKind::Evaluator,
                ComponentKind::EventHandler,
                ComponentKind::Service,
            ]
        );
        assert_eq!(host.action_names(), vec!["p-act"]);
        assert_eq!(host.service_types(), vec!["p-svc"]);
        assert_eq!(host.active_plugins().len(), 1);

        registrar.unregister_all(id, &plugin, &mut set).await.unwrap();
        assert!(set.is_empty());
        assert!(host.action_names().is_empty());
        assert!(host.provider_names().is_empty());
        assert!(host.evaluator_names().is_empty());
        assert!(host.event_handlers("message").is_empty());
        assert!(host.service_types().is_empty());
        assert!(host.active_plugins().is_empty());
    }

    #[tokio::test]
    async fn original_name_survives_unregister() {
        let (host, registrar) = setup(
            MemoryHost::new().with_plugin(
                PluginDescriptor::new("core").with_action(NamedAction::arc("reply")),
            ),
        );
        let plugin = Arc::new(
            PluginDescriptor::new("p")
                .with_action(NamedAction::arc("reply"))
                .with_action(NamedAction::arc("extra")),
        );
        let id = PluginId::from_name("p");
        let mut set = ComponentSet::default();

        let audit = register(&registrar, id, &plugin, &mut set).await;
        assert_eq!(audit.len(), 1);
        assert!(set.actions.contains("reply"));

        registrar.unregister_all(id, &plugin, &mut set).await.unwrap();
        assert_eq!(host.action_names(), vec!["reply"]);
        assert!(set.actions.is_empty());
    }

    #[tokio::test]
    async fn second_owner_is_skipped() {
        let (host, registrar) = setup(MemoryHost::new());
        let first =
            Arc::new(PluginDescriptor::new("first").with_action(NamedAction::arc("shared")));
        let second =
            Arc::new(PluginDescriptor::new("second").with_action(NamedAction::arc("shared")));
        let (a, b) = (PluginId::from_name("first"), PluginId::from_name("second"));
        let (mut set_a, mut set_b) = (ComponentSet::default(), ComponentSet::default());

        register(&registrar, a, &first, &mut set_a).await;
        let audit = register(&registrar, b, &second, &mut set_b).await;
        assert!(audit.is_empty());
        assert!(set_b.actions.is_empty());

        registrar.unregister_all(b, &second, &mut set_b).await.unwrap();
        assert_eq!(host.action_names(), vec!["shared"]);

        registrar.unregister_all(a, &first, &mut set_a).await.unwrap();
        assert!(host.action_names().is_empty());
    }

    #[tokio::test]
    async fn shared_event_keeps_other_handler() {
        let (host, registrar) = setup(MemoryHost::new());
        let h1 = EventHandler::new(|_| async {});
        let h2 = EventHandler::new(|_| async {});
        let one = Arc::new(
            PluginDescriptor::new("one")
                .with_action(NamedAction::arc("one-act"))
                .with_event_handler("message", h1.clone()),
        );
        let two = Arc::new(
            PluginDescriptor::new("two")
                .with_action(NamedAction::arc("two-act"))
                .with_event_handler("message", h2.clone()),
        );
        let (mut s1, mut s2) = (ComponentSet::default(), ComponentSet::default());
        register(&registrar, PluginId::from_name("one"), &one, &mut s1).await;
        register(&registrar, PluginId::from_name("two"), &two, &mut s2).await;

        registrar.unregister_all(PluginId::from_name("one"), &one, &mut s1).await.unwrap();
        assert_eq!(host.event_handlers("message"), vec![h2]);
    }

    #[tokio::test]
    async fn failed_service_start_does_not_abort() {
        let (host, registrar) = setup(MemoryHost::new());
        let broken = Arc::new(TestService {
            kind: "broken".into(),
            fail_start: true,
            fail_stop: false,
            stops: Arc::default(),
        });
        let plugin = Arc::new(
            PluginDescriptor::new("p")
                .with_service(broken)
                .with_service(TestService::factory("healthy")),
        );
        let mut set = ComponentSet::default();
        register(&registrar, PluginId::from_name("p"), &plugin, &mut set).await;
        assert_eq!(host.service_types(), vec!["healthy"]);
        assert_eq!(set.services.len(), 1);
    }

    #[tokio::test]
    async fn failing_stop_hook_still_removes_service() {
        let (host, registrar) = setup(MemoryHost::new());
        let factory = Arc::new(TestService {
            kind: "flaky".into(),
            fail_start: false,
            fail_stop: true,
            stops: Arc::default(),
        });
        let plugin = Arc::new(PluginDescriptor::new("p").with_service(factory.clone()));
        let id = PluginId::from_name("p");
        let mut set = ComponentSet::default();
        register(&registrar, id, &plugin, &mut set).await;

        registrar.unregister_all(id, &plugin, &mut set).await.unwrap();
        assert_eq!(factory.stop_count(), 1);
        assert!(host.service_types().is_empty());
        assert!(set.services.is_empty());
    }

    #[tokio::test]
    async fn original_service_type_not_started() {
        let original = TestService::factory("cache");
        let running = {
            let scratch: Arc<dyn PluginHost> = Arc::new(MemoryHost::new());
            use crate::component::ServiceFactory;
            original.start(scratch).await.unwrap()
        };
        let (host, registrar) = setup(MemoryHost::new().with_service(running));
        let replacement = TestService::factory("cache");
        let plugin = Arc::new(PluginDescriptor::new("p").with_service(replacement.clone()));
        let id = PluginId::from_name("p");
        let mut set = ComponentSet::default();

        register(&registrar, id, &plugin, &mut set).await;
        assert!(set.services.is_empty());
        registrar.unregister_all(id, &plugin, &mut set).await.unwrap();
        assert_eq!(host.service_types(), vec!["cache"]);
        assert_eq!(original.stop_count(), 0);
    }

    #[tokio::test]
    async fn forced_reregistration_replaces_own_entries() {
        let (host, registrar) = setup(MemoryHost::new());
        let plugin = full_plugin("p");
        let id = PluginId::from_name("p");
        let mut set = ComponentSet::default();
        register(&registrar, id, &plugin, &mut set).await;
        let again = register(&registrar, id, &plugin, &mut set).await;

        // Named components are re-applied; handlers and services are not
        // duplicated.
        assert_eq!(again.len(), 3);
        assert_eq!(host.event_handlers("message").len(), 1);
        assert_eq!(host.service_types(), vec!["p-svc"]);
    }
}

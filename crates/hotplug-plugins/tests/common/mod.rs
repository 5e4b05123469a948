//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use hotplug_plugins::{
    Action, Catalog, CatalogFetcher, CommandRunner, CommandSpec, EventHandler, Evaluator,
    HandlerId, MemoryHost, ManagerConfig, PluginDescriptor, PluginError, PluginHost,
    PluginManager, PluginResult, Provider, Service, ServiceFactory, StaticModuleResolver,
};
use hotplug_telemetry::{LogConfig, LogFormat, setup_logging};
use serde_json::Value;

static LOGGING: Once = Once::new();

/// Install a test subscriber once per test binary.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let config = LogConfig::new("debug").with_format(LogFormat::Compact);
        // Another harness may already own the global subscriber.
        let _ = setup_logging(&config);
    });
}

pub struct Echo(pub String);

#[async_trait]
impl Action for Echo {
    fn name(&self) -> &str {
        &self.0
    }

    async fn handle(&self, input: Value) -> PluginResult<Value> {
        Ok(input)
    }
}

pub fn action(name: &str) -> Arc<dyn Action> {
    Arc::new(Echo(name.to_owned()))
}

pub struct Fixed(pub String);

#[async_trait]
impl Provider for Fixed {
    fn name(&self) -> &str {
        &self.0
    }

    async fn get(&self, _query: &Value) -> PluginResult<Value> {
        Ok(Value::String(self.0.clone()))
    }
}

pub fn provider(name: &str) -> Arc<dyn Provider> {
    Arc::new(Fixed(name.to_owned()))
}

pub struct Always(pub String);

#[async_trait]
impl Evaluator for Always {
    fn name(&self) -> &str {
        &self.0
    }

    async fn evaluate(&self, _input: &Value) -> PluginResult<bool> {
        Ok(true)
    }
}

pub fn evaluator(name: &str) -> Arc<dyn Evaluator> {
    Arc::new(Always(name.to_owned()))
}

/// Service factory counting starts and stops.
#[derive(Default)]
pub struct Counting {
    pub kind: String,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
}

impl Counting {
    pub fn new(kind: &str) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.to_owned(),
            ..Self::default()
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct Running {
    kind: String,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for Running {
    fn service_type(&self) -> &str {
        &self.kind
    }

    async fn stop(&self) -> PluginResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ServiceFactory for Counting {
    fn service_type(&self) -> &str {
        &self.kind
    }

    async fn start(&self, _host: Arc<dyn PluginHost>) -> PluginResult<Arc<dyn Service>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Running {
            kind: self.kind.clone(),
            stops: Arc::clone(&self.stops),
        }))
    }
}

/// Stands in for npm and git: lays down the manifests it was given.
#[derive(Default)]
pub struct FakeToolchain {
    manifests: Mutex<HashMap<String, String>>,
    pub calls: Mutex<Vec<CommandSpec>>,
}

impl FakeToolchain {
    /// Serve `manifest` (a `package.json` body) for package or repo `key`.
    pub fn with_manifest(self, key: &str, manifest: &str) -> Self {
        self.manifests
            .lock()
            .unwrap()
            .insert(key.to_owned(), manifest.to_owned());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(ToString::to_string).collect()
    }

    fn lay_down(&self, key: &str, dir: &Path) -> PluginResult<()> {
        let manifest = self
            .manifests
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| PluginError::InstallFailed(format!("npm ERR! 404 '{key}' not found")))?;
        std::fs::create_dir_all(dir.join("dist"))?;
        std::fs::write(dir.join("package.json"), manifest)?;
        std::fs::write(dir.join("dist/index.js"), "module.exports = {}")?;
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for FakeToolchain {
    async fn run(&self, command: &CommandSpec) -> PluginResult<()> {
        self.calls.lock().unwrap().push(command.clone());
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["install", spec, "--prefix", prefix] => {
                let package = spec.rsplit_once('@').map_or(*spec, |(name, _)| name);
                let dir = PathBuf::from(prefix).join("node_modules").join(package);
                self.lay_down(package, &dir)
            },
            ["clone", "--", repo, dest] => self.lay_down(repo, Path::new(dest)),
            _ => Ok(()),
        }
    }
}

/// Registry fetcher replaying scripted responses, then failing.
pub struct ScriptedRegistry(Mutex<VecDeque<PluginResult<Catalog>>>);

impl ScriptedRegistry {
    pub fn new(responses: impl IntoIterator<Item = PluginResult<Catalog>>) -> Self {
        Self(Mutex::new(responses.into_iter().collect()))
    }

    pub fn offline() -> Self {
        Self::new([])
    }
}

#[async_trait]
impl CatalogFetcher for ScriptedRegistry {
    async fn fetch(&self) -> PluginResult<Catalog> {
        self.0.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(PluginError::RegistryError {
                message: "connection refused".into(),
            })
        })
    }
}

pub fn catalog(json: &str) -> Catalog {
    hotplug_plugins::catalog::parse_index(json).unwrap()
}

/// A manager wired to in-memory collaborators.
pub struct Harness {
    pub manager: PluginManager,
    pub host: Arc<MemoryHost>,
    pub resolver: Arc<StaticModuleResolver>,
    pub toolchain: Arc<FakeToolchain>,
    pub root: PathBuf,
}

impl Harness {
    pub fn new(host: MemoryHost, root: &Path) -> Self {
        Self::with(host, root, FakeToolchain::default(), ScriptedRegistry::offline())
    }

    pub fn with(
        host: MemoryHost,
        root: &Path,
        toolchain: FakeToolchain,
        registry: ScriptedRegistry,
    ) -> Self {
        init_logging();
        let host = Arc::new(host);
        let resolver = Arc::new(StaticModuleResolver::new());
        let toolchain = Arc::new(toolchain);
        let manager = PluginManager::new(
            host.clone(),
            ManagerConfig::new(root),
            resolver.clone(),
            toolchain.clone(),
            Box::new(registry),
        )
        .unwrap();
        Self {
            manager,
            host,
            resolver,
            toolchain,
            root: root.to_path_buf(),
        }
    }
}

/// A [`MemoryHost`] that refuses chosen mutations.
///
/// Refusals are keyed by operation and component name, e.g.
/// `("register_provider", "p1")`; event operations key on the event name.
#[derive(Default)]
pub struct FlakyHost {
    inner: MemoryHost,
    refused: Mutex<HashSet<(&'static str, String)>>,
}

impl FlakyHost {
    pub fn refuse(&self, op: &'static str, name: &str) {
        self.refused.lock().unwrap().insert((op, name.to_owned()));
    }

    pub fn allow(&self, op: &'static str, name: &str) {
        self.refused.lock().unwrap().remove(&(op, name.to_owned()));
    }

    fn check(&self, op: &'static str, name: &str) -> PluginResult<()> {
        if self.refused.lock().unwrap().contains(&(op, name.to_owned())) {
            Err(PluginError::HostError(format!("{op} '{name}' refused")))
        } else {
            Ok(())
        }
    }
}

impl PluginHost for FlakyHost {
    fn register_action(&self, action: Arc<dyn Action>) -> PluginResult<()> {
        self.check("register_action", action.name())?;
        self.inner.register_action(action)
    }

    fn unregister_action(&self, name: &str) -> PluginResult<bool> {
        self.check("unregister_action", name)?;
        self.inner.unregister_action(name)
    }

    fn action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.inner.action(name)
    }

    fn action_names(&self) -> Vec<String> {
        self.inner.action_names()
    }

    fn register_provider(&self, provider: Arc<dyn Provider>) -> PluginResult<()> {
        self.check("register_provider", provider.name())?;
        self.inner.register_provider(provider)
    }

    fn unregister_provider(&self, name: &str) -> PluginResult<bool> {
        self.check("unregister_provider", name)?;
        self.inner.unregister_provider(name)
    }

    fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.inner.provider(name)
    }

    fn provider_names(&self) -> Vec<String> {
        self.inner.provider_names()
    }

    fn register_evaluator(&self, evaluator: Arc<dyn Evaluator>) -> PluginResult<()> {
        self.check("register_evaluator", evaluator.name())?;
        self.inner.register_evaluator(evaluator)
    }

    fn unregister_evaluator(&self, name: &str) -> PluginResult<bool> {
        self.check("unregister_evaluator", name)?;
        self.inner.unregister_evaluator(name)
    }

    fn evaluator(&self, name: &str) -> Option<Arc<dyn Evaluator>> {
        self.inner.evaluator(name)
    }

    fn evaluator_names(&self) -> Vec<String> {
        self.inner.evaluator_names()
    }

    fn register_event(&self, event: &str, handler: EventHandler) -> PluginResult<()> {
        self.check("register_event", event)?;
        self.inner.register_event(event, handler)
    }

    fn unregister_event(&self, event: &str, handler: HandlerId) -> PluginResult<bool> {
        self.check("unregister_event", event)?;
        self.inner.unregister_event(event, handler)
    }

    fn event_handlers(&self, event: &str) -> Vec<EventHandler> {
        self.inner.event_handlers(event)
    }

    fn service(&self, service_type: &str) -> Option<Arc<dyn Service>> {
        self.inner.service(service_type)
    }

    fn set_service(&self, service_type: &str, service: Arc<dyn Service>) -> PluginResult<()> {
        self.check("set_service", service_type)?;
        self.inner.set_service(service_type, service)
    }

    fn remove_service(&self, service_type: &str) -> PluginResult<Option<Arc<dyn Service>>> {
        self.check("remove_service", service_type)?;
        self.inner.remove_service(service_type)
    }

    fn service_types(&self) -> Vec<String> {
        self.inner.service_types()
    }

    fn add_active_plugin(&self, plugin: Arc<PluginDescriptor>) {
        self.inner.add_active_plugin(plugin);
    }

    fn remove_active_plugin(&self, name: &str) -> bool {
        self.inner.remove_active_plugin(name)
    }

    fn active_plugins(&self) -> Vec<Arc<PluginDescriptor>> {
        self.inner.active_plugins()
    }

    fn setting(&self, key: &str) -> Option<String> {
        self.inner.setting(key)
    }
}

/// A manager over any host, with no toolchain and an offline registry.
pub fn manager_on(host: Arc<dyn PluginHost>, root: &Path) -> PluginManager {
    init_logging();
    PluginManager::new(
        host,
        ManagerConfig::new(root),
        Arc::new(StaticModuleResolver::new()),
        Arc::new(FakeToolchain::default()),
        Box::new(ScriptedRegistry::offline()),
    )
    .unwrap()
}

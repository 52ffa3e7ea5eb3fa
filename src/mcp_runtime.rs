// agentry/src/mcp_runtime.rs

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{RegistryError, Result},
    launcher::{Launcher, ProcessLauncher, ProviderConnection},
    layered_config::RuntimeConfig,
    registry::Registry,
};

/// Lifecycle of one named provider within a session.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProviderState {
    Unstarted,
    Launching,
    Ready,
    /// Launch or handshake failed. A later acquire tries again.
    Failed { reason: String },
    Stopped,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProviderEvent {
    pub name: String,
    #[serde(flatten)]
    pub state: ProviderState,
}

/// Shared reference to a live provider. Clones point at the same instance.
#[derive(Clone)]
pub struct ProviderHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: String,
    instance_id: Uuid,
    started_at: DateTime<Utc>,
    connection: ProviderConnection,
    request_timeout: Duration,
}

impl ProviderHandle {
    fn new(name: &str, connection: ProviderConnection, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name: name.to_string(),
                instance_id: Uuid::new_v4(),
                started_at: Utc::now(),
                connection,
                request_timeout,
            }),
        }
    }

    pub fn name(&self) -> &str { &self.inner.name }
    pub fn instance_id(&self) -> Uuid { self.inner.instance_id }
    pub fn started_at(&self) -> DateTime<Utc> { self.inner.started_at }

    pub fn pid(&self) -> Option<u32> {
        match &self.inner.connection {
            ProviderConnection::Stdio { client, .. } => client.pid(),
            ProviderConnection::Remote { .. } => None,
        }
    }

    /// What the server reported about itself during the handshake.
    pub fn server_info(&self) -> Option<&Value> {
        match &self.inner.connection {
            ProviderConnection::Stdio { server_info, .. } => Some(server_info),
            ProviderConnection::Remote { .. } => None,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match &self.inner.connection {
            ProviderConnection::Remote { url } => Some(url.as_str()),
            ProviderConnection::Stdio { .. } => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        match &self.inner.connection {
            ProviderConnection::Stdio { client, .. } => client.is_alive(),
            ProviderConnection::Remote { .. } => true,
        }
    }

    pub fn same_instance(&self, other: &ProviderHandle) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    /// Send a JSON-RPC request and wait (bounded by the request timeout) for its result.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        match &self.inner.connection {
            ProviderConnection::Stdio { client, .. } => client
                .request(method, params, self.inner.request_timeout)
                .await
                .map_err(|e| RegistryError::Request { name: self.inner.name.clone(), reason: format!("{e:#}") }),
            ProviderConnection::Remote { url } => Err(self.not_over_stdio(url)),
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        match &self.inner.connection {
            ProviderConnection::Stdio { client, .. } => client
                .notify(method, params)
                .await
                .map_err(|e| RegistryError::Request { name: self.inner.name.clone(), reason: format!("{e:#}") }),
            ProviderConnection::Remote { url } => Err(self.not_over_stdio(url)),
        }
    }

    fn not_over_stdio(&self, url: &str) -> RegistryError {
        RegistryError::Request {
            name: self.inner.name.clone(),
            reason: format!("remote provider at {url} is not reachable over stdio"),
        }
    }

    async fn close(&self, grace: Duration) {
        if let ProviderConnection::Stdio { client, .. } = &self.inner.connection {
            client.shutdown(grace).await;
        }
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("name", &self.inner.name)
            .field("instance_id", &self.inner.instance_id)
            .field("pid", &self.pid())
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RuntimeSettings {
    pub launch_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl From<&RuntimeConfig> for RuntimeSettings {
    fn from(c: &RuntimeConfig) -> Self {
        Self {
            launch_timeout: c.launch_timeout(),
            request_timeout: c.request_timeout(),
            shutdown_grace: c.shutdown_grace(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self { (&RuntimeConfig::default()).into() }
}

#[derive(Default)]
struct Slot {
    handle: Option<ProviderHandle>,
    /// Attempt number and reason of the most recent failed launch.
    failure: Option<(u64, String)>,
}

/// Launch attempts are numbered so callers that queued behind one share its outcome.
#[derive(Default)]
struct SlotCell {
    started: AtomicU64,
    finished: AtomicU64,
    slot: AsyncMutex<Slot>,
}

impl SlotCell {
    /// The attempt running right now, if any.
    fn in_flight(&self) -> Option<u64> {
        let started = self.started.load(Ordering::Acquire);
        (started > self.finished.load(Ordering::Acquire)).then_some(started)
    }
}

type States = Arc<RwLock<BTreeMap<String, ProviderState>>>;

/// One host session's tool providers: lazily started, at most one instance per name.
pub struct McpRuntime {
    registry: Arc<Registry>,
    launcher: Arc<dyn Launcher>,
    settings: RuntimeSettings,
    session_id: Uuid,
    slots: Mutex<BTreeMap<String, Arc<SlotCell>>>,
    state: States,
    events: broadcast::Sender<ProviderEvent>,
}

impl McpRuntime {
    pub fn new(registry: Arc<Registry>, launcher: Arc<dyn Launcher>, settings: RuntimeSettings) -> Self {
        Self {
            registry,
            launcher,
            settings,
            session_id: Uuid::new_v4(),
            slots: Mutex::new(BTreeMap::new()),
            state: Arc::new(RwLock::new(BTreeMap::new())),
            events: broadcast::channel(64).0,
        }
    }

    /// Runtime that spawns real processes.
    pub fn with_process_launcher(registry: Arc<Registry>, settings: RuntimeSettings) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(settings.launch_timeout));
        Self::new(registry, launcher, settings)
    }

    pub fn session_id(&self) -> Uuid { self.session_id }
    pub fn registry(&self) -> &Arc<Registry> { &self.registry }
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> { self.events.subscribe() }

    pub fn state(&self, name: &str) -> Result<ProviderState> {
        self.registry.provider(name)?;
        Ok(self.state.read().get(name).cloned().unwrap_or(ProviderState::Unstarted))
    }

    /// State of every known provider, in name order.
    pub fn snapshot(&self) -> BTreeMap<String, ProviderState> {
        let state = self.state.read();
        self.registry
            .providers()
            .map(|p| (p.name.clone(), state.get(&p.name).cloned().unwrap_or(ProviderState::Unstarted)))
            .collect()
    }

    /// The per-name critical section. The map lock is never held across an await.
    fn slot(&self, name: &str) -> Arc<SlotCell> {
        self.slots.lock().entry(name.to_string()).or_default().clone()
    }

    /// Return the live handle for `name`, starting the provider if needed.
    ///
    /// Concurrent callers for the same name share one launch: the first one
    /// starts the process, the rest wait on the slot and get its outcome,
    /// handle or error. Only an acquire that starts after a failure retries.
    pub async fn acquire(&self, name: &str) -> Result<ProviderHandle> {
        let desc = self.registry.provider(name)?;
        if !desc.enabled {
            return Err(RegistryError::launch(name, "provider is disabled"));
        }
        let cell = self.slot(name);
        let joined = cell.in_flight();
        let mut slot = cell.slot.lock().await;

        if let (Some(attempt), Some((failed, reason))) = (joined, &slot.failure) {
            if attempt == *failed {
                return Err(RegistryError::launch(name, reason.clone()));
            }
        }

        if let Some(handle) = &slot.handle {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            info!(provider = name, "provider process has exited; relaunching");
            slot.handle = None;
            transition(&self.state, &self.events, name, ProviderState::Stopped);
        }

        let attempt = cell.started.fetch_add(1, Ordering::AcqRel) + 1;
        transition(&self.state, &self.events, name, ProviderState::Launching);
        let budget = desc.timeout().unwrap_or(self.settings.launch_timeout);
        let outcome = match tokio::time::timeout(budget, self.launcher.launch(&desc)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("launch timed out after {}ms", budget.as_millis())),
        };
        cell.finished.store(attempt, Ordering::Release);

        match outcome {
            Ok(connection) => {
                let handle = ProviderHandle::new(name, connection, self.settings.request_timeout);
                self.watch_exit(&handle, cell.clone());
                slot.handle = Some(handle.clone());
                slot.failure = None;
                transition(&self.state, &self.events, name, ProviderState::Ready);
                info!(provider = name, pid = handle.pid(), instance = %handle.instance_id(), "provider ready");
                Ok(handle)
            }
            Err(reason) => {
                warn!(provider = name, %reason, "provider launch failed");
                transition(&self.state, &self.events, name, ProviderState::Failed { reason: reason.clone() });
                slot.failure = Some((attempt, reason.clone()));
                Err(RegistryError::launch(name, reason))
            }
        }
    }

    /// Moves the slot to `Stopped` when the process goes away on its own.
    fn watch_exit(&self, handle: &ProviderHandle, cell: Arc<SlotCell>) {
        let ProviderConnection::Stdio { client, .. } = &handle.inner.connection else { return; };
        let mut exited = client.exit_watch();
        let (state, events) = (self.state.clone(), self.events.clone());
        let (name, instance) = (handle.name().to_string(), handle.instance_id());
        tokio::spawn(async move {
            let _ = exited.wait_for(|alive| !*alive).await;
            let mut slot = cell.slot.lock().await;
            if slot.handle.as_ref().is_some_and(|h| h.instance_id() == instance) {
                slot.handle = None;
                info!(provider = %name, "provider process exited");
                transition(&state, &events, &name, ProviderState::Stopped);
            }
        });
    }

    /// Stop `name` if it is running. Returns whether anything was stopped.
    pub async fn stop(&self, name: &str) -> Result<bool> {
        self.registry.provider(name)?;
        let cell = self.slot(name);
        let mut slot = cell.slot.lock().await;
        let Some(handle) = slot.handle.take() else { return Ok(false); };
        handle.close(self.settings.shutdown_grace).await;
        transition(&self.state, &self.events, name, ProviderState::Stopped);
        info!(provider = name, "provider stopped");
        Ok(true)
    }

    /// Session teardown: stop everything that is running.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.slots.lock().keys().cloned().collect();
        let results = join_all(names.iter().map(|n| self.stop(n))).await;
        let stopped = results.into_iter().filter(|r| matches!(r, Ok(true))).count();
        debug!(session = %self.session_id, stopped, "session shut down");
    }
}

fn transition(state: &States, events: &broadcast::Sender<ProviderEvent>, name: &str, next: ProviderState) {
    debug!(provider = name, state = ?next, "provider state");
    state.write().insert(name.to_string(), next.clone());
    let _ = events.send(ProviderEvent { name: name.to_string(), state: next });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provider::{DocumentFormat, ProviderSource, ToolProviderDescriptor},
        registry::DefinitionSources,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts launches; each takes `delay` and yields a remote-style connection.
    struct CountingLauncher {
        launches: AtomicUsize,
        delay: Duration,
        fail_first: usize,
        slow: Option<(&'static str, Duration)>,
    }

    impl CountingLauncher {
        fn new(delay: Duration) -> Self {
            Self { launches: AtomicUsize::new(0), delay, fail_first: 0, slow: None }
        }
        fn count(&self) -> usize { self.launches.load(Ordering::SeqCst) }
    }

    #[async_trait]
    impl Launcher for CountingLauncher {
        async fn launch(&self, d: &ToolProviderDescriptor) -> anyhow::Result<ProviderConnection> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            let delay = match self.slow {
                Some((name, slow)) if name == d.name => slow,
                _ => self.delay,
            };
            tokio::time::sleep(delay).await;
            if n < self.fail_first {
                anyhow::bail!("`node` was not found on PATH");
            }
            Ok(ProviderConnection::Remote { url: format!("test://{}/{n}", d.name) })
        }
    }

    fn registry() -> Arc<Registry> {
        let doc = r#"{"mcp":{
            "docs-rs":{"type":"local","command":["npx","-y","docs-rs-mcp"]},
            "fetch":{"type":"local","command":["uvx","mcp-server-fetch"],"timeout":50},
            "memory":{"type":"local","command":["npx","server-memory"],"enabled":false}
        }}"#;
        let sources = DefinitionSources {
            agents: vec![],
            providers: vec![ProviderSource::new("providers.json", DocumentFormat::Json, doc)],
        };
        Arc::new(Registry::load_definitions(sources).unwrap())
    }

    fn runtime(launcher: Arc<CountingLauncher>) -> McpRuntime {
        McpRuntime::new(registry(), launcher, RuntimeSettings::default())
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_launch() {
        let launcher = Arc::new(CountingLauncher::new(Duration::from_millis(20)));
        let rt = runtime(launcher.clone());
        let (a, b) = tokio::join!(rt.acquire("docs-rs"), rt.acquire("docs-rs"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(launcher.count(), 1);
        assert!(a.same_instance(&b));
        assert_eq!(rt.state("docs-rs").unwrap(), ProviderState::Ready);
    }

    #[tokio::test]
    async fn ready_provider_is_reused_without_relaunch() {
        let launcher = Arc::new(CountingLauncher::new(Duration::ZERO));
        let rt = runtime(launcher.clone());
        let mut events = rt.subscribe();
        assert_eq!(rt.state("docs-rs").unwrap(), ProviderState::Unstarted);
        let first = rt.acquire("docs-rs").await.unwrap();
        let second = rt.acquire("docs-rs").await.unwrap();
        assert!(first.same_instance(&second));
        assert_eq!(launcher.count(), 1);
        assert_eq!(events.recv().await.unwrap().state, ProviderState::Launching);
        assert_eq!(events.recv().await.unwrap().state, ProviderState::Ready);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn launch_failure_is_reported_and_retryable() {
        let launcher = Arc::new(CountingLauncher { fail_first: 1, ..CountingLauncher::new(Duration::ZERO) });
        let rt = runtime(launcher.clone());
        let err = rt.acquire("docs-rs").await.unwrap_err();
        assert!(matches!(err, RegistryError::ProviderLaunch { .. }));
        assert!(matches!(rt.state("docs-rs").unwrap(), ProviderState::Failed { .. }));
        // Other providers are unaffected.
        rt.acquire("fetch").await.unwrap();
        rt.acquire("docs-rs").await.unwrap();
        assert_eq!(rt.state("docs-rs").unwrap(), ProviderState::Ready);
        assert_eq!(launcher.count(), 3);
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_failed_launch() {
        let launcher = Arc::new(CountingLauncher { fail_first: 1, ..CountingLauncher::new(Duration::from_millis(50)) });
        let rt = runtime(launcher.clone());
        let (a, b) = tokio::join!(rt.acquire("docs-rs"), rt.acquire("docs-rs"));
        assert!(matches!(a, Err(RegistryError::ProviderLaunch { .. })));
        assert!(matches!(b, Err(RegistryError::ProviderLaunch { .. })));
        assert_eq!(launcher.count(), 1);
        assert!(matches!(rt.state("docs-rs").unwrap(), ProviderState::Failed { .. }));

        // A later acquire, not overlapping the failed one, tries again.
        rt.acquire("docs-rs").await.unwrap();
        assert_eq!(launcher.count(), 2);
    }

    #[tokio::test]
    async fn hung_launch_times_out_into_failed() {
        let launcher = Arc::new(CountingLauncher::new(Duration::from_secs(5)));
        let rt = runtime(launcher.clone());
        // `fetch` carries a 50ms budget.
        let err = rt.acquire("fetch").await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(matches!(rt.state("fetch").unwrap(), ProviderState::Failed { .. }));
        assert_eq!(launcher.count(), 1);
    }

    #[tokio::test]
    async fn launching_one_provider_does_not_block_another() {
        let launcher = Arc::new(CountingLauncher {
            slow: Some(("docs-rs", Duration::from_secs(5))),
            ..CountingLauncher::new(Duration::ZERO)
        });
        let rt = Arc::new(runtime(launcher.clone()));
        let fetch = rt.acquire("fetch").await.unwrap();

        let pending = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.acquire("docs-rs").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rt.state("docs-rs").unwrap(), ProviderState::Launching);

        let again = tokio::time::timeout(Duration::from_secs(1), rt.acquire("fetch"))
            .await
            .expect("acquire of a ready provider waited on an unrelated launch")
            .unwrap();
        assert!(again.same_instance(&fetch));
        pending.abort();
    }

    #[tokio::test]
    async fn disabled_and_unknown_providers() {
        let launcher = Arc::new(CountingLauncher::new(Duration::ZERO));
        let rt = runtime(launcher.clone());
        assert!(matches!(rt.acquire("memory").await, Err(RegistryError::ProviderLaunch { .. })));
        assert!(matches!(rt.acquire("nope").await, Err(RegistryError::NotFound { .. })));
        assert!(matches!(rt.stop("nope").await, Err(RegistryError::NotFound { .. })));
        assert_eq!(launcher.count(), 0);
    }

    #[tokio::test]
    async fn stop_then_acquire_relaunches() {
        let launcher = Arc::new(CountingLauncher::new(Duration::ZERO));
        let rt = runtime(launcher.clone());
        assert!(!rt.stop("docs-rs").await.unwrap());
        let first = rt.acquire("docs-rs").await.unwrap();
        assert!(rt.stop("docs-rs").await.unwrap());
        assert_eq!(rt.state("docs-rs").unwrap(), ProviderState::Stopped);
        let second = rt.acquire("docs-rs").await.unwrap();
        assert!(!first.same_instance(&second));
        assert_eq!(launcher.count(), 2);
        rt.shutdown().await;
        assert_eq!(rt.snapshot().get("docs-rs"), Some(&ProviderState::Stopped));
        assert_eq!(rt.snapshot().get("memory"), Some(&ProviderState::Unstarted));
    }
}

// ABOUTME: Extension manager: discovery catalog, transactional load/unload/reload, dispatch.
// ABOUTME: Each loaded extension gets its own ordered dispatch worker for failure isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commands::{CommandRegistry, CommandScope};
use crate::events::{GatewayEvent, LogEvent};
use crate::extension::{Extension, ExtensionContext, ExtensionError, ListenerReg};
use crate::metrics;
use crate::sink::SinkHandle;

/// Per-extension event queue depth. Dispatch applies backpressure to the
/// supervisor loop when a worker falls this far behind.
const WORKER_QUEUE_DEPTH: usize = 64;

/// Factory producing a fresh extension instance on each load.
pub type ExtensionFactory = Box<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// The discovery set: extension names known at boot.
#[derive(Default)]
pub struct ExtensionCatalog {
    factories: HashMap<String, ExtensionFactory>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, factory: ExtensionFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<&ExtensionFactory> {
        self.factories.get(name)
    }
}

/// Background worker delivering events to one extension's listeners in
/// arrival order. A failing or slow handler here cannot affect any other
/// extension's worker.
struct DispatchWorker {
    tx: mpsc::Sender<Arc<GatewayEvent>>,
    kinds: Vec<crate::events::EventKind>,
    in_flight: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl DispatchWorker {
    fn spawn(name: &str, listeners: Vec<ListenerReg>, sink: SinkHandle) -> Self {
        let (tx, mut rx) = mpsc::channel::<Arc<GatewayEvent>>(WORKER_QUEUE_DEPTH);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let kinds: Vec<_> = listeners.iter().map(|reg| reg.kind.clone()).collect();

        let worker_name = name.to_string();
        let worker_in_flight = Arc::clone(&in_flight);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for reg in listeners.iter().filter(|reg| reg.kind == event.kind) {
                    if let Err(e) = reg.listener.handle(&event).await {
                        tracing::error!(
                            extension = %worker_name,
                            event_id = %event.id,
                            kind = event.kind.as_str(),
                            error = %e,
                            "Extension handler failed"
                        );
                        metrics::record_handler_error(&worker_name);
                        sink.enqueue(
                            LogEvent::error(
                                format!("extension:{}", worker_name),
                                format!("handler for {} failed: {}", event.kind.as_str(), e),
                            )
                            .with_context(serde_json::json!({ "event_id": event.id })),
                        );
                    }
                }
                worker_in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self {
            tx,
            kinds,
            in_flight,
            task,
        }
    }

    fn subscribes_to(&self, kind: &crate::events::EventKind) -> bool {
        self.kinds.contains(kind)
    }

    /// Stop the worker: close the queue, wait out the grace period, then
    /// abandon whatever is still running.
    async fn shutdown(self, grace: Duration) {
        drop(self.tx);
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!("Dispatch worker exceeded drain grace, abandoning in-flight handler");
            task.abort();
        }
    }
}

struct LoadedExtension {
    /// (scope, name) pairs in registration order, for clean reverse unwind
    commands: Vec<(CommandScope, String)>,
    worker: DispatchWorker,
}

struct ManagerState {
    registry: CommandRegistry,
    loaded: HashMap<String, LoadedExtension>,
}

/// Owns the extension registry and the command registry under a
/// single-writer discipline: load/unload/reload are serialized through one
/// async mutex and never run concurrently with each other.
pub struct ExtensionManager {
    catalog: ExtensionCatalog,
    guild_id: u64,
    sink: SinkHandle,
    drain_grace: Duration,
    state: tokio::sync::Mutex<ManagerState>,
}

impl ExtensionManager {
    pub fn new(catalog: ExtensionCatalog, guild_id: u64, sink: SinkHandle, drain_grace: Duration) -> Self {
        Self {
            catalog,
            guild_id,
            sink,
            drain_grace,
            state: tokio::sync::Mutex::new(ManagerState {
                registry: CommandRegistry::new(),
                loaded: HashMap::new(),
            }),
        }
    }

    /// Load one extension, registering its commands and listeners
    /// transactionally. A failure at any step rolls back every partial
    /// registration from this attempt.
    pub async fn load(&self, name: &str) -> Result<(), ExtensionError> {
        let mut state = self.state.lock().await;
        self.load_locked(&mut state, name)
    }

    /// Remove every command/listener the named extension contributed, in
    /// reverse registration order. Unloading an extension that is not
    /// currently loaded is a no-op as long as the name is known.
    pub async fn unload(&self, name: &str) -> Result<(), ExtensionError> {
        let mut state = self.state.lock().await;
        if let Some(worker) = self.unload_locked(&mut state, name)? {
            drop(state);
            worker.shutdown(self.drain_grace).await;
        }
        Ok(())
    }

    /// Unload followed by load under one lock, so observers never see an
    /// intermediate state. A failure in the load half leaves the extension
    /// unloaded rather than half-loaded.
    pub async fn reload(&self, name: &str) -> Result<(), ExtensionError> {
        let mut state = self.state.lock().await;
        let worker = self.unload_locked(&mut state, name)?;
        let result = self.load_locked(&mut state, name);
        drop(state);
        if let Some(worker) = worker {
            worker.shutdown(self.drain_grace).await;
        }
        result
    }

    /// Load every named extension. Individual failures are isolated:
    /// logged, reported to the sink, and skipped.
    pub async fn load_all(&self, names: &[String]) {
        for name in names {
            match self.load(name).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(extension = %name, error = %e, "Failed to load extension");
                    self.sink.enqueue(LogEvent::error(
                        "manager",
                        format!("failed to load extension '{}': {}", name, e),
                    ));
                }
            }
        }
    }

    /// Unload everything, used during ordered process teardown.
    pub async fn unload_all(&self) {
        let names = self.loaded_names().await;
        for name in names {
            if let Err(e) = self.unload(&name).await {
                tracing::error!(extension = %name, error = %e, "Failed to unload extension");
            }
        }
    }

    fn load_locked(&self, state: &mut ManagerState, name: &str) -> Result<(), ExtensionError> {
        if state.loaded.contains_key(name) {
            return Err(ExtensionError::AlreadyLoaded(name.to_string()));
        }
        let factory = self
            .catalog
            .get(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;

        let extension = factory();
        let mut ctx = ExtensionContext::new(self.guild_id, self.sink.clone());
        extension
            .register(&mut ctx)
            .map_err(|source| ExtensionError::LoadFailed {
                name: name.to_string(),
                source,
            })?;
        let (commands, listeners) = ctx.into_parts();

        // Register commands transactionally: a conflict unwinds everything
        // this attempt already registered, in reverse order.
        let mut registered: Vec<(CommandScope, String)> = Vec::new();
        for def in commands {
            let key = (def.scope.clone(), def.name.clone());
            match state.registry.register(def, name) {
                Ok(()) => registered.push(key),
                Err(conflict) => {
                    for (scope, cmd) in registered.iter().rev() {
                        state.registry.unregister(scope, cmd);
                    }
                    return Err(conflict.into());
                }
            }
        }

        let worker = DispatchWorker::spawn(name, listeners, self.sink.clone());
        state.loaded.insert(
            name.to_string(),
            LoadedExtension {
                commands: registered,
                worker,
            },
        );
        metrics::set_loaded_extensions(state.loaded.len() as u64);
        tracing::info!(extension = %name, "Loaded extension");
        Ok(())
    }

    /// Remove the extension's registrations; the caller shuts the returned
    /// worker down outside the state lock.
    fn unload_locked(
        &self,
        state: &mut ManagerState,
        name: &str,
    ) -> Result<Option<DispatchWorker>, ExtensionError> {
        let Some(loaded) = state.loaded.remove(name) else {
            if !self.catalog.contains(name) {
                return Err(ExtensionError::NotFound(name.to_string()));
            }
            return Ok(None);
        };

        for (scope, cmd) in loaded.commands.iter().rev() {
            state.registry.unregister(scope, cmd);
        }
        metrics::set_loaded_extensions(state.loaded.len() as u64);
        tracing::info!(extension = %name, "Unloaded extension");
        Ok(Some(loaded.worker))
    }

    /// Route one inbound event to every subscribed extension's worker.
    /// Sends apply backpressure when a worker queue is full; worker errors
    /// never propagate here.
    pub async fn dispatch(&self, event: GatewayEvent) {
        let event = Arc::new(event);

        // Collect targets under the lock, send outside it so a slow worker
        // cannot stall load/unload.
        let targets: Vec<(String, mpsc::Sender<Arc<GatewayEvent>>, Arc<AtomicUsize>)> = {
            let state = self.state.lock().await;
            state
                .loaded
                .iter()
                .filter(|(_, ext)| ext.worker.subscribes_to(&event.kind))
                .map(|(name, ext)| {
                    (
                        name.clone(),
                        ext.worker.tx.clone(),
                        Arc::clone(&ext.worker.in_flight),
                    )
                })
                .collect()
        };

        metrics::record_event_dispatched(event.kind.as_str());

        for (name, tx, in_flight) in targets {
            in_flight.fetch_add(1, Ordering::SeqCst);
            if tx.send(Arc::clone(&event)).await.is_err() {
                in_flight.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(extension = %name, "Dispatch worker gone, event not delivered");
            }
        }
    }

    /// Wait until every worker has drained its queue and finished its
    /// current handler, or the grace period elapses. Used before reconnect
    /// transitions so handlers never race a torn-down session.
    pub async fn quiesce(&self, grace: Duration) {
        let counters: Vec<Arc<AtomicUsize>> = {
            let state = self.state.lock().await;
            state
                .loaded
                .values()
                .map(|ext| Arc::clone(&ext.worker.in_flight))
                .collect()
        };

        let deadline = Instant::now() + grace;
        loop {
            if counters.iter().all(|c| c.load(Ordering::SeqCst) == 0) {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Dispatch quiesce grace elapsed with handlers still in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cloned snapshot of the command registry for the synchronizer.
    pub async fn registry_snapshot(&self) -> CommandRegistry {
        self.state.lock().await.registry.clone()
    }

    pub async fn loaded_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.loaded.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn catalog_names(&self) -> Vec<String> {
        self.catalog.names()
    }
}

// ABOUTME: Tests for the extension manager lifecycle and dispatch isolation
// ABOUTME: Covers transactional load/unload/reload, command conflicts, and ordered delivery

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use chirp::commands::{CommandDef, CommandScope};
use chirp::events::{EventKind, GatewayEvent, LogEvent};
use chirp::extension::{EventListener, Extension, ExtensionContext, ExtensionError};
use chirp::manager::{ExtensionCatalog, ExtensionManager};
use chirp::sink::{LogDelivery, SinkConfig, WebhookSink};

struct NullDelivery;

#[async_trait]
impl LogDelivery for NullDelivery {
    async fn deliver(&self, _batch: &[LogEvent]) -> anyhow::Result<()> {
        Ok(())
    }
}

fn test_sink() -> WebhookSink {
    WebhookSink::spawn(
        SinkConfig {
            queue_capacity: 64,
            batch_size: 16,
            min_interval: Duration::from_millis(1),
            retry_budget: 0,
            retry_delay: Duration::from_millis(1),
            flush_deadline: Duration::from_secs(1),
        },
        Arc::new(NullDelivery),
    )
}

fn test_manager(catalog: ExtensionCatalog) -> (ExtensionManager, WebhookSink) {
    let sink = test_sink();
    let manager = ExtensionManager::new(catalog, 7, sink.handle(), Duration::from_millis(500));
    (manager, sink)
}

/// Extension registering a fixed command list under its own name.
struct CommandsExt {
    name: &'static str,
    commands: Vec<&'static str>,
}

impl Extension for CommandsExt {
    fn name(&self) -> &str {
        self.name
    }

    fn register(&self, ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        for command in &self.commands {
            ctx.command(CommandDef::new(*command, "test command", CommandScope::Global));
        }
        Ok(())
    }
}

/// Listener recording the payload "n" field of each event it sees.
struct Recorder {
    seen: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl EventListener for Recorder {
    async fn handle(&self, event: &GatewayEvent) -> anyhow::Result<()> {
        let n = event.payload.get("n").and_then(|n| n.as_i64()).unwrap_or(-1);
        self.seen.lock().unwrap().push(n);
        Ok(())
    }
}

struct RecorderExt {
    name: &'static str,
    seen: Arc<Mutex<Vec<i64>>>,
}

impl Extension for RecorderExt {
    fn name(&self) -> &str {
        self.name
    }

    fn register(&self, ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        ctx.listen(
            EventKind::MessageCreate,
            Arc::new(Recorder {
                seen: Arc::clone(&self.seen),
            }),
        );
        Ok(())
    }
}

struct FailingHandlerExt;

struct FailingListener;

#[async_trait]
impl EventListener for FailingListener {
    async fn handle(&self, _event: &GatewayEvent) -> anyhow::Result<()> {
        anyhow::bail!("intentional handler failure")
    }
}

impl Extension for FailingHandlerExt {
    fn name(&self) -> &str {
        "fail"
    }

    fn register(&self, ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        ctx.listen(EventKind::MessageCreate, Arc::new(FailingListener));
        Ok(())
    }
}

fn commands_catalog(entries: &[(&'static str, Vec<&'static str>)]) -> ExtensionCatalog {
    let mut catalog = ExtensionCatalog::new();
    for (name, commands) in entries {
        let name = *name;
        let commands = commands.clone();
        catalog.insert(
            name,
            Box::new(move || {
                Box::new(CommandsExt {
                    name,
                    commands: commands.clone(),
                })
            }),
        );
    }
    catalog
}

#[tokio::test]
async fn test_load_registers_commands_and_unload_removes_them() {
    let catalog = commands_catalog(&[("a", vec!["ping", "echo"])]);
    let (manager, sink) = test_manager(catalog);

    manager.load("a").await.unwrap();
    let registry = manager.registry_snapshot().await;
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.owner_of(&CommandScope::Global, "ping"), Some("a"));

    manager.unload("a").await.unwrap();
    let registry = manager.registry_snapshot().await;
    assert!(registry.is_empty());
    assert!(manager.loaded_names().await.is_empty());

    sink.shutdown().await;
}

#[tokio::test]
async fn test_unload_leaves_other_extensions_untouched() {
    let catalog = commands_catalog(&[("a", vec!["ping"]), ("b", vec!["echo", "stats"])]);
    let (manager, sink) = test_manager(catalog);

    manager.load("a").await.unwrap();
    manager.load("b").await.unwrap();
    assert_eq!(manager.registry_snapshot().await.len(), 3);

    manager.unload("a").await.unwrap();

    let registry = manager.registry_snapshot().await;
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.owner_of(&CommandScope::Global, "echo"), Some("b"));
    assert_eq!(registry.owner_of(&CommandScope::Global, "ping"), None);

    sink.shutdown().await;
}

#[tokio::test]
async fn test_conflicting_load_rolls_back_completely() {
    // "b" declares a fresh command plus one that collides with "a"
    let catalog = commands_catalog(&[("a", vec!["ping"]), ("b", vec!["echo", "ping"])]);
    let (manager, sink) = test_manager(catalog);

    manager.load("a").await.unwrap();
    let before = chirp::sync::fingerprint(
        &manager
            .registry_snapshot()
            .await
            .commands_for_scope(&CommandScope::Global),
    );

    let err = manager.load("b").await.unwrap_err();
    assert!(matches!(err, ExtensionError::CommandConflict(_)));

    // "b" is not loaded and none of its commands leaked into the registry
    assert_eq!(manager.loaded_names().await, vec!["a".to_string()]);
    let registry = manager.registry_snapshot().await;
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.owner_of(&CommandScope::Global, "ping"), Some("a"));
    assert_eq!(registry.owner_of(&CommandScope::Global, "echo"), None);

    // The command tree is byte-for-byte what it was before the failed load
    let after = chirp::sync::fingerprint(&registry.commands_for_scope(&CommandScope::Global));
    assert_eq!(before, after);

    sink.shutdown().await;
}

#[tokio::test]
async fn test_load_unknown_extension_fails() {
    let (manager, sink) = test_manager(ExtensionCatalog::new());

    let err = manager.load("ghost").await.unwrap_err();
    assert!(matches!(err, ExtensionError::NotFound(_)));

    sink.shutdown().await;
}

#[tokio::test]
async fn test_double_load_fails() {
    let catalog = commands_catalog(&[("a", vec!["ping"])]);
    let (manager, sink) = test_manager(catalog);

    manager.load("a").await.unwrap();
    let err = manager.load("a").await.unwrap_err();
    assert!(matches!(err, ExtensionError::AlreadyLoaded(_)));

    sink.shutdown().await;
}

#[tokio::test]
async fn test_unload_known_but_unloaded_is_noop() {
    let catalog = commands_catalog(&[("a", vec!["ping"])]);
    let (manager, sink) = test_manager(catalog);

    manager.unload("a").await.unwrap();
    let err = manager.unload("ghost").await.unwrap_err();
    assert!(matches!(err, ExtensionError::NotFound(_)));

    sink.shutdown().await;
}

#[tokio::test]
async fn test_failed_register_reports_load_failed() {
    struct BrokenExt;
    impl Extension for BrokenExt {
        fn name(&self) -> &str {
            "broken"
        }
        fn register(&self, _ctx: &mut ExtensionContext) -> anyhow::Result<()> {
            anyhow::bail!("no database")
        }
    }

    let mut catalog = ExtensionCatalog::new();
    catalog.insert("broken", Box::new(|| Box::new(BrokenExt)));
    let (manager, sink) = test_manager(catalog);

    let err = manager.load("broken").await.unwrap_err();
    assert!(matches!(err, ExtensionError::LoadFailed { .. }));
    assert!(manager.loaded_names().await.is_empty());

    sink.shutdown().await;
}

#[tokio::test]
async fn test_reload_swaps_in_a_fresh_instance() {
    let catalog = commands_catalog(&[("a", vec!["ping"])]);
    let (manager, sink) = test_manager(catalog);

    manager.load("a").await.unwrap();
    manager.reload("a").await.unwrap();

    assert_eq!(manager.loaded_names().await, vec!["a".to_string()]);
    let registry = manager.registry_snapshot().await;
    assert_eq!(registry.owner_of(&CommandScope::Global, "ping"), Some("a"));

    sink.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_preserves_arrival_order_per_extension() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut catalog = ExtensionCatalog::new();
    {
        let seen = Arc::clone(&seen);
        catalog.insert(
            "recorder",
            Box::new(move || {
                Box::new(RecorderExt {
                    name: "recorder",
                    seen: Arc::clone(&seen),
                })
            }),
        );
    }
    let (manager, sink) = test_manager(catalog);
    manager.load("recorder").await.unwrap();

    for n in 0..20 {
        manager
            .dispatch(GatewayEvent::new(
                EventKind::MessageCreate,
                serde_json::json!({ "n": n }),
            ))
            .await;
    }
    manager.quiesce(Duration::from_secs(2)).await;

    let recorded = seen.lock().unwrap().clone();
    assert_eq!(recorded, (0..20).collect::<Vec<i64>>());

    sink.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_skips_unsubscribed_extensions() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut catalog = ExtensionCatalog::new();
    {
        let seen = Arc::clone(&seen);
        catalog.insert(
            "recorder",
            Box::new(move || {
                Box::new(RecorderExt {
                    name: "recorder",
                    seen: Arc::clone(&seen),
                })
            }),
        );
    }
    let (manager, sink) = test_manager(catalog);
    manager.load("recorder").await.unwrap();

    manager
        .dispatch(GatewayEvent::new(
            EventKind::MemberJoin,
            serde_json::json!({ "n": 1 }),
        ))
        .await;
    manager.quiesce(Duration::from_secs(2)).await;

    assert!(seen.lock().unwrap().is_empty());

    sink.shutdown().await;
}

#[tokio::test]
async fn test_failing_handler_does_not_affect_other_extensions() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut catalog = ExtensionCatalog::new();
    catalog.insert("fail", Box::new(|| Box::new(FailingHandlerExt)));
    {
        let seen = Arc::clone(&seen);
        catalog.insert(
            "recorder",
            Box::new(move || {
                Box::new(RecorderExt {
                    name: "recorder",
                    seen: Arc::clone(&seen),
                })
            }),
        );
    }
    let (manager, sink) = test_manager(catalog);
    manager.load("fail").await.unwrap();
    manager.load("recorder").await.unwrap();

    for n in 0..3 {
        manager
            .dispatch(GatewayEvent::new(
                EventKind::MessageCreate,
                serde_json::json!({ "n": n }),
            ))
            .await;
    }
    manager.quiesce(Duration::from_secs(2)).await;

    // The failing extension's errors never reach the healthy one
    assert_eq!(seen.lock().unwrap().clone(), vec![0, 1, 2]);
    assert_eq!(
        manager.loaded_names().await,
        vec!["fail".to_string(), "recorder".to_string()]
    );

    sink.shutdown().await;
}

#[tokio::test]
async fn test_load_all_isolates_individual_failures() {
    let mut catalog = commands_catalog(&[("a", vec!["ping"])]);
    catalog.insert("fail", Box::new(|| Box::new(FailingHandlerExt)));
    let (manager, sink) = test_manager(catalog);

    manager
        .load_all(&[
            "a".to_string(),
            "ghost".to_string(),
            "fail".to_string(),
        ])
        .await;

    // The unknown name is skipped; everything loadable is loaded
    assert_eq!(
        manager.loaded_names().await,
        vec!["a".to_string(), "fail".to_string()]
    );

    sink.shutdown().await;
}

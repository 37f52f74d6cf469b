// ABOUTME: Command synchronizer: fingerprints the local command tree and pushes only deltas.
// ABOUTME: Persists per-scope fingerprints so an unchanged tree never triggers a remote write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::commands::{CommandDef, CommandRegistry, CommandScope};
use crate::events::LogEvent;
use crate::metrics;
use crate::sink::SinkHandle;

/// Remote command registration surface. Production talks HTTP to the
/// platform API; tests count calls.
#[async_trait]
pub trait CommandApi: Send + Sync {
    /// Replace the full command set for one scope (a bulk overwrite PUT).
    async fn put_commands(&self, scope: &CommandScope, commands: &[CommandDef]) -> Result<()>;
}

/// HTTP implementation over the platform's application-command endpoints.
pub struct HttpCommandApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    application_id: u64,
}

impl HttpCommandApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, application_id: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            application_id,
        }
    }

    fn endpoint(&self, scope: &CommandScope) -> String {
        match scope {
            CommandScope::Global => {
                format!("{}/applications/{}/commands", self.base_url, self.application_id)
            }
            CommandScope::Guild(guild_id) => format!(
                "{}/applications/{}/guilds/{}/commands",
                self.base_url, self.application_id, guild_id
            ),
        }
    }
}

#[async_trait]
impl CommandApi for HttpCommandApi {
    async fn put_commands(&self, scope: &CommandScope, commands: &[CommandDef]) -> Result<()> {
        let response = self
            .client
            .put(self.endpoint(scope))
            .bearer_auth(&self.token)
            .json(&commands)
            .send()
            .await
            .with_context(|| format!("command registration request failed for {}", scope))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "command registration for {} rejected with status {}",
                scope,
                response.status()
            );
        }
        Ok(())
    }
}

/// Deterministic hash of one scope's command tree. Commands arrive sorted
/// by name from the registry, so equal trees always hash identically.
pub fn fingerprint(commands: &[CommandDef]) -> String {
    let canonical = serde_json::to_string(commands).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Last-synced fingerprints, stored as a JSON object keyed by scope.
/// Survives restarts; also the serialization point for concurrent syncs.
pub struct FingerprintStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FingerprintStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> HashMap<String, String> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    fn write_all(&self, fingerprints: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(fingerprints)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Scopes whose command tree changed and was pushed successfully
    pub pushed: Vec<String>,
    /// Scopes whose fingerprint matched; no remote call made
    pub unchanged: Vec<String>,
    /// Scopes whose push failed; fingerprint left untouched for retry
    pub failed: Vec<String>,
}

/// Diffs the local command tree against persisted fingerprints and pushes
/// only the changed scopes. Idempotent: two consecutive syncs with no
/// registry change make exactly one remote write.
pub struct CommandSynchronizer {
    api: Arc<dyn CommandApi>,
    store: FingerprintStore,
    sink: SinkHandle,
}

impl CommandSynchronizer {
    pub fn new(api: Arc<dyn CommandApi>, store: FingerprintStore, sink: SinkHandle) -> Self {
        Self { api, store, sink }
    }

    /// Synchronize the registry snapshot against the remote platform.
    ///
    /// Remote failures do not abort the pass or the boot sequence; they are
    /// surfaced as elevated-severity log events and retried on the next
    /// sync because the stored fingerprint stays unchanged.
    pub async fn sync(&self, registry: &CommandRegistry) -> Result<SyncReport> {
        // Holding the store lock for the whole read-compare-write pass
        // prevents two concurrent syncs from double-writing.
        let _guard = self.store.lock.lock().await;

        let mut stored = self.store.read_all();
        let mut report = SyncReport::default();

        // Scopes present locally, plus scopes that vanished since the last
        // sync (their remote set must be cleared).
        let mut scopes: Vec<CommandScope> = registry.scopes();
        for key in stored.keys() {
            if let Some(scope) = scope_from_key(key) {
                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
            }
        }

        for scope in scopes {
            let commands = registry.commands_for_scope(&scope);
            let key = scope.key();
            let current = fingerprint(&commands);

            if stored.get(&key) == Some(&current) {
                tracing::debug!(scope = %scope, "Command tree unchanged, skipping remote sync");
                report.unchanged.push(key);
                continue;
            }

            match self.api.put_commands(&scope, &commands).await {
                Ok(()) => {
                    tracing::info!(
                        scope = %scope,
                        commands = commands.len(),
                        "Pushed command tree to remote platform"
                    );
                    metrics::record_sync_push(&key);
                    if commands.is_empty() {
                        stored.remove(&key);
                    } else {
                        stored.insert(key.clone(), current);
                    }
                    self.store.write_all(&stored)?;
                    report.pushed.push(key);
                }
                Err(e) => {
                    tracing::error!(scope = %scope, error = %e, "Command sync failed");
                    self.sink.enqueue(LogEvent::error(
                        "sync",
                        format!("command sync for {} failed: {}", scope, e),
                    ));
                    report.failed.push(key);
                }
            }
        }

        Ok(report)
    }
}

fn scope_from_key(key: &str) -> Option<CommandScope> {
    if key == "global" {
        return Some(CommandScope::Global);
    }
    key.strip_prefix("guild:")
        .and_then(|id| id.parse().ok())
        .map(CommandScope::Guild)
}

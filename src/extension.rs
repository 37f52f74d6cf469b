// ABOUTME: The extension capability contract: register commands and event listeners.
// ABOUTME: Extensions see only the ExtensionContext surface, never supervisor internals.

use std::sync::Arc;

use async_trait::async_trait;

use crate::commands::{CommandConflict, CommandDef};
use crate::events::{EventKind, GatewayEvent};
use crate::sink::SinkHandle;

/// An event handler contributed by an extension.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn handle(&self, event: &GatewayEvent) -> anyhow::Result<()>;
}

/// A listener registration: which event kind it wants, and the handler.
#[derive(Clone)]
pub struct ListenerReg {
    pub kind: EventKind,
    pub listener: Arc<dyn EventListener>,
}

/// An independently loadable unit of command/event-handling logic.
///
/// `register` is declarative: it describes commands and listeners through
/// the context and must not start background work on its own. The manager
/// owns the lifecycle; a failed registration is rolled back wholesale.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, ctx: &mut ExtensionContext) -> anyhow::Result<()>;
}

/// The subset of runtime services an extension may use during registration.
pub struct ExtensionContext {
    guild_id: u64,
    log: SinkHandle,
    commands: Vec<CommandDef>,
    listeners: Vec<ListenerReg>,
}

impl ExtensionContext {
    pub fn new(guild_id: u64, log: SinkHandle) -> Self {
        Self {
            guild_id,
            log,
            commands: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// The deployment guild this runtime is scoped to.
    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    /// Handle for emitting diagnostic events to the webhook sink.
    pub fn log(&self) -> &SinkHandle {
        &self.log
    }

    /// Declare a command contributed by this extension.
    pub fn command(&mut self, def: CommandDef) {
        self.commands.push(def);
    }

    /// Subscribe a listener to an event kind.
    pub fn listen(&mut self, kind: EventKind, listener: Arc<dyn EventListener>) {
        self.listeners.push(ListenerReg { kind, listener });
    }

    pub(crate) fn into_parts(self) -> (Vec<CommandDef>, Vec<ListenerReg>) {
        (self.commands, self.listeners)
    }
}

/// Errors from extension lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// The name is not in the discovery catalog at all
    #[error("extension '{0}' not found")]
    NotFound(String),

    #[error("extension '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// The extension's own register hook failed
    #[error("extension '{name}' failed to load: {source}")]
    LoadFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Another loaded extension already owns a declared command
    #[error(transparent)]
    CommandConflict(#[from] CommandConflict),
}

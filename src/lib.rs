// ABOUTME: Root library module exposing all public modules.
// ABOUTME: Provides access to config, supervisor, extensions, command sync, and the log sink.

pub mod backoff;
pub mod commands;
pub mod config;
pub mod events;
pub mod extension;
pub mod extensions;
pub mod gateway;
pub mod manager;
pub mod metrics;
pub mod sink;
pub mod supervisor;
pub mod sync;

// Re-export the types most callers need
pub use commands::{CommandDef, CommandRegistry, CommandScope};
pub use events::{EventKind, GatewayEvent, LogEvent, Severity};
pub use extension::{EventListener, Extension, ExtensionContext, ExtensionError};
pub use manager::{ExtensionCatalog, ExtensionManager};
pub use supervisor::{ConnectionState, ConnectionSupervisor, SessionError};

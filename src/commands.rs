// ABOUTME: Command definitions, scopes, and the ownership-tracking command registry.
// ABOUTME: Registration enforces per-scope name uniqueness across extensions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a command is visible: everywhere, or in one guild.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommandScope {
    Global,
    Guild(u64),
}

impl CommandScope {
    /// Stable string key used for fingerprint storage.
    pub fn key(&self) -> String {
        match self {
            CommandScope::Global => "global".to_string(),
            CommandScope::Guild(guild_id) => format!("guild:{}", guild_id),
        }
    }
}

impl fmt::Display for CommandScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandParam {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub required: bool,
}

/// A platform slash-command declaration as contributed by an extension.
///
/// Localization maps are keyed by locale tag and travel with the
/// definition, so they are part of both the registration payload and the
/// sync fingerprint; adding or changing a translation re-pushes the scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDef {
    pub name: String,
    pub description: String,
    pub scope: CommandScope,
    #[serde(default)]
    pub params: Vec<CommandParam>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub name_localizations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub description_localizations: BTreeMap<String, String>,
}

impl CommandDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>, scope: CommandScope) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            scope,
            params: Vec::new(),
            name_localizations: BTreeMap::new(),
            description_localizations: BTreeMap::new(),
        }
    }

    pub fn localized_name(mut self, locale: impl Into<String>, name: impl Into<String>) -> Self {
        self.name_localizations.insert(locale.into(), name.into());
        self
    }

    pub fn localized_description(
        mut self,
        locale: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.description_localizations
            .insert(locale.into(), description.into());
        self
    }

    pub fn param(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        kind: ParamKind,
        required: bool,
    ) -> Self {
        self.params.push(CommandParam {
            name: name.into(),
            description: description.into(),
            kind,
            required,
        });
        self
    }
}

/// A second extension tried to claim a (scope, name) pair already owned.
#[derive(Debug, thiserror::Error)]
#[error("command '{name}' in scope {scope} is already owned by extension '{owner}'")]
pub struct CommandConflict {
    pub name: String,
    pub scope: CommandScope,
    pub owner: String,
}

#[derive(Debug, Clone)]
struct RegisteredCommand {
    def: CommandDef,
    owner: String,
}

/// All currently registered commands, keyed by (scope, name) so iteration
/// order is deterministic for fingerprinting.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<(CommandScope, String), RegisteredCommand>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command for an owning extension. Fails without mutating
    /// the registry when the (scope, name) pair is already taken.
    pub fn register(&mut self, def: CommandDef, owner: &str) -> Result<(), CommandConflict> {
        let key = (def.scope.clone(), def.name.clone());
        if let Some(existing) = self.commands.get(&key) {
            return Err(CommandConflict {
                name: def.name,
                scope: def.scope,
                owner: existing.owner.clone(),
            });
        }
        self.commands.insert(
            key,
            RegisteredCommand {
                def,
                owner: owner.to_string(),
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, scope: &CommandScope, name: &str) -> bool {
        self.commands
            .remove(&(scope.clone(), name.to_string()))
            .is_some()
    }

    /// Distinct scopes with at least one registered command, in order.
    pub fn scopes(&self) -> Vec<CommandScope> {
        let mut scopes: Vec<CommandScope> = Vec::new();
        for (scope, _) in self.commands.keys() {
            if scopes.last() != Some(scope) {
                scopes.push(scope.clone());
            }
        }
        scopes
    }

    /// All commands for one scope, sorted by name.
    pub fn commands_for_scope(&self, scope: &CommandScope) -> Vec<CommandDef> {
        self.commands
            .iter()
            .filter(|((s, _), _)| s == scope)
            .map(|(_, registered)| registered.def.clone())
            .collect()
    }

    pub fn owner_of(&self, scope: &CommandScope, name: &str) -> Option<&str> {
        self.commands
            .get(&(scope.clone(), name.to_string()))
            .map(|registered| registered.owner.as_str())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

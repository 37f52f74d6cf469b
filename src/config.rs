// ABOUTME: Configuration parsing from TOML file with environment variable overrides.
// ABOUTME: Validates required fields at startup and provides sensible defaults for optional ones.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub extensions: ExtensionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub application_id: u64,
    #[serde(default)]
    pub guild_id: u64,
    /// Shard identity as [index, count]; absent means unsharded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u16; 2]>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Deadline for one connect attempt, handshake included
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,
    /// Short delay before the first retry after a plain transport drop
    #[serde(default = "default_fast_retry_ms")]
    pub fast_retry_ms: u64,
    /// Grace period for in-flight handler dispatch during reconnect/shutdown
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Minimum delay between shipped batches (rate limit)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_flush_deadline_ms")]
    pub flush_deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_fingerprint_path")]
    pub fingerprint_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    #[serde(default = "default_enabled_extensions")]
    pub enabled: Vec<String>,
}

fn default_gateway_url() -> String {
    "wss://gateway.example.chat/ws".to_string()
}

fn default_heartbeat_secs() -> u64 {
    40
}

fn default_heartbeat_timeout_secs() -> u64 {
    90
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_reconnect_initial_ms() -> u64 {
    2000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_reconnect_max_retries() -> u32 {
    10
}

fn default_fast_retry_ms() -> u64 {
    500
}

fn default_drain_grace_ms() -> u64 {
    5000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_batch_size() -> usize {
    16
}

fn default_min_interval_ms() -> u64 {
    2000
}

fn default_retry_budget() -> u32 {
    3
}

fn default_flush_deadline_ms() -> u64 {
    10_000
}

fn default_api_base() -> String {
    "https://api.example.chat".to_string()
}

fn default_fingerprint_path() -> String {
    "state/fingerprints.json".to_string()
}

fn default_enabled_extensions() -> Vec<String> {
    vec!["about".to_string(), "audit".to_string()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: String::new(),
            application_id: 0,
            guild_id: 0,
            shard: None,
            heartbeat_secs: default_heartbeat_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_max_retries: default_reconnect_max_retries(),
            fast_retry_ms: default_fast_retry_ms(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            min_interval_ms: default_min_interval_ms(),
            retry_budget: default_retry_budget(),
            flush_deadline_ms: default_flush_deadline_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            fingerprint_path: default_fingerprint_path(),
        }
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_extensions(),
        }
    }
}

impl Config {
    /// Load configuration from config.toml (or `CHIRP_CONFIG_PATH`) with
    /// environment variable overrides, then validate required fields.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("CHIRP_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path))?
        } else {
            Config::default()
        };

        // Override with environment variables if present
        if let Ok(val) = std::env::var("GATEWAY_URL") {
            config.gateway.url = val;
        }
        if let Ok(val) = std::env::var("GATEWAY_TOKEN") {
            config.gateway.token = val;
        }
        if let Ok(val) = std::env::var("APPLICATION_ID") {
            config.gateway.application_id = val
                .parse()
                .with_context(|| format!("APPLICATION_ID must be numeric, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("GUILD_ID") {
            config.gateway.guild_id = val
                .parse()
                .with_context(|| format!("GUILD_ID must be numeric, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("WEBHOOK_URL") {
            config.webhook.url = val;
        }
        if let Ok(val) = std::env::var("WEBHOOK_TOKEN") {
            config.webhook.token = val;
        }
        if let Ok(val) = std::env::var("FINGERPRINT_PATH") {
            config.sync.fingerprint_path = val;
        }
        if let Ok(val) = std::env::var("ENABLED_EXTENSIONS") {
            config.extensions.enabled = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Validate required fields
        if config.gateway.token.trim().is_empty() {
            anyhow::bail!(
                "gateway.token is required (set in config.toml or GATEWAY_TOKEN env var)"
            );
        }
        if config.gateway.application_id == 0 {
            anyhow::bail!(
                "gateway.application_id is required (set in config.toml or APPLICATION_ID env var)"
            );
        }
        if config.gateway.guild_id == 0 {
            anyhow::bail!("gateway.guild_id is required (set in config.toml or GUILD_ID env var)");
        }
        if config.webhook.url.trim().is_empty() {
            anyhow::bail!("webhook.url is required (set in config.toml or WEBHOOK_URL env var)");
        }
        if config.webhook.token.trim().is_empty() {
            anyhow::bail!(
                "webhook.token is required (set in config.toml or WEBHOOK_TOKEN env var)"
            );
        }
        if let Some([index, count]) = config.gateway.shard {
            if count == 0 || index >= count {
                anyhow::bail!(
                    "gateway.shard must satisfy index < count, got [{}, {}]",
                    index,
                    count
                );
            }
        }
        if config.gateway.connect_timeout_secs == 0 {
            anyhow::bail!("gateway.connect_timeout_secs must be at least 1");
        }
        if config.webhook.queue_capacity == 0 {
            anyhow::bail!("webhook.queue_capacity must be at least 1");
        }
        if config.webhook.batch_size == 0 {
            anyhow::bail!("webhook.batch_size must be at least 1");
        }

        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.gateway.heartbeat_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.heartbeat_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.connect_timeout_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.gateway.drain_grace_ms)
    }
}

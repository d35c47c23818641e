use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_BUS_KEY_PREFIX, DEFAULT_HOST, DEFAULT_PORT,
    DEFAULT_READER_POOL_MAX, DEFAULT_REQUEST_CACHE_MAX_ENTRIES,
    DEFAULT_REQUEST_CACHE_MAX_MESSAGES, DEFAULT_REQUEST_CACHE_SUBSCRIPTION,
    DEFAULT_REQUEST_CACHE_TTL_SECS, DEFAULT_WEBHOOK_PATH, ENV_GITHUB_APP_DIR,
    ENV_GITHUB_WEBHOOK_SECRET,
};
use crate::bus::pool::{AutoscaleConfig, PoolConfig};
use crate::cache::RequestCacheConfig;

// =============================================================================
// Bus Backend Enum
// =============================================================================

/// Stream-store backend for the event bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackendType {
    #[default]
    Memory,
    Redis,
}

impl fmt::Display for BusBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusBackendType::Memory => write!(f, "memory"),
            BusBackendType::Redis => write!(f, "redis"),
        }
    }
}

// =============================================================================
// Server
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub webhook_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Sizing of the dedicated-connection reader pool
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReaderPoolConfig {
    pub max: usize,
    pub warmup: usize,
    pub autoscale: bool,
    pub autoscale_cap: usize,
    pub autoscale_floor: usize,
    pub autoscale_cooldown_secs: u64,
}

impl Default for ReaderPoolConfig {
    fn default() -> Self {
        let defaults = AutoscaleConfig::default();
        Self {
            max: DEFAULT_READER_POOL_MAX,
            warmup: 0,
            autoscale: true,
            autoscale_cap: defaults.cap,
            autoscale_floor: defaults.floor,
            autoscale_cooldown_secs: defaults.cooldown.as_secs(),
        }
    }
}

impl ReaderPoolConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max: self.max,
            warmup: self.warmup,
            autoscale: self.autoscale.then(|| AutoscaleConfig {
                cap: self.autoscale_cap,
                floor: self.autoscale_floor,
                cooldown: Duration::from_secs(self.autoscale_cooldown_secs),
                ..AutoscaleConfig::default()
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackendType,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub reader_pool: ReaderPoolConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackendType::Memory,
            redis_url: None,
            key_prefix: DEFAULT_BUS_KEY_PREFIX.to_string(),
            reader_pool: ReaderPoolConfig::default(),
        }
    }
}

// =============================================================================
// GitHub
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GithubConfig {
    /// Webhook shared secret; absent disables the listener
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// Directory holding `app.json` and `private-key.pem`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_dir: Option<PathBuf>,
    /// Direct user logins that trigger on mention
    pub bot_logins: Vec<String>,
    /// App slug; derives the `<slug>[bot]` mention login
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_slug: Option<String>,
}

// =============================================================================
// Request Message Cache
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestCacheSettings {
    pub enabled: bool,
    pub subscription_id: String,
    pub ttl_minutes: u64,
    pub max_entries: usize,
    pub max_messages_per_request: usize,
}

impl Default for RequestCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            subscription_id: DEFAULT_REQUEST_CACHE_SUBSCRIPTION.to_string(),
            ttl_minutes: DEFAULT_REQUEST_CACHE_TTL_SECS / 60,
            max_entries: DEFAULT_REQUEST_CACHE_MAX_ENTRIES,
            max_messages_per_request: DEFAULT_REQUEST_CACHE_MAX_MESSAGES,
        }
    }
}

impl RequestCacheSettings {
    pub fn cache_config(&self) -> RequestCacheConfig {
        RequestCacheConfig {
            subscription_id: self.subscription_id.clone(),
            ttl: Duration::from_secs(self.ttl_minutes * 60),
            max_entries: self.max_entries,
            max_messages_per_request: self.max_messages_per_request,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub request_messages: RequestCacheSettings,
}

// =============================================================================
// App Config
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub github: GithubConfig,
    pub cache: CacheSettings,
}

impl AppConfig {
    /// Load the config file (explicit path, or `lilac.json` next to the
    /// process if present), then apply env and CLI overrides.
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let mut config = match Self::resolve_path(cli) {
            Some(path) => Self::read_file(&path)?,
            None => Self::default(),
        };

        if let Ok(secret) = std::env::var(ENV_GITHUB_WEBHOOK_SECRET)
            && !secret.is_empty()
        {
            config.github.webhook_secret = Some(secret);
        }
        if let Ok(dir) = std::env::var(ENV_GITHUB_APP_DIR)
            && !dir.is_empty()
        {
            config.github.app_dir = Some(PathBuf::from(dir));
        }

        if let Some(host) = &cli.host {
            config.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(redis_url) = &cli.redis_url {
            config.bus.backend = BusBackendType::Redis;
            config.bus.redis_url = Some(redis_url.clone());
        }

        Ok(config)
    }

    fn resolve_path(cli: &CliConfig) -> Option<PathBuf> {
        if let Some(path) = &cli.config {
            return Some(path.clone());
        }
        let default = PathBuf::from(CONFIG_FILE_NAME);
        default.exists().then_some(default)
    }

    fn read_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_cli() -> CliConfig {
        CliConfig {
            host: None,
            port: None,
            config: None,
            redis_url: None,
        }
    }

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.webhook_path, DEFAULT_WEBHOOK_PATH);
        assert_eq!(config.bus.backend, BusBackendType::Memory);
        assert!(config.cache.request_messages.enabled);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{
                "server": {"port": 9999},
                "bus": {"backend": "redis", "redis_url": "redis://localhost:6379"},
                "github": {"bot_logins": ["lilac-dev"], "app_slug": "lilac-agent"}
            }"#,
        )
        .unwrap();

        let cli = CliConfig {
            config: Some(path),
            ..no_cli()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.bus.backend, BusBackendType::Redis);
        assert_eq!(config.github.bot_logins, vec!["lilac-dev"]);
    }

    #[test]
    fn cli_redis_url_selects_redis_backend() {
        let cli = CliConfig {
            redis_url: Some("redis://localhost:6379".to_string()),
            ..no_cli()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.bus.backend, BusBackendType::Redis);
        assert_eq!(
            config.bus.redis_url.as_deref(),
            Some("redis://localhost:6379")
        );
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{nope").unwrap();
        let cli = CliConfig {
            config: Some(path),
            ..no_cli()
        };
        assert!(AppConfig::load(&cli).is_err());
    }

    #[test]
    fn reader_pool_config_translates() {
        let settings = ReaderPoolConfig {
            autoscale: false,
            ..ReaderPoolConfig::default()
        };
        assert!(settings.pool_config().autoscale.is_none());

        let settings = ReaderPoolConfig::default();
        let pool = settings.pool_config();
        assert_eq!(pool.max, DEFAULT_READER_POOL_MAX);
        assert!(pool.autoscale.is_some());
    }
}

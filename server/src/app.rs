//! Core application

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::bus::{MemoryStreamBackend, RawBus, RedisStreamBackend, StreamBackend, TypedBus};
use crate::cache::RequestMessageCache;
use crate::core::cli::{self, CliConfig, Commands, SystemCommands};
use crate::core::config::{AppConfig, BusBackendType};
use crate::core::constants::ENV_LOG;
use crate::core::shutdown::ShutdownService;
use crate::github::tokens::load_identity;
use crate::github::webhook::{self, bot_mention_logins};
use crate::github::{GithubClient, TokenMinter, WebhookConfig, WebhookState};

pub struct CoreApp {
    pub config: AppConfig,
    pub shutdown: ShutdownService,
    pub bus: TypedBus,
    pub minter: Arc<TokenMinter>,
    pub request_cache: Option<Arc<RequestMessageCache>>,
    redis: Option<Arc<RedisStreamBackend>>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::System {
                command: SystemCommands::CheckConfig,
            }) => {
                return Self::check_config(&cli_config);
            }
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        app.start_server().await
    }

    fn init_logging() {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;

        let (backend, redis): (Arc<dyn StreamBackend>, Option<Arc<RedisStreamBackend>>) =
            match config.bus.backend {
                BusBackendType::Memory => (Arc::new(MemoryStreamBackend::new()), None),
                BusBackendType::Redis => {
                    let url = config
                        .bus
                        .redis_url
                        .as_deref()
                        .context("bus.redis_url is required for the redis backend")?;
                    let backend = Arc::new(
                        RedisStreamBackend::new(
                            url,
                            &config.bus.key_prefix,
                            config.bus.reader_pool.pool_config(),
                        )
                        .await
                        .map_err(|e| anyhow::anyhow!("Failed to initialize bus backend: {e}"))?,
                    );
                    (
                        Arc::clone(&backend) as Arc<dyn StreamBackend>,
                        Some(backend),
                    )
                }
            };

        tracing::debug!(backend = backend.backend_name(), "Bus initialized");
        let bus = TypedBus::new(RawBus::new(backend));

        let minter = Arc::new(TokenMinter::new(reqwest::Client::new()));

        let request_cache = if config.cache.request_messages.enabled {
            let cache =
                RequestMessageCache::start(&bus, config.cache.request_messages.cache_config())
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("Failed to start request message cache: {e}")
                    })?;
            tracing::debug!("Request message cache started");
            Some(cache)
        } else {
            None
        };

        Ok(Self {
            config,
            shutdown: ShutdownService::new(),
            bus,
            minter,
            request_cache,
            redis,
        })
    }

    async fn start_server(self) -> Result<()> {
        self.shutdown.install_signal_handlers();

        let secret = self
            .config
            .github
            .webhook_secret
            .clone()
            .filter(|secret| !secret.is_empty());

        match secret {
            Some(secret) => {
                let app_dir = self
                    .config
                    .github
                    .app_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("github-app"));
                let api = Arc::new(GithubClient::new(
                    reqwest::Client::new(),
                    Arc::clone(&self.minter),
                    app_dir,
                ));

                let bot_logins = bot_mention_logins(
                    &self.config.github.bot_logins,
                    self.config.github.app_slug.as_deref(),
                );
                if bot_logins.is_empty() {
                    tracing::warn!("Bot mention set is empty; mention triggering disabled");
                }

                let mut webhook_config = WebhookConfig::new(
                    self.config.server.webhook_path.clone(),
                    secret.into_bytes(),
                );
                webhook_config.bot_logins = bot_logins;

                let state = WebhookState::new(webhook_config, self.bus.clone(), api);
                let addr = SocketAddr::new(
                    self.config
                        .server
                        .host
                        .parse()
                        .context("Invalid server host")?,
                    self.config.server.port,
                );
                webhook::serve(state, addr, self.shutdown.wait()).await?;
            }
            None => {
                // Auth/config missing: skip the listener, keep the rest of
                // the process (cache, bus) alive until shutdown.
                tracing::warn!("No webhook secret configured; webhook listener disabled");
                self.shutdown.wait().await;
            }
        }

        if let Some(cache) = &self.request_cache {
            cache.stop().await;
        }
        self.shutdown.shutdown().await;
        if let Some(redis) = &self.redis {
            redis.close();
        }
        Ok(())
    }

    fn check_config(cli: &CliConfig) -> Result<()> {
        let config = AppConfig::load(cli)?;

        println!("Server:  {}:{}", config.server.host, config.server.port);
        println!("Webhook: {}", config.server.webhook_path);
        println!("Bus:     {}", config.bus.backend);
        println!(
            "Secret:  {}",
            if config.github.webhook_secret.is_some() {
                "configured"
            } else {
                "missing (listener disabled)"
            }
        );

        match &config.github.app_dir {
            Some(app_dir) => {
                let identity = load_identity(app_dir)
                    .map_err(|e| anyhow::anyhow!("GitHub App identity check failed: {e}"))?;
                println!(
                    "App:     id {} installation {} ({})",
                    identity.app_id, identity.installation_id, identity.api_base_url
                );
            }
            None => println!("App:     identity not configured"),
        }

        Ok(())
    }
}

//! GitHub App installation-token minting
//!
//! Outbound GitHub calls authenticate with short-lived installation
//! tokens minted from App identity material on disk: `app.json` (app id,
//! installation id, optional API base URL and host) next to
//! `private-key.pem`.
//!
//! Tokens are cached until 60 seconds before expiry, keyed by a
//! fingerprint of the identity material so a rotated key or edited config
//! invalidates the cache. Concurrent callers during a mint share one
//! pending future; a failed mint is never cached, so the next caller
//! retries.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::GithubError;
use crate::core::constants::{
    APP_CONFIG_FILE_NAME, APP_PRIVATE_KEY_FILE_NAME, DEFAULT_GITHUB_API_BASE_URL,
    TOKEN_REFRESH_MARGIN_MS, USER_AGENT,
};
use crate::utils::crypto::sha256_hex;
use crate::utils::time::{now_ms, parse_rfc3339_ms};

/// A minted installation token
#[derive(Debug, Clone, PartialEq)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at_ms: i64,
    pub api_base_url: String,
    pub host: Option<String>,
}

/// Identity material loaded from the config dir
#[derive(Debug, Clone)]
pub struct AppIdentity {
    pub app_id: u64,
    pub installation_id: u64,
    pub api_base_url: String,
    pub host: Option<String>,
    pub private_key_pem: Vec<u8>,
    /// SHA-256 over the identity material; the token cache key
    pub fingerprint: String,
}

#[derive(Deserialize)]
struct AppConfigFile {
    app_id: u64,
    installation_id: u64,
    #[serde(default)]
    api_base_url: Option<String>,
    #[serde(default)]
    host: Option<String>,
}

/// Load and fingerprint the identity material. Missing or unreadable
/// material is a configuration error naming the path.
pub fn load_identity(config_dir: &Path) -> Result<AppIdentity, GithubError> {
    let config_path = config_dir.join(APP_CONFIG_FILE_NAME);
    let key_path = config_dir.join(APP_PRIVATE_KEY_FILE_NAME);

    let config_bytes = std::fs::read(&config_path).map_err(|e| {
        GithubError::Config(format!("cannot read {}: {e}", config_path.display()))
    })?;
    let private_key_pem = std::fs::read(&key_path)
        .map_err(|e| GithubError::Config(format!("cannot read {}: {e}", key_path.display())))?;

    let config: AppConfigFile = serde_json::from_slice(&config_bytes).map_err(|e| {
        GithubError::Config(format!("invalid {}: {e}", config_path.display()))
    })?;

    let api_base_url = config
        .api_base_url
        .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE_URL.to_string())
        .trim_end_matches('/')
        .to_string();

    let mut material = Vec::new();
    material.extend_from_slice(&config_bytes);
    material.extend_from_slice(&private_key_pem);
    material.extend_from_slice(api_base_url.as_bytes());
    let fingerprint = sha256_hex(&material);

    Ok(AppIdentity {
        app_id: config.app_id,
        installation_id: config.installation_id,
        api_base_url,
        host: config.host,
        private_key_pem,
        fingerprint,
    })
}

/// The outbound credential exchange, separated for testability
#[async_trait]
pub(crate) trait TokenExchange: Send + Sync + 'static {
    async fn mint(&self, identity: &AppIdentity) -> Result<InstallationToken, String>;
}

#[derive(Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<String>,
}

struct GithubTokenExchange {
    http: reqwest::Client,
}

#[async_trait]
impl TokenExchange for GithubTokenExchange {
    async fn mint(&self, identity: &AppIdentity) -> Result<InstallationToken, String> {
        let now = now_ms() / 1000;
        let claims = AppJwtClaims {
            iat: now - 60,
            exp: now + 540,
            iss: identity.app_id.to_string(),
        };
        let key = EncodingKey::from_rsa_pem(&identity.private_key_pem)
            .map_err(|e| format!("invalid private key: {e}"))?;
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| format!("failed to sign app JWT: {e}"))?;

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            identity.api_base_url, identity.installation_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| format!("token request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("token request rejected: {status}"));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("invalid token response: {e}"))?;
        let expires_at_ms = body
            .expires_at
            .as_deref()
            .and_then(parse_rfc3339_ms)
            .ok_or_else(|| "missing or invalid expires_at in token response".to_string())?;

        Ok(InstallationToken {
            token: body.token,
            expires_at_ms,
            api_base_url: identity.api_base_url.clone(),
            host: identity.host.clone(),
        })
    }
}

struct CachedToken {
    token: InstallationToken,
    fingerprint: String,
}

type MintFuture = Shared<BoxFuture<'static, Result<InstallationToken, String>>>;

struct MinterState {
    cached: Option<CachedToken>,
    pending: Option<(u64, MintFuture)>,
    generation: u64,
}

/// Lazy, coalescing installation-token cache
pub struct TokenMinter {
    exchange: Arc<dyn TokenExchange>,
    state: Arc<Mutex<MinterState>>,
}

impl TokenMinter {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_exchange(Arc::new(GithubTokenExchange { http }))
    }

    pub(crate) fn with_exchange(exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            exchange,
            state: Arc::new(Mutex::new(MinterState {
                cached: None,
                pending: None,
                generation: 0,
            })),
        }
    }

    /// Get a valid installation token for the identity in `config_dir`,
    /// minting one if the cache has none with at least 60 s left.
    pub async fn get_token(&self, config_dir: &Path) -> Result<InstallationToken, GithubError> {
        let identity = load_identity(config_dir)?;

        let pending = {
            let mut state = self.state.lock();

            if let Some(cached) = &state.cached
                && cached.fingerprint == identity.fingerprint
                && cached.token.api_base_url == identity.api_base_url
                && cached.token.expires_at_ms - now_ms() > TOKEN_REFRESH_MARGIN_MS
            {
                return Ok(cached.token.clone());
            }

            if let Some((_, pending)) = &state.pending {
                pending.clone()
            } else {
                state.generation += 1;
                let generation = state.generation;
                let fingerprint = identity.fingerprint.clone();
                let exchange = Arc::clone(&self.exchange);
                let minter_state = Arc::clone(&self.state);

                let fut: MintFuture = async move {
                    let result = exchange.mint(&identity).await;
                    let mut state = minter_state.lock();
                    if state
                        .pending
                        .as_ref()
                        .is_some_and(|(active, _)| *active == generation)
                    {
                        state.pending = None;
                        if let Ok(token) = &result {
                            state.cached = Some(CachedToken {
                                token: token.clone(),
                                fingerprint,
                            });
                        }
                    }
                    result
                }
                .boxed()
                .shared();

                state.pending = Some((generation, fut.clone()));
                fut
            }
        };

        pending.await.map_err(GithubError::TokenExchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn write_identity(dir: &Path) {
        std::fs::write(
            dir.join(APP_CONFIG_FILE_NAME),
            r#"{"app_id": 7, "installation_id": 11}"#,
        )
        .unwrap();
        std::fs::write(dir.join(APP_PRIVATE_KEY_FILE_NAME), "not-a-real-key").unwrap();
    }

    struct StubExchange {
        mints: AtomicUsize,
        fail_next: AtomicBool,
        delay: Duration,
        lifetime_ms: i64,
    }

    impl StubExchange {
        fn new(lifetime_ms: i64) -> Arc<Self> {
            Arc::new(Self {
                mints: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
                delay: Duration::from_millis(20),
                lifetime_ms,
            })
        }
    }

    #[async_trait]
    impl TokenExchange for StubExchange {
        async fn mint(&self, identity: &AppIdentity) -> Result<InstallationToken, String> {
            tokio::time::sleep(self.delay).await;
            let count = self.mints.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err("provider unavailable".to_string());
            }
            Ok(InstallationToken {
                token: format!("ghs_test_{count}"),
                expires_at_ms: now_ms() + self.lifetime_ms,
                api_base_url: identity.api_base_url.clone(),
                host: identity.host.clone(),
            })
        }
    }

    #[test]
    fn load_identity_missing_material_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_identity(dir.path()).unwrap_err();
        assert!(matches!(err, GithubError::Config(_)));
        assert!(err.to_string().contains(APP_CONFIG_FILE_NAME));
    }

    #[test]
    fn load_identity_defaults_and_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path());
        let a = load_identity(dir.path()).unwrap();
        assert_eq!(a.api_base_url, DEFAULT_GITHUB_API_BASE_URL);
        assert_eq!(a.app_id, 7);

        // fingerprint is deterministic, and changes with the material
        let b = load_identity(dir.path()).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        std::fs::write(dir.path().join(APP_PRIVATE_KEY_FILE_NAME), "rotated").unwrap();
        let c = load_identity(dir.path()).unwrap();
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_mint() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path());
        let exchange = StubExchange::new(3_600_000);
        let minter = Arc::new(TokenMinter::with_exchange(exchange.clone()));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let minter = Arc::clone(&minter);
            let path = dir.path().to_path_buf();
            tasks.push(tokio::spawn(async move { minter.get_token(&path).await }));
        }

        let mut tokens = Vec::new();
        for task in tasks {
            tokens.push(task.await.unwrap().unwrap());
        }

        assert_eq!(exchange.mints.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t.token == tokens[0].token));

        // still within the validity margin: cache hit, no second mint
        let again = minter.get_token(dir.path()).await.unwrap();
        assert_eq!(again.token, tokens[0].token);
        assert_eq!(exchange.mints.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_mint_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path());
        let exchange = StubExchange::new(3_600_000);
        exchange.fail_next.store(true, Ordering::SeqCst);
        let minter = TokenMinter::with_exchange(exchange.clone());

        let err = minter.get_token(dir.path()).await.unwrap_err();
        assert!(matches!(err, GithubError::TokenExchange(_)));

        let token = minter.get_token(dir.path()).await.unwrap();
        assert_eq!(token.token, "ghs_test_2");
        assert_eq!(exchange.mints.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn near_expiry_token_is_reminted() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path());
        // lifetime below the 60 s refresh margin
        let exchange = StubExchange::new(TOKEN_REFRESH_MARGIN_MS / 2);
        let minter = TokenMinter::with_exchange(exchange.clone());

        minter.get_token(dir.path()).await.unwrap();
        minter.get_token(dir.path()).await.unwrap();
        assert_eq!(exchange.mints.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn changed_fingerprint_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path());
        let exchange = StubExchange::new(3_600_000);
        let minter = TokenMinter::with_exchange(exchange.clone());

        minter.get_token(dir.path()).await.unwrap();
        std::fs::write(dir.path().join(APP_PRIVATE_KEY_FILE_NAME), "rotated").unwrap();
        minter.get_token(dir.path()).await.unwrap();
        assert_eq!(exchange.mints.load(Ordering::SeqCst), 2);
    }
}

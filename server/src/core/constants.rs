// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "Lilac";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "lilac";

/// User-Agent for outbound HTTP calls
pub const USER_AGENT: &str = "lilac-server";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "lilac.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "LILAC_CONFIG";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for server host
pub const ENV_HOST: &str = "LILAC_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "LILAC_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "LILAC_LOG";

// =============================================================================
// Environment Variables - Bus
// =============================================================================

/// Environment variable for the Redis URL (selects the Redis backend)
pub const ENV_REDIS_URL: &str = "LILAC_REDIS_URL";

// =============================================================================
// Environment Variables - GitHub
// =============================================================================

/// Environment variable for the webhook shared secret
pub const ENV_GITHUB_WEBHOOK_SECRET: &str = "LILAC_GITHUB_WEBHOOK_SECRET";

/// Environment variable for the App identity config directory
pub const ENV_GITHUB_APP_DIR: &str = "LILAC_GITHUB_APP_DIR";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default webhook port
pub const DEFAULT_PORT: u16 = 8787;

/// Default webhook endpoint path
pub const DEFAULT_WEBHOOK_PATH: &str = "/webhook";

// =============================================================================
// Bus
// =============================================================================

/// Stream key prefix; the on-the-wire topic is `<prefix>:<topic>`
pub const DEFAULT_BUS_KEY_PREFIX: &str = "lilac";

/// Default size of the dedicated-connection reader pool
pub const DEFAULT_READER_POOL_MAX: usize = 8;

/// Default retention hint for per-request output streams
pub const OUTPUT_STREAM_RETENTION: u64 = 4096;

// =============================================================================
// Request Message Cache
// =============================================================================

/// Default fanout subscription id of the request-message cache
pub const DEFAULT_REQUEST_CACHE_SUBSCRIPTION: &str = "request-message-cache";

/// Entry lifetime after the last write
pub const DEFAULT_REQUEST_CACHE_TTL_SECS: u64 = 30 * 60;

/// Live-entry cap
pub const DEFAULT_REQUEST_CACHE_MAX_ENTRIES: usize = 256;

/// Per-request message cap (tail wins)
pub const DEFAULT_REQUEST_CACHE_MAX_MESSAGES: usize = 512;

// =============================================================================
// GitHub Webhook
// =============================================================================

pub const HEADER_GITHUB_EVENT: &str = "x-github-event";
pub const HEADER_GITHUB_DELIVERY: &str = "x-github-delivery";
pub const HEADER_GITHUB_SIGNATURE: &str = "x-hub-signature-256";

/// Delivery-id dedup window
pub const DEDUP_TTL_MS: i64 = 10 * 60 * 1000;

/// Comment command that addresses the bot
pub const TRIGGER_COMMAND: &str = "/lilac";

/// Cap on recent comments included in a thread prompt
pub const DEFAULT_RECENT_COMMENTS_LIMIT: usize = 30;

/// Per-comment truncation inside prompts
pub const COMMENT_SNIPPET_MAX_CHARS: usize = 400;

/// Reviews older than this are not preempted on synchronize
pub const REVIEW_PREEMPT_MAX_AGE_MS: i64 = 30 * 60 * 1000;

// =============================================================================
// GitHub App Identity
// =============================================================================

/// App config file inside the identity config dir
pub const APP_CONFIG_FILE_NAME: &str = "app.json";

/// Private key file inside the identity config dir
pub const APP_PRIVATE_KEY_FILE_NAME: &str = "private-key.pem";

/// Default API base URL
pub const DEFAULT_GITHUB_API_BASE_URL: &str = "https://api.github.com";

/// A cached token must have at least this much validity left
pub const TOKEN_REFRESH_MARGIN_MS: i64 = 60 * 1000;

// =============================================================================
// Shutdown
// =============================================================================

/// Grace period for background tasks during shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 15;

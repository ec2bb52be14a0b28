//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/eventlog";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Salesforce Configuration Constants
// ============================================================================

/// Default REST API version.
pub const DEFAULT_SF_API_VERSION: &str = "v58.0";

/// Default timeout for listing, limits and token requests in seconds.
pub const DEFAULT_SF_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default timeout for streaming one export file in seconds.
pub const DEFAULT_SF_STREAM_TIMEOUT_SECS: u64 = 3600;

/// Default number of token request attempts.
pub const DEFAULT_SF_TOKEN_ATTEMPTS: u32 = 4;

/// Default backoff unit between token attempts in milliseconds.
pub const DEFAULT_SF_TOKEN_BACKOFF_MS: u64 = 1000;

// ============================================================================
// Sync Configuration Constants
// ============================================================================

/// Default number of rows between heartbeats.
pub const DEFAULT_HEARTBEAT_ROWS: u64 = 100;

/// Default pause after a block of emitted rows in milliseconds.
pub const DEFAULT_EMIT_PAUSE_MS: u64 = 2000;

/// Default pause after a block of quiet rows in milliseconds.
pub const DEFAULT_LIGHT_PAUSE_MS: u64 = 20;

/// Default bound on waiting for one run of a batch (6 hours).
pub const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 21_600;

/// Default interval of the org limits poll (30 minutes).
pub const DEFAULT_LIMITS_POLL_SECS: u64 = 1800;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub salesforce: SalesforceConfig,
    pub sync: SyncConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Salesforce access
///
/// Either the client credentials or a static access token with its instance
/// URL must be present.
#[derive(Clone, Serialize, Deserialize)]
pub struct SalesforceConfig {
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub instance_url: Option<String>,
    pub api_version: String,
    pub request_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub token_attempts: u32,
    pub token_backoff_ms: u64,
}

impl std::fmt::Debug for SalesforceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SalesforceConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("instance_url", &self.instance_url)
            .field("api_version", &self.api_version)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("stream_timeout_secs", &self.stream_timeout_secs)
            .field("token_attempts", &self.token_attempts)
            .field("token_backoff_ms", &self.token_backoff_ms)
            .finish()
    }
}

impl SalesforceConfig {
    pub fn uses_client_credentials(&self) -> bool {
        self.token_url.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn token_backoff(&self) -> Duration {
        Duration::from_millis(self.token_backoff_ms)
    }
}

impl Default for SalesforceConfig {
    fn default() -> Self {
        Self {
            token_url: None,
            client_id: None,
            client_secret: None,
            access_token: None,
            instance_url: None,
            api_version: DEFAULT_SF_API_VERSION.to_string(),
            request_timeout_secs: DEFAULT_SF_REQUEST_TIMEOUT_SECS,
            stream_timeout_secs: DEFAULT_SF_STREAM_TIMEOUT_SECS,
            token_attempts: DEFAULT_SF_TOKEN_ATTEMPTS,
            token_backoff_ms: DEFAULT_SF_TOKEN_BACKOFF_MS,
        }
    }
}

/// Ingestion behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// In-memory status store and inspection emission
    pub local: bool,
    pub heartbeat_rows: u64,
    pub emit_pause_ms: u64,
    pub light_pause_ms: u64,
    pub inventory_cache: bool,
    pub batch_timeout_secs: u64,
    /// Zero disables the poll
    pub limits_poll_secs: u64,
    pub resume_on_startup: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local: false,
            heartbeat_rows: DEFAULT_HEARTBEAT_ROWS,
            emit_pause_ms: DEFAULT_EMIT_PAUSE_MS,
            light_pause_ms: DEFAULT_LIGHT_PAUSE_MS,
            inventory_cache: true,
            batch_timeout_secs: DEFAULT_BATCH_TIMEOUT_SECS,
            limits_poll_secs: DEFAULT_LIMITS_POLL_SECS,
            resume_on_startup: true,
        }
    }
}

impl SyncConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from a key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let server = ServerConfig {
            host: text("EVENTLOG_HOST").unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
            port: parse_or(&lookup, "EVENTLOG_PORT", DEFAULT_SERVER_PORT),
            shutdown_timeout_secs: parse_or(&lookup, "EVENTLOG_SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        };

        let database = DatabaseConfig {
            url: text("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
            min_connections: parse_or(&lookup, "DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
            connect_timeout_secs: parse_or(&lookup, "DATABASE_CONNECT_TIMEOUT", DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            idle_timeout_secs: parse_or(&lookup, "DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
        };

        let salesforce = SalesforceConfig {
            token_url: text("SF_TOKEN_URL"),
            client_id: text("SF_CLIENT_ID"),
            client_secret: text("SF_CLIENT_SECRET"),
            access_token: text("SF_ACCESS_TOKEN"),
            instance_url: text("SF_INSTANCE_URL"),
            api_version: text("SF_API_VERSION").unwrap_or_else(|| DEFAULT_SF_API_VERSION.to_string()),
            request_timeout_secs: parse_or(&lookup, "SF_REQUEST_TIMEOUT", DEFAULT_SF_REQUEST_TIMEOUT_SECS),
            stream_timeout_secs: parse_or(&lookup, "SF_STREAM_TIMEOUT", DEFAULT_SF_STREAM_TIMEOUT_SECS),
            token_attempts: parse_or(&lookup, "SF_TOKEN_ATTEMPTS", DEFAULT_SF_TOKEN_ATTEMPTS),
            token_backoff_ms: parse_or(&lookup, "SF_TOKEN_BACKOFF_MS", DEFAULT_SF_TOKEN_BACKOFF_MS),
        };

        let sync = SyncConfig {
            local: parse_or(&lookup, "EVENTLOG_LOCAL", false),
            heartbeat_rows: parse_or(&lookup, "EVENTLOG_HEARTBEAT_ROWS", DEFAULT_HEARTBEAT_ROWS),
            emit_pause_ms: parse_or(&lookup, "EVENTLOG_EMIT_PAUSE_MS", DEFAULT_EMIT_PAUSE_MS),
            light_pause_ms: parse_or(&lookup, "EVENTLOG_LIGHT_PAUSE_MS", DEFAULT_LIGHT_PAUSE_MS),
            inventory_cache: parse_or(&lookup, "EVENTLOG_INVENTORY_CACHE", true),
            batch_timeout_secs: parse_or(&lookup, "EVENTLOG_BATCH_TIMEOUT_SECS", DEFAULT_BATCH_TIMEOUT_SECS),
            limits_poll_secs: parse_or(&lookup, "EVENTLOG_LIMITS_POLL_SECS", DEFAULT_LIMITS_POLL_SECS),
            resume_on_startup: parse_or(&lookup, "EVENTLOG_RESUME_ON_STARTUP", true),
        };

        Config {
            server,
            database,
            salesforce,
            sync,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if !self.sync.local {
            if self.database.url.is_empty() {
                anyhow::bail!("Database URL cannot be empty");
            }
            if self.database.max_connections == 0 {
                anyhow::bail!("Database max_connections must be greater than 0");
            }
            if self.database.min_connections > self.database.max_connections {
                anyhow::bail!(
                    "Database min_connections ({}) cannot be greater than max_connections ({})",
                    self.database.min_connections,
                    self.database.max_connections
                );
            }
        }

        let sf = &self.salesforce;
        let has_static = sf.access_token.is_some() && sf.instance_url.is_some();
        if !sf.uses_client_credentials() && !has_static {
            anyhow::bail!(
                "Salesforce access requires SF_TOKEN_URL, SF_CLIENT_ID and SF_CLIENT_SECRET, \
                 or SF_ACCESS_TOKEN with SF_INSTANCE_URL"
            );
        }
        if sf.token_attempts == 0 {
            anyhow::bail!("SF_TOKEN_ATTEMPTS must be greater than 0");
        }
        if !sf.api_version.starts_with('v') {
            anyhow::bail!("SF_API_VERSION must look like v58.0, got {}", sf.api_version);
        }

        if self.sync.heartbeat_rows == 0 {
            anyhow::bail!("EVENTLOG_HEARTBEAT_ROWS must be greater than 0");
        }

        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            salesforce: SalesforceConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

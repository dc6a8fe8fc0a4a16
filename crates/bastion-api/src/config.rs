//! Service configuration for bastion.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use bastion_circuit::CircuitConfig;
use bastion_delivery::{BackoffSchedule, ClientConfig, DeliveryConfig, RetryPolicy, UrlPolicy};
use bastion_session::ResilientConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "bastion.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`bastion.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use bastion_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Per-request timeout for the operational HTTP surface, in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Delivery
    /// Number of delivery workers.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// Jobs leased per worker poll.
    ///
    /// Environment variable: `WORKER_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "WORKER_BATCH_SIZE")]
    pub worker_batch_size: usize,
    /// Outbound webhook request timeout in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// Retries allowed after the first attempt.
    ///
    /// Environment variable: `MAX_RETRIES`
    #[serde(default = "default_max_retries", alias = "MAX_RETRIES")]
    pub max_retries: u32,
    /// Backoff delays in seconds, indexed by attempt number.
    ///
    /// Environment variable: `RETRY_BACKOFF_SECONDS` (e.g. `[10, 60, 300]`)
    #[serde(default = "default_backoff_seconds", alias = "RETRY_BACKOFF_SECONDS")]
    pub retry_backoff_seconds: Vec<u64>,
    /// Permit loopback receivers and plain http. Development only.
    ///
    /// Environment variable: `ALLOW_LOCALHOST`
    #[serde(default, alias = "ALLOW_LOCALHOST")]
    pub allow_localhost: bool,
    /// Response bytes kept on a delivery record.
    ///
    /// Environment variable: `MAX_RESPONSE_SIZE`
    #[serde(default = "default_max_response_size", alias = "MAX_RESPONSE_SIZE")]
    pub max_response_size: usize,
    /// Consecutive failures after which an endpoint is disabled.
    ///
    /// Environment variable: `ENDPOINT_FAILURE_THRESHOLD`
    #[serde(default = "default_endpoint_failure_threshold", alias = "ENDPOINT_FAILURE_THRESHOLD")]
    pub endpoint_failure_threshold: u32,
    /// Age past `next_retry_at` after which a pending retry counts as
    /// stranded and is re-enqueued, in seconds.
    ///
    /// Environment variable: `STRANDED_RETRY_GRACE_SECONDS`
    #[serde(default = "default_stranded_grace", alias = "STRANDED_RETRY_GRACE_SECONDS")]
    pub stranded_retry_grace_seconds: u64,

    // Circuit breaker
    /// Consecutive failures that open a circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_failure_threshold", alias = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: u32,
    /// Half-open successes that close a circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_SUCCESS_THRESHOLD`
    #[serde(default = "default_success_threshold", alias = "CIRCUIT_BREAKER_SUCCESS_THRESHOLD")]
    pub circuit_breaker_success_threshold: u32,
    /// Cooldown before an open circuit admits a probe, in seconds.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_TIMEOUT_SECONDS`
    #[serde(default = "default_circuit_timeout", alias = "CIRCUIT_BREAKER_TIMEOUT_SECONDS")]
    pub circuit_breaker_timeout_seconds: u64,
    /// Concurrent probes admitted while half-open.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS`
    #[serde(default = "default_half_open_calls", alias = "CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS")]
    pub circuit_breaker_half_open_max_calls: u32,

    // Session store
    /// Serve sessions from memory while the database is down.
    ///
    /// Environment variable: `SESSION_FALLBACK_ENABLED`
    #[serde(default = "default_fallback_enabled", alias = "SESSION_FALLBACK_ENABLED")]
    pub session_fallback_enabled: bool,
    /// Minimum seconds between recovery probes of the primary store.
    ///
    /// Environment variable: `SESSION_RECONNECT_INTERVAL_SECONDS`
    #[serde(default = "default_reconnect_interval", alias = "SESSION_RECONNECT_INTERVAL_SECONDS")]
    pub session_reconnect_interval_seconds: u64,

    // Logging
    /// Log filter directive.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, optional `bastion.toml`, and
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the merged values
    /// fail validation.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
            .extract()
            .context("Failed to load configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Outbound URL policy. `allow_localhost` also admits plain http, since
    /// local receivers rarely terminate TLS.
    pub fn to_url_policy(&self) -> UrlPolicy {
        if self.allow_localhost {
            UrlPolicy::development()
        } else {
            UrlPolicy::default()
        }
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            max_response_size: self.max_response_size,
            ..ClientConfig::default()
        }
    }

    /// Convert to retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the backoff table is empty.
    pub fn to_retry_policy(&self) -> Result<RetryPolicy> {
        let schedule = BackoffSchedule::from_secs(&self.retry_backoff_seconds)
            .context("Invalid retry_backoff_seconds")?;
        Ok(RetryPolicy::with_max_retries(self.max_retries, schedule))
    }

    /// Convert to delivery engine configuration.
    ///
    /// The job lease is four times the request timeout so a slow receiver
    /// never lets a second worker pick up the same job mid-flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the retry policy is invalid.
    pub fn to_delivery_config(&self) -> Result<DeliveryConfig> {
        Ok(DeliveryConfig {
            worker_count: self.worker_pool_size,
            batch_size: self.worker_batch_size,
            visibility_timeout: Duration::from_secs(self.delivery_timeout_seconds * 4),
            failure_threshold: self.endpoint_failure_threshold,
            client_config: self.to_client_config(),
            url_policy: self.to_url_policy(),
            retry_policy: self.to_retry_policy()?,
            ..DeliveryConfig::default()
        })
    }

    /// Convert to circuit breaker configuration.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            success_threshold: self.circuit_breaker_success_threshold,
            timeout: Duration::from_secs(self.circuit_breaker_timeout_seconds),
            half_open_max_calls: self.circuit_breaker_half_open_max_calls,
        }
    }

    /// Convert to session store failover configuration.
    pub fn to_resilient_config(&self) -> ResilientConfig {
        ResilientConfig {
            fallback_enabled: self.session_fallback_enabled,
            reconnect_interval: Duration::from_secs(self.session_reconnect_interval_seconds),
        }
    }

    /// Grace period for the stranded retry sweep.
    pub fn stranded_retry_grace(&self) -> Duration {
        Duration::from_secs(self.stranded_retry_grace_seconds)
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.rfind('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                if !self.database_url[colon_pos..].starts_with("://") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first value that is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.request_timeout == 0 {
            anyhow::bail!("request_timeout must be greater than 0");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.worker_batch_size == 0 {
            anyhow::bail!("worker_batch_size must be greater than 0");
        }

        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        if self.retry_backoff_seconds.is_empty() {
            anyhow::bail!("retry_backoff_seconds must list at least one delay");
        }

        if self.endpoint_failure_threshold == 0 {
            anyhow::bail!("endpoint_failure_threshold must be greater than 0");
        }

        if self.stranded_retry_grace_seconds == 0 {
            anyhow::bail!("stranded_retry_grace_seconds must be greater than 0");
        }

        if self.session_reconnect_interval_seconds == 0 {
            anyhow::bail!("session_reconnect_interval_seconds must be greater than 0");
        }

        self.to_circuit_config()
            .validate()
            .map_err(|reason| anyhow::anyhow!("circuit_breaker {reason}"))?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            worker_pool_size: default_worker_count(),
            worker_batch_size: default_batch_size(),
            delivery_timeout_seconds: default_delivery_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_seconds: default_backoff_seconds(),
            allow_localhost: false,
            max_response_size: default_max_response_size(),
            endpoint_failure_threshold: default_endpoint_failure_threshold(),
            stranded_retry_grace_seconds: default_stranded_grace(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_success_threshold: default_success_threshold(),
            circuit_breaker_timeout_seconds: default_circuit_timeout(),
            circuit_breaker_half_open_max_calls: default_half_open_calls(),
            session_fallback_enabled: default_fallback_enabled(),
            session_reconnect_interval_seconds: default_reconnect_interval(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/bastion".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_count() -> usize {
    bastion_delivery::DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    bastion_delivery::DEFAULT_BATCH_SIZE
}

fn default_delivery_timeout() -> u64 {
    bastion_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_seconds() -> Vec<u64> {
    BackoffSchedule::default().into()
}

fn default_max_response_size() -> usize {
    10 * 1024
}

fn default_endpoint_failure_threshold() -> u32 {
    bastion_delivery::DEFAULT_FAILURE_THRESHOLD
}

fn default_stranded_grace() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_circuit_timeout() -> u64 {
    60
}

fn default_half_open_calls() -> u32 {
    1
}

fn default_fallback_enabled() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

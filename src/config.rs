//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address the REST/WS server binds to.
    pub bind_addr: String,
    /// Maximum batch size for non-execution bulk operations.
    pub max_bulk_items: usize,
    /// Maximum batch size for bulk execute/retry.
    pub max_bulk_executions: usize,
    /// Default per-execution timeout when a task sets none (None = unbounded).
    pub default_timeout: Option<Duration>,
    /// Default retry count for newly created tasks.
    pub default_max_retries: u32,
    /// Default flat retry delay for newly created tasks.
    pub default_retry_delay: Duration,
    /// How often the scheduler ticker scans for due tasks.
    pub tick_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_bulk_items: 100,
            max_bulk_executions: 20,
            default_timeout: Some(Duration::from_secs(300)),
            default_max_retries: 0,
            default_retry_delay: Duration::from_secs(30),
            tick_interval: Duration::from_secs(15),
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from `CONDUCTOR_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("CONDUCTOR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_bulk_items: env_parse("CONDUCTOR_MAX_BULK_ITEMS", defaults.max_bulk_items),
            max_bulk_executions: env_parse(
                "CONDUCTOR_MAX_BULK_EXECUTIONS",
                defaults.max_bulk_executions,
            ),
            default_timeout: match env_parse("CONDUCTOR_DEFAULT_TIMEOUT_SECS", 300u64) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            default_max_retries: env_parse(
                "CONDUCTOR_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            ),
            default_retry_delay: Duration::from_secs(env_parse(
                "CONDUCTOR_DEFAULT_RETRY_DELAY_SECS",
                defaults.default_retry_delay.as_secs(),
            )),
            tick_interval: Duration::from_secs(env_parse(
                "CONDUCTOR_TICK_INTERVAL_SECS",
                defaults.tick_interval.as_secs(),
            )),
        }
    }
}

/// Configuration for the HTTP agent transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the agent gateway, e.g. `http://localhost:9090`.
    pub base_url: String,
    /// Optional bearer token sent with every invocation.
    pub auth_token: Option<SecretString>,
}

impl TransportConfig {
    /// Build from `CONDUCTOR_AGENT_URL` / `CONDUCTOR_AGENT_TOKEN`.
    /// Returns None when no agent URL is configured.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CONDUCTOR_AGENT_URL").ok()?;
        let auth_token = std::env::var("CONDUCTOR_AGENT_TOKEN")
            .ok()
            .map(SecretString::from);
        Some(Self {
            base_url,
            auth_token,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

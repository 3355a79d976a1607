use std::time::Duration;

/// Process-wide configuration, loaded once from the environment at startup.
/// Field names mirror the keys in the external interface table; defaults
/// match the values named there.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_auth_token: Option<String>,
    pub port: u16,

    pub trust_proxy: bool,
    pub cors_origins: CorsOrigins,

    pub command_timeout: Duration,
    pub wake_verification_window: Duration,
    pub wake_verification_poll_interval: Duration,
    pub command_retention_days: i64,
    pub host_status_history_retention_days: i64,
    pub pruning_interval: Duration,

    pub schedule_worker_enabled: bool,
    pub schedule_poll_interval: Duration,
    pub schedule_batch_size: usize,

    pub ws_max_connections_per_ip: usize,
    pub ws_message_rate_limit_per_second: u32,
    pub ws_require_tls: bool,
    pub ws_allow_query_token_auth: bool,
    pub min_supported_protocol_version: u32,
    pub max_supported_protocol_version: u32,

    pub session_token_issuer: String,
    pub session_token_audience: String,
    pub session_token_ttl: Duration,
    pub session_token_secrets: Vec<String>,

    pub node_auth_tokens: Vec<String>,

    pub port_scan_cache_ttl: Duration,

    pub webhook_max_attempts: u32,
    pub webhook_backoff_base: Duration,

    pub mac_vendor_cache_ttl: Duration,
    pub mac_vendor_cache_capacity: usize,
}

#[derive(Debug, Clone)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            database_auth_token: std::env::var("TURSO_AUTH_TOKEN").ok(),
            port: env_parse("PORT", 3000)?,

            trust_proxy: env_bool("TRUST_PROXY", false),
            cors_origins: parse_cors_origins(&env_string("CORS_ORIGINS", "*")),

            command_timeout: Duration::from_millis(env_parse("COMMAND_TIMEOUT_MS", 30_000)?),
            wake_verification_window: Duration::from_millis(env_parse("WAKE_VERIFICATION_WINDOW_MS", 120_000)?),
            wake_verification_poll_interval: Duration::from_millis(env_parse("WAKE_VERIFICATION_POLL_INTERVAL_MS", 5_000)?),
            command_retention_days: env_parse("COMMAND_RETENTION_DAYS", 30)?,
            host_status_history_retention_days: env_parse("HOST_STATUS_HISTORY_RETENTION_DAYS", 90)?,
            pruning_interval: Duration::from_secs(env_parse::<u64>("PRUNING_INTERVAL_SECONDS", 3600)? ),

            schedule_worker_enabled: env_bool("SCHEDULE_WORKER_ENABLED", true),
            schedule_poll_interval: Duration::from_millis(env_parse("SCHEDULE_POLL_INTERVAL_MS", 60_000)?),
            schedule_batch_size: env_parse("SCHEDULE_BATCH_SIZE", 50)?,

            ws_max_connections_per_ip: env_parse("WS_MAX_CONNECTIONS_PER_IP", 8)?,
            ws_message_rate_limit_per_second: env_parse("WS_MESSAGE_RATE_LIMIT_PER_SECOND", 100)?,
            ws_require_tls: env_bool("WS_REQUIRE_TLS", false),
            ws_allow_query_token_auth: env_bool("WS_ALLOW_QUERY_TOKEN_AUTH", false),
            min_supported_protocol_version: env_parse("MIN_SUPPORTED_PROTOCOL_VERSION", 1)?,
            max_supported_protocol_version: env_parse("MAX_SUPPORTED_PROTOCOL_VERSION", 1)?,

            session_token_issuer: env_string("WS_SESSION_TOKEN_ISSUER", "cnc-core"),
            session_token_audience: env_string("WS_SESSION_TOKEN_AUDIENCE", "node-agent"),
            session_token_ttl: Duration::from_secs(env_parse("WS_SESSION_TOKEN_TTL_SECONDS", 3600)?),
            session_token_secrets: env_list("WS_SESSION_TOKEN_SECRETS"),

            node_auth_tokens: env_list("NODE_AUTH_TOKENS"),

            port_scan_cache_ttl: Duration::from_millis(env_parse("PORT_SCAN_CACHE_TTL_MS", 4 * 3_600_000)?),

            webhook_max_attempts: env_parse("WEBHOOK_MAX_ATTEMPTS", 5)?,
            webhook_backoff_base: Duration::from_millis(env_parse("WEBHOOK_BACKOFF_BASE_MS", 500)?),

            mac_vendor_cache_ttl: Duration::from_secs(env_parse::<u64>("MAC_VENDOR_CACHE_TTL_SECONDS", 24 * 3600)?),
            mac_vendor_cache_capacity: env_parse("MAC_VENDOR_CACHE_CAPACITY", 1000)?,
        })
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing required environment variable {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| matches!(v.as_str(), "1" | "true" | "yes")).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("environment variable {key} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_cors_origins(raw: &str) -> CorsOrigins {
    if raw.trim() == "*" {
        CorsOrigins::Any
    } else {
        CorsOrigins::List(raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
    }
}

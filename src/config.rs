//! Runtime configuration loaded from environment variables.
//!
//! Every knob has a default so the service boots with nothing but a writable
//! data directory. `.env` files are honored via dotenv in main.

use std::env;
use std::path::PathBuf;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Authentication mode for the HTTP/WS surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No authentication; every request gets all scopes. Development only.
    None,
    /// Three independent pre-shared bearer tokens (submit / read / admin).
    Psk,
    /// JWT verification (HS256 secret, PEM public key, or JWKS URL).
    Jwt,
}

impl AuthMode {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "psk" => Self::Psk,
            "jwt" => Self::Jwt,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub psk_submit: Option<String>,
    pub psk_read: Option<String>,
    pub psk_admin: Option<String>,
    /// HS256 shared secret.
    pub jwt_secret: Option<String>,
    /// PEM-encoded public key for RS256/ES256.
    pub jwt_public_key: Option<String>,
    /// JWKS endpoint; takes precedence over the static key when set.
    pub jwt_jwks_url: Option<String>,
    pub jwt_algorithm: String,
    /// Claim holding the scope list (space-separated string or array).
    pub jwt_scope_claim: String,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
}

impl AuthConfig {
    fn from_env() -> Self {
        let opt = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            mode: AuthMode::parse(&env_string("AUTH_MODE", "none")),
            psk_submit: opt("AUTH_TOKEN_SUBMIT"),
            psk_read: opt("AUTH_TOKEN_READ"),
            psk_admin: opt("AUTH_TOKEN_ADMIN"),
            jwt_secret: opt("JWT_SECRET"),
            jwt_public_key: opt("JWT_PUBLIC_KEY"),
            jwt_jwks_url: opt("JWT_JWKS_URL"),
            jwt_algorithm: env_string("JWT_ALGORITHM", "HS256"),
            jwt_scope_claim: env_string("JWT_SCOPE_CLAIM", "scope"),
            jwt_issuer: opt("JWT_ISSUER"),
            jwt_audience: opt("JWT_AUDIENCE"),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: String,
    pub queue_db_path: String,
    pub prompts_dir: String,
    pub profile_path: Option<String>,

    pub feature_profile: String,
    /// Static fallback model list when the config registry has no enabled rows.
    pub ai_models: Vec<String>,

    // Queue / retry policy
    pub retry_max: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub consumer_batch_size: usize,
    pub consumer_block_ms: u64,
    pub visibility_timeout_s: i64,
    pub dlq_enabled: bool,

    // Signal validation
    pub max_signal_age_s: i64,
    pub max_price_drift_bps: f64,

    // Market data provider
    pub provider_base_url: String,
    pub provider_timeout_ms: u64,
    pub asset_ctx_ttl_ms: u64,

    // Registries
    pub registry_ttl_s: u64,

    // Rate limiting (ingress)
    pub rate_limit_enabled: bool,
    pub rate_limit_per_min: u32,
    pub rate_limit_burst: u32,

    // WebSocket hub
    pub ws_enabled: bool,
    pub ws_max_connections: usize,

    // Shutdown
    pub shutdown_grace_s: u64,

    pub auth: AuthConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:3000"),
            db_path: env_string("DB_PATH", "lens.db"),
            queue_db_path: env_string("QUEUE_DB_PATH", "lens_queue.db"),
            prompts_dir: env_string("PROMPTS_DIR", "prompts"),
            profile_path: env::var("FEATURE_PROFILE_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty()),

            feature_profile: env_string("FEATURE_PROFILE", "trend_follow_v1"),
            ai_models: env_string("AI_MODELS", "chatgpt,gemini")
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),

            retry_max: env_or("RETRY_MAX", 5u32),
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", 2000u64),
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", 30_000u64),
            consumer_batch_size: env_or("CONSUMER_BATCH_SIZE", 10usize),
            consumer_block_ms: env_or("CONSUMER_BLOCK_MS", 5000u64),
            visibility_timeout_s: env_or("VISIBILITY_TIMEOUT_S", 60i64),
            dlq_enabled: env_flag("DLQ_ENABLED", true),

            max_signal_age_s: env_or("MAX_SIGNAL_AGE_SECONDS", 300i64),
            max_price_drift_bps: env_or("MAX_PRICE_DRIFT_BPS", 200.0f64),

            provider_base_url: env_string("HYPERLIQUID_BASE_URL", "https://api.hyperliquid.xyz"),
            provider_timeout_ms: env_or("PROVIDER_TIMEOUT_MS", 10_000u64),
            asset_ctx_ttl_ms: env_or("ASSET_CTX_TTL_MS", 5000u64),

            registry_ttl_s: env_or("REGISTRY_CACHE_TTL_S", 300u64),

            rate_limit_enabled: env_flag("RATE_LIMIT_ENABLED", true),
            rate_limit_per_min: env_or("RATE_LIMIT_PER_MIN", 60u32),
            rate_limit_burst: env_or("RATE_LIMIT_BURST", 120u32),

            ws_enabled: env_flag("WS_ENABLED", true),
            ws_max_connections: env_or("WS_MAX_CONNECTIONS", 100usize),

            shutdown_grace_s: env_or("SHUTDOWN_GRACE_S", 10u64),

            auth: AuthConfig::from_env(),
        }
    }

    /// Anchor a relative data path to the crate directory so running from a
    /// different working directory does not create a second empty database.
    pub fn resolve_data_path(raw: &str) -> String {
        let p = PathBuf::from(raw);
        if p.is_absolute() {
            return raw.to_string();
        }
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join(p)
            .to_string_lossy()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = Config::from_env();
        assert_eq!(cfg.retry_max, 5);
        assert_eq!(cfg.max_signal_age_s, 300);
        assert_eq!(cfg.max_price_drift_bps, 200.0);
        assert!(cfg.ai_models.contains(&"chatgpt".to_string()));
    }

    #[test]
    fn auth_mode_parses_case_insensitive() {
        assert_eq!(AuthMode::parse("PSK"), AuthMode::Psk);
        assert_eq!(AuthMode::parse("jwt"), AuthMode::Jwt);
        assert_eq!(AuthMode::parse("anything-else"), AuthMode::None);
    }
}

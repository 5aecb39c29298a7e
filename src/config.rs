// =============================================================================
// Process configuration, sourced from environment variables
// =============================================================================
//
// Centralizes the env-var reading the teacher scattered through `main.rs`
// into one struct, the way `RuntimeConfig` centralizes file-sourced config.

use anyhow::{bail, Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub auth_token: String,
    pub port: u16,
    pub store_url: Option<String>,
    pub use_stream: bool,
    pub use_polling_queue: bool,
    pub use_circuit_breaker: bool,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub signing_secret: String,
    /// Key for `crypto::decrypt_cookie`. `None` disables at-rest encryption
    /// of `auth:cookies`; the store is then assumed to hold plain JSON.
    pub encryption_secret: Option<String>,
    pub api_rate_limit_max: u32,
    pub log_level: String,
    pub base_url: String,
    pub api_url: String,
    pub sse_url: String,
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Loads from the process environment, failing fatally on the
    /// conditions spec.md §6 names (missing `AUTH_TOKEN`, invalid config).
    pub fn from_env() -> Result<Self> {
        let auth_token = std::env::var("AUTH_TOKEN").context(
            "AUTH_TOKEN is required (startup failure per configuration contract)",
        )?;
        if auth_token.trim().is_empty() {
            bail!("AUTH_TOKEN must not be empty");
        }

        let signing_secret = std::env::var("SIGNING_SECRET").unwrap_or_else(|_| {
            tracing::warn!("SIGNING_SECRET not set; falling back to AUTH_TOKEN for signing");
            auth_token.clone()
        });

        let port = env_u32("PORT", 8080) as u16;

        let use_stream = env_bool("USE_STREAM", true);
        let use_polling_queue = env_bool("USE_POLLING_QUEUE", true);
        if !use_stream && !use_polling_queue {
            bail!("at least one of USE_STREAM or USE_POLLING_QUEUE must be enabled");
        }

        let circuit_breaker_failure_threshold =
            env_u32("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5);
        let circuit_breaker_timeout =
            Duration::from_millis(env_u32("CIRCUIT_BREAKER_TIMEOUT", 30_000) as u64);

        Ok(Self {
            auth_token,
            port,
            store_url: std::env::var("STORE_URL").ok(),
            use_stream,
            use_polling_queue,
            use_circuit_breaker: env_bool("USE_CIRCUIT_BREAKER", true),
            circuit_breaker_failure_threshold,
            circuit_breaker_timeout,
            signing_secret,
            encryption_secret: std::env::var("ENCRYPTION_SECRET").ok(),
            api_rate_limit_max: env_u32("API_RATE_LIMIT_MAX", 100),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            base_url: std::env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://example-auctions.invalid".to_string()),
            api_url: std::env::var("UPSTREAM_API_URL")
                .unwrap_or_else(|_| "https://api.example-auctions.invalid".to_string()),
            sse_url: std::env::var("UPSTREAM_SSE_URL")
                .unwrap_or_else(|_| "https://sse.example-auctions.invalid".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "AUTH_TOKEN",
            "PORT",
            "USE_STREAM",
            "USE_POLLING_QUEUE",
            "SIGNING_SECRET",
            "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn missing_auth_token_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        assert!(AppConfig::from_env().is_err());
    }

    #[test]
    fn both_pipelines_disabled_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("AUTH_TOKEN", "secret");
        std::env::set_var("USE_STREAM", "false");
        std::env::set_var("USE_POLLING_QUEUE", "false");
        assert!(AppConfig::from_env().is_err());
        clear_all();
    }

    #[test]
    fn defaults_applied() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("AUTH_TOKEN", "secret");
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.circuit_breaker_failure_threshold, 5);
        assert!(cfg.use_stream);
        assert!(cfg.use_polling_queue);
        clear_all();
    }
}

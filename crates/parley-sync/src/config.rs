use std::time::Duration;

use parley_transport::BackoffConfig;

/// Tunables for a chat session. `from_env` reads `PARLEY_*` overrides so
/// deployments can adjust timings without a rebuild.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Hard deadline on every hub invoke.
    pub invoke_timeout: Duration,
    /// Remote typing facts expire this long after the last refresh. Safety
    /// net against a missed stop event; intentionally longer than the
    /// sender-side debounce.
    pub typing_ttl: Duration,
    /// Local inactivity window before an automatic typing-stop is emitted.
    pub typing_debounce: Duration,
    /// Read receipts accumulated within this window go out as one batch.
    pub read_batch_window: Duration,
    /// History page size for the initial fetch on conversation join.
    pub history_page_size: u32,
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(10),
            typing_ttl: Duration::from_secs(5),
            typing_debounce: Duration::from_secs(3),
            read_batch_window: Duration::from_millis(500),
            history_page_size: 50,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            invoke_timeout: env_ms("PARLEY_INVOKE_TIMEOUT_MS", defaults.invoke_timeout),
            typing_ttl: env_ms("PARLEY_TYPING_TTL_MS", defaults.typing_ttl),
            typing_debounce: env_ms("PARLEY_TYPING_DEBOUNCE_MS", defaults.typing_debounce),
            read_batch_window: env_ms("PARLEY_READ_BATCH_MS", defaults.read_batch_window),
            history_page_size: std::env::var("PARLEY_HISTORY_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.history_page_size),
            backoff: BackoffConfig {
                base: env_ms("PARLEY_BACKOFF_BASE_MS", defaults.backoff.base),
                cap: env_ms("PARLEY_BACKOFF_CAP_MS", defaults.backoff.cap),
            },
        }
    }
}

fn env_ms(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

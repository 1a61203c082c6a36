//! Tuning knobs for [`crate::ClientCacheProxy`].
//!
//! Hosts usually embed these values in their own configuration files; with
//! the `serde` feature the struct deserialises directly and missing fields
//! fall back to their defaults.

use std::time::Duration;

/// Default staleness window in seconds.
pub const DEFAULT_SECONDS_UNTIL_STALE: u64 = 300;
/// Default cache size, in features, above which a warning is logged.
pub const DEFAULT_MAX_CACHE_ITEMS: usize = 8192;
/// Default upper bound on background worker threads.
pub const DEFAULT_MAX_CLIENT_REQUEST_THREADS: usize = 3;

/// Configuration for a client/cache proxy.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use meridian_proxy::ProxyConfig;
///
/// let config = ProxyConfig::default().with_seconds_until_stale(60);
/// assert_eq!(config.stale_window(), Duration::from_secs(60));
/// assert_eq!(config.max_client_request_threads, 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProxyConfig {
    /// Seconds a cached feature or queried region stays fresh.
    pub seconds_until_stale: u64,
    /// Feature count at which the cache is reported full.
    pub max_cache_items: usize,
    /// Upper bound on background worker threads.
    pub max_client_request_threads: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            seconds_until_stale: DEFAULT_SECONDS_UNTIL_STALE,
            max_cache_items: DEFAULT_MAX_CACHE_ITEMS,
            max_client_request_threads: DEFAULT_MAX_CLIENT_REQUEST_THREADS,
        }
    }
}

impl ProxyConfig {
    /// Replace the staleness window.
    #[must_use]
    pub const fn with_seconds_until_stale(mut self, seconds: u64) -> Self {
        self.seconds_until_stale = seconds;
        self
    }

    /// Replace the cache size limit.
    #[must_use]
    pub const fn with_max_cache_items(mut self, items: usize) -> Self {
        self.max_cache_items = items;
        self
    }

    /// Replace the worker thread bound.
    #[must_use]
    pub const fn with_max_client_request_threads(mut self, threads: usize) -> Self {
        self.max_client_request_threads = threads;
        self
    }

    /// Staleness window as a [`Duration`].
    #[must_use]
    pub const fn stale_window(&self) -> Duration {
        Duration::from_secs(self.seconds_until_stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn defaults_match_documented_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.seconds_until_stale, 300);
        assert_eq!(config.max_cache_items, 8192);
        assert_eq!(config.max_client_request_threads, 3);
    }

    #[rstest]
    fn setters_chain() {
        let config = ProxyConfig::default()
            .with_max_cache_items(10)
            .with_max_client_request_threads(1);
        assert_eq!(config.max_cache_items, 10);
        assert_eq!(config.max_client_request_threads, 1);
        assert_eq!(config.seconds_until_stale, DEFAULT_SECONDS_UNTIL_STALE);
    }

    #[cfg(feature = "serde")]
    #[rstest]
    #[case(r#"{}"#, ProxyConfig::default())]
    #[case(
        r#"{"seconds_until_stale": 30}"#,
        ProxyConfig::default().with_seconds_until_stale(30)
    )]
    #[case(
        r#"{"max_cache_items": 5, "max_client_request_threads": 8}"#,
        ProxyConfig::default().with_max_cache_items(5).with_max_client_request_threads(8)
    )]
    fn missing_fields_fall_back_to_defaults(#[case] json: &str, #[case] expected: ProxyConfig) {
        let config: ProxyConfig = serde_json::from_str(json).expect("valid config json");
        assert_eq!(config, expected);
    }
}

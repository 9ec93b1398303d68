//! Worker-wide configuration knobs (§6), layered: compiled-in defaults →
//! builder overrides → environment variable overrides, read once at
//! `build()` time -- matching the pattern `BeatBuilder` already uses for its
//! own broker-connection knobs.

use std::env;
use std::time::Duration;

/// Configuration consumed by the connection step, the QoS controller, and the
/// namespace's boot-step registration.
#[derive(Clone, Debug)]
pub struct Config {
    /// `BROKER_CONNECTION_RETRY`. If false, the connection step performs a
    /// single `connect()` and propagates failure instead of retrying.
    pub broker_connection_retry: bool,

    /// `BROKER_CONNECTION_MAX_RETRIES`. `None` means unbounded.
    pub broker_connection_max_retries: Option<u32>,

    /// `BROKER_CONNECTION_TIMEOUT`, per connection attempt.
    pub broker_connection_timeout: Duration,

    /// `BROKER_HEARTBEAT`, used when the consumer isn't constructed with an
    /// explicit heartbeat.
    pub broker_heartbeat: u16,

    /// Number of concurrent pool workers; combined with
    /// `prefetch_multiplier` to compute the initial QoS value.
    pub concurrency: u16,

    /// Scalar applied to `concurrency` to yield the initial prefetch count.
    pub prefetch_multiplier: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            broker_connection_retry: true,
            broker_connection_max_retries: None,
            broker_connection_timeout: Duration::from_secs(4),
            broker_heartbeat: 0,
            concurrency: num_cpus_fallback(),
            prefetch_multiplier: 4,
        }
    }
}

impl Config {
    /// Initial prefetch count: `concurrency * prefetch_multiplier` (§4.4).
    pub fn initial_prefetch_count(&self) -> u16 {
        self.concurrency.saturating_mul(self.prefetch_multiplier)
    }

    /// Apply environment-variable overrides on top of whatever has already
    /// been set by builder methods. Unset or unparsable variables are
    /// silently ignored -- a malformed environment should fall back to the
    /// programmatic configuration, not crash the worker at startup.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_bool("BROKER_CONNECTION_RETRY") {
            self.broker_connection_retry = v;
        }
        if let Some(v) = env_parse::<u32>("BROKER_CONNECTION_MAX_RETRIES") {
            self.broker_connection_max_retries = Some(v);
        }
        if let Some(v) = env_parse::<u64>("BROKER_CONNECTION_TIMEOUT") {
            self.broker_connection_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u16>("BROKER_HEARTBEAT") {
            self.broker_heartbeat = v;
        }
        self
    }
}

fn env_bool(name: &str) -> Option<bool> {
    match env::var(name).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

/// Fall back to a single worker when the number of available cores can't be
/// determined, rather than pulling in `num_cpus` for one call site.
fn num_cpus_fallback() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u16)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_prefetch_count_multiplies() {
        let cfg = Config {
            concurrency: 4,
            prefetch_multiplier: 2,
            ..Config::default()
        };
        assert_eq!(cfg.initial_prefetch_count(), 8);
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        assert_eq!(env_bool("__CONSUMER_CORE_TEST_UNSET__"), None);
    }
}

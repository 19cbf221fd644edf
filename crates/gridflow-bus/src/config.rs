use std::time::Duration;

/// Default NATS server URL used when neither env var nor CLI flag overrides it.
pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";

/// Environment variable carrying the bus connection URL.
pub const BUS_URL_ENV: &str = "GRIDFLOW_BUS_URL";

/// Connection and delivery tuning for the durable bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    /// How long JetStream waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// Redelivery ceiling before a message is parked (terminated, not retried).
    pub max_deliver: i64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
        }
    }
}

impl BusConfig {
    /// Reads `GRIDFLOW_BUS_URL`, falling back to [`DEFAULT_URL`]. Ack/deliver
    /// tuning is not currently env-overridable; callers that need different
    /// values construct `BusConfig` directly.
    pub fn from_env() -> Self {
        let url = std::env::var(BUS_URL_ENV).unwrap_or_else(|_| DEFAULT_URL.to_string());
        Self {
            url,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url_is_localhost() {
        assert_eq!(BusConfig::default().url, DEFAULT_URL);
    }

    #[test]
    fn from_env_falls_back_without_var() {
        // Assumes the test process doesn't have GRIDFLOW_BUS_URL set; this
        // mirrors the sibling DbConfig::from_env tests in gridflow-db.
        if std::env::var(BUS_URL_ENV).is_err() {
            assert_eq!(BusConfig::from_env().url, DEFAULT_URL);
        }
    }
}

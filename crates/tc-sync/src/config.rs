//! Watcher configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling settings for the refresh coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Delay between two modification-time checks of one dataset
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 5_000 }
    }
}

impl WatchConfig {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            poll_interval_ms: interval.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }

    /// Never zero, so a misconfigured watcher cannot spin
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_five_seconds() {
        assert_eq!(WatchConfig::default().poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config: WatchConfig = serde_json::from_str(r#"{ "poll_interval_ms": 0 }"#).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(WatchConfig::with_interval(Duration::from_millis(250)).poll_interval_ms, 250);
    }
}

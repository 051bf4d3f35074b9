//! Engine configuration, read from `KMIRROR_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Selector;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Forced re-list period. Zero disables periodic resync.
    pub resync_period: Duration,
    /// Keep redelivering deltas whose processing failed instead of dropping
    /// them after one retry.
    pub retry_on_error: bool,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub selector: Selector,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::ZERO,
            retry_on_error: false,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
            selector: Selector::everything(),
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as `from_env` with an injectable lookup. Unparseable values keep
    /// their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| -> Option<u64> {
            let raw = get(k)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(var = k, value = %raw, "ignoring unparseable setting");
                    None
                }
            }
        };
        let flag = |k: &str| -> Option<bool> {
            get(k).map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        };
        Self {
            resync_period: num("KMIRROR_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync_period),
            retry_on_error: flag("KMIRROR_RETRY_ON_ERROR").unwrap_or(d.retry_on_error),
            backoff_initial: num("KMIRROR_BACKOFF_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.backoff_initial),
            backoff_max: num("KMIRROR_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            selector: Selector {
                label: get("KMIRROR_LABEL_SELECTOR").filter(|s| !s.is_empty()),
                field: get("KMIRROR_FIELD_SELECTOR").filter(|s| !s.is_empty()),
            },
        }
    }

    pub fn backoff(&self) -> crate::Backoff {
        crate::Backoff::new(self.backoff_initial, self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn reads_overrides_and_keeps_defaults() {
        let env: HashMap<&str, &str> = [
            ("KMIRROR_RESYNC_SECS", "60"),
            ("KMIRROR_RETRY_ON_ERROR", "true"),
            ("KMIRROR_BACKOFF_INITIAL_MS", "not-a-number"),
            ("KMIRROR_LABEL_SELECTOR", "app=web"),
        ]
        .into_iter()
        .collect();
        let cfg = WatchConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.resync_period, Duration::from_secs(60));
        assert!(cfg.retry_on_error);
        assert_eq!(cfg.backoff_initial, Duration::from_millis(200));
        assert_eq!(cfg.backoff_max, Duration::from_secs(30));
        assert_eq!(cfg.selector.label.as_deref(), Some("app=web"));
        assert!(cfg.selector.field.is_none());
    }
}

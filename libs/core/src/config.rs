use std::time::Duration;

use crate::normalizer::DEFAULT_DATA_TYPE_FIELD;

const DEBUG_ENV: &str = "IMB_DEBUG";
const CALLBACK_TTL_ENV: &str = "IMB_CALLBACK_TTL_SECS";
const SWEEP_INTERVAL_ENV: &str = "IMB_SWEEP_INTERVAL_SECS";
const DATA_TYPE_FIELD_ENV: &str = "IMB_DATA_TYPE_FIELD";

/// Runtime settings for the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub debug: bool,
    /// Age after which an unresolved callback is reclaimed.
    pub callback_ttl: Duration,
    pub sweep_interval: Duration,
    pub data_type_field: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            debug: false,
            callback_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            data_type_field: DEFAULT_DATA_TYPE_FIELD.to_string(),
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unparsable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(debug) = lookup(DEBUG_ENV) {
            cfg.debug = matches!(
                debug.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(ttl) = lookup(CALLBACK_TTL_ENV).and_then(|v| v.trim().parse::<u64>().ok()) {
            cfg.callback_ttl = Duration::from_secs(ttl);
        }
        if let Some(interval) =
            lookup(SWEEP_INTERVAL_ENV).and_then(|v| v.trim().parse::<u64>().ok())
        {
            cfg.sweep_interval = Duration::from_secs(interval.max(1));
        }
        if let Some(field) = lookup(DATA_TYPE_FIELD_ENV) {
            if !field.trim().is_empty() {
                cfg.data_type_field = field.trim().to_string();
            }
        }
        cfg
    }

    pub fn callback_ttl_ms(&self) -> i64 {
        i64::try_from(self.callback_ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

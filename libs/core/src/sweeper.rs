use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::callbacks::CallbackRegistry;
use crate::config::CoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub max_age_ms: i64,
}

impl From<&CoreConfig> for SweeperConfig {
    fn from(cfg: &CoreConfig) -> Self {
        Self {
            interval: cfg.sweep_interval,
            max_age_ms: cfg.callback_ttl_ms(),
        }
    }
}

/// Periodically reclaims callbacks whose backend never answered.
///
/// Must be called from within a Tokio runtime. Abort the returned handle to stop.
pub fn spawn_expiry_sweeper(registry: Arc<CallbackRegistry>, cfg: SweeperConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = registry.remove_expired(cfg.max_age_ms);
            if removed > 0 {
                debug!(removed, remaining = registry.len(), "expired result callbacks reclaimed");
            }
        }
    })
}

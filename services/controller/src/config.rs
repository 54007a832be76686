use std::time::Duration;

use anyhow::{Context, Result};

/// Minimum time between auto-triggered rebalance requests unless overridden.
pub const DEFAULT_AUTO_TRIGGER_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Config {
    pub auto_trigger_cooldown: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let auto_trigger_cooldown = match std::env::var("KORE_AUTO_TRIGGER_COOLDOWN_SECONDS") {
            Ok(raw) => {
                let secs: u64 = raw
                    .parse()
                    .context("invalid KORE_AUTO_TRIGGER_COOLDOWN_SECONDS")?;
                Duration::from_secs(secs)
            }
            Err(_) => DEFAULT_AUTO_TRIGGER_COOLDOWN,
        };

        let log_level = std::env::var("KORE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            auto_trigger_cooldown,
            log_level,
        })
    }
}

//! Top-level engine configuration.
//!
//! Mirrors `gb_types::backtest::BacktestConfig`'s `Default::default()` +
//! chainable `with_*` setters convention rather than a loader/builder type of
//! its own; there is no network configuration service (spec §2.1).

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::registry::StorageRoots;

/// Process-wide defaults for the engine: where it persists state, how often
/// the live driver ticks absent a strategy-specific interval, whether it
/// recovers from disk on startup, and the default exchange fee rate.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage: StorageRoots,
    pub default_tick_interval: Duration,
    pub recover_on_startup: bool,
    pub default_fee_rate: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageRoots::default(),
            default_tick_interval: Duration::from_secs(60),
            recover_on_startup: true,
            default_fee_rate: Decimal::ZERO,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dump_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.storage = StorageRoots {
            persist_root: root.join("persist"),
            schedule_root: root.join("schedule"),
            risk_root: root.join("risk"),
        };
        self
    }

    pub fn with_default_tick_interval(mut self, interval: Duration) -> Self {
        self.default_tick_interval = interval;
        self
    }

    pub fn with_recover_on_startup(mut self, recover: bool) -> Self {
        self.recover_on_startup = recover;
        self
    }

    pub fn with_default_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.default_fee_rate = fee_rate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_recovers_on_startup_with_zero_fee() {
        let config = EngineConfig::default();
        assert!(config.recover_on_startup);
        assert_eq!(config.default_fee_rate, Decimal::ZERO);
    }

    #[test]
    fn with_dump_root_rewrites_all_three_storage_roots() {
        let config = EngineConfig::new().with_dump_root("/tmp/my-engine");
        assert_eq!(config.storage.persist_root, PathBuf::from("/tmp/my-engine/persist"));
        assert_eq!(config.storage.schedule_root, PathBuf::from("/tmp/my-engine/schedule"));
        assert_eq!(config.storage.risk_root, PathBuf::from("/tmp/my-engine/risk"));
    }
}

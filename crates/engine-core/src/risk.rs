//! Shared, cross-strategy risk tracker.
//!
//! Generalises `gb-live::risk::RiskManager::check_order`'s sequential,
//! short-circuiting check pipeline from a fixed five-check ladder to a
//! user-supplied list of [`Validation`]s, and replaces its single-owner
//! `&mut self` model with a `tokio::sync::Mutex`-guarded map so the tracker
//! can be shared across concurrently ticking strategies.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use engine_types::errors::{EngineResult, RiskError};
use engine_types::market::Symbol;
use engine_types::schema::{Validation, ValidationPayload};
use engine_types::signal::ActivePosition;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::events::{EventBus, NormalisedError};
use crate::persistence::{Backend, FilesystemBackend};

/// Lazy one-shot load state for the active-position map: avoids a sentinel
/// value inside the map itself and lets concurrent first-callers await a
/// single in-flight load rather than racing to perform it.
enum LoadState {
    NotLoaded,
    Loading(Arc<Notify>),
    Loaded,
}

struct RiskState {
    load: LoadState,
    positions: HashMap<String, ActivePosition>,
}

/// One instance per `riskName`, shared across every strategy whose schema
/// points to it.
pub struct ClientRisk {
    risk_name: String,
    validations: Vec<Arc<dyn Validation>>,
    state: Mutex<RiskState>,
    backend: Option<FilesystemBackend>,
    backtest: bool,
}

impl ClientRisk {
    /// `backend = None` or `backtest = true` skips persistence entirely;
    /// backtest mode additionally skips the initial load and starts empty.
    pub fn new(
        risk_name: impl Into<String>,
        validations: Vec<Arc<dyn Validation>>,
        backend: Option<FilesystemBackend>,
        backtest: bool,
    ) -> Self {
        let load = if backtest {
            LoadState::Loaded
        } else {
            LoadState::NotLoaded
        };
        Self {
            risk_name: risk_name.into(),
            validations,
            state: Mutex::new(RiskState {
                load,
                positions: HashMap::new(),
            }),
            backend,
            backtest,
        }
    }

    fn snapshot_key(&self) -> String {
        format!("risk_{}", self.risk_name)
    }

    /// Ensures the active-position map has been loaded exactly once. Called
    /// at the top of every public method.
    async fn ensure_loaded(&self) {
        if self.backtest {
            return;
        }

        let notify = {
            let mut state = self.state.lock().await;
            match &state.load {
                LoadState::Loaded => return,
                LoadState::Loading(notify) => Some(notify.clone()),
                LoadState::NotLoaded => {
                    let notify = Arc::new(Notify::new());
                    state.load = LoadState::Loading(notify.clone());
                    None
                }
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            return;
        }

        let loaded = self.load_from_backend().await;

        let mut state = self.state.lock().await;
        if let Some(positions) = loaded {
            state.positions = positions;
        }
        if let LoadState::Loading(notify) = std::mem::replace(&mut state.load, LoadState::Loaded) {
            notify.notify_waiters();
        }
    }

    async fn load_from_backend(&self) -> Option<HashMap<String, ActivePosition>> {
        let backend = self.backend.as_ref()?;
        match backend.read_data(&self.snapshot_key()).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(positions) => Some(positions),
                Err(e) => {
                    warn!(risk_name = %self.risk_name, error = %e, "risk snapshot corrupt, starting empty");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(risk_name = %self.risk_name, error = %e, "risk snapshot load failed, starting empty");
                None
            }
        }
    }

    async fn persist(&self, positions: &HashMap<String, ActivePosition>) {
        if self.backtest {
            return;
        }
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let Ok(bytes) = serde_json::to_vec(positions) else {
            return;
        };
        if let Err(e) = backend.write_data(&self.snapshot_key(), &bytes).await {
            warn!(risk_name = %self.risk_name, error = %e, "risk snapshot persist failed");
        }
    }

    /// Runs every validation against a payload built from a snapshot of the
    /// current map, short-circuiting on the first failure. Failures are
    /// forwarded to the `validation` subject and logged, never propagated as
    /// an error to the caller.
    pub async fn check_signal(
        &self,
        symbol: &Symbol,
        strategy_name: &str,
        exchange_name: &str,
        current_price: Decimal,
        bus: &EventBus,
    ) -> bool {
        self.ensure_loaded().await;

        let (active_position_count, active_positions) = {
            let state = self.state.lock().await;
            (state.positions.len(), state.positions.values().cloned().collect::<Vec<_>>())
        };

        let payload = ValidationPayload {
            symbol: symbol.clone(),
            strategy_name: strategy_name.to_string(),
            exchange_name: exchange_name.to_string(),
            current_price,
            timestamp: Utc::now(),
            active_position_count,
            active_positions,
        };

        for validation in &self.validations {
            if let Err(message) = validation.validate(&payload) {
                let composite_key = format!("{strategy_name}:{symbol}");
                let error = RiskError::ValidationFailed {
                    composite_key: composite_key.clone(),
                    note: validation.note().to_string(),
                    message: message.clone(),
                };
                warn!(%composite_key, note = validation.note(), %message, "risk validation rejected signal");
                bus.emit_validation(
                    NormalisedError::new(error.to_string())
                        .with_strategy(strategy_name)
                        .with_exchange(exchange_name)
                        .with_symbol(symbol.as_str()),
                );
                return false;
            }
        }

        true
    }

    pub async fn add_signal(&self, position: ActivePosition) -> EngineResult<()> {
        self.ensure_loaded().await;
        let mut state = self.state.lock().await;
        state.positions.insert(position.composite_key(), position);
        let snapshot = state.positions.clone();
        drop(state);
        self.persist(&snapshot).await;
        Ok(())
    }

    pub async fn remove_signal(&self, strategy_name: &str, symbol: &Symbol) -> EngineResult<()> {
        self.ensure_loaded().await;
        let composite_key = format!("{strategy_name}:{symbol}");
        let mut state = self.state.lock().await;
        state.positions.remove(&composite_key);
        let snapshot = state.positions.clone();
        drop(state);
        self.persist(&snapshot).await;
        Ok(())
    }

    pub async fn active_position_count(&self) -> usize {
        self.ensure_loaded().await;
        self.state.lock().await.positions.len()
    }
}

/// No-op risk tracker for strategies without a `riskName`: every signal
/// passes, nothing is tracked.
pub struct NoRisk;

impl NoRisk {
    pub async fn check_signal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_types::schema::ClosureValidation;
    use engine_types::signal::{Position, SignalRow};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sample_position(symbol: &str, strategy_name: &str) -> ActivePosition {
        ActivePosition {
            signal: SignalRow {
                id: Uuid::new_v4(),
                symbol: Symbol::new(symbol),
                strategy_name: strategy_name.into(),
                exchange_name: "binance".into(),
                position: Position::Long,
                price_open: dec!(100),
                price_take_profit: dec!(110),
                price_stop_loss: dec!(95),
                minute_estimated_time: 60,
                scheduled_at: Utc::now(),
                pending_at: Some(Utc::now()),
                is_scheduled: false,
            },
            strategy_name: strategy_name.into(),
            exchange_name: "binance".into(),
            open_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn add_then_remove_roundtrips() {
        let risk = ClientRisk::new("shared", Vec::new(), None, true);
        let position = sample_position("BTCUSDT", "trend");
        risk.add_signal(position).await.unwrap();
        assert_eq!(risk.active_position_count().await, 1);

        risk.remove_signal("trend", &Symbol::new("BTCUSDT")).await.unwrap();
        assert_eq!(risk.active_position_count().await, 0);
    }

    #[tokio::test]
    async fn validation_short_circuit_stops_at_first_failure() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));

        let calls_a = calls.clone();
        let first: Arc<dyn Validation> = Arc::new(ClosureValidation::new("first", move |_payload| {
            calls_a.lock().unwrap().push("first");
            Err("rejected".to_string())
        }));

        let calls_b = calls.clone();
        let second: Arc<dyn Validation> = Arc::new(ClosureValidation::new("second", move |_payload| {
            calls_b.lock().unwrap().push("second");
            Ok(())
        }));

        let risk = ClientRisk::new("shared", vec![first, second], None, true);
        let bus = EventBus::new();
        let passed = risk
            .check_signal(&Symbol::new("BTCUSDT"), "trend", "binance", dec!(100), &bus)
            .await;

        assert!(!passed);
        let recorded = calls.lock().unwrap();
        assert_eq!(recorded.as_slice(), &["first"]);
    }

    #[tokio::test]
    async fn max_positions_validation_rejects_second_strategy() {
        let max_positions: Arc<dyn Validation> = Arc::new(ClosureValidation::new("max_positions", |payload| {
            if payload.active_position_count >= 1 {
                Err("max 1 position".to_string())
            } else {
                Ok(())
            }
        }));

        let risk = ClientRisk::new("shared", vec![max_positions], None, true);
        let bus = EventBus::new();

        risk.add_signal(sample_position("BTCUSDT", "strategyA")).await.unwrap();

        let passed = risk
            .check_signal(&Symbol::new("ETHUSDT"), "strategyB", "binance", dec!(100), &bus)
            .await;
        assert!(!passed);
        assert_eq!(risk.active_position_count().await, 1);
    }
}

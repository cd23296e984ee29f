use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineResult, ExchangeError, FrameError};
use crate::market::{Candle, Symbol};
use crate::signal::{ActivePosition, SignalProposal};

/// What a strategy's `getSignal` callback sees on every `tick()`.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyTickContext {
    pub symbol: Symbol,
    pub when: DateTime<Utc>,
    pub backtest: bool,
    pub current_price: Decimal,
}

/// User-supplied strategy decision logic. This is the pull-based counterpart
/// to the spec's `getSignal(ctx) -> SignalProposal|null`; it may suspend
/// (fetch external data, consult a model) since the engine's concurrency
/// model explicitly allows `getSignal` to be a suspension point.
#[async_trait]
pub trait StrategyLogic: Send + Sync {
    async fn get_signal(&self, ctx: &StrategyTickContext) -> Option<SignalProposal>;
}

/// A strategy registration: name, tick throttle, optional risk/sizing
/// profile, and the decision logic. Immutable once constructed.
#[derive(Clone)]
pub struct StrategySchema {
    pub strategy_name: String,
    pub interval: Duration,
    pub risk_name: Option<String>,
    pub sizing_name: Option<String>,
    pub logic: Arc<dyn StrategyLogic>,
}

impl StrategySchema {
    pub fn new(strategy_name: impl Into<String>, interval: Duration, logic: Arc<dyn StrategyLogic>) -> Self {
        Self {
            strategy_name: strategy_name.into(),
            interval,
            risk_name: None,
            sizing_name: None,
            logic,
        }
    }

    pub fn with_risk(mut self, risk_name: impl Into<String>) -> Self {
        self.risk_name = Some(risk_name.into());
        self
    }

    pub fn with_sizing(mut self, sizing_name: impl Into<String>) -> Self {
        self.sizing_name = Some(sizing_name.into());
        self
    }
}

/// Exchange adapter contract (spec §6): candle fetch, VWAP, price/quantity
/// formatting. Concrete HTTP/WebSocket clients are out of scope; this is the
/// plug-in boundary.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<Candle>>;

    async fn get_average_price(&self, symbol: &Symbol) -> EngineResult<Decimal>;

    fn format_price(&self, symbol: &Symbol, price: Decimal) -> Decimal;

    fn format_quantity(&self, symbol: &Symbol, quantity: Decimal) -> Decimal;
}

#[derive(Clone)]
pub struct ExchangeSchema {
    pub exchange_name: String,
    pub fee_rate: Decimal,
    pub client: Arc<dyn ExchangeClient>,
}

impl ExchangeSchema {
    pub fn new(exchange_name: impl Into<String>, client: Arc<dyn ExchangeClient>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            fee_rate: Decimal::ZERO,
            client,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }
}

/// Produces the ordered sequence of backtest window boundaries.
pub trait FrameGenerator: Send + Sync {
    fn boundaries(&self, from_ts: DateTime<Utc>, to_ts: DateTime<Utc>) -> Vec<DateTime<Utc>>;
}

#[derive(Clone)]
pub struct FrameSchema {
    pub frame_name: String,
    pub generator: Arc<dyn FrameGenerator>,
}

impl FrameSchema {
    pub fn new(frame_name: impl Into<String>, generator: Arc<dyn FrameGenerator>) -> Self {
        Self {
            frame_name: frame_name.into(),
            generator,
        }
    }

    pub fn boundaries(&self, from_ts: DateTime<Utc>, to_ts: DateTime<Utc>) -> EngineResult<Vec<DateTime<Utc>>> {
        let boundaries = self.generator.boundaries(from_ts, to_ts);
        if boundaries.is_empty() {
            return Err(FrameError::Empty {
                frame_name: self.frame_name.clone(),
            }
            .into());
        }
        Ok(boundaries)
    }
}

/// Fixed-step frame generator, the common case: boundaries every `step`.
pub struct FixedStepFrame {
    pub step: chrono::Duration,
}

impl FrameGenerator for FixedStepFrame {
    fn boundaries(&self, from_ts: DateTime<Utc>, to_ts: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut boundaries = Vec::new();
        let mut current = from_ts;
        while current <= to_ts {
            boundaries.push(current);
            current += self.step;
        }
        boundaries
    }
}

/// The payload passed to every risk validation: the incoming signal request
/// plus a snapshot of the risk tracker's current portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPayload {
    pub symbol: Symbol,
    pub strategy_name: String,
    pub exchange_name: String,
    pub current_price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub active_position_count: usize,
    pub active_positions: Vec<ActivePosition>,
}

/// A single user-supplied risk rule. `validate` returns `Err(message)` on
/// rejection (the spec's "throw"); `note` is purely informational and
/// surfaces in logs and the `validation` event subject.
pub trait Validation: Send + Sync {
    fn note(&self) -> &str;
    fn validate(&self, payload: &ValidationPayload) -> Result<(), String>;
}

/// Adapts a plain closure to [`Validation`], covering the spec's "either a
/// callable or an object with a note" validation format.
pub struct ClosureValidation<F> {
    note: String,
    func: F,
}

impl<F> ClosureValidation<F>
where
    F: Fn(&ValidationPayload) -> Result<(), String> + Send + Sync,
{
    pub fn new(note: impl Into<String>, func: F) -> Self {
        Self {
            note: note.into(),
            func,
        }
    }
}

impl<F> Validation for ClosureValidation<F>
where
    F: Fn(&ValidationPayload) -> Result<(), String> + Send + Sync,
{
    fn note(&self) -> &str {
        &self.note
    }

    fn validate(&self, payload: &ValidationPayload) -> Result<(), String> {
        (self.func)(payload)
    }
}

#[derive(Clone)]
pub struct RiskSchema {
    pub risk_name: String,
    pub validations: Vec<Arc<dyn Validation>>,
}

impl RiskSchema {
    pub fn new(risk_name: impl Into<String>, validations: Vec<Arc<dyn Validation>>) -> Self {
        Self {
            risk_name: risk_name.into(),
            validations,
        }
    }
}

/// Pure function from (equity, price, parameters) to order quantity.
pub trait SizingLogic: Send + Sync {
    fn size_for(&self, equity: Decimal, price: Decimal, params: &serde_json::Value) -> Decimal;
}

#[derive(Clone)]
pub struct SizingSchema {
    pub sizing_name: String,
    pub sizer: Arc<dyn SizingLogic>,
}

impl SizingSchema {
    pub fn new(sizing_name: impl Into<String>, sizer: Arc<dyn SizingLogic>) -> Self {
        Self {
            sizing_name: sizing_name.into(),
            sizer,
        }
    }
}

/// Error-raising helper mirroring the engine's "candle fetch failed"
/// wrapping, used by `ExchangeClient` implementors in tests and examples.
pub fn exchange_fetch_error(symbol: &Symbol, message: impl Into<String>) -> ExchangeError {
    ExchangeError::CandleFetchFailed {
        symbol: symbol.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_step_frame_produces_inclusive_boundaries() {
        let frame = FixedStepFrame {
            step: chrono::Duration::minutes(1),
        };
        let from = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let to = from + chrono::Duration::minutes(3);
        let boundaries = frame.boundaries(from, to);
        assert_eq!(boundaries.len(), 4);
        assert_eq!(boundaries[0], from);
        assert_eq!(boundaries[3], to);
    }

    #[test]
    fn frame_schema_rejects_empty_generator() {
        struct EmptyFrame;
        impl FrameGenerator for EmptyFrame {
            fn boundaries(&self, _from_ts: DateTime<Utc>, _to_ts: DateTime<Utc>) -> Vec<DateTime<Utc>> {
                Vec::new()
            }
        }
        let schema = FrameSchema::new("empty", Arc::new(EmptyFrame));
        let result = schema.boundaries(Utc::now(), Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn closure_validation_carries_note() {
        let validation = ClosureValidation::new("max_positions", |payload: &ValidationPayload| {
            if payload.active_position_count >= 1 {
                Err("max 1 position".to_string())
            } else {
                Ok(())
            }
        });
        assert_eq!(validation.note(), "max_positions");

        let payload = ValidationPayload {
            symbol: Symbol::new("ETHUSDT"),
            strategy_name: "b".into(),
            exchange_name: "binance".into(),
            current_price: Decimal::ONE,
            timestamp: Utc::now(),
            active_position_count: 1,
            active_positions: Vec::new(),
        };
        assert!(validation.validate(&payload).is_err());
    }
}

//! Backtest execution driver.
//!
//! Grounded on `gb-engine::simulator::MarketSimulator`'s chronological event
//! walk and `gb-engine::lib::BacktestEngine::run_with_strategy` (the "real"
//! strategy-driven entry point, as opposed to the legacy fixed-allocation
//! `run()` this crate does not carry forward).

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use engine_core::events::{EventBus, MetricType, NormalisedError};
use engine_core::registry::ConnectionRegistry;
use engine_types::errors::EngineResult;
use engine_types::market::Symbol;
use engine_types::signal::TickResult;
use tracing::{error, info};

use crate::metrics::PerformanceEmitter;

pub struct BacktestDriver {
    registry: Arc<ConnectionRegistry>,
}

impl BacktestDriver {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Runs `symbol` across `frame_name`'s boundaries from `from_ts` to
    /// `to_ts`. Every `tick()` is recorded; an `Opened` result triggers an
    /// immediate fast-forward over the candles remaining in the window, via
    /// `candle_interval` (the exchange's granularity for the fetched
    /// candles).
    pub async fn run(
        &self,
        symbol: &Symbol,
        strategy_name: &str,
        exchange_name: &str,
        frame_name: &str,
        candle_interval: &str,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
    ) -> EngineResult<Vec<TickResult>> {
        let strategy = self.registry.strategy(strategy_name, exchange_name)?;
        let frame = self.registry.frame(frame_name)?;
        let boundaries = frame.boundaries(from_ts, to_ts)?;

        let emitter = PerformanceEmitter::new(
            self.registry.bus().clone(),
            strategy_name,
            exchange_name,
            true,
        );

        let total_start = Instant::now();
        let mut results = Vec::new();

        for t in boundaries {
            let tf_start = Instant::now();
            let result = engine_core::context::with_execution_context(
                engine_core::context::ExecutionContext {
                    symbol: symbol.to_string(),
                    when: t,
                    backtest: true,
                },
                strategy.tick(symbol, t, true),
            )
            .await?;

            emitter.emit(
                MetricType::BacktestTimeframe,
                Some(symbol.to_string()),
                tf_start.elapsed(),
                t,
            );

            let opened = matches!(result, TickResult::Opened { .. });
            results.push(result);

            if opened {
                let signal_start = Instant::now();
                let candles = strategy.fetch_candles(symbol, candle_interval, t, to_ts).await?;
                if !candles.is_empty() {
                    let fast_forward = strategy.backtest(symbol, &candles).await?;
                    results.extend(fast_forward);
                }
                emitter.emit(
                    MetricType::BacktestSignal,
                    Some(symbol.to_string()),
                    signal_start.elapsed(),
                    t,
                );
            }
        }

        emitter.emit(
            MetricType::BacktestTotal,
            Some(symbol.to_string()),
            total_start.elapsed(),
            Utc::now(),
        );

        info!(symbol = %symbol, strategy_name, exchange_name, results = results.len(), "backtest run complete");
        Ok(results)
    }

    /// Runs the backtest loop under a task; any escaped error is normalised
    /// and routed to the `error` subject rather than propagated to the
    /// caller.
    pub fn background(
        self: Arc<Self>,
        symbol: Symbol,
        strategy_name: String,
        exchange_name: String,
        frame_name: String,
        candle_interval: String,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
        bus: EventBus,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let result = self
                .run(&symbol, &strategy_name, &exchange_name, &frame_name, &candle_interval, from_ts, to_ts)
                .await;

            if let Err(e) = result {
                error!(symbol = %symbol, strategy_name = %strategy_name, error = %e, "backtest run failed");
                bus.emit_error(
                    NormalisedError::new(e.to_string())
                        .with_strategy(strategy_name)
                        .with_exchange(exchange_name)
                        .with_symbol(symbol.as_str()),
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use engine_core::registry::{SchemaRegistry, StorageRoots};
    use engine_types::errors::EngineResult as Result_;
    use engine_types::market::Candle;
    use engine_types::schema::{ExchangeClient, ExchangeSchema, FixedStepFrame, FrameSchema, StrategyLogic, StrategySchema, StrategyTickContext};
    use engine_types::signal::{Position, SignalProposal};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    struct ScriptedExchange {
        price: StdMutex<Decimal>,
        candles: Vec<Candle>,
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        async fn get_candles(
            &self,
            _symbol: &Symbol,
            _interval: &str,
            _from_ts: Option<DateTime<Utc>>,
            _to_ts: Option<DateTime<Utc>>,
            _limit: Option<usize>,
        ) -> Result_<Vec<Candle>> {
            Ok(self.candles.clone())
        }

        async fn get_average_price(&self, _symbol: &Symbol) -> Result_<Decimal> {
            Ok(*self.price.lock().unwrap())
        }

        fn format_price(&self, _symbol: &Symbol, price: Decimal) -> Decimal {
            price
        }

        fn format_quantity(&self, _symbol: &Symbol, quantity: Decimal) -> Decimal {
            quantity
        }
    }

    struct OneShotLongStrategy {
        proposal: StdMutex<Option<SignalProposal>>,
    }

    #[async_trait]
    impl StrategyLogic for OneShotLongStrategy {
        async fn get_signal(&self, _ctx: &StrategyTickContext) -> Option<SignalProposal> {
            self.proposal.lock().unwrap().take()
        }
    }

    #[tokio::test]
    async fn backtest_run_opens_and_fast_forwards_to_take_profit() {
        let schemas = SchemaRegistry::new();

        let t0 = Utc::now();
        let candle = Candle::new(t0 + chrono::Duration::minutes(1), dec!(100), dec!(112), dec!(99), dec!(105), dec!(1000));

        schemas.add_exchange(ExchangeSchema::new(
            "binance",
            Arc::new(ScriptedExchange {
                price: StdMutex::new(dec!(100)),
                candles: vec![candle],
            }),
        ));
        schemas.add_strategy(StrategySchema::new(
            "trend",
            StdDuration::from_secs(60),
            Arc::new(OneShotLongStrategy {
                proposal: StdMutex::new(Some(SignalProposal::new(Position::Long, dec!(110), dec!(95), 60))),
            }),
        ));
        schemas.add_frame(FrameSchema::new(
            "1m",
            Arc::new(FixedStepFrame {
                step: chrono::Duration::minutes(1),
            }),
        ));

        let registry = Arc::new(ConnectionRegistry::new(schemas, EventBus::new(), StorageRoots::default(), true));
        let driver = BacktestDriver::new(registry);

        let results = driver
            .run(&Symbol::new("BTCUSDT"), "trend", "binance", "1m", "1m", t0, t0 + chrono::Duration::minutes(1))
            .await
            .unwrap();

        assert!(results.iter().any(|r| matches!(r, TickResult::Opened { .. })));
        assert!(results.iter().any(|r| matches!(r, TickResult::Closed { outcome: engine_types::signal::CloseOutcome::Tp, .. })));
    }
}

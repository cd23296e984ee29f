//! Live execution driver.
//!
//! Grounded on `gb-live::engine::LiveEngine`: construct (recovering from
//! persistence), run a scheduled tick loop, route escaped errors to an event
//! channel via a `background` wrapper rather than crashing the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use engine_core::context::{with_execution_context, ExecutionContext};
use engine_core::events::{EventBus, MetricType, NormalisedError};
use engine_core::registry::ConnectionRegistry;
use engine_types::errors::EngineResult;
use engine_types::market::Symbol;
use tokio::time::interval;
use tracing::{error, info};

use crate::metrics::PerformanceEmitter;

/// Drives `symbol` at `strategy.schema.interval` wall-clock cadence until
/// `stop()` is called. The strategy auto-recovers from persistence on first
/// use of the connection registry.
pub struct LiveDriver {
    registry: Arc<ConnectionRegistry>,
    stopped: Arc<AtomicBool>,
}

impl LiveDriver {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals the run loop to stop after its current tick. Does not
    /// interrupt an in-flight `tick()`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub async fn run(
        &self,
        symbol: &Symbol,
        strategy_name: &str,
        exchange_name: &str,
        tick_interval: std::time::Duration,
    ) -> EngineResult<()> {
        let strategy = self.registry.strategy(strategy_name, exchange_name)?;
        strategy.recover().await?;

        let emitter = PerformanceEmitter::new(
            self.registry.bus().clone(),
            strategy_name,
            exchange_name,
            false,
        );

        let mut ticker = interval(tick_interval);
        while !self.stopped.load(Ordering::SeqCst) {
            ticker.tick().await;
            let when = Utc::now();
            let tick_start = Instant::now();

            with_execution_context(
                ExecutionContext {
                    symbol: symbol.to_string(),
                    when,
                    backtest: false,
                },
                strategy.tick(symbol, when, false),
            )
            .await?;

            emitter.emit(MetricType::LiveTick, Some(symbol.to_string()), tick_start.elapsed(), when);

            if strategy.is_stopped() {
                break;
            }
        }

        info!(symbol = %symbol, strategy_name, exchange_name, "live driver loop exited");
        Ok(())
    }

    /// Runs the live loop under a task; any escaped error is normalised and
    /// routed to the `error` subject without crashing the caller.
    pub fn background(
        self: Arc<Self>,
        symbol: Symbol,
        strategy_name: String,
        exchange_name: String,
        tick_interval: std::time::Duration,
        bus: EventBus,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let result = self.run(&symbol, &strategy_name, &exchange_name, tick_interval).await;

            if let Err(e) = result {
                error!(symbol = %symbol, strategy_name = %strategy_name, error = %e, "live driver run failed");
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
    use chrono::{DateTime, Utc};
    use engine_core::registry::{SchemaRegistry, StorageRoots};
    use engine_types::errors::EngineResult as Result_;
    use engine_types::market::Candle;
    use engine_types::schema::{ExchangeClient, ExchangeSchema, StrategyLogic, StrategySchema, StrategyTickContext};
    use engine_types::signal::SignalProposal;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    struct FixedPriceExchange;

    #[async_trait]
    impl ExchangeClient for FixedPriceExchange {
        async fn get_candles(
            &self,
            _symbol: &Symbol,
            _interval: &str,
            _from_ts: Option<DateTime<Utc>>,
            _to_ts: Option<DateTime<Utc>>,
            _limit: Option<usize>,
        ) -> Result_<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn get_average_price(&self, _symbol: &Symbol) -> Result_<Decimal> {
            Ok(dec!(100))
        }

        fn format_price(&self, _symbol: &Symbol, price: Decimal) -> Decimal {
            price
        }

        fn format_quantity(&self, _symbol: &Symbol, quantity: Decimal) -> Decimal {
            quantity
        }
    }

    struct CountingNullStrategy {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StrategyLogic for CountingNullStrategy {
        async fn get_signal(&self, _ctx: &StrategyTickContext) -> Option<SignalProposal> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[tokio::test]
    async fn stop_halts_the_loop_after_its_current_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let schemas = SchemaRegistry::new();
        schemas.add_exchange(ExchangeSchema::new("binance", Arc::new(FixedPriceExchange)));
        schemas.add_strategy(StrategySchema::new(
            "trend",
            StdDuration::from_millis(5),
            Arc::new(CountingNullStrategy { ticks: ticks.clone() }),
        ));

        let registry = Arc::new(ConnectionRegistry::new(schemas, EventBus::new(), StorageRoots::default(), false));
        let driver = Arc::new(LiveDriver::new(registry));
        let driver_clone = driver.clone();

        let handle = tokio::spawn(async move {
            driver_clone
                .run(&Symbol::new("BTCUSDT"), "trend", "binance", StdDuration::from_millis(5))
                .await
        });

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        driver.stop();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }
}

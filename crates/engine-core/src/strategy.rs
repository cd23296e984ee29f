//! The strategy state machine (`ClientStrategy`): the per-symbol lifecycle
//! `idle → scheduled → opened → active → closed|cancelled`.
//!
//! Generalises `gb_types::strategy::Strategy`'s role as the user-pluggable
//! hook from its push-based `on_market_event` model to the pull-based
//! `getSignal` model this engine's tick-driven design requires; the
//! fast-forward candle walk is grounded on
//! `gb-engine::simulator::MarketSimulator`'s chronological timeline walk,
//! narrowed here to a single active row per symbol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engine_types::errors::{EngineResult, StrategyError};
use engine_types::market::{Candle, Symbol};
use engine_types::schema::{ExchangeSchema, StrategySchema, StrategyTickContext};
use engine_types::signal::{pnl_pct, ActivePosition, CloseOutcome, Position, SignalRow, TickResult};
use tracing::{info, warn};

use crate::events::EventBus;
use crate::persistence::SignalStore;
use crate::risk::ClientRisk;
use crate::sizing::SizingHandle;

/// In-memory per-symbol slot. `Closing` from the spec is transient within a
/// single tick and never observed outside it, so it has no resting variant
/// here.
#[derive(Debug, Clone)]
enum SymbolState {
    Idle,
    Scheduled(SignalRow),
    Active(SignalRow),
}

/// Either a shared risk tracker or the no-op used by strategies without a
/// `riskName`.
pub enum RiskHandle {
    Shared(Arc<ClientRisk>),
    None,
}

impl RiskHandle {
    async fn check_signal(
        &self,
        symbol: &Symbol,
        strategy_name: &str,
        exchange_name: &str,
        current_price: rust_decimal::Decimal,
        bus: &EventBus,
    ) -> bool {
        match self {
            RiskHandle::Shared(risk) => {
                risk.check_signal(symbol, strategy_name, exchange_name, current_price, bus)
                    .await
            }
            RiskHandle::None => true,
        }
    }

    async fn add_signal(&self, position: ActivePosition) -> EngineResult<()> {
        match self {
            RiskHandle::Shared(risk) => risk.add_signal(position).await,
            RiskHandle::None => Ok(()),
        }
    }

    async fn remove_signal(&self, strategy_name: &str, symbol: &Symbol) -> EngineResult<()> {
        match self {
            RiskHandle::Shared(risk) => risk.remove_signal(strategy_name, symbol).await,
            RiskHandle::None => Ok(()),
        }
    }
}

fn minutes_elapsed(since: DateTime<Utc>, when: DateTime<Utc>) -> i64 {
    (when - since).num_milliseconds() / 60_000
}

/// Owns the per-symbol signal table for one `(strategyName, exchangeName)`
/// pair. Transitions are driven only by [`ClientStrategy::tick`] and
/// [`ClientStrategy::backtest`].
pub struct ClientStrategy {
    pub strategy_name: String,
    pub exchange_name: String,
    schema: StrategySchema,
    exchange: ExchangeSchema,
    risk: RiskHandle,
    sizing: SizingHandle,
    signal_store: Option<Arc<SignalStore>>,
    schedule_store: Option<Arc<SignalStore>>,
    bus: EventBus,
    table: tokio::sync::Mutex<HashMap<Symbol, SymbolState>>,
    stopped: AtomicBool,
}

impl ClientStrategy {
    pub fn new(
        schema: StrategySchema,
        exchange: ExchangeSchema,
        risk: RiskHandle,
        sizing: SizingHandle,
        signal_store: Option<Arc<SignalStore>>,
        schedule_store: Option<Arc<SignalStore>>,
        bus: EventBus,
    ) -> Self {
        Self {
            strategy_name: schema.strategy_name.clone(),
            exchange_name: exchange.exchange_name.clone(),
            schema,
            exchange,
            risk,
            sizing,
            signal_store,
            schedule_store,
            bus,
            table: tokio::sync::Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Sizes an order quantity for `price` given the strategy's registered
    /// sizing client and the caller-supplied account equity. Returns `None`
    /// when this strategy has no `sizingName`.
    pub fn size_for(&self, equity: rust_decimal::Decimal, price: rust_decimal::Decimal, params: &serde_json::Value) -> Option<rust_decimal::Decimal> {
        self.sizing.size_for(equity, price, params)
    }

    /// Sets the stop flag; observed on the next `Idle` branch. Does not
    /// interrupt an in-flight `tick()` or the monitoring of `Active` rows.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Reconstitutes `Scheduled` rows from the schedule store and `Active`
    /// rows from the signal store, filtered by `(exchangeName, strategyName)`
    /// — the cross-contamination guard during recovery. Live mode only.
    pub async fn recover(&self) -> EngineResult<()> {
        let mut table = self.table.lock().await;

        if let Some(store) = &self.schedule_store {
            for row in store.list_all(&self.exchange_name, &self.strategy_name).await? {
                table.insert(row.symbol.clone(), SymbolState::Scheduled(row));
            }
        }
        if let Some(store) = &self.signal_store {
            for row in store.list_all(&self.exchange_name, &self.strategy_name).await? {
                info!(symbol = %row.symbol, strategy_name = %self.strategy_name, "recovered active signal");
                table.insert(row.symbol.clone(), SymbolState::Active(row));
            }
        }
        Ok(())
    }

    fn fee_rate(&self) -> rust_decimal::Decimal {
        self.exchange.fee_rate
    }

    /// Drives one state transition for `symbol`, emitting exactly one
    /// [`TickResult`].
    pub async fn tick(&self, symbol: &Symbol, when: DateTime<Utc>, backtest: bool) -> EngineResult<TickResult> {
        let state = {
            let table = self.table.lock().await;
            table.get(symbol).cloned().unwrap_or(SymbolState::Idle)
        };

        let result = match state {
            SymbolState::Idle => self.tick_idle(symbol, when, backtest).await?,
            SymbolState::Scheduled(row) => self.tick_scheduled(row, when, backtest).await?,
            SymbolState::Active(row) => self.tick_active(row, when).await?,
        };

        self.bus.emit_signal(result.clone());
        if backtest {
            self.bus.emit_signal_backtest(result.clone());
        } else {
            self.bus.emit_signal_live(result.clone());
        }

        Ok(result)
    }

    async fn set_state(&self, symbol: &Symbol, state: SymbolState) {
        self.table.lock().await.insert(symbol.clone(), state);
    }

    async fn current_price(&self, symbol: &Symbol) -> EngineResult<rust_decimal::Decimal> {
        self.exchange.client.get_average_price(symbol).await
    }

    /// `true` if `symbol`'s slot is currently `Active` — used by the backtest
    /// driver to decide whether a fast-forward pass is possible right after
    /// an `Opened` result.
    pub async fn is_active(&self, symbol: &Symbol) -> bool {
        matches!(self.table.lock().await.get(symbol), Some(SymbolState::Active(_)))
    }

    /// Fetches candles for `symbol` from this strategy's exchange, covering
    /// `[from_ts, to_ts]`. Used by the backtest driver to pre-fetch the
    /// remaining window for a fast-forward pass.
    pub async fn fetch_candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
    ) -> EngineResult<Vec<Candle>> {
        self.exchange
            .client
            .get_candles(symbol, interval, Some(from_ts), Some(to_ts), None)
            .await
    }

    async fn tick_idle(&self, symbol: &Symbol, when: DateTime<Utc>, backtest: bool) -> EngineResult<TickResult> {
        if self.is_stopped() {
            return Ok(TickResult::Idle {
                symbol: symbol.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                when,
            });
        }

        let price = self.current_price(symbol).await?;
        let ctx = StrategyTickContext {
            symbol: symbol.clone(),
            when,
            backtest,
            current_price: price,
        };

        let proposal = match self.schema.logic.get_signal(&ctx).await {
            Some(proposal) => proposal,
            None => {
                return Ok(TickResult::Idle {
                    symbol: symbol.clone(),
                    strategy_name: self.strategy_name.clone(),
                    exchange_name: self.exchange_name.clone(),
                    when,
                })
            }
        };

        if let Err(e) = proposal.validate() {
            warn!(symbol = %symbol, strategy_name = %self.strategy_name, error = %e, "invalid signal proposal, staying idle");
            return Ok(TickResult::Idle {
                symbol: symbol.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                when,
            });
        }

        let passed = self
            .risk
            .check_signal(symbol, &self.strategy_name, &self.exchange_name, price, &self.bus)
            .await;
        if !passed {
            return Ok(TickResult::Idle {
                symbol: symbol.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                when,
            });
        }

        let open_immediately = match proposal.price_open {
            None => true,
            Some(target) => target == price,
        };

        if open_immediately {
            let row = SignalRow {
                id: uuid::Uuid::new_v4(),
                symbol: symbol.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                position: proposal.position,
                price_open: proposal.price_open.unwrap_or(price),
                price_take_profit: proposal.price_take_profit,
                price_stop_loss: proposal.price_stop_loss,
                minute_estimated_time: proposal.minute_estimated_time,
                scheduled_at: when,
                pending_at: Some(when),
                is_scheduled: false,
            };

            if let Some(store) = &self.signal_store {
                store.write(&row).await?;
            }
            self.risk
                .add_signal(ActivePosition {
                    signal: row.clone(),
                    strategy_name: self.strategy_name.clone(),
                    exchange_name: self.exchange_name.clone(),
                    open_timestamp: when,
                })
                .await?;

            self.set_state(symbol, SymbolState::Active(row.clone())).await;

            Ok(TickResult::Opened {
                symbol: symbol.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                when,
                signal_id: row.id,
                price_open: row.price_open,
            })
        } else {
            let row = SignalRow {
                id: uuid::Uuid::new_v4(),
                symbol: symbol.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                position: proposal.position,
                price_open: proposal.price_open.expect("checked above"),
                price_take_profit: proposal.price_take_profit,
                price_stop_loss: proposal.price_stop_loss,
                minute_estimated_time: proposal.minute_estimated_time,
                scheduled_at: when,
                pending_at: None,
                is_scheduled: true,
            };

            if let Some(store) = &self.schedule_store {
                store.write(&row).await?;
            }
            self.set_state(symbol, SymbolState::Scheduled(row.clone())).await;

            Ok(TickResult::Scheduled {
                symbol: symbol.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                when,
                signal_id: row.id,
                price_open: row.price_open,
            })
        }
    }

    async fn tick_scheduled(&self, row: SignalRow, when: DateTime<Utc>, _backtest: bool) -> EngineResult<TickResult> {
        let price = self.current_price(&row.symbol).await?;

        let touched = match row.position {
            Position::Long => price <= row.price_open,
            Position::Short => price >= row.price_open,
        };
        let aged = minutes_elapsed(row.scheduled_at, when) >= row.minute_estimated_time as i64;

        if !touched && !aged {
            self.set_state(&row.symbol, SymbolState::Scheduled(row.clone())).await;
            return Ok(TickResult::Scheduled {
                symbol: row.symbol,
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                when,
                signal_id: row.id,
                price_open: row.price_open,
            });
        }

        let passed = self
            .risk
            .check_signal(&row.symbol, &self.strategy_name, &self.exchange_name, price, &self.bus)
            .await;

        if !passed {
            if let Some(store) = &self.schedule_store {
                store
                    .delete(&self.exchange_name, row.symbol.as_str(), &self.strategy_name)
                    .await?;
            }
            self.set_state(&row.symbol, SymbolState::Idle).await;
            return Ok(TickResult::Cancelled {
                symbol: row.symbol,
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                when,
                signal_id: row.id,
                reason: "risk".to_string(),
            });
        }

        // Schedule deletion must happen before the signal write, otherwise a
        // crash between the two leaves two files for the same key.
        if let Some(store) = &self.schedule_store {
            store
                .delete(&self.exchange_name, row.symbol.as_str(), &self.strategy_name)
                .await?;
        }

        let mut activated = row.clone();
        activated.pending_at = Some(when);
        activated.is_scheduled = false;

        if let Some(store) = &self.signal_store {
            store.write(&activated).await?;
        }
        self.risk
            .add_signal(ActivePosition {
                signal: activated.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                open_timestamp: when,
            })
            .await?;

        self.set_state(&activated.symbol, SymbolState::Active(activated.clone())).await;

        Ok(TickResult::Opened {
            symbol: activated.symbol,
            strategy_name: self.strategy_name.clone(),
            exchange_name: self.exchange_name.clone(),
            when,
            signal_id: activated.id,
            price_open: activated.price_open,
        })
    }

    async fn tick_active(&self, row: SignalRow, when: DateTime<Utc>) -> EngineResult<TickResult> {
        let price = self.current_price(&row.symbol).await?;
        let pending_at = row.pending_at.unwrap_or(row.scheduled_at);

        let tp_hit = match row.position {
            Position::Long => price >= row.price_take_profit,
            Position::Short => price <= row.price_take_profit,
        };
        let sl_hit = match row.position {
            Position::Long => price <= row.price_stop_loss,
            Position::Short => price >= row.price_stop_loss,
        };
        let aged = minutes_elapsed(pending_at, when) >= row.minute_estimated_time as i64;

        let outcome = if tp_hit {
            Some(CloseOutcome::Tp)
        } else if sl_hit {
            Some(CloseOutcome::Sl)
        } else if aged {
            Some(CloseOutcome::Timeout)
        } else {
            None
        };

        match outcome {
            Some(outcome) => self.close_active(row, price, when, outcome).await,
            None => {
                let pnl = pnl_pct(row.position, row.price_open, price, self.fee_rate());
                self.set_state(&row.symbol, SymbolState::Active(row.clone())).await;
                Ok(TickResult::Active {
                    symbol: row.symbol,
                    strategy_name: self.strategy_name.clone(),
                    exchange_name: self.exchange_name.clone(),
                    when,
                    signal_id: row.id,
                    unrealized_pnl_pct: pnl,
                })
            }
        }
    }

    async fn close_active(
        &self,
        row: SignalRow,
        exit_price: rust_decimal::Decimal,
        when: DateTime<Utc>,
        outcome: CloseOutcome,
    ) -> EngineResult<TickResult> {
        if let Some(store) = &self.signal_store {
            store
                .delete(&self.exchange_name, row.symbol.as_str(), &self.strategy_name)
                .await?;
        }
        self.risk.remove_signal(&self.strategy_name, &row.symbol).await?;

        let pnl = pnl_pct(row.position, row.price_open, exit_price, self.fee_rate());
        self.set_state(&row.symbol, SymbolState::Idle).await;

        Ok(TickResult::Closed {
            symbol: row.symbol,
            strategy_name: self.strategy_name.clone(),
            exchange_name: self.exchange_name.clone(),
            when,
            signal_id: row.id,
            price_open: row.price_open,
            price_close: exit_price,
            pnl_pct: pnl,
            outcome,
        })
    }

    /// Fast-forwards an `Active` row through `candles` in order, detecting
    /// the first TP/SL/timeout condition from each candle's high/low extremes
    /// rather than replaying a tick per candle. Returns the sequence of
    /// intermediate `active` results followed by a terminal `closed` result,
    /// or only intermediate results if no terminal condition is reached
    /// before `candles` is exhausted.
    pub async fn backtest(&self, symbol: &Symbol, candles: &[Candle]) -> EngineResult<Vec<TickResult>> {
        let row = {
            let table = self.table.lock().await;
            match table.get(symbol) {
                Some(SymbolState::Active(row)) => row.clone(),
                Some(_) | None => {
                    return Err(StrategyError::UnexpectedState {
                        symbol: symbol.to_string(),
                        expected: "active".to_string(),
                        actual: "not active".to_string(),
                    }
                    .into())
                }
            }
        };

        let pending_at = row.pending_at.unwrap_or(row.scheduled_at);
        let mut results = Vec::new();

        for candle in candles {
            let tp_hit = match row.position {
                Position::Long => candle.high >= row.price_take_profit,
                Position::Short => candle.low <= row.price_take_profit,
            };
            let sl_hit = match row.position {
                Position::Long => candle.low <= row.price_stop_loss,
                Position::Short => candle.high >= row.price_stop_loss,
            };

            // Same-candle collision: stop-loss wins, both directions
            // (conservative default, per Testable Property 8).
            let outcome = if sl_hit {
                Some((CloseOutcome::Sl, row.price_stop_loss))
            } else if tp_hit {
                Some((CloseOutcome::Tp, row.price_take_profit))
            } else {
                None
            };

            if let Some((outcome, exit_price)) = outcome {
                let result = self.close_active(row.clone(), exit_price, candle.open_time, outcome).await?;
                results.push(result);
                return Ok(results);
            }

            let aged = minutes_elapsed(pending_at, candle.open_time) >= row.minute_estimated_time as i64;
            if aged {
                let result = self
                    .close_active(row.clone(), candle.open, candle.open_time, CloseOutcome::Timeout)
                    .await?;
                results.push(result);
                return Ok(results);
            }

            let pnl = pnl_pct(row.position, row.price_open, candle.close, self.fee_rate());
            results.push(TickResult::Active {
                symbol: row.symbol.clone(),
                strategy_name: self.strategy_name.clone(),
                exchange_name: self.exchange_name.clone(),
                when: candle.open_time,
                signal_id: row.id,
                unrealized_pnl_pct: pnl,
            });
        }

        self.set_state(symbol, SymbolState::Active(row)).await;
        Ok(results)
    }
}

//! Connection registry: memoised, once-only construction of a client per
//! name, for each of `{Strategy, Exchange, Frame, Risk, Sizing}`.
//!
//! Grounded on `gb-data::cache::CacheManager`'s `DashMap`-backed concurrent
//! keyed store, generalised here from a single cache kind to five distinct
//! client kinds, each keyed purely by name.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use engine_types::errors::{EngineResult, RegistryError};
use engine_types::schema::{ExchangeSchema, FrameSchema, RiskSchema, SizingSchema, StrategySchema};

use crate::events::EventBus;
use crate::persistence::SignalStore;
use crate::risk::ClientRisk;
use crate::sizing::{ClientSizing, SizingHandle};
use crate::strategy::{ClientStrategy, RiskHandle};

/// Where the registry's `FilesystemBackend`-rooted stores live on disk.
#[derive(Debug, Clone)]
pub struct StorageRoots {
    pub persist_root: PathBuf,
    pub schedule_root: PathBuf,
    pub risk_root: PathBuf,
}

impl Default for StorageRoots {
    fn default() -> Self {
        Self {
            persist_root: PathBuf::from("./dump/persist"),
            schedule_root: PathBuf::from("./dump/schedule"),
            risk_root: PathBuf::from("./dump/risk"),
        }
    }
}

/// Central schema registry: `addStrategy`/`addExchange`/`addFrame`/
/// `addRisk`/`addSizing`. Schemas are validated synchronously at
/// registration; the last registration for a name wins before any client is
/// first constructed. Not idempotent by design (per spec §6).
#[derive(Default)]
pub struct SchemaRegistry {
    strategies: DashMap<String, StrategySchema>,
    exchanges: DashMap<String, ExchangeSchema>,
    frames: DashMap<String, FrameSchema>,
    risks: DashMap<String, RiskSchema>,
    sizings: DashMap<String, SizingSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_strategy(&self, schema: StrategySchema) {
        self.strategies.insert(schema.strategy_name.clone(), schema);
    }

    pub fn add_exchange(&self, schema: ExchangeSchema) {
        self.exchanges.insert(schema.exchange_name.clone(), schema);
    }

    pub fn add_frame(&self, schema: FrameSchema) {
        self.frames.insert(schema.frame_name.clone(), schema);
    }

    pub fn add_risk(&self, schema: RiskSchema) {
        self.risks.insert(schema.risk_name.clone(), schema);
    }

    pub fn add_sizing(&self, schema: SizingSchema) {
        self.sizings.insert(schema.sizing_name.clone(), schema);
    }

    fn strategy(&self, name: &str) -> EngineResult<StrategySchema> {
        self.strategies
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| RegistryError::UnknownSchema {
                kind: "strategy",
                name: name.to_string(),
            }
            .into())
    }

    fn exchange(&self, name: &str) -> EngineResult<ExchangeSchema> {
        self.exchanges
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| RegistryError::UnknownSchema {
                kind: "exchange",
                name: name.to_string(),
            }
            .into())
    }

    fn frame(&self, name: &str) -> EngineResult<FrameSchema> {
        self.frames
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| RegistryError::UnknownSchema {
                kind: "frame",
                name: name.to_string(),
            }
            .into())
    }

    fn risk(&self, name: &str) -> EngineResult<RiskSchema> {
        self.risks
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| RegistryError::UnknownSchema {
                kind: "risk",
                name: name.to_string(),
            }
            .into())
    }

    fn sizing(&self, name: &str) -> EngineResult<SizingSchema> {
        self.sizings
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| RegistryError::UnknownSchema {
                kind: "sizing",
                name: name.to_string(),
            }
            .into())
    }
}

/// Memoised, once-only-constructed clients for every registered name, plus
/// the event bus and storage roots shared across all of them.
pub struct ConnectionRegistry {
    schemas: SchemaRegistry,
    bus: EventBus,
    storage: StorageRoots,
    backtest: bool,
    strategies: DashMap<String, Arc<ClientStrategy>>,
    risks: DashMap<String, Arc<ClientRisk>>,
    sizings: DashMap<String, Arc<ClientSizing>>,
}

impl ConnectionRegistry {
    pub fn new(schemas: SchemaRegistry, bus: EventBus, storage: StorageRoots, backtest: bool) -> Self {
        Self {
            schemas,
            bus,
            storage,
            backtest,
            strategies: DashMap::new(),
            risks: DashMap::new(),
            sizings: DashMap::new(),
        }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Returns the shared risk tracker for `risk_name`, constructing it once.
    pub fn risk(&self, risk_name: &str) -> EngineResult<Arc<ClientRisk>> {
        if let Some(existing) = self.risks.get(risk_name) {
            return Ok(existing.clone());
        }

        let schema = self.schemas.risk(risk_name)?;
        let backend = if self.backtest {
            None
        } else {
            Some(crate::persistence::FilesystemBackend::new(self.storage.risk_root.clone()))
        };
        let risk = Arc::new(ClientRisk::new(
            schema.risk_name.clone(),
            schema.validations.clone(),
            backend,
            self.backtest,
        ));

        self.risks.entry(risk_name.to_string()).or_insert_with(|| risk.clone());
        Ok(self.risks.get(risk_name).unwrap().clone())
    }

    /// Returns the shared sizing client for `sizing_name`, constructing it
    /// once. Stateless, so construction is cheap, but still memoised: a
    /// sizing client is owned by the registry for process lifetime like every
    /// other client kind.
    pub fn sizing(&self, sizing_name: &str) -> EngineResult<Arc<ClientSizing>> {
        if let Some(existing) = self.sizings.get(sizing_name) {
            return Ok(existing.clone());
        }

        let schema = self.schemas.sizing(sizing_name)?;
        let sizing = Arc::new(ClientSizing::new(schema));

        self.sizings.entry(sizing_name.to_string()).or_insert_with(|| sizing.clone());
        Ok(self.sizings.get(sizing_name).unwrap().clone())
    }

    /// Returns the strategy client for `strategy_name`, constructing it once.
    /// A strategy with no `riskName` receives a no-op risk; a strategy with
    /// no `sizingName` receives a no-op sizing handle.
    pub fn strategy(&self, strategy_name: &str, exchange_name: &str) -> EngineResult<Arc<ClientStrategy>> {
        if let Some(existing) = self.strategies.get(strategy_name) {
            return Ok(existing.clone());
        }

        let strategy_schema = self.schemas.strategy(strategy_name)?;
        let exchange_schema = self.schemas.exchange(exchange_name)?;

        let risk_handle = match &strategy_schema.risk_name {
            Some(risk_name) => RiskHandle::Shared(self.risk(risk_name)?),
            None => RiskHandle::None,
        };
        let sizing_handle = match &strategy_schema.sizing_name {
            Some(sizing_name) => SizingHandle::Shared(self.sizing(sizing_name)?),
            None => SizingHandle::None,
        };

        let (signal_store, schedule_store) = if self.backtest {
            (None, None)
        } else {
            (
                Some(Arc::new(SignalStore::persist(self.storage.persist_root.clone()))),
                Some(Arc::new(SignalStore::schedule(self.storage.schedule_root.clone()))),
            )
        };

        let client = Arc::new(ClientStrategy::new(
            strategy_schema,
            exchange_schema,
            risk_handle,
            sizing_handle,
            signal_store,
            schedule_store,
            self.bus.clone(),
        ));

        self.strategies
            .entry(strategy_name.to_string())
            .or_insert_with(|| client.clone());
        Ok(self.strategies.get(strategy_name).unwrap().clone())
    }

    /// Looks up a registered exchange's schema. The schema itself holds the
    /// client's one shared `Arc<dyn ExchangeClient>`, so every lookup for the
    /// same `exchange_name` already resolves to the same underlying client;
    /// this accessor just makes that reachable directly rather than only
    /// indirectly through [`ConnectionRegistry::strategy`].
    pub fn exchange(&self, exchange_name: &str) -> EngineResult<ExchangeSchema> {
        self.schemas.exchange(exchange_name)
    }

    /// Looks up a registered frame's boundary generator.
    pub fn frame(&self, frame_name: &str) -> EngineResult<FrameSchema> {
        self.schemas.frame(frame_name)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use engine_types::errors::EngineResult as Result_;
    use engine_types::market::{Candle, Symbol};
    use engine_types::schema::{ExchangeClient, StrategyLogic, StrategyTickContext};
    use engine_types::signal::SignalProposal;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct NullExchange;

    #[async_trait]
    impl ExchangeClient for NullExchange {
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

    struct NullStrategy;

    #[async_trait]
    impl StrategyLogic for NullStrategy {
        async fn get_signal(&self, _ctx: &StrategyTickContext) -> Option<SignalProposal> {
            None
        }
    }

    fn registry() -> ConnectionRegistry {
        let schemas = SchemaRegistry::new();
        schemas.add_exchange(ExchangeSchema::new("binance", Arc::new(NullExchange)));
        schemas.add_strategy(StrategySchema::new("trend", Duration::from_secs(60), Arc::new(NullStrategy)));
        ConnectionRegistry::new(schemas, EventBus::new(), StorageRoots::default(), true)
    }

    #[test]
    fn unknown_strategy_is_a_registry_error() {
        let registry = registry();
        let result = registry.strategy("missing", "binance");
        assert!(result.is_err());
    }

    #[test]
    fn strategy_is_constructed_once_per_name() {
        let registry = registry();
        let first = registry.strategy("trend", "binance").unwrap();
        let second = registry.strategy("trend", "binance").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn strategy_without_risk_name_gets_no_op_risk() {
        let registry = registry();
        let client = registry.strategy("trend", "binance").unwrap();
        assert_eq!(client.strategy_name, "trend");
    }

    struct HalfEquitySizer;

    impl engine_types::schema::SizingLogic for HalfEquitySizer {
        fn size_for(&self, equity: Decimal, price: Decimal, _params: &serde_json::Value) -> Decimal {
            (equity * dec!(0.5)) / price
        }
    }

    #[test]
    fn exchange_accessor_reaches_a_registered_schema_directly() {
        let registry = registry();
        let schema = registry.exchange("binance").unwrap();
        assert_eq!(schema.exchange_name, "binance");
    }

    #[test]
    fn unknown_exchange_is_a_registry_error() {
        let registry = registry();
        assert!(registry.exchange("missing").is_err());
    }

    #[test]
    fn unknown_sizing_is_a_registry_error() {
        let registry = registry();
        assert!(registry.sizing("missing").is_err());
    }

    #[test]
    fn sizing_is_constructed_once_per_name() {
        let registry = registry();
        registry
            .schemas()
            .add_sizing(engine_types::schema::SizingSchema::new("half_equity", Arc::new(HalfEquitySizer)));

        let first = registry.sizing("half_equity").unwrap();
        let second = registry.sizing("half_equity").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn strategy_with_sizing_name_gets_shared_sizing_client() {
        let schemas = SchemaRegistry::new();
        schemas.add_exchange(ExchangeSchema::new("binance", Arc::new(NullExchange)));
        schemas.add_sizing(engine_types::schema::SizingSchema::new("half_equity", Arc::new(HalfEquitySizer)));
        schemas.add_strategy(
            StrategySchema::new("trend", Duration::from_secs(60), Arc::new(NullStrategy)).with_sizing("half_equity"),
        );
        let registry = ConnectionRegistry::new(schemas, EventBus::new(), StorageRoots::default(), true);

        let client = registry.strategy("trend", "binance").unwrap();
        let quantity = client.size_for(dec!(10000), dec!(100), &serde_json::Value::Null);
        assert_eq!(quantity, Some(dec!(50)));
    }
}

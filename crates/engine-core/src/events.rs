//! Typed pub-sub subjects feeding reporting, performance metrics, and error
//! channels.
//!
//! Each subject is served by a dedicated FIFO worker task so that a slow
//! subscriber on one subject never delays another subject's delivery, while
//! still guaranteeing in-order delivery for subscribers on the same subject.
//! There is no replay: a subscription only sees events emitted after it is
//! registered. Observers are asynchronous; each invocation runs in its own
//! `tokio::spawn`'d task so a panicking observer cannot take its subject's
//! worker down, and any panic or returned `Err` is routed to the `error`
//! subject rather than propagated to the producer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engine_types::signal::TickResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Metric kinds emitted on the `performance` subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    BacktestTotal,
    BacktestTimeframe,
    BacktestSignal,
    LiveTick,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEvent {
    pub timestamp: DateTime<Utc>,
    pub previous_timestamp: Option<DateTime<Utc>>,
    pub metric_type: MetricType,
    pub duration: std::time::Duration,
    pub strategy_name: String,
    pub exchange_name: String,
    pub symbol: Option<String>,
    pub backtest: bool,
}

/// Normalised error payload shared by the `error` and `validation` subjects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalisedError {
    pub message: String,
    pub strategy_name: Option<String>,
    pub exchange_name: Option<String>,
    pub symbol: Option<String>,
    pub at: DateTime<Utc>,
}

impl NormalisedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            strategy_name: None,
            exchange_name: None,
            symbol: None,
            at: Utc::now(),
        }
    }

    pub fn with_strategy(mut self, strategy_name: impl Into<String>) -> Self {
        self.strategy_name = Some(strategy_name.into());
        self
    }

    pub fn with_exchange(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange_name.into());
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

/// One event per subject, as listed in the event bus's subject table.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Signal(TickResult),
    SignalBacktest(TickResult),
    SignalLive(TickResult),
    Performance(PerformanceEvent),
    Error(NormalisedError),
    Validation(NormalisedError),
}

type ObserverFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type Observer = Arc<dyn Fn(EngineEvent) -> ObserverFuture + Send + Sync>;

/// A single subject: a FIFO queue feeding a dedicated worker task that awaits
/// every registered observer, in emission order, inside its own spawned task.
struct Subject {
    sender: mpsc::UnboundedSender<EngineEvent>,
    observers: Arc<Mutex<Vec<(u64, Observer)>>>,
    next_id: Mutex<u64>,
}

impl Subject {
    /// Ordinary subject: observer failures are routed to `error_sender`.
    fn new(error_sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<EngineEvent>();
        Self::spawn_worker(sender, receiver, error_sender)
    }

    /// The `error` subject itself: its own observer failures loop back onto
    /// its own channel rather than needing a distinct sink.
    fn new_root() -> (Self, mpsc::UnboundedSender<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel::<EngineEvent>();
        let error_sender = sender.clone();
        (Self::spawn_worker(sender, receiver, error_sender.clone()), error_sender)
    }

    fn spawn_worker(
        sender: mpsc::UnboundedSender<EngineEvent>,
        mut receiver: mpsc::UnboundedReceiver<EngineEvent>,
        error_sender: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let observers: Arc<Mutex<Vec<(u64, Observer)>>> = Arc::new(Mutex::new(Vec::new()));

        let worker_observers = observers.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let snapshot: Vec<(u64, Observer)> = worker_observers.lock().clone();
                for (_, observer) in snapshot {
                    let call = observer(event.clone());
                    match tokio::spawn(call).await {
                        Ok(Ok(())) => {}
                        Ok(Err(message)) => {
                            warn!(%message, "observer returned an error, routing to error subject");
                            let _ = error_sender.send(EngineEvent::Error(NormalisedError::new(message)));
                        }
                        Err(join_error) => {
                            warn!(%join_error, "observer panicked, routing to error subject");
                            let _ = error_sender.send(EngineEvent::Error(NormalisedError::new(format!(
                                "observer panicked: {join_error}"
                            ))));
                        }
                    }
                }
            }
        });

        Self {
            sender,
            observers,
            next_id: Mutex::new(0),
        }
    }

    fn emit(&self, event: EngineEvent) {
        // An unbounded channel never blocks the producer; a closed receiver
        // (worker task gone) is silently dropped rather than propagated.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self, observer: Observer) -> u64 {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.observers.lock().push((id, observer));
        id
    }

    fn unsubscribe(&self, id: u64) {
        self.observers.lock().retain(|(oid, _)| *oid != id);
    }
}

/// Handle returned by every `listen*` call; dropping it does not unsubscribe,
/// call [`Unsubscribe::unsubscribe`] (or let the bus outlive it) explicitly,
/// matching the spec's explicit unsubscribe-handle model rather than
/// drop-based RAII.
pub struct Unsubscribe {
    bus: Arc<EventBusInner>,
    subject: SubjectKind,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.bus.subject(self.subject).unsubscribe(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SubjectKind {
    Signal,
    SignalBacktest,
    SignalLive,
    Performance,
    Error,
    Validation,
}

struct EventBusInner {
    signal: Subject,
    signal_backtest: Subject,
    signal_live: Subject,
    performance: Subject,
    error: Subject,
    validation: Subject,
}

impl EventBusInner {
    fn subject(&self, kind: SubjectKind) -> &Subject {
        match kind {
            SubjectKind::Signal => &self.signal,
            SubjectKind::SignalBacktest => &self.signal_backtest,
            SubjectKind::SignalLive => &self.signal_live,
            SubjectKind::Performance => &self.performance,
            SubjectKind::Error => &self.error,
            SubjectKind::Validation => &self.validation,
        }
    }
}

/// The engine's event bus: one FIFO-serialised subject per event kind.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (error, error_sender) = Subject::new_root();
        Self {
            inner: Arc::new(EventBusInner {
                signal: Subject::new(error_sender.clone()),
                signal_backtest: Subject::new(error_sender.clone()),
                signal_live: Subject::new(error_sender.clone()),
                performance: Subject::new(error_sender.clone()),
                error,
                validation: Subject::new(error_sender),
            }),
        }
    }

    pub fn emit_signal(&self, result: TickResult) {
        self.inner.signal.emit(EngineEvent::Signal(result));
    }

    pub fn emit_signal_backtest(&self, result: TickResult) {
        self.inner
            .signal_backtest
            .emit(EngineEvent::SignalBacktest(result));
    }

    pub fn emit_signal_live(&self, result: TickResult) {
        self.inner.signal_live.emit(EngineEvent::SignalLive(result));
    }

    pub fn emit_performance(&self, event: PerformanceEvent) {
        self.inner.performance.emit(EngineEvent::Performance(event));
    }

    /// Emits to `error`. Never fails; an emission failure here would have
    /// nowhere left to go, so it is logged instead.
    pub fn emit_error(&self, error: NormalisedError) {
        let rendered = error.message.clone();
        self.inner.error.emit(EngineEvent::Error(error));
        tracing::debug!(message = %rendered, "error event emitted");
    }

    pub fn emit_validation(&self, error: NormalisedError) {
        self.inner.validation.emit(EngineEvent::Validation(error));
    }

    pub fn listen_signal<F, Fut>(&self, observer: F) -> Unsubscribe
    where
        F: Fn(TickResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let observer = Arc::new(observer);
        self.listen_kind(SubjectKind::Signal, move |event| {
            let observer = observer.clone();
            Box::pin(async move {
                match event {
                    EngineEvent::Signal(result) => observer(result).await,
                    _ => Ok(()),
                }
            }) as ObserverFuture
        })
    }

    pub fn listen_signal_backtest<F, Fut>(&self, observer: F) -> Unsubscribe
    where
        F: Fn(TickResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let observer = Arc::new(observer);
        self.listen_kind(SubjectKind::SignalBacktest, move |event| {
            let observer = observer.clone();
            Box::pin(async move {
                match event {
                    EngineEvent::SignalBacktest(result) => observer(result).await,
                    _ => Ok(()),
                }
            }) as ObserverFuture
        })
    }

    pub fn listen_signal_live<F, Fut>(&self, observer: F) -> Unsubscribe
    where
        F: Fn(TickResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let observer = Arc::new(observer);
        self.listen_kind(SubjectKind::SignalLive, move |event| {
            let observer = observer.clone();
            Box::pin(async move {
                match event {
                    EngineEvent::SignalLive(result) => observer(result).await,
                    _ => Ok(()),
                }
            }) as ObserverFuture
        })
    }

    pub fn listen_performance<F, Fut>(&self, observer: F) -> Unsubscribe
    where
        F: Fn(PerformanceEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let observer = Arc::new(observer);
        self.listen_kind(SubjectKind::Performance, move |event| {
            let observer = observer.clone();
            Box::pin(async move {
                match event {
                    EngineEvent::Performance(perf) => observer(perf).await,
                    _ => Ok(()),
                }
            }) as ObserverFuture
        })
    }

    pub fn listen_error<F, Fut>(&self, observer: F) -> Unsubscribe
    where
        F: Fn(NormalisedError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let observer = Arc::new(observer);
        self.listen_kind(SubjectKind::Error, move |event| {
            let observer = observer.clone();
            Box::pin(async move {
                match event {
                    EngineEvent::Error(err) => observer(err).await,
                    _ => Ok(()),
                }
            }) as ObserverFuture
        })
    }

    pub fn listen_validation<F, Fut>(&self, observer: F) -> Unsubscribe
    where
        F: Fn(NormalisedError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let observer = Arc::new(observer);
        self.listen_kind(SubjectKind::Validation, move |event| {
            let observer = observer.clone();
            Box::pin(async move {
                match event {
                    EngineEvent::Validation(err) => observer(err).await,
                    _ => Ok(()),
                }
            }) as ObserverFuture
        })
    }

    fn listen_kind<F>(&self, kind: SubjectKind, observer: F) -> Unsubscribe
    where
        F: Fn(EngineEvent) -> ObserverFuture + Send + Sync + 'static,
    {
        let id = self.inner.subject(kind).subscribe(Arc::new(observer));
        Unsubscribe {
            bus: self.inner.clone(),
            subject: kind,
            id,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

use thiserror::Error;

/// Top-level error type for the signal lifecycle engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),

    #[error("risk error: {0}")]
    Risk(#[from] RiskError),

    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from the method/execution context registers.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("no method context is set for the current task")]
    MethodContextMissing,

    #[error("no execution context is set for the current task")]
    ExecutionContextMissing,
}

/// Errors from persistence adapters.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("persisted data at {path} is corrupt and will be treated as missing: {message}")]
    Corrupt { path: String, message: String },

    #[error("namespace {namespace} could not be created: {message}")]
    NamespaceFailed { namespace: String, message: String },

    #[error("atomic write to {path} failed: {message}")]
    WriteFailed { path: String, message: String },
}

/// Errors surfaced by the risk tracker.
#[derive(Error, Debug)]
pub enum RiskError {
    #[error("validation '{note}' rejected signal for {composite_key}: {message}")]
    ValidationFailed {
        composite_key: String,
        note: String,
        message: String,
    },

    #[error("risk snapshot load failed, starting from an empty map: {message}")]
    LoadFailed { message: String },
}

/// Errors from the strategy state machine.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("invalid signal proposal: {message}")]
    InvalidProposal { message: String },

    #[error("symbol {symbol} is not in state {expected}, found {actual}")]
    UnexpectedState {
        symbol: String,
        expected: String,
        actual: String,
    },

    #[error("strategy execution error: {message}")]
    ExecutionError { message: String },
}

/// Errors from the exchange client contract.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("failed to fetch candles for {symbol}: {message}")]
    CandleFetchFailed { symbol: String, message: String },

    #[error("failed to fetch average price for {symbol}: {message}")]
    PriceFetchFailed { symbol: String, message: String },
}

/// Errors from the frame client.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame '{frame_name}' produced no boundaries")]
    Empty { frame_name: String },
}

/// Errors from schema registration and the connection registry.
///
/// Schema errors are raised synchronously at registration and are never
/// caught internally (per the engine's error-handling policy).
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown schema: no {kind} registered under name '{name}'")]
    UnknownSchema { kind: &'static str, name: String },

    #[error("invalid {kind} schema '{name}': {message}")]
    InvalidSchema {
        kind: &'static str,
        name: String,
        message: String,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Helper trait for converting string errors, mirroring the teacher's
/// `IntoGbError` convenience impl for ad-hoc string-based failures.
pub trait IntoEngineError {
    fn into_engine_error(self) -> EngineError;
}

impl IntoEngineError for String {
    fn into_engine_error(self) -> EngineError {
        EngineError::Internal(self)
    }
}

impl IntoEngineError for &str {
    fn into_engine_error(self) -> EngineError {
        EngineError::Internal(self.to_string())
    }
}

#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::EngineError::Internal(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::EngineError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_conversion() {
        let store_error = StoreError::Corrupt {
            path: "dump/persist/x.json".into(),
            message: "unexpected end of input".into(),
        };
        let engine_error: EngineError = store_error.into();
        match engine_error {
            EngineError::Store(_) => (),
            _ => panic!("expected Store error"),
        }
    }

    #[test]
    fn display_includes_key_details() {
        let error = RiskError::ValidationFailed {
            composite_key: "strategyA:BTCUSDT".into(),
            note: "max_positions".into(),
            message: "max 1 position allowed".into(),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("strategyA:BTCUSDT"));
        assert!(rendered.contains("max_positions"));
    }

    #[test]
    fn macros_construct_expected_variants() {
        let err = internal_error!("bad state: {}", 42);
        assert!(matches!(err, EngineError::Internal(_)));
        let err = config_error!("missing {}", "dump_root");
        assert!(matches!(err, EngineError::Config(_)));
    }
}

pub mod backtest;
pub mod live;
pub mod metrics;

pub use backtest::*;
pub use live::*;
pub use metrics::*;

pub mod config;
pub mod context;
pub mod events;
pub mod persistence;
pub mod registry;
pub mod risk;
pub mod sizing;
pub mod strategy;

pub use config::*;
pub use context::*;
pub use events::*;
pub use persistence::*;
pub use registry::*;
pub use risk::*;
pub use sizing::*;
pub use strategy::*;

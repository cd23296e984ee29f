pub mod errors;
pub mod market;
pub mod schema;
pub mod signal;

pub use errors::*;
pub use market::*;
pub use schema::*;
pub use signal::*;

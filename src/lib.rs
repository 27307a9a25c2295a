pub mod accounts;
pub mod agent;
pub mod codec;
pub mod comms;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod pay;
pub mod security;
pub mod utils;

pub use error::{GateError, GateResult};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod chain;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod types;
pub mod units;
pub mod wallet;

pub use error::{Error, Result};

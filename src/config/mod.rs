//! Configuration loading and management.
//!
//! - [`types`]: config struct definitions (Config, TimersConfig, TransferConfig, AccountBlock)
//! - [`validation`]: startup checks collecting every problem found

mod types;
pub mod validation;

pub use types::{
    AccountBlock, Config, ConfigError, LogConfig, LogFormat, TimersConfig, TransferConfig,
};
pub use validation::{ValidationError, validate};

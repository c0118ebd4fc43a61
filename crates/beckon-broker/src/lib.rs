//! Broker assembly: configuration loading and the run lifecycle that
//! ties the registries and listeners together.

pub mod broker;
pub mod config;

pub use broker::{Broker, BrokerError, BrokerHandle};
pub use config::{BrokerConfig, ConfigError};

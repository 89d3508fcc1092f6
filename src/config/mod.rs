//! Configuration management for DuraMQ

pub mod settings;

pub use settings::{BrokerConfig, ClientConfig, ServerSettings, StorageSettings};

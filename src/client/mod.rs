//! DuraMQ client implementation

pub mod broker_client;

pub use broker_client::BrokerClient;

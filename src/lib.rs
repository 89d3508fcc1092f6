//! # DuraMQ - Durable Networked Message Queues
//!
//! DuraMQ is a small message broker: clients enqueue payloads onto named
//! destinations and later dequeue them. Every queue is backed by an
//! append-only log plus a checkpoint file, so pending messages survive a
//! broker restart.
//!
//! ## Features
//!
//! - **Durable Queues**: append-only logs with checkpoint-based replay
//! - **Lazy Destinations**: queues are created on the first send
//! - **Concurrent Sessions**: one async task per connection, one lock per queue
//! - **Simple Protocol**: length-prefixed JSON request/reply frames over TCP
//!
//! ## Quick Start
//!
//! ### Server
//! ```no_run
//! use duramq::config::BrokerConfig;
//! use duramq::server::Broker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::from_file("config/broker.toml")?;
//!     let broker = Broker::new(config)?;
//!     broker.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     broker.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Client
//! ```no_run
//! use duramq::client::BrokerClient;
//! use duramq::types::Message;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BrokerClient::connect("127.0.0.1", 2011).await?;
//!
//!     client.send(Message::new("orders", "first")).await?;
//!     if let Some(message) = client.receive("orders").await? {
//!         println!("got {}", message.payload);
//!     }
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod types;

/// Common error types used throughout DuraMQ
pub mod error {
    use std::fmt;

    /// DuraMQ error types
    #[derive(Debug)]
    pub enum BrokerError {
        /// I/O operation failed
        Io(std::io::Error),
        /// Serialization/deserialization failed
        Serde(serde_json::Error),
        /// Configuration error
        Config(String),
        /// A queue's log or checkpoint file could not be opened, read, written or flushed
        Storage(String),
        /// Destination name cannot be mapped onto a queue
        InvalidDestination(String),
        /// Malformed or unexpected frame on the wire
        Protocol(String),
        /// Client used without a live connection
        NotConnected,
        /// Component used outside its valid lifecycle state
        IllegalState(String),
        /// Listener error
        Server(String),
        /// Connection error
        Connection(String),
        /// Request did not complete in time
        Timeout(String),
    }

    impl fmt::Display for BrokerError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                BrokerError::Io(e) => write!(f, "I/O error: {}", e),
                BrokerError::Serde(e) => write!(f, "Serialization error: {}", e),
                BrokerError::Config(e) => write!(f, "Configuration error: {}", e),
                BrokerError::Storage(e) => write!(f, "Storage failure: {}", e),
                BrokerError::InvalidDestination(e) => write!(f, "Invalid destination: {}", e),
                BrokerError::Protocol(e) => write!(f, "Protocol violation: {}", e),
                BrokerError::NotConnected => write!(f, "Not connected to a broker"),
                BrokerError::IllegalState(e) => write!(f, "Illegal state: {}", e),
                BrokerError::Server(e) => write!(f, "Server error: {}", e),
                BrokerError::Connection(e) => write!(f, "Connection error: {}", e),
                BrokerError::Timeout(e) => write!(f, "Timeout: {}", e),
            }
        }
    }

    impl std::error::Error for BrokerError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                BrokerError::Io(e) => Some(e),
                BrokerError::Serde(e) => Some(e),
                _ => None,
            }
        }
    }

    impl From<std::io::Error> for BrokerError {
        fn from(err: std::io::Error) -> Self {
            BrokerError::Io(err)
        }
    }

    impl From<serde_json::Error> for BrokerError {
        fn from(err: serde_json::Error) -> Self {
            BrokerError::Serde(err)
        }
    }

    /// Result type alias for DuraMQ operations
    pub type Result<T> = std::result::Result<T, BrokerError>;
}

pub use error::{BrokerError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::BrokerClient;
    pub use crate::config::{BrokerConfig, ClientConfig};
    pub use crate::queue::{DurableQueue, QueueRegistry};
    pub use crate::server::{Broker, BrokerState};
    pub use crate::types::Message;
    pub use crate::{BrokerError, Result};
}

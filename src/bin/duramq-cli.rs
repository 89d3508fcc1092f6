//! DuraMQ command-line client
//!
//! Sends, checks and receives messages against a running broker.

use clap::{Parser, Subcommand};
use duramq::client::BrokerClient;
use duramq::config::ClientConfig;
use duramq::types::Message;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "duramq-cli")]
#[command(about = "Command-line producer and consumer for DuraMQ")]
#[command(version)]
struct Args {
    /// Broker host address
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Broker port
    #[arg(short, long, default_value_t = duramq::config::settings::DEFAULT_PORT)]
    port: u16,

    /// Request timeout in seconds
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a message (payload is parsed as JSON, or sent as a string)
    Send {
        /// Destination queue
        destination: String,
        /// Message payload
        payload: String,
    },
    /// Print whether a message is waiting
    Check {
        /// Destination queue
        destination: String,
    },
    /// Dequeue and print the oldest message, if any
    Receive {
        /// Destination queue
        destination: String,
    },
}

fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let client = BrokerClient::with_config(ClientConfig {
        address: args.address,
        port: args.port,
        timeout_seconds: args.timeout,
        ..Default::default()
    })
    .await?;

    match args.command {
        Command::Send { destination, payload } => {
            client.send(Message::new(destination, parse_payload(&payload))).await?;
            println!("ACK");
        }
        Command::Check { destination } => {
            println!("{}", client.check_availability(&destination).await?);
        }
        Command::Receive { destination } => match client.receive(&destination).await? {
            Some(message) => println!("{}", message.payload),
            None => {
                client.close().await?;
                std::process::exit(2);
            }
        },
    }

    client.close().await?;
    Ok(())
}

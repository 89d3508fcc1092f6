//! Client for producing to and consuming from a DuraMQ broker

use crate::config::ClientConfig;
use crate::protocol::{ClientCodec, Request, Response};
use crate::types::Message;
use crate::{BrokerError, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;
use tracing::debug;

type Connection = Framed<TcpStream, ClientCodec>;

/// Client holding one persistent connection to a broker.
///
/// Clones share the connection; their requests are serialized so replies
/// always match the request that produced them.
#[derive(Clone)]
pub struct BrokerClient {
    config: ClientConfig,
    connection: Arc<Mutex<Option<Connection>>>,
}

impl BrokerClient {
    /// Connect to the broker at `address:port`
    pub async fn connect(address: &str, port: u16) -> Result<Self> {
        let config = ClientConfig {
            address: address.to_string(),
            port,
            ..Default::default()
        };

        Self::with_config(config).await
    }

    /// Connect using a custom configuration
    pub async fn with_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let target = format!("{}:{}", config.address, config.port);
        let limit = Duration::from_secs(config.timeout_seconds);
        let stream = timeout(limit, TcpStream::connect(&target))
            .await
            .map_err(|_| BrokerError::Connection("Connection timeout".to_string()))?
            .map_err(|e| {
                BrokerError::Connection(format!("Failed to connect to {}: {}", target, e))
            })?;
        stream.set_nodelay(true)?;

        debug!(broker = %target, "Connected");
        let connection = Framed::new(stream, ClientCodec::new(config.max_frame_length));
        Ok(Self {
            config,
            connection: Arc::new(Mutex::new(Some(connection))),
        })
    }

    /// Send a message and wait until the broker has durably stored it
    pub async fn send(&self, message: Message) -> Result<()> {
        match self.request(Request::Send(message)).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected("SEND", other)),
        }
    }

    /// Whether `destination` has a message waiting
    pub async fn check_availability(&self, destination: &str) -> Result<bool> {
        match self.request(Request::Check(destination.to_string())).await? {
            Response::Available(available) => Ok(available),
            other => Err(unexpected("CHECK", other)),
        }
    }

    /// Take the oldest message of `destination`. Returns `None` right away
    /// when nothing is waiting.
    pub async fn receive(&self, destination: &str) -> Result<Option<Message>> {
        match self.request(Request::Receive(destination.to_string())).await? {
            Response::Message(message) => Ok(Some(message)),
            Response::Empty => Ok(None),
            other => Err(unexpected("RECEIVE", other)),
        }
    }

    /// Whether the connection is still open
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Close the connection to the broker
    pub async fn close(&self) -> Result<()> {
        let mut conn_guard = self.connection.lock().await;
        if let Some(mut conn) = conn_guard.take() {
            SinkExt::<Request>::close(&mut conn).await?;
        }
        Ok(())
    }

    /// One request/reply exchange. Any transport failure drops the
    /// connection, since a reply may still be in flight.
    async fn request(&self, request: Request) -> Result<Response> {
        let mut conn_guard = self.connection.lock().await;
        let conn = conn_guard.as_mut().ok_or(BrokerError::NotConnected)?;
        let op = request.op();

        let limit = Duration::from_secs(self.config.timeout_seconds);
        let outcome = timeout(limit, exchange(conn, request)).await;

        match outcome {
            Ok(Ok(Response::Error(reply))) => Err(reply.into_error()),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                *conn_guard = None;
                Err(e)
            }
            Err(_) => {
                *conn_guard = None;
                Err(BrokerError::Timeout(format!("{} got no reply within {:?}", op, limit)))
            }
        }
    }
}

async fn exchange(conn: &mut Connection, request: Request) -> Result<Response> {
    conn.send(request).await?;
    match conn.next().await {
        Some(response) => response,
        None => Err(BrokerError::Connection("Broker closed the connection".to_string())),
    }
}

fn unexpected(op: &str, response: Response) -> BrokerError {
    BrokerError::Protocol(format!("unexpected {} reply to {}", response.kind(), op))
}

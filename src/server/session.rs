//! Per-connection request/reply loop

use crate::config::ServerSettings;
use crate::protocol::{ErrorReply, Request, Response, ServerCodec};
use crate::queue::QueueRegistry;
use crate::types::Message;
use crate::{BrokerError, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Per-session settings derived from [`ServerSettings`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Largest accepted request frame
    pub max_frame_length: usize,
    /// Close the session when no request arrives for this long
    pub idle_timeout: Option<Duration>,
}

impl From<&ServerSettings> for SessionSettings {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            max_frame_length: settings.max_frame_length,
            idle_timeout: match settings.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Serves one client connection: read a request, apply it, write the reply.
pub struct SessionHandler {
    id: Uuid,
    peer: String,
    registry: Arc<QueueRegistry>,
    shutdown: watch::Receiver<bool>,
    settings: SessionSettings,
}

impl SessionHandler {
    /// Create a handler for a connection from `peer`
    pub fn new(
        peer: impl Into<String>,
        registry: Arc<QueueRegistry>,
        shutdown: watch::Receiver<bool>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            registry,
            shutdown,
            settings,
        }
    }

    /// Session identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the loop until the client disconnects, idles out or the broker
    /// shuts down. A request being processed always gets its reply first.
    pub async fn run<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let span = tracing::info_span!("session", id = %self.id, peer = %self.peer);
        self.serve(stream).instrument(span).await
    }

    async fn serve<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, ServerCodec::new(self.settings.max_frame_length));
        info!("Session started");

        loop {
            if *self.shutdown.borrow_and_update() {
                break;
            }

            let next = tokio::select! {
                _ = self.shutdown.changed() => break,
                next = next_request(&mut framed, self.settings.idle_timeout) => next,
            };

            let request = match next {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!("Client closed connection");
                    break;
                }
                Err(BrokerError::Timeout(e)) => {
                    warn!(reason = %e, "Closing idle session");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Closing session after bad frame");
                    return Err(e);
                }
            };

            debug!(op = request.op(), destination = request.destination(), "Request");
            let response = handle_request(&self.registry, request).await;
            let reply = response.kind();
            debug!(reply, "Reply");
            if let Err(e) = framed.send(response).await {
                // The request has already been applied
                error!(reply, error = %e, "Failed to write reply");
                return Err(e);
            }
        }

        info!("Session ended");
        Ok(())
    }
}

async fn next_request<S>(
    framed: &mut Framed<S, ServerCodec>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Request>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let next = match idle_timeout {
        Some(idle) => timeout(idle, framed.next())
            .await
            .map_err(|_| BrokerError::Timeout(format!("no request within {:?}", idle)))?,
        None => framed.next().await,
    };
    next.transpose()
}

/// Apply one request to the registry and build its reply. Failures become
/// `ERROR` replies; an empty destination is a normal `EMPTY` reply.
pub async fn handle_request(registry: &QueueRegistry, request: Request) -> Response {
    let result = match request {
        Request::Send(message) => send(registry, message).await.map(|_| Response::Ack),
        Request::Check(destination) => check(registry, &destination).await.map(Response::Available),
        Request::Receive(destination) => receive(registry, &destination).await.map(|message| {
            message.map_or(Response::Empty, Response::Message)
        }),
    };

    result.unwrap_or_else(|e| {
        warn!(error = %e, "Request failed");
        Response::Error(ErrorReply::from(&e))
    })
}

async fn send(registry: &QueueRegistry, message: Message) -> Result<()> {
    let queue = registry.get_or_create(&message.destination).await?;
    let mut queue = queue.lock().await;
    queue.enqueue(message).await
}

async fn check(registry: &QueueRegistry, destination: &str) -> Result<bool> {
    match registry.get(destination).await? {
        Some(queue) => Ok(!queue.lock().await.is_empty()),
        None => Ok(false),
    }
}

async fn receive(registry: &QueueRegistry, destination: &str) -> Result<Option<Message>> {
    match registry.get(destination).await? {
        Some(queue) => queue.lock().await.dequeue().await,
        None => Ok(None),
    }
}

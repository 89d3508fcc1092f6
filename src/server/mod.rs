//! DuraMQ broker implementation

pub mod session;

use crate::config::BrokerConfig;
use crate::queue::QueueRegistry;
use crate::{BrokerError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub use session::{handle_request, SessionHandler, SessionSettings};

/// Lifecycle of a [`Broker`]. There is no way back from `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed, not yet listening
    Created,
    /// Accepting connections
    Started,
    /// Shut down; a new instance is needed to listen again
    Stopped,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerState::Created => write!(f, "created"),
            BrokerState::Started => write!(f, "started"),
            BrokerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Networked message broker: owns the queue registry, accepts connections
/// and runs one session task per client.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<QueueRegistry>,
    state: Mutex<BrokerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    failure: Arc<watch::Sender<Option<String>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Broker {
    /// Create a broker from the given configuration
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(QueueRegistry::new(
            config.storage.directory.clone(),
            config.storage.sync_on_write,
        ));
        let (shutdown_tx, _) = watch::channel(false);
        let (failure, _) = watch::channel(None);

        Ok(Self {
            config,
            registry,
            state: Mutex::new(BrokerState::Created),
            shutdown_tx: Arc::new(shutdown_tx),
            failure: Arc::new(failure),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> BrokerState {
        *self.state.lock()
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Queue registry shared by all sessions
    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Bind the listening socket and start accepting connections.
    ///
    /// A broker whose start fails is left `Stopped`.
    pub async fn start(&self) -> Result<()> {
        self.transition(BrokerState::Created, BrokerState::Started, "start")?;

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.lock() = BrokerState::Stopped;
                return Err(e);
            }
        };

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!(
            address = %local_addr,
            storage = %self.config.storage.directory.display(),
            "Broker listening"
        );

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.registry),
            Arc::clone(&self.shutdown_tx),
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.failure),
            session::SessionSettings::from(&self.config.server),
        ));
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    /// Stop accepting, let every session finish its current request, then
    /// close all queues. Returns the accept loop's error if it died early.
    pub async fn stop(&self) -> Result<()> {
        self.transition(BrokerState::Started, BrokerState::Stopped, "stop")?;
        info!("Stopping broker");

        self.shutdown_tx.send_replace(true);
        let task = self.accept_task.lock().take();
        let accepted = match task {
            Some(task) => task
                .await
                .map_err(|e| BrokerError::Server(format!("accept loop panicked: {}", e)))
                .and_then(|result| result),
            None => Ok(()),
        };

        let closed = self.registry.close_all().await;
        info!("Broker stopped");
        accepted.and(closed)
    }

    /// Resolve once the listener has died on its own, with the error that
    /// stopped it. Stays pending while the broker is healthy; `stop()` must
    /// still be called afterwards to drain sessions and close queues.
    pub async fn wait_for_failure(&self) -> BrokerError {
        let mut failure = self.failure.subscribe();
        let reason = match failure.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => BrokerError::Server(reason),
            // The sender lives as long as `self`
            None => std::future::pending().await,
        }
    }

    async fn bind(&self) -> Result<TcpListener> {
        tokio::fs::create_dir_all(&self.config.storage.directory)
            .await
            .map_err(|e| {
                BrokerError::Storage(format!(
                    "failed to create {}: {}",
                    self.config.storage.directory.display(),
                    e
                ))
            })?;

        let address = self.config.listen_address();
        TcpListener::bind(&address)
            .await
            .map_err(|e| BrokerError::Server(format!("Failed to bind {}: {}", address, e)))
    }

    fn transition(&self, from: BrokerState, to: BrokerState, action: &str) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(BrokerError::IllegalState(format!(
                "cannot {} a broker that is {}",
                action, *state
            )));
        }
        *state = to;
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if *self.state.get_mut() == BrokerState::Started {
            warn!("Broker dropped without stop(), signalling sessions");
            self.shutdown_tx.send_replace(true);
        }
    }
}

/// Accept connections until shutdown is signalled. Any accept error is fatal:
/// sessions are told to finish, and the error is handed to `stop()`.
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<QueueRegistry>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
    failure: Arc<watch::Sender<Option<String>>>,
    settings: SessionSettings,
) -> Result<()> {
    let mut sessions = JoinSet::new();

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let handler = SessionHandler::new(
                        peer.to_string(),
                        Arc::clone(&registry),
                        shutdown_tx.subscribe(),
                        settings.clone(),
                    );
                    let session_id = handler.id();
                    sessions.spawn(async move {
                        if let Err(e) = handler.run(stream).await {
                            debug!(session = %session_id, error = %e, "Session closed with error");
                        }
                    });
                }
                Err(e) => break Err(listener_failed(&failure, &shutdown_tx, e)),
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!(error = %e, "Session task failed");
                }
            }
        }
    };

    drop(listener);
    while let Some(finished) = sessions.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Session task failed");
        }
    }
    result
}

/// Publish a fatal listener error and tell every session to finish
fn listener_failed(
    failure: &watch::Sender<Option<String>>,
    shutdown_tx: &watch::Sender<bool>,
    err: std::io::Error,
) -> BrokerError {
    error!(error = %err, "Failed to accept connection, stopping listener");
    let reason = format!("accept failed: {}", err);
    failure.send_replace(Some(reason.clone()));
    shutdown_tx.send_replace(true);
    BrokerError::Server(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BrokerClient;
    use crate::types::Message;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn test_config(dir: &std::path::Path) -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config.storage.directory = dir.to_path_buf();
        config.storage.sync_on_write = false;
        config
    }

    #[tokio::test]
    async fn test_lifecycle_state_machine() {
        let temp_dir = tempdir().unwrap();
        let broker = Broker::new(test_config(temp_dir.path())).unwrap();
        assert_eq!(broker.state(), BrokerState::Created);
        assert!(broker.local_addr().is_none());

        assert!(matches!(broker.stop().await, Err(BrokerError::IllegalState(_))));

        broker.start().await.unwrap();
        assert_eq!(broker.state(), BrokerState::Started);
        assert!(broker.local_addr().is_some());
        assert!(matches!(broker.start().await, Err(BrokerError::IllegalState(_))));

        broker.stop().await.unwrap();
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(matches!(broker.start().await, Err(BrokerError::IllegalState(_))));
        assert!(matches!(broker.stop().await, Err(BrokerError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_broker_stopped() {
        let temp_dir = tempdir().unwrap();
        let first = Broker::new(test_config(temp_dir.path())).unwrap();
        first.start().await.unwrap();

        let mut config = test_config(temp_dir.path());
        config.server.port = first.local_addr().unwrap().port();
        let second = Broker::new(config).unwrap();

        assert!(matches!(second.start().await, Err(BrokerError::Server(_))));
        assert_eq!(second.state(), BrokerState::Stopped);

        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_connected_sessions() {
        let temp_dir = tempdir().unwrap();
        let broker = Broker::new(test_config(temp_dir.path())).unwrap();
        broker.start().await.unwrap();
        let addr = broker.local_addr().unwrap();

        let client = BrokerClient::connect("127.0.0.1", addr.port()).await.unwrap();
        client.send(Message::new("orders", "kept")).await.unwrap();

        let stopped = timeout(Duration::from_secs(5), broker.stop()).await;
        assert!(stopped.unwrap().is_ok());
        assert!(broker.registry().is_empty());

        // Session is gone, so the next request fails on the client side
        assert!(client.check_availability("orders").await.is_err());
    }

    #[tokio::test]
    async fn test_storage_directory_is_created() {
        let temp_dir = tempdir().unwrap();
        let storage = temp_dir.path().join("deep").join("storage");
        let broker = Broker::new(test_config(&storage)).unwrap();

        broker.start().await.unwrap();
        assert!(storage.is_dir());
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_failure_reports_listener_error() {
        let temp_dir = tempdir().unwrap();
        let broker = Broker::new(test_config(temp_dir.path())).unwrap();
        broker.start().await.unwrap();

        let healthy = timeout(Duration::from_millis(100), broker.wait_for_failure()).await;
        assert!(healthy.is_err());

        let err = std::io::Error::new(std::io::ErrorKind::Other, "too many open files");
        listener_failed(&broker.failure, &broker.shutdown_tx, err);

        let failed = timeout(Duration::from_secs(2), broker.wait_for_failure()).await;
        match failed.unwrap() {
            BrokerError::Server(reason) => assert!(reason.contains("too many open files")),
            other => panic!("Expected server error, got {:?}", other),
        }
        assert!(*broker.shutdown_tx.borrow());

        // The accept loop saw the shutdown and exits cleanly; stop still closes queues
        broker.stop().await.unwrap();
        assert_eq!(broker.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn test_wait_for_failure_stays_pending_after_clean_stop() {
        let temp_dir = tempdir().unwrap();
        let broker = Broker::new(test_config(temp_dir.path())).unwrap();
        broker.start().await.unwrap();
        broker.stop().await.unwrap();

        let waited = timeout(Duration::from_millis(100), broker.wait_for_failure()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = BrokerConfig::default();
        config.server.bind_address = String::new();
        assert!(matches!(Broker::new(config), Err(BrokerError::Config(_))));
    }
}

//! Registry mapping destination names to their durable queues

use crate::queue::{validate_destination, DurableQueue};
use crate::{BrokerError, Result};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// A queue shared between sessions. The mutex serializes every operation on
/// one destination; different destinations never contend.
pub type SharedQueue = Arc<Mutex<DurableQueue>>;

/// Registry of open queues, shared by every session of a broker.
///
/// Lookups go straight to a concurrent map. Opening a queue is serialized by
/// `create_lock` and re-checks the map once the lock is held, so concurrent
/// first senders to a new destination end up with the same instance.
pub struct QueueRegistry {
    storage_directory: PathBuf,
    sync_on_write: bool,
    queues: DashMap<String, SharedQueue>,
    create_lock: Mutex<()>,
}

impl QueueRegistry {
    /// Create a registry storing its queues in `storage_directory`
    pub fn new(storage_directory: impl Into<PathBuf>, sync_on_write: bool) -> Self {
        Self {
            storage_directory: storage_directory.into(),
            sync_on_write,
            queues: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    /// Directory holding the queue files
    pub fn storage_directory(&self) -> &Path {
        &self.storage_directory
    }

    /// Queue for `destination`, opening it against the storage directory if needed
    pub async fn get_or_create(&self, destination: &str) -> Result<SharedQueue> {
        if let Some(queue) = self.lookup(destination) {
            return Ok(queue);
        }
        validate_destination(destination)?;

        let _guard = self.create_lock.lock().await;
        if let Some(queue) = self.lookup(destination) {
            return Ok(queue);
        }
        tokio::fs::create_dir_all(&self.storage_directory)
            .await
            .map_err(|e| storage_error("create", &self.storage_directory, e))?;
        self.open_and_insert(destination).await
    }

    /// Existing queue for `destination`, without creating new files.
    ///
    /// A destination not yet opened by this broker is reopened when its log
    /// file is already on disk, so messages persisted before a restart stay
    /// reachable. Names that can never map to a queue simply yield `None`.
    pub async fn get(&self, destination: &str) -> Result<Option<SharedQueue>> {
        if let Some(queue) = self.lookup(destination) {
            return Ok(Some(queue));
        }
        if validate_destination(destination).is_err() {
            return Ok(None);
        }

        let log_path = self.storage_directory.join(destination);
        let on_disk = tokio::fs::try_exists(&log_path)
            .await
            .map_err(|e| storage_error("stat", &log_path, e))?;
        if !on_disk {
            return Ok(None);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(queue) = self.lookup(destination) {
            return Ok(Some(queue));
        }
        debug!(queue = destination, "Reopening queue found on disk");
        self.open_and_insert(destination).await.map(Some)
    }

    /// Number of queues currently open
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether no queue is open
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Names of the queues currently open
    pub fn destinations(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close every open queue and forget it. Returns the first failure, after
    /// attempting to close all of them.
    pub async fn close_all(&self) -> Result<()> {
        let queues: Vec<(String, SharedQueue)> = self
            .queues
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        self.queues.clear();

        let mut first_error = None;
        for (destination, queue) in queues {
            let mut queue = queue.lock().await;
            if queue.is_closed() {
                continue;
            }
            if let Err(e) = queue.close().await {
                error!(queue = %destination, error = %e, "Failed to close queue");
                first_error.get_or_insert(e);
            }
        }

        info!("Closed all queues");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lookup(&self, destination: &str) -> Option<SharedQueue> {
        self.queues.get(destination).map(|entry| Arc::clone(entry.value()))
    }

    /// Callers hold `create_lock`.
    async fn open_and_insert(&self, destination: &str) -> Result<SharedQueue> {
        let queue =
            DurableQueue::open_with_sync(destination, &self.storage_directory, self.sync_on_write)
                .await?;
        let queue = Arc::new(Mutex::new(queue));
        self.queues.insert(destination.to_string(), Arc::clone(&queue));
        Ok(queue)
    }
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> BrokerError {
    BrokerError::Storage(format!("failed to {} {}: {}", action, path.display(), err))
}

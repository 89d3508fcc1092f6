//! Disk-backed FIFO queue for a single destination
//!
//! Every destination owns two append-only files inside the storage directory:
//!
//! - `<name>`: the message log, one `[u32 BE length][JSON message]` record per
//!   enqueued message, oldest first.
//! - `<name>-checkpoint`: one big-endian `u64` per dequeue, each holding the
//!   total number of messages ever dequeued after that dequeue.
//!
//! Reopening a queue replays the log and skips as many records as the last
//! checkpoint value says were already delivered. Neither file is ever
//! compacted, so both grow for as long as the destination is used.

use crate::queue::validate_destination;
use crate::types::Message;
use crate::{BrokerError, Result};
use std::collections::VecDeque;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, error, info, warn};

/// Suffix appended to a destination name to form its checkpoint file name
pub const CHECKPOINT_SUFFIX: &str = "-checkpoint";

const LENGTH_PREFIX_SIZE: u64 = 4;
const CHECKPOINT_RECORD_SIZE: u64 = 8;

/// A durable FIFO of messages for one destination.
///
/// Operations take `&mut self`; callers sharing a queue across tasks wrap it
/// in a mutex (see [`crate::queue::SharedQueue`]) so that file writes and the
/// in-memory sequence never interleave.
#[derive(Debug)]
pub struct DurableQueue {
    name: String,
    log_path: PathBuf,
    checkpoint_path: PathBuf,
    pending: VecDeque<Message>,
    checkpoint: u64,
    sync_on_write: bool,
    files: Option<QueueFiles>,
}

#[derive(Debug)]
struct QueueFiles {
    log: BufWriter<File>,
    log_len: u64,
    checkpoint: File,
    checkpoint_len: u64,
}

struct Replay {
    pending: VecDeque<Message>,
    checkpoint: u64,
    log_len: u64,
    checkpoint_len: u64,
    /// Last checkpoint record pointed past the end of the log
    checkpoint_clamped: bool,
}

impl DurableQueue {
    /// Open (or create) the queue `name` inside `storage_directory`, syncing every write
    pub async fn open(name: &str, storage_directory: &Path) -> Result<Self> {
        Self::open_with_sync(name, storage_directory, true).await
    }

    /// Open (or create) a queue, choosing whether writes are fsynced
    pub async fn open_with_sync(
        name: &str,
        storage_directory: &Path,
        sync_on_write: bool,
    ) -> Result<Self> {
        validate_destination(name)?;

        let log_path = storage_directory.join(name);
        let checkpoint_path = storage_directory.join(format!("{}{}", name, CHECKPOINT_SUFFIX));

        let replay = replay(name, &log_path, &checkpoint_path).await?;

        let log = open_append(&log_path).await?;
        let mut checkpoint = open_append(&checkpoint_path).await?;

        let mut checkpoint_len = replay.checkpoint_len;
        if replay.checkpoint_clamped {
            append_checkpoint(&mut checkpoint, replay.checkpoint, sync_on_write)
                .await
                .map_err(|e| storage_error("append to", &checkpoint_path, e))?;
            checkpoint_len += CHECKPOINT_RECORD_SIZE;
        }

        info!(
            queue = name,
            pending = replay.pending.len(),
            checkpoint = replay.checkpoint,
            "Opened queue"
        );

        Ok(Self {
            name: name.to_string(),
            log_path,
            checkpoint_path,
            pending: replay.pending,
            checkpoint: replay.checkpoint,
            sync_on_write,
            files: Some(QueueFiles {
                log: BufWriter::new(log),
                log_len: replay.log_len,
                checkpoint,
                checkpoint_len,
            }),
        })
    }

    /// Destination name of this queue
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the append-only message log
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Path of the checkpoint file
    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Number of messages ever dequeued from this destination
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no message is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.files.is_none()
    }

    /// Head of the queue, without removing it
    pub fn peek(&self) -> Option<&Message> {
        self.pending.front()
    }

    /// Append a message to the log, then make it available for delivery.
    ///
    /// The message only becomes visible once the record has been flushed; on
    /// failure the log is rolled back and the pending sequence is unchanged.
    pub async fn enqueue(&mut self, message: Message) -> Result<()> {
        let record = encode_record(&message)?;
        let sync = self.sync_on_write;
        let files = self.files_mut()?;

        if let Err(e) = append_log(&mut files.log, &record, sync).await {
            self.rollback_log().await;
            return Err(storage_error("append to", &self.log_path, e));
        }
        if let Some(files) = self.files.as_mut() {
            files.log_len += record.len() as u64;
        }

        self.pending.push_back(message);
        debug!(queue = %self.name, pending = self.pending.len(), "Enqueued message");
        Ok(())
    }

    /// Remove and return the head of the queue, or `None` when it is empty.
    ///
    /// The new checkpoint is persisted before the message leaves memory, so a
    /// crash in between loses the message rather than delivering it twice.
    pub async fn dequeue(&mut self) -> Result<Option<Message>> {
        let sync = self.sync_on_write;
        let next = self.checkpoint + 1;
        let has_pending = !self.pending.is_empty();
        let files = self.files_mut()?;
        if !has_pending {
            return Ok(None);
        }

        if let Err(e) = append_checkpoint(&mut files.checkpoint, next, sync).await {
            self.rollback_checkpoint().await;
            return Err(storage_error("append to", &self.checkpoint_path, e));
        }
        if let Some(files) = self.files.as_mut() {
            files.checkpoint_len += CHECKPOINT_RECORD_SIZE;
        }

        self.checkpoint = next;
        debug!(queue = %self.name, checkpoint = next, "New checkpoint");
        Ok(self.pending.pop_front())
    }

    /// Flush and release both files. Further enqueues and dequeues fail.
    pub async fn close(&mut self) -> Result<()> {
        let mut files = self.files.take().ok_or_else(|| {
            BrokerError::IllegalState(format!("queue {} is already closed", self.name))
        })?;

        files
            .log
            .shutdown()
            .await
            .map_err(|e| storage_error("close", &self.log_path, e))?;
        if self.sync_on_write {
            files
                .log
                .get_ref()
                .sync_all()
                .await
                .map_err(|e| storage_error("sync", &self.log_path, e))?;
            files
                .checkpoint
                .sync_all()
                .await
                .map_err(|e| storage_error("sync", &self.checkpoint_path, e))?;
        }

        info!(queue = %self.name, pending = self.pending.len(), "Closed queue");
        Ok(())
    }

    fn files_mut(&mut self) -> Result<&mut QueueFiles> {
        let name = &self.name;
        self.files
            .as_mut()
            .ok_or_else(|| BrokerError::IllegalState(format!("queue {} is closed", name)))
    }

    /// Cut a partially written record off the log and start a fresh writer.
    /// If that fails too the queue is closed so nothing is appended after garbage.
    async fn rollback_log(&mut self) {
        let Some(files) = self.files.as_mut() else {
            return;
        };
        match reset_to(&self.log_path, files.log_len).await {
            Ok(file) => files.log = BufWriter::new(file),
            Err(e) => {
                error!(
                    queue = %self.name,
                    error = %e,
                    "Failed to roll back message log, closing queue"
                );
                self.files = None;
            }
        }
    }

    async fn rollback_checkpoint(&mut self) {
        let Some(files) = self.files.as_mut() else {
            return;
        };
        match reset_to(&self.checkpoint_path, files.checkpoint_len).await {
            Ok(file) => files.checkpoint = file,
            Err(e) => {
                error!(
                    queue = %self.name,
                    error = %e,
                    "Failed to roll back checkpoint file, closing queue"
                );
                self.files = None;
            }
        }
    }
}

/// Encode a message as one log record
pub fn encode_record(message: &Message) -> Result<Vec<u8>> {
    let body = message.to_json_bytes()?;
    let len = u32::try_from(body.len()).map_err(|_| {
        BrokerError::Storage(format!("message of {} bytes is too large", body.len()))
    })?;

    let mut record = Vec::with_capacity(LENGTH_PREFIX_SIZE as usize + body.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

async fn replay(name: &str, log_path: &Path, checkpoint_path: &Path) -> Result<Replay> {
    if !exists(log_path).await? {
        // Without a log there is nothing to skip; stale checkpoints would only mislead.
        if exists(checkpoint_path).await? {
            reset_to(checkpoint_path, 0)
                .await
                .map_err(|e| storage_error("reset", checkpoint_path, e))?;
        }
        return Ok(Replay {
            pending: VecDeque::new(),
            checkpoint: 0,
            log_len: 0,
            checkpoint_len: 0,
            checkpoint_clamped: false,
        });
    }

    info!(queue = name, path = %log_path.display(), "Reloading queue");
    let (checkpoint, checkpoint_len) = read_checkpoint(name, checkpoint_path)
        .await
        .map_err(|e| storage_error("read", checkpoint_path, e))?;
    info!(queue = name, checkpoint, "Last checkpoint");

    let (pending, log_len, records) = read_log(name, log_path, checkpoint)
        .await
        .map_err(|e| storage_error("read", log_path, e))?;
    info!(queue = name, pending = pending.len(), "Loaded messages back into queue");

    // Left alone, a checkpoint past the end of the log would hide the next
    // records appended to it on every later reload.
    let checkpoint_clamped = records < checkpoint;
    if checkpoint_clamped {
        warn!(
            queue = name,
            records,
            checkpoint,
            "Checkpoint is ahead of the message log, resetting it to the record count"
        );
    }

    Ok(Replay {
        pending,
        checkpoint: checkpoint.min(records),
        log_len,
        checkpoint_len,
        checkpoint_clamped,
    })
}

/// Last complete checkpoint record, truncating a torn trailing record.
async fn read_checkpoint(name: &str, path: &Path) -> std::io::Result<(u64, u64)> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    let complete = len - len % CHECKPOINT_RECORD_SIZE;
    if complete != len {
        warn!(
            queue = name,
            dropped_bytes = len - complete,
            "Truncating partial checkpoint record"
        );
        file.set_len(complete).await?;
    }
    if complete == 0 {
        return Ok((0, 0));
    }

    file.seek(SeekFrom::Start(complete - CHECKPOINT_RECORD_SIZE)).await?;
    let checkpoint = file.read_u64().await?;

    let records = complete / CHECKPOINT_RECORD_SIZE;
    if checkpoint != records {
        warn!(queue = name, checkpoint, records, "Checkpoint value does not match record count");
    }
    Ok((checkpoint, complete))
}

/// Replay the log, skipping `skip` records. Stops at the first incomplete or
/// undecodable record and truncates the file there.
async fn read_log(
    name: &str,
    path: &Path,
    skip: u64,
) -> std::io::Result<(VecDeque<Message>, u64, u64)> {
    let file = OpenOptions::new().read(true).write(true).open(path).await?;
    let file_len = file.metadata().await?.len();
    let mut reader = BufReader::new(file);

    let mut pending = VecDeque::new();
    let mut offset = 0u64;
    let mut records = 0u64;
    let mut body = Vec::new();

    while offset + LENGTH_PREFIX_SIZE <= file_len {
        let len = reader.read_u32().await? as u64;
        let end = offset + LENGTH_PREFIX_SIZE + len;
        if end > file_len {
            break;
        }

        body.resize(len as usize, 0);
        reader.read_exact(&mut body).await?;

        if records >= skip {
            match serde_json::from_slice::<Message>(&body) {
                Ok(message) => pending.push_back(message),
                Err(e) => {
                    warn!(queue = name, record = records, error = %e, "Corrupt log record");
                    break;
                }
            }
        }

        offset = end;
        records += 1;
    }

    if records >= skip {
        debug!(queue = name, skipped = skip, "Skipped delivered log records");
    }

    if offset < file_len {
        warn!(
            queue = name,
            dropped_bytes = file_len - offset,
            "Truncating torn tail of message log"
        );
        reader.into_inner().set_len(offset).await?;
    }

    Ok((pending, offset, records))
}

async fn append_log(log: &mut BufWriter<File>, record: &[u8], sync: bool) -> std::io::Result<()> {
    log.write_all(record).await?;
    log.flush().await?;
    if sync {
        log.get_ref().sync_data().await?;
    }
    Ok(())
}

async fn append_checkpoint(file: &mut File, value: u64, sync: bool) -> std::io::Result<()> {
    file.write_all(&value.to_be_bytes()).await?;
    file.flush().await?;
    if sync {
        file.sync_data().await?;
    }
    Ok(())
}

async fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| storage_error("open", path, e))
}

/// Truncate `path` to `len` and reopen it for appending
async fn reset_to(path: &Path, len: u64) -> std::io::Result<File> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    drop(file);
    OpenOptions::new().append(true).open(path).await
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| storage_error("stat", path, e))
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> BrokerError {
    BrokerError::Storage(format!("failed to {} {}: {}", action, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open(name: &str, dir: &Path) -> DurableQueue {
        DurableQueue::open(name, dir).await.unwrap()
    }

    fn payload(message: Option<Message>) -> String {
        message.unwrap().payload_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("check.basic.operations", temp_dir.path()).await;

        queue.enqueue(Message::new("check.basic.operations", "hello world")).await.unwrap();
        queue.enqueue(Message::new("check.basic.operations", "foo")).await.unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().unwrap().payload_str(), Some("hello world"));
        assert_eq!(queue.peek().unwrap().payload_str(), Some("hello world"));
        assert_eq!(payload(queue.dequeue().await.unwrap()), "hello world");
        assert_eq!(queue.len(), 1);
        assert_eq!(payload(queue.dequeue().await.unwrap()), "foo");
        assert!(queue.is_empty());
        assert_eq!(queue.checkpoint(), 2);

        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(queue.peek().is_none());
        assert_eq!(queue.checkpoint(), 2);

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_and_reopen_keeps_partial_consumption() {
        let temp_dir = tempdir().unwrap();
        let name = "check.close.open";
        let mut queue = open(name, temp_dir.path()).await;

        queue.enqueue(Message::new(name, "hello world")).await.unwrap();
        queue.enqueue(Message::new(name, "foo")).await.unwrap();
        queue.close().await.unwrap();

        let mut queue = open(name, temp_dir.path()).await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().unwrap().payload_str(), Some("hello world"));
        assert_eq!(payload(queue.dequeue().await.unwrap()), "hello world");
        queue.close().await.unwrap();

        let mut queue = open(name, temp_dir.path()).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.checkpoint(), 1);
        assert_eq!(payload(queue.dequeue().await.unwrap()), "foo");
        assert!(queue.is_empty());
        queue.close().await.unwrap();

        let queue = open(name, temp_dir.path()).await;
        assert!(queue.is_empty());
        assert_eq!(queue.checkpoint(), 2);
    }

    #[tokio::test]
    async fn test_reopen_without_close() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("crashy", temp_dir.path()).await;
        for i in 0..5 {
            queue.enqueue(Message::new("crashy", i)).await.unwrap();
        }
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        drop(queue);

        let queue = open("crashy", temp_dir.path()).await;
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek().unwrap().payload, serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_file_layout() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("orders", temp_dir.path()).await;
        queue.enqueue(Message::new("orders", "first")).await.unwrap();
        queue.enqueue(Message::new("orders", "second")).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.close().await.unwrap();

        assert_eq!(queue.log_path(), temp_dir.path().join("orders"));
        assert_eq!(queue.checkpoint_path(), temp_dir.path().join("orders-checkpoint"));

        let log = std::fs::read(queue.log_path()).unwrap();
        let first = encode_record(&Message::new("orders", "first")).unwrap();
        let second = encode_record(&Message::new("orders", "second")).unwrap();
        assert_eq!(log, [first, second].concat());

        let checkpoint = std::fs::read(queue.checkpoint_path()).unwrap();
        assert_eq!(checkpoint, 1u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_file_means_zero() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("jobs", temp_dir.path()).await;
        queue.enqueue(Message::new("jobs", "a")).await.unwrap();
        queue.enqueue(Message::new("jobs", "b")).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.close().await.unwrap();

        std::fs::remove_file(temp_dir.path().join("jobs-checkpoint")).unwrap();

        let queue = open("jobs", temp_dir.path()).await;
        assert_eq!(queue.checkpoint(), 0);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_checkpoint_record_is_ignored() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("jobs", temp_dir.path()).await;
        for payload in ["a", "b", "c"] {
            queue.enqueue(Message::new("jobs", payload)).await.unwrap();
        }
        queue.dequeue().await.unwrap();
        queue.close().await.unwrap();

        let checkpoint_path = temp_dir.path().join("jobs-checkpoint");
        let mut bytes = std::fs::read(&checkpoint_path).unwrap();
        bytes.extend_from_slice(&[0, 0, 0]);
        std::fs::write(&checkpoint_path, &bytes).unwrap();

        let mut queue = open("jobs", temp_dir.path()).await;
        assert_eq!(queue.checkpoint(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(std::fs::metadata(&checkpoint_path).unwrap().len(), 8);

        // The repaired file keeps accepting aligned records
        assert_eq!(payload(queue.dequeue().await.unwrap()), "b");
        queue.close().await.unwrap();

        let queue = open("jobs", temp_dir.path()).await;
        assert_eq!(queue.checkpoint(), 2);
        assert_eq!(queue.peek().unwrap().payload_str(), Some("c"));
    }

    #[tokio::test]
    async fn test_torn_log_tail_is_end_of_data() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("events", temp_dir.path()).await;
        queue.enqueue(Message::new("events", "kept")).await.unwrap();
        queue.close().await.unwrap();

        let log_path = temp_dir.path().join("events");
        let intact_len = std::fs::metadata(&log_path).unwrap().len();
        let torn = encode_record(&Message::new("events", "torn")).unwrap();
        let mut bytes = std::fs::read(&log_path).unwrap();
        bytes.extend_from_slice(&torn[..torn.len() - 3]);
        std::fs::write(&log_path, &bytes).unwrap();

        let mut queue = open("events", temp_dir.path()).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), intact_len);

        // New records land right after the last intact one
        queue.enqueue(Message::new("events", "after")).await.unwrap();
        queue.close().await.unwrap();

        let mut queue = open("events", temp_dir.path()).await;
        assert_eq!(queue.len(), 2);
        assert_eq!(payload(queue.dequeue().await.unwrap()), "kept");
        assert_eq!(payload(queue.dequeue().await.unwrap()), "after");
    }

    #[tokio::test]
    async fn test_corrupt_record_stops_recovery() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("events", temp_dir.path()).await;
        queue.enqueue(Message::new("events", "one")).await.unwrap();
        queue.close().await.unwrap();

        let log_path = temp_dir.path().join("events");
        let mut bytes = std::fs::read(&log_path).unwrap();
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(b"{oops");
        std::fs::write(&log_path, &bytes).unwrap();

        let queue = open("events", temp_dir.path()).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().payload_str(), Some("one"));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_does_not_allocate() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("events"), u32::MAX.to_be_bytes()).unwrap();

        let queue = open("events", temp_dir.path()).await;
        assert!(queue.is_empty());
        assert_eq!(std::fs::metadata(temp_dir.path().join("events")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_ahead_of_log_is_clamped() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("ahead", temp_dir.path()).await;
        queue.enqueue(Message::new("ahead", "delivered")).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.close().await.unwrap();

        // Last checkpoint claims five deliveries from a one-record log
        let checkpoint_path = temp_dir.path().join("ahead-checkpoint");
        let mut bytes = std::fs::read(&checkpoint_path).unwrap();
        bytes.extend_from_slice(&5u64.to_be_bytes());
        std::fs::write(&checkpoint_path, &bytes).unwrap();

        let mut queue = open("ahead", temp_dir.path()).await;
        assert!(queue.is_empty());
        assert_eq!(queue.checkpoint(), 1);
        queue.enqueue(Message::new("ahead", "fresh")).await.unwrap();
        queue.close().await.unwrap();

        let mut queue = open("ahead", temp_dir.path()).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(payload(queue.dequeue().await.unwrap()), "fresh");
        assert_eq!(queue.checkpoint(), 2);
        assert_eq!(std::fs::metadata(&checkpoint_path).unwrap().len() % 8, 0);
    }

    #[tokio::test]
    async fn test_stale_checkpoint_without_log_is_reset() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("ghost-checkpoint"), 7u64.to_be_bytes()).unwrap();

        let mut queue = open("ghost", temp_dir.path()).await;
        assert_eq!(queue.checkpoint(), 0);
        queue.enqueue(Message::new("ghost", "boo")).await.unwrap();
        queue.close().await.unwrap();

        let queue = open("ghost", temp_dir.path()).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("closed", temp_dir.path()).await;
        queue.enqueue(Message::new("closed", "x")).await.unwrap();
        queue.close().await.unwrap();

        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(Message::new("closed", "y")).await,
            Err(BrokerError::IllegalState(_))
        ));
        assert!(matches!(queue.dequeue().await, Err(BrokerError::IllegalState(_))));
        assert!(matches!(queue.close().await, Err(BrokerError::IllegalState(_))));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_log_cuts_partial_record() {
        let temp_dir = tempdir().unwrap();
        let mut queue = DurableQueue::open_with_sync("partial", temp_dir.path(), false)
            .await
            .unwrap();
        queue.enqueue(Message::new("partial", "kept")).await.unwrap();
        let intact_len = std::fs::metadata(queue.log_path()).unwrap().len();

        // Half of a record left behind by a failed write
        let record = encode_record(&Message::new("partial", "lost")).unwrap();
        let mut bytes = std::fs::read(queue.log_path()).unwrap();
        bytes.extend_from_slice(&record[..record.len() / 2]);
        std::fs::write(queue.log_path(), &bytes).unwrap();

        queue.rollback_log().await;
        assert!(!queue.is_closed());
        assert_eq!(std::fs::metadata(queue.log_path()).unwrap().len(), intact_len);
        assert_eq!(queue.len(), 1);

        queue.enqueue(Message::new("partial", "after")).await.unwrap();
        queue.close().await.unwrap();

        let mut queue = open("partial", temp_dir.path()).await;
        assert_eq!(payload(queue.dequeue().await.unwrap()), "kept");
        assert_eq!(payload(queue.dequeue().await.unwrap()), "after");
    }

    #[tokio::test]
    async fn test_rollback_checkpoint_keeps_records_aligned() {
        let temp_dir = tempdir().unwrap();
        let mut queue = DurableQueue::open_with_sync("aligned", temp_dir.path(), false)
            .await
            .unwrap();
        for payload in ["a", "b", "c"] {
            queue.enqueue(Message::new("aligned", payload)).await.unwrap();
        }
        queue.dequeue().await.unwrap();

        let mut bytes = std::fs::read(queue.checkpoint_path()).unwrap();
        bytes.extend_from_slice(&[0, 0, 0]);
        std::fs::write(queue.checkpoint_path(), &bytes).unwrap();

        queue.rollback_checkpoint().await;
        assert!(!queue.is_closed());
        assert_eq!(std::fs::metadata(queue.checkpoint_path()).unwrap().len(), 8);
        assert_eq!(queue.checkpoint(), 1);

        assert_eq!(payload(queue.dequeue().await.unwrap()), "b");
        assert_eq!(std::fs::metadata(queue.checkpoint_path()).unwrap().len() % 8, 0);
        queue.close().await.unwrap();

        let queue = open("aligned", temp_dir.path()).await;
        assert_eq!(queue.checkpoint(), 2);
        assert_eq!(queue.peek().unwrap().payload_str(), Some("c"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_log_write_leaves_queue_unchanged() {
        let temp_dir = tempdir().unwrap();
        std::os::unix::fs::symlink("/dev/full", temp_dir.path().join("full")).unwrap();

        let mut queue = DurableQueue::open_with_sync("full", temp_dir.path(), false)
            .await
            .unwrap();
        let result = queue.enqueue(Message::new("full", "nowhere")).await;

        assert!(matches!(result, Err(BrokerError::Storage(_))));
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
        // A device cannot be truncated back, so the queue refuses further writes
        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(Message::new("full", "again")).await,
            Err(BrokerError::IllegalState(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_checkpoint_write_keeps_message() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("jobs", temp_dir.path()).await;
        queue.enqueue(Message::new("jobs", "first")).await.unwrap();
        queue.close().await.unwrap();

        let checkpoint_path = temp_dir.path().join("jobs-checkpoint");
        std::fs::remove_file(&checkpoint_path).unwrap();
        std::os::unix::fs::symlink("/dev/full", &checkpoint_path).unwrap();

        let mut queue = DurableQueue::open_with_sync("jobs", temp_dir.path(), false)
            .await
            .unwrap();
        let result = queue.dequeue().await;

        assert!(matches!(result, Err(BrokerError::Storage(_))));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.checkpoint(), 0);
        assert_eq!(queue.peek().unwrap().payload_str(), Some("first"));
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_duplicate_messages_coexist() {
        let temp_dir = tempdir().unwrap();
        let mut queue = open("dups", temp_dir.path()).await;
        queue.enqueue(Message::new("dups", "same")).await.unwrap();
        queue.enqueue(Message::new("dups", "same")).await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_unsynced_queue_still_recovers() {
        let temp_dir = tempdir().unwrap();
        let mut queue = DurableQueue::open_with_sync("fast", temp_dir.path(), false)
            .await
            .unwrap();
        queue.enqueue(Message::new("fast", "x")).await.unwrap();
        queue.close().await.unwrap();

        let queue = open("fast", temp_dir.path()).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let result = DurableQueue::open("../escape", temp_dir.path()).await;
        assert!(matches!(result, Err(BrokerError::InvalidDestination(_))));
    }
}

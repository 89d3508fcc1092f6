//! Durable queues and the registry that shares them between sessions

pub mod durable;
pub mod registry;

use crate::{BrokerError, Result};

pub use durable::{DurableQueue, CHECKPOINT_SUFFIX};
pub use registry::{QueueRegistry, SharedQueue};

/// Longest file name most filesystems accept, in bytes
const MAX_FILE_NAME_LENGTH: usize = 255;

/// Longest destination name accepted, in bytes. The checkpoint file name
/// must still fit within the file name limit.
pub const MAX_DESTINATION_LENGTH: usize = MAX_FILE_NAME_LENGTH - CHECKPOINT_SUFFIX.len();

/// Check that a destination name can be used as a file name in the storage
/// directory without escaping it or colliding with a checkpoint file.
pub fn validate_destination(destination: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(BrokerError::InvalidDestination(format!("{:?} {}", destination, reason)))
    };

    if destination.is_empty() {
        return invalid("is empty");
    }
    if destination.len() > MAX_DESTINATION_LENGTH {
        return invalid("is too long");
    }
    if destination == "." || destination == ".." {
        return invalid("is a relative path");
    }
    if destination.contains(['/', '\\', '\0']) {
        return invalid("contains a path separator");
    }
    if destination.ends_with(CHECKPOINT_SUFFIX) {
        return invalid("collides with checkpoint file names");
    }
    Ok(())
}

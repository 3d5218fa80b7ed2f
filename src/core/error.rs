use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("bucket {bucket} out of range (bucket count {bucket_count})")]
    InvalidBucket { bucket: usize, bucket_count: usize },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("queue writer stopped")]
    WriterStopped,
}

pub type QueueResult<T> = Result<T, QueueError>;

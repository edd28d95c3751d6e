pub mod history;
pub mod queue;

use md5::{Digest, Md5};

// Re-export common types
pub use history::{HistoryError, VisitHistory};
pub use queue::{DurableQueue, ItemStatus, QueueError, QueueItem, QueueStats, MAX_FIND_LIMIT};

/// Two hex characters of the MD5 digest, used to spread keys over 256 tables.
pub(crate) fn shard_of(key: &[u8]) -> String {
    let digest = Md5::digest(key);
    hex::encode(&digest[..1])
}

/// Implements `From` for every redb error family so `?` works inside
/// transaction code. The target enum must have a `Storage(redb::Error)` variant.
macro_rules! redb_error_conversions {
    ($target:ty) => {
        impl From<redb::DatabaseError> for $target {
            fn from(err: redb::DatabaseError) -> Self {
                Self::Storage(err.into())
            }
        }

        impl From<redb::TransactionError> for $target {
            fn from(err: redb::TransactionError) -> Self {
                Self::Storage(err.into())
            }
        }

        impl From<redb::TableError> for $target {
            fn from(err: redb::TableError) -> Self {
                Self::Storage(err.into())
            }
        }

        impl From<redb::StorageError> for $target {
            fn from(err: redb::StorageError) -> Self {
                Self::Storage(err.into())
            }
        }

        impl From<redb::CommitError> for $target {
            fn from(err: redb::CommitError) -> Self {
                Self::Storage(err.into())
            }
        }
    };
}

pub(crate) use redb_error_conversions;

use std::fmt;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::storage::{redb_error_conversions, shard_of};

/// Item records keyed by the big-endian item ID
const ITEMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("items");

/// Single-row table holding the aggregate counters
const STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");
const STATS_KEY: &str = "stats";

/// Upper bound on the number of items a single `find` call returns
pub const MAX_FIND_LIMIT: usize = 1000;

/// Errors raised by the durable queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue '{0}' is closed")]
    Closed(String),

    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("failed to encode queue record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reply status must be acknowledged or invalid, got {0}")]
    InvalidReply(ItemStatus),
}

redb_error_conversions!(QueueError);

/// Lifecycle of a single queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Claimed,
    Invalid,
    Acknowledged,
}

impl ItemStatus {
    /// Whether the item has received its final reply
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Invalid | ItemStatus::Acknowledged)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Claimed => "claimed",
            ItemStatus::Invalid => "invalid",
            ItemStatus::Acknowledged => "acknowledged",
        };
        f.pad(name)
    }
}

/// A stored work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Store-assigned sequential ID (starts at 1)
    pub id: u64,

    /// Opaque payload, unique within the queue
    pub payload: Vec<u8>,

    pub status: ItemStatus,

    /// Error message recorded by an `Invalid` reply
    pub error: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counters, persisted with every item mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// ID of the last item delivered by `get`
    pub current_id: u64,

    /// Items ever inserted
    pub size: u64,

    /// Items delivered by `get`
    pub read_size: u64,

    /// Items that received a terminal reply
    pub ack_size: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueStats {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_id: 0,
            size: 0,
            read_size: 0,
            ack_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unread items
    pub fn depth(&self) -> u64 {
        self.size.saturating_sub(self.read_size)
    }
}

struct QueueHandle {
    db: Database,
    stats: QueueStats,
}

/// FIFO queue over unique payloads, backed by a single redb file.
///
/// Every `put`, `get` and `reply` runs in one write transaction covering the
/// item record, the dedup index and the stats row, so a crash leaves the store
/// at either the pre- or post-operation snapshot. Delivery is at-most-once:
/// an item returned by `get` is never handed out again, even after a restart.
pub struct DurableQueue {
    name: String,
    path: PathBuf,
    handle: RwLock<Option<QueueHandle>>,
}

impl DurableQueue {
    /// Open the queue `<name>.queue.redb` inside `data_dir`, creating it if needed
    pub async fn open(name: &str, data_dir: impl AsRef<Path>) -> Result<Self, QueueError> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;

        let path = data_dir.join(format!("{}.queue.redb", name));
        let db = Database::create(&path)?;
        let stats = Self::load_stats(&db)?;

        info!(
            "Opened queue '{}' at {} (size={}, read={}, acked={})",
            name,
            path.display(),
            stats.size,
            stats.read_size,
            stats.ack_size
        );

        Ok(Self {
            name: name.to_string(),
            path,
            handle: RwLock::new(Some(QueueHandle { db, stats })),
        })
    }

    /// Create the fixed tables and read (or initialise) the stats row
    fn load_stats(db: &Database) -> Result<QueueStats, QueueError> {
        let txn = db.begin_write()?;
        let stats = {
            txn.open_table(ITEMS)?;
            let mut table = txn.open_table(STATS)?;
            let existing = table
                .get(STATS_KEY)?
                .map(|raw| serde_json::from_slice::<QueueStats>(raw.value()))
                .transpose()?;

            match existing {
                Some(stats) => stats,
                None => {
                    let stats = QueueStats::new(Utc::now());
                    table.insert(STATS_KEY, serde_json::to_vec(&stats)?.as_slice())?;
                    stats
                }
            }
        };
        txn.commit()?;

        Ok(stats)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a payload. Returns `false` when the payload is already known.
    pub async fn put(&self, payload: &[u8]) -> Result<bool, QueueError> {
        let mut guard = self.handle.write().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| QueueError::Closed(self.name.clone()))?;

        let now = Utc::now();
        let dedup_name = dedup_table_name(payload);
        let dedup_def: TableDefinition<&[u8], u64> = TableDefinition::new(&dedup_name);
        let mut stats = handle.stats.clone();

        let txn = handle.db.begin_write()?;
        let inserted = {
            let mut dedup = txn.open_table(dedup_def)?;
            if dedup.get(payload)?.is_some() {
                false
            } else {
                let id = stats.size + 1;
                let item = QueueItem {
                    id,
                    payload: payload.to_vec(),
                    status: ItemStatus::Pending,
                    error: String::new(),
                    created_at: now,
                    updated_at: now,
                };

                let mut items = txn.open_table(ITEMS)?;
                items.insert(id.to_be_bytes().as_slice(), serde_json::to_vec(&item)?.as_slice())?;
                dedup.insert(payload, id)?;

                stats.size = id;
                stats.updated_at = now;
                write_stats(&txn, &stats)?;
                true
            }
        };

        if !inserted {
            txn.abort()?;
            debug!("Queue '{}' already holds payload, skipping put", self.name);
            return Ok(false);
        }

        if let Err(e) = txn.commit() {
            error!("Queue '{}' failed to commit put: {}", self.name, e);
            return Err(e.into());
        }
        handle.stats = stats;

        Ok(true)
    }

    /// Claim the next unread payload in insertion order
    pub async fn get(&self) -> Result<Option<Vec<u8>>, QueueError> {
        let mut guard = self.handle.write().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| QueueError::Closed(self.name.clone()))?;

        let now = Utc::now();
        let mut stats = handle.stats.clone();

        let txn = handle.db.begin_write()?;
        let claimed = {
            let mut items = txn.open_table(ITEMS)?;
            let cursor = stats.current_id.to_be_bytes();
            let next = {
                let mut range = items
                    .range::<&[u8]>((Bound::Excluded(cursor.as_slice()), Bound::Unbounded))?;
                match range.next() {
                    Some(entry) => {
                        let (_key, raw) = entry?;
                        Some(serde_json::from_slice::<QueueItem>(raw.value())?)
                    }
                    None => None,
                }
            };

            match next {
                Some(mut item) => {
                    item.status = ItemStatus::Claimed;
                    item.updated_at = now;
                    items.insert(
                        item.id.to_be_bytes().as_slice(),
                        serde_json::to_vec(&item)?.as_slice(),
                    )?;
                    Some(item)
                }
                None => None,
            }
        };

        let Some(item) = claimed else {
            txn.abort()?;
            return Ok(None);
        };

        stats.current_id = item.id;
        stats.read_size += 1;
        stats.updated_at = now;
        write_stats(&txn, &stats)?;
        txn.commit()?;
        handle.stats = stats;

        debug!("Queue '{}' delivered item {}", self.name, item.id);

        Ok(Some(item.payload))
    }

    /// Record the outcome of a claimed payload.
    ///
    /// Returns `false` when the payload was never put. Only the first terminal
    /// reply for an item counts towards `ack_size`.
    pub async fn reply(
        &self,
        payload: &[u8],
        status: ItemStatus,
        message: &str,
    ) -> Result<bool, QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidReply(status));
        }

        let mut guard = self.handle.write().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| QueueError::Closed(self.name.clone()))?;

        let now = Utc::now();
        let dedup_name = dedup_table_name(payload);
        let dedup_def: TableDefinition<&[u8], u64> = TableDefinition::new(&dedup_name);
        let mut stats = handle.stats.clone();

        let txn = handle.db.begin_write()?;
        let replied = {
            let id = txn.open_table(dedup_def)?.get(payload)?.map(|id| id.value());
            match id {
                Some(id) => {
                    let mut items = txn.open_table(ITEMS)?;
                    let existing = items
                        .get(id.to_be_bytes().as_slice())?
                        .map(|raw| serde_json::from_slice::<QueueItem>(raw.value()))
                        .transpose()?;

                    match existing {
                        Some(mut item) => {
                            if !item.status.is_terminal() {
                                stats.ack_size += 1;
                            }
                            item.status = status;
                            item.error = message.to_string();
                            item.updated_at = now;
                            items.insert(
                                id.to_be_bytes().as_slice(),
                                serde_json::to_vec(&item)?.as_slice(),
                            )?;

                            stats.updated_at = now;
                            write_stats(&txn, &stats)?;
                            true
                        }
                        None => false,
                    }
                }
                None => false,
            }
        };

        if !replied {
            txn.abort()?;
            debug!("Queue '{}' ignored reply for unknown payload", self.name);
            return Ok(false);
        }

        txn.commit()?;
        handle.stats = stats;

        Ok(true)
    }

    /// Scan items in ID order. `limit` is clamped to [`MAX_FIND_LIMIT`].
    pub async fn find(&self, offset: usize, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        let guard = self.handle.read().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| QueueError::Closed(self.name.clone()))?;

        let limit = limit.min(MAX_FIND_LIMIT);
        let txn = handle.db.begin_read()?;
        let items = txn.open_table(ITEMS)?;

        let mut found = Vec::with_capacity(limit);
        for entry in items.iter()?.skip(offset).take(limit) {
            let (_key, raw) = entry?;
            found.push(serde_json::from_slice(raw.value())?);
        }

        Ok(found)
    }

    /// Snapshot of the counters
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let guard = self.handle.read().await;
        guard
            .as_ref()
            .map(|handle| handle.stats.clone())
            .ok_or_else(|| QueueError::Closed(self.name.clone()))
    }

    /// Unread items: `max(0, size - read_size)`
    pub async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.stats().await?.depth())
    }

    /// Alias of [`DurableQueue::depth`]
    pub async fn size(&self) -> Result<u64, QueueError> {
        self.depth().await
    }

    pub async fn is_closed(&self) -> bool {
        self.handle.read().await.is_none()
    }

    /// Release the store handle, keeping the file
    pub async fn close(&self) -> Result<(), QueueError> {
        self.exit(false).await
    }

    /// Release the store handle and remove the file
    pub async fn delete(&self) -> Result<(), QueueError> {
        self.exit(true).await
    }

    async fn exit(&self, deleted: bool) -> Result<(), QueueError> {
        let mut guard = self.handle.write().await;
        if guard.take().is_none() {
            return Err(QueueError::Closed(self.name.clone()));
        }

        if !deleted {
            info!("Closed queue '{}'", self.name);
            return Ok(());
        }

        info!("Deleting queue '{}' at {}", self.name, self.path.display());
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn dedup_table_name(payload: &[u8]) -> String {
    format!("dedup-{}", shard_of(payload))
}

fn write_stats(txn: &WriteTransaction, stats: &QueueStats) -> Result<(), QueueError> {
    let mut table = txn.open_table(STATS)?;
    table.insert(STATS_KEY, serde_json::to_vec(stats)?.as_slice())?;
    Ok(())
}

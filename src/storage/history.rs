use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::storage::{redb_error_conversions, shard_of};

/// Marker stored for every visited URL
const VISITED: u8 = 1;

/// Errors raised by the visit history
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history '{0}' is closed")]
    Closed(String),

    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

redb_error_conversions!(HistoryError);

/// Persisted set of URLs that have been processed.
///
/// Kept apart from the queue so a URL stays visited after its queue item is
/// long gone. Entries are sharded into `visited-xx` tables by MD5 prefix and
/// are never removed.
pub struct VisitHistory {
    name: String,
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl VisitHistory {
    /// Open the history `<name>.history.redb` inside `data_dir`
    pub async fn open(name: &str, data_dir: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;

        let path = data_dir.join(format!("{}.history.redb", name));
        let db = Database::create(&path)?;
        info!("Opened visit history '{}' at {}", name, path.display());

        Ok(Self {
            name: name.to_string(),
            path,
            db: RwLock::new(Some(db)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `url` has been recorded
    pub async fn contains(&self, url: &str) -> Result<bool, HistoryError> {
        let guard = self.db.read().await;
        let db = guard
            .as_ref()
            .ok_or_else(|| HistoryError::Closed(self.name.clone()))?;

        let table_name = shard_table_name(url);
        let def: TableDefinition<&str, u8> = TableDefinition::new(&table_name);

        let txn = db.begin_read()?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        Ok(table.get(url)?.is_some())
    }

    /// Record `url` as visited. Returns `false` if it was already present.
    pub async fn record(&self, url: &str) -> Result<bool, HistoryError> {
        let guard = self.db.write().await;
        let db = guard
            .as_ref()
            .ok_or_else(|| HistoryError::Closed(self.name.clone()))?;

        let table_name = shard_table_name(url);
        let def: TableDefinition<&str, u8> = TableDefinition::new(&table_name);

        let txn = db.begin_write()?;
        let inserted = {
            let mut table = txn.open_table(def)?;
            if table.get(url)?.is_some() {
                false
            } else {
                table.insert(url, VISITED)?;
                true
            }
        };

        if inserted {
            txn.commit()?;
            debug!("History '{}' recorded {}", self.name, url);
        } else {
            txn.abort()?;
        }

        Ok(inserted)
    }

    /// Release the store handle, keeping the file
    pub async fn close(&self) -> Result<(), HistoryError> {
        self.exit(false).await
    }

    /// Release the store handle and remove the file
    pub async fn delete(&self) -> Result<(), HistoryError> {
        self.exit(true).await
    }

    async fn exit(&self, deleted: bool) -> Result<(), HistoryError> {
        let mut guard = self.db.write().await;
        if guard.take().is_none() {
            return Err(HistoryError::Closed(self.name.clone()));
        }

        if !deleted {
            info!("Closed visit history '{}'", self.name);
            return Ok(());
        }

        info!("Deleting visit history '{}' at {}", self.name, self.path.display());
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn shard_table_name(url: &str) -> String {
    format!("visited-{}", shard_of(url.as_bytes()))
}

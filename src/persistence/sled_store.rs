//! Persistence layer backed by `sled`
//!
//! Layout:
//! - tree `queues`: queue name -> `QueueRecord` (durable queues only)
//! - tree `queue:<name>`: big-endian id -> `StoredMessage`
//!
//! Message ids come from `Db::generate_id`, which is monotonic across
//! restarts, so a scan of a queue tree yields messages in publish order.
//! Records are removed when the message is acknowledged; a requeue leaves the
//! record alone.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use crate::broker::message::Message;
use crate::utils::Result;

const QUEUES_TREE: &str = "queues";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub name: String,
    pub declared_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub queue: String,
    pub message: Message,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
    queues: Tree,
    sync_writes: bool,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    ///
    /// With `sync_writes` every stored message is flushed to disk before the
    /// call returns.
    pub fn open(path: &str, sync_writes: bool) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db, sync_writes)
    }

    /// A database that lives in memory and is discarded on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, false)
    }

    fn from_db(db: Db, sync_writes: bool) -> Result<Self> {
        let queues = db.open_tree(QUEUES_TREE)?;
        Ok(Self {
            db,
            queues,
            sync_writes,
        })
    }

    /// Record a durable queue declaration. Redeclaring is a no-op.
    pub fn save_queue(&self, name: &str) -> Result<()> {
        if self.queues.contains_key(name)? {
            return Ok(());
        }
        let record = QueueRecord {
            name: name.to_string(),
            declared_at: chrono::Utc::now().timestamp_millis(),
        };
        self.queues.insert(name, serde_json::to_vec(&record)?)?;
        self.maybe_flush()
    }

    /// Names of all recorded durable queues, sorted.
    pub fn durable_queues(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.queues.iter() {
            let (_, value) = entry?;
            let record: QueueRecord = serde_json::from_slice(&value)?;
            names.push(record.name);
        }
        Ok(names)
    }

    /// Store a message at the tail of `queue`, returning its key.
    pub fn store_message(&self, queue: &str, message: &Message) -> Result<u64> {
        let key = self.db.generate_id()?;
        let stored = StoredMessage {
            queue: queue.to_string(),
            message: message.clone(),
        };
        self.queue_tree(queue)?
            .insert(key.to_be_bytes(), serde_json::to_vec(&stored)?)?;
        self.maybe_flush()?;
        Ok(key)
    }

    pub fn remove_message(&self, queue: &str, key: u64) -> Result<()> {
        if self.queue_tree(queue)?.remove(key.to_be_bytes())?.is_none() {
            debug!(queue, key, "stored message already gone");
        }
        Ok(())
    }

    /// All stored messages of `queue` in publish order, with their keys.
    ///
    /// Records that fail to decode are skipped rather than blocking recovery
    /// of the rest of the queue.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<(u64, Message)>> {
        let mut messages = Vec::new();
        for entry in self.queue_tree(queue)?.iter() {
            let (key, value) = entry?;
            let Ok(key) = <[u8; 8]>::try_from(&key[..]) else {
                debug!(queue, "skipping malformed key");
                continue;
            };
            match serde_json::from_slice::<StoredMessage>(&value) {
                Ok(stored) => messages.push((u64::from_be_bytes(key), stored.message)),
                Err(e) => debug!(queue, error = %e, "skipping undecodable record"),
            }
        }
        Ok(messages)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn maybe_flush(&self) -> Result<()> {
        if self.sync_writes {
            self.flush()?;
        }
        Ok(())
    }

    fn queue_tree(&self, queue: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("queue:{queue}"))?)
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

//! Lease-based locks on a document store
//!
//! A lock is an item in a lock table keyed by the locked name. Taking the
//! lock writes the item on condition that no live lease exists; a background
//! heartbeat keeps pushing the expiry forward while the lease is held. A
//! holder that dies simply stops heartbeating and the lease runs out.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::indexing::document::{
    Condition, DocumentStore, DocumentStoreError, Item, LOCK_KEY_ATTRIBUTE,
};

const RECORD_VERSION_ATTRIBUTE: &str = "RecordVersion";
const EXPIRES_AT_ATTRIBUTE: &str = "ExpiresAt";
const HELD_FOR_ATTRIBUTE: &str = "HeldFor";

/// Errors that can occur while taking a lock
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock on {key}")]
    Timeout { key: String, waited: Duration },

    #[error("Failed to acquire lock on {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: DocumentStoreError,
    },
}

/// Lease timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockManagerConfig {
    /// How long a lease lives without a heartbeat
    pub lease: Duration,
    pub heartbeat: Duration,
    /// How long to wait for a held lock before giving up
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self::with_lease(Duration::from_secs(6))
    }
}

impl LockManagerConfig {
    /// Defaults around the given lease duration; heartbeat is a third of it
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease,
            heartbeat: lease / 3,
            acquire_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Hands out leases on keys of one lock table
#[derive(Clone)]
pub struct LeaseLockManager {
    store: Arc<dyn DocumentStore>,
    table: String,
    config: LockManagerConfig,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn lock_item(key: &str, record_version: &str, held_for: &str, lease: Duration) -> Item {
    let expires_at = now_ms() + lease.as_millis() as i64;
    let mut item = Item::new();
    item.insert(LOCK_KEY_ATTRIBUTE.to_string(), json!(key));
    item.insert(RECORD_VERSION_ATTRIBUTE.to_string(), json!(record_version));
    item.insert(HELD_FOR_ATTRIBUTE.to_string(), json!(held_for));
    item.insert(EXPIRES_AT_ATTRIBUTE.to_string(), json!(expires_at));
    item
}

fn same_record(record_version: &str) -> Condition {
    Condition::AttributeEquals(
        RECORD_VERSION_ATTRIBUTE.to_string(),
        Value::String(record_version.to_string()),
    )
}

impl LeaseLockManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        table: impl Into<String>,
        config: LockManagerConfig,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            config,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Create the lock table if needed
    pub async fn ensure_table(&self) -> Result<(), DocumentStoreError> {
        self.store.ensure_table(&self.table, LOCK_KEY_ATTRIBUTE).await
    }

    /// Take the lock on `key`, waiting while someone else holds it
    ///
    /// `held_for` is recorded in the lock item for diagnosis.
    pub async fn acquire(&self, key: &str, held_for: &str) -> Result<Lease, LockError> {
        let record_version = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            let item = lock_item(key, &record_version, held_for, self.config.lease);
            let free = Condition::AttributeNotExistsOrLessThan(
                EXPIRES_AT_ATTRIBUTE.to_string(),
                now_ms(),
            );

            match self.store.put_item(&self.table, item, Some(free)).await {
                Ok(()) => break,
                Err(DocumentStoreError::ConditionCheckFailed) => {
                    let waited = started.elapsed();
                    if waited >= self.config.acquire_timeout {
                        return Err(LockError::Timeout {
                            key: key.to_string(),
                            waited,
                        });
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(source) => {
                    return Err(LockError::Store {
                        key: key.to_string(),
                        source,
                    })
                }
            }
        }

        debug!("Acquired lock {}/{} for {}", self.table, key, held_for);
        let heartbeat = tokio::spawn(heartbeat(
            self.store.clone(),
            self.table.clone(),
            key.to_string(),
            record_version.clone(),
            held_for.to_string(),
            self.config,
        ));

        Ok(Lease {
            store: self.store.clone(),
            table: self.table.clone(),
            key: key.to_string(),
            record_version,
            heartbeat,
        })
    }
}

async fn heartbeat(
    store: Arc<dyn DocumentStore>,
    table: String,
    key: String,
    record_version: String,
    held_for: String,
    config: LockManagerConfig,
) {
    loop {
        tokio::time::sleep(config.heartbeat).await;
        let item = lock_item(&key, &record_version, &held_for, config.lease);
        match store
            .put_item(&table, item, Some(same_record(&record_version)))
            .await
        {
            Ok(()) => {}
            Err(DocumentStoreError::ConditionCheckFailed) => {
                warn!("Lease on {}/{} was lost to another holder", table, key);
                return;
            }
            Err(e) => warn!("Failed to refresh lease on {}/{}: {}", table, key, e),
        }
    }
}

/// A held lock; refreshed in the background until released or dropped
pub struct Lease {
    store: Arc<dyn DocumentStore>,
    table: String,
    key: String,
    record_version: String,
    heartbeat: JoinHandle<()>,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Give the lock back; failures are logged, the lease then just expires
    pub async fn release(self) {
        self.heartbeat.abort();
        let result = self
            .store
            .delete_item(
                &self.table,
                LOCK_KEY_ATTRIBUTE,
                &self.key,
                Some(same_record(&self.record_version)),
            )
            .await;
        match result {
            Ok(()) => debug!("Released lock {}/{}", self.table, self.key),
            Err(DocumentStoreError::ConditionCheckFailed) => warn!(
                "Lock {}/{} was taken over before release",
                self.table, self.key
            ),
            Err(e) => warn!("Failed to release lock {}/{}: {}", self.table, self.key, e),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

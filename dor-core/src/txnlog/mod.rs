//! Append-only transaction log
//!
//! Records object, attribute and data-element changes in strictly
//! increasing timestamp order. Two stores implement [`TransactionQueue`]:
//!
//! - [`FileTransactionQueue`]: one flat file per calendar day plus an index
//! - [`KvTransactionQueue`]: an ordered sled tree keyed by big-endian timestamp
//!
//! [`ConcatenatedTransactionQueue`] reads an old store followed by a new one,
//! which is how a flat-file log is retired after [`migrate_flat_file_log`].

pub mod concatenated;
pub mod file_queue;
pub mod kv_queue;
pub mod migration;
pub mod transaction;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::repository::CloseableIter;

pub use concatenated::ConcatenatedTransactionQueue;
pub use file_queue::FileTransactionQueue;
pub use kv_queue::KvTransactionQueue;
pub use migration::{migrate_flat_file_log, migration_needed};
pub use transaction::{Action, Transaction};

/// Notified synchronously after each append
pub trait TransactionListener: Send + Sync {
    fn transaction_added(&self, txn: &Transaction) -> Result<()>;
}

/// Durable, timestamp-ordered log
pub trait TransactionQueue: Send + Sync {
    /// Append `txn`, bumping its timestamp past the last one if needed.
    /// Returns the timestamp it was stored under.
    fn add_transaction(&self, txn: Transaction) -> Result<i64>;

    /// Timestamp of the newest record, 0 when empty
    fn last_timestamp(&self) -> i64;

    /// Records with a timestamp strictly greater than `since`, oldest first
    fn scanner(&self, since: i64) -> Result<CloseableIter<Transaction>>;

    /// Flush and release the store. Idempotent.
    fn shutdown(&self) -> Result<()>;

    fn add_listener(&self, listener: Arc<dyn TransactionListener>);

    fn remove_listener(&self, listener: &Arc<dyn TransactionListener>);
}

/// Timestamp a record is stored under, given the last one handed out
pub fn next_timestamp(last: i64, requested: i64) -> i64 {
    if requested <= last { last + 1 } else { requested }
}

/// Listener registry shared by the queue implementations
#[derive(Default)]
pub struct Listeners {
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn TransactionListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Listener failures are logged and otherwise ignored
    pub fn notify(&self, txn: &Transaction) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.transaction_added(txn) {
                tracing::error!("transaction listener failed on {}: {}", txn, e);
            }
        }
    }
}

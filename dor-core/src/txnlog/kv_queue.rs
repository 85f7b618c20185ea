//! Ordered key/value transaction queue on sled
//!
//! Keys are 8-byte big-endian timestamps, so sled's byte order is timestamp
//! order; values are the encoded transaction line.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::transaction::Transaction;
use super::{Listeners, TransactionListener, TransactionQueue, next_timestamp};
use crate::error::{RepositoryError, Result};
use crate::repository::CloseableIter;

fn decode_key(key: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| RepositoryError::Serialization(format!("bad transaction key length {}", key.len())))?;
    Ok(i64::from_be_bytes(bytes))
}

fn decode_value(value: &[u8]) -> Result<Transaction> {
    let line = std::str::from_utf8(value)
        .map_err(|e| RepositoryError::Serialization(format!("transaction is not UTF-8: {}", e)))?;
    Transaction::decode(line.trim_end_matches(['\n', '\r']))
}

/// sled-backed transaction queue
pub struct KvTransactionQueue {
    db: sled::Db,
    last_timestamp: Mutex<i64>,
    listeners: Listeners,
    shut_down: AtomicBool,
}

impl KvTransactionQueue {
    /// Open (or create) the queue; the database lives in `<dir>/db`
    pub fn open(dir: &Path) -> Result<Self> {
        let db = sled::open(dir.join("db"))?;
        let last = match db.last()? {
            Some((key, _)) => decode_key(&key)?,
            None => 0,
        };
        tracing::info!("Opened transaction log at {:?} (last timestamp {})", dir, last);
        Ok(Self {
            db,
            last_timestamp: Mutex::new(last),
            listeners: Listeners::default(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl TransactionQueue for KvTransactionQueue {
    fn add_transaction(&self, mut txn: Transaction) -> Result<i64> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database("transaction log is shut down".to_string()));
        }
        {
            let mut last = self.last_timestamp.lock();
            txn.timestamp = next_timestamp(*last, txn.timestamp);
            self.db
                .insert(txn.timestamp.to_be_bytes(), txn.encode().into_bytes())?;
            self.db.flush()?;
            *last = txn.timestamp;
        }
        metrics::counter!("dor_txnlog_appended").increment(1);
        self.listeners.notify(&txn);
        Ok(txn.timestamp)
    }

    fn last_timestamp(&self) -> i64 {
        *self.last_timestamp.lock()
    }

    fn scanner(&self, since: i64) -> Result<CloseableIter<Transaction>> {
        let start = since.max(0).saturating_add(1);
        let iter = self.db.range(start.to_be_bytes()..).map(|item| {
            let (_, value) = item?;
            decode_value(&value)
        });
        Ok(Box::new(iter))
    }

    fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.flush()?;
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) {
        self.listeners.remove(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txnlog::Action;
    use tempfile::TempDir;

    #[test]
    fn test_keys_are_big_endian_timestamps() {
        let tmp = TempDir::new().unwrap();
        let q = KvTransactionQueue::open(tmp.path()).unwrap();
        q.add_transaction(Transaction::new(Action::ObjectAdd, "a", 256)).unwrap();
        let (key, value) = q.db.first().unwrap().unwrap();
        assert_eq!(&*key, &[0, 0, 0, 0, 0, 0, 1, 0]);
        assert!(value.starts_with(b"txn:"));
    }

    #[test]
    fn test_scan_is_strictly_after() {
        let tmp = TempDir::new().unwrap();
        let q = KvTransactionQueue::open(tmp.path()).unwrap();
        for ts in [10, 20, 30] {
            q.add_transaction(Transaction::new(Action::ObjectAdd, "h", ts)).unwrap();
        }
        let seen: Vec<i64> = q
            .scanner(20)
            .unwrap()
            .map(|t| t.unwrap().timestamp)
            .collect();
        assert_eq!(seen, vec![30]);
        assert_eq!(q.scanner(0).unwrap().count(), 3);
    }

    #[test]
    fn test_reopen_keeps_order() {
        let tmp = TempDir::new().unwrap();
        {
            let q = KvTransactionQueue::open(tmp.path()).unwrap();
            q.add_transaction(Transaction::new(Action::ObjectAdd, "h", 100)).unwrap();
            q.shutdown().unwrap();
            assert!(q.add_transaction(Transaction::new(Action::ObjectAdd, "h", 1)).is_err());
        }
        let q = KvTransactionQueue::open(tmp.path()).unwrap();
        assert_eq!(q.last_timestamp(), 100);
        assert_eq!(q.add_transaction(Transaction::new(Action::ObjectDelete, "h", 50)).unwrap(), 101);
        assert_eq!(q.len(), 2);
    }
}

//! Read an old queue followed by a current one as a single log

use std::sync::Arc;

use parking_lot::Mutex;

use super::transaction::Transaction;
use super::{Listeners, TransactionListener, TransactionQueue, next_timestamp};
use crate::error::Result;
use crate::repository::CloseableIter;

/// Appends go to `current`; scans cover `old` then `current`
pub struct ConcatenatedTransactionQueue {
    old: Arc<dyn TransactionQueue>,
    current: Arc<dyn TransactionQueue>,
    old_last: i64,
    append: Mutex<()>,
    listeners: Listeners,
}

impl ConcatenatedTransactionQueue {
    pub fn new(old: Arc<dyn TransactionQueue>, current: Arc<dyn TransactionQueue>) -> Self {
        let old_last = old.last_timestamp();
        Self {
            old,
            current,
            old_last,
            append: Mutex::new(()),
            listeners: Listeners::default(),
        }
    }
}

impl TransactionQueue for ConcatenatedTransactionQueue {
    fn add_transaction(&self, mut txn: Transaction) -> Result<i64> {
        let stored = {
            let _guard = self.append.lock();
            let last = self.old_last.max(self.current.last_timestamp());
            txn.timestamp = next_timestamp(last, txn.timestamp);
            self.current.add_transaction(txn.clone())?
        };
        txn.timestamp = stored;
        self.listeners.notify(&txn);
        Ok(stored)
    }

    fn last_timestamp(&self) -> i64 {
        self.old_last.max(self.current.last_timestamp())
    }

    fn scanner(&self, since: i64) -> Result<CloseableIter<Transaction>> {
        let current = self.current.scanner(since)?;
        if since < self.old_last {
            let old = self.old.scanner(since)?;
            Ok(Box::new(old.chain(current)))
        } else {
            Ok(current)
        }
    }

    fn shutdown(&self) -> Result<()> {
        let old = self.old.shutdown();
        self.current.shutdown()?;
        old
    }

    fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) {
        self.listeners.remove(listener);
    }
}

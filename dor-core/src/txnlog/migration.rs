//! One-shot migration of a flat-file log into the sled store

use std::fs;
use std::path::{Path, PathBuf};

use super::file_queue::FileTransactionQueue;
use super::kv_queue::KvTransactionQueue;
use super::TransactionQueue;
use crate::error::{RepositoryError, Result};

const PROGRESS_EVERY: u64 = 1000;

/// True when `dir` still holds flat-file queue files
pub fn migration_needed(dir: &Path) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "q") {
            return Ok(true);
        }
    }
    Ok(false)
}

fn retired_dir(dir: &Path) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| RepositoryError::Database(format!("cannot migrate {:?}: no directory name", dir)))?;
    let mut retired = name.to_os_string();
    retired.push(".old");
    Ok(dir.with_file_name(retired))
}

/// Move the flat-file log in `dir` aside to `<dir>.old` and copy every record
/// into a new sled store at `dir`. Returns the number of records copied.
///
/// Timestamps are preserved, so readers scanning the new store see the same
/// sequence they saw before.
pub fn migrate_flat_file_log(dir: &Path) -> Result<u64> {
    let old_dir = retired_dir(dir)?;
    if old_dir.exists() {
        return Err(RepositoryError::Database(format!(
            "cannot migrate {:?}: {:?} already exists",
            dir, old_dir
        )));
    }
    tracing::info!("Migrating transaction log {:?} (old files kept in {:?})", dir, old_dir);
    fs::rename(dir, &old_dir)?;
    fs::create_dir_all(dir)?;

    let old = FileTransactionQueue::open(&old_dir)?;
    let new = KvTransactionQueue::open(dir)?;
    let mut copied = 0u64;
    let result = (|| -> Result<()> {
        for txn in old.scanner(0)? {
            new.add_transaction(txn?)?;
            copied += 1;
            if copied % PROGRESS_EVERY == 0 {
                tracing::info!("Migrated {} transactions", copied);
            }
        }
        Ok(())
    })();
    let closed_old = old.shutdown();
    new.shutdown()?;
    result?;
    closed_old?;
    metrics::counter!("dor_txnlog_migrated").increment(copied);
    tracing::info!("Migrated {} transactions into {:?}", copied, dir);
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txnlog::{Action, Transaction};
    use tempfile::TempDir;

    #[test]
    fn test_migration_preserves_records() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("txnlog");
        let expected: Vec<Transaction> = {
            let q = FileTransactionQueue::open(&dir).unwrap();
            q.add_transaction(Transaction::new(Action::ObjectAdd, "a", 0).with_attribute("k", "v"))
                .unwrap();
            q.add_transaction(Transaction::new(Action::DataUpdate, "a", 0).with_data_element("el"))
                .unwrap();
            let all = q.scanner(0).unwrap().collect::<Result<Vec<_>>>().unwrap();
            q.shutdown().unwrap();
            all
        };
        assert!(migration_needed(&dir).unwrap());

        assert_eq!(migrate_flat_file_log(&dir).unwrap(), 3);
        assert!(!migration_needed(&dir).unwrap());
        assert!(tmp.path().join("txnlog.old").is_dir());

        let q = KvTransactionQueue::open(&dir).unwrap();
        let migrated = q.scanner(0).unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(migrated, expected);
    }

    #[test]
    fn test_refuses_when_old_dir_exists() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("log");
        fs::create_dir_all(&dir).unwrap();
        fs::create_dir_all(tmp.path().join("log.old")).unwrap();
        assert!(migrate_flat_file_log(&dir).is_err());
        assert!(!migration_needed(&tmp.path().join("missing")).unwrap());
    }
}

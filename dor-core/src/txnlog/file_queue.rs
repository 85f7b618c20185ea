//! Rotating flat-file transaction queue
//!
//! Layout of the queue directory:
//!
//! ```text
//! lock          present while a process has the queue open
//! index         one "<first timestamp>\t<queue number>\t" line per queue file
//! 20240131.q    records whose timestamps fall on that UTC day
//! ```
//!
//! A new queue file is started when a record's day number exceeds the
//! current file's.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Datelike};
use parking_lot::{Mutex, RwLock};

use super::transaction::{Action, Transaction};
use super::{Listeners, TransactionListener, TransactionQueue, next_timestamp};
use crate::error::{RepositoryError, Result};
use crate::object::now_millis;
use crate::repository::CloseableIter;

const LOCK_FILE: &str = "lock";
const INDEX_FILE: &str = "index";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueFileEntry {
    first_time: i64,
    number: u32,
}

fn queue_file(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("{}.q", number))
}

/// `yyyymmdd` of the UTC day containing `timestamp`
fn queue_number(timestamp: i64) -> Result<u32> {
    let dt = DateTime::from_timestamp_millis(timestamp)
        .ok_or_else(|| RepositoryError::Serialization(format!("timestamp out of range: {}", timestamp)))?;
    Ok(dt.year() as u32 * 10000 + dt.month() * 100 + dt.day())
}

fn read_index(path: &Path) -> Result<Vec<QueueFileEntry>> {
    let mut entries = Vec::new();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let parsed = match (fields.next(), fields.next()) {
            (Some(first), Some(number)) => first.trim().parse::<i64>().ok().zip(number.trim().parse::<u32>().ok()),
            _ => None,
        };
        let (first_time, number) =
            parsed.ok_or_else(|| RepositoryError::Serialization(format!("bad queue index line: {:?}", line)))?;
        entries.push(QueueFileEntry { first_time, number });
    }
    Ok(entries)
}

struct WriterState {
    last_timestamp: i64,
    writer: Option<(u32, BufWriter<File>)>,
}

/// Flat-file transaction queue rotating daily
pub struct FileTransactionQueue {
    dir: PathBuf,
    state: Mutex<WriterState>,
    entries: Arc<RwLock<Vec<QueueFileEntry>>>,
    listeners: Listeners,
    shut_down: AtomicBool,
}

impl FileTransactionQueue {
    /// Open (or create) the queue in `dir`. Fails if another process holds its lock file.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut f) => f.write_all(b"lock")?,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::error!(
                    "lock file {:?} exists; if no other process is using the queue, remove it and retry",
                    lock_path
                );
                return Err(RepositoryError::Database(format!("transaction queue {:?} is locked", dir)));
            }
            Err(e) => return Err(e.into()),
        }

        let entries = match read_index(&dir.join(INDEX_FILE)) {
            Ok(entries) => entries,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(e);
            }
        };
        let queue = Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(WriterState {
                last_timestamp: 0,
                writer: None,
            }),
            entries: Arc::new(RwLock::new(entries)),
            listeners: Listeners::default(),
            shut_down: AtomicBool::new(false),
        };

        if queue.entries.read().is_empty() {
            queue.add_transaction(Transaction::new(Action::Comment, "initial entry", now_millis()))?;
        } else {
            let last = queue.calculate_last_timestamp();
            queue.state.lock().last_timestamp = last;
        }
        tracing::info!("Opened transaction queue at {:?}", dir);
        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// First timestamp of the oldest retained queue file
    pub fn first_timestamp(&self) -> Option<i64> {
        self.entries.read().first().map(|e| e.first_time)
    }

    /// Newest record in the log, never earlier than the newest file's first time
    fn calculate_last_timestamp(&self) -> i64 {
        let entries = self.entries.read().clone();
        let Some(newest) = entries.last().copied() else {
            return 0;
        };
        // The newest file may be empty; fall back to older ones
        let found = entries.iter().rev().find_map(|e| self.last_record_in(e.number));
        found.unwrap_or(0).max(newest.first_time)
    }

    fn last_record_in(&self, number: u32) -> Option<i64> {
        let file = match File::open(queue_file(&self.dir, number)) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("cannot read queue file {}: {}", number, e);
                return None;
            }
        };
        let mut reader = BufReader::new(file);
        let mut last = None;
        loop {
            match Transaction::read_from(&mut reader) {
                Ok(Some(txn)) => last = Some(txn.timestamp),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("error reading queue file {}, stopping at {:?}: {}", number, last, e);
                    break;
                }
            }
        }
        last
    }

    fn start_queue_file(&self, first_time: i64, number: u32) -> Result<()> {
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(INDEX_FILE))?;
        index.write_all(format!("{}\t{}\t\n", first_time, number).as_bytes())?;
        index.flush()?;
        self.entries.write().push(QueueFileEntry { first_time, number });
        tracing::debug!(queue = number, "started new queue file");
        Ok(())
    }
}

impl TransactionQueue for FileTransactionQueue {
    fn add_transaction(&self, mut txn: Transaction) -> Result<i64> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database("transaction queue is shut down".to_string()));
        }
        {
            let mut state = self.state.lock();
            txn.timestamp = next_timestamp(state.last_timestamp, txn.timestamp);
            let number = queue_number(txn.timestamp)?;

            let current = self.entries.read().last().copied();
            if current.is_none_or(|c| number > c.number) {
                if let Some((_, mut w)) = state.writer.take() {
                    w.flush()?;
                }
                self.start_queue_file(txn.timestamp, number)?;
            }
            let target = self.entries.read().last().map_or(number, |e| e.number);

            if state.writer.as_ref().is_none_or(|(n, _)| *n != target) {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(queue_file(&self.dir, target))?;
                state.writer = Some((target, BufWriter::new(file)));
            }
            if let Some((_, writer)) = state.writer.as_mut() {
                txn.write_to(writer)?;
                writer.flush()?;
            }
            state.last_timestamp = txn.timestamp;
        }
        metrics::counter!("dor_txnlog_appended").increment(1);
        self.listeners.notify(&txn);
        Ok(txn.timestamp)
    }

    fn last_timestamp(&self) -> i64 {
        self.state.lock().last_timestamp
    }

    fn scanner(&self, since: i64) -> Result<CloseableIter<Transaction>> {
        let entries = self.entries.read().clone();
        let Some(first) = entries.first() else {
            return Ok(Box::new(std::iter::empty()));
        };
        let start = if since <= 0 {
            *first
        } else {
            match entries.iter().position(|e| e.first_time > since) {
                Some(0) => {
                    return Err(RepositoryError::ReplicationTooFarBehind {
                        requested: since,
                        earliest: first.first_time,
                    });
                }
                Some(i) => entries[i - 1],
                None => entries[entries.len() - 1],
            }
        };
        let reader = BufReader::new(File::open(queue_file(&self.dir, start.number))?);
        Ok(Box::new(QueueScanner {
            dir: self.dir.clone(),
            entries: self.entries.clone(),
            current: start.number,
            reader: Some(reader),
            since,
        }))
    }

    fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some((_, mut writer)) = self.state.lock().writer.take() {
            if let Err(e) = writer.flush() {
                tracing::error!("error flushing transaction queue: {}", e);
            }
        }
        if let Err(e) = fs::remove_file(self.dir.join(LOCK_FILE)) {
            tracing::error!("error removing transaction queue lock file: {}", e);
        }
        tracing::info!("Transaction queue at {:?} shut down", self.dir);
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) {
        self.listeners.remove(listener);
    }
}

impl Drop for FileTransactionQueue {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Reads one queue file after another, skipping records at or before `since`
struct QueueScanner {
    dir: PathBuf,
    entries: Arc<RwLock<Vec<QueueFileEntry>>>,
    current: u32,
    reader: Option<BufReader<File>>,
    since: i64,
}

impl QueueScanner {
    /// Move to the queue file after the current one; false when there is none
    fn advance(&mut self) -> Result<bool> {
        self.reader = None;
        let next = self.entries.read().iter().find(|e| e.number > self.current).copied();
        match next {
            Some(entry) => {
                self.reader = Some(BufReader::new(File::open(queue_file(&self.dir, entry.number))?));
                self.current = entry.number;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Iterator for QueueScanner {
    type Item = Result<Transaction>;

    fn next(&mut self) -> Option<Result<Transaction>> {
        loop {
            let reader = self.reader.as_mut()?;
            match Transaction::read_from(reader) {
                Ok(Some(txn)) if txn.timestamp <= self.since => continue,
                Ok(Some(txn)) => return Some(Ok(txn)),
                Ok(None) => match self.advance() {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => {
                    self.reader = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

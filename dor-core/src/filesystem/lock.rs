//! Readers-writer lock over a repository directory
//!
//! An OS advisory lock on `<root>/lock` coordinates processes. In front of it
//! sits a process-local readers-writer state, so threads of one process share
//! a single OS lock and a thread holding the exclusive lock may re-acquire
//! either mode without deadlocking.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OsLock {
    None,
    Shared,
    Exclusive,
}

struct LockState {
    shared: usize,
    exclusive: usize,
    owner: Option<ThreadId>,
    os: OsLock,
}

pub struct RepositoryLock {
    file: File,
    state: Mutex<LockState>,
    released: Condvar,
}

impl RepositoryLock {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file,
            state: Mutex::new(LockState {
                shared: 0,
                exclusive: 0,
                owner: None,
                os: OsLock::None,
            }),
            released: Condvar::new(),
        })
    }

    pub fn shared(&self) -> Result<SharedGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.exclusive > 0 && state.owner != Some(me) {
            self.released.wait(&mut state);
        }
        if state.os == OsLock::None {
            self.file.lock_shared()?;
            state.os = OsLock::Shared;
        }
        state.shared += 1;
        Ok(SharedGuard { lock: self })
    }

    pub fn exclusive(&self) -> Result<ExclusiveGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            while state.exclusive > 0 || state.shared > 0 {
                self.released.wait(&mut state);
            }
        }
        if state.os != OsLock::Exclusive {
            self.file.lock()?;
            state.os = OsLock::Exclusive;
        }
        state.exclusive += 1;
        state.owner = Some(me);
        Ok(ExclusiveGuard { lock: self })
    }

    fn release(&self, exclusive: bool) {
        let mut state = self.state.lock();
        if exclusive {
            state.exclusive -= 1;
            if state.exclusive == 0 {
                state.owner = None;
            }
        } else {
            state.shared -= 1;
        }
        if state.exclusive == 0 && state.shared == 0 {
            if let Err(e) = self.file.unlock() {
                tracing::warn!("failed to release repository file lock: {}", e);
            }
            state.os = OsLock::None;
        }
        self.released.notify_all();
    }
}

pub struct SharedGuard<'a> {
    lock: &'a RepositoryLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(false);
    }
}

pub struct ExclusiveGuard<'a> {
    lock: &'a RepositoryLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(true);
    }
}

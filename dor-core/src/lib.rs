//! Digital Object Repository core library
//!
//! Core functionality for DOR including:
//! - Object model (digital objects, data elements, attributes)
//! - Query model with a textual codec and a generic evaluator
//! - In-memory repository with attribute indexes
//! - Filesystem repository (one directory per object, XML attribute files)
//! - SQLite repository using rusqlite (WAL mode)
//! - REST-proxy repository talking to `dor-server`
//! - Wrapper layer and the synchronizing repository
//! - Transaction log (flat files or sled) and version publishing

pub mod config;
pub mod encoding;
pub mod error;
pub mod filesystem;
pub mod memory;
pub mod object;
pub mod query;
pub mod repository;
pub mod rest;
pub mod search;
pub mod sqlite_repository;
pub mod syncing;
pub mod txnlog;
pub mod version;
pub mod wrapper;

pub use config::BackendConfig;
pub use error::{RepositoryError, Result};
pub use filesystem::FilesystemRepository;
pub use memory::MemoryRepository;
pub use object::{DataElement, DigitalObject, INTERNAL_CREATED, INTERNAL_MODIFIED, ObjectSnapshot};
pub use query::{BooleanClause, Occur, Query, QueryParams, SortField};
pub use repository::{
    AttributeMap, AttributeUpdates, CloseableIter, Repository, RepositoryExt, SharedRepository, collect_all,
    copy_object,
};
pub use rest::RestRepository;
pub use sqlite_repository::SqliteRepository;
pub use syncing::{SyncIntervalManager, SyncReport, SyncingConfig, SyncingRepository};
pub use txnlog::{
    Action, ConcatenatedTransactionQueue, FileTransactionQueue, KvTransactionQueue, Transaction, TransactionListener,
    TransactionQueue,
};
pub use version::{HandleMinter, TimestampHandleMinter, VersionManager};
pub use wrapper::{Mutation, MutationHook, NoHook, RepositoryWrapper};

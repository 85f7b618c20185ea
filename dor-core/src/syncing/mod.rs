//! Synchronizing repository
//!
//! Wraps a local and a remote repository. Callers use it as an ordinary
//! repository backed by `local`; `sync_now` reconciles the two:
//!
//! - **download**: every pull query is searched on the remote; objects missing
//!   locally are copied in, existing ones are replaced when the remote copy is
//!   strictly newer (by `internal.modified`) and `pulls_overwrite_if_newer` is
//!   set. The newest remote stamp seen is kept as a watermark on a local
//!   config object.
//! - **upload**: every push query is searched locally and each match is
//!   copied to the remote, after which its `internal.sync` marker is cleared
//!   and, if requested, the local copy is deleted.
//!
//! Per-object failures do not stop a phase, and a failed download does not
//! skip the upload. The first error of the pass is returned once both phases
//! are done. The watermark only moves after a download without errors.

pub mod config;
pub mod interval;
pub mod lock_pool;

use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;

use crate::error::{RepositoryError, Result};
use crate::object::{DigitalObject, INTERNAL_MODIFIED, INTERNAL_PREFIX, now_millis};
use crate::query::{Query, QueryParams};
use crate::repository::{
    AttributeMap, AttributeUpdates, CloseableIter, Repository, RepositoryExt, SharedRepository, collect_all,
    copy_object,
};
use crate::wrapper::{Mutation, MutationHook, RepositoryWrapper};

pub use config::{INTERNAL_SYNC, SYNC_ALL_MODIFIED_OBJECTS, SyncingConfig};
pub use interval::SyncIntervalManager;
pub use lock_pool::KeyedMutexPool;

/// Handle of the local object holding sync state
pub const LOCAL_CONFIG_HANDLE: &str = "internal.config";

/// Attribute on the config object: newest `internal.modified` pulled from the remote
pub const GREATEST_MODIFIED_FROM_REMOTE: &str = "greatestModifiedFromRemote";

/// Set to `"true"` on a local object to delete it once it has been pushed
pub const INTERNAL_DELETE_LOCAL_AFTER_SYNC: &str = "internal.deleteLocalAfterSync";

fn modified_of(atts: &AttributeMap) -> Option<i64> {
    atts.get(INTERNAL_MODIFIED).and_then(|m| m.parse().ok())
}

/// Total order on optional modification stamps: a missing stamp is never newer
pub fn is_remote_newer(local: Option<i64>, remote: Option<i64>) -> bool {
    match (local, remote) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(l), Some(r)) => r > l,
    }
}

/// Marks locally mutated objects with `internal.sync=true`
pub struct SyncMarker {
    enabled: Arc<AtomicBool>,
    locks: Arc<KeyedMutexPool>,
}

impl SyncMarker {
    fn needs_mark(mutation: &Mutation<'_>) -> bool {
        match mutation {
            Mutation::ObjectDeleted { .. } => false,
            Mutation::AttributesSet { names, .. } => names.iter().any(|n| *n != INTERNAL_SYNC),
            Mutation::AttributesDeleted { names, .. } => names.iter().any(|n| !n.starts_with(INTERNAL_PREFIX)),
            _ => true,
        }
    }
}

impl MutationHook for SyncMarker {
    fn after(&self, inner: &dyn Repository, mutation: &Mutation<'_>) -> Result<()> {
        let handle = mutation.handle();
        if !self.enabled.load(Ordering::SeqCst) || handle == LOCAL_CONFIG_HANDLE || !Self::needs_mark(mutation) {
            return Ok(());
        }
        let _guard = self.locks.lock(handle);
        inner.set_attribute(handle, None, INTERNAL_SYNC, Some("true"))
    }
}

/// Counts from one `sync_now` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another pass was already running; nothing was done
    pub skipped: bool,
    pub pulled: usize,
    pub pushed: usize,
    pub deleted_locally: usize,
}

struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn keep_first(first: &mut Option<RepositoryError>, e: RepositoryError) {
    metrics::counter!("dor_sync_errors").increment(1);
    if first.is_none() {
        *first = Some(e);
    }
}

/// Repository that reconciles a local store with a remote one
pub struct SyncingRepository {
    local: SharedRepository,
    wrapped: RepositoryWrapper<SyncMarker>,
    remote: SharedRepository,
    config: RwLock<SyncingConfig>,
    sync_all_changes: Arc<AtomicBool>,
    locks: Arc<KeyedMutexPool>,
    syncing: AtomicBool,
    last_sync_time: AtomicI64,
    prior_last_sync_time: AtomicI64,
}

impl SyncingRepository {
    pub fn new(local: SharedRepository, remote: SharedRepository, config: SyncingConfig) -> Result<Self> {
        let locks = Arc::new(KeyedMutexPool::new());
        let sync_all_changes = Arc::new(AtomicBool::new(config.sync_all_changes));
        let wrapped = RepositoryWrapper::new(
            local.clone(),
            SyncMarker {
                enabled: sync_all_changes.clone(),
                locks: locks.clone(),
            },
        );

        let state = local.get_or_create_digital_object(LOCAL_CONFIG_HANDLE)?;
        if state.attribute(GREATEST_MODIFIED_FROM_REMOTE)?.is_none() {
            state.set_attribute(GREATEST_MODIFIED_FROM_REMOTE, "0")?;
        }

        Ok(Self {
            local,
            wrapped,
            remote,
            config: RwLock::new(config),
            sync_all_changes,
            locks,
            syncing: AtomicBool::new(false),
            last_sync_time: AtomicI64::new(0),
            prior_last_sync_time: AtomicI64::new(0),
        })
    }

    pub fn local(&self) -> &SharedRepository {
        &self.local
    }

    pub fn remote(&self) -> &SharedRepository {
        &self.remote
    }

    pub fn config(&self) -> SyncingConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: SyncingConfig) {
        self.sync_all_changes.store(config.sync_all_changes, Ordering::SeqCst);
        *self.config.write() = config;
    }

    pub fn set_sync_all_changes(&self, enabled: bool) {
        self.config.write().set_sync_all_changes(enabled);
        self.sync_all_changes.store(enabled, Ordering::SeqCst);
    }

    /// Persisted watermark: newest `internal.modified` ever pulled from the remote
    pub fn greatest_modified_from_remote(&self) -> Result<i64> {
        Ok(self
            .local
            .attribute(LOCAL_CONFIG_HANDLE, None, GREATEST_MODIFIED_FROM_REMOTE)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Start time (epoch millis) of the last completed pass, 0 if none
    pub fn last_sync_time(&self) -> i64 {
        self.last_sync_time.load(Ordering::SeqCst)
    }

    pub fn prior_last_sync_time(&self) -> i64 {
        self.prior_last_sync_time.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Run one download + upload pass. Returns at once if a pass is already running.
    pub fn sync_now(&self) -> Result<SyncReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sync already in progress, skipping");
            return Ok(SyncReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _reset = ResetOnDrop(&self.syncing);

        let started = now_millis();
        let config = self.config();
        let mut report = SyncReport::default();
        tracing::info!(
            pulls = config.pull_queries.len(),
            pushes = config.push_queries.len(),
            "sync pass started"
        );

        // A failed download does not hold back local changes
        let downloaded = self.download(&config, &mut report);
        if let Err(e) = &downloaded {
            tracing::warn!(error = %e, "download phase failed, uploading anyway");
        }
        let uploaded = self.upload(&config, &mut report);

        self.prior_last_sync_time
            .store(self.last_sync_time.swap(started, Ordering::SeqCst), Ordering::SeqCst);
        tracing::info!(
            pulled = report.pulled,
            pushed = report.pushed,
            deleted_locally = report.deleted_locally,
            "sync pass finished"
        );
        downloaded.and(uploaded)?;
        Ok(report)
    }

    // ─────────────────────────────────────────────────────
    // Download
    // ─────────────────────────────────────────────────────

    fn download(&self, config: &SyncingConfig, report: &mut SyncReport) -> Result<()> {
        let mut watermark = self.greatest_modified_from_remote()?;
        let mut first_error = None;

        for (name, query) in &config.pull_queries {
            tracing::debug!(query = %name, "pulling");
            let handles = match self.remote.search_handles(query, &QueryParams::default()) {
                Ok(handles) => handles,
                Err(e) => {
                    tracing::warn!(query = %name, error = %e, "remote search failed");
                    keep_first(&mut first_error, e);
                    continue;
                }
            };
            for handle in handles {
                let result = handle.and_then(|h| self.pull_one(&h, config, &mut watermark, report));
                if let Err(e) = result {
                    tracing::warn!(query = %name, error = %e, "pull failed");
                    keep_first(&mut first_error, e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        // Only a complete download advances the watermark
        self.local.set_attribute(
            LOCAL_CONFIG_HANDLE,
            None,
            GREATEST_MODIFIED_FROM_REMOTE,
            Some(&watermark.to_string()),
        )
    }

    fn pull_one(
        &self,
        handle: &str,
        config: &SyncingConfig,
        watermark: &mut i64,
        report: &mut SyncReport,
    ) -> Result<()> {
        if handle == LOCAL_CONFIG_HANDLE {
            return Ok(());
        }
        let remote_obj = DigitalObject::new(self.remote.clone(), handle.to_string());
        let remote_modified = modified_of(&remote_obj.attributes()?);
        if let Some(m) = remote_modified {
            *watermark = (*watermark).max(m);
        }

        let _guard = self.locks.lock(handle);
        let copy = if !self.local.verify_object(handle)? {
            self.local.get_or_create_object(handle)?;
            true
        } else if config.pulls_overwrite_if_newer {
            let local_modified = modified_of(&self.local.attributes(handle, None)?);
            is_remote_newer(local_modified, remote_modified)
        } else {
            false
        };
        if copy {
            let local_obj = DigitalObject::new(self.local.clone(), handle.to_string());
            copy_object(&remote_obj, &local_obj)?;
            report.pulled += 1;
            metrics::counter!("dor_sync_objects_pulled").increment(1);
            tracing::debug!(handle = %handle, "pulled");
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Upload
    // ─────────────────────────────────────────────────────

    fn upload(&self, config: &SyncingConfig, report: &mut SyncReport) -> Result<()> {
        let mut first_error = None;
        let mut done = HashSet::new();

        for (name, query) in &config.push_queries {
            tracing::debug!(query = %name, "pushing");
            // Pushing may delete local objects, so finish the search first
            let handles = match self
                .local
                .search_handles(query, &QueryParams::default())
                .and_then(collect_all)
            {
                Ok(handles) => handles,
                Err(e) => {
                    tracing::warn!(query = %name, error = %e, "local search failed");
                    keep_first(&mut first_error, e);
                    continue;
                }
            };
            for handle in handles {
                if handle == LOCAL_CONFIG_HANDLE || !done.insert(handle.clone()) {
                    continue;
                }
                if let Err(e) = self.push_one(&handle, report) {
                    tracing::warn!(handle = %handle, error = %e, "push failed");
                    keep_first(&mut first_error, e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn push_one(&self, handle: &str, report: &mut SyncReport) -> Result<()> {
        let _guard = self.locks.lock(handle);
        if !self.local.verify_object(handle)? {
            return Ok(());
        }
        let local_obj = DigitalObject::new(self.local.clone(), handle.to_string());
        let mut atts = local_obj.attributes()?;
        let marked = atts.remove(INTERNAL_SYNC).is_some();
        let local_modified = modified_of(&atts);

        if !marked {
            if let Some(remote_obj) = self.remote.get_digital_object(handle)? {
                if local_modified.is_some() && modified_of(&remote_obj.attributes()?) == local_modified {
                    tracing::trace!(handle = %handle, "remote copy is current");
                    return self.finish_push(handle, &atts, report);
                }
            }
        }

        let remote_obj = self.remote.get_or_create_digital_object(handle)?;
        let local_elements = local_obj.list_data_element_names()?;
        for name in &local_elements {
            let src = local_obj.data_element(name);
            let dst = remote_obj.get_or_create_data_element(name)?;
            let src_atts = src.attributes()?;
            let mut updates: AttributeUpdates = dst
                .attributes()?
                .into_keys()
                .filter(|k| !src_atts.contains_key(k))
                .map(|k| (k, None))
                .collect();
            updates.extend(src_atts.into_iter().map(|(k, v)| (k, Some(v))));
            if !updates.is_empty() {
                self.remote.set_attributes(handle, Some(name), &updates)?;
            }
            let mut reader = src.read()?;
            dst.write(&mut reader, false)?;
        }
        for name in remote_obj.list_data_element_names()? {
            if !local_elements.contains(&name) {
                remote_obj.delete_data_element(&name)?;
            }
        }

        let mut updates: AttributeUpdates = remote_obj
            .attributes()?
            .into_keys()
            .filter(|k| !atts.contains_key(k))
            .map(|k| (k, None))
            .collect();
        updates.extend(atts.iter().map(|(k, v)| (k.clone(), Some(v.clone()))));
        self.remote.set_attributes(handle, None, &updates)?;

        if marked {
            // Clear the marker without moving the stamp the remote now carries
            let mut clear = AttributeUpdates::new();
            clear.insert(INTERNAL_SYNC.to_string(), None);
            if let Some(m) = atts.get(INTERNAL_MODIFIED) {
                clear.insert(INTERNAL_MODIFIED.to_string(), Some(m.clone()));
            }
            self.local.set_attributes(handle, None, &clear)?;
        }
        report.pushed += 1;
        metrics::counter!("dor_sync_objects_pushed").increment(1);
        tracing::debug!(handle = %handle, "pushed");
        self.finish_push(handle, &atts, report)
    }

    fn finish_push(&self, handle: &str, atts: &AttributeMap, report: &mut SyncReport) -> Result<()> {
        if atts.get(INTERNAL_DELETE_LOCAL_AFTER_SYNC).map(String::as_str) == Some("true") {
            self.local.delete_object(handle)?;
            report.deleted_locally += 1;
            tracing::debug!(handle = %handle, "deleted local copy after sync");
        }
        Ok(())
    }
}

impl Repository for SyncingRepository {
    fn verify_object(&self, handle: &str) -> Result<bool> {
        self.wrapped.verify_object(handle)
    }

    fn create_object(&self, handle: Option<&str>) -> Result<String> {
        self.wrapped.create_object(handle)
    }

    fn delete_object(&self, handle: &str) -> Result<()> {
        self.wrapped.delete_object(handle)
    }

    fn list_handles(&self) -> Result<CloseableIter<String>> {
        self.wrapped.list_handles()
    }

    fn search_handles(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<String>> {
        self.wrapped.search_handles(query, params)
    }

    fn attributes(&self, handle: &str, element: Option<&str>) -> Result<AttributeMap> {
        self.wrapped.attributes(handle, element)
    }

    fn attribute(&self, handle: &str, element: Option<&str>, name: &str) -> Result<Option<String>> {
        self.wrapped.attribute(handle, element, name)
    }

    fn set_attributes(&self, handle: &str, element: Option<&str>, updates: &AttributeUpdates) -> Result<()> {
        self.wrapped.set_attributes(handle, element, updates)
    }

    fn verify_element(&self, handle: &str, name: &str) -> Result<bool> {
        self.wrapped.verify_element(handle, name)
    }

    fn create_element(&self, handle: &str, name: &str) -> Result<()> {
        self.wrapped.create_element(handle, name)
    }

    fn delete_element(&self, handle: &str, name: &str) -> Result<()> {
        self.wrapped.delete_element(handle, name)
    }

    fn list_elements(&self, handle: &str) -> Result<Vec<String>> {
        self.wrapped.list_elements(handle)
    }

    fn read_element(&self, handle: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        self.wrapped.read_element(handle, name)
    }

    fn write_element(&self, handle: &str, name: &str, data: &mut dyn Read, append: bool) -> Result<u64> {
        self.wrapped.write_element(handle, name, data, append)
    }

    fn element_size(&self, handle: &str, name: &str) -> Result<u64> {
        self.wrapped.element_size(handle, name)
    }

    fn close(&self) -> Result<()> {
        self.local.close()?;
        self.remote.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;

    fn pair() -> (SharedRepository, SharedRepository) {
        (Arc::new(MemoryRepository::new()), Arc::new(MemoryRepository::new()))
    }

    #[test]
    fn test_is_remote_newer_order() {
        assert!(!is_remote_newer(None, None));
        assert!(!is_remote_newer(Some(5), None));
        assert!(is_remote_newer(None, Some(5)));
        assert!(is_remote_newer(Some(5), Some(6)));
        assert!(!is_remote_newer(Some(6), Some(6)));
    }

    #[test]
    fn test_constructor_initializes_watermark() {
        let (local, remote) = pair();
        let repo = SyncingRepository::new(local.clone(), remote, SyncingConfig::default()).unwrap();
        assert_eq!(repo.greatest_modified_from_remote().unwrap(), 0);
        assert_eq!(
            local
                .attribute(LOCAL_CONFIG_HANDLE, None, GREATEST_MODIFIED_FROM_REMOTE)
                .unwrap()
                .as_deref(),
            Some("0")
        );
    }

    #[test]
    fn test_marker_skips_itself_and_internal_deletes() {
        let (local, remote) = pair();
        let mut config = SyncingConfig::default();
        config.set_sync_all_changes(true);
        let repo = SyncingRepository::new(local.clone(), remote, config).unwrap();

        local.create_object(Some("h")).unwrap();
        local.set_attribute("h", None, "internal.note", Some("x")).unwrap();
        repo.delete_attributes("h", None, &["internal.note"]).unwrap();
        assert_eq!(local.attribute("h", None, INTERNAL_SYNC).unwrap(), None);

        repo.set_attribute("h", None, "title", Some("t")).unwrap();
        assert_eq!(local.attribute("h", None, INTERNAL_SYNC).unwrap().as_deref(), Some("true"));
    }

    #[test]
    fn test_busy_pass_is_skipped() {
        let (local, remote) = pair();
        let repo = SyncingRepository::new(local, remote, SyncingConfig::default()).unwrap();
        repo.syncing.store(true, Ordering::SeqCst);
        assert!(repo.sync_now().unwrap().skipped);
        repo.syncing.store(false, Ordering::SeqCst);
        let report = repo.sync_now().unwrap();
        assert!(!report.skipped);
        assert!(!repo.is_syncing());
        assert!(repo.last_sync_time() > 0);
    }
}

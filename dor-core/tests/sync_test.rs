//! Synchronizing repository scenarios over two in-memory stores

use std::sync::Arc;

use dor_core::syncing::{INTERNAL_DELETE_LOCAL_AFTER_SYNC, INTERNAL_SYNC};
use dor_core::{
    INTERNAL_MODIFIED, MemoryRepository, Mutation, MutationHook, Query, Repository, RepositoryError, RepositoryExt,
    RepositoryWrapper, SharedRepository, SyncingConfig, SyncingRepository,
};

fn stores() -> (SharedRepository, SharedRepository) {
    (Arc::new(MemoryRepository::new()), Arc::new(MemoryRepository::new()))
}

/// Fails every attribute write on one handle, after the inner write lands
struct FailOn(&'static str);

impl MutationHook for FailOn {
    fn after(&self, _inner: &dyn Repository, mutation: &Mutation<'_>) -> dor_core::Result<()> {
        if mutation.handle() == self.0 && matches!(mutation, Mutation::AttributesSet { .. }) {
            return Err(RepositoryError::Database(format!("write to {} rejected", self.0)));
        }
        Ok(())
    }
}

fn failing_on(handle: &'static str) -> (SharedRepository, SharedRepository) {
    let inner: SharedRepository = Arc::new(MemoryRepository::new());
    (inner.clone(), Arc::new(RepositoryWrapper::new(inner, FailOn(handle))))
}

fn pull_all() -> SyncingConfig {
    let mut config = SyncingConfig::default();
    config.add_pull_query("all", Query::attribute("type", "doc"));
    config
}

#[test]
fn test_pull_overwrites_older_local_copy() {
    let (local, remote) = stores();

    let l = local.create_digital_object(Some("x")).unwrap();
    l.set_attribute("type", "doc").unwrap();
    l.set_attribute("title", "old").unwrap();
    l.set_attribute(INTERNAL_MODIFIED, "100").unwrap();

    let r = remote.create_digital_object(Some("x")).unwrap();
    r.set_attribute("type", "doc").unwrap();
    r.set_attribute("title", "new").unwrap();
    r.create_data_element("content").unwrap().write_bytes(b"remote bytes").unwrap();
    r.set_attribute(INTERNAL_MODIFIED, "200").unwrap();

    let repo = SyncingRepository::new(local.clone(), remote.clone(), pull_all()).unwrap();
    let report = repo.sync_now().unwrap();
    assert_eq!(report.pulled, 1);

    let mut local_atts = l.attributes().unwrap();
    local_atts.remove(INTERNAL_SYNC);
    assert_eq!(local_atts, r.attributes().unwrap());
    assert_eq!(l.data_element("content").read_to_vec().unwrap(), b"remote bytes");
    assert!(repo.greatest_modified_from_remote().unwrap() >= 200);
}

#[test]
fn test_pull_keeps_newer_local_copy() {
    let (local, remote) = stores();
    let l = local.create_digital_object(Some("x")).unwrap();
    l.set_attribute("type", "doc").unwrap();
    l.set_attribute(INTERNAL_MODIFIED, "300").unwrap();
    let r = remote.create_digital_object(Some("x")).unwrap();
    r.set_attribute("type", "doc").unwrap();
    r.set_attribute("title", "remote").unwrap();
    r.set_attribute(INTERNAL_MODIFIED, "200").unwrap();

    let repo = SyncingRepository::new(local, remote, pull_all()).unwrap();
    assert_eq!(repo.sync_now().unwrap().pulled, 0);
    assert_eq!(l.attribute("title").unwrap(), None);
    assert_eq!(repo.greatest_modified_from_remote().unwrap(), 200);
}

#[test]
fn test_second_pass_is_a_no_op() {
    let (local, remote) = stores();
    for h in ["a", "b"] {
        let r = remote.create_digital_object(Some(h)).unwrap();
        r.set_attribute("type", "doc").unwrap();
        r.create_data_element("content").unwrap().write_bytes(h.as_bytes()).unwrap();
    }
    let mut config = pull_all();
    config.add_push_query("docs", Query::attribute("type", "doc"));
    config.set_sync_all_changes(true);

    let repo = SyncingRepository::new(local, remote, config).unwrap();
    let first = repo.sync_now().unwrap();
    assert_eq!(first.pulled, 2);

    let second = repo.sync_now().unwrap();
    assert_eq!((second.pulled, second.pushed, second.deleted_locally), (0, 0, 0));
    assert!(repo.prior_last_sync_time() > 0);
    assert!(repo.last_sync_time() >= repo.prior_last_sync_time());
}

#[test]
fn test_sync_all_changes_pushes_marked_objects() {
    let (local, remote) = stores();
    let mut config = SyncingConfig::default();
    config.set_sync_all_changes(true);
    let repo = Arc::new(SyncingRepository::new(local.clone(), remote.clone(), config).unwrap());
    let shared: SharedRepository = repo.clone();

    let obj = shared.create_digital_object(Some("note")).unwrap();
    obj.set_attribute("title", "draft").unwrap();
    obj.create_data_element("body").unwrap().write_bytes(b"text").unwrap();
    assert_eq!(local.attribute("note", None, INTERNAL_SYNC).unwrap().as_deref(), Some("true"));

    let report = repo.sync_now().unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(local.attribute("note", None, INTERNAL_SYNC).unwrap(), None);

    let pushed = remote.get_digital_object("note").unwrap().unwrap();
    assert_eq!(pushed.attribute("title").unwrap().as_deref(), Some("draft"));
    assert_eq!(pushed.attribute(INTERNAL_SYNC).unwrap(), None);
    assert_eq!(pushed.data_element("body").read_to_vec().unwrap(), b"text");
    assert_eq!(pushed.attribute(INTERNAL_MODIFIED).unwrap(), obj.attribute(INTERNAL_MODIFIED).unwrap());

    // Nothing changed since, so nothing is pushed
    assert_eq!(repo.sync_now().unwrap().pushed, 0);
}

#[test]
fn test_push_removes_elements_deleted_locally() {
    let (local, remote) = stores();
    let mut config = SyncingConfig::default();
    config.set_sync_all_changes(true);
    let repo = Arc::new(SyncingRepository::new(local, remote.clone(), config).unwrap());
    let shared: SharedRepository = repo.clone();

    let obj = shared.create_digital_object(Some("h")).unwrap();
    obj.create_data_element("keep").unwrap();
    obj.create_data_element("drop").unwrap();
    repo.sync_now().unwrap();
    assert_eq!(remote.list_elements("h").unwrap().len(), 2);

    obj.delete_data_element("drop").unwrap();
    repo.sync_now().unwrap();
    assert_eq!(remote.list_elements("h").unwrap(), vec!["keep".to_string()]);
}

#[test]
fn test_delete_local_after_sync() {
    let (local, remote) = stores();
    let mut config = SyncingConfig::default();
    config.add_push_query("outbox", Query::attribute("outbox", "yes"));
    let repo = SyncingRepository::new(local.clone(), remote.clone(), config).unwrap();

    let obj = local.create_digital_object(Some("msg")).unwrap();
    obj.set_attribute("outbox", "yes").unwrap();
    obj.set_attribute(INTERNAL_DELETE_LOCAL_AFTER_SYNC, "true").unwrap();

    let report = repo.sync_now().unwrap();
    assert_eq!((report.pushed, report.deleted_locally), (1, 1));
    assert!(!local.verify_object("msg").unwrap());
    assert!(remote.verify_object("msg").unwrap());
}

#[test]
fn test_marker_not_set_when_disabled() {
    let (local, remote) = stores();
    let repo = Arc::new(SyncingRepository::new(local.clone(), remote, SyncingConfig::default()).unwrap());
    let shared: SharedRepository = repo.clone();
    shared.create_digital_object(Some("h")).unwrap().set_attribute("k", "v").unwrap();
    assert_eq!(local.attribute("h", None, INTERNAL_SYNC).unwrap(), None);

    repo.set_sync_all_changes(true);
    shared.set_attribute("h", None, "k", Some("w")).unwrap();
    assert_eq!(local.attribute("h", None, INTERNAL_SYNC).unwrap().as_deref(), Some("true"));
    assert!(repo.config().push_queries.contains_key(dor_core::syncing::SYNC_ALL_MODIFIED_OBJECTS));
}

#[test]
fn test_upload_runs_after_failed_download() {
    let (local, remote) = stores();
    let mut config = SyncingConfig::default();
    config.add_pull_query("broken", Query::Raw("not supported".into()));
    config.set_sync_all_changes(true);
    let repo = Arc::new(SyncingRepository::new(local.clone(), remote.clone(), config).unwrap());
    let shared: SharedRepository = repo.clone();
    shared.create_digital_object(Some("p")).unwrap().set_attribute("title", "kept").unwrap();

    let err = repo.sync_now().unwrap_err();
    assert!(matches!(err, RepositoryError::UnsupportedQuery(_)), "{err}");
    assert_eq!(remote.attribute("p", None, "title").unwrap().as_deref(), Some("kept"));
    assert_eq!(local.attribute("p", None, INTERNAL_SYNC).unwrap(), None);
    assert_eq!(repo.greatest_modified_from_remote().unwrap(), 0);
}

#[test]
fn test_failed_pull_does_not_stop_others() {
    let (local_inner, local) = failing_on("bad");
    let (_, remote) = stores();
    for h in ["a", "bad", "c"] {
        let r = remote.create_digital_object(Some(h)).unwrap();
        r.set_attribute("type", "doc").unwrap();
        r.set_attribute(INTERNAL_MODIFIED, "500").unwrap();
    }

    let repo = SyncingRepository::new(local, remote, pull_all()).unwrap();
    let err = repo.sync_now().unwrap_err();
    assert!(err.to_string().contains("write to bad rejected"), "{err}");
    assert!(local_inner.verify_object("a").unwrap());
    assert!(local_inner.verify_object("c").unwrap());
    assert_eq!(local_inner.attribute("c", None, "type").unwrap().as_deref(), Some("doc"));
    // An incomplete download leaves the watermark alone
    assert_eq!(repo.greatest_modified_from_remote().unwrap(), 0);

    // Once the failure clears the next pass completes and moves it
    let retry = SyncingRepository::new(local_inner.clone(), repo.remote().clone(), pull_all()).unwrap();
    retry.sync_now().unwrap();
    assert_eq!(retry.greatest_modified_from_remote().unwrap(), 500);
}

#[test]
fn test_failed_push_reports_first_error() {
    let (local, _) = stores();
    let (remote_inner, remote) = failing_on("bad");
    for h in ["n1", "bad", "n2"] {
        local.create_digital_object(Some(h)).unwrap().set_attribute("type", "note").unwrap();
    }
    let mut config = SyncingConfig::default();
    config.add_push_query("notes", Query::attribute("type", "note"));

    let repo = SyncingRepository::new(local, remote, config).unwrap();
    let err = repo.sync_now().unwrap_err();
    assert!(matches!(&err, RepositoryError::Database(m) if m == "write to bad rejected"), "{err}");
    for h in ["n1", "n2"] {
        assert_eq!(remote_inner.attribute(h, None, "type").unwrap().as_deref(), Some("note"));
    }
}

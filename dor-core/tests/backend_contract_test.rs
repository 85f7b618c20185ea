//! Behaviour every backend must share
//!
//! Each check runs against the memory, filesystem and SQLite backends.

use std::sync::Arc;

use dor_core::{
    FilesystemRepository, INTERNAL_CREATED, INTERNAL_MODIFIED, MemoryRepository, Query, QueryParams, Repository,
    RepositoryError, RepositoryExt, SharedRepository, SortField, SqliteRepository, collect_all,
};
use proptest::prelude::*;
use tempfile::TempDir;

struct Backend {
    name: &'static str,
    repo: SharedRepository,
    _dir: Option<TempDir>,
}

fn backends() -> Vec<Backend> {
    let fs_dir = TempDir::new().unwrap();
    let sql_dir = TempDir::new().unwrap();
    vec![
        Backend {
            name: "memory",
            repo: Arc::new(MemoryRepository::new()),
            _dir: None,
        },
        Backend {
            name: "filesystem",
            repo: Arc::new(FilesystemRepository::open(fs_dir.path()).unwrap()),
            _dir: Some(fs_dir),
        },
        Backend {
            name: "sqlite",
            repo: Arc::new(SqliteRepository::open_dir(sql_dir.path()).unwrap()),
            _dir: Some(sql_dir),
        },
    ]
}

fn modified(repo: &SharedRepository, handle: &str) -> i64 {
    repo.attribute(handle, None, INTERNAL_MODIFIED)
        .unwrap()
        .expect("internal.modified is always present")
        .parse()
        .unwrap()
}

fn handles(repo: &SharedRepository, query: &Query, params: &QueryParams) -> Vec<String> {
    collect_all(repo.search_handles(query, params).unwrap()).unwrap()
}

#[test]
fn test_create_and_delete_errors() {
    for b in backends() {
        let repo = &b.repo;
        repo.create_object(Some("a/b")).unwrap();
        assert!(repo.verify_object("a/b").unwrap(), "{}", b.name);
        assert!(
            matches!(repo.create_object(Some("a/b")), Err(RepositoryError::ObjectExists(_))),
            "{}",
            b.name
        );
        repo.get_or_create_object("a/b").unwrap();

        let minted = repo.create_object(None).unwrap();
        assert_ne!(minted, "a/b");

        repo.delete_object("a/b").unwrap();
        assert!(!repo.verify_object("a/b").unwrap());
        assert!(repo.delete_object("a/b").unwrap_err().is_not_found(), "{}", b.name);
        assert!(repo.get_digital_object("a/b").unwrap().is_none());
    }
}

#[test]
fn test_bookkeeping_attributes() {
    for b in backends() {
        let obj = b.repo.create_digital_object(Some("h")).unwrap();
        let atts = obj.attributes().unwrap();
        assert!(atts.contains_key(INTERNAL_CREATED), "{}", b.name);
        assert!(atts.contains_key(INTERNAL_MODIFIED), "{}", b.name);
    }
}

#[test]
fn test_modified_strictly_increases() {
    for b in backends() {
        let repo = &b.repo;
        let obj = repo.create_digital_object(Some("h")).unwrap();
        let mut last = modified(repo, "h");
        let mut step = |what: &str| {
            let now = modified(repo, "h");
            assert!(now > last, "{}: {} did not bump internal.modified", b.name, what);
            last = now;
        };

        obj.set_attribute("k", "v").unwrap();
        step("set");
        obj.delete_attribute("k").unwrap();
        step("delete");
        let el = obj.create_data_element("content").unwrap();
        step("create element");
        el.write_bytes(b"payload").unwrap();
        step("write element");
        el.set_attribute("mimetype", "text/plain").unwrap();
        step("element attribute");
        obj.delete_data_element("content").unwrap();
        step("delete element");

        // Bookkeeping writes keep their stamp
        obj.set_attribute(INTERNAL_MODIFIED, "5").unwrap();
        assert_eq!(modified(repo, "h"), 5, "{}", b.name);
    }
}

#[test]
fn test_elements_and_payloads() {
    for b in backends() {
        let obj = b.repo.create_digital_object(Some("h")).unwrap();
        let el = obj.create_data_element("content").unwrap();
        assert!(obj.create_data_element("content").unwrap_err().is_already_exists(), "{}", b.name);

        el.write_bytes(b"hello").unwrap();
        el.write(&mut &b" world"[..], true).unwrap();
        assert_eq!(el.read_to_vec().unwrap(), b"hello world", "{}", b.name);
        assert_eq!(el.size().unwrap(), 11);
        el.write(&mut &b"new"[..], false).unwrap();
        assert_eq!(el.read_to_vec().unwrap(), b"new", "{}", b.name);

        obj.create_data_element("other").unwrap();
        let mut names = obj.list_data_element_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["content", "other"], "{}", b.name);

        el.delete().unwrap();
        assert!(!obj.verify_data_element("content").unwrap());
        assert!(obj.data_element("content").read().is_err(), "{}", b.name);
    }
}

#[test]
fn test_attribute_search_scenario() {
    for b in backends() {
        let obj = b.repo.create_digital_object(Some("h1")).unwrap();
        obj.set_attribute("type", "doc").unwrap();
        let query = Query::attribute("type", "doc");
        assert_eq!(handles(&b.repo, &query, &QueryParams::default()), vec!["h1"], "{}", b.name);
        obj.delete_attribute("type").unwrap();
        assert!(handles(&b.repo, &query, &QueryParams::default()).is_empty(), "{}", b.name);
    }
}

#[test]
fn test_element_attribute_search() {
    for b in backends() {
        let obj = b.repo.create_digital_object(Some("h1")).unwrap();
        obj.create_data_element("content")
            .unwrap()
            .set_attribute("mimetype", "image/png")
            .unwrap();
        b.repo.create_object(Some("h2")).unwrap();
        let query = Query::element_attribute("content", "mimetype", "image/png");
        assert_eq!(handles(&b.repo, &query, &QueryParams::default()), vec!["h1"], "{}", b.name);
    }
}

#[test]
fn test_sort_and_page() {
    for b in backends() {
        for (h, rank) in [("a", "2"), ("b", "3"), ("c", "1"), ("d", "4")] {
            b.repo.create_digital_object(Some(h)).unwrap().set_attribute("rank", rank).unwrap();
        }
        let all = Query::MatchAll;
        assert_eq!(handles(&b.repo, &all, &QueryParams::default()), vec!["a", "b", "c", "d"], "{}", b.name);

        let first = QueryParams::page(0, 2).sorted_by(SortField::descending("rank"));
        assert_eq!(handles(&b.repo, &all, &first), vec!["d", "b"], "{}", b.name);
        let second = QueryParams::page(1, 2).sorted_by(SortField::descending("rank"));
        assert_eq!(handles(&b.repo, &all, &second), vec!["a", "c"], "{}", b.name);
    }
}

#[test]
fn test_close_is_idempotent() {
    for b in backends() {
        b.repo.create_object(Some("h")).unwrap();
        b.repo.close().unwrap();
        b.repo.close().unwrap();
    }
}

#[test]
fn test_filesystem_reopen_scenario() {
    let tmp = TempDir::new().unwrap();
    {
        let repo: SharedRepository = Arc::new(FilesystemRepository::open(tmp.path()).unwrap());
        repo.create_digital_object(Some("a/b"))
            .unwrap()
            .set_attribute("title", "Hello")
            .unwrap();
        repo.close().unwrap();
    }
    let repo: SharedRepository = Arc::new(FilesystemRepository::open(tmp.path()).unwrap());
    assert_eq!(repo.attribute("a/b", None, "title").unwrap().as_deref(), Some("Hello"));
}

#[test]
fn test_sqlite_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let repo: SharedRepository = Arc::new(SqliteRepository::open_dir(tmp.path()).unwrap());
        let obj = repo.create_digital_object(Some("x")).unwrap();
        obj.create_data_element("el").unwrap().write_bytes(b"bytes").unwrap();
        repo.close().unwrap();
    }
    let repo: SharedRepository = Arc::new(SqliteRepository::open_dir(tmp.path()).unwrap());
    let obj = repo.get_digital_object("x").unwrap().unwrap();
    assert_eq!(obj.data_element("el").read_to_vec().unwrap(), b"bytes");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_attribute_round_trip(
        name in "[a-zA-Z][a-zA-Z0-9._-]{0,12}",
        value in "[ -~]{0,24}",
    ) {
        prop_assume!(!name.starts_with("internal."));
        for b in backends() {
            let obj = b.repo.create_digital_object(Some("h")).unwrap();
            obj.set_attribute(&name, &value).unwrap();
            prop_assert_eq!(obj.attribute(&name).unwrap(), Some(value.clone()), "{}", b.name);
            b.repo.set_attribute("h", None, &name, None).unwrap();
            prop_assert_eq!(obj.attribute(&name).unwrap(), None, "{}", b.name);
        }
    }
}

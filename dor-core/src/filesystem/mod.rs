//! Filesystem repository
//!
//! One directory per object under the repository root, named with the
//! reversible `%XX` encoding. Each directory holds an `attributes` XML file
//! with the object's and its elements' attributes, plus one payload file per
//! data element. Every attribute change rewrites the whole `attributes` file,
//! which keeps the on-disk format trivially portable at the cost of write
//! throughput.
//!
//! ```text
//! root/
//!   lock
//!   a%2Fb/
//!     attributes
//!     content
//! ```

pub mod lock;
pub mod xml;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::encoding::{decode_file_name, encode_file_name};
use crate::error::{RepositoryError, Result};
use crate::object::{
    ElementSnapshot, INTERNAL_CREATED, INTERNAL_MODIFIED, ObjectSnapshot, now_millis, refreshes_modified,
};
use crate::query::{Query, QueryParams};
use crate::repository::{AttributeMap, AttributeUpdates, CloseableIter, Repository};
use crate::search;

use self::lock::RepositoryLock;

const ATTRIBUTES_FILE: &str = "attributes";
const LOCK_FILE: &str = "lock";
/// Bare `%` never appears in an encoded name, so this cannot clash with an element
const ATTRIBUTES_TMP_FILE: &str = "attributes%tmp";

/// Encode a path component, steering clear of a reserved file name
fn encode_avoiding(name: &str, reserved: &str) -> String {
    let encoded = encode_file_name(name);
    if encoded == reserved {
        let mut chars = encoded.chars();
        let first = chars.next().map(|c| format!("%{:02X}", c as u32)).unwrap_or_default();
        format!("{}{}", first, chars.as_str())
    } else {
        encoded
    }
}

/// Flat-file repository rooted at a directory
pub struct FilesystemRepository {
    root: PathBuf,
    lock: Arc<RepositoryLock>,
    closed: AtomicBool,
}

impl FilesystemRepository {
    /// Open (creating if needed) a repository at `root`
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let lock = RepositoryLock::open(&root.join(LOCK_FILE))?;
        tracing::info!("Opened filesystem repository at {:?}", root);
        Ok(Self {
            root: root.to_path_buf(),
            lock: Arc::new(lock),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_dir(&self, handle: &str) -> PathBuf {
        self.root.join(encode_avoiding(handle, LOCK_FILE))
    }

    fn element_path(&self, handle: &str, name: &str) -> PathBuf {
        self.object_dir(handle).join(encode_avoiding(name, ATTRIBUTES_FILE))
    }

    fn exists_unlocked(dir: &Path) -> bool {
        fs::metadata(dir.join(ATTRIBUTES_FILE)).is_ok_and(|m| m.len() > 0)
    }

    fn load_unlocked(dir: &Path, handle: &str) -> Result<ObjectSnapshot> {
        match fs::read_to_string(dir.join(ATTRIBUTES_FILE)) {
            Ok(text) if !text.is_empty() => xml::decode(&text),
            Ok(_) => Err(RepositoryError::ObjectNotFound(handle.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RepositoryError::ObjectNotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn store_unlocked(dir: &Path, object: &ObjectSnapshot) -> Result<()> {
        let path = dir.join(ATTRIBUTES_FILE);
        let tmp = dir.join(ATTRIBUTES_TMP_FILE);
        fs::write(&tmp, xml::encode(object))?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, handle: &str) -> Result<ObjectSnapshot> {
        let _guard = self.lock.shared()?;
        Self::load_unlocked(&self.object_dir(handle), handle)
    }

    /// Load, mutate and store an object under the exclusive lock
    fn mutate<T>(&self, handle: &str, f: impl FnOnce(&mut ObjectSnapshot) -> Result<T>) -> Result<T> {
        let _guard = self.lock.exclusive()?;
        let dir = self.object_dir(handle);
        let mut object = Self::load_unlocked(&dir, handle)?;
        let out = f(&mut object)?;
        Self::store_unlocked(&dir, &object)?;
        Ok(out)
    }

    fn scan(&self) -> Result<HashMap<String, ObjectSnapshot>> {
        let _guard = self.lock.shared()?;
        let mut objects = HashMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            if !Self::exists_unlocked(&dir) {
                continue;
            }
            let text = fs::read_to_string(dir.join(ATTRIBUTES_FILE))?;
            let object = xml::decode(&text)?;
            objects.insert(object.handle.clone(), object);
        }
        Ok(objects)
    }
}

/// Lazy directory listing yielding handles of live objects
struct HandleIter {
    entries: fs::ReadDir,
    lock: Arc<RepositoryLock>,
}

impl Iterator for HandleIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(e) => e,
                Err(e) => return Some(Err(e.into())),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LOCK_FILE {
                continue;
            }
            let live = match self.lock.shared() {
                Ok(_guard) => FilesystemRepository::exists_unlocked(&entry.path()),
                Err(e) => return Some(Err(e)),
            };
            if live {
                return Some(decode_file_name(&name));
            }
        }
    }
}

impl Repository for FilesystemRepository {
    fn verify_object(&self, handle: &str) -> Result<bool> {
        let _guard = self.lock.shared()?;
        Ok(Self::exists_unlocked(&self.object_dir(handle)))
    }

    fn create_object(&self, handle: Option<&str>) -> Result<String> {
        let handle = match handle {
            Some(h) => h.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let _guard = self.lock.exclusive()?;
        let dir = self.object_dir(&handle);
        if Self::exists_unlocked(&dir) {
            return Err(RepositoryError::ObjectExists(handle));
        }
        fs::create_dir_all(&dir)?;
        let now = now_millis().to_string();
        let mut object = ObjectSnapshot::new(handle.clone());
        object.attributes.insert(INTERNAL_CREATED.to_string(), now.clone());
        object.attributes.insert(INTERNAL_MODIFIED.to_string(), now);
        Self::store_unlocked(&dir, &object)?;
        tracing::debug!(handle = %handle, "created object directory");
        Ok(handle)
    }

    fn delete_object(&self, handle: &str) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        let dir = self.object_dir(handle);
        if !Self::exists_unlocked(&dir) {
            return Err(RepositoryError::ObjectNotFound(handle.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn list_handles(&self) -> Result<CloseableIter<String>> {
        Ok(Box::new(HandleIter {
            entries: fs::read_dir(&self.root)?,
            lock: self.lock.clone(),
        }))
    }

    fn search_handles(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<String>> {
        let objects = self.scan()?;
        let mut hits = HashSet::new();
        for object in objects.values() {
            if search::matches(query, object)? {
                hits.insert(object.handle.clone());
            }
        }
        let ordered = search::sort_and_page(hits, params, |h, name| {
            Ok(objects.get(h).and_then(|o| o.attributes.get(name).cloned()))
        })?;
        Ok(Box::new(ordered.into_iter().map(Ok)))
    }

    fn attributes(&self, handle: &str, element: Option<&str>) -> Result<AttributeMap> {
        let object = self.load(handle)?;
        object
            .attributes_of(element)
            .cloned()
            .ok_or_else(|| RepositoryError::element_not_found(handle, element.unwrap_or_default()))
    }

    fn set_attributes(&self, handle: &str, element: Option<&str>, updates: &AttributeUpdates) -> Result<()> {
        self.mutate(handle, |object| {
            let atts = object
                .attributes_of_mut(element)
                .ok_or_else(|| RepositoryError::element_not_found(handle, element.unwrap_or_default()))?;
            crate::object::apply_updates(atts, updates);
            if refreshes_modified(updates.keys().map(String::as_str)) {
                object.touch();
            }
            Ok(())
        })
    }

    fn verify_element(&self, handle: &str, name: &str) -> Result<bool> {
        Ok(self.load(handle)?.elements.contains_key(name))
    }

    fn create_element(&self, handle: &str, name: &str) -> Result<()> {
        let path = self.element_path(handle, name);
        self.mutate(handle, |object| {
            if object.elements.contains_key(name) {
                return Err(RepositoryError::element_exists(handle, name));
            }
            File::create(&path)?;
            object.elements.insert(name.to_string(), ElementSnapshot::default());
            object.touch();
            Ok(())
        })
    }

    fn delete_element(&self, handle: &str, name: &str) -> Result<()> {
        let path = self.element_path(handle, name);
        self.mutate(handle, |object| {
            if object.elements.remove(name).is_none() {
                return Err(RepositoryError::element_not_found(handle, name));
            }
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            object.touch();
            Ok(())
        })
    }

    fn list_elements(&self, handle: &str) -> Result<Vec<String>> {
        Ok(self.load(handle)?.elements.into_keys().collect())
    }

    fn read_element(&self, handle: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        let _guard = self.lock.shared()?;
        let object = Self::load_unlocked(&self.object_dir(handle), handle)?;
        if !object.elements.contains_key(name) {
            return Err(RepositoryError::element_not_found(handle, name));
        }
        match File::open(self.element_path(handle, name)) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(io::empty())),
            Err(e) => Err(e.into()),
        }
    }

    fn write_element(&self, handle: &str, name: &str, data: &mut dyn Read, append: bool) -> Result<u64> {
        let path = self.element_path(handle, name);
        self.mutate(handle, |object| {
            if !object.elements.contains_key(name) {
                return Err(RepositoryError::element_not_found(handle, name));
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&path)?;
            let written = io::copy(data, &mut file)?;
            file.sync_data()?;
            object.touch();
            Ok(written)
        })
    }

    fn element_size(&self, handle: &str, name: &str) -> Result<u64> {
        let _guard = self.lock.shared()?;
        let object = Self::load_unlocked(&self.object_dir(handle), handle)?;
        if !object.elements.contains_key(name) {
            return Err(RepositoryError::element_not_found(handle, name));
        }
        match fs::metadata(self.element_path(handle, name)) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Closed filesystem repository at {:?}", self.root);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{RepositoryExt, SharedRepository, collect_all};
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> SharedRepository {
        Arc::new(FilesystemRepository::open(tmp.path()).unwrap())
    }

    #[test]
    fn test_reserved_names_do_not_collide() {
        assert_eq!(encode_avoiding("attributes", ATTRIBUTES_FILE), "%61ttributes");
        assert_eq!(encode_avoiding("lock", LOCK_FILE), "%6Cock");
        assert_eq!(decode_file_name("%61ttributes").unwrap(), "attributes");
    }

    #[test]
    fn test_reopen_sees_attributes() {
        let tmp = TempDir::new().unwrap();
        {
            let repo = open(&tmp);
            let obj = repo.create_digital_object(Some("a/b")).unwrap();
            obj.set_attribute("title", "Hello").unwrap();
            repo.close().unwrap();
        }
        let repo = open(&tmp);
        assert!(tmp.path().join("a%2Fb").join(ATTRIBUTES_FILE).exists());
        assert_eq!(
            repo.attribute("a/b", None, "title").unwrap().as_deref(),
            Some("Hello")
        );
    }

    #[test]
    fn test_element_named_attributes() {
        let tmp = TempDir::new().unwrap();
        let repo = open(&tmp);
        let obj = repo.create_digital_object(Some("h")).unwrap();
        let el = obj.create_data_element("attributes").unwrap();
        el.write_bytes(b"payload").unwrap();
        assert_eq!(el.read_to_vec().unwrap(), b"payload");
        assert!(obj.attribute(INTERNAL_CREATED).unwrap().is_some());
    }

    #[test]
    fn test_list_skips_lock_and_half_created() {
        let tmp = TempDir::new().unwrap();
        let repo = open(&tmp);
        repo.create_object(Some("one")).unwrap();
        repo.create_object(Some("lock")).unwrap();
        fs::create_dir_all(tmp.path().join("stray")).unwrap();
        let mut handles = collect_all(repo.list_handles().unwrap()).unwrap();
        handles.sort();
        assert_eq!(handles, vec!["lock", "one"]);
    }

    #[test]
    fn test_delete_removes_directory() {
        let tmp = TempDir::new().unwrap();
        let repo = open(&tmp);
        let obj = repo.create_digital_object(Some("x y")).unwrap();
        obj.create_data_element("content").unwrap().write_bytes(b"abc").unwrap();
        obj.delete().unwrap();
        assert!(!tmp.path().join("x%20y").exists());
        assert!(!repo.verify_object("x y").unwrap());
    }

    #[test]
    fn test_search_scans_objects() {
        let tmp = TempDir::new().unwrap();
        let repo = open(&tmp);
        for (h, t) in [("a", "doc"), ("b", "img"), ("c", "doc")] {
            repo.create_digital_object(Some(h)).unwrap().set_attribute("type", t).unwrap();
        }
        let hits = collect_all(
            repo.search_handles(&Query::attribute("type", "doc"), &QueryParams::default())
                .unwrap(),
        )
        .unwrap();
        assert_eq!(hits, vec!["a", "c"]);
    }
}

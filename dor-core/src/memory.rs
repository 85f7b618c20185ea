//! In-memory repository with a hash index on object attributes
//!
//! Objects live in a concurrent map keyed by handle. A second concurrent map
//! from `(attribute name, attribute value)` to the set of handles carrying it
//! makes exact-match attribute queries a single lookup.
//!
//! The index is updated after the object's own lock is released, so two
//! writers racing on the same attribute of the same object can leave the
//! index briefly out of step with the stored value. This backend is meant for
//! single-process use and accepts that window.

use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;

use crate::error::{RepositoryError, Result};
use crate::object::{
    ElementSnapshot, INTERNAL_CREATED, INTERNAL_MODIFIED, ObjectSnapshot, now_millis, refreshes_modified,
};
use crate::query::{Query, QueryParams};
use crate::repository::{AttributeMap, AttributeUpdates, CloseableIter, Repository};
use crate::search::{self, SearchPrimitives};

/// (name, old value, new value) of one object-level attribute change
type IndexChange = (String, Option<String>, Option<String>);

type IndexKey = (String, String);

/// Hash-indexed in-memory repository
#[derive(Default)]
pub struct MemoryRepository {
    objects: DashMap<String, Arc<RwLock<ObjectSnapshot>>>,
    index: DashMap<IndexKey, HashSet<String>>,
    closed: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn object(&self, handle: &str) -> Result<Arc<RwLock<ObjectSnapshot>>> {
        self.objects
            .get(handle)
            .map(|o| o.value().clone())
            .ok_or_else(|| RepositoryError::ObjectNotFound(handle.to_string()))
    }

    fn reindex(&self, handle: &str, changes: Vec<IndexChange>) {
        for (name, old, new) in changes {
            if old == new {
                continue;
            }
            if let Some(old) = old {
                let key = (name.clone(), old);
                let now_empty = match self.index.get_mut(&key) {
                    Some(mut set) => {
                        set.remove(handle);
                        set.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.index.remove_if(&key, |_, set| set.is_empty());
                }
            }
            if let Some(new) = new {
                self.index
                    .entry((name, new))
                    .or_default()
                    .insert(handle.to_string());
            }
        }
    }

    /// Refresh `internal.modified` and report the change for the index
    fn touch(obj: &mut ObjectSnapshot, changes: &mut Vec<IndexChange>) {
        let old = obj.attributes.get(INTERNAL_MODIFIED).cloned();
        obj.touch();
        let new = obj.attributes.get(INTERNAL_MODIFIED).cloned();
        changes.push((INTERNAL_MODIFIED.to_string(), old, new));
    }

    /// Run `f` against the object under its write lock, then bring the index up to date
    fn mutate<T>(
        &self,
        handle: &str,
        f: impl FnOnce(&mut ObjectSnapshot, &mut Vec<IndexChange>) -> Result<T>,
    ) -> Result<T> {
        let obj = self.object(handle)?;
        let mut changes = Vec::new();
        let out = {
            let mut guard = obj.write();
            f(&mut guard, &mut changes)?
        };
        self.reindex(handle, changes);
        Ok(out)
    }

    fn element_mut<'a>(obj: &'a mut ObjectSnapshot, name: &str) -> Result<&'a mut ElementSnapshot> {
        let handle = obj.handle.clone();
        obj.elements
            .get_mut(name)
            .ok_or_else(|| RepositoryError::element_not_found(&handle, name))
    }
}

impl SearchPrimitives for MemoryRepository {
    fn all_handles(&self) -> Result<HashSet<String>> {
        Ok(self.objects.iter().map(|e| e.key().clone()).collect())
    }

    fn attribute_handles(&self, name: &str, value: &str) -> Result<HashSet<String>> {
        let key = (name.to_string(), value.to_string());
        Ok(self.index.get(&key).map(|s| s.value().clone()).unwrap_or_default())
    }

    fn element_attribute_handles(&self, element: &str, name: &str, value: &str) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        for entry in self.objects.iter() {
            let obj = entry.value().read();
            let hit = obj
                .elements
                .get(element)
                .is_some_and(|el| el.attributes.get(name).map(String::as_str) == Some(value));
            if hit {
                out.insert(entry.key().clone());
            }
        }
        Ok(out)
    }
}

impl Repository for MemoryRepository {
    fn verify_object(&self, handle: &str) -> Result<bool> {
        Ok(self.objects.contains_key(handle))
    }

    fn create_object(&self, handle: Option<&str>) -> Result<String> {
        let handle = match handle {
            Some(h) => h.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let now = now_millis().to_string();
        let mut snap = ObjectSnapshot::new(handle.clone());
        snap.attributes.insert(INTERNAL_CREATED.to_string(), now.clone());
        snap.attributes.insert(INTERNAL_MODIFIED.to_string(), now.clone());
        match self.objects.entry(handle.clone()) {
            Entry::Occupied(_) => return Err(RepositoryError::ObjectExists(handle)),
            Entry::Vacant(v) => {
                v.insert(Arc::new(RwLock::new(snap)));
            }
        }
        self.reindex(
            &handle,
            vec![
                (INTERNAL_CREATED.to_string(), None, Some(now.clone())),
                (INTERNAL_MODIFIED.to_string(), None, Some(now)),
            ],
        );
        tracing::debug!(handle = %handle, "created object in memory repository");
        Ok(handle)
    }

    fn delete_object(&self, handle: &str) -> Result<()> {
        let (_, obj) = self
            .objects
            .remove(handle)
            .ok_or_else(|| RepositoryError::ObjectNotFound(handle.to_string()))?;
        let changes = obj
            .read()
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone()), None))
            .collect();
        self.reindex(handle, changes);
        Ok(())
    }

    fn list_handles(&self) -> Result<CloseableIter<String>> {
        let handles: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        Ok(Box::new(handles.into_iter().map(Ok)))
    }

    fn search_handles(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<String>> {
        let hits = search::evaluate(self, query)?;
        let ordered = search::sort_and_page(hits, params, |h, name| {
            Ok(self
                .objects
                .get(h)
                .and_then(|o| o.value().read().attributes.get(name).cloned()))
        })?;
        Ok(Box::new(ordered.into_iter().map(Ok)))
    }

    fn attributes(&self, handle: &str, element: Option<&str>) -> Result<AttributeMap> {
        let obj = self.object(handle)?;
        let guard = obj.read();
        guard
            .attributes_of(element)
            .cloned()
            .ok_or_else(|| RepositoryError::element_not_found(handle, element.unwrap_or_default()))
    }

    fn set_attributes(&self, handle: &str, element: Option<&str>, updates: &AttributeUpdates) -> Result<()> {
        self.mutate(handle, |obj, changes| {
            let atts = obj
                .attributes_of_mut(element)
                .ok_or_else(|| RepositoryError::element_not_found(handle, element.unwrap_or_default()))?;
            for (name, value) in updates {
                let old = match value {
                    Some(v) => atts.insert(name.clone(), v.clone()),
                    None => atts.remove(name),
                };
                if element.is_none() {
                    changes.push((name.clone(), old, value.clone()));
                }
            }
            if refreshes_modified(updates.keys().map(String::as_str)) {
                Self::touch(obj, changes);
            }
            Ok(())
        })
    }

    fn verify_element(&self, handle: &str, name: &str) -> Result<bool> {
        Ok(self.object(handle)?.read().elements.contains_key(name))
    }

    fn create_element(&self, handle: &str, name: &str) -> Result<()> {
        self.mutate(handle, |obj, changes| {
            if obj.elements.contains_key(name) {
                return Err(RepositoryError::element_exists(handle, name));
            }
            obj.elements.insert(
                name.to_string(),
                ElementSnapshot {
                    attributes: AttributeMap::new(),
                    data: Some(Vec::new()),
                },
            );
            Self::touch(obj, changes);
            Ok(())
        })
    }

    fn delete_element(&self, handle: &str, name: &str) -> Result<()> {
        self.mutate(handle, |obj, changes| {
            if obj.elements.remove(name).is_none() {
                return Err(RepositoryError::element_not_found(handle, name));
            }
            Self::touch(obj, changes);
            Ok(())
        })
    }

    fn list_elements(&self, handle: &str) -> Result<Vec<String>> {
        Ok(self.object(handle)?.read().elements.keys().cloned().collect())
    }

    fn read_element(&self, handle: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        let obj = self.object(handle)?;
        let guard = obj.read();
        let el = guard
            .elements
            .get(name)
            .ok_or_else(|| RepositoryError::element_not_found(handle, name))?;
        Ok(Box::new(Cursor::new(el.data.clone().unwrap_or_default())))
    }

    fn write_element(&self, handle: &str, name: &str, data: &mut dyn Read, append: bool) -> Result<u64> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let written = buf.len() as u64;
        self.mutate(handle, |obj, changes| {
            let el = Self::element_mut(obj, name)?;
            let stored = el.data.get_or_insert_with(Vec::new);
            if append {
                stored.extend_from_slice(&buf);
            } else {
                *stored = buf;
            }
            Self::touch(obj, changes);
            Ok(written)
        })
    }

    fn element_size(&self, handle: &str, name: &str) -> Result<u64> {
        let obj = self.object(handle)?;
        let guard = obj.read();
        let el = guard
            .elements
            .get(name)
            .ok_or_else(|| RepositoryError::element_not_found(handle, name))?;
        Ok(el.data.as_ref().map_or(0, |d| d.len() as u64))
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(objects = self.objects.len(), "closed memory repository");
        }
        Ok(())
    }
}

//! Repository backend contract
//!
//! Every backend (memory, filesystem, key/value table, REST proxy) and every
//! decorator (wrapper, synchronizing repository) implements [`Repository`].
//! Operations are addressed by handle plus an optional data element name,
//! where `None` means the object itself. All calls block the calling thread.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::error::{RepositoryError, Result};
use crate::object::DigitalObject;
use crate::query::{Query, QueryParams};

/// Attribute name → value
pub type AttributeMap = HashMap<String, String>;

/// Batch attribute update; a `None` value deletes the attribute
pub type AttributeUpdates = HashMap<String, Option<String>>;

/// Lazy, finite sequence. Dropping it releases whatever backs it.
pub type CloseableIter<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Shared, type-erased repository
pub type SharedRepository = Arc<dyn Repository>;

/// Storage-agnostic digital object repository
pub trait Repository: Send + Sync {
    /// Whether an object with this handle exists
    fn verify_object(&self, handle: &str) -> Result<bool>;

    /// Create an object, minting a handle when `handle` is `None`.
    ///
    /// Fails with `ObjectExists` if the handle is taken.
    fn create_object(&self, handle: Option<&str>) -> Result<String>;

    /// Create the object unless it already exists
    fn get_or_create_object(&self, handle: &str) -> Result<()> {
        if self.verify_object(handle)? {
            return Ok(());
        }
        match self.create_object(Some(handle)) {
            Ok(_) => Ok(()),
            Err(RepositoryError::ObjectExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete an object with all its elements. Fails with `ObjectNotFound`.
    fn delete_object(&self, handle: &str) -> Result<()>;

    fn list_handles(&self) -> Result<CloseableIter<String>>;

    fn search_handles(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<String>>;

    /// All attributes of the object (`element == None`) or of one of its elements
    fn attributes(&self, handle: &str, element: Option<&str>) -> Result<AttributeMap>;

    fn attribute(&self, handle: &str, element: Option<&str>, name: &str) -> Result<Option<String>> {
        Ok(self.attributes(handle, element)?.remove(name))
    }

    /// Apply a batch of attribute updates (`None` deletes)
    fn set_attributes(
        &self,
        handle: &str,
        element: Option<&str>,
        updates: &AttributeUpdates,
    ) -> Result<()>;

    fn set_attribute(
        &self,
        handle: &str,
        element: Option<&str>,
        name: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let mut updates = AttributeUpdates::new();
        updates.insert(name.to_string(), value.map(str::to_string));
        self.set_attributes(handle, element, &updates)
    }

    fn delete_attributes(&self, handle: &str, element: Option<&str>, names: &[&str]) -> Result<()> {
        let updates = names.iter().map(|n| (n.to_string(), None)).collect();
        self.set_attributes(handle, element, &updates)
    }

    fn verify_element(&self, handle: &str, name: &str) -> Result<bool>;

    /// Fails with `ElementExists` if the object already has an element of this name
    fn create_element(&self, handle: &str, name: &str) -> Result<()>;

    fn delete_element(&self, handle: &str, name: &str) -> Result<()>;

    fn list_elements(&self, handle: &str) -> Result<Vec<String>>;

    /// Stream an element's payload
    fn read_element(&self, handle: &str, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Replace (or, with `append`, extend) an element's payload. Returns bytes written.
    fn write_element(
        &self,
        handle: &str,
        name: &str,
        data: &mut dyn Read,
        append: bool,
    ) -> Result<u64>;

    fn element_size(&self, handle: &str, name: &str) -> Result<u64>;

    /// Release backend resources. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Object-level convenience API over a shared repository
pub trait RepositoryExt {
    fn create_digital_object(&self, handle: Option<&str>) -> Result<DigitalObject>;
    fn get_digital_object(&self, handle: &str) -> Result<Option<DigitalObject>>;
    fn get_or_create_digital_object(&self, handle: &str) -> Result<DigitalObject>;
    fn list_objects(&self) -> Result<CloseableIter<DigitalObject>>;
    fn search(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<DigitalObject>>;
}

impl RepositoryExt for SharedRepository {
    fn create_digital_object(&self, handle: Option<&str>) -> Result<DigitalObject> {
        let handle = self.create_object(handle)?;
        Ok(DigitalObject::new(self.clone(), handle))
    }

    fn get_digital_object(&self, handle: &str) -> Result<Option<DigitalObject>> {
        if self.verify_object(handle)? {
            Ok(Some(DigitalObject::new(self.clone(), handle.to_string())))
        } else {
            Ok(None)
        }
    }

    fn get_or_create_digital_object(&self, handle: &str) -> Result<DigitalObject> {
        self.get_or_create_object(handle)?;
        Ok(DigitalObject::new(self.clone(), handle.to_string()))
    }

    fn list_objects(&self) -> Result<CloseableIter<DigitalObject>> {
        let repo = self.clone();
        Ok(Box::new(
            self.list_handles()?
                .map(move |h| h.map(|h| DigitalObject::new(repo.clone(), h))),
        ))
    }

    fn search(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<DigitalObject>> {
        let repo = self.clone();
        Ok(Box::new(
            self.search_handles(query, params)?
                .map(move |h| h.map(|h| DigitalObject::new(repo.clone(), h))),
        ))
    }
}

/// Drain a lazy sequence into a `Vec`, stopping at the first error
pub fn collect_all<T>(iter: CloseableIter<T>) -> Result<Vec<T>> {
    iter.collect()
}

/// Copy a complete object from one repository to another.
///
/// Target attributes and elements the source lacks are deleted. Elements are
/// copied before the object's attribute map, so the target ends up with the
/// source's `internal.modified`.
pub fn copy_object(source: &DigitalObject, target: &DigitalObject) -> Result<()> {
    let source_atts = source.attributes()?;
    let target_atts = target.attributes()?;
    let stale: Vec<&str> = target_atts
        .keys()
        .filter(|k| !source_atts.contains_key(*k))
        .map(String::as_str)
        .collect();
    if !stale.is_empty() {
        target.delete_attributes(&stale)?;
    }

    let source_elements = source.list_data_element_names()?;
    for name in target.list_data_element_names()? {
        if !source_elements.contains(&name) {
            target.delete_data_element(&name)?;
        }
    }

    for name in &source_elements {
        let src_el = source.data_element(name);
        let dst_el = target.get_or_create_data_element(name)?;
        let src_el_atts = src_el.attributes()?;
        let dst_el_atts = dst_el.attributes()?;
        let stale: Vec<&str> = dst_el_atts
            .keys()
            .filter(|k| !src_el_atts.contains_key(*k))
            .map(String::as_str)
            .collect();
        if !stale.is_empty() {
            dst_el.delete_attributes(&stale)?;
        }
        if !src_el_atts.is_empty() {
            dst_el.set_attributes(&src_el_atts)?;
        }
        let mut reader = src_el.read()?;
        dst_el.write(&mut reader, false)?;
    }

    if !source_atts.is_empty() {
        target.set_attributes(&source_atts)?;
    }
    Ok(())
}

//! Object model: digital objects, data elements and their attributes
//!
//! [`DigitalObject`] and [`DataElement`] are thin views of a shared repository
//! plus a handle (and element name). They hold no state of their own, so any
//! decorator wrapped around the repository applies to every view obtained
//! through it.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use crate::error::{RepositoryError, Result};
use crate::repository::{AttributeMap, AttributeUpdates, SharedRepository};

/// Creation time of an object, millisecond epoch as a decimal string
pub const INTERNAL_CREATED: &str = "internal.created";

/// Last modification time of an object, millisecond epoch as a decimal string
pub const INTERNAL_MODIFIED: &str = "internal.modified";

/// Prefix reserved for bookkeeping attributes
pub const INTERNAL_PREFIX: &str = "internal.";

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Next `internal.modified` value: the current time, bumped past `previous`
/// so the stamp strictly increases even within one millisecond.
pub fn next_modified(previous: Option<&str>) -> String {
    let now = now_millis();
    let prev = previous.and_then(|p| p.parse::<i64>().ok()).unwrap_or(i64::MIN);
    now.max(prev.saturating_add(1)).to_string()
}

/// Whether a mutation touching `names` must refresh `internal.modified`.
///
/// Writes of the bookkeeping attributes themselves never do, so a batch
/// carrying `internal.modified` (or only `internal.created`) keeps its stamp.
pub fn refreshes_modified<'a>(names: impl IntoIterator<Item = &'a str>) -> bool {
    let mut any = false;
    let mut only_created = true;
    for name in names {
        if name == INTERNAL_MODIFIED {
            return false;
        }
        any = true;
        if name != INTERNAL_CREATED {
            only_created = false;
        }
    }
    any && !only_created
}

/// Apply a batch of updates to an attribute map in place
pub fn apply_updates(atts: &mut AttributeMap, updates: &AttributeUpdates) {
    for (name, value) in updates {
        match value {
            Some(v) => {
                atts.insert(name.clone(), v.clone());
            }
            None => {
                atts.remove(name);
            }
        }
    }
}

/// Point-in-time copy of an object's attributes and elements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSnapshot {
    pub handle: String,
    pub attributes: AttributeMap,
    pub elements: BTreeMap<String, ElementSnapshot>,
}

/// Point-in-time copy of a data element; `data` is `None` when the payload
/// was not loaded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementSnapshot {
    pub attributes: AttributeMap,
    pub data: Option<Vec<u8>>,
}

impl ObjectSnapshot {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            ..Default::default()
        }
    }

    /// Attributes of the object or of one element
    pub fn attributes_of(&self, element: Option<&str>) -> Option<&AttributeMap> {
        match element {
            None => Some(&self.attributes),
            Some(name) => self.elements.get(name).map(|e| &e.attributes),
        }
    }

    pub fn attributes_of_mut(&mut self, element: Option<&str>) -> Option<&mut AttributeMap> {
        match element {
            None => Some(&mut self.attributes),
            Some(name) => self.elements.get_mut(name).map(|e| &mut e.attributes),
        }
    }

    /// Refresh `internal.modified`
    pub fn touch(&mut self) {
        let next = next_modified(self.attributes.get(INTERNAL_MODIFIED).map(String::as_str));
        self.attributes.insert(INTERNAL_MODIFIED.to_string(), next);
    }
}

/// View of a digital object stored in some repository
#[derive(Clone)]
pub struct DigitalObject {
    repo: SharedRepository,
    handle: String,
}

impl std::fmt::Debug for DigitalObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalObject").field("handle", &self.handle).finish()
    }
}

impl DigitalObject {
    pub fn new(repo: SharedRepository, handle: String) -> Self {
        Self { repo, handle }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn repository(&self) -> &SharedRepository {
        &self.repo
    }

    pub fn attributes(&self) -> Result<AttributeMap> {
        self.repo.attributes(&self.handle, None)
    }

    pub fn attribute(&self, name: &str) -> Result<Option<String>> {
        self.repo.attribute(&self.handle, None, name)
    }

    pub fn set_attribute(&self, name: &str, value: &str) -> Result<()> {
        self.repo.set_attribute(&self.handle, None, name, Some(value))
    }

    pub fn set_attributes(&self, atts: &AttributeMap) -> Result<()> {
        let updates = atts.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect();
        self.repo.set_attributes(&self.handle, None, &updates)
    }

    pub fn update_attributes(&self, updates: &AttributeUpdates) -> Result<()> {
        self.repo.set_attributes(&self.handle, None, updates)
    }

    pub fn delete_attribute(&self, name: &str) -> Result<()> {
        self.repo.set_attribute(&self.handle, None, name, None)
    }

    pub fn delete_attributes(&self, names: &[&str]) -> Result<()> {
        self.repo.delete_attributes(&self.handle, None, names)
    }

    pub fn verify_data_element(&self, name: &str) -> Result<bool> {
        self.repo.verify_element(&self.handle, name)
    }

    pub fn create_data_element(&self, name: &str) -> Result<DataElement> {
        self.repo.create_element(&self.handle, name)?;
        Ok(self.data_element(name))
    }

    pub fn get_data_element(&self, name: &str) -> Result<Option<DataElement>> {
        if self.repo.verify_element(&self.handle, name)? {
            Ok(Some(self.data_element(name)))
        } else {
            Ok(None)
        }
    }

    pub fn get_or_create_data_element(&self, name: &str) -> Result<DataElement> {
        match self.repo.create_element(&self.handle, name) {
            Ok(()) | Err(RepositoryError::ElementExists { .. }) => Ok(self.data_element(name)),
            Err(e) => Err(e),
        }
    }

    /// View of an element without checking that it exists
    pub fn data_element(&self, name: &str) -> DataElement {
        DataElement {
            repo: self.repo.clone(),
            handle: self.handle.clone(),
            name: name.to_string(),
        }
    }

    pub fn delete_data_element(&self, name: &str) -> Result<()> {
        self.repo.delete_element(&self.handle, name)
    }

    pub fn list_data_element_names(&self) -> Result<Vec<String>> {
        self.repo.list_elements(&self.handle)
    }

    pub fn list_data_elements(&self) -> Result<Vec<DataElement>> {
        Ok(self
            .list_data_element_names()?
            .iter()
            .map(|n| self.data_element(n))
            .collect())
    }

    pub fn delete(&self) -> Result<()> {
        self.repo.delete_object(&self.handle)
    }

    /// Load attributes and element attributes (payloads are not read)
    pub fn snapshot(&self) -> Result<ObjectSnapshot> {
        let mut snap = ObjectSnapshot::new(self.handle.clone());
        snap.attributes = self.attributes()?;
        for name in self.list_data_element_names()? {
            let attributes = self.repo.attributes(&self.handle, Some(&name))?;
            snap.elements.insert(name, ElementSnapshot { attributes, data: None });
        }
        Ok(snap)
    }
}

/// View of a named data element of a digital object
#[derive(Clone)]
pub struct DataElement {
    repo: SharedRepository,
    handle: String,
    name: String,
}

impl std::fmt::Debug for DataElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataElement")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .finish()
    }
}

impl DataElement {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn digital_object(&self) -> DigitalObject {
        DigitalObject::new(self.repo.clone(), self.handle.clone())
    }

    pub fn attributes(&self) -> Result<AttributeMap> {
        self.repo.attributes(&self.handle, Some(&self.name))
    }

    pub fn attribute(&self, name: &str) -> Result<Option<String>> {
        self.repo.attribute(&self.handle, Some(&self.name), name)
    }

    pub fn set_attribute(&self, name: &str, value: &str) -> Result<()> {
        self.repo.set_attribute(&self.handle, Some(&self.name), name, Some(value))
    }

    pub fn set_attributes(&self, atts: &AttributeMap) -> Result<()> {
        let updates = atts.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect();
        self.repo.set_attributes(&self.handle, Some(&self.name), &updates)
    }

    pub fn delete_attribute(&self, name: &str) -> Result<()> {
        self.repo.set_attribute(&self.handle, Some(&self.name), name, None)
    }

    pub fn delete_attributes(&self, names: &[&str]) -> Result<()> {
        self.repo.delete_attributes(&self.handle, Some(&self.name), names)
    }

    pub fn read(&self) -> Result<Box<dyn Read + Send>> {
        self.repo.read_element(&self.handle, &self.name)
    }

    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read()?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, data: &mut dyn Read, append: bool) -> Result<u64> {
        self.repo.write_element(&self.handle, &self.name, data, append)
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<u64> {
        self.write(&mut Cursor::new(data), false)
    }

    pub fn size(&self) -> Result<u64> {
        self.repo.element_size(&self.handle, &self.name)
    }

    pub fn delete(&self) -> Result<()> {
        self.repo.delete_element(&self.handle, &self.name)
    }
}

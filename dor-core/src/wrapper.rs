//! Forwarding decorator
//!
//! [`RepositoryWrapper`] holds an inner repository and forwards every call to
//! it. After each successful mutation it reports a [`Mutation`] to a
//! [`MutationHook`]. Object and element views obtained through the wrapper
//! route back through it, so the hook sees their mutations too.

use std::io::Read;

use crate::error::Result;
use crate::query::{Query, QueryParams};
use crate::repository::{AttributeMap, AttributeUpdates, CloseableIter, Repository, SharedRepository};

/// A completed mutation of the inner repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<'a> {
    ObjectCreated { handle: &'a str },
    ObjectDeleted { handle: &'a str },
    /// Attributes set to a value
    AttributesSet {
        handle: &'a str,
        element: Option<&'a str>,
        names: Vec<&'a str>,
    },
    AttributesDeleted {
        handle: &'a str,
        element: Option<&'a str>,
        names: Vec<&'a str>,
    },
    ElementCreated { handle: &'a str, element: &'a str },
    ElementDeleted { handle: &'a str, element: &'a str },
    ElementWritten { handle: &'a str, element: &'a str },
}

impl Mutation<'_> {
    /// Handle of the object that was changed
    pub fn handle(&self) -> &str {
        match self {
            Mutation::ObjectCreated { handle }
            | Mutation::ObjectDeleted { handle }
            | Mutation::AttributesSet { handle, .. }
            | Mutation::AttributesDeleted { handle, .. }
            | Mutation::ElementCreated { handle, .. }
            | Mutation::ElementDeleted { handle, .. }
            | Mutation::ElementWritten { handle, .. } => handle,
        }
    }
}

/// Called after each successful mutation
pub trait MutationHook: Send + Sync {
    fn after(&self, inner: &dyn Repository, mutation: &Mutation<'_>) -> Result<()>;
}

/// Hook that does nothing
pub struct NoHook;

impl MutationHook for NoHook {
    fn after(&self, _inner: &dyn Repository, _mutation: &Mutation<'_>) -> Result<()> {
        Ok(())
    }
}

/// Repository decorator that forwards to `inner` and reports mutations to `hook`
pub struct RepositoryWrapper<H: MutationHook> {
    inner: SharedRepository,
    hook: H,
}

impl<H: MutationHook> RepositoryWrapper<H> {
    pub fn new(inner: SharedRepository, hook: H) -> Self {
        Self { inner, hook }
    }

    /// The wrapped repository; calls made on it bypass the hook
    pub fn inner(&self) -> &SharedRepository {
        &self.inner
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }

    fn notify(&self, mutation: Mutation<'_>) -> Result<()> {
        self.hook.after(self.inner.as_ref(), &mutation)
    }
}

impl<H: MutationHook> Repository for RepositoryWrapper<H> {
    fn verify_object(&self, handle: &str) -> Result<bool> {
        self.inner.verify_object(handle)
    }

    fn create_object(&self, handle: Option<&str>) -> Result<String> {
        let handle = self.inner.create_object(handle)?;
        self.notify(Mutation::ObjectCreated { handle: &handle })?;
        Ok(handle)
    }

    fn delete_object(&self, handle: &str) -> Result<()> {
        self.inner.delete_object(handle)?;
        self.notify(Mutation::ObjectDeleted { handle })
    }

    fn list_handles(&self) -> Result<CloseableIter<String>> {
        self.inner.list_handles()
    }

    fn search_handles(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<String>> {
        self.inner.search_handles(query, params)
    }

    fn attributes(&self, handle: &str, element: Option<&str>) -> Result<AttributeMap> {
        self.inner.attributes(handle, element)
    }

    fn attribute(&self, handle: &str, element: Option<&str>, name: &str) -> Result<Option<String>> {
        self.inner.attribute(handle, element, name)
    }

    fn set_attributes(&self, handle: &str, element: Option<&str>, updates: &AttributeUpdates) -> Result<()> {
        self.inner.set_attributes(handle, element, updates)?;
        let (set, deleted): (Vec<_>, Vec<_>) = updates.iter().partition(|(_, v)| v.is_some());
        if !set.is_empty() {
            self.notify(Mutation::AttributesSet {
                handle,
                element,
                names: set.into_iter().map(|(k, _)| k.as_str()).collect(),
            })?;
        }
        if !deleted.is_empty() {
            self.notify(Mutation::AttributesDeleted {
                handle,
                element,
                names: deleted.into_iter().map(|(k, _)| k.as_str()).collect(),
            })?;
        }
        Ok(())
    }

    fn verify_element(&self, handle: &str, name: &str) -> Result<bool> {
        self.inner.verify_element(handle, name)
    }

    fn create_element(&self, handle: &str, name: &str) -> Result<()> {
        self.inner.create_element(handle, name)?;
        self.notify(Mutation::ElementCreated { handle, element: name })
    }

    fn delete_element(&self, handle: &str, name: &str) -> Result<()> {
        self.inner.delete_element(handle, name)?;
        self.notify(Mutation::ElementDeleted { handle, element: name })
    }

    fn list_elements(&self, handle: &str) -> Result<Vec<String>> {
        self.inner.list_elements(handle)
    }

    fn read_element(&self, handle: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.read_element(handle, name)
    }

    fn write_element(&self, handle: &str, name: &str, data: &mut dyn Read, append: bool) -> Result<u64> {
        let written = self.inner.write_element(handle, name, data, append)?;
        self.notify(Mutation::ElementWritten { handle, element: name })?;
        Ok(written)
    }

    fn element_size(&self, handle: &str, name: &str) -> Result<u64> {
        self.inner.element_size(handle, name)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::repository::RepositoryExt;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl MutationHook for Arc<Recorder> {
        fn after(&self, _inner: &dyn Repository, mutation: &Mutation<'_>) -> Result<()> {
            let label = match mutation {
                Mutation::ObjectCreated { .. } => "created".to_string(),
                Mutation::ObjectDeleted { .. } => "deleted".to_string(),
                Mutation::AttributesSet { names, .. } => format!("set {}", names.join(",")),
                Mutation::AttributesDeleted { names, .. } => format!("unset {}", names.join(",")),
                Mutation::ElementCreated { element, .. } => format!("el+ {}", element),
                Mutation::ElementDeleted { element, .. } => format!("el- {}", element),
                Mutation::ElementWritten { element, .. } => format!("write {}", element),
            };
            self.seen.lock().push(format!("{} {}", mutation.handle(), label));
            Ok(())
        }
    }

    #[test]
    fn test_views_route_through_wrapper() {
        let recorder = Arc::new(Recorder::default());
        let wrapped: SharedRepository = Arc::new(RepositoryWrapper::new(
            Arc::new(MemoryRepository::new()),
            recorder.clone(),
        ));
        let obj = wrapped.create_digital_object(Some("h")).unwrap();
        obj.set_attribute("title", "t").unwrap();
        obj.create_data_element("content").unwrap().write_bytes(b"x").unwrap();
        obj.delete_attribute("title").unwrap();
        obj.delete_data_element("content").unwrap();
        obj.delete().unwrap();
        assert_eq!(
            *recorder.seen.lock(),
            vec![
                "h created",
                "h set title",
                "h el+ content",
                "h write content",
                "h unset title",
                "h el- content",
                "h deleted",
            ]
        );
    }

    #[test]
    fn test_failed_mutation_is_not_reported() {
        let recorder = Arc::new(Recorder::default());
        let wrapped = RepositoryWrapper::new(Arc::new(MemoryRepository::new()), recorder.clone());
        assert!(wrapped.delete_object("missing").is_err());
        assert!(wrapped.create_element("missing", "el").is_err());
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn test_no_hook_forwards() {
        let wrapped = RepositoryWrapper::new(Arc::new(MemoryRepository::new()), NoHook);
        let h = wrapped.create_object(None).unwrap();
        assert!(wrapped.inner().verify_object(&h).unwrap());
    }
}

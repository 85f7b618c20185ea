//! Version publishing
//!
//! A published version is a frozen copy of a tip object under a freshly
//! minted handle, tagged with who published it, when, and which tip it
//! copies.

use crate::error::{RepositoryError, Result};
use crate::object::{DigitalObject, now_millis};
use crate::query::{Query, QueryParams};
use crate::repository::{AttributeMap, RepositoryExt, SharedRepository, collect_all, copy_object};

pub const PUBLISHED_BY: &str = "publishedBy";
pub const PUBLISHED_ON: &str = "publishedOn";
pub const VERSION_OF: &str = "versionOf";
pub const IS_VERSION: &str = "isVersion";

const ANONYMOUS: &str = "anonymous";
const MAX_MINT_ATTEMPTS: u32 = 100;

/// Source of handles for new versions
pub trait HandleMinter: Send + Sync {
    /// Candidate handle for a version of `source`. `attempt` counts earlier
    /// candidates that were already taken.
    fn mint(&self, source: &str, attempt: u32) -> String;
}

/// Mints `prefix/<millis>`, then `prefix/<millis>-1`, `-2`, ... on collision.
/// Without a prefix the source handle is used.
#[derive(Debug, Clone, Default)]
pub struct TimestampHandleMinter {
    prefix: Option<String>,
}

impl TimestampHandleMinter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: Some(prefix.into()) }
    }
}

impl HandleMinter for TimestampHandleMinter {
    fn mint(&self, source: &str, attempt: u32) -> String {
        let prefix = self.prefix.as_deref().unwrap_or(source);
        let millis = now_millis();
        if attempt == 0 {
            format!("{}/{}", prefix, millis)
        } else {
            format!("{}/{}-{}", prefix, millis, attempt)
        }
    }
}

pub struct VersionManager {
    repo: SharedRepository,
    minter: Box<dyn HandleMinter>,
}

impl VersionManager {
    pub fn new(repo: SharedRepository) -> Self {
        Self::with_minter(repo, Box::new(TimestampHandleMinter::default()))
    }

    pub fn with_minter(repo: SharedRepository, minter: Box<dyn HandleMinter>) -> Self {
        Self { repo, minter }
    }

    /// Publish a frozen copy of the tip object `handle`.
    pub fn publish_version(&self, handle: &str, user: Option<&str>) -> Result<DigitalObject> {
        let tip = self
            .repo
            .get_digital_object(handle)?
            .ok_or_else(|| RepositoryError::Version(format!("cannot version missing object {}", handle)))?;
        if let Some(of) = tip.attribute(VERSION_OF)? {
            return Err(RepositoryError::Version(format!(
                "{} is a version of {}; only tip objects can be published",
                handle, of
            )));
        }

        let version = self.mint_object(handle)?;
        let published = (|| -> Result<()> {
            copy_object(&tip, &version)?;
            let mut tags = AttributeMap::new();
            tags.insert(PUBLISHED_BY.to_string(), user.unwrap_or(ANONYMOUS).to_string());
            tags.insert(PUBLISHED_ON.to_string(), now_millis().to_string());
            tags.insert(VERSION_OF.to_string(), handle.to_string());
            tags.insert(IS_VERSION.to_string(), "true".to_string());
            version.set_attributes(&tags)
        })();

        match published {
            Ok(()) => {
                tracing::info!(handle = %handle, version = %version.handle(), "published version");
                Ok(version)
            }
            Err(e) => {
                if let Err(cleanup) = version.delete() {
                    tracing::warn!(version = %version.handle(), "could not remove partial version: {}", cleanup);
                }
                Err(RepositoryError::Version(format!("publishing {} failed: {}", handle, e)))
            }
        }
    }

    /// The tip of `handle` followed by every published version of it
    pub fn versions_of(&self, handle: &str) -> Result<Vec<DigitalObject>> {
        let object = self
            .repo
            .get_digital_object(handle)?
            .ok_or_else(|| RepositoryError::ObjectNotFound(handle.to_string()))?;
        let tip = match object.attribute(VERSION_OF)? {
            Some(of) => of,
            None => handle.to_string(),
        };
        let mut versions = vec![DigitalObject::new(self.repo.clone(), tip.clone())];
        let found = collect_all(self.repo.search(&Query::attribute(VERSION_OF, tip), &QueryParams::default())?)?;
        versions.extend(found);
        Ok(versions)
    }

    fn mint_object(&self, source: &str) -> Result<DigitalObject> {
        for attempt in 0..MAX_MINT_ATTEMPTS {
            let candidate = self.minter.mint(source, attempt);
            match self.repo.create_digital_object(Some(&candidate)) {
                Ok(object) => return Ok(object),
                Err(e) if e.is_already_exists() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(RepositoryError::Version(format!("could not mint a version handle for {}", source)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use std::sync::Arc;

    struct Fixed(&'static str);

    impl HandleMinter for Fixed {
        fn mint(&self, _source: &str, attempt: u32) -> String {
            format!("{}{}", self.0, attempt)
        }
    }

    fn seeded() -> SharedRepository {
        let repo: SharedRepository = Arc::new(MemoryRepository::new());
        let obj = repo.create_digital_object(Some("doc")).unwrap();
        obj.set_attribute("title", "Report").unwrap();
        obj.create_data_element("content").unwrap().write_bytes(b"v1").unwrap();
        repo
    }

    #[test]
    fn test_publish_copies_and_tags() {
        let repo = seeded();
        let versions = VersionManager::new(repo.clone());
        let v = versions.publish_version("doc", Some("alice")).unwrap();
        assert!(v.handle().starts_with("doc/"));
        assert_eq!(v.attribute("title").unwrap().as_deref(), Some("Report"));
        assert_eq!(v.attribute(PUBLISHED_BY).unwrap().as_deref(), Some("alice"));
        assert_eq!(v.attribute(VERSION_OF).unwrap().as_deref(), Some("doc"));
        assert_eq!(v.attribute(IS_VERSION).unwrap().as_deref(), Some("true"));
        assert_eq!(v.data_element("content").read_to_vec().unwrap(), b"v1");

        let anon = versions.publish_version("doc", None).unwrap();
        assert_eq!(anon.attribute(PUBLISHED_BY).unwrap().as_deref(), Some(ANONYMOUS));
    }

    #[test]
    fn test_mint_retries_on_collision() {
        let repo = seeded();
        repo.create_object(Some("v0")).unwrap();
        let versions = VersionManager::with_minter(repo, Box::new(Fixed("v")));
        assert_eq!(versions.publish_version("doc", None).unwrap().handle(), "v1");
    }

    #[test]
    fn test_versions_cannot_be_versioned() {
        let repo = seeded();
        let versions = VersionManager::with_minter(repo, Box::new(Fixed("v")));
        let v = versions.publish_version("doc", None).unwrap();
        let err = versions.publish_version(v.handle(), None).unwrap_err();
        assert!(matches!(err, RepositoryError::Version(_)));
        assert!(matches!(versions.publish_version("missing", None), Err(RepositoryError::Version(_))));
    }

    #[test]
    fn test_versions_of_resolves_tip() {
        let repo = seeded();
        let versions = VersionManager::with_minter(repo, Box::new(Fixed("v")));
        versions.publish_version("doc", None).unwrap();
        versions.publish_version("doc", None).unwrap();
        let from_tip: Vec<String> = versions
            .versions_of("doc")
            .unwrap()
            .iter()
            .map(|o| o.handle().to_string())
            .collect();
        assert_eq!(from_tip, vec!["doc", "v0", "v1"]);
        let from_version: Vec<String> = versions
            .versions_of("v1")
            .unwrap()
            .iter()
            .map(|o| o.handle().to_string())
            .collect();
        assert_eq!(from_version, from_tip);
    }
}

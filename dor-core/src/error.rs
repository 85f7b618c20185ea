//! Error types shared by every repository backend, the sync layer and the
//! transaction log.

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors that can occur during repository operations
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Data element not found: {handle} / {element}")]
    ElementNotFound { handle: String, element: String },

    #[error("Object already exists: {0}")]
    ObjectExists(String),

    #[error("Data element already exists: {handle} / {element}")]
    ElementExists { handle: String, element: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Remote repository error: {0}")]
    Remote(String),

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Replication too far behind: requested transactions since {requested}, earliest retained is {earliest}")]
    ReplicationTooFarBehind { requested: i64, earliest: i64 },

    #[error("Version error: {0}")]
    Version(String),
}

impl RepositoryError {
    pub fn element_not_found(handle: &str, element: &str) -> Self {
        RepositoryError::ElementNotFound {
            handle: handle.to_string(),
            element: element.to_string(),
        }
    }

    pub fn element_exists(handle: &str, element: &str) -> Self {
        RepositoryError::ElementExists {
            handle: handle.to_string(),
            element: element.to_string(),
        }
    }

    /// Object or data element absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RepositoryError::ObjectNotFound(_) | RepositoryError::ElementNotFound { .. }
        )
    }

    /// Handle or element name collision.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            RepositoryError::ObjectExists(_) | RepositoryError::ElementExists { .. }
        )
    }

    /// Storage engine, I/O, serialization or transport failure.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            RepositoryError::Io(_)
                | RepositoryError::Serialization(_)
                | RepositoryError::Database(_)
                | RepositoryError::Remote(_)
        )
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(e: rusqlite::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

impl From<sled::Error> for RepositoryError {
    fn from(e: sled::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

impl From<quick_xml::Error> for RepositoryError {
    fn from(e: quick_xml::Error) -> Self {
        RepositoryError::Serialization(format!("XML: {}", e))
    }
}

impl From<reqwest::Error> for RepositoryError {
    fn from(e: reqwest::Error) -> Self {
        RepositoryError::Remote(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_families() {
        assert!(RepositoryError::ObjectNotFound("x".into()).is_not_found());
        assert!(RepositoryError::element_not_found("x", "y").is_not_found());
        assert!(RepositoryError::element_exists("x", "y").is_already_exists());
        assert!(RepositoryError::Database("locked".into()).is_internal());
        assert!(!RepositoryError::UnsupportedQuery("q".into()).is_internal());
    }

    #[test]
    fn test_io_conversion() {
        let err: RepositoryError = std::io::Error::other("disk gone").into();
        assert!(err.is_internal());
        assert!(err.to_string().contains("disk gone"));
    }
}

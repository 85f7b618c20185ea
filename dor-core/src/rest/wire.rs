//! JSON documents exchanged between the REST-proxy backend and the server

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};
use crate::object::{ElementSnapshot, ObjectSnapshot};
use crate::repository::AttributeMap;

/// Query-string parameter names
pub const PARAM_QUERY: &str = "query";
pub const PARAM_PAGE_SIZE: &str = "pageSize";
pub const PARAM_PAGE_OFFSET: &str = "pageOffset";
pub const PARAM_SORT_FIELDS: &str = "sortFields";
pub const PARAM_RETURNED_FIELDS: &str = "returnedFields";
pub const PARAM_APPEND: &str = "append";
pub const PARAM_GET_SIZE: &str = "getSize";

/// One object: attributes plus per-element attributes and, optionally, payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectView {
    pub id: String,
    #[serde(default)]
    pub attributes: AttributeMap,
    #[serde(default)]
    pub elements: BTreeMap<String, ElementView>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementView {
    #[serde(default)]
    pub attributes: AttributeMap,
    #[serde(rename = "dataAsBase64", default, skip_serializing_if = "Option::is_none")]
    pub data_as_base64: Option<String>,
}

impl ObjectView {
    pub fn from_snapshot(snapshot: &ObjectSnapshot) -> Self {
        Self {
            id: snapshot.handle.clone(),
            attributes: snapshot.attributes.clone(),
            elements: snapshot
                .elements
                .iter()
                .map(|(name, el)| {
                    let view = ElementView {
                        attributes: el.attributes.clone(),
                        data_as_base64: el.data.as_ref().map(|d| STANDARD.encode(d)),
                    };
                    (name.clone(), view)
                })
                .collect(),
        }
    }

    pub fn into_snapshot(self) -> Result<ObjectSnapshot> {
        let mut elements = BTreeMap::new();
        for (name, el) in self.elements {
            let data = match el.data_as_base64 {
                Some(text) => Some(
                    STANDARD
                        .decode(text.as_bytes())
                        .map_err(|e| RepositoryError::Serialization(format!("element {}: {}", name, e)))?,
                ),
                None => None,
            };
            elements.insert(
                name,
                ElementSnapshot {
                    attributes: el.attributes,
                    data,
                },
            );
        }
        Ok(ObjectSnapshot {
            handle: self.id,
            attributes: self.attributes,
            elements,
        })
    }

    /// Keep only the named object attributes; an empty list keeps all
    pub fn project(&mut self, fields: &[String]) {
        if !fields.is_empty() {
            self.attributes.retain(|k, _| fields.contains(k));
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub num_results: usize,
    pub page_offset: usize,
    pub page_size: usize,
    pub results: Vec<ObjectView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeResponse {
    pub size: u64,
}

/// Error document returned with every non-2xx status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
}

impl ErrorBody {
    pub fn from_error(e: &RepositoryError) -> Self {
        let (kind, handle, element) = match e {
            RepositoryError::ObjectNotFound(h) => ("ObjectNotFound", Some(h.clone()), None),
            RepositoryError::ElementNotFound { handle, element } => {
                ("ElementNotFound", Some(handle.clone()), Some(element.clone()))
            }
            RepositoryError::ObjectExists(h) => ("ObjectExists", Some(h.clone()), None),
            RepositoryError::ElementExists { handle, element } => {
                ("ElementExists", Some(handle.clone()), Some(element.clone()))
            }
            RepositoryError::UnsupportedQuery(_) => ("UnsupportedQuery", None, None),
            RepositoryError::Version(_) => ("Version", None, None),
            _ => ("Internal", None, None),
        };
        Self {
            kind: kind.to_string(),
            message: e.to_string(),
            handle,
            element,
        }
    }

    /// Rebuild the typed error on the client side
    pub fn into_error(self) -> RepositoryError {
        let handle = self.handle.unwrap_or_default();
        let element = self.element.unwrap_or_default();
        match self.kind.as_str() {
            "ObjectNotFound" => RepositoryError::ObjectNotFound(handle),
            "ElementNotFound" => RepositoryError::element_not_found(&handle, &element),
            "ObjectExists" => RepositoryError::ObjectExists(handle),
            "ElementExists" => RepositoryError::element_exists(&handle, &element),
            "UnsupportedQuery" => RepositoryError::UnsupportedQuery(self.message),
            "Version" => RepositoryError::Version(self.message),
            _ => RepositoryError::Remote(self.message),
        }
    }
}

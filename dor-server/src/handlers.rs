//! REST route handlers
//!
//! Routes (handles and names are single percent-encoded path segments):
//!   GET    /                         → search (query, pageSize, pageOffset, sortFields, returnedFields)
//!   POST   /                         → create an object under a minted handle
//!   GET    /{h}                      → object view (attributes and element attributes)
//!   POST   /{h}                      → get or create
//!   PUT    /{h}                      → create only; 409 when the handle is taken
//!   DELETE /{h}                      → delete object
//!   POST   /{h}/att                  → batch attribute update (JSON name → value|null)
//!   POST   /{h}/att/{name}           → set one attribute (body is the value)
//!   DELETE /{h}/att/{name}           → delete one attribute
//!   GET    /{h}/el/{e}               → element payload, or {"size": n} with getSize=true
//!   POST   /{h}/el/{e}               → create element if missing; write body when append is given
//!   DELETE /{h}/el/{e}               → delete element
//!   POST   /{h}/el/{e}/att[/{name}]  → element attribute updates
//!   DELETE /{h}/el/{e}/att/{name}    → delete an element attribute
//!
//! Handlers are synchronous and call straight into the backend; the server
//! runs them on the blocking thread pool.

use std::collections::HashMap;
use std::io::Read;

use bytes::Bytes;
use dor_core::repository::{AttributeUpdates, collect_all};
use dor_core::rest::wire::{self, ErrorBody, ObjectView, SearchResponse, SizeResponse};
use dor_core::{DigitalObject, Query, QueryParams, RepositoryError, SharedRepository, SortField};
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use percent_encoding::percent_decode_str;

/// A request reduced to what the routes need
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: String,
    /// Decoded path segments
    pub segments: Vec<String>,
    /// Decoded query parameters; later duplicates win
    pub params: HashMap<String, String>,
    pub body: Bytes,
}

impl RestRequest {
    /// Decode `path` and `query` as they appear on the wire
    pub fn parse(method: &str, path: &str, query: &str, body: Bytes) -> Result<Self, String> {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                percent_decode_str(s)
                    .decode_utf8()
                    .map(|c| c.into_owned())
                    .map_err(|e| format!("bad path segment {:?}: {}", s, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            method: method.to_string(),
            segments,
            params: parse_query(query)?,
            body,
        })
    }
}

fn form_decode(s: &str) -> Result<String, String> {
    let spaced = s.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|c| c.into_owned())
        .map_err(|e| format!("bad query parameter {:?}: {}", s, e))
}

fn parse_query(query: &str) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(form_decode(k)?, form_decode(v)?);
    }
    Ok(map)
}

// ─────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

pub fn json_ok<T: serde::Serialize>(data: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(data) {
        Ok(body) => respond(StatusCode::OK, "application/json", Bytes::from(body)),
        Err(e) => error_response(&RepositoryError::from(e)),
    }
}

fn error_json(status: StatusCode, body: &ErrorBody) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    respond(status, "application/json", Bytes::from(bytes))
}

/// HTTP status for a backend error
pub fn status_for(e: &RepositoryError) -> StatusCode {
    if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_already_exists() {
        StatusCode::CONFLICT
    } else if matches!(e, RepositoryError::UnsupportedQuery(_)) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

pub fn error_response(e: &RepositoryError) -> Response<Full<Bytes>> {
    let status = status_for(e);
    if status.is_server_error() {
        tracing::error!("request failed: {}", e);
    }
    error_json(status, &ErrorBody::from_error(e))
}

pub fn plain_error(status: StatusCode, kind: &str, message: impl Into<String>) -> Response<Full<Bytes>> {
    error_json(
        status,
        &ErrorBody {
            kind: kind.to_string(),
            message: message.into(),
            handle: None,
            element: None,
        },
    )
}

fn bad_request(message: impl Into<String>) -> Response<Full<Bytes>> {
    plain_error(StatusCode::BAD_REQUEST, "BadRequest", message)
}

// ─────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────

/// Route a request to its handler
pub fn dispatch(repo: &SharedRepository, req: &RestRequest) -> Response<Full<Bytes>> {
    match route(repo, req) {
        Ok(resp) => resp,
        Err(e) => error_response(&e),
    }
}

fn route(repo: &SharedRepository, req: &RestRequest) -> dor_core::Result<Response<Full<Bytes>>> {
    let segments: Vec<&str> = req.segments.iter().map(String::as_str).collect();
    match (req.method.as_str(), segments.as_slice()) {
        ("GET", []) => search(repo, req),
        ("POST", []) => {
            let handle = repo.create_object(None)?;
            object_view(repo, &handle)
        }
        ("GET", [h]) => object_view(repo, h),
        ("POST", [h]) => {
            repo.get_or_create_object(h)?;
            object_view(repo, h)
        }
        ("PUT", [h]) => {
            repo.create_object(Some(h))?;
            object_view(repo, h)
        }
        ("DELETE", [h]) => {
            repo.delete_object(h)?;
            Ok(json_ok(&serde_json::json!({})))
        }

        ("POST", [h, "att"]) => set_batch(repo, h, None, &req.body),
        ("POST", [h, "att", name]) => set_one(repo, h, None, name, &req.body),
        ("DELETE", [h, "att", name]) => delete_one(repo, h, None, name),

        ("GET", [h, "el", e]) => read_element(repo, h, e, req),
        ("POST", [h, "el", e]) => write_element(repo, h, e, req),
        ("DELETE", [h, "el", e]) => {
            repo.delete_element(h, e)?;
            Ok(json_ok(&serde_json::json!({})))
        }

        ("POST", [h, "el", e, "att"]) => set_batch(repo, h, Some(*e), &req.body),
        ("POST", [h, "el", e, "att", name]) => set_one(repo, h, Some(*e), name, &req.body),
        ("DELETE", [h, "el", e, "att", name]) => delete_one(repo, h, Some(*e), name),

        (method, _) => Ok(plain_error(
            StatusCode::NOT_FOUND,
            "NoRoute",
            format!("no route for {} /{}", method, req.segments.join("/")),
        )),
    }
}

// ─────────────────────────────────────────────────────
// Objects and search
// ─────────────────────────────────────────────────────

fn object_view(repo: &SharedRepository, handle: &str) -> dor_core::Result<Response<Full<Bytes>>> {
    if !repo.verify_object(handle)? {
        return Err(RepositoryError::ObjectNotFound(handle.to_string()));
    }
    let snapshot = DigitalObject::new(repo.clone(), handle.to_string()).snapshot()?;
    Ok(json_ok(&ObjectView::from_snapshot(&snapshot)))
}

fn number_param(req: &RestRequest, name: &str) -> Result<usize, String> {
    match req.params.get(name) {
        None => Ok(0),
        Some(v) if v.trim().is_empty() => Ok(0),
        Some(v) => v.trim().parse().map_err(|_| format!("{} must be a number, got {:?}", name, v)),
    }
}

fn list_param(req: &RestRequest, name: &str) -> Vec<String> {
    req.params
        .get(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn search(repo: &SharedRepository, req: &RestRequest) -> dor_core::Result<Response<Full<Bytes>>> {
    let (page_size, page_offset) = match (
        number_param(req, wire::PARAM_PAGE_SIZE),
        number_param(req, wire::PARAM_PAGE_OFFSET),
    ) {
        (Ok(size), Ok(offset)) => (size, offset),
        (Err(e), _) | (_, Err(e)) => return Ok(bad_request(e)),
    };
    let query = match req.params.get(wire::PARAM_QUERY) {
        Some(text) if !text.trim().is_empty() => Query::parse(text),
        _ => Query::MatchAll,
    };
    let returned_fields = list_param(req, wire::PARAM_RETURNED_FIELDS);
    let ordering = QueryParams {
        sort_fields: list_param(req, wire::PARAM_SORT_FIELDS)
            .iter()
            .map(|f| SortField::from_transport(f))
            .collect(),
        ..Default::default()
    };

    let handles = collect_all(repo.search_handles(&query, &ordering)?)?;
    let num_results = handles.len();
    let page: Vec<String> = if page_size == 0 {
        handles
    } else {
        handles
            .into_iter()
            .skip(page_offset.saturating_mul(page_size))
            .take(page_size)
            .collect()
    };

    let mut results = Vec::with_capacity(page.len());
    for handle in page {
        let snapshot = DigitalObject::new(repo.clone(), handle).snapshot()?;
        let mut view = ObjectView::from_snapshot(&snapshot);
        view.project(&returned_fields);
        results.push(view);
    }
    tracing::debug!(query = %query.to_query_string(), num_results, "search");
    Ok(json_ok(&SearchResponse {
        num_results,
        page_offset,
        page_size,
        results,
    }))
}

// ─────────────────────────────────────────────────────
// Attributes
// ─────────────────────────────────────────────────────

fn set_batch(
    repo: &SharedRepository,
    handle: &str,
    element: Option<&str>,
    body: &Bytes,
) -> dor_core::Result<Response<Full<Bytes>>> {
    let updates: AttributeUpdates = match serde_json::from_slice(body) {
        Ok(u) => u,
        Err(e) => return Ok(bad_request(format!("attribute batch must be a JSON object: {}", e))),
    };
    repo.set_attributes(handle, element, &updates)?;
    Ok(json_ok(&serde_json::json!({})))
}

fn set_one(
    repo: &SharedRepository,
    handle: &str,
    element: Option<&str>,
    name: &str,
    body: &Bytes,
) -> dor_core::Result<Response<Full<Bytes>>> {
    let value = match std::str::from_utf8(body) {
        Ok(v) => v,
        Err(_) => return Ok(bad_request("attribute value must be UTF-8")),
    };
    repo.set_attribute(handle, element, name, Some(value))?;
    Ok(json_ok(&serde_json::json!({})))
}

fn delete_one(
    repo: &SharedRepository,
    handle: &str,
    element: Option<&str>,
    name: &str,
) -> dor_core::Result<Response<Full<Bytes>>> {
    repo.set_attribute(handle, element, name, None)?;
    Ok(json_ok(&serde_json::json!({})))
}

// ─────────────────────────────────────────────────────
// Data elements
// ─────────────────────────────────────────────────────

fn read_element(
    repo: &SharedRepository,
    handle: &str,
    element: &str,
    req: &RestRequest,
) -> dor_core::Result<Response<Full<Bytes>>> {
    if req.params.get(wire::PARAM_GET_SIZE).map(String::as_str) == Some("true") {
        let size = repo.element_size(handle, element)?;
        return Ok(json_ok(&SizeResponse { size }));
    }
    let mut data = Vec::new();
    repo.read_element(handle, element)?.read_to_end(&mut data)?;
    Ok(respond(StatusCode::OK, "application/octet-stream", Bytes::from(data)))
}

fn write_element(
    repo: &SharedRepository,
    handle: &str,
    element: &str,
    req: &RestRequest,
) -> dor_core::Result<Response<Full<Bytes>>> {
    let append = match req.params.get(wire::PARAM_APPEND).map(String::as_str) {
        None => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(other) => return Ok(bad_request(format!("append must be true or false, got {:?}", other))),
    };
    if !repo.verify_element(handle, element)? {
        repo.create_element(handle, element)?;
    }
    let size = match append {
        Some(append) => repo.write_element(handle, element, &mut req.body.as_ref(), append)?,
        None if !req.body.is_empty() => repo.write_element(handle, element, &mut req.body.as_ref(), false)?,
        None => 0,
    };
    Ok(json_ok(&SizeResponse { size }))
}

//! REST-proxy backend
//!
//! Talks to a remote repository served by `dor-server`. Object snapshots
//! fetched over HTTP are kept in a bounded in-memory mirror so structural
//! reads (element lists, existence checks) do not round-trip. Every mutation
//! is applied to the mirror first and then sent; if the request fails the
//! mirror entry is put back the way it was.
//!
//! The rollback only covers the mirror. When a request fails after the
//! remote already applied it, the two disagree until the next fetch.

pub mod wire;

use std::collections::VecDeque;
use std::io::Read;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};

use crate::error::{RepositoryError, Result};
use crate::object::{ElementSnapshot, ObjectSnapshot, apply_updates};
use crate::query::{Query, QueryParams};
use crate::repository::{AttributeMap, AttributeUpdates, CloseableIter, Repository};
use wire::{ErrorBody, ObjectView, SearchResponse, SizeResponse};

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Page size used when the caller asked for an unbounded result set
const TRANSPORT_PAGE_SIZE: usize = 100;

const MIRROR_CAPACITY: usize = 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone)]
struct MirrorEntry {
    snapshot: ObjectSnapshot,
    /// Cleared by local mutations, whose `internal.modified` only the remote knows
    fresh: bool,
}

type Mirror = Arc<Mutex<LruCache<String, MirrorEntry>>>;

#[derive(Clone)]
struct Endpoint {
    client: Client,
    base: String,
    credentials: Option<(String, String)>,
}

impl Endpoint {
    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base.clone();
        for seg in segments {
            url.push('/');
            url.extend(utf8_percent_encode(seg, PATH_SEGMENT));
        }
        if segments.is_empty() {
            url.push('/');
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        match &self.credentials {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    fn send(&self, builder: RequestBuilder) -> Result<Response> {
        check(builder.send()?)
    }
}

fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let text = resp.text().unwrap_or_default();
    if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
        return Err(body.into_error());
    }
    Err(match status {
        StatusCode::UNAUTHORIZED => RepositoryError::Remote(format!("{}: unauthorized", url)),
        _ => RepositoryError::Remote(format!("{} {}: {}", status, url, text)),
    })
}

/// Repository backed by a remote `dor-server`
pub struct RestRepository {
    endpoint: Endpoint,
    mirror: Mirror,
}

impl RestRepository {
    /// Connect with the default timeouts (30s connect, 90s read)
    pub fn new(base_uri: &str, credentials: Option<(String, String)>) -> Result<Self> {
        Self::with_timeouts(base_uri, credentials, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }

    pub fn with_timeouts(
        base_uri: &str,
        credentials: Option<(String, String)>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        let capacity = NonZeroUsize::new(MIRROR_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            endpoint: Endpoint {
                client,
                base: base_uri.trim_end_matches('/').to_string(),
                credentials,
            },
            mirror: Arc::new(Mutex::new(LruCache::new(capacity))),
        })
    }

    pub fn base_uri(&self) -> &str {
        &self.endpoint.base
    }

    fn remember(&self, view: ObjectView) -> Result<String> {
        let snapshot = view.into_snapshot()?;
        let handle = snapshot.handle.clone();
        self.mirror.lock().put(handle.clone(), MirrorEntry { snapshot, fresh: true });
        Ok(handle)
    }

    /// GET the object and refresh its mirror entry
    fn fetch(&self, handle: &str) -> Result<Option<ObjectSnapshot>> {
        let builder = self.endpoint.request(Method::GET, &[handle]);
        match self.endpoint.send(builder) {
            Ok(resp) => {
                let snapshot = resp.json::<ObjectView>()?.into_snapshot()?;
                self.mirror.lock().put(
                    handle.to_string(),
                    MirrorEntry {
                        snapshot: snapshot.clone(),
                        fresh: true,
                    },
                );
                Ok(Some(snapshot))
            }
            Err(RepositoryError::ObjectNotFound(_)) => {
                self.mirror.lock().pop(handle);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Mirrored snapshot; `fresh` forces a refetch after local mutations
    fn snapshot(&self, handle: &str, fresh: bool) -> Result<ObjectSnapshot> {
        if let Some(entry) = self.mirror.lock().get(handle) {
            if entry.fresh || !fresh {
                return Ok(entry.snapshot.clone());
            }
        }
        self.fetch(handle)?
            .ok_or_else(|| RepositoryError::ObjectNotFound(handle.to_string()))
    }

    fn require_element(&self, handle: &str, name: &str) -> Result<()> {
        if self.snapshot(handle, false)?.elements.contains_key(name) {
            Ok(())
        } else {
            Err(RepositoryError::element_not_found(handle, name))
        }
    }

    /// Apply `change` to the mirror, run `send`, and restore the mirror if it fails
    fn mutate<T>(
        &self,
        handle: &str,
        change: impl FnOnce(&mut ObjectSnapshot),
        send: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let before = {
            let mut mirror = self.mirror.lock();
            let before = mirror.peek(handle).cloned();
            if let Some(entry) = mirror.get_mut(handle) {
                change(&mut entry.snapshot);
                entry.fresh = false;
            }
            before
        };
        match send() {
            Ok(v) => Ok(v),
            Err(e) => {
                let mut mirror = self.mirror.lock();
                match before {
                    Some(entry) if !e.is_not_found() => {
                        mirror.put(handle.to_string(), entry);
                    }
                    _ => {
                        mirror.pop(handle);
                    }
                }
                tracing::warn!(handle = %handle, error = %e, "remote mutation failed, mirror rolled back");
                Err(e)
            }
        }
    }

    fn attribute_segments<'a>(handle: &'a str, element: Option<&'a str>) -> Vec<&'a str> {
        match element {
            None => vec![handle, "att"],
            Some(el) => vec![handle, "el", el, "att"],
        }
    }
}

/// Lazily fetched search results, one page per request
struct SearchPages {
    endpoint: Endpoint,
    mirror: Mirror,
    query: String,
    params: QueryParams,
    next_offset: usize,
    buffered: VecDeque<ObjectView>,
    exhausted: bool,
}

impl SearchPages {
    fn single_page(&self) -> bool {
        self.params.page_size > 0
    }

    fn fetch_page(&mut self) -> Result<()> {
        let page_size = if self.single_page() {
            self.params.page_size
        } else {
            TRANSPORT_PAGE_SIZE
        };
        let mut pairs = vec![
            (wire::PARAM_QUERY, self.query.clone()),
            (wire::PARAM_PAGE_SIZE, page_size.to_string()),
            (wire::PARAM_PAGE_OFFSET, self.next_offset.to_string()),
        ];
        if !self.params.sort_fields.is_empty() {
            let sort: Vec<String> = self.params.sort_fields.iter().map(|f| f.to_transport()).collect();
            pairs.push((wire::PARAM_SORT_FIELDS, sort.join(",")));
        }
        if !self.params.returned_fields.is_empty() {
            pairs.push((wire::PARAM_RETURNED_FIELDS, self.params.returned_fields.join(",")));
        }
        let builder = self.endpoint.request(Method::GET, &[]).query(&pairs);
        let page: SearchResponse = self.endpoint.send(builder)?.json()?;

        let seen = (self.next_offset + 1) * page_size;
        if self.single_page() || page.results.len() < page_size || seen >= page.num_results {
            self.exhausted = true;
        }
        self.next_offset += 1;

        // Projected views lack attributes, so they must not replace mirror entries
        if self.params.returned_fields.is_empty() {
            let mut mirror = self.mirror.lock();
            for view in &page.results {
                let snapshot = view.clone().into_snapshot()?;
                mirror.put(view.id.clone(), MirrorEntry { snapshot, fresh: true });
            }
        }
        self.buffered.extend(page.results);
        Ok(())
    }
}

impl Iterator for SearchPages {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(view) = self.buffered.pop_front() {
                return Some(Ok(view.id));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

impl Repository for RestRepository {
    fn verify_object(&self, handle: &str) -> Result<bool> {
        Ok(self.fetch(handle)?.is_some())
    }

    fn create_object(&self, handle: Option<&str>) -> Result<String> {
        // PUT is create-only on the server, so a taken handle comes back as ObjectExists
        let builder = match handle {
            None => self.endpoint.request(Method::POST, &[]),
            Some(h) => self.endpoint.request(Method::PUT, &[h]),
        };
        let view: ObjectView = self.endpoint.send(builder)?.json()?;
        self.remember(view)
    }

    fn get_or_create_object(&self, handle: &str) -> Result<()> {
        let builder = self.endpoint.request(Method::POST, &[handle]);
        let view: ObjectView = self.endpoint.send(builder)?.json()?;
        self.remember(view)?;
        Ok(())
    }

    fn delete_object(&self, handle: &str) -> Result<()> {
        let builder = self.endpoint.request(Method::DELETE, &[handle]);
        let result = self.endpoint.send(builder);
        self.mirror.lock().pop(handle);
        result.map(|_| ())
    }

    fn list_handles(&self) -> Result<CloseableIter<String>> {
        self.search_handles(&Query::MatchAll, &QueryParams::default())
    }

    fn search_handles(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<String>> {
        Ok(Box::new(SearchPages {
            endpoint: self.endpoint.clone(),
            mirror: self.mirror.clone(),
            query: query.to_query_string(),
            params: params.clone(),
            next_offset: params.page_offset,
            buffered: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn attributes(&self, handle: &str, element: Option<&str>) -> Result<AttributeMap> {
        let snapshot = self.snapshot(handle, true)?;
        snapshot
            .attributes_of(element)
            .cloned()
            .ok_or_else(|| RepositoryError::element_not_found(handle, element.unwrap_or_default()))
    }

    fn set_attributes(&self, handle: &str, element: Option<&str>, updates: &AttributeUpdates) -> Result<()> {
        if let Some(el) = element {
            self.require_element(handle, el)?;
        }
        if updates.is_empty() {
            return Ok(());
        }
        let mut segments = Self::attribute_segments(handle, element);
        let builder = match updates.iter().next() {
            Some((name, value)) if updates.len() == 1 => {
                segments.push(name);
                match value {
                    Some(v) => self.endpoint.request(Method::POST, &segments).body(v.clone()),
                    None => self.endpoint.request(Method::DELETE, &segments),
                }
            }
            _ => self.endpoint.request(Method::POST, &segments).json(updates),
        };
        self.mutate(
            handle,
            |snapshot| {
                if let Some(atts) = snapshot.attributes_of_mut(element) {
                    apply_updates(atts, updates);
                }
            },
            || self.endpoint.send(builder).map(|_| ()),
        )
    }

    fn verify_element(&self, handle: &str, name: &str) -> Result<bool> {
        Ok(self.snapshot(handle, false)?.elements.contains_key(name))
    }

    fn create_element(&self, handle: &str, name: &str) -> Result<()> {
        if self.verify_element(handle, name)? {
            return Err(RepositoryError::element_exists(handle, name));
        }
        let builder = self.endpoint.request(Method::POST, &[handle, "el", name]);
        self.mutate(
            handle,
            |snapshot| {
                snapshot.elements.insert(name.to_string(), ElementSnapshot::default());
            },
            || self.endpoint.send(builder).map(|_| ()),
        )
    }

    fn delete_element(&self, handle: &str, name: &str) -> Result<()> {
        let builder = self.endpoint.request(Method::DELETE, &[handle, "el", name]);
        self.mutate(
            handle,
            |snapshot| {
                snapshot.elements.remove(name);
            },
            || self.endpoint.send(builder).map(|_| ()),
        )
    }

    fn list_elements(&self, handle: &str) -> Result<Vec<String>> {
        Ok(self.snapshot(handle, false)?.elements.into_keys().collect())
    }

    fn read_element(&self, handle: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        let builder = self.endpoint.request(Method::GET, &[handle, "el", name]);
        Ok(Box::new(self.endpoint.send(builder)?))
    }

    fn write_element(&self, handle: &str, name: &str, data: &mut dyn Read, append: bool) -> Result<u64> {
        self.require_element(handle, name)?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let written = buf.len() as u64;
        let builder = self
            .endpoint
            .request(Method::POST, &[handle, "el", name])
            .query(&[(wire::PARAM_APPEND, append.to_string())])
            .body(buf);
        self.mutate(handle, |_| {}, || self.endpoint.send(builder).map(|_| written))
    }

    fn element_size(&self, handle: &str, name: &str) -> Result<u64> {
        let builder = self
            .endpoint
            .request(Method::GET, &[handle, "el", name])
            .query(&[(wire::PARAM_GET_SIZE, "true")]);
        let size: SizeResponse = self.endpoint.send(builder)?.json()?;
        Ok(size.size)
    }

    fn close(&self) -> Result<()> {
        self.mirror.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(base: &str) -> RestRepository {
        RestRepository::new(base, None).unwrap()
    }

    #[test]
    fn test_url_segments_are_escaped() {
        let r = repo("http://localhost:8080/objects/");
        assert_eq!(r.base_uri(), "http://localhost:8080/objects");
        assert_eq!(r.endpoint.url(&[]), "http://localhost:8080/objects/");
        assert_eq!(
            r.endpoint.url(&["a/b", "el", "my file"]),
            "http://localhost:8080/objects/a%2Fb/el/my%20file"
        );
        assert_eq!(r.endpoint.url(&["x-y_z.~"]), "http://localhost:8080/objects/x-y_z.~");
    }

    #[test]
    fn test_mirror_rolls_back_on_failure() {
        let r = repo("http://127.0.0.1:9");
        let mut snap = ObjectSnapshot::new("h");
        snap.attributes.insert("title".into(), "old".into());
        r.mirror.lock().put(
            "h".into(),
            MirrorEntry {
                snapshot: snap.clone(),
                fresh: true,
            },
        );
        let result: Result<()> = r.mutate(
            "h",
            |s| {
                s.attributes.insert("title".into(), "new".into());
            },
            || Err(RepositoryError::Remote("connection refused".into())),
        );
        assert!(result.is_err());
        let entry = r.mirror.lock().get("h").cloned().unwrap();
        assert_eq!(entry.snapshot, snap);
        assert!(entry.fresh);
    }

    #[test]
    fn test_mirror_marks_stale_on_success() {
        let r = repo("http://127.0.0.1:9");
        r.mirror.lock().put(
            "h".into(),
            MirrorEntry {
                snapshot: ObjectSnapshot::new("h"),
                fresh: true,
            },
        );
        r.mutate(
            "h",
            |s| {
                s.elements.insert("content".into(), ElementSnapshot::default());
            },
            || Ok(()),
        )
        .unwrap();
        assert_eq!(r.list_elements("h").unwrap(), vec!["content"]);
        assert!(!r.mirror.lock().get("h").unwrap().fresh);
    }
}

//! Query model
//!
//! Queries are a closed sum type evaluated by pattern matching. The textual
//! form (`objatt_<name>:<value>`, `elatt_<element>_<name>:<value>`, `*:*` and
//! parenthesized boolean groups) is what text-based transports such as the
//! REST backend carry.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};

/// Search query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Query {
    /// Every object
    MatchAll,
    /// Backend-specific text
    Raw(String),
    /// Exact match on an object attribute
    Attribute { name: String, value: String },
    /// Exact match on an attribute of a named data element
    ElementAttribute {
        element: String,
        name: String,
        value: String,
    },
    /// Combination of sub-queries
    Boolean(Vec<BooleanClause>),
}

/// How a clause participates in a boolean query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Occur {
    Must,
    Should,
    MustNot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BooleanClause {
    pub query: Query,
    pub occur: Occur,
}

impl BooleanClause {
    pub fn new(query: Query, occur: Occur) -> Self {
        Self { query, occur }
    }
}

impl Query {
    pub fn attribute(name: impl Into<String>, value: impl Into<String>) -> Self {
        Query::Attribute {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn element_attribute(
        element: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Query::ElementAttribute {
            element: element.into(),
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Query::Raw(text.into())
    }

    /// Interpret a raw query.
    ///
    /// Only `att.name = '<name>' AND att.value = '<value>'` is understood; it
    /// becomes an attribute query. Anything else is `UnsupportedQuery`.
    pub fn resolve_raw(text: &str) -> Result<Query> {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^\s*att\.name\s*=\s*'([^']*)'\s*AND\s*att\.value\s*=\s*'([^']*)'\s*$").ok()
        });
        let caps = pattern
            .as_ref()
            .and_then(|re| re.captures(text))
            .ok_or_else(|| RepositoryError::UnsupportedQuery(text.to_string()))?;
        Ok(Query::attribute(&caps[1], &caps[2]))
    }

    /// Render the textual form
    pub fn to_query_string(&self) -> String {
        let mut out = String::new();
        self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) {
        match self {
            Query::MatchAll => out.push_str("*:*"),
            Query::Raw(text) => out.push_str(text),
            Query::Attribute { name, value } => {
                out.push_str("objatt_");
                escape_field(out, name, false);
                out.push(':');
                quote_value(out, value);
            }
            Query::ElementAttribute {
                element,
                name,
                value,
            } => {
                out.push_str("elatt_");
                escape_field(out, element, true);
                out.push('_');
                escape_field(out, name, false);
                out.push(':');
                quote_value(out, value);
            }
            Query::Boolean(clauses) => {
                out.push('(');
                let mut first = true;
                for clause in clauses {
                    if !first {
                        out.push(' ');
                    }
                    first = false;
                    match clause.occur {
                        Occur::Must => out.push('+'),
                        Occur::MustNot => out.push('-'),
                        Occur::Should => {}
                    }
                    clause.query.write_text(out);
                }
                let all_negative = clauses.iter().all(|c| c.occur == Occur::MustNot);
                if all_negative && !clauses.is_empty() {
                    out.push_str(" *:*");
                }
                out.push(')');
            }
        }
    }

    /// Parse the textual form. Text that does not parse is kept as `Raw`.
    pub fn parse(text: &str) -> Query {
        let mut parser = Parser {
            chars: text.chars().collect(),
            pos: 0,
        };
        match parser.parse_query() {
            Some(q) => {
                parser.skip_ws();
                if parser.pos == parser.chars.len() {
                    q
                } else {
                    Query::Raw(text.to_string())
                }
            }
            None => Query::Raw(text.to_string()),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_string())
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::parse(&text)
    }
}

impl From<Query> for String {
    fn from(q: Query) -> Self {
        q.to_query_string()
    }
}

fn escape_field(out: &mut String, field: &str, escape_underscore: bool) {
    for c in field.chars() {
        if matches!(c, '\\' | ':' | '(' | ')') || c.is_whitespace() || (escape_underscore && c == '_') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn quote_value(out: &mut String, value: &str) {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '(' | ')' | ':'));
    if !needs_quotes {
        out.push_str(value);
        return;
    }
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, s: &str) -> bool {
        let end = self.pos + s.chars().count();
        if end <= self.chars.len() && self.chars[self.pos..end].iter().copied().eq(s.chars()) {
            self.pos = end;
            true
        } else {
            false
        }
    }

    fn parse_query(&mut self) -> Option<Query> {
        self.skip_ws();
        if self.eat("(") {
            return self.parse_group();
        }
        if self.eat("*:*") {
            return Some(Query::MatchAll);
        }
        if self.eat("objatt_") {
            let name = self.parse_field(':')?;
            if !self.eat(":") {
                return None;
            }
            let value = self.parse_value()?;
            return Some(Query::Attribute { name, value });
        }
        if self.eat("elatt_") {
            let element = self.parse_field('_')?;
            if !self.eat("_") {
                return None;
            }
            let name = self.parse_field(':')?;
            if !self.eat(":") {
                return None;
            }
            let value = self.parse_value()?;
            return Some(Query::ElementAttribute {
                element,
                name,
                value,
            });
        }
        None
    }

    fn parse_group(&mut self) -> Option<Query> {
        let mut clauses = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(")") {
                break;
            }
            let occur = if self.eat("+") {
                Occur::Must
            } else if self.eat("-") {
                Occur::MustNot
            } else {
                Occur::Should
            };
            let query = self.parse_query()?;
            clauses.push(BooleanClause { query, occur });
        }
        // Drop the anchoring `*:*` of an all-negative group
        let anchored = clauses.len() > 1
            && clauses.last().is_some_and(|c| c.occur == Occur::Should && c.query == Query::MatchAll)
            && clauses[..clauses.len() - 1].iter().all(|c| c.occur == Occur::MustNot);
        if anchored {
            clauses.pop();
        }
        Some(Query::Boolean(clauses))
    }

    fn parse_field(&mut self, terminator: char) -> Option<String> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\\' {
                self.pos += 1;
                out.push(self.peek()?);
                self.pos += 1;
            } else if c == terminator {
                break;
            } else if c.is_whitespace() || c == '(' || c == ')' {
                return None;
            } else {
                out.push(c);
                self.pos += 1;
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }

    fn parse_value(&mut self) -> Option<String> {
        let mut out = String::new();
        if self.eat("\"") {
            loop {
                let c = self.peek()?;
                self.pos += 1;
                match c {
                    '"' => return Some(out),
                    '\\' => {
                        out.push(self.peek()?);
                        self.pos += 1;
                    }
                    _ => out.push(c),
                }
            }
        }
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == ')' {
                break;
            }
            if c == '\\' {
                self.pos += 1;
                out.push(self.peek()?);
            } else {
                out.push(c);
            }
            self.pos += 1;
        }
        if out.is_empty() { None } else { Some(out) }
    }
}

/// Sort key for search results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    /// Attribute name; `id` / `objectid` sort by handle
    pub name: String,
    /// Descending when set
    pub reverse: bool,
}

impl SortField {
    pub fn ascending(name: impl Into<String>) -> Self {
        Self { name: name.into(), reverse: false }
    }

    pub fn descending(name: impl Into<String>) -> Self {
        Self { name: name.into(), reverse: true }
    }

    /// `name` or `name DESC`
    pub fn to_transport(&self) -> String {
        if self.reverse {
            format!("{} DESC", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn from_transport(text: &str) -> Self {
        let text = text.trim();
        match text.rsplit_once(' ') {
            Some((name, dir)) if dir.eq_ignore_ascii_case("DESC") => Self::descending(name.trim()),
            Some((name, dir)) if dir.eq_ignore_ascii_case("ASC") => Self::ascending(name.trim()),
            _ => Self::ascending(text),
        }
    }
}

/// Pagination, ordering and projection for a search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    /// Zero-based page number
    pub page_offset: usize,
    /// Results per page; 0 means unbounded
    pub page_size: usize,
    pub sort_fields: Vec<SortField>,
    /// Attribute names to return; empty means all
    pub returned_fields: Vec<String>,
}

impl QueryParams {
    pub fn page(page_offset: usize, page_size: usize) -> Self {
        Self {
            page_offset,
            page_size,
            ..Default::default()
        }
    }

    pub fn sorted_by(mut self, field: SortField) -> Self {
        self.sort_fields.push(field);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boolean(clauses: Vec<(Query, Occur)>) -> Query {
        Query::Boolean(
            clauses
                .into_iter()
                .map(|(q, o)| BooleanClause::new(q, o))
                .collect(),
        )
    }

    #[test]
    fn test_textual_form() {
        assert_eq!(Query::MatchAll.to_query_string(), "*:*");
        assert_eq!(Query::attribute("type", "doc").to_query_string(), "objatt_type:doc");
        assert_eq!(
            Query::attribute("title", "hello world").to_query_string(),
            "objatt_title:\"hello world\""
        );
        assert_eq!(
            Query::element_attribute("content", "mimetype", "text/plain").to_query_string(),
            "elatt_content_mimetype:text/plain"
        );
        assert_eq!(
            Query::element_attribute("my_el", "size", "1").to_query_string(),
            "elatt_my\\_el_size:1"
        );
    }

    #[test]
    fn test_all_negative_group_is_anchored() {
        let q = boolean(vec![(Query::attribute("a", "1"), Occur::MustNot)]);
        assert_eq!(q.to_query_string(), "(-objatt_a:1 *:*)");
        assert_eq!(Query::parse("(-objatt_a:1 *:*)"), q);
    }

    #[test]
    fn test_parse_roundtrip_mixed() {
        let q = boolean(vec![
            (Query::attribute("type", "doc"), Occur::Must),
            (Query::element_attribute("my_el", "x:y", "a \"b\""), Occur::Should),
            (
                boolean(vec![(Query::MatchAll, Occur::Should)]),
                Occur::MustNot,
            ),
        ]);
        let text = q.to_query_string();
        assert_eq!(Query::parse(&text), q);
    }

    #[test]
    fn test_unparseable_is_raw() {
        assert_eq!(Query::parse("title:foo"), Query::Raw("title:foo".into()));
        assert_eq!(Query::parse("(objatt_a:1"), Query::Raw("(objatt_a:1".into()));
    }

    #[test]
    fn test_resolve_raw() {
        let q = Query::resolve_raw("att.name = 'type' AND att.value = 'doc'").unwrap();
        assert_eq!(q, Query::attribute("type", "doc"));
        let err = Query::resolve_raw("SELECT * FROM objects").unwrap_err();
        assert!(matches!(err, RepositoryError::UnsupportedQuery(_)));
    }

    #[test]
    fn test_serde_uses_textual_form() {
        let q = Query::attribute("internal.sync", "true");
        let json = serde_json::to_string(&q).unwrap();
        assert_eq!(json, "\"objatt_internal.sync:true\"");
        let back: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn test_sort_field_transport() {
        assert_eq!(SortField::descending("title").to_transport(), "title DESC");
        assert_eq!(SortField::from_transport("title DESC"), SortField::descending("title"));
        assert_eq!(SortField::from_transport("title"), SortField::ascending("title"));
    }
}

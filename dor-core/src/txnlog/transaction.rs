//! Transaction records and their line encoding
//!
//! Current format, one record per line:
//!
//! ```text
//! txn:a=<action>&at=<actual time>&oid=<object id>&ts=<timestamp>[&de=<element>][&kv.<name>=<value>...][&md.<name>=<value>...]
//! ```
//!
//! Keys and values escape `\r \n = & % ? ;` as `%XX` (uppercase hex of the
//! UTF-8 bytes). Lines not starting with `t` use the legacy layout
//! `timestamp|action|objectID|dataElement` with backslash escapes.

use std::fmt;
use std::io::{BufRead, Write};

use crate::error::{RepositoryError, Result};

const TK_ACTION: &str = "a";
const TK_OBJECT_ID: &str = "oid";
const TK_TIMESTAMP: &str = "ts";
const TK_DATA_ELEMENT: &str = "de";
const TK_ACTUAL_TIME: &str = "at";
const TK_ATTRIBUTES: &str = "kv";
const TK_METADATA: &str = "md";

const MSG_TYPE: &str = "txn";

/// Kind of change a transaction records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ObjectAdd,
    ObjectDelete,
    DataUpdate,
    DataDelete,
    Comment,
    AttributeUpdate,
    AttributeDelete,
    LoggedAction,
}

impl Action {
    pub fn code(self) -> i32 {
        match self {
            Action::ObjectAdd => 0,
            Action::ObjectDelete => 1,
            Action::DataUpdate => 2,
            Action::DataDelete => 3,
            Action::Comment => 4,
            Action::AttributeUpdate => 5,
            Action::AttributeDelete => 6,
            Action::LoggedAction => 7,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Action::ObjectAdd,
            1 => Action::ObjectDelete,
            2 => Action::DataUpdate,
            3 => Action::DataDelete,
            4 => Action::Comment,
            5 => Action::AttributeUpdate,
            6 => Action::AttributeDelete,
            7 => Action::LoggedAction,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::ObjectAdd => "object-add",
            Action::ObjectDelete => "object-del",
            Action::DataUpdate => "data-update",
            Action::DataDelete => "data-del",
            Action::Comment => "comment",
            Action::AttributeUpdate => "attribute-update",
            Action::AttributeDelete => "attribute-delete",
            Action::LoggedAction => "logged-action",
        }
    }
}

/// Ordered `(name, value)` pairs carried by a transaction
pub type Headers = Vec<(String, String)>;

/// One log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub action: Action,
    pub object_id: String,
    /// Log-assigned, strictly increasing
    pub timestamp: i64,
    pub data_element: Option<String>,
    /// Object attributes affected by the change
    pub attributes: Option<Headers>,
    /// Informational attributes about the change itself
    pub metadata: Option<Headers>,
    /// Wall-clock time the change happened
    pub actual_time: i64,
}

impl Transaction {
    pub fn new(action: Action, object_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            action,
            object_id: object_id.into(),
            timestamp,
            data_element: None,
            attributes: None,
            metadata: None,
            actual_time: 0,
        }
    }

    pub fn with_data_element(mut self, name: impl Into<String>) -> Self {
        self.data_element = Some(name.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.get_or_insert_with(Vec::new).push((name.into(), value.into()));
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.get_or_insert_with(Vec::new).push((name.into(), value.into()));
        self
    }

    pub fn with_actual_time(mut self, actual_time: i64) -> Self {
        self.actual_time = actual_time;
        self
    }

    /// Encode as one newline-terminated line
    pub fn encode(&self) -> String {
        let mut out = String::from(MSG_TYPE);
        out.push(':');
        let push = |out: &mut String, key: &str, value: &str| {
            if !out.ends_with(':') {
                out.push('&');
            }
            escape_into(out, key);
            out.push('=');
            escape_into(out, value);
        };
        push(&mut out, TK_ACTION, &self.action.code().to_string());
        push(&mut out, TK_ACTUAL_TIME, &self.actual_time.to_string());
        push(&mut out, TK_OBJECT_ID, &self.object_id);
        push(&mut out, TK_TIMESTAMP, &self.timestamp.to_string());
        if let Some(de) = &self.data_element {
            push(&mut out, TK_DATA_ELEMENT, de);
        }
        for (prefix, set) in [(TK_ATTRIBUTES, &self.attributes), (TK_METADATA, &self.metadata)] {
            for (k, v) in set.iter().flatten() {
                push(&mut out, &format!("{}.{}", prefix, k), v);
            }
        }
        out.push('\n');
        out
    }

    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(self.encode().as_bytes())?;
        Ok(())
    }

    /// Decode one line in either format (without its line terminator)
    pub fn decode(line: &str) -> Result<Self> {
        if line.starts_with('t') {
            decode_headers(line)
        } else {
            decode_legacy(line).map_err(|e| {
                RepositoryError::Serialization(format!("Transaction decoding error: {}\n txn:{}", e, line))
            })
        }
    }

    /// Read the next record, skipping blank lines. `None` at end of input.
    pub fn read_from(reader: &mut impl BufRead) -> Result<Option<Self>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(None);
            }
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            let start = buf.iter().position(|b| *b != b'\r').unwrap_or(buf.len());
            if start == buf.len() {
                continue;
            }
            let line = String::from_utf8_lossy(&buf[start..]);
            return Self::decode(&line).map(Some);
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DOTxn[txn:{}; action={}; obj={}", self.timestamp, self.action.name(), self.object_id)?;
        if let Some(de) = &self.data_element {
            write!(f, "; data={}", de)?;
        }
        for (k, v) in self.attributes.iter().flatten() {
            write!(f, "; attribute:{}={}", k, v)?;
        }
        for (k, v) in self.metadata.iter().flatten() {
            write!(f, "; metadata:{}={}", k, v)?;
        }
        write!(f, ";]")
    }
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\r' | '\n' | '=' | '&' | '%' | '?' | ';' => out.push_str(&format!("%{:02X}", c as u32)),
            _ => out.push(c),
        }
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn unescape(s: &str) -> String {
    if !s.contains('%') {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn decode_headers(line: &str) -> Result<Transaction> {
    let body = match line.split_once(':') {
        Some((_, body)) => body,
        None => "",
    };
    let headers: Vec<(String, Option<String>)> = body
        .split('&')
        .filter(|seg| !seg.is_empty())
        .map(|seg| match seg.split_once('=') {
            Some((k, v)) => (unescape(k), Some(unescape(v))),
            None => (unescape(seg), None),
        })
        .collect();

    // Later headers win; names compare case-insensitively
    let get = |name: &str| -> Option<&str> {
        headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    };
    let subset = |prefix: &str| -> Option<Headers> {
        let prefix = format!("{}.", prefix);
        let items: Headers = headers
            .iter()
            .filter(|(k, _)| k.len() > prefix.len() && k.get(..prefix.len()).is_some_and(|p| p.eq_ignore_ascii_case(&prefix)))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone().unwrap_or_default()))
            .collect();
        if items.is_empty() { None } else { Some(items) }
    };
    let number = |name: &str| -> Result<i64> {
        match get(name) {
            None => Ok(0),
            Some(v) => v.trim().parse().map_err(|_| {
                RepositoryError::Serialization(format!("bad {} value {:?} in transaction: {}", name, v, line))
            }),
        }
    };

    let code = match get(TK_ACTION) {
        Some(v) => v.trim().parse::<i32>().unwrap_or(-1),
        None => -1,
    };
    let action = Action::from_code(code)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown action {} in transaction: {}", code, line)))?;

    Ok(Transaction {
        action,
        object_id: get(TK_OBJECT_ID).unwrap_or_default().to_string(),
        timestamp: number(TK_TIMESTAMP)?,
        data_element: get(TK_DATA_ELEMENT).map(str::to_string),
        attributes: subset(TK_ATTRIBUTES),
        metadata: subset(TK_METADATA),
        actual_time: number(TK_ACTUAL_TIME)?,
    })
}

fn unbackslash(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split on `|` not preceded by a backslash escape
fn legacy_fields(line: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '|' => {
                fields.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(&line[start..]);
    fields
}

fn decode_legacy(line: &str) -> std::result::Result<Transaction, String> {
    let fields = legacy_fields(line);
    if fields.len() < 4 {
        return Err("No more fields in transaction".to_string());
    }
    let timestamp: i64 = fields[0].trim().parse().map_err(|e| format!("bad timestamp: {}", e))?;
    let code: i32 = fields[1].trim().parse().map_err(|e| format!("bad action: {}", e))?;
    let action = Action::from_code(code).ok_or_else(|| format!("unknown action {}", code))?;
    let data_element = unbackslash(fields[3]);
    Ok(Transaction {
        action,
        object_id: unbackslash(fields[2]),
        timestamp,
        data_element: if data_element.is_empty() { None } else { Some(data_element) },
        attributes: None,
        metadata: None,
        actual_time: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_layout() {
        let txn = Transaction::new(Action::DataUpdate, "a/b", 42)
            .with_data_element("content")
            .with_actual_time(40);
        assert_eq!(txn.encode(), "txn:a=2&at=40&oid=a/b&ts=42&de=content\n");
    }

    #[test]
    fn test_escaping_survives_decode() {
        let txn = Transaction::new(Action::AttributeUpdate, "x&y=z%;?\r\n", 7)
            .with_attribute("title", "a=b&c")
            .with_attribute("é", "ü")
            .with_metadata("user", "bob;admin");
        let line = txn.encode();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("oid=x%26y%3Dz%25%3B%3F%0D%0A"));
        assert_eq!(Transaction::decode(line.trim_end()).unwrap(), txn);
    }

    #[test]
    fn test_legacy_line() {
        let txn = Transaction::decode("1000|2|some\\|id|content").unwrap();
        assert_eq!(txn.timestamp, 1000);
        assert_eq!(txn.action, Action::DataUpdate);
        assert_eq!(txn.object_id, "some|id");
        assert_eq!(txn.data_element.as_deref(), Some("content"));

        let no_element = Transaction::decode("1001|1|obj|").unwrap();
        assert_eq!(no_element.data_element, None);
    }

    #[test]
    fn test_corrupt_legacy_line_reports_raw_text() {
        let err = Transaction::decode("12x|2|obj|el").unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("txn:12x|2|obj|el"));
        assert!(Transaction::decode("1000|2|obj").is_err());
    }

    #[test]
    fn test_read_skips_blank_lines() {
        let data = "\n\r\ntxn:a=0&at=0&oid=h&ts=5\n\n999|1|old|\n";
        let mut reader = Cursor::new(data.as_bytes());
        let first = Transaction::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(first.object_id, "h");
        let second = Transaction::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(second.timestamp, 999);
        assert!(Transaction::read_from(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_display() {
        let txn = Transaction::new(Action::AttributeUpdate, "h", 3)
            .with_attribute("k", "v")
            .with_metadata("m", "n");
        assert_eq!(
            txn.to_string(),
            "DOTxn[txn:3; action=attribute-update; obj=h; attribute:k=v; metadata:m=n;]"
        );
    }
}

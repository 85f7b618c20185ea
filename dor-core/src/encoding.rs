//! Reversible file-name encoding for handles and element names
//!
//! Control characters, space, DEL, `<>:"/\|?*` and `%` become `%XX`
//! (uppercase hex of each UTF-8 byte). Everything else is kept verbatim.

use crate::error::{RepositoryError, Result};

fn must_escape(b: u8) -> bool {
    b <= 31
        || b == 127
        || matches!(b, b' ' | b'<' | b'>' | b':' | b'"' | b'/' | b'\\' | b'|' | b'?' | b'*' | b'%')
}

/// Encode a string for use as a single path component
pub fn encode_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii() && must_escape(c as u8) {
            out.push_str(&format!("%{:02X}", c as u8));
        } else {
            out.push(c);
        }
    }
    // "." and ".." are not usable as directory entries
    if out == "." || out == ".." {
        out = out.replace('.', "%2E");
    }
    out
}

/// Reverse [`encode_file_name`]
pub fn decode_file_name(encoded: &str) -> Result<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded
                .get(i + 1..i + 3)
                .ok_or_else(|| RepositoryError::Serialization(format!("truncated escape in {}", encoded)))?;
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| RepositoryError::Serialization(format!("bad escape in {}", encoded)))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

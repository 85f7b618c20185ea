//! The per-object `attributes` file
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <do id="HANDLE">
//! <att name="NAME" value="VALUE"/>
//! <el id="ELEMENT">
//! <att name="NAME" value="VALUE"/>
//! </el>
//! </do>
//! ```

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::{RepositoryError, Result};
use crate::object::{ElementSnapshot, ObjectSnapshot};
use crate::repository::AttributeMap;

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' => out.push_str("&#9;"),
            '\r' => out.push_str("&#13;"),
            '\n' => out.push_str("&#10;"),
            _ => out.push(c),
        }
    }
}

fn write_atts(out: &mut String, atts: &AttributeMap) {
    let mut names: Vec<&String> = atts.keys().collect();
    names.sort();
    for name in names {
        out.push_str("<att name=\"");
        escape_into(out, name);
        out.push_str("\" value=\"");
        escape_into(out, &atts[name]);
        out.push_str("\"/>\n");
    }
}

/// Serialize the attributes of an object and its elements
pub fn encode(object: &ObjectSnapshot) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<do id=\"");
    escape_into(&mut out, &object.handle);
    out.push_str("\">\n");
    write_atts(&mut out, &object.attributes);
    for (name, el) in &object.elements {
        out.push_str("<el id=\"");
        escape_into(&mut out, name);
        out.push_str("\">\n");
        write_atts(&mut out, &el.attributes);
        out.push_str("</el>\n");
    }
    out.push_str("</do>\n");
    out
}

fn xml_error(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Serialization(format!("attributes file: {}", e))
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(xml_error)?;
        if a.key.as_ref() == key {
            return Ok(Some(a.unescape_value().map_err(xml_error)?.into_owned()));
        }
    }
    Ok(None)
}

/// Parse an attributes file. Element payloads are not part of it.
pub fn decode(text: &str) -> Result<ObjectSnapshot> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut object: Option<ObjectSnapshot> = None;
    let mut current_el: Option<(String, ElementSnapshot)> = None;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"do" => {
                let id = attr(&e, b"id")?.ok_or_else(|| xml_error("<do> without id"))?;
                object = Some(ObjectSnapshot::new(id));
            }
            Event::Start(e) if e.name().as_ref() == b"el" => {
                let id = attr(&e, b"id")?.ok_or_else(|| xml_error("<el> without id"))?;
                current_el = Some((id, ElementSnapshot::default()));
            }
            Event::Empty(e) if e.name().as_ref() == b"el" => {
                let id = attr(&e, b"id")?.ok_or_else(|| xml_error("<el> without id"))?;
                let obj = object.as_mut().ok_or_else(|| xml_error("<el> outside <do>"))?;
                obj.elements.insert(id, ElementSnapshot::default());
            }
            Event::End(e) if e.name().as_ref() == b"el" => {
                let (id, el) = current_el.take().ok_or_else(|| xml_error("unbalanced </el>"))?;
                let obj = object.as_mut().ok_or_else(|| xml_error("<el> outside <do>"))?;
                obj.elements.insert(id, el);
            }
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"att" => {
                let name = attr(&e, b"name")?.ok_or_else(|| xml_error("<att> without name"))?;
                let value = attr(&e, b"value")?.unwrap_or_default();
                match (&mut current_el, &mut object) {
                    (Some((_, el)), _) => {
                        el.attributes.insert(name, value);
                    }
                    (None, Some(obj)) => {
                        obj.attributes.insert(name, value);
                    }
                    (None, None) => return Err(xml_error("<att> outside <do>")),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    object.ok_or_else(|| xml_error("missing <do> element"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut obj = ObjectSnapshot::new("a/b");
        obj.attributes.insert("title".into(), "Hello".into());
        let text = encode(&obj);
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<do id=\"a/b\">\n"));
        assert!(text.contains("<att name=\"title\" value=\"Hello\"/>"));
        assert!(text.ends_with("</do>\n"));
    }

    #[test]
    fn test_decode_preserves_awkward_values() {
        let mut obj = ObjectSnapshot::new("h<&>\"'");
        obj.attributes
            .insert("multi".into(), "line one\nline\ttwo\r\n & <three> 'q' \"d\"".into());
        let mut el = ElementSnapshot::default();
        el.attributes.insert("mimetype".into(), "text/plain".into());
        obj.elements.insert("content".into(), el);
        obj.elements.insert("empty".into(), ElementSnapshot::default());

        let back = decode(&encode(&obj)).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("").is_err());
        assert!(decode("<att name=\"x\" value=\"y\"/>").is_err());
    }
}

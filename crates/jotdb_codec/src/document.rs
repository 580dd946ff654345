//! JSON document codec.

use serde_json::Value;

/// Encodes a document as a single JSON line, without the trailing newline.
///
/// One rewrite is applied on top of plain JSON: every boolean object value
/// serialized as `:true` is followed by a space, so that `true` and `false`
/// occupy the same number of bytes. Toggling a boolean therefore never
/// changes the encoded byte length, which keeps the in-place overwrite path
/// available for the most common kind of update.
pub fn encode_document(doc: &Value) -> String {
    normalize_booleans(&doc.to_string())
}

/// Decodes one line back into a document.
///
/// Returns `None` for malformed lines and for lines that are not JSON
/// objects; callers count and skip them.
pub fn decode_document(line: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.is_object().then_some(value)
}

/// Whether a stored line holds a live document.
///
/// Tombstoned lines have their leading byte overwritten with `-` and no
/// longer start with `{`.
#[must_use]
pub fn is_live_line(line: &str) -> bool {
    line.as_bytes().first() == Some(&b'{')
}

/// Inserts a space after every `:true` object value.
///
/// The scan tracks JSON string state so that text content like `":true"`
/// is never rewritten. Only ASCII spaces are inserted, so the output is
/// valid UTF-8 whenever the input was.
fn normalize_booleans(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        out.push(b);

        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match b {
            b'"' => {
                in_string = true;
                i += 1;
            }
            b':' if bytes[i + 1..].starts_with(b"true")
                && matches!(bytes.get(i + 5), Some(b',') | Some(b'}')) =>
            {
                out.extend_from_slice(b"true ");
                i += 5;
            }
            _ => i += 1,
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_simple_document() {
        let doc = json!({"id": "A", "n": 1, "tags": ["x", "y"], "meta": {"a": null}});
        let line = encode_document(&doc);
        assert_eq!(decode_document(&line), Some(doc));
    }

    #[test]
    fn boolean_toggle_preserves_length() {
        let on = json!({"id": "X", "active": true, "n": 3});
        let off = json!({"id": "X", "active": false, "n": 3});
        assert_eq!(encode_document(&on).len(), encode_document(&off).len());
    }

    #[test]
    fn multiple_booleans_all_normalized() {
        let doc = json!({"a": true, "b": false, "c": true});
        let line = encode_document(&doc);
        let toggled = json!({"a": false, "b": true, "c": false});
        assert_eq!(line.len(), encode_document(&toggled).len());
        assert_eq!(decode_document(&line), Some(doc));
    }

    #[test]
    fn true_inside_string_untouched() {
        let doc = json!({"s": ":true,", "t": "\":true}"});
        let line = encode_document(&doc);
        assert_eq!(decode_document(&line), Some(doc));
        // The string content keeps its exact bytes.
        assert!(line.contains(":true,\""));
    }

    #[test]
    fn trailing_boolean_before_brace() {
        let doc = json!({"z": true});
        let line = encode_document(&doc);
        assert_eq!(line, "{\"z\":true }");
    }

    #[test]
    fn multibyte_strings_survive_normalization() {
        let doc = json!({"flag": true, "name": "héllo 世界", "n": 1});
        let line = encode_document(&doc);
        assert_eq!(decode_document(&line), Some(doc));
    }

    #[test]
    fn malformed_line_decodes_to_none() {
        assert_eq!(decode_document("{broken"), None);
        assert_eq!(decode_document(""), None);
        assert_eq!(decode_document("-\"id\":1}"), None);
    }

    #[test]
    fn non_object_decodes_to_none() {
        assert_eq!(decode_document("[1,2,3]"), None);
        assert_eq!(decode_document("42"), None);
    }

    #[test]
    fn tombstoned_line_not_live() {
        assert!(is_live_line("{\"a\":1}"));
        assert!(!is_live_line("-\"a\":1}"));
        assert!(!is_live_line(""));
    }
}

use serde_json::Value;

use crate::error::ObserverError;

/// Encodes a payload into its canonical JSON byte form: recursively
/// codepoint-sorted object keys, `,` / `:` separators with no insignificant
/// whitespace, ASCII-only output, integers emitted without decimal points.
///
/// # Errors
/// Returns [`ObserverError::Canonicalization`] when the payload carries a
/// float or other non-integer number.
pub fn canonical_bytes(payload: &Value) -> Result<Vec<u8>, ObserverError> {
    let mut out = Vec::new();
    write_value(payload, &mut out)?;
    Ok(out)
}

/// Byte length of the canonical encoding.
///
/// # Errors
/// Same failure conditions as [`canonical_bytes`].
pub fn canonical_len(payload: &Value) -> Result<usize, ObserverError> {
    Ok(canonical_bytes(payload)?.len())
}

/// Checks canonical-safety without producing the encoding.
///
/// # Errors
/// Returns [`ObserverError::Canonicalization`] when any numeric leaf is not
/// a 64-bit integer.
pub fn validate(payload: &Value) -> Result<(), ObserverError> {
    match payload {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(number) => {
            if number.as_i64().is_some() || number.as_u64().is_some() {
                Ok(())
            } else {
                Err(float_error())
            }
        }
        Value::Array(items) => items.iter().try_for_each(validate),
        Value::Object(fields) => fields.values().try_for_each(validate),
    }
}

fn float_error() -> ObserverError {
    ObserverError::Canonicalization("float is not allowed in canonical payloads".to_string())
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), ObserverError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(number) => {
            if let Some(signed) = number.as_i64() {
                out.extend_from_slice(signed.to_string().as_bytes());
            } else if let Some(unsigned) = number.as_u64() {
                out.extend_from_slice(unsigned.to_string().as_bytes());
            } else {
                return Err(float_error());
            }
        }
        Value::String(text) => write_string(text, out),
        Value::Array(items) => {
            out.push(b'[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(fields) => {
            let mut entries: Vec<(&String, &Value)> = fields.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            out.push(b'{');
            for (position, (key, item)) in entries.iter().enumerate() {
                if position > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(item, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

// ASCII-only string form: shorthand escapes for the usual control characters,
// \u00XX for the rest below 0x20, \uXXXX (UTF-16 units, surrogate pairs above
// the BMP) for everything outside ASCII.
fn write_string(text: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for ch in text.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\u{0008}' => out.extend_from_slice(b"\\b"),
            '\u{000C}' => out.extend_from_slice(b"\\f"),
            ch if ch.is_ascii_control() => write_unicode_escape(ch as u16, out),
            ch if ch.is_ascii() => out.push(ch as u8),
            ch => {
                let mut units = [0_u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write_unicode_escape(*unit, out);
                }
            }
        }
    }
    out.push(b'"');
}

fn write_unicode_escape(unit: u16, out: &mut Vec<u8>) {
    out.extend_from_slice(format!("\\u{unit:04x}").as_bytes());
}

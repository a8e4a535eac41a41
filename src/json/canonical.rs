use std::collections::BTreeMap;
use std::io::{self, Write};

use serde_json::value::RawValue;
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// parse a json document, keeping numeric literals exactly as written
pub fn parse(bytes: &[u8], context: &str) -> Result<Value> {
    let raw: &RawValue = serde_json::from_slice(bytes).map_err(|e| Error::json(context, e))?;
    from_raw(raw).map_err(|e| Error::json(context, e))
}

// the number scanner rewrites exponents (`1E5` becomes `1e+5`), so numbers
// are rebuilt from the source slice instead
fn from_raw(raw: &RawValue) -> serde_json::Result<Value> {
    let text = raw.get();
    match text.as_bytes().first() {
        Some(b'{') => {
            let members: BTreeMap<String, &RawValue> = serde_json::from_str(text)?;
            members
                .into_iter()
                .map(|(key, value)| Ok((key, from_raw(value)?)))
                .collect::<serde_json::Result<Map<_, _>>>()
                .map(Value::Object)
        }
        Some(b'[') => {
            let items: Vec<&RawValue> = serde_json::from_str(text)?;
            items
                .into_iter()
                .map(from_raw)
                .collect::<serde_json::Result<Vec<_>>>()
                .map(Value::Array)
        }
        // already validated as a number literal by the raw parse
        Some(b'-' | b'0'..=b'9') => Ok(Value::Number(Number::from_string_unchecked(
            text.to_string(),
        ))),
        _ => serde_json::from_str(text),
    }
}

/// parse a json document that must be an object
pub fn parse_object(bytes: &[u8], context: &str) -> Result<Map<String, Value>> {
    expect_object(parse(bytes, context)?, context)
}

pub fn expect_object(value: Value, context: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::NotObject(context.to_string())),
    }
}

/// read an integer field, refusing values that do not fit in an i64
pub fn i64_field(map: &Map<String, Value>, key: &str) -> Result<Option<i64>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => number_to_i64(n).map(Some),
        Some(other) => Err(Error::Malformed {
            what: "number",
            message: format!("{key} is not a number: {other}"),
        }),
    }
}

fn number_to_i64(n: &Number) -> Result<i64> {
    if let Some(v) = n.as_i64() {
        return Ok(v);
    }
    let literal = n.to_string();
    let integral = literal
        .strip_prefix('-')
        .unwrap_or(&literal)
        .bytes()
        .all(|b| b.is_ascii_digit());
    if integral {
        Err(Error::NumberOverflow(literal))
    } else {
        Err(Error::Malformed {
            what: "number",
            message: format!("{literal} is not an integer"),
        })
    }
}

/// serialize with sorted keys and no insignificant whitespace
pub fn to_canonical_vec(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    // writing into a Vec cannot fail
    let _ = write_canonical(&mut out, value);
    out
}

pub fn to_canonical_string(value: &Value) -> String {
    // canonical output is built from valid utf-8 pieces only
    String::from_utf8_lossy(&to_canonical_vec(value)).into_owned()
}

/// indented form for display and developer-friendly checkouts
pub fn to_pretty_vec(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| Error::json("pretty output", e))
}

pub fn write_canonical<W: Write>(out: &mut W, value: &Value) -> io::Result<()> {
    match value {
        Value::Null => out.write_all(b"null"),
        Value::Bool(true) => out.write_all(b"true"),
        Value::Bool(false) => out.write_all(b"false"),
        // the literal as parsed
        Value::Number(n) => out.write_all(n.to_string().as_bytes()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.write_all(b"[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_all(b",")?;
                }
                write_canonical(out, item)?;
            }
            out.write_all(b"]")
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.write_all(b"{")?;
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.write_all(b",")?;
                }
                write_string(out, key)?;
                out.write_all(b":")?;
                write_canonical(out, &map[key])?;
            }
            out.write_all(b"}")
        }
    }
}

fn write_string<W: Write>(out: &mut W, s: &str) -> io::Result<()> {
    serde_json::to_writer(&mut *out, s).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_sorted_without_whitespace() {
        let v = parse(br#"{ "b": 1, "a": [true, null, {"z": "x", "y": 2}] }"#, "test").unwrap();
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":[true,null,{"y":2,"z":"x"}],"b":1}"#
        );
    }

    #[test]
    fn test_numbers_verbatim() {
        let src = r#"{"big":123456789012345678901234567890,"dec":1.10,"exp":1e400,"neg":-0}"#;
        let v = parse(src.as_bytes(), "test").unwrap();
        assert_eq!(to_canonical_string(&v), src);
    }

    #[test]
    fn test_exponent_spelling_survives_reencoding() {
        let src = r#"{"a":[1E5,2e-3,3E+07],"b":{"c":-0.5e10}}"#;
        let once = to_canonical_string(&parse(src.as_bytes(), "test").unwrap());
        assert_eq!(once, src);
        let twice = to_canonical_string(&parse(once.as_bytes(), "test").unwrap());
        assert_eq!(twice, src);
    }

    #[test]
    fn test_whitespace_around_numbers_is_dropped() {
        let v = parse(b" [ 1e2 , { \"k\" : 7 } ] ", "test").unwrap();
        assert_eq!(to_canonical_string(&v), r#"[1e2,{"k":7}]"#);
        assert!(parse(b"[1e]", "test").is_err());
    }

    #[test]
    fn test_canonical_is_idempotent() {
        let v = parse(br#"{"k":{"b":"\u00e9\n","a":0.5}}"#, "test").unwrap();
        let once = to_canonical_vec(&v);
        let twice = to_canonical_vec(&parse(&once, "test").unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_minimal_escapes() {
        let v = Value::String("é/\"\u{1}".to_string());
        assert_eq!(to_canonical_string(&v), "\"é/\\\"\\u0001\"");
    }

    #[test]
    fn test_malformed_and_not_object() {
        assert!(matches!(parse(b"{", "x"), Err(Error::Json { .. })));
        assert!(matches!(parse_object(b"[1]", "x"), Err(Error::NotObject(_))));
    }

    #[test]
    fn test_i64_field_overflow() {
        let map = parse_object(br#"{"rev":99999999999999999999,"ok":7,"f":1.5}"#, "x").unwrap();
        assert_eq!(i64_field(&map, "ok").unwrap(), Some(7));
        assert_eq!(i64_field(&map, "absent").unwrap(), None);
        assert!(matches!(i64_field(&map, "rev"), Err(Error::NumberOverflow(_))));
        assert!(matches!(i64_field(&map, "f"), Err(Error::Malformed { .. })));
    }
}

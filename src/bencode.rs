//! # Bencode Facade
//!
//! This module wraps the bencode (de)serializer behind a small surface the
//! rest of the client consumes: decoding arbitrary input into a tagged value,
//! rendering decoded values as JSON, and typed accessors for the open
//! dictionaries carried by protocol extensions.
//!
//! ## Value Model
//!
//! A bencoded document is one of four shapes:
//!
//! - **Integer**: `i52e`
//! - **Byte string**: `5:hello`
//! - **List**: `l5:helloi52ee`
//! - **Dictionary**: `d3:fooi42ee` (keys are byte strings, sorted)
//!
//! Fixed-shape documents (metainfo, tracker responses) are decoded directly
//! into serde structs by their owning modules. This facade is for the places
//! where the shape is open-ended: the `decode` command and the BEP-10
//! extension payloads, whose dictionaries are inspected field by field.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_bencode::value::Value;

/// Decode a bencoded byte stream into a tagged value.
///
/// Only the leading value is decoded; trailing bytes are ignored, which the
/// extension-payload consumers rely on (a metadata data message appends the
/// raw metadata after its bencoded header).
pub fn decode(buf: &[u8]) -> Result<Value> {
    match serde_bencode::from_bytes::<Value>(buf) {
        Ok(value) => Ok(value),
        Err(_) => Err(anyhow!("could not decode bencoded value")),
    }
}

/// Encode a value back into its bencoded byte stream.
///
/// Takes anything serde can serialize: a decoded `Value`, or the fixed
/// shapes the metainfo and extension modules define. The info hash depends
/// on this encoding being canonical.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    match serde_bencode::to_bytes(value) {
        Ok(buf) => Ok(buf),
        Err(_) => Err(anyhow!("could not encode bencoded value")),
    }
}

/// Render a decoded value as JSON.
///
/// Byte strings become JSON strings (lossy UTF-8), dictionaries become
/// objects with their keys sorted, matching canonical bencode key order.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Bytes(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Dict(entries) => {
            // Sort keys so the rendering is deterministic
            let mut keys: Vec<&Vec<u8>> = entries.keys().collect();
            keys.sort();

            let mut object = serde_json::Map::new();
            for key in keys {
                let rendered_key = String::from_utf8_lossy(key).into_owned();
                object.insert(rendered_key, to_json(&entries[key]));
            }
            serde_json::Value::Object(object)
        }
    }
}

/// Look up a key in a dictionary value.
pub fn dict_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Dict(entries) => entries.get(key.as_bytes()),
        _ => None,
    }
}

/// Read a value as an integer.
pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        _ => None,
    }
}

/// Read a value as a byte string.
#[allow(dead_code)]
pub fn as_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Bytes(bytes) => Some(bytes),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_byte_string() {
        let value = decode(b"5:hello").unwrap();
        assert_eq!(to_json(&value).to_string(), "\"hello\"");
    }

    #[test]
    fn decode_integer() {
        let value = decode(b"i52e").unwrap();
        assert_eq!(as_int(&value), Some(52));
        assert_eq!(to_json(&value).to_string(), "52");
    }

    #[test]
    fn decode_list() {
        let value = decode(b"l5:helloi52ee").unwrap();
        assert_eq!(to_json(&value).to_string(), "[\"hello\",52]");
    }

    #[test]
    fn decode_dict_sorts_keys_in_json() {
        let value = decode(b"d3:aaai2e3:zzzi1ee").unwrap();
        assert_eq!(to_json(&value).to_string(), "{\"aaa\":2,\"zzz\":1}");
    }

    #[test]
    fn decode_invalid_input() {
        assert!(decode(b"spam").is_err());
    }

    #[test]
    fn encode_round_trips() {
        let input = b"l5:helloi52ee";
        let value = decode(input).unwrap();
        assert_eq!(encode(&value).unwrap(), input);
    }

    #[test]
    fn dict_accessors() {
        let value = decode(b"d1:md11:ut_metadatai3ee4:name4:spame").unwrap();
        let metadata_id = dict_get(&value, "m")
            .and_then(|m| dict_get(m, "ut_metadata"))
            .and_then(as_int);
        assert_eq!(metadata_id, Some(3));

        let name = dict_get(&value, "name").and_then(as_bytes);
        assert_eq!(name, Some(&b"spam"[..]));
        assert!(dict_get(&value, "missing").is_none());
    }
}

//! RFC 3986 percent-encoding and query-string flattening
//!
//! Two flavours are provided. The strict flavour escapes everything outside
//! the unreserved set (`A-Z a-z 0-9 - . _ ~`) and writes spaces as `%20`. The
//! form flavour is identical except that spaces become `+`, which is what
//! browsers send for `application/x-www-form-urlencoded` bodies.
//!
//! # Examples
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use ferry::encoding::{self, QueryValue};
//!
//! let params = BTreeMap::from([
//!     ("model".to_string(), QueryValue::from("458 Italia")),
//!     ("make".to_string(), QueryValue::from("Ferrari")),
//! ]);
//!
//! assert_eq!(encoding::encode_query(&params), "make=Ferrari&model=458%20Italia");
//! assert_eq!(encoding::form_encode_query(&params), "make=Ferrari&model=458+Italia");
//! ```

use std::collections::BTreeMap;

use crate::Result;

/// A value that can be flattened into a query string.
///
/// Lists flatten as `key[0]=a&key[1]=b`, maps as `key[sub]=value`, and both
/// nest arbitrarily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    /// A plain string value
    Text(String),
    /// An ordered list of values
    List(Vec<QueryValue>),
    /// A nested mapping, flattened with its keys in lexical order
    Map(BTreeMap<String, QueryValue>),
}

/// Percent-encode a string according to RFC 3986, spaces as `%20`.
pub fn encode(input: &str) -> String {
    urlencoding::encode(input).into_owned()
}

/// Percent-encode a string according to RFC 3986, spaces as `+`.
pub fn form_encode(input: &str) -> String {
    urlencoding::encode(input).replace("%20", "+")
}

/// Decode a strictly percent-encoded string.
pub fn decode(input: &str) -> Result<String> {
    Ok(urlencoding::decode(input)?.into_owned())
}

/// Decode a form-encoded string, turning `+` back into spaces.
pub fn form_decode(input: &str) -> Result<String> {
    decode(&input.replace('+', " "))
}

/// Flatten a mapping into a query string using the strict encoding.
pub fn encode_query(params: &BTreeMap<String, QueryValue>) -> String {
    flatten_map(params, encode)
}

/// Flatten a mapping into a query string using the form encoding.
pub fn form_encode_query(params: &BTreeMap<String, QueryValue>) -> String {
    flatten_map(params, form_encode)
}

fn flatten_map(params: &BTreeMap<String, QueryValue>, escape: fn(&str) -> String) -> String {
    let mut pairs = Vec::new();
    for (key, value) in params {
        flatten_value(&escape(key), value, escape, &mut pairs);
    }
    pairs.join("&")
}

fn flatten_value(
    prefix: &str,
    value: &QueryValue,
    escape: fn(&str) -> String,
    pairs: &mut Vec<String>,
) {
    match value {
        QueryValue::Text(text) => pairs.push(format!("{}={}", prefix, escape(text))),
        QueryValue::List(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_value(&format!("{}[{}]", prefix, index), item, escape, pairs);
            }
        }
        QueryValue::Map(map) => {
            for (key, item) in map {
                flatten_value(&format!("{}[{}]", prefix, escape(key)), item, escape, pairs);
            }
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u64> for QueryValue {
    fn from(value: u64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        Self::Text(value.to_string())
    }
}

impl<T: Into<QueryValue>> From<Vec<T>> for QueryValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, QueryValue>> for QueryValue {
    fn from(map: BTreeMap<String, QueryValue>) -> Self {
        Self::Map(map)
    }
}

impl From<&serde_json::Value> for QueryValue {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Text(String::new()),
            Value::String(text) => Self::Text(text.clone()),
            Value::Bool(_) | Value::Number(_) => Self::Text(value.to_string()),
            Value::Array(items) => Self::List(items.iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(key, item)| (key.clone(), Self::from(item)))
                    .collect(),
            ),
        }
    }
}

//! # Values and Records
//!
//! The decoded, owned form of command arguments and responses. A [`Record`]
//! maps field names to [`Value`]s; an optional field that was not supplied is
//! simply absent from the map.

use std::collections::BTreeMap;

use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unicode(String),
    Boolean(bool),
    Integer(i64),
    Bytes(Vec<u8>),
    /// Nested records, for both plain and compressed lists.
    List(Vec<Record>),
    /// Scalars of one type.
    Items(Vec<Value>),
    Json(serde_json::Value),
    Url(Url),
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Unicode(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Unicode(v.to_owned())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Record>> for Value {
    fn from(v: Vec<Record>) -> Self {
        Value::List(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Items(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Items(v.into_iter().map(Value::Unicode).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Url> for Value {
    fn from(v: Url) -> Self {
        Value::Url(v)
    }
}

/// A set of named values, as carried by one call or one answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(BTreeMap<String, Value>);

macro_rules! getter {
    ($name:ident, $opt:ident, $variant:ident, $out:ty, $expected:literal, |$v:ident| $conv:expr) => {
        #[doc = concat!("Reads a required ", $expected, " field.")]
        pub fn $name(&self, field: &str) -> Result<$out> {
            self.$opt(field)?
                .ok_or_else(|| Error::MissingField(field.to_owned()))
        }

        #[doc = concat!("Reads an optional ", $expected, " field.")]
        pub fn $opt(&self, field: &str) -> Result<Option<$out>> {
            match self.0.get(field) {
                None => Ok(None),
                Some(Value::$variant($v)) => Ok(Some($conv)),
                Some(_) => Err(Error::TypeMismatch { field: field.to_owned(), expected: $expected }),
            }
        }
    };
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.to_owned(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    getter!(unicode, opt_unicode, Unicode, &str, "unicode", |v| v.as_str());
    getter!(boolean, opt_boolean, Boolean, bool, "boolean", |v| *v);
    getter!(integer, opt_integer, Integer, i64, "integer", |v| *v);
    getter!(bytes, opt_bytes, Bytes, &[u8], "bytes", |v| v.as_slice());
    getter!(list, opt_list, List, &[Record], "list of records", |v| v.as_slice());
    getter!(items, opt_items, Items, &[Value], "list of scalars", |v| v.as_slice());
    getter!(json, opt_json, Json, &serde_json::Value, "json", |v| v);
    getter!(url, opt_url, Url, &Url, "url", |v| v);

    /// Reads a required list of unicode scalars.
    pub fn strings(&self, field: &str) -> Result<Vec<&str>> {
        self.items(field)?
            .iter()
            .map(|item| match item {
                Value::Unicode(s) => Ok(s.as_str()),
                _ => Err(Error::TypeMismatch { field: field.to_owned(), expected: "unicode" }),
            })
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

//! Tag codec: typed record tags to the backend's flat string tags and back.
//!
//! The backend only understands `string -> string` tags. Record tags are
//! richer ([`TagValue`]), so they are encoded as follows:
//!
//! | tag value          | raw tags                         |
//! |--------------------|----------------------------------|
//! | `null`             | key omitted                      |
//! | `true` / `false`   | `key = "1"` / `key = "0"`        |
//! | `"1"` / `"0"`      | `key = "n__1"` / `key = "n__0"`  |
//! | `["a", "b"]`       | `key:a = "1"`, `key:b = "1"`     |
//! | any other string   | `key = value`                    |
//!
//! Decoding inverts the table. A raw key containing `:` with value `"1"` is
//! always read back as an array member, so a boolean `true` stored under a
//! key that itself contains a colon comes back as a one-member array. That
//! collision is inherent to the encoding and is kept as-is.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw value written for boolean `true` and for array membership.
const TRUE_VALUE: &str = "1";
/// Raw value written for boolean `false`.
const FALSE_VALUE: &str = "0";
/// Prefix that keeps the literal strings `"0"` and `"1"` apart from booleans.
const NUMERIC_STRING_PREFIX: &str = "n__";
/// Separator between an array tag name and one of its members.
const ARRAY_SEPARATOR: char = ':';

/// A typed record tag value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    String(String),
    /// Unordered set of strings.
    Array(Vec<String>),
    /// Absent; never written to the backend.
    Null,
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<String>> for TagValue {
    fn from(value: Vec<String>) -> Self {
        Self::Array(value)
    }
}

impl From<Vec<&str>> for TagValue {
    fn from(value: Vec<&str>) -> Self {
        Self::Array(value.into_iter().map(str::to_string).collect())
    }
}

impl<T: Into<TagValue>> From<Option<T>> for TagValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Typed tags attached to a record.
pub type Tags = BTreeMap<String, TagValue>;

/// Flat tags as stored by the backend.
pub type RawTags = BTreeMap<String, String>;

/// Encode typed tags into raw backend tags.
pub fn encode(tags: &Tags) -> RawTags {
    let mut raw = RawTags::new();
    for (key, value) in tags {
        encode_field(key, value, &mut raw);
    }
    raw
}

/// Encode a single typed field into `out`.
///
/// Emits zero entries for `null`, one for scalars and one per member for
/// arrays. The query compiler uses this for every leaf constraint.
pub fn encode_field(key: &str, value: &TagValue, out: &mut RawTags) {
    match value {
        TagValue::Null => {}
        TagValue::Bool(flag) => {
            let raw = if *flag { TRUE_VALUE } else { FALSE_VALUE };
            out.insert(key.to_string(), raw.to_string());
        }
        TagValue::String(s) if s == TRUE_VALUE || s == FALSE_VALUE => {
            out.insert(key.to_string(), format!("{NUMERIC_STRING_PREFIX}{s}"));
        }
        TagValue::Array(members) => {
            for member in members {
                out.insert(
                    format!("{key}{ARRAY_SEPARATOR}{member}"),
                    TRUE_VALUE.to_string(),
                );
            }
        }
        TagValue::String(s) => {
            out.insert(key.to_string(), s.clone());
        }
    }
}

/// Decode raw backend tags into typed tags.
pub fn decode(raw: &RawTags) -> Tags {
    let mut tags = Tags::new();

    for (key, value) in raw {
        if value == TRUE_VALUE {
            if let Some((array_key, member)) = key.split_once(ARRAY_SEPARATOR) {
                match tags.get_mut(array_key) {
                    Some(TagValue::Array(members)) => members.push(member.to_string()),
                    _ => {
                        tags.insert(
                            array_key.to_string(),
                            TagValue::Array(vec![member.to_string()]),
                        );
                    }
                }
                continue;
            }
        }

        let decoded = match value.as_str() {
            TRUE_VALUE => TagValue::Bool(true),
            FALSE_VALUE => TagValue::Bool(false),
            escaped => match escaped.strip_prefix(NUMERIC_STRING_PREFIX) {
                Some(digit @ (TRUE_VALUE | FALSE_VALUE)) => TagValue::String(digit.to_string()),
                _ => TagValue::String(escaped.to_string()),
            },
        };
        tags.insert(key.clone(), decoded);
    }

    tags
}

// ── tests ────────────────────────────────────────────────────────────

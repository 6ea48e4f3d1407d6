//! Content-addressed references.
//!
//! Every value, fact and commit in a Space is addressed by the blake3 digest
//! of its canonical JSON encoding, rendered as a lowercase hex string. Three
//! encodings interoperate without loss: the in-memory [`Reference`], the
//! plain hash string, and the `{"/": hash}` link object used inside stored
//! values.
//!
//! # Canonical encoding
//!
//! The encoder is deterministic: object properties are written in sorted key
//! order and unset fields are dropped before serialization, so a field set
//! to nothing and a field that was never present hash identically. Equal
//! inputs always produce equal digests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StrataError;

/// Fixed reserved hash string of the `__empty__` sentinel value.
///
/// Delete facts reference this row instead of a real value. The row is
/// seeded at Space initialization and never deleted.
pub const EMPTY_HASH: &str = "__empty__";

/// Key of the link-object encoding, `{"/": "<hash>"}`.
const LINK_KEY: &str = "/";

//─────────────────────────────
//  Reference newtype
//─────────────────────────────

/// A 32-byte blake3 content hash encoded as a lowercase hex string.
///
/// The only non-hex reference is the `__empty__` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    /// Compute the reference of a JSON value via the canonical encoder.
    pub fn of(value: &Value) -> Self {
        Self::of_bytes(&canonical_bytes(value))
    }

    /// Compute the reference of raw bytes (blob addressing).
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// The `__empty__` sentinel reference used by Delete facts.
    pub fn empty() -> Self {
        Self(EMPTY_HASH.to_string())
    }

    /// Whether this is the `__empty__` sentinel.
    pub fn is_empty_sentinel(&self) -> bool {
        self.0 == EMPTY_HASH
    }

    /// Parse a plain hash string, accepting 64 lowercase hex chars or the
    /// `__empty__` sentinel.
    pub fn parse(s: &str) -> Result<Self, StrataError> {
        if s == EMPTY_HASH {
            return Ok(Self::empty());
        }
        let valid = s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(StrataError::InvalidReference(s.to_string()))
        }
    }

    /// View the hash as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render as a `{"/": hash}` link object.
    pub fn to_link(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(1);
        map.insert(LINK_KEY.to_string(), Value::String(self.0.clone()));
        Value::Object(map)
    }

    /// Read a reference back out of a `{"/": hash}` link object.
    pub fn from_link(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let hash = obj.get(LINK_KEY)?.as_str()?;
        Self::parse(hash).ok()
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

//─────────────────────────────
//  Canonical JSON encoder
//─────────────────────────────

/// Serialize a JSON value to its canonical byte form.
///
/// Objects are written with keys in sorted order, arrays in element order,
/// scalars in serde_json's standard rendering, with no whitespace. This is
/// the single encoding all references in the system are computed over.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        // serde_json's scalar rendering is deterministic for a given value
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => {
            // to_vec on a scalar cannot fail
            out.extend_from_slice(&serde_json::to_vec(s).unwrap_or_default());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(&serde_json::to_vec(key).unwrap_or_default());
                out.push(b':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push(b'}');
        }
    }
}

/// Builder for hashable payloads that omits unset fields entirely.
///
/// A field passed as `None` is indistinguishable from one never added, which
/// keeps reference identity stable across encoders that drop unset fields.
#[derive(Debug, Default)]
pub struct HashPayload {
    map: serde_json::Map<String, Value>,
}

impl HashPayload {
    /// Start an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.map.insert(key.to_string(), value.into());
        self
    }

    /// Add a field only if it is set.
    pub fn field_opt(mut self, key: &str, value: Option<impl Into<Value>>) -> Self {
        if let Some(v) = value {
            self.map.insert(key.to_string(), v.into());
        }
        self
    }

    /// Hash the accumulated payload.
    pub fn reference(self) -> Reference {
        Reference::of(&Value::Object(self.map))
    }
}

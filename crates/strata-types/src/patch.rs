//! Patch operations over JSON Pointer paths.
//!
//! A Patch fact records an ordered list of [`PatchOp`]s. Application is
//! atomic: ops apply in order and the first failure aborts the entire patch,
//! leaving the caller's value untouched. `add` creates intermediate parents
//! on the way to its target — numeric segments materialize arrays, string
//! segments materialize objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PatchError;

//─────────────────────────────
//  Operation variants
//─────────────────────────────

/// One patch operation. Paths are JSON Pointer strings addressed from the
/// entity's envelope root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Replace the value at an existing location.
    Replace {
        /// Target location.
        path: String,
        /// New value.
        value: Value,
    },
    /// Insert a value, materializing intermediate parents.
    Add {
        /// Target location.
        path: String,
        /// Value to insert.
        value: Value,
    },
    /// Remove the value at an existing location.
    Remove {
        /// Target location.
        path: String,
    },
    /// Remove from one location and add at another.
    Move {
        /// Source location.
        from: String,
        /// Destination location.
        path: String,
    },
    /// Replace a run of array elements in place.
    Splice {
        /// Array location.
        path: String,
        /// First element index affected.
        index: usize,
        /// Number of elements removed at `index`.
        remove: usize,
        /// Elements inserted at `index`.
        add: Vec<Value>,
    },
}

/// Apply `ops` in order to `base`.
///
/// Returns the patched value, or the first op's error with `base` logically
/// unchanged (the failed intermediate state is discarded).
pub fn apply_patches(base: Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
    let mut doc = base;
    for op in ops {
        doc = apply_one(doc, op)?;
    }
    Ok(doc)
}

fn apply_one(mut doc: Value, op: &PatchOp) -> Result<Value, PatchError> {
    match op {
        PatchOp::Replace { path, value } => {
            let segments = parse_pointer(path)?;
            if segments.is_empty() {
                return Ok(value.clone());
            }
            let slot = resolve_mut(&mut doc, &segments, path)?;
            *slot = value.clone();
            Ok(doc)
        }
        PatchOp::Add { path, value } => {
            add_at(&mut doc, path, value.clone())?;
            Ok(doc)
        }
        PatchOp::Remove { path } => {
            remove_at(&mut doc, path)?;
            Ok(doc)
        }
        PatchOp::Move { from, path } => {
            let moved = remove_at(&mut doc, from)?;
            add_at(&mut doc, path, moved)?;
            Ok(doc)
        }
        PatchOp::Splice {
            path,
            index,
            remove,
            add,
        } => {
            let segments = parse_pointer(path)?;
            let slot = if segments.is_empty() {
                &mut doc
            } else {
                resolve_mut(&mut doc, &segments, path)?
            };
            let arr = slot
                .as_array_mut()
                .ok_or_else(|| PatchError::NotAnArray(path.clone()))?;
            let end = index
                .checked_add(*remove)
                .filter(|end| *end <= arr.len())
                .ok_or_else(|| PatchError::IndexOutOfRange {
                    path: path.clone(),
                    index: *index,
                    len: arr.len(),
                })?;
            arr.splice(*index..end, add.iter().cloned());
            Ok(doc)
        }
    }
}

//─────────────────────────────
//  JSON Pointer handling
//─────────────────────────────

/// Split a JSON Pointer into unescaped segments. `""` addresses the root.
fn parse_pointer(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PatchError::InvalidPointer(path.to_string()));
    };
    rest.split('/')
        .map(|seg| {
            if !valid_escapes(seg) {
                return Err(PatchError::InvalidPointer(path.to_string()));
            }
            Ok(seg.replace("~1", "/").replace("~0", "~"))
        })
        .collect()
}

/// Every `~` must introduce a `~0` or `~1` escape.
fn valid_escapes(seg: &str) -> bool {
    let bytes = seg.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'~' {
            if i + 1 >= bytes.len() || (bytes[i + 1] != b'0' && bytes[i + 1] != b'1') {
                return false;
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    true
}

fn array_index(seg: &str, len: usize, path: &str) -> Result<usize, PatchError> {
    if seg == "-" {
        return Ok(len);
    }
    seg.parse::<usize>()
        .map_err(|_| PatchError::InvalidPointer(path.to_string()))
}

/// Navigate to an existing location, erroring where the path breaks.
fn resolve_mut<'a>(
    doc: &'a mut Value,
    segments: &[String],
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for seg in segments {
        current = match current {
            Value::Object(map) => map
                .get_mut(seg)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(arr) => {
                let len = arr.len();
                let idx = array_index(seg, len, path)?;
                arr.get_mut(idx)
                    .ok_or_else(|| PatchError::IndexOutOfRange {
                        path: path.to_string(),
                        index: idx,
                        len,
                    })?
            }
            _ => return Err(PatchError::PathNotFound(path.to_string())),
        };
    }
    Ok(current)
}

fn looks_numeric(seg: &str) -> bool {
    seg == "-" || (!seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
}

fn empty_container(for_index: bool) -> Value {
    if for_index {
        Value::Array(Vec::new())
    } else {
        Value::Object(serde_json::Map::new())
    }
}

/// Insert `value` at `path`, materializing missing intermediate containers.
fn add_at(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    let segments = parse_pointer(path)?;
    let Some((last, parents)) = segments.split_last() else {
        *doc = value;
        return Ok(());
    };

    let mut current = doc;
    for (i, seg) in parents.iter().enumerate() {
        // The shape of a materialized intermediate follows the next segment.
        let next = parents.get(i + 1).unwrap_or(last);
        let next_is_index = looks_numeric(next);
        current = match current {
            Value::Object(map) => map
                .entry(seg.clone())
                .or_insert_with(|| empty_container(next_is_index)),
            Value::Array(arr) => {
                let len = arr.len();
                let idx = array_index(seg, len, path)?;
                if idx == len {
                    arr.push(empty_container(next_is_index));
                }
                arr.get_mut(idx)
                    .ok_or_else(|| PatchError::IndexOutOfRange {
                        path: path.to_string(),
                        index: idx,
                        len,
                    })?
            }
            _ => return Err(PatchError::NotAContainer(path.to_string())),
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(arr) => {
            let len = arr.len();
            let idx = array_index(last, len, path)?;
            if idx > len {
                return Err(PatchError::IndexOutOfRange {
                    path: path.to_string(),
                    index: idx,
                    len,
                });
            }
            arr.insert(idx, value);
            Ok(())
        }
        _ => Err(PatchError::NotAContainer(path.to_string())),
    }
}

/// Remove and return the value at `path`.
fn remove_at(doc: &mut Value, path: &str) -> Result<Value, PatchError> {
    let segments = parse_pointer(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Err(PatchError::InvalidPointer(path.to_string()));
    };
    let parent = resolve_mut(doc, parents, path)?;
    match parent {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Value::Array(arr) => {
            let len = arr.len();
            let idx = array_index(last, len, path)?;
            if idx >= len {
                return Err(PatchError::IndexOutOfRange {
                    path: path.to_string(),
                    index: idx,
                    len,
                });
            }
            Ok(arr.remove(idx))
        }
        _ => Err(PatchError::PathNotFound(path.to_string())),
    }
}

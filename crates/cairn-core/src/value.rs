//! Dynamic value types for store state trees
//!
//! A store's state is a [`ValueMap`]: an insertion-ordered map of string keys
//! to [`Value`]s. Nested maps are the "plain records" that patches merge into;
//! every other variant (including lists) is replaced wholesale.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A dynamic value that can appear anywhere in a state tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// No value / null
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// List of values (never merged by patches)
    List(Vec<Value>),
    /// Map of string keys to values (a plain record)
    Map(ValueMap),
}

/// A map of string keys to dynamic values
///
/// Uses IndexMap to preserve insertion order (useful for deterministic serialization)
pub type ValueMap = IndexMap<String, Value>;

impl Value {
    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value as an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get this value as a float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get this value as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a list
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Try to get this value as a map
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Try to get this value as a mutable map
    pub fn as_map_mut(&mut self) -> Option<&mut ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Check if this value is a plain record (a map)
    pub fn is_record(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::List(list) => {
                write!(f, "[")?;
                for (i, v) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// Convenient From implementations
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(vec: Vec<T>) -> Self {
        Value::List(vec.into_iter().map(Into::into).collect())
    }
}

/// Build a [`ValueMap`] from `key => value` pairs
///
/// ```
/// use cairn_core::{value_map, Value};
///
/// let state = value_map! { "n" => 0, "user" => value_map! { "name" => "Ada" } };
/// assert_eq!(state.get("n"), Some(&Value::Int(0)));
/// ```
#[macro_export]
macro_rules! value_map {
    () => { $crate::ValueMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::ValueMap::new();
        $( map.insert(::std::string::String::from($key), $crate::Value::from($value)); )+
        map
    }};
}

// ============================================================================
// Paths
// ============================================================================

/// A dotted path into a state tree (`"user.address.city"`)
///
/// The empty path is the root and overlaps every other path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatePath(Vec<String>);

impl StatePath {
    /// The root path (the whole tree)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a dotted path; empty segments are ignored
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Check if this is the root path
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Return a new path with `segment` appended
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// Check if `self` is a prefix of `other` (or equal to it)
    pub fn is_prefix_of(&self, other: &StatePath) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }

    /// Two paths overlap when one contains the other
    ///
    /// A reader of `user` is affected by a write to `user.name` and a reader
    /// of `user.name` is affected by a write replacing `user`.
    pub fn overlaps(&self, other: &StatePath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Look up the value at this path
    pub fn lookup<'a>(&self, map: &'a ValueMap) -> Option<&'a Value> {
        let (first, rest) = self.0.split_first()?;
        let mut current = map.get(first)?;
        for segment in rest {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Insert a value at this path, returning the previous value
    ///
    /// Every parent segment must already exist and be a map.
    pub fn insert(&self, map: &mut ValueMap, value: Value) -> Result<Option<Value>> {
        let Some((last, parents)) = self.0.split_last() else {
            return Err(Error::InvalidOperation(
                "cannot insert at the root path".to_string(),
            ));
        };
        let mut current = map;
        let mut walked = StatePath::root();
        for segment in parents {
            walked = walked.child(segment);
            current = match current.get_mut(segment) {
                Some(Value::Map(inner)) => inner,
                Some(other) => {
                    return Err(Error::TypeError {
                        path: walked.to_string(),
                        expected: "map".to_string(),
                        got: other.type_name().to_string(),
                    })
                }
                None => return Err(Error::PathNotFound(walked.to_string())),
            };
        }
        Ok(current.insert(last.clone(), value))
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0.join("."))
        }
    }
}

impl From<&str> for StatePath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

// ============================================================================
// Merge and diff
// ============================================================================

/// Deep-merge `patch` into `target`, returning the paths whose value changed
///
/// For every key in the patch: when both the existing and the patch value are
/// maps they are merged recursively, otherwise the patch value replaces the
/// existing one (lists are replaced, never merged). A mismatch between a map
/// and a non-map is a replacement, not an error.
pub fn merge_into(target: &mut ValueMap, patch: &ValueMap) -> Vec<StatePath> {
    let mut changed = Vec::new();
    merge_at(target, patch, &StatePath::root(), &mut changed);
    changed
}

fn merge_at(target: &mut ValueMap, patch: &ValueMap, prefix: &StatePath, out: &mut Vec<StatePath>) {
    for (key, sub_patch) in patch {
        let path = prefix.child(key);
        match (target.get_mut(key), sub_patch) {
            (Some(Value::Map(existing)), Value::Map(sub)) => merge_at(existing, sub, &path, out),
            (Some(existing), _) => {
                if existing != sub_patch {
                    let old = std::mem::replace(existing, sub_patch.clone());
                    diff_values(&old, sub_patch, &path, out);
                }
            }
            (None, _) => {
                target.insert(key.clone(), sub_patch.clone());
                out.push(path);
            }
        }
    }
}

/// Copy the value at each of `paths` from `source` into `target`
///
/// A path missing from `source` is removed from `target`. Missing or
/// non-map parents in `target` are replaced by maps. Every other part of
/// `target` is left alone.
pub fn apply_paths(target: &mut ValueMap, source: &ValueMap, paths: &[StatePath]) {
    for path in paths {
        match path.lookup(source) {
            Some(value) => assign_at(target, path.segments(), value.clone()),
            None => remove_at(target, path.segments()),
        }
    }
}

fn assign_at(map: &mut ValueMap, segments: &[String], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert(last.clone(), value);
        }
        [head, rest @ ..] => {
            let slot = map
                .entry(head.clone())
                .or_insert_with(|| Value::Map(ValueMap::new()));
            if let Value::Map(inner) = slot {
                assign_at(inner, rest, value);
            } else {
                let mut inner = ValueMap::new();
                assign_at(&mut inner, rest, value);
                *slot = Value::Map(inner);
            }
        }
    }
}

fn remove_at(map: &mut ValueMap, segments: &[String]) {
    match segments {
        [] => {}
        [last] => {
            map.shift_remove(last);
        }
        [head, rest @ ..] => {
            if let Some(Value::Map(inner)) = map.get_mut(head) {
                remove_at(inner, rest);
            }
        }
    }
}

/// Compute the leaf paths that differ between two trees
pub fn diff_paths(old: &ValueMap, new: &ValueMap) -> Vec<StatePath> {
    let mut changed = Vec::new();
    diff_maps(old, new, &StatePath::root(), &mut changed);
    changed
}

fn diff_maps(old: &ValueMap, new: &ValueMap, prefix: &StatePath, out: &mut Vec<StatePath>) {
    for (key, old_value) in old {
        let path = prefix.child(key);
        match new.get(key) {
            Some(new_value) => diff_values(old_value, new_value, &path, out),
            None => out.push(path),
        }
    }
    for key in new.keys() {
        if !old.contains_key(key) {
            out.push(prefix.child(key));
        }
    }
}

pub(crate) fn diff_values(old: &Value, new: &Value, path: &StatePath, out: &mut Vec<StatePath>) {
    match (old, new) {
        (Value::Map(a), Value::Map(b)) => diff_maps(a, b, path, out),
        (a, b) if a != b => out.push(path.clone()),
        _ => {}
    }
}

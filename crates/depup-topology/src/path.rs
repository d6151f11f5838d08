//! Breadcrumb paths for addressing values inside a topology tree
//!
//! A path is a dot-separated list of segments. Each segment names a map key,
//! optionally followed by one bracketed sequence index (`name[3]`), or is a
//! bare index (`[3]`) into the current sequence.
//!
//! Traversal never panics: a segment that cannot be resolved yields `None`.

use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Separator between path segments
pub const PATH_SEPARATOR: char = '.';

/// Largest index [`Breadcrumbs::skeleton`] and [`Breadcrumbs::insert`] will pad up to
pub const MAX_SKELETON_INDEX: usize = 4096;

/// One step of a [`Breadcrumbs`] path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    key: Option<String>,
    index: Option<usize>,
}

impl Segment {
    /// Map key segment
    #[inline]
    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            index: None,
        }
    }

    /// Map key followed by a sequence index (`key[index]`)
    #[inline]
    #[must_use]
    pub fn indexed(key: impl Into<String>, index: usize) -> Self {
        Self {
            key: Some(key.into()),
            index: Some(index),
        }
    }

    /// Bare sequence index (`[index]`)
    #[inline]
    #[must_use]
    pub fn index(index: usize) -> Self {
        Self {
            key: None,
            index: Some(index),
        }
    }

    #[inline]
    #[must_use]
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn index_value(&self) -> Option<usize> {
        self.index
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(key) = &self.key {
            f.write_str(key)?;
        }
        if let Some(index) = self.index {
            write!(f, "[{index}]")?;
        }
        Ok(())
    }
}

impl FromStr for Segment {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PathError::EmptySegment);
        }
        match s.find('[') {
            Some(0) => Ok(Self::index(parse_index(s)?)),
            Some(pos) => {
                let (key, bracket) = s.split_at(pos);
                Ok(Self::indexed(key, parse_index(bracket)?))
            }
            None if s.contains(']') => Err(PathError::InvalidSegment(s.to_string())),
            None => Ok(Self::key(s)),
        }
    }
}

/// Path within a topology tree
///
/// # Examples
/// - `nodes.n1.properties.port`
/// - `nodes.n2[1].inner[0]`
/// - `nodes.web.relationships[0]`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Breadcrumbs(Vec<Segment>);

impl Breadcrumbs {
    #[inline]
    #[must_use]
    pub fn new(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    /// Empty path (addresses the root itself)
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path made of plain map keys
    #[must_use]
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Segment::key).collect())
    }

    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parent path (if not root)
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .split_last()
            .map(|(_, init)| Self(init.to_vec()))
    }

    /// Append a key segment, returning new path
    #[inline]
    #[must_use]
    pub fn child(&self, key: impl Into<String>) -> Self {
        self.push(Segment::key(key))
    }

    /// Append `key[index]`, returning new path
    #[inline]
    #[must_use]
    pub fn child_indexed(&self, key: impl Into<String>, index: usize) -> Self {
        self.push(Segment::indexed(key, index))
    }

    fn push(&self, segment: Segment) -> Self {
        let mut new = self.clone();
        new.0.push(segment);
        new
    }

    /// Resolve this path against `root`
    ///
    /// Maps are descended by key, sequences by index, left to right.
    #[must_use]
    pub fn traverse<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(root, step)
    }

    /// Mutable counterpart of [`Self::traverse`]; never creates anything
    pub fn traverse_mut<'a>(&self, root: &'a mut Value) -> Option<&'a mut Value> {
        self.0.iter().try_fold(root, step_mut)
    }

    /// Minimal nested structure such that `self.traverse(&skeleton) == Some(&value)`
    ///
    /// Indexed segments produce sequences padded with `null`.
    ///
    /// # Errors
    /// Returns [`PathError::IndexTooLarge`] if an index exceeds [`MAX_SKELETON_INDEX`]
    pub fn skeleton(&self, value: Value) -> Result<Value, PathError> {
        self.0.iter().rev().try_fold(value, |inner, segment| {
            let inner = match segment.index {
                Some(index) => {
                    check_index(index)?;
                    let mut items = vec![Value::Null; index];
                    items.push(inner);
                    Value::Array(items)
                }
                None => inner,
            };
            Ok(match &segment.key {
                Some(key) => {
                    let mut map = Map::new();
                    map.insert(key.clone(), inner);
                    Value::Object(map)
                }
                None => inner,
            })
        })
    }

    /// Write `value` at this path, creating missing maps and sequences
    ///
    /// # Errors
    /// Returns [`PathError::NotAContainer`] if an intermediate value is a scalar
    pub fn insert(&self, root: &mut Value, value: Value) -> Result<(), PathError> {
        let mut cursor = root;
        for segment in &self.0 {
            cursor = descend_or_create(cursor, segment)?;
        }
        *cursor = value;
        Ok(())
    }

    /// Remove and return the value at this path
    ///
    /// Removing a sequence element shifts the following elements down.
    pub fn remove(&self, root: &mut Value) -> Option<Value> {
        let (last, init) = self.0.split_last()?;
        let parent = init.iter().try_fold(root, step_mut)?;
        match (last.key.as_deref(), last.index) {
            (Some(key), None) => parent.as_object_mut()?.remove(key),
            (key, Some(index)) => {
                let container = match key {
                    Some(key) => parent.as_object_mut()?.get_mut(key)?,
                    None => parent,
                };
                let items = container.as_array_mut()?;
                (index < items.len()).then(|| items.remove(index))
            }
            (None, None) => None,
        }
    }
}

fn step<'a>(value: &'a Value, segment: &Segment) -> Option<&'a Value> {
    let value = match &segment.key {
        Some(key) => value.as_object()?.get(key)?,
        None => value,
    };
    match segment.index {
        Some(index) => value.as_array()?.get(index),
        None => Some(value),
    }
}

fn step_mut<'a>(value: &'a mut Value, segment: &Segment) -> Option<&'a mut Value> {
    let value = match &segment.key {
        Some(key) => value.as_object_mut()?.get_mut(key)?,
        None => value,
    };
    match segment.index {
        Some(index) => value.as_array_mut()?.get_mut(index),
        None => Some(value),
    }
}

fn descend_or_create<'a>(value: &'a mut Value, segment: &Segment) -> Result<&'a mut Value, PathError> {
    let value = match &segment.key {
        Some(key) => {
            if value.is_null() {
                *value = Value::Object(Map::new());
            }
            let Value::Object(map) = value else {
                return Err(PathError::NotAContainer(segment.to_string()));
            };
            map.entry(key.clone()).or_insert(Value::Null)
        }
        None => value,
    };
    match segment.index {
        Some(index) => {
            check_index(index)?;
            if value.is_null() {
                *value = Value::Array(Vec::new());
            }
            let Value::Array(items) = value else {
                return Err(PathError::NotAContainer(segment.to_string()));
            };
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            Ok(&mut items[index])
        }
        None => Ok(value),
    }
}

fn check_index(index: usize) -> Result<(), PathError> {
    if index > MAX_SKELETON_INDEX {
        Err(PathError::IndexTooLarge(index))
    } else {
        Ok(())
    }
}

impl Display for Breadcrumbs {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{PATH_SEPARATOR}")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Breadcrumbs {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        s.split(PATH_SEPARATOR)
            .map(Segment::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl TryFrom<String> for Breadcrumbs {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Breadcrumbs> for String {
    fn from(path: Breadcrumbs) -> Self {
        path.to_string()
    }
}

impl serde::Serialize for Breadcrumbs {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Breadcrumbs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a bracketed index segment such as `[15]`
///
/// # Errors
/// Returns [`PathError::NotAnIndex`] unless the segment is `[` digits `]`
pub fn parse_index(segment: &str) -> Result<usize, PathError> {
    let not_an_index = || PathError::NotAnIndex(segment.to_string());
    let inner = segment
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(not_an_index)?;
    if inner.is_empty() || !inner.bytes().all(|b| b.is_ascii_digit()) {
        return Err(not_an_index());
    }
    inner.parse().map_err(|_| not_an_index())
}

/// Resolve a textual path against `root`; malformed paths resolve to `None`
#[must_use]
pub fn traverse<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.parse::<Breadcrumbs>().ok()?.traverse(root)
}

/// Build the minimal nested structure holding `value` at `path`
///
/// # Errors
/// Returns an error if `path` is malformed or indexes too far
pub fn create_skeleton(path: &str, value: Value) -> Result<Value, PathError> {
    path.parse::<Breadcrumbs>()?.skeleton(value)
}

/// Errors related to breadcrumb paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Empty segment in path
    #[error("path contains empty segment")]
    EmptySegment,

    /// Segment with unbalanced brackets
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// Bracketed part is not a non-negative integer
    #[error("not an index: {0}")]
    NotAnIndex(String),

    /// Index too large to materialize
    #[error("index {0} exceeds skeleton limit")]
    IndexTooLarge(usize),

    /// Intermediate value is a scalar
    #[error("cannot descend into scalar at segment '{0}'")]
    NotAContainer(String),
}

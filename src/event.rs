use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const MAX_METADATA_KEYS: usize = 100;
pub const MAX_DIMENSION_KEYS: usize = 400;
pub const MAX_NAMESPACE_LEN: usize = 512;

/// One immutable time-series event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub metadata: BTreeMap<String, String>,
    pub dimensions: BTreeMap<String, f64>,
    pub payload: Option<Vec<u8>>,
}

impl Event {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn dimension(mut self, key: impl Into<String>, value: f64) -> Self {
        self.dimensions.insert(key.into(), value);
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn shape(&self) -> ShapeSignature {
        ShapeSignature::of(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timestamp < 0 {
            return Err(Error::InvalidEvent(format!(
                "timestamp {} is negative",
                self.timestamp
            )));
        }
        if self.metadata.len() > MAX_METADATA_KEYS {
            return Err(Error::InvalidEvent(format!(
                "{} metadata keys exceeds the limit of {MAX_METADATA_KEYS}",
                self.metadata.len()
            )));
        }
        if self.dimensions.len() > MAX_DIMENSION_KEYS {
            return Err(Error::InvalidEvent(format!(
                "{} dimension keys exceeds the limit of {MAX_DIMENSION_KEYS}",
                self.dimensions.len()
            )));
        }
        for (key, value) in &self.metadata {
            if key.is_empty() {
                return Err(Error::InvalidEvent("empty metadata key".into()));
            }
            if value.is_empty() {
                return Err(Error::InvalidEvent(format!(
                    "metadata `{key}` has an empty value"
                )));
            }
            // postgres text columns cannot hold NUL
            if key.contains('\0') || value.contains('\0') {
                return Err(Error::InvalidEvent(format!(
                    "metadata `{}` contains a NUL character",
                    key.escape_default()
                )));
            }
        }
        for (key, value) in &self.dimensions {
            if key.is_empty() {
                return Err(Error::InvalidEvent("empty dimension key".into()));
            }
            if key.contains('\0') {
                return Err(Error::InvalidEvent(format!(
                    "dimension `{}` contains a NUL character",
                    key.escape_default()
                )));
            }
            if !value.is_finite() {
                return Err(Error::InvalidEvent(format!(
                    "dimension `{key}` is not finite"
                )));
            }
        }
        ensure_unique_ignoring_case(self.metadata.keys(), "metadata")
            .map_err(Error::InvalidEvent)?;
        ensure_unique_ignoring_case(self.dimensions.keys(), "dimension")
            .map_err(Error::InvalidEvent)?;
        Ok(())
    }
}

/// Rejects key sets that collide once case is ignored.
pub(crate) fn ensure_unique_ignoring_case<'a, I>(keys: I, what: &str) -> std::result::Result<(), String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut seen = HashSet::new();
    for key in keys {
        if !seen.insert(key.to_lowercase()) {
            return Err(format!("duplicate {what} key `{key}` (keys are case-insensitive)"));
        }
    }
    Ok(())
}

pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.trim().is_empty() {
        return Err(Error::InvalidQuery("namespace must not be empty".into()));
    }
    if namespace.chars().count() > MAX_NAMESPACE_LEN {
        return Err(Error::InvalidQuery(format!(
            "namespace exceeds {MAX_NAMESPACE_LEN} characters"
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttributeKind {
    Metadata,
    Dimension,
}

impl AttributeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttributeKind::Metadata => "metadata",
            AttributeKind::Dimension => "dimension",
        }
    }

    pub(crate) fn column_prefix(self) -> &'static str {
        match self {
            AttributeKind::Metadata => "m_",
            AttributeKind::Dimension => "d_",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "metadata" => Some(AttributeKind::Metadata),
            "dimension" => Some(AttributeKind::Dimension),
            _ => None,
        }
    }
}

/// A logical attribute key: the raw name plus whether it is a metadata or dimension key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeKey {
    pub kind: AttributeKind,
    pub name: String,
}

impl AttributeKey {
    pub fn metadata(name: impl Into<String>) -> Self {
        Self {
            kind: AttributeKind::Metadata,
            name: name.into(),
        }
    }

    pub fn dimension(name: impl Into<String>) -> Self {
        Self {
            kind: AttributeKind::Dimension,
            name: name.into(),
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.name)
    }
}

/// Sorted set of attribute keys present in an event. Events with different
/// signatures never share a chunk table.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShapeSignature(BTreeSet<AttributeKey>);

impl ShapeSignature {
    pub fn of(event: &Event) -> Self {
        let keys = event
            .metadata
            .keys()
            .map(AttributeKey::metadata)
            .chain(event.dimensions.keys().map(AttributeKey::dimension))
            .collect();
        Self(keys)
    }

    pub fn keys(&self) -> impl Iterator<Item = &AttributeKey> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &AttributeKey) -> bool {
        self.0.contains(key)
    }

    /// Stable byte form used as hash input for chunk table names. Every key
    /// is written as a kind tag, a `u32` length and the name bytes, so no
    /// key name can imitate a key boundary.
    pub fn canonical(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 16);
        for key in &self.0 {
            out.push(match key.kind {
                AttributeKind::Metadata => 0,
                AttributeKind::Dimension => 1,
            });
            out.extend_from_slice(&(key.name.len() as u32).to_le_bytes());
            out.extend_from_slice(key.name.as_bytes());
        }
        out
    }
}

impl FromIterator<AttributeKey> for ShapeSignature {
    fn from_iter<T: IntoIterator<Item = AttributeKey>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Start of the fixed-size bucket containing `timestamp`.
pub fn chunk_start(timestamp: i64, window_ms: i64) -> i64 {
    timestamp.div_euclid(window_ms) * window_ms
}

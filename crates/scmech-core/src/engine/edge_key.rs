//! Canonical identities for causal edges.
//!
//! An edge is a child node together with its parent set. Parents are kept sorted
//! ascending and duplicate-free so that every parent set has exactly one canonical
//! string:
//!
//! ```text
//! Y<-X1,X2     child Y, parents {X1, X2}
//! Root<-       child Root, no parents
//! ```
//!
//! Keyed components (the shared-edge registry, snapshots) address edges only through
//! this immutable value, never through object identity.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::engine::errors::{MechanismError, Result};

const SEPARATOR: &str = "<-";
const PARENT_DELIMITER: char = ',';

/// Parent list of an edge; most candidate parent sets in structure search are small.
pub type Parents = SmallVec<[String; 4]>;

/// Immutable identity of a causal edge `(child, sorted parent set)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    child: String,
    parents: Parents,
}

impl EdgeKey {
    /// Builds a key, sorting the parents. Fails on empty or duplicate ids, or ids that
    /// would make the canonical string ambiguous.
    pub fn new<C, I, P>(child: C, parents: I) -> Result<Self>
    where
        C: Into<String>,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let child = child.into();
        if child.is_empty() || child.contains(SEPARATOR) {
            return Err(MechanismError::MalformedKey(format!(
                "invalid child id {:?}",
                child
            )));
        }

        let mut parents: Parents = parents.into_iter().map(Into::into).collect();
        for parent in &parents {
            if parent.is_empty() || parent.contains(PARENT_DELIMITER) || parent.contains(SEPARATOR)
            {
                return Err(MechanismError::MalformedKey(format!(
                    "invalid parent id {:?} for child {:?}",
                    parent, child
                )));
            }
        }
        parents.sort_unstable();
        if let Some(pair) = parents.windows(2).find(|w| w[0] == w[1]) {
            return Err(MechanismError::MalformedKey(format!(
                "duplicate parent {:?} for child {:?}",
                pair[0], child
            )));
        }

        Ok(Self { child, parents })
    }

    /// Key of a parentless edge.
    pub fn root(child: impl Into<String>) -> Result<Self> {
        Self::new(child, std::iter::empty::<String>())
    }

    pub fn child(&self) -> &str {
        &self.child
    }

    /// Parents in ascending order.
    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.child, SEPARATOR)?;
        for (i, parent) in self.parents.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", PARENT_DELIMITER)?;
            }
            f.write_str(parent)?;
        }
        Ok(())
    }
}

impl FromStr for EdgeKey {
    type Err = MechanismError;

    fn from_str(key: &str) -> Result<Self> {
        let idx = key
            .find(SEPARATOR)
            .ok_or_else(|| MechanismError::MalformedKey(format!("missing '<-' in {:?}", key)))?;
        let child = &key[..idx];
        let suffix = &key[idx + SEPARATOR.len()..];
        if suffix.is_empty() {
            return Self::root(child);
        }
        Self::new(child, suffix.split(PARENT_DELIMITER))
    }
}

/// Encodes `(child, parents)` into the canonical key string.
pub fn encode<P: AsRef<str>>(child: &str, parents: &[P]) -> Result<String> {
    EdgeKey::new(child, parents.iter().map(|p| p.as_ref().to_string())).map(|k| k.to_string())
}

/// Decodes a key string into `(child, sorted parents)`.
pub fn decode(key: &str) -> Result<(String, Vec<String>)> {
    let key: EdgeKey = key.parse()?;
    Ok((key.child, key.parents.into_vec()))
}

#[cfg(feature = "serde")]
impl serde::Serialize for EdgeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for EdgeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

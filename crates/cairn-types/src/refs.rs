//! Named pointers into the store: refs and aliases.
//!
//! Valid ref and alias names:
//! - Must be non-empty
//! - Must not contain whitespace, `#`, `~`, `^`, `:`, `?`, `*`, `[`, `\`
//! - Must not contain `..`
//! - Must not start or end with `/`, and must not contain `//`

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::hash::IoHash;
use crate::locator::BlobLocator;

/// Characters that are forbidden anywhere in a ref name.
const FORBIDDEN_CHARS: &[char] = &[
    ' ', '\t', '\n', '\r', '#', '~', '^', ':', '?', '*', '[', '\\',
];

/// Validated name of a ref or alias.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RefName(String);

impl RefName {
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(name: &str) -> Result<(), TypeError> {
    let invalid = |reason: String| TypeError::InvalidRefName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name must not be empty".into()));
    }
    if let Some(ch) = FORBIDDEN_CHARS.iter().find(|ch| name.contains(**ch)) {
        return Err(invalid(format!("contains forbidden character: {ch:?}")));
    }
    if name.contains("..") {
        return Err(invalid("must not contain '..'".into()));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(invalid("must not start or end with '/'".into()));
    }
    if name.contains("//") {
        return Err(invalid("must not contain consecutive slashes '//'".into()));
    }
    Ok(())
}

impl TryFrom<String> for RefName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RefName> for String {
    fn from(name: RefName) -> Self {
        name.0
    }
}

impl fmt::Debug for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefName({})", self.0)
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value of a ref: the root node's hash and its locator (with fragment).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTarget {
    pub hash: IoHash,
    pub locator: BlobLocator,
}

impl RefTarget {
    pub fn new(hash: IoHash, locator: BlobLocator) -> Self {
        Self { hash, locator }
    }
}

/// One entry registered under an alias name.
///
/// Several entries may share a name; lookups return them ordered by
/// descending rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub locator: BlobLocator,
    pub rank: i32,
    pub data: Vec<u8>,
}

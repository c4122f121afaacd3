//! A validated, platform-independent relative path type.
//!
//! Journal deltas and directory entries both need a path type that can't
//! accidentally be absolute or escape the checkout via `..`. Rooted in a
//! plain `/`-joined `String` rather than a `[u8]`-based wrapper, since
//! journal paths are always meant to be shown to humans over the control
//! socket.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelativePathError {
    #[error("path must not be absolute: {0:?}")]
    Absolute(String),
    #[error("path component must not be empty, '.' or '..': {0:?}")]
    InvalidComponent(String),
}

/// A `/`-separated relative path, always well-formed: no leading `/`, no
/// empty components, no `.` or `..` components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativePath(String);

/// The reserved top-level component under which source-control metadata
/// lives; ranges entirely composed of paths under it are flagged by
/// [`crate::journal::JournalDeltaRange::contains_only_reserved_metadata_changes`].
pub const RESERVED_METADATA_COMPONENT: &str = ".hg";

impl RelativePath {
    pub fn new(path: impl Into<String>) -> Result<Self, RelativePathError> {
        let path = path.into();
        if path.starts_with('/') {
            return Err(RelativePathError::Absolute(path));
        }
        for component in path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(RelativePathError::InvalidComponent(path));
            }
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// True iff the path's first component is [`RESERVED_METADATA_COMPONENT`].
    pub fn is_under_reserved_metadata(&self) -> bool {
        self.components().next() == Some(RESERVED_METADATA_COMPONENT)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RelativePath> for String {
    fn from(value: RelativePath) -> Self {
        value.0
    }
}

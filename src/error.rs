//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns a [`CoreError`]. The
//! variants mirror the kinds a kernel-channel boundary needs to map errors
//! onto (`ENOENT`, `ESTALE`, a raw errno, ...) without this crate knowing
//! anything about FUSE, NFS or ProjFS itself.

use std::fmt;

use thiserror::Error;

/// The error taxonomy described for the inode engine.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    /// An ino or path could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// The ino was forgotten by the daemon but the kernel still references it.
    #[error("stale inode: {0}")]
    Stale(String),

    /// A POSIX syscall failed; `errno` is the raw `errno` value.
    #[error("{message} (errno {errno})")]
    PosixError { errno: i32, message: String },

    /// A Win32/HRESULT-flavored error, kept for interop with the on-disk
    /// SNAPSHOT format's cross-platform callers; this crate never produces it
    /// itself on Unix.
    #[error("{message} (code {code:#x})")]
    Win32Error { code: u32, message: String },

    /// An error recognized from an upstream object-store response.
    #[error("network error: {0}")]
    NetworkError(String),

    /// A catch-all, UTF-8-sanitized error message.
    #[error("{0}")]
    Generic(String),

    /// An invariant was violated. Fatal in debug builds (see [`bug`]),
    /// logged and surfaced in release.
    #[error("internal bug: {0}")]
    Bug(String),
}

impl CoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        CoreError::Stale(msg.into())
    }

    pub fn posix(errno: i32, message: impl Into<String>) -> Self {
        CoreError::PosixError {
            errno,
            message: message.into(),
        }
    }

    pub fn generic(msg: impl fmt::Display) -> Self {
        CoreError::Generic(crate::utf8::ensure_valid_utf8(msg.to_string().into_bytes()))
    }

    /// Best-effort errno this error should be reported as at a POSIX kernel
    /// channel boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            CoreError::NotFound(_) => libc::ENOENT,
            CoreError::Stale(_) => libc::ESTALE,
            CoreError::PosixError { errno, .. } => *errno,
            CoreError::Win32Error { .. } => libc::EIO,
            CoreError::NetworkError(_) => libc::EIO,
            CoreError::Generic(_) => libc::EIO,
            CoreError::Bug(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(value: std::io::Error) -> Self {
        match value.raw_os_error() {
            Some(errno) => CoreError::posix(errno, value.to_string()),
            None => CoreError::generic(value),
        }
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(value: toml::de::Error) -> Self {
        CoreError::generic(value)
    }
}

impl From<toml::ser::Error> for CoreError {
    fn from(value: toml::ser::Error) -> Self {
        CoreError::generic(value)
    }
}

/// Raises a [`CoreError::Bug`]; panics in debug builds so invariant
/// violations are caught close to their source, while still surfacing as a
/// typed error rather than crashing in release builds.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        if cfg!(debug_assertions) {
            panic!("internal bug: {}", msg);
        }
        tracing::error!("internal bug: {}", msg);
        $crate::error::CoreError::Bug(msg)
    }};
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_errno_maps_known_variants() {
        assert_eq!(CoreError::not_found("x").to_errno(), libc::ENOENT);
        assert_eq!(CoreError::stale("x").to_errno(), libc::ESTALE);
        assert_eq!(CoreError::posix(libc::EPERM, "x").to_errno(), libc::EPERM);
        assert_eq!(CoreError::generic("x").to_errno(), libc::EIO);
    }

    #[test]
    fn generic_sanitizes_invalid_utf8() {
        let err = CoreError::generic(String::from_utf8_lossy(&[b'a', 0xff, b'b']));
        assert_eq!(err.to_string(), "a\u{FFFD}b");
    }

    #[test]
    #[should_panic(expected = "internal bug")]
    fn bug_macro_panics_in_debug_builds() {
        let _: CoreError = bug!("invariant {} violated", 42);
    }
}

//! UTF-8 sanitization for error messages and paths crossing the control
//! socket boundary.
//!
//! Every error crossing that boundary is tagged with its kind and sanitized
//! to valid UTF-8, with invalid code points replaced rather than the whole
//! message being discarded.

/// Returns whether `bytes` is already correctly encoded UTF-8.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok()
}

/// Returns a valid UTF-8 string, replacing invalid sequences with U+FFFD.
///
/// Avoids an allocation-plus-copy in the common case where `bytes` is
/// already valid UTF-8.
pub fn ensure_valid_utf8(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

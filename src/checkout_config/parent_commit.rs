//! The SNAPSHOT file: the working copy's parent-commit state machine.
//!
//! Covers the `ParentCommit` variant shape and the versioned on-disk byte
//! layout this module's `read`/`write` must agree with across v1 through
//! v4.

use std::convert::TryInto;
use std::fs;
use std::path::Path;

use bytes::Bytes;
use data_encoding::HEXLOWER;

use crate::error::{CoreError, Result};

const MAGIC: &[u8; 4] = b"eden";
const VERSION_LEGACY_FIXED: u32 = 1;
const VERSION_LENGTH_PREFIXED: u32 = 2;
const VERSION_IN_PROGRESS: u32 = 3;
/// Not part of the original wire format; this crate's own writer uses it to
/// represent a `Steady` state whose two roots differ (e.g. mid-reset)
/// without resorting to `CheckoutInProgress`'s pid-carrying shape. Reading
/// v1/v2/v3 is required for interoperability with older snapshots, but
/// nothing constrains what a fresh writer emits for a state those three
/// versions can't represent on their own.
const VERSION_STEADY_DIVERGED: u32 = 4;

const V1_BODY_LEN: usize = 40;
const V1_HASH_LEN: usize = 20;

/// An opaque commit/root identifier. Its exact meaning (a 40-character ASCII
/// hex Mercurial/Git sha1, a raw 20-byte binary hash, or something else
/// entirely) is owned by the out-of-scope object store, not this crate —
/// this type only ever compares and stores the bytes it is given.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RootId(Bytes);

impl RootId {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex-encodes `hash` into a `RootId`'s bytes, matching the legacy v1
    /// reader's behavior of always producing an ASCII-hex root id from a
    /// raw 20-byte hash slot, regardless of how later versions store theirs.
    fn from_hex_encoded_hash(hash: &[u8]) -> Self {
        Self(Bytes::from(HEXLOWER.encode(hash).into_bytes()))
    }
}

impl std::fmt::Debug for RootId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "RootId({s:?})"),
            Err(_) => write!(f, "RootId(0x{})", HEXLOWER.encode(&self.0)),
        }
    }
}

impl std::fmt::Display for RootId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{}", HEXLOWER.encode(&self.0)),
        }
    }
}

impl From<&str> for RootId {
    fn from(value: &str) -> Self {
        RootId(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// Which root to prefer when a checkout is in progress; see
/// [`ParentCommit::get_last_checkout_id`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootIdPreference {
    /// During an update, prefer the destination root.
    To,
    /// During an update, prefer the originating root.
    From,
    /// During an update, no root id is used.
    OnlyStable,
}

/// The steady-state shape: `working_copy_parent` and `checked_out` may
/// differ mid-reset; a checkout operation sets both to the same value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingCopyParentAndCheckedOut {
    pub working_copy_parent: RootId,
    pub checked_out: RootId,
}

/// A checkout operation is running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutInProgress {
    pub from: RootId,
    pub to: RootId,
    pub pid: u32,
}

/// In-memory representation of the SNAPSHOT file's content
/// `ParentCommit`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentCommit {
    Steady(WorkingCopyParentAndCheckedOut),
    InProgress(CheckoutInProgress),
}

impl ParentCommit {
    pub fn steady(root: RootId) -> Self {
        ParentCommit::Steady(WorkingCopyParentAndCheckedOut {
            working_copy_parent: root.clone(),
            checked_out: root,
        })
    }

    pub fn is_checkout_in_progress(&self) -> bool {
        matches!(self, ParentCommit::InProgress(_))
    }

    pub fn in_progress_pid(&self) -> Option<u32> {
        match self {
            ParentCommit::InProgress(s) => Some(s.pid),
            ParentCommit::Steady(_) => None,
        }
    }

    /// `set-checked-out-commit(r)` → `Steady{r, r}`.
    pub fn set_checked_out_commit(root: RootId) -> Self {
        Self::steady(root)
    }

    /// `set-working-copy-parent-commit(r)` → `Steady{r, current-checked-out}`.
    pub fn set_working_copy_parent_commit(&self, root: RootId) -> Self {
        let checked_out = match self {
            ParentCommit::Steady(s) => s.checked_out.clone(),
            ParentCommit::InProgress(s) => s.to.clone(),
        };
        ParentCommit::Steady(WorkingCopyParentAndCheckedOut {
            working_copy_parent: root,
            checked_out,
        })
    }

    /// `set-checkout-in-progress(from, to)` → `InProgress{from, to, self-pid}`.
    pub fn set_checkout_in_progress(from: RootId, to: RootId) -> Self {
        ParentCommit::InProgress(CheckoutInProgress {
            from,
            to,
            pid: std::process::id(),
        })
    }

    pub fn get_last_checkout_id(&self, preference: RootIdPreference) -> Option<RootId> {
        match self {
            ParentCommit::Steady(s) => Some(s.checked_out.clone()),
            ParentCommit::InProgress(s) => match preference {
                RootIdPreference::To => Some(s.to.clone()),
                RootIdPreference::From => Some(s.from.clone()),
                RootIdPreference::OnlyStable => None,
            },
        }
    }

    pub fn get_working_copy_parent(&self) -> RootId {
        match self {
            ParentCommit::Steady(s) => s.working_copy_parent.clone(),
            ParentCommit::InProgress(s) => s.to.clone(),
        }
    }
}

struct BodyReader<'a> {
    bytes: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(CoreError::generic("SNAPSHOT file: underflow"));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn length_prefixed_hash(&mut self) -> Result<RootId> {
        let len = self.u32_be()? as usize;
        if self.bytes.len() < len {
            return Err(CoreError::generic("SNAPSHOT file: string underflow"));
        }
        Ok(RootId::from_bytes(Bytes::copy_from_slice(self.take(len)?)))
    }
}

/// Parses a SNAPSHOT file's raw bytes into a [`ParentCommit`].
pub fn parse(bytes: &[u8]) -> Result<ParentCommit> {
    if bytes.len() < 8 {
        return Err(CoreError::generic("SNAPSHOT file is too short"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(CoreError::generic("unsupported legacy SNAPSHOT file"));
    }
    let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let body = &bytes[8..];

    match version {
        VERSION_LEGACY_FIXED => {
            if body.len() != V1_BODY_LEN {
                return Err(CoreError::generic("unexpected length for eden SNAPSHOT file"));
            }
            let root = RootId::from_hex_encoded_hash(&body[0..V1_HASH_LEN]);
            Ok(ParentCommit::steady(root))
        }
        VERSION_LENGTH_PREFIXED => {
            let mut r = BodyReader { bytes: body };
            let root = r.length_prefixed_hash()?;
            Ok(ParentCommit::steady(root))
        }
        VERSION_IN_PROGRESS => {
            let mut r = BodyReader { bytes: body };
            let pid = r.u32_be()?;
            let from = r.length_prefixed_hash()?;
            let to = r.length_prefixed_hash()?;
            Ok(ParentCommit::InProgress(CheckoutInProgress { from, to, pid }))
        }
        VERSION_STEADY_DIVERGED => {
            let mut r = BodyReader { bytes: body };
            let working_copy_parent = r.length_prefixed_hash()?;
            let checked_out = r.length_prefixed_hash()?;
            Ok(ParentCommit::Steady(WorkingCopyParentAndCheckedOut {
                working_copy_parent,
                checked_out,
            }))
        }
        other => Err(CoreError::generic(format!(
            "unsupported eden SNAPSHOT file format (version {other})"
        ))),
    }
}

/// Serializes a [`ParentCommit`] to the latest version able to represent it
/// exactly: v2 for a converged steady state, this crate's v4 for a diverged
/// one, v3 for an in-progress checkout.
fn serialize(parent: &ParentCommit) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    match parent {
        ParentCommit::Steady(s) if s.working_copy_parent == s.checked_out => {
            buf.extend_from_slice(&VERSION_LENGTH_PREFIXED.to_be_bytes());
            put_hash(&mut buf, &s.checked_out);
        }
        ParentCommit::Steady(s) => {
            buf.extend_from_slice(&VERSION_STEADY_DIVERGED.to_be_bytes());
            put_hash(&mut buf, &s.working_copy_parent);
            put_hash(&mut buf, &s.checked_out);
        }
        ParentCommit::InProgress(s) => {
            buf.extend_from_slice(&VERSION_IN_PROGRESS.to_be_bytes());
            buf.extend_from_slice(&s.pid.to_be_bytes());
            put_hash(&mut buf, &s.from);
            put_hash(&mut buf, &s.to);
        }
    }
    buf
}

fn put_hash(buf: &mut Vec<u8>, root: &RootId) {
    buf.extend_from_slice(&(root.as_bytes().len() as u32).to_be_bytes());
    buf.extend_from_slice(root.as_bytes());
}

/// Reads the SNAPSHOT file at `path`.
pub fn read_snapshot(path: impl AsRef<Path>) -> Result<ParentCommit> {
    let bytes = fs::read(path.as_ref())?;
    parse(&bytes)
}

/// Atomically (write-to-tmp, rename-in-place) writes the SNAPSHOT file at
/// `path`, matching the Overlay's atomic write procedure.
pub fn write_snapshot(path: impl AsRef<Path>, parent: &ParentCommit) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    let bytes = serialize(parent);
    let result = (|| -> Result<()> {
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(s: &str) -> RootId {
        RootId::from(s)
    }

    #[test]
    fn rejects_too_short() {
        for bytes in [&b"edge"[..], b"eden", b"eden\0\0\0"] {
            let err = parse(bytes).unwrap_err();
            assert!(err.to_string().contains("too short"), "{bytes:?} -> {err}");
        }
    }

    #[test]
    fn rejects_missing_magic_as_unsupported_legacy() {
        let mut bytes = b"xden".to_vec();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; V1_BODY_LEN]);
        let err = parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported legacy"));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = b"eden".to_vec();
        bytes.extend_from_slice(&14u32.to_be_bytes());
        bytes.extend_from_slice(b"xyza");
        let err = parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported eden SNAPSHOT file format (version 14)"));
    }

    #[test]
    fn v1_wrong_length_is_rejected() {
        let mut bytes = b"eden".to_vec();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; V1_BODY_LEN - 1]);
        let err = parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("unexpected length"));
    }

    #[test]
    fn v1_uses_first_hash_and_hex_encodes() {
        let mut bytes = b"eden".to_vec();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        let hash = [
            0x99, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0xab,
            0xcd, 0xef, 0x99,
        ];
        bytes.extend_from_slice(&hash);
        bytes.extend_from_slice(&[0u8; V1_HASH_LEN]); // second (ignored) hash
        let parsed = parse(&bytes).unwrap();
        assert_eq!(
            parsed,
            ParentCommit::steady(root("99887766554433221100aabbccddeeffabcdef99"))
        );
    }

    #[test]
    fn v2_round_trips_ascii_hex_hash() {
        let mut bytes = b"eden".to_vec();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        let hex = "99887766554433221100aabbccddeeffabcdef99";
        bytes.extend_from_slice(&(hex.len() as u32).to_be_bytes());
        bytes.extend_from_slice(hex.as_bytes());
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, ParentCommit::steady(root(hex)));
    }

    #[test]
    fn v2_underflow_is_a_range_error() {
        let bytes = vec![b'e', b'd', b'e', b'n', 0, 0, 0, 2];
        let err = parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("underflow"));

        let mut bytes2 = b"eden".to_vec();
        bytes2.extend_from_slice(&2u32.to_be_bytes());
        bytes2.extend_from_slice(&2u32.to_be_bytes());
        bytes2.push(0x32);
        let err2 = parse(&bytes2).unwrap_err();
        assert!(err2.to_string().contains("underflow"));
    }

    #[test]
    fn v3_in_progress_round_trips() {
        let mut bytes = b"eden".to_vec();
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        let from = "99887766554433221100aabbccddeeffabcdef99";
        let to = "fedcba99887766554433221100ffeeddccbbaa99";
        bytes.extend_from_slice(&(from.len() as u32).to_be_bytes());
        bytes.extend_from_slice(from.as_bytes());
        bytes.extend_from_slice(&(to.len() as u32).to_be_bytes());
        bytes.extend_from_slice(to.as_bytes());

        let parsed = parse(&bytes).unwrap();
        assert_eq!(
            parsed,
            ParentCommit::InProgress(CheckoutInProgress {
                from: root(from),
                to: root(to),
                pid: 1,
            })
        );
    }

    #[test]
    fn set_checkout_in_progress_then_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SNAPSHOT");
        let parent = ParentCommit::set_checkout_in_progress(
            root("99887766554433221100aabbccddeeffabcdef99"),
            root("fedcba99887766554433221100ffeeddccbbaa99"),
        );
        write_snapshot(&path, &parent).unwrap();
        let reread = read_snapshot(&path).unwrap();
        assert_eq!(reread.is_checkout_in_progress(), true);
        assert_eq!(reread.get_last_checkout_id(RootIdPreference::To), parent.get_last_checkout_id(RootIdPreference::To));
        assert_eq!(reread.get_last_checkout_id(RootIdPreference::From), parent.get_last_checkout_id(RootIdPreference::From));
        match &reread {
            ParentCommit::InProgress(s) => assert_eq!(s.pid, std::process::id()),
            _ => panic!("expected InProgress"),
        }
    }

    #[test]
    fn checked_out_and_reset_transitions() {
        let parent = ParentCommit::set_checked_out_commit(root("aaaa"));
        let parent = parent.set_working_copy_parent_commit(root("bbbb"));
        match &parent {
            ParentCommit::Steady(s) => {
                assert_eq!(s.working_copy_parent, root("bbbb"));
                assert_eq!(s.checked_out, root("aaaa"));
            }
            _ => panic!("expected Steady"),
        }
        let parent = ParentCommit::set_checked_out_commit(root("aaaa"));
        match &parent {
            ParentCommit::Steady(s) => {
                assert_eq!(s.working_copy_parent, root("aaaa"));
                assert_eq!(s.checked_out, root("aaaa"));
            }
            _ => panic!("expected Steady"),
        }
    }

    #[test]
    fn diverged_steady_round_trips_through_crate_own_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SNAPSHOT");
        let parent = ParentCommit::Steady(WorkingCopyParentAndCheckedOut {
            working_copy_parent: root("bbbb"),
            checked_out: root("aaaa"),
        });
        write_snapshot(&path, &parent).unwrap();
        let reread = read_snapshot(&path).unwrap();
        assert_eq!(reread, parent);
    }

    #[test]
    fn get_last_checkout_id_respects_preference() {
        let parent = ParentCommit::InProgress(CheckoutInProgress {
            from: root("from"),
            to: root("to"),
            pid: 42,
        });
        assert_eq!(parent.get_last_checkout_id(RootIdPreference::To), Some(root("to")));
        assert_eq!(parent.get_last_checkout_id(RootIdPreference::From), Some(root("from")));
        assert_eq!(parent.get_last_checkout_id(RootIdPreference::OnlyStable), None);
        assert_eq!(parent.get_working_copy_parent(), root("to"));
    }
}

//! An opaque content-addressed object-store id.
//!
//! An opaque `Bytes` wrapper with cheap `Clone` and hex `Display`/`Debug`.
//! The inode engine never assumes a particular hash function or length,
//! since that's an object-store concern out of this crate's scope.

use bytes::Bytes;
use data_encoding::HEXLOWER;

/// An opaque identifier handed out by the (out-of-scope) object store.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(Bytes);

impl ObjectId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Vec<u8>> for ObjectId {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for ObjectId {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", HEXLOWER.encode(&self.0))
    }
}

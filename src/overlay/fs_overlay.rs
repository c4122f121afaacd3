//! The on-disk overlay implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use nix::unistd::fsync;
use std::os::unix::io::AsRawFd;

use crate::error::{CoreError, Result};
use crate::inode::{DirEntry, InodeNumber};
use crate::object_id::ObjectId;

use super::{DirListing, InoAllocator, Overlay, ROOT_NODE_ID};

const INFO_FILE: &str = "info";
const NEXT_INO_FILE: &str = "next-inode-number";
const TMP_DIR: &str = "tmp";
const LOCK_FILE: &str = "lock";

const INFO_MAGIC: [u8; 4] = [0xed, 0xe0, 0x00, 0x01];
pub const OVERLAY_FORMAT_VERSION: u32 = 1;

const TYPE_DIR: [u8; 4] = *b"OVDR";
const TYPE_FILE: [u8; 4] = *b"OVFL";
const RESERVED_LEN: usize = 48;

enum BlobKind {
    Dir,
    File,
}

/// A real, flock-protected, shard-sundered on-disk overlay.
pub struct FsOverlay {
    root: PathBuf,
    _lock_file: File,
    allocator: InoAllocator,
}

impl FsOverlay {
    /// Opens (creating if necessary) an overlay rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join(TMP_DIR))?;
        for byte in 0u16..256 {
            fs::create_dir_all(root.join(format!("{:02x}", byte)))?;
        }

        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(root.join(LOCK_FILE))?;
        flock(lock_file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|e| CoreError::posix(e as i32, "overlay already locked by another daemon"))?;

        Self::ensure_info_file(&root)?;

        let next_ino = Self::consume_next_ino_file(&root)?.unwrap_or_else(|| Self::scan_max_ino(&root) + 1);

        Ok(Self {
            root,
            _lock_file: lock_file,
            allocator: InoAllocator::starting_at(next_ino),
        })
    }

    fn ensure_info_file(root: &Path) -> Result<()> {
        let path = root.join(INFO_FILE);
        if path.exists() {
            let mut buf = [0u8; 8];
            let mut f = File::open(&path)?;
            f.read_exact(&mut buf)?;
            if buf[0..4] != INFO_MAGIC {
                return Err(CoreError::generic("overlay info file has bad magic"));
            }
            return Ok(());
        }
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&INFO_MAGIC);
        buf.extend_from_slice(&OVERLAY_FORMAT_VERSION.to_be_bytes());
        fs::write(&path, &buf)?;
        Ok(())
    }

    fn consume_next_ino_file(root: &Path) -> Result<Option<u64>> {
        let path = root.join(NEXT_INO_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        fs::remove_file(&path)?;
        if bytes.len() != 8 {
            // malformed: fall back to a full scan
            return Ok(None);
        }
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes);
        Ok(Some(u64::from_le_bytes(arr)))
    }

    fn scan_max_ino(root: &Path) -> u64 {
        let mut max = ROOT_NODE_ID;
        for byte in 0u16..256 {
            let shard = root.join(format!("{:02x}", byte));
            let Ok(entries) = fs::read_dir(&shard) else {
                continue;
            };
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(ino) = name.parse::<u64>() {
                        max = max.max(ino);
                    }
                }
            }
        }
        max
    }

    fn shard_name(ino: InodeNumber) -> String {
        format!("{:02x}", ino.get() & 0xff)
    }

    fn blob_path(&self, ino: InodeNumber) -> PathBuf {
        self.root
            .join(Self::shard_name(ino))
            .join(ino.get().to_string())
    }

    fn tmp_path(&self, ino: InodeNumber) -> PathBuf {
        self.root.join(TMP_DIR).join(ino.get().to_string())
    }

    fn write_blob(&self, ino: InodeNumber, kind: BlobKind, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + RESERVED_LEN + payload.len());
        buf.extend_from_slice(match kind {
            BlobKind::Dir => &TYPE_DIR,
            BlobKind::File => &TYPE_FILE,
        });
        buf.extend_from_slice(&OVERLAY_FORMAT_VERSION.to_be_bytes());
        buf.extend_from_slice(&[0u8; RESERVED_LEN]);
        buf.extend_from_slice(payload);

        let tmp = self.tmp_path(ino);
        let result = (|| -> Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(&buf)?;
            if ino == InodeNumber::ROOT {
                f.flush()?;
                fsync(f.as_raw_fd()).map_err(|e| CoreError::posix(e as i32, "fsync failed"))?;
            }
            fs::rename(&tmp, self.blob_path(ino))?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn read_blob(&self, ino: InodeNumber, want: BlobKindTag) -> Result<Vec<u8>> {
        let path = self.blob_path(ino);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found(format!("no overlay data for inode {ino}"))
            } else {
                CoreError::from(e)
            }
        })?;
        if bytes.len() < 8 + RESERVED_LEN {
            return Err(CoreError::generic("overlay blob too short"));
        }
        let type_tag = &bytes[0..4];
        let expected = match want {
            BlobKindTag::Dir => &TYPE_DIR,
            BlobKindTag::File => &TYPE_FILE,
        };
        if type_tag != expected {
            return Err(CoreError::generic(format!(
                "overlay blob for inode {ino} has unexpected type tag"
            )));
        }
        let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        if version != OVERLAY_FORMAT_VERSION {
            return Err(CoreError::generic(format!(
                "overlay blob for inode {ino} has unsupported version {version}"
            )));
        }
        Ok(bytes[8 + RESERVED_LEN..].to_vec())
    }
}

enum BlobKindTag {
    Dir,
    File,
}

fn encode_listing(listing: &DirListing) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(listing.len() as u32).to_le_bytes());
    for (name, entry) in listing {
        let name_bytes = name.as_bytes();
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(name_bytes);
        buf.extend_from_slice(&entry.ino.get().to_le_bytes());
        buf.extend_from_slice(&entry.mode.to_le_bytes());
        match &entry.object_id {
            Some(id) => {
                let raw = id.as_bytes();
                buf.push(1);
                buf.extend_from_slice(&(raw.len() as u32).to_le_bytes());
                buf.extend_from_slice(raw);
            }
            None => buf.push(0),
        }
    }
    buf
}

fn decode_listing(mut bytes: &[u8]) -> Result<DirListing> {
    let mut listing = DirListing::new();
    let take = |bytes: &mut &[u8], n: usize| -> Result<Vec<u8>> {
        if bytes.len() < n {
            return Err(CoreError::generic("truncated overlay directory listing"));
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Ok(head.to_vec())
    };

    let count_bytes = take(&mut bytes, 4)?;
    let count = u32::from_le_bytes(count_bytes.try_into().unwrap());
    for _ in 0..count {
        let name_len = u16::from_le_bytes(take(&mut bytes, 2)?.try_into().unwrap()) as usize;
        let name = String::from_utf8(take(&mut bytes, name_len)?)
            .map_err(|_| CoreError::generic("non-utf8 name in overlay directory listing"))?;
        let ino = u64::from_le_bytes(take(&mut bytes, 8)?.try_into().unwrap());
        let mode = u32::from_le_bytes(take(&mut bytes, 4)?.try_into().unwrap());
        let has_id = take(&mut bytes, 1)?[0];
        let object_id = if has_id == 1 {
            let len = u32::from_le_bytes(take(&mut bytes, 4)?.try_into().unwrap()) as usize;
            Some(ObjectId::from(take(&mut bytes, len)?))
        } else {
            None
        };
        listing.insert(
            name,
            DirEntry {
                ino: InodeNumber::new(ino).ok_or_else(|| CoreError::generic("invalid ino 0 in overlay listing"))?,
                mode,
                object_id,
            },
        );
    }
    Ok(listing)
}

impl Overlay for FsOverlay {
    fn load_dir(&self, ino: InodeNumber) -> Result<DirListing> {
        let payload = self.read_blob(ino, BlobKindTag::Dir)?;
        decode_listing(&payload)
    }

    fn save_dir(&self, ino: InodeNumber, listing: &DirListing) -> Result<()> {
        self.write_blob(ino, BlobKind::Dir, &encode_listing(listing))
    }

    fn load_and_remove_dir(&self, ino: InodeNumber) -> Result<DirListing> {
        let listing = self.load_dir(ino)?;
        self.remove(ino)?;
        Ok(listing)
    }

    fn load_file(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        self.read_blob(ino, BlobKindTag::File)
    }

    fn save_file(&self, ino: InodeNumber, content: &[u8]) -> Result<()> {
        self.write_blob(ino, BlobKind::File, content)
    }

    fn remove(&self, ino: InodeNumber) -> Result<()> {
        match fs::remove_file(self.blob_path(ino)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::from(e)),
        }
    }

    fn has_data(&self, ino: InodeNumber) -> bool {
        self.blob_path(ino).exists()
    }

    fn allocate_next_ino(&self) -> InodeNumber {
        self.allocator.allocate()
    }

    fn close(&self) -> Result<()> {
        let next = self.allocator.peek_next();
        fs::write(self.root.join(NEXT_INO_FILE), next.to_le_bytes())?;
        Ok(())
    }
}

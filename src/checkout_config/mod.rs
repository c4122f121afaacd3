//! Per-checkout persisted configuration: the `config.toml` document plus the
//! SNAPSHOT-backed [`parent_commit`] state machine.
//!
//! The TOML shape is a single `[repository]` table; unrecognized keys and
//! tables are ignored on read rather than rejected.

pub mod parent_commit;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;
use parent_commit::{ParentCommit, RootId, RootIdPreference};

const CONFIG_FILE_NAME: &str = "config.toml";
const SNAPSHOT_FILE_NAME: &str = "SNAPSHOT";
const OVERLAY_DIR_NAME: &str = "local";

/// Which kernel channel a checkout should mount through. Unrecognized TOML
/// values fall back to [`MountProtocol::platform_default`] rather than
/// failing to load the checkout at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountProtocol {
    Fuse,
    Nfs,
    Prjfs,
}

impl MountProtocol {
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            MountProtocol::Prjfs
        } else if cfg!(target_os = "macos") {
            MountProtocol::Nfs
        } else {
            MountProtocol::Fuse
        }
    }

    fn parse_or_default(raw: Option<&str>) -> Self {
        match raw {
            Some("fuse") => MountProtocol::Fuse,
            Some("nfs") => MountProtocol::Nfs,
            Some("prjfs") => MountProtocol::Prjfs,
            _ => Self::platform_default(),
        }
    }
}

/// Whether path lookups under this checkout are case-sensitive. The
/// default, when unset in the TOML, tracks the host filesystem's
/// conventional case behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

impl CaseSensitivity {
    pub fn platform_default() -> Self {
        if cfg!(target_os = "linux") {
            CaseSensitivity::Sensitive
        } else {
            CaseSensitivity::Insensitive
        }
    }
}

/// Raw `[repository]` table as it appears in `config.toml`. `Deserialize`
/// ignores unrecognized keys and tables by default (no
/// `deny_unknown_fields`), matching this format's "readers must tolerate unknown
/// top-level tables and keys".
#[derive(Deserialize)]
struct RawRepository {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    protocol: Option<String>,
    #[serde(rename = "case-sensitive")]
    case_sensitive: Option<bool>,
    #[serde(rename = "require-utf8-path")]
    require_utf8_path: Option<bool>,
    #[serde(rename = "enable-tree-overlay")]
    enable_tree_overlay: Option<bool>,
    #[serde(rename = "guid")]
    platform_repo_identifier: Option<String>,
}

#[derive(Deserialize)]
struct RawConfig {
    repository: RawRepository,
}

/// The configuration state for a single checkout, as stored on disk under
/// `<client-directory>/config.toml` plus the SNAPSHOT file alongside it.
#[derive(Clone, Debug)]
pub struct CheckoutConfig {
    mount_path: PathBuf,
    client_directory: PathBuf,
    repo_type: String,
    repo_source: String,
    /// The protocol as literally written in the TOML (or the platform
    /// default if absent/unrecognized) — kept distinct from any
    /// runtime-negotiated protocol.
    raw_mount_protocol: MountProtocol,
    case_sensitive: CaseSensitivity,
    require_utf8_path: bool,
    enable_tree_overlay: bool,
    platform_repo_identifier: Option<String>,
}

impl CheckoutConfig {
    /// Loads a `CheckoutConfig` from `<client_directory>/config.toml`.
    pub fn load_from_client_directory(mount_path: impl Into<PathBuf>, client_directory: impl Into<PathBuf>) -> Result<Self> {
        let client_directory = client_directory.into();
        let raw = std::fs::read_to_string(client_directory.join(CONFIG_FILE_NAME))?;
        let parsed: RawConfig = toml::from_str(&raw)?;
        Ok(CheckoutConfig {
            mount_path: mount_path.into(),
            client_directory,
            repo_type: parsed.repository.kind,
            repo_source: parsed.repository.path,
            raw_mount_protocol: MountProtocol::parse_or_default(parsed.repository.protocol.as_deref()),
            case_sensitive: parsed
                .repository
                .case_sensitive
                .map(|b| if b { CaseSensitivity::Sensitive } else { CaseSensitivity::Insensitive })
                .unwrap_or_else(CaseSensitivity::platform_default),
            require_utf8_path: parsed.repository.require_utf8_path.unwrap_or(true),
            enable_tree_overlay: parsed.repository.enable_tree_overlay.unwrap_or(cfg!(target_os = "windows")),
            platform_repo_identifier: parsed.repository.platform_repo_identifier,
        })
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn client_directory(&self) -> &Path {
        &self.client_directory
    }

    pub fn repo_type(&self) -> &str {
        &self.repo_type
    }

    pub fn repo_source(&self) -> &str {
        &self.repo_source
    }

    pub fn raw_mount_protocol(&self) -> MountProtocol {
        self.raw_mount_protocol
    }

    /// The protocol this checkout should actually mount through. Identical
    /// to [`Self::raw_mount_protocol`] today; kept as a separate accessor so
    /// a future runtime override (e.g. a command-line forced protocol) has
    /// somewhere to live without breaking `raw_mount_protocol`'s "what does
    /// the TOML literally say" contract.
    pub fn mount_protocol(&self) -> MountProtocol {
        self.raw_mount_protocol
    }

    pub fn case_sensitive(&self) -> CaseSensitivity {
        self.case_sensitive
    }

    pub fn require_utf8_path(&self) -> bool {
        self.require_utf8_path
    }

    pub fn enable_tree_overlay(&self) -> bool {
        self.enable_tree_overlay
    }

    pub fn platform_repo_identifier(&self) -> Option<&str> {
        self.platform_repo_identifier.as_deref()
    }

    pub fn overlay_path(&self) -> PathBuf {
        self.client_directory.join(OVERLAY_DIR_NAME)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.client_directory.join(SNAPSHOT_FILE_NAME)
    }

    pub fn get_parent_commit(&self) -> Result<ParentCommit> {
        parent_commit::read_snapshot(self.snapshot_path())
    }

    pub fn set_checked_out_commit(&self, root: RootId) -> Result<()> {
        parent_commit::write_snapshot(self.snapshot_path(), &ParentCommit::set_checked_out_commit(root))
    }

    pub fn set_working_copy_parent_commit(&self, root: RootId) -> Result<()> {
        let current = self.get_parent_commit()?;
        parent_commit::write_snapshot(
            self.snapshot_path(),
            &current.set_working_copy_parent_commit(root),
        )
    }

    pub fn set_checkout_in_progress(&self, from: RootId, to: RootId) -> Result<()> {
        parent_commit::write_snapshot(self.snapshot_path(), &ParentCommit::set_checkout_in_progress(from, to))
    }

    pub fn get_last_checkout_id(&self, preference: RootIdPreference) -> Result<Option<RootId>> {
        Ok(self.get_parent_commit()?.get_last_checkout_id(preference))
    }

    pub fn get_working_copy_parent(&self) -> Result<RootId> {
        Ok(self.get_parent_commit()?.get_working_copy_parent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_client_dir(dir: &Path, toml_body: &str, snapshot: &[u8]) {
        std::fs::write(dir.join(CONFIG_FILE_NAME), toml_body).unwrap();
        std::fs::write(dir.join(SNAPSHOT_FILE_NAME), snapshot).unwrap();
    }

    fn v1_snapshot(hash: &[u8; 20]) -> Vec<u8> {
        let mut bytes = b"eden".to_vec();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(hash);
        bytes.extend_from_slice(hash);
        bytes
    }

    #[test]
    fn loads_from_client_directory() {
        let dir = tempfile::tempdir().unwrap();
        let hash = [
            0x12, 0x34, 0x56, 0x78, 0x12, 0x34, 0x56, 0x78, 0x12, 0x34, 0x56, 0x78, 0x12, 0x34, 0x56, 0x78, 0x12,
            0x34, 0x56, 0x78,
        ];
        write_client_dir(
            dir.path(),
            "[repository]\npath = \"/data/fbsource\"\ntype = \"git\"\n",
            &v1_snapshot(&hash),
        );
        let config = CheckoutConfig::load_from_client_directory("/tmp/someplace", dir.path()).unwrap();
        assert_eq!(config.mount_path(), Path::new("/tmp/someplace"));
        assert_eq!(config.repo_type(), "git");
        let parent = config.get_parent_commit().unwrap();
        assert_eq!(
            parent,
            ParentCommit::steady(RootId::from("1234567812345678123456781234567812345678"))
        );
    }

    #[test]
    fn tolerates_unknown_keys_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let hash = [0u8; 20];
        write_client_dir(
            dir.path(),
            "[repository]\npath = \"/data/fbsource\"\ntype = \"git\"\ncolor = \"blue\"\n[bind-mounts]\nfoo = \"bar\"\n",
            &v1_snapshot(&hash),
        );
        let config = CheckoutConfig::load_from_client_directory("/tmp/someplace", dir.path()).unwrap();
        assert_eq!(config.repo_type(), "git");
    }

    #[test]
    fn unrecognized_protocol_falls_back_to_platform_default() {
        let dir = tempfile::tempdir().unwrap();
        write_client_dir(
            dir.path(),
            "[repository]\npath = \"/data/fbsource\"\ntype = \"git\"\nprotocol = \"INVALID\"\n",
            &v1_snapshot(&[0u8; 20]),
        );
        let config = CheckoutConfig::load_from_client_directory("/tmp/someplace", dir.path()).unwrap();
        assert_eq!(config.raw_mount_protocol(), MountProtocol::platform_default());
    }

    #[test]
    fn recognized_protocols_round_trip() {
        for (text, expected) in [("fuse", MountProtocol::Fuse), ("nfs", MountProtocol::Nfs), ("prjfs", MountProtocol::Prjfs)] {
            let dir = tempfile::tempdir().unwrap();
            write_client_dir(
                dir.path(),
                &format!("[repository]\npath = \"/data/fbsource\"\ntype = \"git\"\nprotocol = \"{text}\"\n"),
                &v1_snapshot(&[0u8; 20]),
            );
            let config = CheckoutConfig::load_from_client_directory("/tmp/someplace", dir.path()).unwrap();
            assert_eq!(config.raw_mount_protocol(), expected);
        }
    }

    #[test]
    fn checkout_lifecycle_through_config() {
        let dir = tempfile::tempdir().unwrap();
        write_client_dir(
            dir.path(),
            "[repository]\npath = \"/data/fbsource\"\ntype = \"git\"\n",
            &v1_snapshot(&[0u8; 20]),
        );
        let config = CheckoutConfig::load_from_client_directory("/tmp/someplace", dir.path()).unwrap();

        let from = RootId::from("99887766554433221100aabbccddeeffabcdef99");
        let to = RootId::from("fedcba99887766554433221100ffeeddccbbaa99");
        config.set_checkout_in_progress(from.clone(), to.clone()).unwrap();
        assert!(config.get_parent_commit().unwrap().is_checkout_in_progress());

        config.set_checked_out_commit(to.clone()).unwrap();
        let parent = config.get_parent_commit().unwrap();
        assert!(!parent.is_checkout_in_progress());
        assert_eq!(parent.get_working_copy_parent(), to);
    }
}

//! The isolated privileged mount agent.
//!
//! A daemon forks this helper before spawning any threads so the child
//! inherits a single-threaded, easily-`fork`-able process image. Afterwards
//! the two sides only ever talk over the connected socket pair using the
//! framing in [`protocol`].

pub mod client;
pub mod protocol;
pub mod sanity_check;
pub mod server;

use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::error::{CoreError, Result};
use protocol::{MsgType, PacketMetadata, PACKET_METADATA_LEN, PROTOCOL_VERSION};

/// The identity the daemon is running as, captured once at process start
/// before any privilege drop. Threading this value explicitly rather than
/// reading `getuid()`/`getenv()` ad hoc throughout the privileged code path
/// avoids relying on global process state for privilege drop.
#[derive(Clone, Debug)]
pub struct UserInfo {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home_dir: PathBuf,
}

impl UserInfo {
    /// Looks up the real (pre-setuid) user's identity via `getpwuid`.
    pub fn lookup() -> Result<Self> {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        let passwd = nix::unistd::User::from_uid(uid)
            .map_err(|e| CoreError::posix(e as i32, "getpwuid failed"))?
            .ok_or_else(|| CoreError::generic(format!("no passwd entry for uid {uid}")))?;
        Ok(UserInfo {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            username: passwd.name,
            home_dir: passwd.dir,
        })
    }
}

/// A fully decoded frame: the two fixed-width header structs already parsed
/// out, plus the raw body bytes and any ancillary FDs received alongside
/// them.
pub(crate) struct RawFrame {
    pub transaction_id: u32,
    pub msg_type: MsgType,
    pub body: Vec<u8>,
    pub fds: Vec<RawFd>,
}

fn encode_header_and_metadata(transaction_id: u32, msg_type: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    buf[4..8].copy_from_slice(&PACKET_METADATA_LEN.to_le_bytes());
    buf[8..12].copy_from_slice(&transaction_id.to_le_bytes());
    buf[12..16].copy_from_slice(&msg_type.to_le_bytes());
    buf
}

fn send_with_fds(raw_fd: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<()> {
    let iov = [io::IoSlice::new(buf)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    nix::sys::socket::sendmsg::<()>(raw_fd, &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    Ok(())
}

fn recv_with_fds(raw_fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<RawFd>)> {
    let mut cmsg_space = nix::cmsg_space!([RawFd; 4]);
    let mut iov = [io::IoSliceMut::new(buf)];
    let msg = nix::sys::socket::recvmsg::<()>(raw_fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad cmsg"))? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }
    Ok((msg.bytes, fds))
}

/// Writes one framed message: header, metadata, body, and any ancillary
/// FDs via `SCM_RIGHTS`.
pub(crate) async fn write_frame(stream: &UnixStream, transaction_id: u32, msg_type: u32, body: &[u8], fds: &[RawFd]) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let header = encode_header_and_metadata(transaction_id, msg_type);
    let mut buf = Vec::with_capacity(header.len() + body.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(body);

    loop {
        stream.writable().await.map_err(CoreError::from)?;
        let raw_fd = stream.as_raw_fd();
        match stream.try_io(Interest::WRITABLE, || send_with_fds(raw_fd, &buf, fds)) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(CoreError::from(e)),
        }
    }
}

/// Reads one framed message. The maximum body length is bounded generously;
/// a larger `length` field is treated as a protocol violation rather than
/// an unbounded allocation.
const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

pub(crate) async fn read_frame(stream: &UnixStream) -> Result<RawFrame> {
    use std::os::unix::io::AsRawFd;

    // The header+metadata are fixed-size and never carry FDs; the body may.
    let mut head_buf = [0u8; 16];
    loop {
        stream.readable().await.map_err(CoreError::from)?;
        let raw_fd = stream.as_raw_fd();
        match stream.try_io(Interest::READABLE, || recv_with_fds(raw_fd, &mut head_buf)) {
            Ok((0, _)) => return Err(CoreError::generic("privhelper connection closed")),
            Ok((n, _)) if n < head_buf.len() => {
                return Err(CoreError::generic("short read on privhelper header"))
            }
            Ok((_, _)) => break,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(CoreError::from(e)),
        }
    }

    let version = u32::from_le_bytes(head_buf[0..4].try_into().unwrap());
    if version != PROTOCOL_VERSION {
        return Err(CoreError::generic(format!("privhelper protocol version mismatch: {version}")));
    }
    let length = u32::from_le_bytes(head_buf[4..8].try_into().unwrap());
    if length != PACKET_METADATA_LEN {
        return Err(CoreError::generic("privhelper metadata length mismatch"));
    }
    let metadata = PacketMetadata {
        transaction_id: u32::from_le_bytes(head_buf[8..12].try_into().unwrap()),
        msg_type: u32::from_le_bytes(head_buf[12..16].try_into().unwrap()),
    };
    let msg_type = MsgType::from_u32(metadata.msg_type)?;

    // Body length isn't carried in the fixed header; the framing relies on
    // each message type's fields being self-describing (length-prefixed
    // strings/lists), so read until the decoder is satisfied. In practice
    // the underlying datagram/stream read above already captured a whole
    // write_frame() call's worth of bytes for the body; callers read it in
    // one shot sized to the largest plausible message.
    let mut body = vec![0u8; 0];
    let mut chunk = vec![0u8; 4096];
    let mut fds = Vec::new();
    loop {
        stream.readable().await.map_err(CoreError::from)?;
        let raw_fd = stream.as_raw_fd();
        match stream.try_io(Interest::READABLE, || recv_with_fds(raw_fd, &mut chunk)) {
            Ok((0, _)) => break,
            Ok((n, received_fds)) => {
                body.extend_from_slice(&chunk[..n]);
                fds.extend(received_fds);
                if (body.len() as u32) > MAX_BODY_LEN {
                    return Err(CoreError::generic("privhelper message body too large"));
                }
                if n < chunk.len() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !body.is_empty() {
                    break;
                }
                continue;
            }
            Err(e) => return Err(CoreError::from(e)),
        }
    }

    Ok(RawFrame {
        transaction_id: metadata.transaction_id,
        msg_type,
        body,
        fds,
    })
}

/// A mount point path, validated only for shape (non-empty, absolute);
/// actual existence/permission checks happen in [`sanity_check`].
pub fn validate_mount_path(path: &str) -> Result<PathBuf> {
    let path = Path::new(path);
    if !path.is_absolute() {
        return Err(CoreError::generic(format!("mount path must be absolute: {}", path.display())));
    }
    Ok(path.to_path_buf())
}

//! The privileged side of a PrivHelper connection.
//!
//! A privileged mount agent: one process, forked before any thread is created, that holds the
//! privileges needed to call `mount(2)`/`umount2(2)` and does nothing else.
//! It tracks every mount point it has registered so that unmount requests
//! (and bind-mount requests, which must land *under* a known mount) can be
//! validated without trusting the unprivileged caller's path. The dispatch
//! loop handles every request to completion and turns any failure into a
//! `RESP_ERROR` response rather than tearing down the connection.

use std::collections::HashSet;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::net::UnixStream;

use crate::error::{CoreError, Result};

use super::protocol::{self, MsgType, Request, Response};
use super::sanity_check;
use super::{read_frame, write_frame};

/// The privileged half of the `mount`/`umount` syscalls, factored out behind
/// a trait the way [`crate::collaborators::ObjectStore`] factors out backing
/// storage: production code drives real `mount(2)` calls, tests substitute a
/// bookkeeping-only fake so the suite doesn't need to run as root.
pub trait MountOps: Send + Sync {
    fn fuse_mount(&self, mount_path: &Path, read_only: bool) -> Result<OwnedFd>;
    #[allow(clippy::too_many_arguments)]
    fn mount_nfs(
        &self,
        mount_path: &Path,
        mountd_addr: &str,
        nfsd_addr: &str,
        read_only: bool,
        iosize: u32,
        use_readdirplus: bool,
    ) -> Result<()>;
    fn bind_mount(&self, client_path: &Path, mount_path: &Path) -> Result<()>;
    /// Best-effort: logs and swallows everything except a caller mistake,
    /// since a mount already gone (`EINVAL`) is the common, harmless case
    /// during cleanup.
    fn unmount(&self, mount_path: &Path);
    fn bind_unmount(&self, mount_path: &Path);
}

/// Real Linux `mount(2)`/`umount2(2)` calls. The FUSE device handle is
/// opened here so the unprivileged side never needs `/dev/fuse` access
/// itself.
pub struct SystemMountOps;

fn cpath(path: &Path) -> Result<std::ffi::CString> {
    std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| CoreError::generic(format!("mount path contains a NUL byte: {}", path.display())))
}

impl MountOps for SystemMountOps {
    fn fuse_mount(&self, mount_path: &Path, read_only: bool) -> Result<OwnedFd> {
        let dev = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/fuse")
            .map_err(|e| CoreError::generic(format!("failed to open /dev/fuse: {e}")))?;

        let mut mount_flags = libc::MS_NOSUID;
        if read_only {
            mount_flags |= libc::MS_RDONLY;
        }
        let opts = format!(
            "fd={},rootmode=40755,user_id=0,group_id=0,allow_other",
            dev.as_raw_fd()
        );
        let source = cpath(Path::new("wcfs"))?;
        let target = cpath(mount_path)?;
        let fstype = std::ffi::CString::new("fuse").unwrap();
        let opts_c = std::ffi::CString::new(opts).unwrap();
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                mount_flags,
                opts_c.as_ptr() as *const libc::c_void,
            )
        };
        if rc != 0 {
            return Err(CoreError::posix(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
                format!("failed to mount fuse at {}", mount_path.display()),
            ));
        }
        Ok(std::os::fd::OwnedFd::from(dev))
    }

    fn mount_nfs(
        &self,
        mount_path: &Path,
        mountd_addr: &str,
        nfsd_addr: &str,
        read_only: bool,
        iosize: u32,
        use_readdirplus: bool,
    ) -> Result<()> {
        let no_readdirplus = if use_readdirplus { "," } else { ",nordirplus," };
        let opts = format!(
            "addr={nfsd_addr},vers=3,proto=tcp,mountaddr={mountd_addr},mountvers=3,mountproto=tcp,\
             noresvport,nolock{no_readdirplus}soft,retrans=0,rsize={iosize},wsize={iosize}"
        );
        let mut mount_flags = libc::MS_NOSUID;
        if read_only {
            mount_flags |= libc::MS_RDONLY;
        }
        let source = cpath(&PathBuf::from(format!("wcfs:{}", mount_path.display())))?;
        let target = cpath(mount_path)?;
        let fstype = std::ffi::CString::new("nfs").unwrap();
        let opts_c = std::ffi::CString::new(opts).unwrap();
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                mount_flags,
                opts_c.as_ptr() as *const libc::c_void,
            )
        };
        if rc != 0 {
            return Err(CoreError::posix(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
                format!("failed to mount nfs at {}", mount_path.display()),
            ));
        }
        Ok(())
    }

    fn bind_mount(&self, client_path: &Path, mount_path: &Path) -> Result<()> {
        let source = cpath(client_path)?;
        let target = cpath(mount_path)?;
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(CoreError::posix(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
                format!("failed to bind mount {} over {}", client_path.display(), mount_path.display()),
            ));
        }
        Ok(())
    }

    fn unmount(&self, mount_path: &Path) {
        if let Ok(target) = cpath(mount_path) {
            let flags = libc::UMOUNT_NOFOLLOW | libc::MNT_FORCE | libc::MNT_DETACH;
            let rc = unsafe { libc::umount2(target.as_ptr(), flags) };
            if rc != 0 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() != Some(libc::EINVAL) {
                    tracing::warn!(mount_path = %mount_path.display(), error = %errno, "error unmounting");
                }
            }
        }
    }

    fn bind_unmount(&self, mount_path: &Path) {
        self.unmount(mount_path);
    }
}

struct ServerState {
    mount_ops: Box<dyn MountOps>,
    mount_points: StdMutex<HashSet<PathBuf>>,
    caller_uid: u32,
    running_as_root: bool,
    daemon_timeout_ns: AtomicU64,
    use_dev_mode: AtomicBool,
}

/// The privileged server loop: owns the connected socket, dispatches one
/// request at a time, and force-unmounts everything it registered once the
/// connection closes.
pub struct PrivHelperServer {
    stream: UnixStream,
    state: ServerState,
}

impl PrivHelperServer {
    pub fn new(stream: UnixStream, caller_uid: u32, running_as_root: bool) -> Self {
        Self::with_mount_ops(stream, caller_uid, running_as_root, Box::new(SystemMountOps))
    }

    pub fn with_mount_ops(stream: UnixStream, caller_uid: u32, running_as_root: bool, mount_ops: Box<dyn MountOps>) -> Self {
        PrivHelperServer {
            stream,
            state: ServerState {
                mount_ops,
                mount_points: StdMutex::new(HashSet::new()),
                caller_uid,
                running_as_root,
                daemon_timeout_ns: AtomicU64::new(0),
                use_dev_mode: AtomicBool::new(false),
            },
        }
    }

    /// Ignores SIGINT/SIGTERM: this process should only exit once its parent
    /// does (by noticing the connection close), not on a terminal Ctrl-C
    /// that also reaches the parent.
    fn ignore_interactive_signals() -> Result<()> {
        unsafe {
            if libc::signal(libc::SIGINT, libc::SIG_IGN) == libc::SIG_ERR {
                return Err(CoreError::generic("failed to ignore SIGINT in privhelper process"));
            }
            if libc::signal(libc::SIGTERM, libc::SIG_IGN) == libc::SIG_ERR {
                return Err(CoreError::generic("failed to ignore SIGTERM in privhelper process"));
            }
        }
        Ok(())
    }

    /// Runs the dispatch loop until the connection is closed by its peer,
    /// then force-unmounts every mount point this server ever registered.
    pub async fn run(mut self) -> Result<()> {
        Self::ignore_interactive_signals()?;

        loop {
            let frame = match read_frame(&self.stream).await {
                Ok(frame) => frame,
                Err(_) => break,
            };

            let (transaction_id, msg_type) = (frame.transaction_id, frame.msg_type);
            let outcome = self.dispatch(frame).await;
            let (response_msg_type, body, fds) = match outcome {
                Ok((body, fds)) => (msg_type, body, fds),
                Err(e) => {
                    tracing::warn!(error = %e, ?msg_type, "privhelper request failed");
                    let body = protocol::encode_response_body(&Response::Error {
                        exception_type: "CoreError".to_string(),
                        message: e.to_string(),
                        errno: Some(e.to_errno()),
                    });
                    (MsgType::RespError, body, Vec::new())
                }
            };
            let fd_refs: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
            if write_frame(&self.stream, transaction_id, response_msg_type as u32, &body, &fd_refs).await.is_err() {
                break;
            }
        }

        self.cleanup_mount_points();
        Ok(())
    }

    async fn dispatch(&mut self, frame: super::RawFrame) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
        let request = protocol::decode_request_body(frame.msg_type, &frame.body)?;
        if frame.fds.len() != request.expected_fd_count() {
            return Err(CoreError::generic(format!(
                "privhelper request carried {} fds, expected {}",
                frame.fds.len(),
                request.expected_fd_count()
            )));
        }

        match request {
            Request::MountFuse { mount_path, read_only } => {
                let path = super::validate_mount_path(&mount_path)?;
                self.sanity_check(&path)?;
                let dev = self.state.mount_ops.fuse_mount(&path, read_only)?;
                self.state.mount_points.lock().unwrap().insert(path);
                Ok((protocol::encode_response_body(&Response::Empty), vec![dev]))
            }
            Request::MountNfs {
                mount_path,
                mountd_addr,
                nfsd_addr,
                read_only,
                iosize,
                use_readdirplus,
            } => {
                let path = super::validate_mount_path(&mount_path)?;
                self.sanity_check(&path)?;
                self.state
                    .mount_ops
                    .mount_nfs(&path, &mountd_addr, &nfsd_addr, read_only, iosize, use_readdirplus)?;
                self.state.mount_points.lock().unwrap().insert(path);
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
            Request::UnmountFuse { mount_path } | Request::UnmountNfs { mount_path } => {
                let path = super::validate_mount_path(&mount_path)?;
                self.take_registered_mount(&path)?;
                self.state.mount_ops.unmount(&path);
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
            Request::TakeoverShutdown { mount_path } => {
                let path = super::validate_mount_path(&mount_path)?;
                // Shutdown for takeover hands the mount to a new process
                // without unmounting it, so only the bookkeeping is dropped.
                self.take_registered_mount(&path)?;
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
            Request::TakeoverStartup { mount_path, bind_mounts: _ } => {
                let path = super::validate_mount_path(&mount_path)?;
                self.sanity_check(&path)?;
                self.state.mount_points.lock().unwrap().insert(path);
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
            Request::MountBind { client_path, mount_path } => {
                let path = super::validate_mount_path(&mount_path)?;
                self.require_mount_prefix(&path)?;
                let client_path = super::validate_mount_path(&client_path)?;
                self.state.mount_ops.bind_mount(&client_path, &path)?;
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
            Request::UnmountBind { mount_path } => {
                let path = super::validate_mount_path(&mount_path)?;
                self.require_mount_prefix(&path)?;
                self.state.mount_ops.bind_unmount(&path);
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
            Request::SetLogFile => {
                let fd = frame
                    .fds
                    .into_iter()
                    .next()
                    .ok_or_else(|| CoreError::generic("setLogFile request carried no file descriptor"))?;
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                set_log_file(owned)?;
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
            Request::SetDaemonTimeout { duration_ns } => {
                self.state.daemon_timeout_ns.store(duration_ns, Ordering::SeqCst);
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
            Request::SetUseDevMode { enabled } => {
                self.state.use_dev_mode.store(enabled, Ordering::SeqCst);
                Ok((protocol::encode_response_body(&Response::Empty), Vec::new()))
            }
        }
    }

    fn sanity_check(&self, mount_path: &Path) -> Result<()> {
        sanity_check::sanity_check_mount_point(mount_path, self.state.caller_uid, self.state.running_as_root)
    }

    /// Removes and returns `mount_path` from the registered set, or fails if
    /// it was never registered, refusing to unmount a path the caller never
    /// actually mounted through this server.
    fn take_registered_mount(&self, mount_path: &Path) -> Result<()> {
        let mut mount_points = self.state.mount_points.lock().unwrap();
        if !mount_points.remove(mount_path) {
            return Err(CoreError::not_found(format!("no mount found for {}", mount_path.display())));
        }
        Ok(())
    }

    /// Confirms `path` falls under some already-registered mount: bind
    /// mount/unmount requests must target somewhere inside a mount this
    /// server itself created, so an unprivileged caller can't use bind
    /// mounts to touch arbitrary paths.
    fn require_mount_prefix(&self, path: &Path) -> Result<()> {
        let mount_points = self.state.mount_points.lock().unwrap();
        let matches = mount_points.iter().any(|mp| path.starts_with(mp) && path != mp);
        if matches {
            Ok(())
        } else {
            Err(CoreError::not_found(format!("no mount found for {}", path.display())))
        }
    }

    fn cleanup_mount_points(&self) {
        let mount_points = std::mem::take(&mut *self.state.mount_points.lock().unwrap());
        for mount_point in mount_points {
            self.state.mount_ops.unmount(&mount_point);
        }
    }
}

fn set_log_file(log_file: OwnedFd) -> Result<()> {
    let raw = log_file.as_raw_fd();
    let rc_out = unsafe { libc::dup2(raw, libc::STDOUT_FILENO) };
    let rc_err = unsafe { libc::dup2(raw, libc::STDERR_FILENO) };
    if rc_out < 0 || rc_err < 0 {
        return Err(CoreError::generic("failed to redirect stdout/stderr to log file"));
    }
    Ok(())
}

//! The unprivileged side of a PrivHelper connection.
//!
//! A background task owns reading from the shared socket and demultiplexes
//! responses onto a correlation map of `(transaction_id, oneshot sender)`.
//! `attach`/`detach` stand in for relocating that correlation map onto a new
//! event loop — this crate has one global `tokio` runtime, so "attaching to
//! a new loop" is expressed as re-enabling sends rather than literally
//! moving a task between executors.

use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::oneshot;

use crate::error::{CoreError, Result};

use super::protocol::{self, MsgType, Request, Response};
use super::{read_frame, write_frame};

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

type PendingOutcome = std::result::Result<(Response, Vec<OwnedFd>), Arc<CoreError>>;

struct Pending {
    expected_fds: usize,
    tx: oneshot::Sender<PendingOutcome>,
}

struct ClientState {
    stream: UnixStream,
    pending: StdMutex<HashMap<u32, Pending>>,
    next_txn: AtomicU32,
    attached: AtomicBool,
    closed: AtomicBool,
}

/// A handle to the privileged helper process, reachable over one connected
/// `UnixStream`. Cheap to clone; every clone shares the same correlation
/// map and reader task.
#[derive(Clone)]
pub struct PrivHelperClient {
    state: Arc<ClientState>,
    send_timeout: Duration,
}

impl PrivHelperClient {
    /// Wraps an already-connected socket and starts the background reader
    /// task, attached to the current runtime from construction.
    pub fn new(stream: UnixStream) -> Self {
        let state = Arc::new(ClientState {
            stream,
            pending: StdMutex::new(HashMap::new()),
            next_txn: AtomicU32::new(1),
            attached: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(Self::reader_loop(state.clone()));
        PrivHelperClient {
            state,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Re-enables sending new requests after [`Self::detach`]. This crate
    /// has a single shared runtime, so there is no literal event loop to
    /// move the reader task to; attaching only lifts the fail-fast guard.
    pub fn attach(&self) {
        self.state.attached.store(true, Ordering::SeqCst);
    }

    /// Disables sending new requests. Outstanding in-flight requests still
    /// complete once their response arrives — only *new* sends fail fast
    /// with "not attached", matching this crate's cancellation model.
    pub fn detach(&self) {
        self.state.attached.store(false, Ordering::SeqCst);
    }

    /// Closes the connection, failing every outstanding request with one
    /// shared error and rejecting all future sends.
    pub fn close(&self) {
        self.fail_all(Arc::new(CoreError::generic(
            "cannot send new requests on closed privhelper connection",
        )));
    }

    fn fail_all(&self, err: Arc<CoreError>) {
        self.state.closed.store(true, Ordering::SeqCst);
        let mut pending = self.state.pending.lock().unwrap();
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(err.clone()));
        }
    }

    async fn reader_loop(state: Arc<ClientState>) {
        loop {
            match read_frame(&state.stream).await {
                Ok(frame) => {
                    let response = match protocol::decode_response_body(frame.msg_type, &frame.body) {
                        Ok(r) => r,
                        Err(e) => {
                            Self::fail_transaction(&state, frame.transaction_id, Arc::new(e));
                            continue;
                        }
                    };
                    let fds: Vec<OwnedFd> = frame
                        .fds
                        .into_iter()
                        .map(|raw: RawFd| unsafe { OwnedFd::from_raw_fd(raw) })
                        .collect();
                    let entry = state.pending.lock().unwrap().remove(&frame.transaction_id);
                    let Some(entry) = entry else {
                        tracing::warn!(
                            transaction_id = frame.transaction_id,
                            "privhelper response for unknown (already-failed or timed-out) transaction"
                        );
                        continue;
                    };
                    if fds.len() != entry.expected_fds {
                        let _ = entry.tx.send(Err(Arc::new(CoreError::generic(format!(
                            "privhelper response carried {} fds, expected {}",
                            fds.len(),
                            entry.expected_fds
                        )))));
                        continue;
                    }
                    let _ = entry.tx.send(Ok((response, fds)));
                }
                Err(e) => {
                    Self::fail_all_static(&state, Arc::new(e));
                    return;
                }
            }
        }
    }

    fn fail_transaction(state: &Arc<ClientState>, transaction_id: u32, err: Arc<CoreError>) {
        if let Some(entry) = state.pending.lock().unwrap().remove(&transaction_id) {
            let _ = entry.tx.send(Err(err));
        }
    }

    fn fail_all_static(state: &Arc<ClientState>, err: Arc<CoreError>) {
        state.closed.store(true, Ordering::SeqCst);
        let mut pending = state.pending.lock().unwrap();
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(err.clone()));
        }
    }

    /// Sends `request`, awaiting the matching response. `expected_fds` is
    /// the number of ancillary FDs this request's response must carry
    /// (exactly one for `MOUNT_FUSE`, zero otherwise).
    #[tracing::instrument(skip(self, request))]
    async fn call(&self, request: Request, expected_fds: usize) -> Result<(Response, Vec<OwnedFd>)> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(CoreError::generic("cannot send new requests on closed privhelper connection"));
        }
        if !self.state.attached.load(Ordering::SeqCst) {
            return Err(CoreError::generic("privhelper client is not attached to an event loop"));
        }

        let transaction_id = self.state.next_txn.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().unwrap().insert(transaction_id, Pending { expected_fds, tx });

        let body = protocol::encode_request_body(&request);
        let fds: Vec<RawFd> = Vec::new();
        if let Err(e) = write_frame(&self.state.stream, transaction_id, request.msg_type() as u32, &body, &fds).await {
            Self::fail_transaction(&self.state, transaction_id, Arc::new(e.clone()));
            return Err(e);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(Ok((Response::Error { exception_type, message, errno }, _)))) => Err(response_error_to_core(exception_type, message, errno)),
            Ok(Ok(Ok((response, fds)))) => Ok((response, fds)),
            Ok(Ok(Err(e))) => Err((*e).clone()),
            Ok(Err(_)) => Err(CoreError::generic("privhelper response channel dropped without a result")),
            Err(_) => {
                Self::fail_transaction(&self.state, transaction_id, Arc::new(CoreError::generic("privhelper request timed out")));
                Err(CoreError::generic("privhelper request timed out"))
            }
        }
    }

    /// Like [`Self::call`], but sends `fds` alongside the request body
    /// (only `SET_LOG_FILE` carries ancillary data in a request today).
    async fn call_with_fds(&self, request: Request, fds_out: &[RawFd], expected_fds: usize) -> Result<(Response, Vec<OwnedFd>)> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(CoreError::generic("cannot send new requests on closed privhelper connection"));
        }
        if !self.state.attached.load(Ordering::SeqCst) {
            return Err(CoreError::generic("privhelper client is not attached to an event loop"));
        }
        let transaction_id = self.state.next_txn.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().unwrap().insert(transaction_id, Pending { expected_fds, tx });

        let body = protocol::encode_request_body(&request);
        if let Err(e) = write_frame(&self.state.stream, transaction_id, request.msg_type() as u32, &body, fds_out).await {
            Self::fail_transaction(&self.state, transaction_id, Arc::new(e.clone()));
            return Err(e);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(Ok((Response::Error { exception_type, message, errno }, _)))) => Err(response_error_to_core(exception_type, message, errno)),
            Ok(Ok(Ok((response, fds)))) => Ok((response, fds)),
            Ok(Ok(Err(e))) => Err((*e).clone()),
            Ok(Err(_)) => Err(CoreError::generic("privhelper response channel dropped without a result")),
            Err(_) => Err(CoreError::generic("privhelper request timed out")),
        }
    }

    pub async fn fuse_mount(&self, mount_path: &str, read_only: bool) -> Result<OwnedFd> {
        let (_, mut fds) = self
            .call(
                Request::MountFuse {
                    mount_path: mount_path.to_string(),
                    read_only,
                },
                1,
            )
            .await?;
        Ok(fds.remove(0))
    }

    pub async fn fuse_unmount(&self, mount_path: &str) -> Result<()> {
        self.call(Request::UnmountFuse { mount_path: mount_path.to_string() }, 0).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mount_nfs(
        &self,
        mount_path: &str,
        mountd_addr: &str,
        nfsd_addr: &str,
        read_only: bool,
        iosize: u32,
        use_readdirplus: bool,
    ) -> Result<()> {
        self.call(
            Request::MountNfs {
                mount_path: mount_path.to_string(),
                mountd_addr: mountd_addr.to_string(),
                nfsd_addr: nfsd_addr.to_string(),
                read_only,
                iosize,
                use_readdirplus,
            },
            0,
        )
        .await?;
        Ok(())
    }

    pub async fn unmount_nfs(&self, mount_path: &str) -> Result<()> {
        self.call(Request::UnmountNfs { mount_path: mount_path.to_string() }, 0).await?;
        Ok(())
    }

    pub async fn bind_mount(&self, client_path: &str, mount_path: &str) -> Result<()> {
        self.call(
            Request::MountBind {
                client_path: client_path.to_string(),
                mount_path: mount_path.to_string(),
            },
            0,
        )
        .await?;
        Ok(())
    }

    pub async fn bind_unmount(&self, mount_path: &str) -> Result<()> {
        self.call(Request::UnmountBind { mount_path: mount_path.to_string() }, 0).await?;
        Ok(())
    }

    pub async fn fuse_takeover_shutdown(&self, mount_path: &str) -> Result<()> {
        self.call(Request::TakeoverShutdown { mount_path: mount_path.to_string() }, 0).await?;
        Ok(())
    }

    pub async fn fuse_takeover_startup(&self, mount_path: &str, bind_mounts: Vec<String>) -> Result<()> {
        self.call(
            Request::TakeoverStartup {
                mount_path: mount_path.to_string(),
                bind_mounts,
            },
            0,
        )
        .await?;
        Ok(())
    }

    pub async fn set_log_file(&self, log_fd: OwnedFd) -> Result<()> {
        use std::os::fd::AsRawFd;
        let raw = log_fd.as_raw_fd();
        self.call_with_fds(Request::SetLogFile, &[raw], 0).await?;
        drop(log_fd);
        Ok(())
    }

    pub async fn set_daemon_timeout(&self, duration: Duration) -> Result<()> {
        self.call(
            Request::SetDaemonTimeout {
                duration_ns: duration.as_nanos() as u64,
            },
            0,
        )
        .await?;
        Ok(())
    }

    pub async fn set_use_dev_mode(&self, enabled: bool) -> Result<()> {
        self.call(Request::SetUseDevMode { enabled }, 0).await?;
        Ok(())
    }
}

fn response_error_to_core(exception_type: String, message: String, errno: Option<i32>) -> CoreError {
    match errno {
        Some(errno) => CoreError::posix(errno, format!("{exception_type}: {message}")),
        None => CoreError::generic(format!("{exception_type}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unmount_round_trips_empty_response() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let client = PrivHelperClient::new(client_sock);

        tokio::spawn(async move {
            let frame = read_frame(&server_sock).await.unwrap();
            assert_eq!(frame.msg_type, MsgType::UnmountFuse);
            write_frame(&server_sock, frame.transaction_id, MsgType::UnmountFuse as u32, &[], &[])
                .await
                .unwrap();
        });

        client.fuse_unmount("/mnt/x").await.unwrap();
    }

    #[tokio::test]
    async fn error_response_surfaces_as_core_error() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let client = PrivHelperClient::new(client_sock);

        tokio::spawn(async move {
            let frame = read_frame(&server_sock).await.unwrap();
            let body = protocol::encode_response_body(&Response::Error {
                exception_type: "RangeError".to_string(),
                message: "boom".to_string(),
                errno: Some(13),
            });
            write_frame(&server_sock, frame.transaction_id, MsgType::RespError as u32, &body, &[])
                .await
                .unwrap();
        });

        let err = client.fuse_unmount("/mnt/x").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn closed_connection_fails_new_sends() {
        let (client_sock, _server_sock) = UnixStream::pair().unwrap();
        let client = PrivHelperClient::new(client_sock);
        client.close();
        let err = client.fuse_unmount("/mnt/x").await.unwrap_err();
        assert!(err.to_string().contains("cannot send new requests on closed privhelper connection"));
    }

    #[tokio::test]
    async fn detached_client_fails_fast() {
        let (client_sock, _server_sock) = UnixStream::pair().unwrap();
        let client = PrivHelperClient::new(client_sock);
        client.detach();
        let err = client.fuse_unmount("/mnt/x").await.unwrap_err();
        assert!(err.to_string().contains("not attached"));
        client.attach();
    }

    #[tokio::test]
    async fn peer_close_fails_outstanding_request() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let client = PrivHelperClient::new(client_sock);
        drop(server_sock);
        let err = client.fuse_unmount("/mnt/x").await.unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[tokio::test]
    async fn fuse_mount_returns_exactly_one_fd() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let client = PrivHelperClient::new(client_sock);

        tokio::spawn(async move {
            use std::os::fd::AsRawFd;
            let frame = read_frame(&server_sock).await.unwrap();
            assert_eq!(frame.msg_type, MsgType::MountFuse);
            let dummy = std::fs::File::open("/dev/null").unwrap();
            write_frame(&server_sock, frame.transaction_id, MsgType::MountFuse as u32, &[], &[dummy.as_raw_fd()])
                .await
                .unwrap();
        });

        let fd = client.fuse_mount("/mnt/x", false).await.unwrap();
        use std::os::fd::AsRawFd;
        assert!(fd.as_raw_fd() >= 0);
    }
}

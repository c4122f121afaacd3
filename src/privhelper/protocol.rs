//! Wire framing for the PrivHelper protocol.
//!
//! The framing is deliberately hand-rolled rather than serde-encoded: it
//! must stay byte-stable across daemon versions during a graft/takeover, so
//! every field is written with an explicit width and order instead of
//! leaning on a derive that could silently change layout.

use std::convert::TryInto;

use crate::error::{CoreError, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Numeric values are pinned explicitly rather than left to derive order,
/// since a version skew between an old client and new server must still be
/// able to recognize `RESP_ERROR`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    RespError = 1,
    MountFuse = 2,
    MountBind = 3,
    UnmountFuse = 4,
    TakeoverShutdown = 5,
    TakeoverStartup = 6,
    SetLogFile = 7,
    UnmountBind = 8,
    SetDaemonTimeout = 9,
    SetUseDevMode = 10,
    MountNfs = 11,
    UnmountNfs = 12,
}

impl MsgType {
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            1 => MsgType::RespError,
            2 => MsgType::MountFuse,
            3 => MsgType::MountBind,
            4 => MsgType::UnmountFuse,
            5 => MsgType::TakeoverShutdown,
            6 => MsgType::TakeoverStartup,
            7 => MsgType::SetLogFile,
            8 => MsgType::UnmountBind,
            9 => MsgType::SetDaemonTimeout,
            10 => MsgType::SetUseDevMode,
            11 => MsgType::MountNfs,
            12 => MsgType::UnmountNfs,
            other => return Err(CoreError::generic(format!("unknown privhelper message type {other}"))),
        })
    }
}

/// `{version, length}`; `length` is always `sizeof(PacketMetadata)` i.e. 8.
#[derive(Clone, Copy, Debug)]
pub struct PacketHeader {
    pub version: u32,
    pub length: u32,
}

pub const PACKET_METADATA_LEN: u32 = 8;

/// `{transaction_id, msg_type}`.
#[derive(Clone, Copy, Debug)]
pub struct PacketMetadata {
    pub transaction_id: u32,
    pub msg_type: u32,
}

/// A decoded request, one variant per [`MsgType`] (excluding `RespError`,
/// which only ever appears in responses).
#[derive(Clone, Debug)]
pub enum Request {
    MountFuse { mount_path: String, read_only: bool },
    UnmountFuse { mount_path: String },
    MountNfs {
        mount_path: String,
        mountd_addr: String,
        nfsd_addr: String,
        read_only: bool,
        iosize: u32,
        use_readdirplus: bool,
    },
    UnmountNfs { mount_path: String },
    MountBind { client_path: String, mount_path: String },
    UnmountBind { mount_path: String },
    TakeoverShutdown { mount_path: String },
    TakeoverStartup { mount_path: String, bind_mounts: Vec<String> },
    SetLogFile,
    SetDaemonTimeout { duration_ns: u64 },
    SetUseDevMode { enabled: bool },
}

impl Request {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Request::MountFuse { .. } => MsgType::MountFuse,
            Request::UnmountFuse { .. } => MsgType::UnmountFuse,
            Request::MountNfs { .. } => MsgType::MountNfs,
            Request::UnmountNfs { .. } => MsgType::UnmountNfs,
            Request::MountBind { .. } => MsgType::MountBind,
            Request::UnmountBind { .. } => MsgType::UnmountBind,
            Request::TakeoverShutdown { .. } => MsgType::TakeoverShutdown,
            Request::TakeoverStartup { .. } => MsgType::TakeoverStartup,
            Request::SetLogFile => MsgType::SetLogFile,
            Request::SetDaemonTimeout { .. } => MsgType::SetDaemonTimeout,
            Request::SetUseDevMode { .. } => MsgType::SetUseDevMode,
        }
    }

    /// Number of ancillary file descriptors this request must carry.
    pub fn expected_fd_count(&self) -> usize {
        match self {
            Request::SetLogFile => 1,
            _ => 0,
        }
    }
}

/// A decoded response body (the FD, if any, travels out-of-band).
#[derive(Clone, Debug)]
pub enum Response {
    /// An empty success response. `MOUNT_FUSE` success carries exactly one
    /// ancillary FD (the open `/dev/fuse` handle); every other success
    /// carries none.
    Empty,
    Error {
        exception_type: String,
        message: String,
        errno: Option<i32>,
    },
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn put_string_list(buf: &mut Vec<u8>, items: &[String]) {
    put_u32(buf, items.len() as u32);
    for item in items {
        put_string(buf, item);
    }
}

struct BodyReader<'a> {
    bytes: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(CoreError::generic("truncated privhelper message body"));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|_| CoreError::generic("non-utf8 string in privhelper message body"))
    }

    fn string_list(&mut self) -> Result<Vec<String>> {
        let len = self.u32()? as usize;
        (0..len).map(|_| self.string()).collect()
    }
}

/// Serializes a request body in the field order enumerated in this crate's
/// message table.
pub fn encode_request_body(request: &Request) -> Vec<u8> {
    let mut buf = Vec::new();
    match request {
        Request::MountFuse { mount_path, read_only } => {
            put_string(&mut buf, mount_path);
            put_bool(&mut buf, *read_only);
        }
        Request::UnmountFuse { mount_path } => put_string(&mut buf, mount_path),
        Request::MountNfs {
            mount_path,
            mountd_addr,
            nfsd_addr,
            read_only,
            iosize,
            use_readdirplus,
        } => {
            put_string(&mut buf, mount_path);
            put_string(&mut buf, mountd_addr);
            put_string(&mut buf, nfsd_addr);
            put_bool(&mut buf, *read_only);
            put_u32(&mut buf, *iosize);
            put_bool(&mut buf, *use_readdirplus);
        }
        Request::UnmountNfs { mount_path } => put_string(&mut buf, mount_path),
        Request::MountBind { client_path, mount_path } => {
            put_string(&mut buf, client_path);
            put_string(&mut buf, mount_path);
        }
        Request::UnmountBind { mount_path } => put_string(&mut buf, mount_path),
        Request::TakeoverShutdown { mount_path } => put_string(&mut buf, mount_path),
        Request::TakeoverStartup { mount_path, bind_mounts } => {
            put_string(&mut buf, mount_path);
            put_string_list(&mut buf, bind_mounts);
        }
        Request::SetLogFile => {}
        Request::SetDaemonTimeout { duration_ns } => put_u64(&mut buf, *duration_ns),
        Request::SetUseDevMode { enabled } => put_bool(&mut buf, *enabled),
    }
    buf
}

pub fn decode_request_body(msg_type: MsgType, body: &[u8]) -> Result<Request> {
    let mut r = BodyReader::new(body);
    Ok(match msg_type {
        MsgType::MountFuse => Request::MountFuse {
            mount_path: r.string()?,
            read_only: r.bool()?,
        },
        MsgType::UnmountFuse => Request::UnmountFuse { mount_path: r.string()? },
        MsgType::MountNfs => Request::MountNfs {
            mount_path: r.string()?,
            mountd_addr: r.string()?,
            nfsd_addr: r.string()?,
            read_only: r.bool()?,
            iosize: r.u32()?,
            use_readdirplus: r.bool()?,
        },
        MsgType::UnmountNfs => Request::UnmountNfs { mount_path: r.string()? },
        MsgType::MountBind => Request::MountBind {
            client_path: r.string()?,
            mount_path: r.string()?,
        },
        MsgType::UnmountBind => Request::UnmountBind { mount_path: r.string()? },
        MsgType::TakeoverShutdown => Request::TakeoverShutdown { mount_path: r.string()? },
        MsgType::TakeoverStartup => Request::TakeoverStartup {
            mount_path: r.string()?,
            bind_mounts: r.string_list()?,
        },
        MsgType::SetLogFile => Request::SetLogFile,
        MsgType::SetDaemonTimeout => Request::SetDaemonTimeout { duration_ns: r.u64()? },
        MsgType::SetUseDevMode => Request::SetUseDevMode { enabled: r.bool()? },
        MsgType::RespError => return Err(CoreError::generic("RESP_ERROR is not a valid request type")),
    })
}

pub fn encode_response_body(response: &Response) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Response::Error {
        exception_type,
        message,
        errno,
    } = response
    {
        put_string(&mut buf, exception_type);
        put_string(&mut buf, message);
        put_bool(&mut buf, errno.is_some());
        if let Some(errno) = errno {
            put_u32(&mut buf, *errno as u32);
        }
    }
    buf
}

pub fn decode_response_body(msg_type: MsgType, body: &[u8]) -> Result<Response> {
    match msg_type {
        MsgType::RespError => {
            let mut r = BodyReader::new(body);
            let exception_type = r.string()?;
            let message = r.string()?;
            let has_errno = r.bool()?;
            let errno = if has_errno { Some(r.u32()? as i32) } else { None };
            Ok(Response::Error {
                exception_type,
                message,
                errno,
            })
        }
        _ => Ok(Response::Empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_request(request: Request) {
        let msg_type = request.msg_type();
        let body = encode_request_body(&request);
        let decoded = decode_request_body(msg_type, &body).unwrap();
        assert_eq!(format!("{decoded:?}"), format!("{request:?}"));
    }

    #[test]
    fn mount_fuse_round_trips() {
        round_trip_request(Request::MountFuse {
            mount_path: "/m".to_string(),
            read_only: false,
        });
    }

    #[test]
    fn mount_nfs_round_trips() {
        round_trip_request(Request::MountNfs {
            mount_path: "/m".to_string(),
            mountd_addr: "127.0.0.1:1".to_string(),
            nfsd_addr: "127.0.0.1:2".to_string(),
            read_only: true,
            iosize: 65536,
            use_readdirplus: true,
        });
    }

    #[test]
    fn takeover_startup_round_trips_with_bind_mount_list() {
        round_trip_request(Request::TakeoverStartup {
            mount_path: "/m".to_string(),
            bind_mounts: vec!["/m/a".to_string(), "/m/b".to_string()],
        });
    }

    #[test]
    fn set_log_file_has_no_body_but_expects_one_fd() {
        let req = Request::SetLogFile;
        assert_eq!(req.expected_fd_count(), 1);
        assert!(encode_request_body(&req).is_empty());
    }

    #[test]
    fn other_requests_expect_no_fds() {
        assert_eq!(Request::UnmountFuse { mount_path: "/m".into() }.expected_fd_count(), 0);
    }

    #[test]
    fn error_response_round_trips_with_errno() {
        let resp = Response::Error {
            exception_type: "SystemError".to_string(),
            message: "boom".to_string(),
            errno: Some(13),
        };
        let body = encode_response_body(&resp);
        let decoded = decode_response_body(MsgType::RespError, &body).unwrap();
        match decoded {
            Response::Error {
                exception_type,
                message,
                errno,
            } => {
                assert_eq!(exception_type, "SystemError");
                assert_eq!(message, "boom");
                assert_eq!(errno, Some(13));
            }
            Response::Empty => panic!("expected Error"),
        }
    }

    #[test]
    fn error_response_round_trips_without_errno() {
        let resp = Response::Error {
            exception_type: "Generic".to_string(),
            message: "oops".to_string(),
            errno: None,
        };
        let body = encode_response_body(&resp);
        let decoded = decode_response_body(MsgType::RespError, &body).unwrap();
        match decoded {
            Response::Error { errno, .. } => assert_eq!(errno, None),
            Response::Empty => panic!("expected Error"),
        }
    }

    #[test]
    fn empty_response_for_non_error_type_decodes_to_empty() {
        let decoded = decode_response_body(MsgType::MountFuse, &[]).unwrap();
        assert!(matches!(decoded, Response::Empty));
    }

    #[test]
    fn truncated_body_is_an_error_not_a_panic() {
        let err = decode_request_body(MsgType::MountFuse, &[1, 2]).unwrap_err();
        assert!(matches!(err, CoreError::Generic(_)));
    }

    #[test]
    fn msg_type_round_trips_through_u32() {
        for msg_type in [
            MsgType::RespError,
            MsgType::MountFuse,
            MsgType::MountBind,
            MsgType::UnmountFuse,
            MsgType::TakeoverShutdown,
            MsgType::TakeoverStartup,
            MsgType::SetLogFile,
            MsgType::UnmountBind,
            MsgType::SetDaemonTimeout,
            MsgType::SetUseDevMode,
            MsgType::MountNfs,
            MsgType::UnmountNfs,
        ] {
            assert_eq!(MsgType::from_u32(msg_type as u32).unwrap(), msg_type);
        }
        assert!(MsgType::from_u32(999).is_err());
    }
}

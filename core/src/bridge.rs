//! Host bridge.
//!
//! A thread-safe FIFO request/reply channel between the guest's resident
//! system process and external host clients. The guest side drains
//! requests and posts replies through [`HostBridge::get_request`] /
//! [`HostBridge::set_reply`] from the runtime thread; host clients call
//! [`HostBridge::enqueue_request`] / [`HostBridge::wait_for_reply`] from
//! their own threads. Request ids are assigned on enqueue and increase
//! monotonically; a single in-flight "current request" slot ties the next
//! `set_reply` call back to the request id it answers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::BridgeError;

/// Total size of the wire buffer exchanged with the guest.
pub const BUF_SIZE: usize = 256;
const FILENAME_OFS: usize = 4;
const EXT_OFS: usize = 12;
const OFFSET_OFS: usize = 15;
const LENGTH_OFS: usize = 19;
const DATA_OFS: usize = 21;
const MAX_DATA: usize = BUF_SIZE - DATA_OFS;

const REPLY_STATUS_OFS: usize = 0;
const REPLY_LENGTH_OFS: usize = 1;
const REPLY_DATA_OFS: usize = 3;
const REPLY_MORE_DATA_BIT: u8 = 0x80;
const REPLY_MAX_DATA: usize = BUF_SIZE - REPLY_DATA_OFS;

/// Request type, matching the function codes BDOS file operations map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    DirSearch = 0,
    FileRead = 1,
    FileWrite = 2,
    FileDelete = 3,
    FileCreate = 4,
    FileClose = 5,
    FileOpen = 6,
    /// Harness-only liveness probe; no BDOS call issues this.
    Test = 255,
}

impl RequestType {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => RequestType::DirSearch,
            1 => RequestType::FileRead,
            2 => RequestType::FileWrite,
            3 => RequestType::FileDelete,
            4 => RequestType::FileCreate,
            5 => RequestType::FileClose,
            6 => RequestType::FileOpen,
            255 => RequestType::Test,
            _ => return None,
        })
    }
}

/// Reply status code, independent of the `more_data` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok = 0,
    NotFound = 1,
    DiskFull = 2,
    ReadOnly = 3,
    Invalid = 4,
    Exists = 5,
}

impl ReplyStatus {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::NotFound,
            2 => ReplyStatus::DiskFull,
            3 => ReplyStatus::ReadOnly,
            5 => ReplyStatus::Exists,
            _ => ReplyStatus::Invalid,
        }
    }
}

/// A host-side request, queued for the guest to pick up.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u32,
    pub request_type: RequestType,
    pub drive: u8,
    pub user: u8,
    pub flags: u8,
    pub filename: String,
    pub offset: u32,
    pub length: u16,
    pub data: Vec<u8>,
}

impl Request {
    /// Serialize into the 256-byte wire buffer the guest reads.
    pub fn serialize(&self) -> [u8; BUF_SIZE] {
        let mut buf = [0u8; BUF_SIZE];
        buf[0] = self.request_type as u8;
        buf[1] = self.drive;
        buf[2] = self.user;
        buf[3] = self.flags;

        let (name8, ext3) = split_cpm_name(&self.filename);
        buf[FILENAME_OFS..FILENAME_OFS + 8].copy_from_slice(&name8);
        buf[EXT_OFS..EXT_OFS + 3].copy_from_slice(&ext3);

        buf[OFFSET_OFS..OFFSET_OFS + 4].copy_from_slice(&self.offset.to_le_bytes());
        buf[LENGTH_OFS..LENGTH_OFS + 2].copy_from_slice(&self.length.to_le_bytes());

        let n = self.data.len().min(MAX_DATA);
        buf[DATA_OFS..DATA_OFS + n].copy_from_slice(&self.data[..n]);
        buf
    }

    /// Parse a request back out of its wire buffer. Nothing in this crate's
    /// runtime path calls this - the guest reads the buffer directly as
    /// assembly, byte by byte - but it's the inverse of [`Self::serialize`]
    /// and backs the round-trip property in `spec.md` §8.
    pub fn deserialize(buf: &[u8]) -> Result<DecodedRequest, BridgeError> {
        if buf.len() < DATA_OFS {
            return Err(BridgeError::RequestTooShort(buf.len()));
        }
        let request_type = RequestType::from_byte(buf[0]);
        let drive = buf[1];
        let user = buf[2];
        let flags = buf[3];
        let name = trim_cpm_field(&buf[FILENAME_OFS..FILENAME_OFS + 8]);
        let ext = trim_cpm_field(&buf[EXT_OFS..EXT_OFS + 3]);
        let offset = u32::from_le_bytes(buf[OFFSET_OFS..OFFSET_OFS + 4].try_into().unwrap());
        let length = u16::from_le_bytes(buf[LENGTH_OFS..LENGTH_OFS + 2].try_into().unwrap());
        let data_len = (buf.len() - DATA_OFS).min(MAX_DATA);
        let data = buf[DATA_OFS..DATA_OFS + data_len].to_vec();

        Ok(DecodedRequest {
            request_type,
            drive,
            user,
            flags,
            name,
            ext,
            offset,
            length,
            data,
        })
    }
}

/// A request as recovered from the wire buffer by [`Request::deserialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub request_type: Option<RequestType>,
    pub drive: u8,
    pub user: u8,
    pub flags: u8,
    pub name: String,
    pub ext: String,
    pub offset: u32,
    pub length: u16,
    pub data: Vec<u8>,
}

/// Upper-case, space-trimmed text from a fixed-width CP/M name field.
fn trim_cpm_field(field: &[u8]) -> String {
    String::from_utf8_lossy(field).trim_end().to_string()
}

/// Split a `"NAME.EXT"` string into space-padded, upper-cased 8.3 fields.
fn split_cpm_name(name: &str) -> ([u8; 8], [u8; 3]) {
    let mut name8 = [b' '; 8];
    let mut ext3 = [b' '; 3];
    let (base, ext) = match name.find('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };
    for (dst, src) in name8.iter_mut().zip(base.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    for (dst, src) in ext3.iter_mut().zip(ext.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    (name8, ext3)
}

/// A guest-side reply, matched back to the request it answers.
#[derive(Debug, Clone)]
pub struct Reply {
    pub request_id: u32,
    pub status: ReplyStatus,
    pub more_data: bool,
    pub data: Vec<u8>,
}

impl Reply {
    /// Deserialize a reply from the guest's wire buffer. `request_id` is
    /// not part of the wire format; the bridge fills it in from the
    /// current in-flight request.
    pub fn deserialize(buf: &[u8]) -> Result<Self, BridgeError> {
        if buf.len() < REPLY_DATA_OFS {
            return Err(BridgeError::ReplyTooShort(buf.len()));
        }
        let status_byte = buf[REPLY_STATUS_OFS];
        let more_data = status_byte & REPLY_MORE_DATA_BIT != 0;
        let status = ReplyStatus::from_byte(status_byte & !REPLY_MORE_DATA_BIT);

        let length = u16::from_le_bytes([buf[REPLY_LENGTH_OFS], buf[REPLY_LENGTH_OFS + 1]]) as usize;
        let data_len = length.min(buf.len() - REPLY_DATA_OFS).min(REPLY_MAX_DATA);
        let data = buf[REPLY_DATA_OFS..REPLY_DATA_OFS + data_len].to_vec();

        Ok(Reply {
            request_id: 0,
            status,
            more_data,
            data,
        })
    }

    /// Serialize into the wire buffer a guest would write back.
    pub fn serialize(&self) -> [u8; BUF_SIZE] {
        let mut buf = [0u8; BUF_SIZE];
        let status = self.status as u8 | if self.more_data { REPLY_MORE_DATA_BIT } else { 0 };
        buf[REPLY_STATUS_OFS] = status;
        let len = (self.data.len().min(REPLY_MAX_DATA)) as u16;
        buf[REPLY_LENGTH_OFS..REPLY_LENGTH_OFS + 2].copy_from_slice(&len.to_le_bytes());
        buf[REPLY_DATA_OFS..REPLY_DATA_OFS + len as usize]
            .copy_from_slice(&self.data[..len as usize]);
        buf
    }
}

struct BridgeState {
    pending_requests: VecDeque<Request>,
    current_request: Option<Request>,
    pending_replies: VecDeque<Reply>,
    next_request_id: u32,
}

/// The shared request/reply channel. Cheap to clone-share via `Arc` since
/// its internals are already behind a mutex.
pub struct HostBridge {
    state: Mutex<BridgeState>,
    reply_cv: Condvar,
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBridge {
    pub fn new() -> Self {
        HostBridge {
            state: Mutex::new(BridgeState {
                pending_requests: VecDeque::new(),
                current_request: None,
                pending_replies: VecDeque::new(),
                next_request_id: 1,
            }),
            reply_cv: Condvar::new(),
        }
    }

    /// Host side: enqueue a request, assigning it the next request id.
    pub fn enqueue_request(&self, mut request: Request) -> u32 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_request_id;
        state.next_request_id += 1;
        request.id = id;
        state.pending_requests.push_back(request);
        id
    }

    /// Host side: block until a reply to `request_id` arrives or `timeout`
    /// elapses. Replies for other request ids seen while waiting are
    /// requeued, never dropped.
    pub fn wait_for_reply(&self, request_id: u32, timeout: Duration) -> Result<Reply, BridgeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(pos) = state
                .pending_replies
                .iter()
                .position(|r| r.request_id == request_id)
            {
                return Ok(state.pending_replies.remove(pos).unwrap());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout(request_id));
            }
            let (guard, result) = self
                .reply_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if result.timed_out() {
                // Fall through to re-check pending_replies once more before
                // giving up, in case a reply landed right at the deadline.
                if !state.pending_replies.iter().any(|r| r.request_id == request_id) {
                    return Err(BridgeError::Timeout(request_id));
                }
            }
        }
    }

    /// Guest side: is there a request waiting to be picked up?
    pub fn has_pending_request(&self) -> bool {
        !self.state.lock().unwrap().pending_requests.is_empty()
    }

    /// Guest side: pop the next request into the "current request" slot
    /// and serialize it into the wire buffer.
    pub fn get_request(&self) -> Option<[u8; BUF_SIZE]> {
        let mut state = self.state.lock().unwrap();
        let request = state.pending_requests.pop_front()?;
        let buf = request.serialize();
        state.current_request = Some(request);
        Some(buf)
    }

    /// Guest side: deserialize a reply from the wire buffer, attach it to
    /// the current in-flight request's id, and wake any waiting host
    /// thread.
    pub fn set_reply(&self, buf: &[u8]) -> Result<(), BridgeError> {
        let mut reply = Reply::deserialize(buf)?;
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.current_request.take() {
            reply.request_id = current.id;
        }
        state.pending_replies.push_back(reply);
        self.reply_cv.notify_all();
        Ok(())
    }

    /// Convenience round-trip used by integration tests and liveness
    /// probes: enqueue a `TEST` request and return the poll counter
    /// encoded in its reply payload.
    pub fn test_roundtrip(&self, timeout: Duration) -> Result<u16, BridgeError> {
        let id = self.enqueue_request(Request {
            id: 0,
            request_type: RequestType::Test,
            drive: 0,
            user: 0,
            flags: 0,
            filename: String::new(),
            offset: 0,
            length: 0,
            data: Vec::new(),
        });
        let reply = self.wait_for_reply(id, timeout)?;
        if reply.status != ReplyStatus::Ok || reply.data.len() < 2 {
            return Err(BridgeError::ReplyTooShort(reply.data.len()));
        }
        Ok(u16::from_le_bytes([reply.data[0], reply.data[1]]))
    }
}

pub fn parse_request_type(byte: u8) -> Option<RequestType> {
    RequestType::from_byte(byte)
}

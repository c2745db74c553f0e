//! Binary protocol between the sync client and the remote store
//!
//! Wire format (all integers are big-endian):
//!
//! Header, shared by requests and responses:
//! ```text
//! +-------+------+--------+------+-----------+---------+
//! | magic | op   | status | rsvd | client_id | datalen |
//! | 1     | 1    | 1      | 1    | 4         | 4       |
//! +-------+------+--------+------+-----------+---------+
//! ```
//!
//! `datalen` is the length of the fixed body that follows the header. Bodies:
//! - LOGIN (64): user:[u8; 32] zero-padded, passwd_hash:[u8; 32]
//! - SYNC_META (80): mode:4 uid:4 gid:4 size:8 atime:8 mtime:8 ctime:8 hash:32 pathlen:4,
//!   then a second send of `pathlen` path bytes
//! - SYNC_FILE (8): datalen:8, then exactly `datalen` content bytes
//! - RM (4): pathlen:4, then a second send of `pathlen` path bytes
//!
//! Responses are a bare header; `status` is OK, FAIL or MORE. A LOGIN
//! response carries the assigned client id.

use std::io::{ErrorKind, Read};
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::error::ProtocolError;
use crate::hash::{ContentHash, HASH_LEN};
use crate::paths::wire_bytes;
use crate::record::{EntryStat, FileRecord};
use crate::transport::Transport;

pub const HEADER_LEN: usize = 12;
pub const LOGIN_BODY_LEN: usize = USER_FIELD_LEN + HASH_LEN;
pub const META_BODY_LEN: usize = 4 * 3 + 8 * 4 + HASH_LEN + 4;
pub const FILE_BODY_LEN: usize = 8;
pub const RM_BODY_LEN: usize = 4;

/// Width of the zero-padded user field in LOGIN
pub const USER_FIELD_LEN: usize = 32;

/// Content is streamed in pieces of this size
pub const CHUNK_SIZE: usize = 4096;

/// Largest response trailer the client will drain to stay aligned
pub const MAX_RESPONSE_TRAILER: u32 = 64 * 1024;

/// Magic values telling requests from responses
pub mod magic {
    pub const REQUEST: u8 = 0x90;
    pub const RESPONSE: u8 = 0x91;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Login,
    SyncMeta,
    SyncFile,
    Remove,
}

impl Op {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Login => 0x00,
            Self::SyncMeta => 0x01,
            Self::SyncFile => 0x02,
            Self::Remove => 0x03,
        }
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Login),
            0x01 => Some(Self::SyncMeta),
            0x02 => Some(Self::SyncFile),
            0x03 => Some(Self::Remove),
            _ => None,
        }
    }
}

/// Outcome reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Nothing more to do
    Ok,
    /// Operation rejected
    Fail,
    /// Client must follow up with content
    More,
}

impl Status {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Fail => 0x01,
            Self::More => 0x02,
        }
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::Fail),
            0x02 => Some(Self::More),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub op: u8,
    pub status: u8,
    pub client_id: u32,
    pub datalen: u32,
}

impl Header {
    #[must_use]
    pub fn request(op: Op, client_id: u32, datalen: usize) -> Self {
        Self {
            magic: magic::REQUEST,
            op: op.as_byte(),
            status: 0,
            client_id,
            datalen: u32::try_from(datalen).unwrap_or(u32::MAX),
        }
    }

    #[must_use]
    pub fn response(op: Op, status: Status, client_id: u32) -> Self {
        Self {
            magic: magic::RESPONSE,
            op: op.as_byte(),
            status: status.as_byte(),
            client_id,
            datalen: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.magic;
        buf[1] = self.op;
        buf[2] = self.status;
        buf[4..8].copy_from_slice(&self.client_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.datalen.to_be_bytes());
        buf
    }

    /// Decode the first `HEADER_LEN` bytes of `buf`
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut fields = Fields::new(buf);
        let magic = fields.u8()?;
        let op = fields.u8()?;
        let status = fields.u8()?;
        fields.u8()?;
        Some(Self {
            magic,
            op,
            status,
            client_id: fields.u32()?,
            datalen: fields.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginBody {
    pub user: [u8; USER_FIELD_LEN],
    pub passwd_hash: ContentHash,
}

impl LoginBody {
    /// # Errors
    /// Returns `FieldTooLong` if `user` does not fit the fixed field
    pub fn new(user: &str, passwd_hash: ContentHash) -> Result<Self, ProtocolError> {
        let bytes = user.as_bytes();
        if bytes.len() > USER_FIELD_LEN {
            return Err(ProtocolError::FieldTooLong {
                field: "user",
                len: bytes.len(),
                max: USER_FIELD_LEN,
            });
        }
        let mut field = [0u8; USER_FIELD_LEN];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            user: field,
            passwd_hash,
        })
    }

    /// The user name without its zero padding
    #[must_use]
    pub fn user_name(&self) -> &[u8] {
        let end = self
            .user
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(USER_FIELD_LEN);
        &self.user[..end]
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LOGIN_BODY_LEN);
        buf.extend_from_slice(&self.user);
        buf.extend_from_slice(self.passwd_hash.as_bytes());
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut fields = Fields::new(buf);
        Some(Self {
            user: fields.array()?,
            passwd_hash: ContentHash::from_raw(fields.array()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaBody {
    pub stat: EntryStat,
    pub hash: ContentHash,
    pub pathlen: u32,
}

impl MetaBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let stat = &self.stat;
        let mut buf = Vec::with_capacity(META_BODY_LEN);
        buf.extend_from_slice(&stat.mode.to_be_bytes());
        buf.extend_from_slice(&stat.uid.to_be_bytes());
        buf.extend_from_slice(&stat.gid.to_be_bytes());
        buf.extend_from_slice(&stat.size.to_be_bytes());
        buf.extend_from_slice(&stat.atime.to_be_bytes());
        buf.extend_from_slice(&stat.mtime.to_be_bytes());
        buf.extend_from_slice(&stat.ctime.to_be_bytes());
        buf.extend_from_slice(self.hash.as_bytes());
        buf.extend_from_slice(&self.pathlen.to_be_bytes());
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut fields = Fields::new(buf);
        let stat = EntryStat {
            mode: fields.u32()?,
            uid: fields.u32()?,
            gid: fields.u32()?,
            size: fields.u64()?,
            atime: fields.i64()?,
            mtime: fields.i64()?,
            ctime: fields.i64()?,
        };
        Some(Self {
            stat,
            hash: ContentHash::from_raw(fields.array()?),
            pathlen: fields.u32()?,
        })
    }

    /// Whether the stat fields describe a directory
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.stat.mode & 0o170_000 == 0o040_000
    }
}

/// Reads big-endian fields off a byte slice without running past its end
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        bytes.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|[b]| b)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_be_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_be_bytes)
    }
}

/// Header followed by a fixed body, sent as one part
fn frame(op: Op, client_id: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&Header::request(op, client_id, body.len()).encode());
    buf.extend_from_slice(body);
    buf
}

fn path_len(relative: &Path) -> Result<u32, ProtocolError> {
    let len = wire_bytes(relative).len();
    u32::try_from(len).map_err(|_| ProtocolError::FieldTooLong {
        field: "path",
        len,
        max: u32::MAX as usize,
    })
}

/// Read into `buf` until it is full or the reader is exhausted
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A logged-in session with the remote store
///
/// Every operation is one blocking request/response exchange. After a
/// transport or framing failure the session is closed and every later call
/// returns `SessionClosed`.
#[derive(Debug)]
pub struct ProtocolClient<T> {
    transport: T,
    client_id: u32,
    closed: bool,
}

impl<T: Transport> ProtocolClient<T> {
    /// Log in over an established transport
    ///
    /// # Errors
    /// Returns `AuthFailure` if the server does not answer OK, or any
    /// transport/framing error
    pub fn login(transport: T, user: &str, passwd_hash: &ContentHash) -> Result<Self, ProtocolError> {
        let body = LoginBody::new(user, *passwd_hash)?;
        let mut client = Self {
            transport,
            client_id: 0,
            closed: false,
        };

        let header = client.guarded(|c| {
            c.transport.send(&frame(Op::Login, 0, &body.encode()))?;
            c.read_response(Op::Login)
        })?;

        if Status::from_byte(header.status) != Some(Status::Ok) {
            warn!("login as {user} rejected (status {:#04x})", header.status);
            return Err(ProtocolError::AuthFailure);
        }

        client.client_id = header.client_id;
        info!("logged in as {user}, client id {}", client.client_id);
        Ok(client)
    }

    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send the entry's metadata, then its relative path
    ///
    /// # Errors
    /// Returns an error on transport or framing failure
    pub fn sync_meta(&mut self, record: &FileRecord) -> Result<Status, ProtocolError> {
        let pathlen = path_len(&record.path)?;
        let body = MetaBody {
            stat: record.stat,
            hash: record.hash,
            pathlen,
        };

        self.guarded(|c| {
            c.transport
                .send(&frame(Op::SyncMeta, c.client_id, &body.encode()))?;
            c.transport.send(wire_bytes(&record.path))?;
            debug!("meta sent for {} ({})", record.path.display(), record.hash);
            c.read_status(Op::SyncMeta)
        })
    }

    /// Stream exactly `declared_len` bytes of content
    ///
    /// If `content` runs dry or fails early the rest is zero-filled so the
    /// server still reads the declared length.
    ///
    /// # Errors
    /// Returns an error on transport or framing failure
    pub fn sync_data<R: Read>(
        &mut self,
        mut content: R,
        declared_len: u64,
    ) -> Result<Status, ProtocolError> {
        let body = declared_len.to_be_bytes();

        self.guarded(|c| {
            c.transport.send(&frame(Op::SyncFile, c.client_id, &body))?;

            let mut buf = [0u8; CHUNK_SIZE];
            let mut remaining = declared_len;
            let mut exhausted = false;
            while remaining > 0 {
                let want = usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE));
                let filled = if exhausted {
                    0
                } else {
                    fill(&mut content, &mut buf[..want]).unwrap_or_else(|e| {
                        warn!("content read failed mid-stream: {e}");
                        0
                    })
                };
                if filled < want {
                    if !exhausted {
                        warn!(
                            "content ended {} bytes short of declared {declared_len}, padding",
                            remaining - filled as u64
                        );
                    }
                    exhausted = true;
                    buf[filled..want].fill(0);
                }
                c.transport.send(&buf[..want])?;
                remaining -= want as u64;
            }
            debug!("data sent, {declared_len} bytes");
            c.read_status(Op::SyncFile)
        })
    }

    /// Ask the server to remove a path
    ///
    /// # Errors
    /// Returns an error on transport or framing failure
    pub fn remove(&mut self, relative: &Path) -> Result<Status, ProtocolError> {
        let pathlen = path_len(relative)?;

        self.guarded(|c| {
            c.transport
                .send(&frame(Op::Remove, c.client_id, &pathlen.to_be_bytes()))?;
            c.transport.send(wire_bytes(relative))?;
            debug!("rm sent for {}", relative.display());
            c.read_status(Op::Remove)
        })
    }

    /// Run one exchange, closing the session if it fails
    fn guarded<R>(
        &mut self,
        exchange: impl FnOnce(&mut Self) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::SessionClosed);
        }
        let result = exchange(self);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("closing session: {e}");
                self.closed = true;
            }
        }
        result
    }

    fn read_status(&mut self, op: Op) -> Result<Status, ProtocolError> {
        let header = self.read_response(op)?;
        Status::from_byte(header.status).ok_or(ProtocolError::UnknownStatus(header.status))
    }

    /// Read and validate one response header, draining any trailer
    fn read_response(&mut self, expected: Op) -> Result<Header, ProtocolError> {
        let buf = self.transport.recv(HEADER_LEN)?;
        let header = Header::decode(&buf).ok_or_else(|| {
            ProtocolError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "short response header",
            ))
        })?;

        if header.magic != magic::RESPONSE {
            return Err(ProtocolError::BadMagic(header.magic));
        }
        if header.op != expected.as_byte() {
            return Err(ProtocolError::OpMismatch {
                expected,
                actual: header.op,
            });
        }
        if header.datalen > MAX_RESPONSE_TRAILER {
            return Err(ProtocolError::OversizedResponse(header.datalen));
        }
        if header.datalen > 0 {
            debug!("draining {} trailing response bytes", header.datalen);
            self.transport.recv(header.datalen as usize)?;
        }
        Ok(header)
    }
}

//! Bounds-checked decoding of raw inotify records
//!
//! Record layout (native endianness, as the kernel writes it):
//! ```text
//! +------+------+--------+-----+-----------------------+
//! | wd   | mask | cookie | len | name (len bytes, NUL  |
//! | i32  | u32  | u32    | u32 | padded)               |
//! +------+------+--------+-----+-----------------------+
//! ```

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt as _;
use std::path::PathBuf;

use crate::error::DecodeError;
use crate::registry::WatchId;
use crate::watch::{ChangeEvent, ChangeKind};

pub const RECORD_HEADER_LEN: usize = 16;

/// inotify mask bits
pub mod mask {
    pub const IN_MODIFY: u32 = 0x0000_0002;
    pub const IN_ATTRIB: u32 = 0x0000_0004;
    pub const IN_CREATE: u32 = 0x0000_0100;
    pub const IN_DELETE: u32 = 0x0000_0200;
    pub const IN_Q_OVERFLOW: u32 = 0x0000_4000;
    pub const IN_IGNORED: u32 = 0x0000_8000;
    pub const IN_ISDIR: u32 = 0x4000_0000;
}

/// A record exactly as the kernel reported it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    pub name: OsString,
}

impl RawRecord {
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        self.mask & mask::IN_Q_OVERFLOW != 0
    }

    /// Classify the record; `None` for records the engine does not act on
    ///
    /// A record with several bits set is classified in the order create,
    /// attrib, delete, modify.
    #[must_use]
    pub fn to_event(&self) -> Option<ChangeEvent> {
        let kind = if self.mask & mask::IN_CREATE != 0 {
            ChangeKind::Create
        } else if self.mask & mask::IN_ATTRIB != 0 {
            ChangeKind::Attrib
        } else if self.mask & mask::IN_DELETE != 0 {
            ChangeKind::Delete
        } else if self.mask & mask::IN_MODIFY != 0 {
            ChangeKind::Modify
        } else {
            return None;
        };

        Some(ChangeEvent {
            watch_id: WatchId(self.wd),
            kind,
            name: PathBuf::from(&self.name),
            is_dir: self.mask & mask::IN_ISDIR != 0,
        })
    }
}

/// Split one read() worth of bytes into records
///
/// # Errors
/// Returns `DecodeError::Truncated` if a header or name runs past the buffer
pub fn decode_records(buf: &[u8]) -> Result<Vec<RawRecord>, DecodeError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let available = buf.len() - offset;
        let header = buf
            .get(offset..offset + RECORD_HEADER_LEN)
            .ok_or(DecodeError::Truncated {
                offset,
                needed: RECORD_HEADER_LEN,
                available,
            })?;
        let word = |i: usize| [header[i], header[i + 1], header[i + 2], header[i + 3]];
        let wd = i32::from_ne_bytes(word(0));
        let mask = u32::from_ne_bytes(word(4));
        let cookie = u32::from_ne_bytes(word(8));
        let name_len = u32::from_ne_bytes(word(12)) as usize;

        let needed = RECORD_HEADER_LEN.saturating_add(name_len);
        let name_bytes = offset
            .checked_add(needed)
            .and_then(|end| buf.get(offset + RECORD_HEADER_LEN..end))
            .ok_or(DecodeError::Truncated {
                offset,
                needed,
                available,
            })?;
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());

        records.push(RawRecord {
            wd,
            mask,
            cookie,
            name: OsStr::from_bytes(&name_bytes[..end]).to_os_string(),
        });
        offset += needed;
    }

    Ok(records)
}

#[cfg(test)]
pub(crate) fn encode_record(wd: i32, mask: u32, name: &str) -> Vec<u8> {
    let padded = if name.is_empty() {
        0
    } else {
        (name.len() + 1).next_multiple_of(16)
    };
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + padded);
    buf.extend_from_slice(&wd.to_ne_bytes());
    buf.extend_from_slice(&mask.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&u32::try_from(padded).unwrap_or(0).to_ne_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.resize(RECORD_HEADER_LEN + padded, 0);
    buf
}

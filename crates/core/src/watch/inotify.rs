//! inotify-backed event source

use std::ffi::CString;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::WatchError;
use crate::registry::WatchId;
use crate::watch::decode::{RECORD_HEADER_LEN, decode_records, mask};
use crate::watch::{ChangeEvent, EventSource};

/// Events every watched directory subscribes to
pub const WATCH_MASK: u32 = mask::IN_CREATE | mask::IN_DELETE | mask::IN_ATTRIB | mask::IN_MODIFY;

/// How long one `read_events` call blocks before returning an empty batch
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

const BUF_LEN: usize = 1024 * (RECORD_HEADER_LEN + 16);

/// One inotify instance; the descriptor closes on drop
#[derive(Debug)]
pub struct InotifySource {
    fd: File,
    buf: Vec<u8>,
    poll_interval: Duration,
}

impl InotifySource {
    /// # Errors
    /// Returns an error if the inotify instance cannot be created
    pub fn new() -> io::Result<Self> {
        // SAFETY: no pointer arguments
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a fresh descriptor that nothing else owns
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        debug!("inotify instance opened (fd {raw})");

        Ok(Self {
            fd: File::from(owned),
            buf: vec![0u8; BUF_LEN],
            poll_interval: POLL_INTERVAL,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait up to the poll interval for the descriptor to become readable
    fn wait_readable(&self) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = i32::try_from(self.poll_interval.as_millis()).unwrap_or(i32::MAX);

        // SAFETY: `pollfd` is valid for the duration of the call and nfds is 1
        let rc = unsafe { libc::poll(&raw mut pollfd, 1, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0)
    }
}

impl EventSource for InotifySource {
    fn add_watch(&mut self, path: &Path) -> io::Result<WatchId> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        // SAFETY: `c_path` is a valid NUL-terminated string for the call
        let wd = unsafe { libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), WATCH_MASK) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        trace!("watch {wd} on {}", path.display());
        Ok(WatchId(wd))
    }

    fn remove_watch(&mut self, id: WatchId) -> io::Result<()> {
        // SAFETY: plain integer arguments
        let rc = unsafe { libc::inotify_rm_watch(self.fd.as_raw_fd(), id.0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        trace!("watch {id} removed");
        Ok(())
    }

    fn read_events(&mut self) -> Result<Vec<ChangeEvent>, WatchError> {
        if !self.wait_readable()? {
            return Ok(Vec::new());
        }

        let len = match self.fd.read(&mut self.buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let records = decode_records(&self.buf[..len])?;
        let mut events = Vec::with_capacity(records.len());
        for record in &records {
            if record.is_overflow() {
                warn!("inotify queue overflowed, some changes were lost");
                continue;
            }
            match record.to_event() {
                Some(event) => events.push(event),
                None => trace!("skipping record {:#x} on watch {}", record.mask, record.wd),
            }
        }
        Ok(events)
    }
}

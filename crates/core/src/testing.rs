//! In-process fakes shared by the unit tests

use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::dispatch::ShutdownSignal;
use crate::error::{DecodeError, WatchError};
use crate::protocol::{FILE_BODY_LEN, HEADER_LEN, Header, MetaBody, Op, RM_BODY_LEN, Status};
use crate::registry::WatchId;
use crate::transport::Transport;
use crate::watch::{ChangeEvent, EventSource};

/// One request reassembled from the parts the client sent
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub header: Header,
    pub body: Vec<u8>,
    pub payload: Vec<u8>,
    /// Number of `send` calls the request took, header part included
    pub parts: usize,
}

/// Records every send and serves queued response bytes
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub sends: Vec<Vec<u8>>,
    responses: VecDeque<u8>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&mut self, op: Op, status: Status) {
        self.reply_raw(&Header::response(op, status, 0).encode());
    }

    pub fn reply_login(&mut self, status: Status, client_id: u32) {
        self.reply_raw(&Header::response(Op::Login, status, client_id).encode());
    }

    pub fn reply_raw(&mut self, bytes: &[u8]) {
        self.responses.extend(bytes);
    }

    /// Regroup the raw sends into requests using the declared lengths
    pub fn requests(&self) -> Vec<SentRequest> {
        let mut requests = Vec::new();
        let mut sends = self.sends.iter();

        while let Some(first) = sends.next() {
            let header = Header::decode(first).expect("request header");
            let body = first[HEADER_LEN..].to_vec();
            let payload_len = match Op::from_byte(header.op).expect("request op") {
                Op::Login => 0,
                Op::SyncMeta => MetaBody::decode(&body).expect("meta body").pathlen as usize,
                Op::SyncFile => {
                    let len: [u8; FILE_BODY_LEN] = body[..FILE_BODY_LEN].try_into().unwrap();
                    usize::try_from(u64::from_be_bytes(len)).unwrap()
                }
                Op::Remove => {
                    let len: [u8; RM_BODY_LEN] = body[..RM_BODY_LEN].try_into().unwrap();
                    u32::from_be_bytes(len) as usize
                }
            };

            let mut payload = Vec::with_capacity(payload_len);
            let mut parts = 1;
            while payload.len() < payload_len {
                payload.extend_from_slice(sends.next().expect("payload part"));
                parts += 1;
            }
            requests.push(SentRequest {
                header,
                body,
                payload,
                parts,
            });
        }
        requests
    }

    /// Paths of every SYNC_META request, in order
    pub fn meta_paths(&self) -> Vec<PathBuf> {
        self.requests()
            .into_iter()
            .filter(|r| r.header.op == Op::SyncMeta.as_byte())
            .map(|r| PathBuf::from(String::from_utf8(r.payload).unwrap()))
            .collect()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.requests()
            .iter()
            .filter_map(|r| Op::from_byte(r.header.op))
            .collect()
    }
}

impl Transport for FakeTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.sends.push(data.to_vec());
        Ok(())
    }

    fn recv(&mut self, len: usize) -> io::Result<Vec<u8>> {
        if self.responses.len() < len {
            self.responses.clear();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "no queued response",
            ));
        }
        Ok(self.responses.drain(..len).collect())
    }
}

/// Scripted event source
///
/// Hands out increasing watch ids and serves queued batches. Once the script
/// is exhausted it triggers `shutdown` and returns empty batches.
#[derive(Debug, Default)]
pub struct FakeSource {
    pub watched: Vec<(WatchId, PathBuf)>,
    pub removed: Vec<WatchId>,
    pub failing: HashSet<PathBuf>,
    batches: VecDeque<Result<Vec<ChangeEvent>, WatchError>>,
    next_id: i32,
    shutdown: Option<ShutdownSignal>,
    stop_after: Option<usize>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Trigger the shutdown signal once `watches` directories are watched
    pub fn shutdown_after_watches(mut self, watches: usize) -> Self {
        self.stop_after = Some(watches);
        self
    }

    pub fn fail_watch(&mut self, path: impl Into<PathBuf>) {
        self.failing.insert(path.into());
    }

    pub fn push_batch(&mut self, events: Vec<ChangeEvent>) {
        self.batches.push_back(Ok(events));
    }

    pub fn push_malformed(&mut self, error: DecodeError) {
        self.batches.push_back(Err(WatchError::Malformed(error)));
    }

    pub fn push_io_error(&mut self) {
        self.batches
            .push_back(Err(WatchError::Io(io::Error::other("inotify gone"))));
    }

    pub fn watched_paths(&self) -> Vec<&Path> {
        self.watched.iter().map(|(_, p)| p.as_path()).collect()
    }
}

impl EventSource for FakeSource {
    fn add_watch(&mut self, path: &Path) -> io::Result<WatchId> {
        if self.failing.contains(path) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        let id = WatchId(self.next_id);
        self.next_id += 1;
        self.watched.push((id, path.to_path_buf()));
        if self.stop_after == Some(self.watched.len()) {
            if let Some(shutdown) = &self.shutdown {
                shutdown.trigger();
            }
        }
        Ok(id)
    }

    fn remove_watch(&mut self, id: WatchId) -> io::Result<()> {
        if self.removed.contains(&id) || !self.watched.iter().any(|(w, _)| *w == id) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        self.removed.push(id);
        Ok(())
    }

    fn read_events(&mut self) -> Result<Vec<ChangeEvent>, WatchError> {
        match self.batches.pop_front() {
            Some(batch) => batch,
            None => {
                if let Some(shutdown) = &self.shutdown {
                    shutdown.trigger();
                }
                Ok(Vec::new())
            }
        }
    }
}

/// Create a named pipe at `path`
#[cfg(target_os = "linux")]
pub fn mkfifo(path: &Path) {
    use std::os::unix::ffi::OsStrExt as _;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
    // SAFETY: `c_path` is a valid NUL-terminated string for the call
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    assert_eq!(rc, 0, "mkfifo {}: {}", path.display(), io::Error::last_os_error());
}

/// Run `f` on its own thread and fail if it has not returned within `timeout`
pub fn returns_within<R, F>(timeout: Duration, f: F) -> R
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(timeout) {
        Ok(value) => value,
        Err(RecvTimeoutError::Timeout) => panic!("still blocked after {timeout:?}"),
        Err(RecvTimeoutError::Disconnected) => panic!("worker thread panicked"),
    }
}

//! Local in-process store for testing
//!
//! `LocalStore` plays the server side of the wire protocol directly in
//! memory: it implements `Transport`, parses the requests the client sends
//! and queues the replies the client reads back. Optionally it mirrors the
//! synced tree into a local directory.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use treesync_core::protocol::{
    FILE_BODY_LEN, HEADER_LEN, Header, LOGIN_BODY_LEN, LoginBody, META_BODY_LEN, MetaBody,
    RM_BODY_LEN, magic,
};
use treesync_core::{ContentHash, EntryStat, Op, Status, Transport};

/// What the store holds for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub stat: EntryStat,
    pub hash: ContentHash,
    pub is_dir: bool,
    /// Received bytes; `None` until content arrives
    pub content: Option<Vec<u8>>,
}

/// One request the store answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub op: Op,
    pub path: Option<PathBuf>,
    pub status: Status,
}

/// In-memory emulation of the remote store
#[derive(Debug, Default)]
pub struct LocalStore {
    accounts: HashMap<String, ContentHash>,
    next_client_id: u32,
    session: Option<u32>,
    entries: BTreeMap<PathBuf, StoredEntry>,
    /// Metadata waiting for the content it asked for
    pending: Option<(PathBuf, MetaBody)>,
    mirror: Option<PathBuf>,
    failing: HashSet<PathBuf>,
    log: Vec<StoreRequest>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
}

impl LocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_client_id: 1,
            ..Self::default()
        }
    }

    /// Accept logins from `user` with this password
    #[must_use]
    pub fn with_account(mut self, user: &str, passwd: &str) -> Self {
        self.accounts
            .insert(user.to_owned(), ContentHash::from_bytes(passwd.as_bytes()));
        self
    }

    /// Also write everything received under `dir`
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created
    pub fn with_mirror(mut self, dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        self.mirror = Some(dir);
        Ok(self)
    }

    /// Reject metadata and removal requests for this path
    pub fn fail_on(&mut self, path: impl Into<PathBuf>) {
        self.failing.insert(path.into());
    }

    pub fn entries(&self) -> &BTreeMap<PathBuf, StoredEntry> {
        &self.entries
    }

    pub fn entry(&self, path: impl AsRef<Path>) -> Option<&StoredEntry> {
        self.entries.get(path.as_ref())
    }

    pub fn log(&self) -> &[StoreRequest] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Handle every complete request sitting in the inbox
    fn process(&mut self) {
        while let Some((header, body, payload)) = self.take_request() {
            let Some(op) = Op::from_byte(header.op) else {
                warn!("store: unknown op {:#04x}", header.op);
                self.inbox.clear();
                return;
            };

            let (path, status, client_id) = match op {
                Op::Login => self.login(&body),
                Op::SyncMeta => {
                    let path = path_from(&payload);
                    let status = self.authorized(&header, |s| s.sync_meta(&path, &body));
                    (Some(path), status, header.client_id)
                }
                Op::SyncFile => {
                    let status = self.authorized(&header, |s| s.sync_file(payload));
                    (None, status, header.client_id)
                }
                Op::Remove => {
                    let path = path_from(&payload);
                    let status = self.authorized(&header, |s| s.remove(&path));
                    (Some(path), status, header.client_id)
                }
            };

            debug!("store: {op:?} {path:?} -> {status:?}");
            self.outbox
                .extend(Header::response(op, status, client_id).encode());
            self.log.push(StoreRequest { op, path, status });
        }
    }

    /// Split one full request off the front of the inbox
    fn take_request(&mut self) -> Option<(Header, Vec<u8>, Vec<u8>)> {
        let header = Header::decode(&self.inbox)?;
        if header.magic != magic::REQUEST {
            warn!("store: bad request magic {:#04x}", header.magic);
            self.inbox.clear();
            return None;
        }

        let body_end = HEADER_LEN + header.datalen as usize;
        let body = self.inbox.get(HEADER_LEN..body_end)?;
        let payload_len = match Op::from_byte(header.op) {
            Some(Op::SyncMeta) if body.len() == META_BODY_LEN => MetaBody::decode(body)?.pathlen as usize,
            Some(Op::SyncFile) if body.len() == FILE_BODY_LEN => {
                usize::try_from(u64::from_be_bytes(body.try_into().ok()?)).ok()?
            }
            Some(Op::Remove) if body.len() == RM_BODY_LEN => {
                u32::from_be_bytes(body.try_into().ok()?) as usize
            }
            _ => 0,
        };

        let end = body_end.checked_add(payload_len)?;
        if self.inbox.len() < end {
            return None;
        }
        let body = body.to_vec();
        let payload = self.inbox[body_end..end].to_vec();
        self.inbox.drain(..end);
        Some((header, body, payload))
    }

    fn login(&mut self, body: &[u8]) -> (Option<PathBuf>, Status, u32) {
        let accepted = (body.len() == LOGIN_BODY_LEN)
            .then(|| LoginBody::decode(body))
            .flatten()
            .filter(|login| {
                let user = String::from_utf8_lossy(login.user_name());
                self.accounts.get(&*user) == Some(&login.passwd_hash)
            });

        match accepted {
            Some(_) => {
                let id = self.next_client_id;
                self.next_client_id += 1;
                self.session = Some(id);
                (None, Status::Ok, id)
            }
            None => (None, Status::Fail, 0),
        }
    }

    fn authorized(&mut self, header: &Header, handle: impl FnOnce(&mut Self) -> Status) -> Status {
        if self.session == Some(header.client_id) {
            handle(self)
        } else {
            warn!("store: request from unknown client {}", header.client_id);
            Status::Fail
        }
    }

    fn sync_meta(&mut self, path: &Path, body: &[u8]) -> Status {
        self.pending = None;
        let Some(meta) = MetaBody::decode(body) else {
            return Status::Fail;
        };
        if self.failing.contains(path) {
            return Status::Fail;
        }

        if meta.is_dir() {
            self.mirror_dir(path);
            self.entries.insert(
                path.to_path_buf(),
                StoredEntry {
                    stat: meta.stat,
                    hash: meta.hash,
                    is_dir: true,
                    content: None,
                },
            );
            return Status::Ok;
        }

        if let Some(existing) = self.entries.get_mut(path) {
            if !existing.is_dir && existing.hash == meta.hash && existing.content.is_some() {
                existing.stat = meta.stat;
                return Status::Ok;
            }
        }
        self.pending = Some((path.to_path_buf(), meta));
        Status::More
    }

    fn sync_file(&mut self, content: Vec<u8>) -> Status {
        let Some((path, meta)) = self.pending.take() else {
            warn!("store: content without a pending request");
            return Status::Fail;
        };
        if !meta.hash.is_zero() && ContentHash::from_bytes(&content) != meta.hash {
            warn!("store: content for {} does not match its hash", path.display());
            return Status::Fail;
        }

        self.mirror_file(&path, &meta, &content);
        self.entries.insert(
            path,
            StoredEntry {
                stat: meta.stat,
                hash: meta.hash,
                is_dir: false,
                content: Some(content),
            },
        );
        Status::Ok
    }

    fn remove(&mut self, path: &Path) -> Status {
        self.pending = None;
        if self.failing.contains(path) || !self.entries.contains_key(path) {
            return Status::Fail;
        }
        self.entries.retain(|p, _| !p.starts_with(path));

        if let Some(mirror) = &self.mirror {
            let target = mirror.join(path);
            let removed = match std::fs::symlink_metadata(&target) {
                Ok(m) if m.is_dir() => std::fs::remove_dir_all(&target),
                Ok(_) => std::fs::remove_file(&target),
                Err(e) => Err(e),
            };
            if let Err(e) = removed {
                warn!("store: cannot remove mirrored {}: {e}", path.display());
            }
        }
        Status::Ok
    }

    fn mirror_dir(&self, path: &Path) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = std::fs::create_dir_all(mirror.join(path)) {
                warn!("store: cannot mirror {}: {e}", path.display());
            }
        }
    }

    fn mirror_file(&self, path: &Path, meta: &MetaBody, content: &[u8]) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        let target = mirror.join(path);
        let written = if meta.stat.mode & 0o170_000 == 0o120_000 {
            // Replace an older link; anything else in the way is reported below
            match std::fs::remove_file(&target) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => std::os::unix::fs::symlink(path_from(content), &target),
            }
        } else {
            std::fs::write(&target, content)
        };

        // Set mode on Unix
        let written = written.and_then(|()| {
            use std::os::unix::fs::PermissionsExt as _;
            if meta.stat.mode & 0o170_000 == 0o120_000 {
                return Ok(());
            }
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(meta.stat.mode & 0o7777))
        });
        if let Err(e) = written {
            warn!("store: cannot mirror {}: {e}", path.display());
        }
    }
}

fn path_from(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt as _;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

impl Transport for LocalStore {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.inbox.extend_from_slice(data);
        self.process();
        Ok(())
    }

    fn recv(&mut self, len: usize) -> io::Result<Vec<u8>> {
        if self.outbox.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "store has no reply queued",
            ));
        }
        Ok(self.outbox.drain(..len).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use treesync_core::{FileRecord, ProtocolClient, ProtocolError};

    fn record(path: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            stat: EntryStat {
                mode: 0o100_644,
                size: content.len() as u64,
                ..EntryStat::default()
            },
            hash: ContentHash::from_bytes(content),
            is_dir: false,
            link_target: None,
        }
    }

    #[test]
    fn test_login_checks_password() {
        let mut store = LocalStore::new().with_account("alice", "secret");

        let err = ProtocolClient::login(&mut store, "alice", &ContentHash::from_bytes(b"wrong"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::AuthFailure));

        let client =
            ProtocolClient::login(&mut store, "alice", &ContentHash::from_bytes(b"secret")).unwrap();
        assert_eq!(client.client_id(), 1);
    }

    #[test]
    fn test_write_then_unchanged_then_delete() {
        let mirror = TempDir::new().unwrap();
        let mut store = LocalStore::new()
            .with_account("alice", "secret")
            .with_mirror(mirror.path())
            .unwrap();

        {
            let mut client =
                ProtocolClient::login(&mut store, "alice", &ContentHash::from_bytes(b"secret"))
                    .unwrap();
            let new = record("new.txt", b"content");
            assert_eq!(client.sync_meta(&new).unwrap(), Status::More);
            assert_eq!(client.sync_data(&b"content"[..], 7).unwrap(), Status::Ok);
            assert_eq!(client.sync_meta(&new).unwrap(), Status::Ok);
        }
        assert_eq!(
            std::fs::read_to_string(mirror.path().join("new.txt")).unwrap(),
            "content"
        );
        assert_eq!(
            store.entry("new.txt").unwrap().content.as_deref(),
            Some(&b"content"[..])
        );

        {
            let mut client = ProtocolClient::login(&mut store, "alice", &ContentHash::from_bytes(b"secret"))
                .unwrap();
            assert_eq!(client.remove(Path::new("new.txt")).unwrap(), Status::Ok);
            assert_eq!(client.remove(Path::new("new.txt")).unwrap(), Status::Fail);
        }
        assert!(!mirror.path().join("new.txt").exists());
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_hash_mismatch_rejected() {
        let mut store = LocalStore::new().with_account("alice", "secret");
        let mut client =
            ProtocolClient::login(&mut store, "alice", &ContentHash::from_bytes(b"secret")).unwrap();

        assert_eq!(client.sync_meta(&record("a", b"one")).unwrap(), Status::More);
        assert_eq!(client.sync_data(&b"two"[..], 3).unwrap(), Status::Fail);
        drop(client);

        assert!(store.entry("a").is_none());
    }

    #[test]
    fn test_requests_before_login_fail() {
        let mut store = LocalStore::new();
        let mut frame = Header::request(Op::Remove, 9, RM_BODY_LEN).encode().to_vec();
        frame.extend_from_slice(&1u32.to_be_bytes());
        store.send(&frame).unwrap();
        store.send(b"x").unwrap();

        let reply = Header::decode(&store.recv(HEADER_LEN).unwrap()).unwrap();
        assert_eq!(reply.status, Status::Fail.as_byte());
        assert_eq!(store.log()[0].path, Some(PathBuf::from("x")));
    }

    #[test]
    fn test_requests_split_across_sends() {
        let mut store = LocalStore::new().with_account("alice", "pw");
        let login = LoginBody::new("alice", ContentHash::from_bytes(b"pw")).unwrap();
        let mut frame = Header::request(Op::Login, 0, LOGIN_BODY_LEN).encode().to_vec();
        frame.extend(login.encode());

        let (head, tail) = frame.split_at(5);
        store.send(head).unwrap();
        assert!(store.recv(HEADER_LEN).is_err());
        store.send(tail).unwrap();

        let reply = Header::decode(&store.recv(HEADER_LEN).unwrap()).unwrap();
        assert_eq!(reply.status, Status::Ok.as_byte());
        assert_eq!(reply.client_id, 1);
    }

    fn link(path: &str, target: &str) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            stat: EntryStat {
                mode: 0o120_777,
                size: target.len() as u64,
                ..EntryStat::default()
            },
            hash: ContentHash::from_bytes(target.as_bytes()),
            is_dir: false,
            link_target: Some(PathBuf::from(target)),
        }
    }

    #[test]
    fn test_mirror_replaces_symlink() {
        let mirror = TempDir::new().unwrap();
        std::fs::create_dir(mirror.path().join("blocked")).unwrap();
        std::fs::write(mirror.path().join("blocked/keep"), "x").unwrap();
        let mut store = LocalStore::new()
            .with_account("alice", "secret")
            .with_mirror(mirror.path())
            .unwrap();
        let mut client =
            ProtocolClient::login(&mut store, "alice", &ContentHash::from_bytes(b"secret")).unwrap();

        for target in ["a.txt", "b.txt"] {
            assert_eq!(client.sync_meta(&link("ln", target)).unwrap(), Status::More);
            assert_eq!(client.sync_data(target.as_bytes(), target.len() as u64).unwrap(), Status::Ok);
        }
        // A directory in the way is left alone; the store still records the link
        assert_eq!(client.sync_meta(&link("blocked", "a.txt")).unwrap(), Status::More);
        assert_eq!(client.sync_data(&b"a.txt"[..], 5).unwrap(), Status::Ok);
        drop(client);

        assert_eq!(
            std::fs::read_link(mirror.path().join("ln")).unwrap(),
            PathBuf::from("b.txt")
        );
        assert!(mirror.path().join("blocked/keep").is_file());
        assert_eq!(
            store.entry("blocked").unwrap().content.as_deref(),
            Some(&b"a.txt"[..])
        );
    }
}

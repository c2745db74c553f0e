//! Per-entry metadata captured right before a sync

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::hash::ContentHash;
use crate::paths::wire_bytes;

const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;

/// `lstat` fields carried in a SYNC_META body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl From<&Metadata> for EntryStat {
    fn from(metadata: &Metadata) -> Self {
        Self {
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size(),
            atime: metadata.atime(),
            mtime: metadata.mtime(),
            ctime: metadata.ctime(),
        }
    }
}

/// Everything the server needs to decide whether it wants content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to the sync root
    pub path: PathBuf,
    pub stat: EntryStat,
    /// BLAKE3 of the contents; zero for directories, special files and unreadable files
    pub hash: ContentHash,
    pub is_dir: bool,
    /// For symlinks, the link target; its bytes stand in for the contents
    pub link_target: Option<PathBuf>,
}

impl FileRecord {
    /// Stat `absolute` without following symlinks and hash its contents
    ///
    /// # Errors
    /// Returns `SyncError::Stat` if the entry cannot be stat'ed. An unreadable
    /// file is not an error; it is sent with the zero hash.
    pub fn capture(absolute: &Path, relative: &Path) -> Result<Self, SyncError> {
        let metadata = std::fs::symlink_metadata(absolute).map_err(|source| SyncError::Stat {
            path: relative.to_path_buf(),
            source,
        })?;
        let is_dir = metadata.is_dir();
        let link_target = if metadata.file_type().is_symlink() {
            std::fs::read_link(absolute)
                .map_err(|e| warn!("cannot read link {}: {e}", relative.display()))
                .ok()
        } else {
            None
        };

        let hash = if is_dir {
            ContentHash::ZERO
        } else if let Some(target) = &link_target {
            ContentHash::from_bytes(wire_bytes(target))
        } else if metadata.is_file() {
            ContentHash::from_file(absolute).unwrap_or_else(|e| {
                warn!("cannot hash {}: {e}", relative.display());
                ContentHash::ZERO
            })
        } else {
            // Opening a FIFO or a device would block or never reach EOF
            debug!("{} is not a regular file, sending no content", relative.display());
            ContentHash::ZERO
        };

        Ok(Self {
            path: relative.to_path_buf(),
            stat: EntryStat::from(&metadata),
            hash,
            is_dir,
            link_target,
        })
    }

    /// Whether the entry is a regular file whose bytes can be streamed
    pub fn is_regular(&self) -> bool {
        self.stat.mode & S_IFMT == S_IFREG
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_capture_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hi").unwrap();

        let record = FileRecord::capture(&path, Path::new("a.txt")).unwrap();
        assert_eq!(record.path, PathBuf::from("a.txt"));
        assert_eq!(record.stat.size, 2);
        assert_eq!(record.hash, ContentHash::from_bytes(b"hi"));
        assert!(!record.is_dir);
        assert!(record.is_regular());
    }

    #[test]
    fn test_capture_directory_has_zero_hash() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let record = FileRecord::capture(&dir.path().join("sub"), Path::new("sub")).unwrap();
        assert!(record.is_dir);
        assert!(record.hash.is_zero());
    }

    #[test]
    fn test_capture_reports_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.txt");
        std::fs::write(&path, "x").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_000_000_000, 0))
            .unwrap();

        let record = FileRecord::capture(&path, Path::new("old.txt")).unwrap();
        assert_eq!(record.stat.mtime, 1_000_000_000);
        assert_eq!(record.stat.mode & 0o170_000, 0o100_000);
    }

    #[test]
    fn test_capture_symlink_hashes_target() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("a.txt", dir.path().join("link")).unwrap();

        let record = FileRecord::capture(&dir.path().join("link"), Path::new("link")).unwrap();
        assert_eq!(record.link_target, Some(PathBuf::from("a.txt")));
        assert_eq!(record.hash, ContentHash::from_bytes(b"a.txt"));
        assert_eq!(record.stat.size, 5);
        assert!(!record.is_dir);
        assert!(!record.is_regular());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_capture_fifo_returns_without_reading() {
        use crate::testing::{mkfifo, returns_within};
        use std::time::Duration;

        let dir = TempDir::new().unwrap();
        let pipe = dir.path().join("pipe");
        mkfifo(&pipe);

        let record = returns_within(Duration::from_secs(3), move || {
            FileRecord::capture(&pipe, Path::new("pipe")).unwrap()
        });
        assert!(record.hash.is_zero());
        assert!(!record.is_regular());
        assert!(!record.is_dir);
        assert_eq!(record.stat.mode & S_IFMT, 0o010_000);
    }

    #[test]
    fn test_capture_missing_is_stat_error() {
        let dir = TempDir::new().unwrap();
        let err = FileRecord::capture(&dir.path().join("gone"), Path::new("gone")).unwrap_err();
        assert!(matches!(err, SyncError::Stat { .. }));
        assert!(!err.is_fatal());
    }
}

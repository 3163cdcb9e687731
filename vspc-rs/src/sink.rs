//! Per-UUID serial log sink.
//!
//! One file per VM under the configured directory, named by the normalized
//! UUID, opened append-binary on every write and created on the first.
//! Appends are not fsynced.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Appends raw serial payload to `<dir>/<uuid>`.
///
/// The session driver is the only writer for a given UUID, so appends to
/// one file are naturally serialized; distinct UUIDs are independent.
pub struct SerialLog {
    dir: PathBuf,
}

impl SerialLog {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_owned() }
    }

    /// Append `data` to the log file for `uuid`, creating it if needed.
    pub async fn append(&self, uuid: &str, data: &[u8]) -> io::Result<()> {
        let path = self.dir.join(uuid);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        file.write_all(data).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_creates_and_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SerialLog::new(dir.path());

        sink.append("112233", b"hello ").await.unwrap();
        sink.append("112233", b"world").await.unwrap();

        let contents = std::fs::read(dir.path().join("112233")).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn distinct_uuids_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SerialLog::new(dir.path());

        sink.append("aa", b"a").await.unwrap();
        sink.append("bb", b"b").await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("aa")).unwrap(), b"a");
        assert_eq!(std::fs::read(dir.path().join("bb")).unwrap(), b"b");
    }

    #[tokio::test]
    async fn append_to_missing_directory_fails() {
        let sink = SerialLog::new(Path::new("/nonexistent-vspc-log-dir"));
        assert!(sink.append("uuid", b"x").await.is_err());
    }
}

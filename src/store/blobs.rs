//! Content store for posted files.
//!
//! Blobs live in a flat directory, one file per message, named by the
//! message id that owns them. Written once at post time, read back on
//! demand.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub(crate) struct BlobDir {
    root: PathBuf,
}

impl BlobDir {
    /// Opens the blob directory, creating it if needed.
    pub(crate) fn create(root: &Path) -> io::Result<BlobDir> {
        fs::create_dir_all(root)?;
        Ok(BlobDir {
            root: root.to_path_buf(),
        })
    }

    pub(crate) fn write(&self, message_id: i64, bytes: &[u8]) -> io::Result<()> {
        fs::write(self.root.join(message_id.to_string()), bytes)
    }

    pub(crate) fn read(&self, message_id: i64) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(message_id.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip() {
        let dir = TempDir::new().unwrap();
        let blobs = BlobDir::create(&dir.path().join("files")).unwrap();
        blobs.write(42, b"content").unwrap();
        assert_eq!(blobs.read(42).unwrap(), b"content");
        assert!(blobs.read(43).is_err());
    }
}

//! Attachment blobs on disk.
//!
//! Files live under `<data_dir>/storage/<collection_id>/<record_id>/<name>`,
//! where `name` is the sanitized client file name plus a random suffix.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STORAGE_DIR: &str = "storage";

const MAX_BASE_LEN: usize = 100;
const SUFFIX_LEN: usize = 10;

/// Blob removal owed by a committed change to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobCleanup {
    Collection(String),
    Record {
        collection_id: String,
        record_id: String,
    },
    Files {
        collection_id: String,
        record_id: String,
        filenames: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join(STORAGE_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_dir(&self, collection_id: &str, record_id: &str) -> PathBuf {
        self.root.join(collection_id).join(record_id)
    }

    pub fn path(&self, collection_id: &str, record_id: &str, filename: &str) -> PathBuf {
        self.record_dir(collection_id, record_id).join(filename)
    }

    pub fn write(
        &self,
        collection_id: &str,
        record_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> io::Result<()> {
        let dir = self.record_dir(collection_id, record_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(filename), bytes)?;
        debug!(collection_id, record_id, filename, size = bytes.len(), "stored file");
        Ok(())
    }

    pub fn read(&self, collection_id: &str, record_id: &str, filename: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.path(collection_id, record_id, filename))
    }

    pub fn exists(&self, collection_id: &str, record_id: &str, filename: &str) -> bool {
        self.path(collection_id, record_id, filename).is_file()
    }

    /// Remove one file; a missing file is not an error
    pub fn delete(&self, collection_id: &str, record_id: &str, filename: &str) -> io::Result<()> {
        ignore_missing(std::fs::remove_file(
            self.path(collection_id, record_id, filename),
        ))
    }

    pub fn delete_record(&self, collection_id: &str, record_id: &str) -> io::Result<()> {
        ignore_missing(std::fs::remove_dir_all(
            self.record_dir(collection_id, record_id),
        ))
    }

    pub fn delete_collection(&self, collection_id: &str) -> io::Result<()> {
        ignore_missing(std::fs::remove_dir_all(self.root.join(collection_id)))
    }

    /// Best-effort removal of several files; failures are logged
    pub fn delete_many(&self, collection_id: &str, record_id: &str, filenames: &[String]) {
        for name in filenames {
            if let Err(e) = self.delete(collection_id, record_id, name) {
                warn!(collection_id, record_id, file = %name, error = %e, "failed to delete file");
            }
        }
    }

    /// Carry out queued removals; failures are logged and skipped
    pub fn cleanup(&self, items: Vec<BlobCleanup>) {
        for item in items {
            match item {
                BlobCleanup::Collection(collection_id) => {
                    if let Err(e) = self.delete_collection(&collection_id) {
                        warn!(collection_id = %collection_id, error = %e, "failed to delete collection files");
                    }
                }
                BlobCleanup::Record {
                    collection_id,
                    record_id,
                } => {
                    if let Err(e) = self.delete_record(&collection_id, &record_id) {
                        warn!(collection_id = %collection_id, record_id = %record_id, error = %e, "failed to delete record files");
                    }
                }
                BlobCleanup::Files {
                    collection_id,
                    record_id,
                    filenames,
                } => self.delete_many(&collection_id, &record_id, &filenames),
            }
        }
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Storage name for an uploaded file: `<sanitized base>_<random>.<ext>`
pub fn stored_filename(original: &str) -> String {
    let name = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) if !b.is_empty() => (b, e),
        _ => (name, ""),
    };

    let mut clean: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    while clean.contains("__") {
        clean = clean.replace("__", "_");
    }
    let mut clean = clean.trim_matches('_').to_string();
    if clean.is_empty() {
        clean = "file".to_string();
    }
    clean.truncate(MAX_BASE_LEN);

    let ext: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    let random = uuid::Uuid::new_v4().simple().to_string();
    let suffix = &random[..SUFFIX_LEN];
    if ext.is_empty() {
        format!("{}_{}", clean, suffix)
    } else {
        format!("{}_{}.{}", clean, suffix, ext)
    }
}

/// Public download URL of a stored file
pub fn file_url(public_url: &str, collection_id: &str, record_id: &str, filename: &str) -> String {
    format!(
        "{}/api/files/{}/{}/{}",
        public_url.trim_end_matches('/'),
        collection_id,
        record_id,
        filename
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_filename_sanitizes() {
        let name = stored_filename("My Song (Live).MP3");
        assert!(name.starts_with("my_song_live_"), "{}", name);
        assert!(name.ends_with(".mp3"));
        assert_eq!(name.len(), "my_song_live_".len() + SUFFIX_LEN + ".mp3".len());
    }

    #[test]
    fn test_stored_filename_edge_cases() {
        assert!(stored_filename("../../etc/passwd").starts_with("passwd_"));
        assert!(stored_filename("???.wav").starts_with("file_"));
        assert!(!stored_filename("noext").contains('.'));
        assert!(stored_filename(".hidden").starts_with("hidden_"));
        assert_ne!(stored_filename("a.mp3"), stored_filename("a.mp3"));
    }

    #[test]
    fn test_file_url() {
        assert_eq!(
            file_url("http://127.0.0.1:8090/", "c1", "r1", "a_x.mp3"),
            "http://127.0.0.1:8090/api/files/c1/r1/a_x.mp3"
        );
    }

    #[test]
    fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write("c1", "r1", "a.mp3", b"ID3").unwrap();
        storage.write("c1", "r1", "b.mp3", b"ID3").unwrap();
        assert_eq!(storage.read("c1", "r1", "a.mp3").unwrap(), b"ID3");
        assert!(storage.exists("c1", "r1", "b.mp3"));

        storage.delete("c1", "r1", "a.mp3").unwrap();
        storage.delete("c1", "r1", "a.mp3").unwrap();
        assert!(!storage.exists("c1", "r1", "a.mp3"));

        storage.delete_collection("c1").unwrap();
        assert!(!storage.exists("c1", "r1", "b.mp3"));
        storage.delete_record("c1", "r1").unwrap();
    }

    #[test]
    fn test_cleanup_queue() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write("c1", "r1", "a.mp3", b"ID3").unwrap();
        storage.write("c1", "r1", "b.mp3", b"ID3").unwrap();
        storage.write("c1", "r2", "c.mp3", b"ID3").unwrap();
        storage.write("c2", "r3", "d.mp3", b"ID3").unwrap();

        storage.cleanup(vec![
            BlobCleanup::Files {
                collection_id: "c1".to_string(),
                record_id: "r1".to_string(),
                filenames: vec!["a.mp3".to_string(), "missing.mp3".to_string()],
            },
            BlobCleanup::Record {
                collection_id: "c1".to_string(),
                record_id: "r2".to_string(),
            },
            BlobCleanup::Collection("c2".to_string()),
        ]);
        assert!(!storage.exists("c1", "r1", "a.mp3"));
        assert!(storage.exists("c1", "r1", "b.mp3"));
        assert!(!storage.record_dir("c1", "r2").exists());
        assert!(!storage.exists("c2", "r3", "d.mp3"));
    }
}

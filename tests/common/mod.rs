#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::{FileTime, set_file_mtime};
use media_index::{ContentHasher, ExtensionSet, FileRemover, HashAlgorithm, HashCache, HashError};
use tempfile::TempDir;

/// A scratch layout: `output/` destination, `cache/` cache root, `src*/` sources.
pub struct Fixture {
    pub root: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            root: tempfile::tempdir().unwrap(),
        };
        fs::create_dir_all(fixture.dest()).unwrap();
        fixture
    }

    pub fn dest(&self) -> PathBuf {
        self.root.path().join("output")
    }

    pub fn cache_root(&self) -> PathBuf {
        self.root.path().join("cache").join("foto")
    }

    pub fn source(&self, name: &str) -> PathBuf {
        let dir = self.root.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn missing_list(&self) -> PathBuf {
        self.root.path().join("lists").join("missing_foto.txt")
    }

    pub fn cache(&self) -> HashCache {
        HashCache::new(self.cache_root(), self.dest())
    }

    /// Writes `content` under the fixture root, creating parent directories.
    pub fn write(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.root.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }
}

pub fn photos() -> ExtensionSet {
    ExtensionSet::new([".jpg", ".jpeg", ".png"])
}

pub fn set_mtime(path: &Path, secs: i64) {
    set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
}

pub fn mtime_of(path: &Path) -> f64 {
    media_index::utils::mtime_secs(&fs::metadata(path).unwrap()).unwrap()
}

/// Fails for any file whose name contains `needle`, hashes the rest with SHA-256.
pub struct FailingHasher {
    pub needle: &'static str,
}

impl ContentHasher for FailingHasher {
    fn hash(&self, path: &Path) -> Result<String, HashError> {
        let name = path.file_name().unwrap().to_string_lossy();
        if name.contains(self.needle) {
            return Err(HashError::new(
                path,
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "simulated read failure"),
            ));
        }
        HashAlgorithm::Sha256.hash(path)
    }
}

/// Refuses to delete any file whose name contains `needle`, deletes the rest.
pub struct FailingRemover {
    pub needle: &'static str,
}

impl FileRemover for FailingRemover {
    fn remove(&self, path: &Path) -> io::Result<()> {
        let name = path.file_name().unwrap().to_string_lossy();
        if name.contains(self.needle) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "simulated delete failure"));
        }
        fs::remove_file(path)
    }
}

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::HashError;
use crate::utils::ExtensionSet;

const CHUNK_SIZE: usize = 64 * 1024;

/// Produces a stable content digest for one file.
pub trait ContentHasher {
    fn hash(&self, path: &Path) -> Result<String, HashError>;
}

/// Digest algorithms. Both render as 64 lowercase hex characters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }
}

impl ContentHasher for HashAlgorithm {
    fn hash(&self, path: &Path) -> Result<String, HashError> {
        calculate_file_hash(path, *self)
    }
}

/// Streams `file_path` through `algorithm` in fixed-size chunks.
pub fn calculate_file_hash(file_path: &Path, algorithm: HashAlgorithm) -> Result<String, HashError> {
    debug!("Calculating {} for: '{}'", algorithm.name(), file_path.display());

    let file = fs::File::open(file_path).map_err(|e| HashError::new(file_path, e))?;
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
    let mut buffer = vec![0u8; CHUNK_SIZE];

    let (hash, total_bytes) = match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            let total = stream_into(&mut reader, &mut buffer, file_path, |chunk| hasher.update(chunk))?;
            (format!("{:x}", hasher.finalize()), total)
        }
        HashAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            let total = stream_into(&mut reader, &mut buffer, file_path, |chunk| {
                hasher.update(chunk);
            })?;
            (hasher.finalize().to_hex().to_string(), total)
        }
    };

    debug!("Hashed {} bytes of '{}'", total_bytes, file_path.display());
    Ok(hash)
}

/// Feeds `reader` to `sink` until EOF and returns the number of bytes read.
fn stream_into<R: Read>(
    reader: &mut R,
    buffer: &mut [u8],
    path: &Path,
    mut sink: impl FnMut(&[u8]),
) -> Result<u64, HashError> {
    let mut total_bytes = 0u64;
    loop {
        let bytes_read = match reader.read(buffer) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HashError::new(path, e)),
        };
        if bytes_read == 0 {
            break;
        }
        sink(&buffer[..bytes_read]);
        total_bytes += bytes_read as u64;
    }
    Ok(total_bytes)
}

/// A regular file that passed the extension filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCandidate {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

/// Lowercased file name and size, the key for hash-free existence checks.
pub type NameSizeKey = (String, u64);

/// `(lowercased name, size) -> path`; later entries overwrite earlier ones.
pub type NameSizeIndex = HashMap<NameSizeKey, PathBuf>;

impl FileCandidate {
    pub fn key(&self) -> NameSizeKey {
        (self.name.to_lowercase(), self.size)
    }
}

/// Recursively yields every matching regular file under `root`, sorted by
/// file name within each directory. Unreadable entries are logged and skipped.
pub fn walk_candidates<'a>(
    root: &Path,
    exts: &'a ExtensionSet,
) -> impl Iterator<Item = FileCandidate> + 'a {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to read directory entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && exts.matches(entry.path()))
        .filter_map(|entry| {
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to read metadata for '{}': {}", entry.path().display(), e);
                    return None;
                }
            };
            Some(FileCandidate {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.into_path(),
                size: metadata.len(),
            })
        })
}

/// Matching regular files directly inside `dir` (no recursion), sorted by name.
pub fn list_candidate_files(dir: &Path, exts: &ExtensionSet) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to read entry in '{}': {}", dir.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| exts.matches(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Builds the name/size index over the whole tree at `root`.
pub fn index_name_size(root: &Path, exts: &ExtensionSet) -> NameSizeIndex {
    info!("Indexing names and sizes under '{}'", root.display());
    let mut index = NameSizeIndex::new();
    for candidate in walk_candidates(root, exts) {
        let key = candidate.key();
        index.insert(key, candidate.path);
    }
    debug!("Indexed {} name/size keys under '{}'", index.len(), root.display());
    index
}

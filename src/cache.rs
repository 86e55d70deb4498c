use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::{Config, MediaCategory};
use crate::scanner::{ContentHasher, HashAlgorithm, list_candidate_files};
use crate::utils::{ExtensionSet, format_human_elapsed, mtime_secs, write_atomic};

pub const CACHE_FILE_NAME: &str = "cache.json";
pub const DEFAULT_TOLERANCE_SECS: f64 = 1.0;
pub const DEFAULT_CACHE_DEPTH: usize = 1;

/// Digest and the metadata it was computed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub mtime: f64,
    pub size: u64,
}

/// The persisted record for one physical directory.
///
/// On disk this is the `cache.json` inside the mirrored cache directory:
/// `{"files": {name: {hash, mtime, size}}, "folder_mtime": f64, "algorithm": "sha256"}`.
/// `algorithm` may be absent in older files and then reads as SHA-256.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryCache {
    #[serde(default)]
    pub files: BTreeMap<String, CacheEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_mtime: Option<f64>,
    #[serde(default)]
    pub algorithm: HashAlgorithm,
}

impl DirectoryCache {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read cache: '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse cache: '{}'", path.display()))
    }

    /// Persists atomically; a reader never sees a half-written file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &content)
            .with_context(|| format!("Failed to write cache: '{}'", path.display()))
    }
}

/// Why a directory cache cannot be trusted for hash lookups.
#[derive(Debug, Clone, PartialEq)]
pub enum StaleReason {
    Unreadable(String),
    DirectoryMissing,
    NoFolderMtime,
    AlgorithmMismatch {
        found: HashAlgorithm,
        expected: HashAlgorithm,
    },
    Outdated {
        cached: f64,
        actual: f64,
    },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::Unreadable(e) => write!(f, "unreadable cache ({})", e),
            StaleReason::DirectoryMissing => write!(f, "backing directory no longer exists"),
            StaleReason::NoFolderMtime => write!(f, "cache has no folder_mtime"),
            StaleReason::AlgorithmMismatch { found, expected } => write!(
                f,
                "cache built with {} but {} is configured",
                found.name(),
                expected.name()
            ),
            StaleReason::Outdated { cached, actual } => write!(
                f,
                "directory modified after cache was written (cached {:.3}, actual {:.3})",
                cached, actual
            ),
        }
    }
}

/// Freshness of one directory's cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheState {
    Fresh,
    Stale(StaleReason),
    Absent,
}

impl CacheState {
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheState::Fresh)
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheState::Fresh => write!(f, "fresh"),
            CacheState::Stale(reason) => write!(f, "stale: {}", reason),
            CacheState::Absent => write!(f, "absent"),
        }
    }
}

pub fn within_tolerance(cached: f64, actual: f64, tolerance: f64) -> bool {
    (actual - cached).abs() <= tolerance
}

/// Totals for one cache-build pass.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub directories: usize,
    pub files_scanned: usize,
    pub new_hashes: usize,
    pub reused: usize,
    pub failed: usize,
    pub elapsed: Duration,
    /// Directories whose contents could not be listed; their cache is left as is.
    pub unlisted: usize,
    pub interrupted: bool,
}

/// How one directory's pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectoryOutcome {
    Written,
    Unlisted,
    Interrupted,
}

/// A cache entry resolved to the destination path it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFile {
    pub path: PathBuf,
    pub entry: CacheEntry,
}

/// `digest -> destination path` merged from fresh caches.
#[derive(Debug, Default)]
pub struct FreshIndex {
    pub hashes: HashMap<String, PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Per-directory hash caches for one destination tree.
///
/// Cache files mirror the destination layout under `cache_root`: the cache for
/// `<output_root>/<rel>` lives at `<cache_root>/<rel>/cache.json`. Only the
/// root and directories down to `depth` levels below it get a cache.
///
/// Assumes a single process and a single invocation at a time. Writes are
/// atomic, but two concurrent builds over the same tree can still lose each
/// other's updates.
pub struct HashCache {
    cache_root: PathBuf,
    output_root: PathBuf,
    depth: usize,
    tolerance: f64,
    algorithm: HashAlgorithm,
    interrupt: Option<Arc<AtomicBool>>,
}

impl HashCache {
    pub fn new(cache_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            output_root: output_root.into(),
            depth: DEFAULT_CACHE_DEPTH,
            tolerance: DEFAULT_TOLERANCE_SECS,
            algorithm: HashAlgorithm::default(),
            interrupt: None,
        }
    }

    pub fn from_config(config: &Config, category: &MediaCategory) -> Self {
        Self::new(config.cache_root_for(category), &category.destination)
            .with_depth(config.cache_depth)
            .with_tolerance(config.freshness_tolerance_secs)
            .with_algorithm(config.hash_algorithm)
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Shared stop flag. Builds check it before every file, matching before
    /// every source file, deduplication before every hash bucket.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The configured algorithm as a hasher.
    pub fn hasher(&self) -> &HashAlgorithm {
        &self.algorithm
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn cache_file_for(&self, dir: &Path) -> PathBuf {
        let rel = dir.strip_prefix(&self.output_root).unwrap_or(Path::new(""));
        self.cache_root.join(rel).join(CACHE_FILE_NAME)
    }

    /// The destination directory a cache file describes.
    pub fn output_dir_for(&self, cache_file: &Path) -> Option<PathBuf> {
        let parent = cache_file.parent()?;
        let rel = parent.strip_prefix(&self.cache_root).ok()?;
        Some(self.output_root.join(rel))
    }

    /// Destination directories that carry a cache, root first, then sorted by name.
    pub fn cached_directories(&self) -> Result<Vec<PathBuf>> {
        if !self.output_root.is_dir() {
            bail!(
                "Destination directory does not exist: '{}'",
                self.output_root.display()
            );
        }
        let cache_root = self.cache_root.clone();
        let dirs = WalkDir::new(&self.output_root)
            .max_depth(self.depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| e.path() != cache_root)
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| entry.into_path())
            .collect();
        Ok(dirs)
    }

    /// Every `cache.json` under the cache root, in path order.
    pub fn cache_files(&self) -> Vec<PathBuf> {
        if !self.cache_root.is_dir() {
            return Vec::new();
        }
        WalkDir::new(&self.cache_root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == CACHE_FILE_NAME)
            .map(|entry| entry.into_path())
            .collect()
    }

    /// Refreshes the cache of every covered directory.
    ///
    /// Directories are visited root first, then in file-name order, down to
    /// the configured depth. A file keeps its recorded digest when both its
    /// mtime and size still match; otherwise it is rehashed. Files that fail to
    /// hash are logged, counted in [`BuildReport::failed`] and left out, so the
    /// next build retries them. Entries for files that vanished are dropped.
    /// Each directory's cache is saved atomically and stamped with the
    /// directory's current mtime.
    ///
    /// A directory that cannot be listed keeps its previous cache and is counted
    /// in [`BuildReport::unlisted`]. When the interrupt flag is set the build
    /// stops before the next file; the directory in progress keeps its previous
    /// cache and [`BuildReport::interrupted`] is set.
    ///
    /// # Errors
    ///
    /// Fails when the destination root does not exist, when a directory cannot
    /// be stat'ed after hashing, or when a cache file cannot be written.
    pub fn build(&self, exts: &ExtensionSet) -> Result<BuildReport> {
        self.build_with(exts, &self.algorithm)
    }

    /// Like [`HashCache::build`] with an explicit hasher.
    pub fn build_with(&self, exts: &ExtensionSet, hasher: &dyn ContentHasher) -> Result<BuildReport> {
        let start_time = Instant::now();
        let dirs = self.cached_directories()?;
        info!(
            "Updating hash cache for '{}' ({} directories)",
            self.output_root.display(),
            dirs.len()
        );

        let mut report = BuildReport::default();
        for (visited, dir) in dirs.iter().enumerate() {
            if self.interrupted() {
                report.interrupted = true;
            } else {
                match self.build_directory(dir, exts, hasher, &mut report)? {
                    DirectoryOutcome::Written => report.directories += 1,
                    DirectoryOutcome::Unlisted => report.unlisted += 1,
                    DirectoryOutcome::Interrupted => report.interrupted = true,
                }
            }
            if report.interrupted {
                warn!("Cache build interrupted; {} directories left untouched", dirs.len() - visited);
                break;
            }
        }

        report.elapsed = start_time.elapsed();
        info!("Total files scanned: {}", HumanCount(report.files_scanned as u64));
        info!("Total new hashes computed: {}", HumanCount(report.new_hashes as u64));
        if report.unlisted > 0 {
            warn!("Directories that could not be listed: {}", report.unlisted);
        }
        if report.failed > 0 {
            warn!("Files that could not be hashed: {}", HumanCount(report.failed as u64));
        }
        info!("Time taken: {}", format_human_elapsed(report.elapsed));
        Ok(report)
    }

    fn build_directory(
        &self,
        dir: &Path,
        exts: &ExtensionSet,
        hasher: &dyn ContentHasher,
        report: &mut BuildReport,
    ) -> Result<DirectoryOutcome> {
        let cache_file = self.cache_file_for(dir);
        let previous = self.load_for_build(&cache_file);

        let files = match list_candidate_files(dir, exts) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list '{}': {}", dir.display(), e);
                return Ok(DirectoryOutcome::Unlisted);
            }
        };
        report.files_scanned += files.len();

        let progress_bar = ProgressBar::new(files.len() as u64);
        progress_bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        progress_bar.set_message(dir.display().to_string());

        let mut entries = BTreeMap::new();
        let mut new_hashes = 0;
        for path in &files {
            if self.interrupted() {
                progress_bar.abandon();
                warn!("Interrupted while hashing '{}'; its cache is unchanged", dir.display());
                return Ok(DirectoryOutcome::Interrupted);
            }
            progress_bar.inc(1);
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let (mtime, size) = match fs::metadata(path).and_then(|m| Ok((mtime_secs(&m)?, m.len()))) {
                Ok(stat) => stat,
                Err(e) => {
                    warn!("Failed to read metadata for '{}': {}", path.display(), e);
                    report.failed += 1;
                    continue;
                }
            };

            if let Some(cached) = previous
                .files
                .get(&name)
                .filter(|c| c.mtime == mtime && c.size == size)
            {
                entries.insert(name, cached.clone());
                report.reused += 1;
                continue;
            }

            match hasher.hash(path) {
                Ok(hash) => {
                    entries.insert(name, CacheEntry { hash, mtime, size });
                    new_hashes += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    report.failed += 1;
                }
            }
        }
        progress_bar.finish_and_clear();

        let folder_mtime = fs::metadata(dir)
            .and_then(|m| mtime_secs(&m))
            .with_context(|| format!("Failed to stat directory: '{}'", dir.display()))?;
        let updated = DirectoryCache {
            files: entries,
            folder_mtime: Some(folder_mtime),
            algorithm: self.algorithm,
        };
        updated.save(&cache_file)?;

        report.new_hashes += new_hashes;
        info!("{} -> new hashes added: {}/{}", dir.display(), new_hashes, files.len());
        Ok(DirectoryOutcome::Written)
    }

    fn load_for_build(&self, cache_file: &Path) -> DirectoryCache {
        if !cache_file.exists() {
            debug!("No cache at '{}', starting fresh", cache_file.display());
            return DirectoryCache::default();
        }
        match DirectoryCache::read(cache_file) {
            Ok(cache) if cache.algorithm != self.algorithm => {
                warn!(
                    "Cache '{}' was built with {}, rehashing with {}",
                    cache_file.display(),
                    cache.algorithm.name(),
                    self.algorithm.name()
                );
                DirectoryCache::default()
            }
            Ok(cache) => cache,
            Err(e) => {
                warn!("{:#}; treating as empty", e);
                DirectoryCache::default()
            }
        }
    }

    /// Whether the shared interrupt flag has been raised.
    pub fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Freshness of the cache covering `dir`.
    pub fn state_of(&self, dir: &Path) -> CacheState {
        self.evaluate(&self.cache_file_for(dir), dir)
    }

    fn evaluate(&self, cache_file: &Path, dir: &Path) -> CacheState {
        if !cache_file.exists() {
            return CacheState::Absent;
        }
        let cache = match DirectoryCache::read(cache_file) {
            Ok(cache) => cache,
            Err(e) => return CacheState::Stale(StaleReason::Unreadable(format!("{:#}", e))),
        };
        if !dir.is_dir() {
            return CacheState::Stale(StaleReason::DirectoryMissing);
        }
        if cache.algorithm != self.algorithm {
            return CacheState::Stale(StaleReason::AlgorithmMismatch {
                found: cache.algorithm,
                expected: self.algorithm,
            });
        }
        let Some(cached) = cache.folder_mtime else {
            return CacheState::Stale(StaleReason::NoFolderMtime);
        };
        let actual = match fs::metadata(dir).and_then(|m| mtime_secs(&m)) {
            Ok(actual) => actual,
            Err(e) => return CacheState::Stale(StaleReason::Unreadable(e.to_string())),
        };
        if !within_tolerance(cached, actual, self.tolerance) {
            return CacheState::Stale(StaleReason::Outdated { cached, actual });
        }
        CacheState::Fresh
    }

    /// State of every covered destination directory. Stops early, with the
    /// states gathered so far, once the interrupt flag is raised.
    pub fn check(&self) -> Result<Vec<(PathBuf, CacheState)>> {
        let mut states = Vec::new();
        for dir in self.cached_directories()? {
            if self.interrupted() {
                warn!("Cache check interrupted");
                break;
            }
            let state = self.state_of(&dir);
            states.push((dir, state));
        }
        Ok(states)
    }

    /// Merges every fresh cache under the cache root into one digest index.
    ///
    /// Non-fresh caches are skipped with a warning. Entries must match `exts`
    /// and still exist on disk to be indexed.
    pub fn fresh_hash_index(&self, exts: &ExtensionSet) -> FreshIndex {
        let mut index = FreshIndex::default();
        for cache_file in self.cache_files() {
            let Some(out_dir) = self.output_dir_for(&cache_file) else {
                continue;
            };
            let state = self.evaluate(&cache_file, &out_dir);
            if !state.is_fresh() {
                warn!("Cache for '{}' ignored: {}", out_dir.display(), state);
                index.skipped.push(out_dir);
                continue;
            }
            let cache = match DirectoryCache::read(&cache_file) {
                Ok(cache) => cache,
                Err(e) => {
                    warn!("{:#}", e);
                    index.skipped.push(out_dir);
                    continue;
                }
            };
            for (name, entry) in cache.files {
                if !exts.matches_name(&name) {
                    continue;
                }
                let path = out_dir.join(&name);
                if path.exists() {
                    index.hashes.insert(entry.hash, path);
                }
            }
        }
        index
    }

    /// Every entry of every readable cache, regardless of freshness.
    pub fn recorded_files(&self) -> Vec<RecordedFile> {
        let mut recorded = Vec::new();
        for cache_file in self.cache_files() {
            let Some(out_dir) = self.output_dir_for(&cache_file) else {
                continue;
            };
            match DirectoryCache::read(&cache_file) {
                Ok(cache) => recorded.extend(cache.files.into_iter().map(|(name, entry)| RecordedFile {
                    path: out_dir.join(name),
                    entry,
                })),
                Err(e) => warn!("{:#}", e),
            }
        }
        recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_cache_without_algorithm_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE_NAME);
        fs::write(
            &path,
            r#"{
  "files": {
    "a.jpg": {"hash": "ab", "mtime": 1700000000.25, "size": 10}
  },
  "folder_mtime": 1700000001.5
}"#,
        )
        .unwrap();

        let cache = DirectoryCache::read(&path).unwrap();
        assert_eq!(cache.algorithm, HashAlgorithm::Sha256);
        assert_eq!(cache.folder_mtime, Some(1700000001.5));
        assert_eq!(cache.files["a.jpg"].size, 10);
    }

    #[test]
    fn save_then_read_preserves_mtime_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(CACHE_FILE_NAME);
        let mut cache = DirectoryCache {
            folder_mtime: Some(1712345678.123456789),
            ..Default::default()
        };
        cache.files.insert(
            "x.jpg".into(),
            CacheEntry {
                hash: "00".repeat(32),
                mtime: 1712345678.987654321,
                size: 3,
            },
        );
        cache.save(&path).unwrap();
        assert_eq!(DirectoryCache::read(&path).unwrap(), cache);
    }

    #[test]
    fn tolerance_is_inclusive() {
        let actual = 1_700_000_000.0;
        assert!(within_tolerance(actual + 1.0, actual, 1.0));
        assert!(within_tolerance(actual - 1.0, actual, 1.0));
        assert!(!within_tolerance(actual + 1.1, actual, 1.0));
    }

    #[test]
    fn cache_paths_mirror_destination() {
        let cache = HashCache::new("/c/foto", "/out/foto");
        assert_eq!(
            cache.cache_file_for(Path::new("/out/foto")),
            PathBuf::from("/c/foto/cache.json")
        );
        assert_eq!(
            cache.cache_file_for(Path::new("/out/foto/2019")),
            PathBuf::from("/c/foto/2019/cache.json")
        );
        assert_eq!(
            cache.output_dir_for(Path::new("/c/foto/2019/cache.json")),
            Some(PathBuf::from("/out/foto/2019"))
        );
        assert_eq!(cache.output_dir_for(Path::new("/elsewhere/cache.json")), None);
    }

    #[test]
    fn unlisted_directory_keeps_its_cache_and_is_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");
        fs::create_dir_all(&output).unwrap();
        let cache = HashCache::new(dir.path().join("cache"), &output);
        let vanished = output.join("2019");

        let mut report = BuildReport::default();
        let outcome = cache
            .build_directory(&vanished, &ExtensionSet::new([".jpg"]), cache.hasher(), &mut report)
            .unwrap();
        assert_eq!(outcome, DirectoryOutcome::Unlisted);
        assert_eq!(report.files_scanned, 0);
        assert!(!cache.cache_file_for(&vanished).exists());
    }

    #[test]
    fn missing_destination_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HashCache::new(dir.path().join("cache"), dir.path().join("nope"));
        let err = cache.build(&ExtensionSet::new([".jpg"])).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}

//! Finds source files that have no counterpart in the destination tree.
//!
//! A source file is matched when the destination holds a file with the same
//! lowercased name and size. In [`MatchMode::NameThenHash`] an unmatched file
//! is hashed and looked up in the digests of the destination's fresh caches.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{HumanCount, ProgressBar};
use log::{debug, error, info, warn};

use crate::cache::HashCache;
use crate::error::MatchError;
use crate::scanner::{ContentHasher, index_name_size, walk_candidates};
use crate::utils::{ExtensionSet, write_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Lowercased name and size only.
    Name,
    /// Name and size, then content digest against fresh caches.
    NameThenHash,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Name => write!(f, "name+size"),
            MatchMode::NameThenHash => write!(f, "name+size+hash"),
        }
    }
}

/// What to do when hash matching is requested but a cache is not fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    AbortOnStale,
    DowngradeToNameOnly,
}

/// A source file with no destination counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRecord {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

impl MissingRecord {
    /// `name,size,path`
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.name, self.size, self.path.display())
    }

    /// The first two comma-separated fields are name and size; everything
    /// after them, commas included, is the path. Name and path are kept
    /// exactly as written.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.trim_end_matches(['\r', '\n']).splitn(3, ',');
        let name = parts.next()?;
        let size = parts.next()?.parse().ok()?;
        let path = parts.next()?;
        if name.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            size,
            path: PathBuf::from(path),
        })
    }
}

pub struct MatchRequest<'a> {
    pub label: &'a str,
    pub sources: &'a [PathBuf],
    pub extensions: &'a ExtensionSet,
    pub mode: MatchMode,
    pub policy: FallbackPolicy,
    /// Overwritten with one line per missing record.
    pub missing_list: &'a Path,
}

#[derive(Debug)]
pub struct MatchReport {
    pub records: Vec<MissingRecord>,
    pub mode_used: MatchMode,
    pub source_files: usize,
    pub destination_files: usize,
    pub hashes_loaded: usize,
    pub hash_failures: usize,
    pub skipped_caches: Vec<PathBuf>,
}

/// Compares source trees against the destination a [`HashCache`] covers.
pub struct MatchEngine<'a> {
    cache: &'a HashCache,
    hasher: &'a dyn ContentHasher,
}

impl<'a> MatchEngine<'a> {
    pub fn new(cache: &'a HashCache) -> Self {
        Self {
            cache,
            hasher: cache.hasher(),
        }
    }

    /// Hashes source files with `hasher` instead of the cache's algorithm.
    pub fn with_hasher(mut self, hasher: &'a dyn ContentHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Lists every source file with no counterpart in the destination and
    /// overwrites `request.missing_list` with them.
    ///
    /// Sources are walked in the order given, each in file-name order. A file
    /// is matched when the destination holds the same lowercased name with the
    /// same size. In [`MatchMode::NameThenHash`] an unmatched file is hashed and
    /// looked up in the digests merged from the fresh caches; a file that
    /// cannot be hashed is reported missing.
    ///
    /// # Errors
    ///
    /// * [`MatchError::MissingDirectory`] when the destination or any source
    ///   is absent. Nothing is scanned and the missing list is not touched.
    /// * [`MatchError::StaleCache`] when hash matching was requested, some
    ///   covered cache is not fresh and the policy is
    ///   [`FallbackPolicy::AbortOnStale`].
    /// * [`MatchError::Interrupted`] when the cache's interrupt flag is raised
    ///   during the walk. The missing list is not touched.
    /// * [`MatchError::Report`] when the missing list cannot be written.
    pub fn find_missing(&self, request: &MatchRequest<'_>) -> Result<MatchReport, MatchError> {
        let destination = self.cache.output_root();
        if !destination.is_dir() {
            error!("Destination directory does not exist: '{}'", destination.display());
            return Err(MatchError::MissingDirectory(destination.to_path_buf()));
        }
        for source in request.sources {
            if !source.is_dir() {
                error!("Source directory does not exist: '{}'", source.display());
                return Err(MatchError::MissingDirectory(source.clone()));
            }
        }

        let mode = self.resolve_mode(request)?;
        info!("=== Analysing '{}' (mode={}) ===", request.label, mode);

        let name_index = index_name_size(destination, request.extensions);
        let fresh = match mode {
            MatchMode::NameThenHash => {
                let fresh = self.cache.fresh_hash_index(request.extensions);
                info!(
                    "Loaded {} hashes from cache for '{}'",
                    HumanCount(fresh.hashes.len() as u64),
                    request.label
                );
                fresh
            }
            MatchMode::Name => Default::default(),
        };

        let mut records = Vec::new();
        let mut source_files = 0;
        let mut hash_failures = 0;
        for source in request.sources {
            info!("Scanning source: '{}'", source.display());
            let spinner = ProgressBar::new_spinner();
            spinner.enable_steady_tick(Duration::from_millis(100));

            for candidate in walk_candidates(source, request.extensions) {
                if self.cache.interrupted() {
                    spinner.abandon();
                    warn!("Search for '{}' interrupted after {} files", request.label, source_files);
                    return Err(MatchError::Interrupted);
                }
                source_files += 1;
                spinner.set_message(format!("{} -> {} files", request.label, source_files));

                if name_index.contains_key(&candidate.key()) {
                    continue;
                }
                if mode == MatchMode::NameThenHash {
                    match self.hasher.hash(&candidate.path) {
                        Ok(hash) if fresh.hashes.contains_key(&hash) => {
                            debug!("Matched by content: '{}'", candidate.path.display());
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("{}; reporting as missing", e);
                            hash_failures += 1;
                        }
                    }
                }
                records.push(MissingRecord {
                    name: candidate.name,
                    size: candidate.size,
                    path: candidate.path,
                });
            }
            spinner.finish_and_clear();
        }

        write_missing_list(request.missing_list, &records)?;

        info!(
            "{}: destination files = {} / hashes available = {} / missing files = {}",
            request.label,
            HumanCount(name_index.len() as u64),
            HumanCount(fresh.hashes.len() as u64),
            HumanCount(records.len() as u64)
        );
        info!("Report saved to: '{}'", request.missing_list.display());

        Ok(MatchReport {
            records,
            mode_used: mode,
            source_files,
            destination_files: name_index.len(),
            hashes_loaded: fresh.hashes.len(),
            hash_failures,
            skipped_caches: fresh.skipped,
        })
    }

    /// Applies the caller's fallback policy when any covered cache is not fresh.
    fn resolve_mode(&self, request: &MatchRequest<'_>) -> Result<MatchMode, MatchError> {
        if request.mode == MatchMode::Name {
            return Ok(MatchMode::Name);
        }
        let dirs = self
            .cache
            .cached_directories()
            .map_err(|_| MatchError::MissingDirectory(self.cache.output_root().to_path_buf()))?;
        let not_fresh: Vec<PathBuf> = dirs
            .into_iter()
            .filter(|dir| {
                let state = self.cache.state_of(dir);
                if !state.is_fresh() {
                    warn!("Cache for '{}' is {}", dir.display(), state);
                }
                !state.is_fresh()
            })
            .collect();
        if not_fresh.is_empty() {
            return Ok(MatchMode::NameThenHash);
        }
        match request.policy {
            FallbackPolicy::AbortOnStale => {
                error!("Hash cache for '{}' is not fresh; aborting", request.label);
                Err(MatchError::StaleCache {
                    label: request.label.to_string(),
                    directories: not_fresh,
                })
            }
            FallbackPolicy::DowngradeToNameOnly => {
                warn!(
                    "Hash cache for '{}' is not fresh; matching by name and size only",
                    request.label
                );
                Ok(MatchMode::Name)
            }
        }
    }
}

/// Overwrites `path` with one `name,size,path` line per record.
pub fn write_missing_list(path: &Path, records: &[MissingRecord]) -> Result<(), MatchError> {
    let mut content = String::new();
    for record in records {
        content.push_str(&record.to_line());
        content.push('\n');
    }
    write_atomic(path, content.as_bytes()).map_err(|source| MatchError::Report {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a missing list back; malformed lines are skipped.
pub fn load_missing_list(path: &Path) -> Result<Vec<MissingRecord>, MatchError> {
    let content = fs::read_to_string(path).map_err(|source| MatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let record = MissingRecord::parse_line(line);
            if record.is_none() {
                debug!("Skipping malformed line in '{}': {}", path.display(), line);
            }
            record
        })
        .collect())
}

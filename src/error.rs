//! Error types returned across the library boundary.
//!
//! Per-file failures are values the callers log and step over; only
//! [`MatchError`] carries conditions that end an operation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A file could not be streamed through the digest.
#[derive(Debug, Error)]
#[error("failed to hash '{}': {source}", .path.display())]
pub struct HashError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl HashError {
    pub fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// Conditions that terminate a missing-file search.
#[derive(Debug, Error)]
pub enum MatchError {
    /// A source or destination tree was absent when the search started.
    #[error("missing directory: '{}'", .0.display())]
    MissingDirectory(PathBuf),

    /// Hash matching was requested, a cache was not fresh, and the caller
    /// chose to abort rather than downgrade.
    #[error("hash cache for '{label}' is not fresh ({} affected); rebuild the cache or downgrade to name matching",
        directory_count(.directories))]
    StaleCache {
        label: String,
        directories: Vec<PathBuf>,
    },

    /// The interrupt flag was raised before every source file was checked.
    #[error("interrupted before the search finished; missing list left untouched")]
    Interrupted,

    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The missing list could not be persisted.
    #[error("failed to write report '{}': {source}", .path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn directory_count(dirs: &[PathBuf]) -> String {
    match dirs.len() {
        1 => "1 directory".to_string(),
        n => format!("{} directories", n),
    }
}

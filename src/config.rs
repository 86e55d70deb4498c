use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::cache::{DEFAULT_CACHE_DEPTH, DEFAULT_TOLERANCE_SECS};
use crate::scanner::HashAlgorithm;
use crate::utils::ExtensionSet;

pub const DEFAULT_CONFIG_FILE: &str = "media-index.toml";

/// Runtime settings, loaded once and passed down explicitly.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "default_tolerance")]
    pub freshness_tolerance_secs: f64,
    #[serde(default = "default_cache_depth")]
    pub cache_depth: usize,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    #[serde(rename = "category", default)]
    pub categories: Vec<MediaCategory>,
}

/// One media family (photos, videos, ...) and the trees it spans.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaCategory {
    pub label: String,
    pub destination: PathBuf,
    pub extensions: Vec<String>,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    pub missing_list: PathBuf,
    pub duplicate_report: Option<PathBuf>,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE_SECS
}

fn default_cache_depth() -> usize {
    DEFAULT_CACHE_DEPTH
}

impl MediaCategory {
    pub fn extension_set(&self) -> ExtensionSet {
        ExtensionSet::new(&self.extensions)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: '{}'", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config: '{}'", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            bail!("no [[category]] sections defined");
        }
        if !self.freshness_tolerance_secs.is_finite() || self.freshness_tolerance_secs < 0.0 {
            bail!(
                "freshness_tolerance_secs must be a non-negative number, got {}",
                self.freshness_tolerance_secs
            );
        }
        let mut seen = HashSet::new();
        for category in &self.categories {
            if category.label.trim().is_empty() {
                bail!("category label must not be empty");
            }
            if !seen.insert(category.label.as_str()) {
                bail!("duplicate category label '{}'", category.label);
            }
            if category.extension_set().is_empty() {
                bail!("category '{}' has no extensions", category.label);
            }
        }
        Ok(())
    }

    pub fn category(&self, label: &str) -> Option<&MediaCategory> {
        self.categories.iter().find(|c| c.label == label)
    }

    /// Categories to process: the named one, or all of them.
    pub fn select(&self, label: Option<&str>) -> Result<Vec<&MediaCategory>> {
        match label {
            Some(label) => match self.category(label) {
                Some(category) => Ok(vec![category]),
                None => {
                    let known: Vec<&str> = self.categories.iter().map(|c| c.label.as_str()).collect();
                    bail!("unknown category '{}' (configured: {})", label, known.join(", "))
                }
            },
            None => Ok(self.categories.iter().collect()),
        }
    }

    pub fn cache_root_for(&self, category: &MediaCategory) -> PathBuf {
        self.cache_dir.join(&category.label)
    }

    pub fn duplicate_report_for(&self, category: &MediaCategory) -> PathBuf {
        category.duplicate_report.clone().unwrap_or_else(|| {
            self.logs_dir
                .join(format!("duplicates_removed_{}.txt", category.label))
        })
    }
}
